use std::io::Write as _;

use byteorder::{LittleEndian, WriteBytesExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::event::Event;

use super::{Compression, RecordKind, MAGIC};

/// Streaming event writer. Events accumulate in an in-memory bucket that is
/// compressed and written out once it exceeds `bucket_dump_thres` bytes (or
/// on metadata pushes and close).
pub struct Writer<W> {
    out: W,
    compression: Compression,
    /// Bucket flush threshold in bytes. Lower values trade compression
    /// ratio for latency; 1 flushes after every event.
    pub bucket_dump_thres: usize,
    bucket: Vec<u8>,
    bucket_events: u32,
}

impl<W: AsyncWrite + Unpin + Send> Writer<W> {
    pub fn new(out: W) -> Self {
        Writer {
            out,
            compression: Compression::default(),
            bucket_dump_thres: 0x10000,
            bucket: Vec::new(),
            bucket_events: 0,
        }
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    /// Append an event to the current bucket, flushing if the bucket is
    /// over the dump threshold.
    pub async fn push(&mut self, event: &Event) -> Result<()> {
        let body = bincode::serialize(event)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut self.bucket, body.len() as u32)?;
        self.bucket.extend_from_slice(&body);
        self.bucket_events += 1;
        if self.bucket.len() >= self.bucket_dump_thres {
            self.flush_bucket().await?;
        }
        Ok(())
    }

    /// Write a stream metadata record. Metadata applies to every event that
    /// follows it, so the current bucket is flushed first.
    pub async fn push_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.flush_bucket().await?;

        let mut payload = Vec::with_capacity(8 + key.len() + value.len());
        WriteBytesExt::write_u32::<LittleEndian>(&mut payload, key.len() as u32)?;
        payload.extend_from_slice(key.as_bytes());
        WriteBytesExt::write_u32::<LittleEndian>(&mut payload, value.len() as u32)?;
        payload.extend_from_slice(value);

        self.write_record(RecordKind::Metadata, Compression::Uncompressed, 0, &payload, &payload)
            .await
    }

    async fn flush_bucket(&mut self) -> Result<()> {
        if self.bucket.is_empty() {
            return Ok(());
        }
        let uncompressed = std::mem::take(&mut self.bucket);
        let n_events = self.bucket_events;
        self.bucket_events = 0;

        let stored = match self.compression {
            Compression::Uncompressed => uncompressed.clone(),
            Compression::Lz4 => {
                let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
                enc.write_all(&uncompressed)?;
                enc.finish().map_err(std::io::Error::other)?
            }
            Compression::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
                enc.write_all(&uncompressed)?;
                enc.finish()?
            }
        };

        self.write_record(RecordKind::Data, self.compression, n_events, &uncompressed, &stored)
            .await
    }

    async fn write_record(
        &mut self,
        kind: RecordKind,
        compression: Compression,
        n_events: u32,
        uncompressed: &[u8],
        stored: &[u8],
    ) -> Result<()> {
        let mut header = Vec::with_capacity(super::HEADER_LEN);
        header.extend_from_slice(&MAGIC);
        header.push(kind.tag());
        header.push(compression.tag());
        WriteBytesExt::write_u16::<LittleEndian>(&mut header, 0)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, n_events)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, uncompressed.len() as u32)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, stored.len() as u32)?;

        self.out.write_all(&header).await?;
        self.out.write_all(stored).await?;
        Ok(())
    }

    /// Flush the open bucket and shut the underlying sink down, returning
    /// it (multipart storage uploads complete on shutdown).
    pub async fn close(mut self) -> Result<W> {
        self.flush_bucket().await?;
        self.out.flush().await?;
        self.out.shutdown().await?;
        Ok(self.out)
    }
}
