use std::collections::{HashMap, VecDeque};
use std::io::Read as _;

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::Event;

use super::{Compression, RecordHeader, RecordKind, HEADER_LEN, MAGIC};

/// Streaming event reader over any byte source.
///
/// Stream metadata records are absorbed into `metadata` as they are
/// encountered; `skip(0)` primes the reader up to the first data record so
/// metadata written at the head of a stream is visible before any event is
/// consumed.
pub struct Reader<R> {
    input: R,
    pub metadata: HashMap<String, Vec<u8>>,
    queue: VecDeque<Event>,
}

impl<R: AsyncRead + Unpin + Send> Reader<R> {
    pub fn new(input: R) -> Self {
        Reader {
            input,
            metadata: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Read records until at least one event is queued or the stream ends,
    /// then discard `n` events. `skip(0)` reads the stream head (metadata)
    /// without consuming any event.
    pub async fn skip(&mut self, n: usize) -> Result<usize> {
        self.prime().await?;
        let mut skipped = 0;
        while skipped < n {
            if self.next_event().await?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    /// The next event in the stream, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(Some(event));
            }
            if !self.read_record().await? {
                return Ok(None);
            }
        }
    }

    async fn prime(&mut self) -> Result<()> {
        while self.queue.is_empty() {
            if !self.read_record().await? {
                break;
            }
        }
        Ok(())
    }

    /// Read one record. Returns false at a clean end of stream.
    async fn read_record(&mut self) -> Result<bool> {
        let mut header = [0u8; HEADER_LEN];
        match self.input.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let header = parse_header(&header)?;

        let mut stored = vec![0u8; header.stored_len as usize];
        self.input
            .read_exact(&mut stored)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::TruncatedRecord,
                _ => Error::Io(e),
            })?;

        match header.kind {
            RecordKind::Metadata => {
                let (key, value) = parse_metadata(&stored)?;
                self.metadata.insert(key, value);
            }
            RecordKind::Data => {
                let payload = decompress(header.compression, &stored)?;
                if payload.len() != header.uncompressed_len as usize {
                    return Err(Error::TruncatedRecord);
                }
                self.decode_bucket(&payload, header.n_events)?;
            }
        }
        Ok(true)
    }

    fn decode_bucket(&mut self, payload: &[u8], n_events: u32) -> Result<()> {
        let mut offset = 0usize;
        let mut decoded = 0u32;
        while offset + 4 <= payload.len() {
            let len = LittleEndian::read_u32(&payload[offset..offset + 4]) as usize;
            offset += 4;
            if offset + len > payload.len() {
                return Err(Error::TruncatedRecord);
            }
            let event: Event = bincode::deserialize(&payload[offset..offset + len])?;
            offset += len;
            decoded += 1;
            self.queue.push_back(event);
        }
        if decoded != n_events || offset != payload.len() {
            return Err(Error::TruncatedRecord);
        }
        Ok(())
    }

    /// Consume the reader and scan all remaining events onto a bounded
    /// channel. Dropping the receiver stops the scan task and releases the
    /// underlying source, which is how shared readers get closed from
    /// another task.
    pub fn scan_events(mut self, buf_size: usize) -> mpsc::Receiver<Event>
    where
        R: 'static,
    {
        let (tx, rx) = mpsc::channel(buf_size.max(1));
        tokio::spawn(async move {
            loop {
                match self.next_event().await {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("event scan stopped: {e}");
                        break;
                    }
                }
            }
        });
        rx
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin + Send> Reader<R> {
    /// Rewind a seekable source to the beginning of the stream, dropping
    /// any buffered events and accumulated metadata.
    pub async fn seek_to_start(&mut self) -> Result<()> {
        self.input.seek(std::io::SeekFrom::Start(0)).await?;
        self.queue.clear();
        self.metadata.clear();
        Ok(())
    }
}

fn parse_header(buf: &[u8]) -> Result<RecordHeader> {
    if buf[..4] != MAGIC {
        return Err(Error::BadMagic);
    }
    Ok(RecordHeader {
        kind: RecordKind::from_tag(buf[4])?,
        compression: Compression::from_tag(buf[5])?,
        n_events: LittleEndian::read_u32(&buf[8..12]),
        uncompressed_len: LittleEndian::read_u32(&buf[12..16]),
        stored_len: LittleEndian::read_u32(&buf[16..20]),
    })
}

fn parse_metadata(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    if payload.len() < 4 {
        return Err(Error::TruncatedRecord);
    }
    let key_len = LittleEndian::read_u32(&payload[..4]) as usize;
    if payload.len() < 8 + key_len {
        return Err(Error::TruncatedRecord);
    }
    let key = String::from_utf8_lossy(&payload[4..4 + key_len]).into_owned();
    let value_len = LittleEndian::read_u32(&payload[4 + key_len..8 + key_len]) as usize;
    if payload.len() < 8 + key_len + value_len {
        return Err(Error::TruncatedRecord);
    }
    let value = payload[8 + key_len..8 + key_len + value_len].to_vec();
    Ok((key, value))
}

fn decompress(compression: Compression, stored: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::Uncompressed => Ok(stored.to_vec()),
        Compression::Lz4 => {
            let mut out = Vec::new();
            lz4_flex::frame::FrameDecoder::new(stored).read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(stored).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}
