//! Bucket-framed event stream format.
//!
//! A stream is a sequence of records. Each record starts with a fixed
//! header (magic, record kind, compression tag, event count, payload
//! lengths); data records carry length-prefixed bincode-encoded events,
//! compressed per bucket, while metadata records carry a single key/value
//! pair that applies to the stream from that point on.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"bmy1";

/// Record header size on the wire: magic + kind + compression + reserved +
/// event count + uncompressed length + stored length.
pub const HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4 + 4 + 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    #[default]
    Lz4,
    Gzip,
}

impl Compression {
    pub fn tag(self) -> u8 {
        match self {
            Compression::Uncompressed => 0,
            Compression::Lz4 => 1,
            Compression::Gzip => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::Uncompressed),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Gzip),
            other => Err(Error::UnknownCompression(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Data,
    Metadata,
}

impl RecordKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            RecordKind::Data => 0,
            RecordKind::Metadata => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(RecordKind::Data),
            1 => Ok(RecordKind::Metadata),
            other => Err(Error::UnknownRecordKind(other)),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RecordHeader {
    pub kind: RecordKind,
    pub compression: Compression,
    pub n_events: u32,
    pub uncompressed_len: u32,
    pub stored_len: u32,
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use crate::event::{Event, EntryValue};
    use crate::model::{Frame, Sample};

    use super::*;

    fn sample_event(ts: u64) -> Event {
        let mut event = Event::new();
        event.metadata.insert("Run".into(), b"test".to_vec());
        let frame = Frame {
            timestamp: ts,
            samples: vec![Sample::default()],
            ..Frame::default()
        };
        event.add_entry("Frame", EntryValue::Frame(frame));
        event
    }

    async fn roundtrip(compression: Compression) {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.set_compression(compression);
        writer
            .push_metadata("UID", &[0, 0, 0, 1, 0, 0, 0, 1])
            .await
            .unwrap();
        for i in 0..10u64 {
            writer.push(&sample_event(i)).await.unwrap();
        }
        let bytes = writer.close().await.unwrap().into_inner();

        let mut reader = Reader::new(Cursor::new(bytes));
        reader.skip(0).await.unwrap();
        assert_eq!(
            reader.metadata.get("UID").map(Vec::as_slice),
            Some(&[0u8, 0, 0, 1, 0, 0, 0, 1][..])
        );
        for i in 0..10u64 {
            let event = reader.next_event().await.unwrap().unwrap();
            let ids = event.tagged_entries("Frame");
            let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
            assert_eq!(frame.timestamp, i);
        }
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roundtrip_uncompressed() {
        roundtrip(Compression::Uncompressed).await;
    }

    #[tokio::test]
    async fn roundtrip_lz4() {
        roundtrip(Compression::Lz4).await;
    }

    #[tokio::test]
    async fn roundtrip_gzip() {
        roundtrip(Compression::Gzip).await;
    }

    #[tokio::test]
    async fn seek_to_start_rewinds() {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.push(&sample_event(7)).await.unwrap();
        let bytes = writer.close().await.unwrap().into_inner();

        let mut reader = Reader::new(Cursor::new(bytes));
        assert!(reader.next_event().await.unwrap().is_some());
        assert!(reader.next_event().await.unwrap().is_none());
        reader.seek_to_start().await.unwrap();
        assert!(reader.next_event().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn small_dump_threshold_flushes_per_event() {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.bucket_dump_thres = 1;
        writer.push(&sample_event(1)).await.unwrap();
        writer.push(&sample_event(2)).await.unwrap();
        let bytes = writer.close().await.unwrap().into_inner();
        // Two data records: two magics.
        let magics = bytes.windows(4).filter(|w| *w == MAGIC).count();
        assert_eq!(magics, 2);
    }
}
