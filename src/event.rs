use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::model::{Frame, HpsSample, Sample};

pub type EntryId = u64;

/// A typed entry payload. The serde derive doubles as the wire-format
/// registry: the variant tag identifies the payload type in serialized
/// streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryValue {
    Hps(HpsSample),
    Sample(Sample),
    Frame(Frame),
}

impl EntryValue {
    pub fn as_hps(&self) -> Option<&HpsSample> {
        match self {
            EntryValue::Hps(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            EntryValue::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_frame_mut(&mut self) -> Option<&mut Frame> {
        match self {
            EntryValue::Frame(f) => Some(f),
            _ => None,
        }
    }
}

/// The unit flowing through the pipeline: a metadata map, a table of typed
/// entries addressed by per-event unique ids, and a tag index.
///
/// Entry ids are allocated sequentially and never reused within an event.
/// The tag index keeps insertion order and does not deduplicate; every id
/// appearing under a tag refers to a live entry in the table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Event {
    pub metadata: HashMap<String, Vec<u8>>,
    entries: IndexMap<EntryId, EntryValue>,
    tags: IndexMap<String, Vec<EntryId>>,
    next_id: EntryId,
    /// Side-band error slot: a processor may set this and the next stage may
    /// inspect and clear it. Events themselves are never failed.
    pub err: Option<String>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under a fresh id and reference it from `tag`.
    pub fn add_entry(&mut self, tag: &str, value: EntryValue) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, value);
        self.tags.entry(tag.to_string()).or_default().push(id);
        id
    }

    /// Add another tag reference to an existing entry.
    pub fn tag_entry(&mut self, tag: &str, id: EntryId) {
        if self.entries.contains_key(&id) {
            self.tags.entry(tag.to_string()).or_default().push(id);
        }
    }

    pub fn entry(&self, id: EntryId) -> Option<&EntryValue> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut EntryValue> {
        self.entries.get_mut(&id)
    }

    /// Ids referenced by `tag`, in insertion order.
    pub fn tagged_entries(&self, tag: &str) -> Vec<EntryId> {
        self.tags.get(tag).cloned().unwrap_or_default()
    }

    /// All live entry ids, in insertion order.
    pub fn all_entries(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    /// Remove an entry and every tag reference to it.
    pub fn remove_entry(&mut self, id: EntryId) -> Option<EntryValue> {
        let value = self.entries.shift_remove(&id);
        if value.is_some() {
            for ids in self.tags.values_mut() {
                ids.retain(|&tagged| tagged != id);
            }
        }
        value
    }

    /// The stream UID from metadata, if present and at least 8 bytes
    /// (big-endian u64).
    pub fn metadata_uid(&self) -> Option<u64> {
        let bytes = self.metadata.get("UID")?;
        if bytes.len() < 8 {
            return None;
        }
        Some(BigEndian::read_u64(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tags_track_removal() {
        let mut event = Event::new();
        let a = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        let b = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        event.tag_entry("Mapped", a);
        assert_eq!(event.tagged_entries("Frame"), vec![a, b]);
        assert_eq!(event.tagged_entries("Mapped"), vec![a]);

        event.remove_entry(a);
        assert_eq!(event.tagged_entries("Frame"), vec![b]);
        assert!(event.tagged_entries("Mapped").is_empty());
        assert!(event.entry(a).is_none());
    }

    #[test]
    fn entry_ids_are_not_reused() {
        let mut event = Event::new();
        let a = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        event.remove_entry(a);
        let b = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        assert_ne!(a, b);
    }

    #[test]
    fn metadata_uid_needs_eight_bytes() {
        let mut event = Event::new();
        assert_eq!(event.metadata_uid(), None);
        event.metadata.insert("UID".into(), vec![0, 0, 0, 1]);
        assert_eq!(event.metadata_uid(), None);
        event
            .metadata
            .insert("UID".into(), vec![0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(event.metadata_uid(), Some(0x0000_0001_0000_0001));
    }
}
