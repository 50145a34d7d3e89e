//! Event and stream processors for the current-mode pipeline.

mod assemble;
mod beam;
mod correlate;
mod map;
mod pedestal;
mod play;

pub use assemble::assemble_frame;
pub use beam::BeamReconstruction;
pub use correlate::{correlate_event, Correlator};
pub use map::Mapper;
pub use pedestal::Pedestals;
pub use play::Player;

use tokio::sync::mpsc;

use crate::event::Event;

/// Pass-through aggregate stage. Multi-head aggregation plugs in here; a
/// single-head stream is forwarded as-is.
pub async fn merge(mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) {
    while let Some(event) = input.recv().await {
        if output.send(event).await.is_err() {
            return;
        }
    }
}

/// Strip everything but raw "Frame" entries before an event is recorded.
pub fn keep_only_raw_frames(event: &mut Event) {
    let raw_frame_ids = event.tagged_entries("Frame");
    for id in event.all_entries() {
        if !raw_frame_ids.contains(&id) {
            event.remove_entry(id);
        }
    }
}

/// Drop unassembled "Sample" entries.
pub fn remove_loose_samples(event: &mut Event) {
    for id in event.tagged_entries("Sample") {
        event.remove_entry(id);
    }
}

#[cfg(test)]
mod test {
    use crate::event::EntryValue;
    use crate::model::{Frame, HpsSample};

    use super::*;

    #[test]
    fn keep_only_raw_frames_preserves_frame_entries() {
        let mut event = Event::new();
        let raw = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        let mapped = event.add_entry("Mapped", EntryValue::Frame(Frame::default()));
        let loose = event.add_entry("Sample", EntryValue::Hps(HpsSample::default()));

        keep_only_raw_frames(&mut event);
        assert!(event.entry(raw).is_some());
        assert!(event.entry(mapped).is_none());
        assert!(event.entry(loose).is_none());
    }

    #[test]
    fn remove_loose_samples_leaves_frames() {
        let mut event = Event::new();
        let frame = event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        event.add_entry("Sample", EntryValue::Hps(HpsSample::default()));

        remove_loose_samples(&mut event);
        assert!(event.tagged_entries("Sample").is_empty());
        assert!(event.entry(frame).is_some());
    }
}
