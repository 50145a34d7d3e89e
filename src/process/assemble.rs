use crate::event::{Event, EntryValue};
use crate::model::{Frame, Sample, SAMPLE_TICK};

/// Assemble loose "Sample" entries into a "Frame" entry.
///
/// The first tagged sample fixes the frame timestamp; subsequent samples
/// store their offset from it. Each assembled sample carries a single-head
/// hps map keyed by the event UID. Events without a usable UID are left
/// untouched.
pub fn assemble_frame(event: &mut Event) {
    let Some(uid) = event.metadata_uid() else {
        return;
    };

    let mut frame = Frame::default();
    for (i, sample_id) in event.tagged_entries("Sample").into_iter().enumerate() {
        let Some(hps) = event.entry(sample_id).and_then(EntryValue::as_hps).cloned() else {
            continue;
        };

        let sample_ts = hps.sample_number as u64 * SAMPLE_TICK;
        if i == 0 {
            frame.timestamp = sample_ts;
        }

        let mut sample = Sample {
            timestamp: sample_ts.wrapping_sub(frame.timestamp),
            ..Sample::default()
        };
        sample.hps.insert(uid, hps);
        frame.samples.push(sample);
    }

    if !frame.samples.is_empty() {
        event.add_entry("Frame", EntryValue::Frame(frame));
    }
}

#[cfg(test)]
mod test {
    use crate::model::HpsSample;

    use super::*;

    fn hps(sample_number: u32) -> EntryValue {
        EntryValue::Hps(HpsSample {
            sample_number,
            channels: vec![1, 2],
            ..HpsSample::default()
        })
    }

    #[test]
    fn assembles_samples_into_one_frame() {
        let mut event = Event::new();
        event
            .metadata
            .insert("UID".into(), vec![0, 0, 0, 1, 0, 0, 0, 1]);
        event.add_entry("Sample", hps(0));
        event.add_entry("Sample", hps(5));

        assemble_frame(&mut event);

        let frame_ids = event.tagged_entries("Frame");
        assert_eq!(frame_ids.len(), 1);
        let frame = event.entry(frame_ids[0]).unwrap().as_frame().unwrap();
        assert_eq!(frame.timestamp, 0);
        assert_eq!(frame.samples.len(), 2);
        assert_eq!(frame.samples[0].timestamp, 0);
        assert_eq!(frame.samples[1].timestamp, 5 * SAMPLE_TICK);
        for sample in &frame.samples {
            assert!(sample.hps.contains_key(&0x0000_0001_0000_0001));
        }
    }

    #[test]
    fn short_uid_is_a_no_op() {
        let mut event = Event::new();
        event.metadata.insert("UID".into(), vec![1, 2, 3]);
        event.add_entry("Sample", hps(0));

        assemble_frame(&mut event);
        assert!(event.tagged_entries("Frame").is_empty());
    }

    #[test]
    fn no_samples_means_no_frame() {
        let mut event = Event::new();
        event
            .metadata
            .insert("UID".into(), vec![0, 0, 0, 1, 0, 0, 0, 1]);
        assemble_frame(&mut event);
        assert!(event.tagged_entries("Frame").is_empty());
    }
}
