//! The adapter mapping current-mode event payloads onto stream sources.

use crate::event::{Event, EntryValue};
use crate::model::timestamp_seconds;

use super::shows::SourceSample;
use super::stream::{SourceKind, StreamManager};

/// Generate source samples for every mapped and reduced frame in an event:
/// per-axis currents and channel projections, total current, correlation,
/// and reconstructed beam positions.
pub fn generate_current_mode_sources(manager: &mut StreamManager, event: &Event) {
    for frame_id in event.tagged_entries("Mapped") {
        let Some(frame) = event.entry(frame_id).and_then(EntryValue::as_frame) else {
            continue;
        };

        let t_frame = timestamp_seconds(frame.timestamp);
        manager.handle_source(
            "Correlation",
            SourceKind::Normal,
            SourceSample::RollXy(t_frame, frame.correlation),
        );

        for sample in &frame.samples {
            let t_sample = t_frame + timestamp_seconds(sample.timestamp);

            let mut total_current = 0f32;
            for (axis, axis_sample) in sample.axes.iter().enumerate() {
                total_current += axis_sample.sum;

                manager.handle_source(
                    &format!("Axis {axis} Current"),
                    SourceKind::Normal,
                    SourceSample::RollXy(t_sample, axis_sample.sum),
                );
                manager.handle_source(
                    &format!("Axis {axis} Channels"),
                    SourceKind::Normal,
                    SourceSample::Projection(axis_sample.float_channels.clone()),
                );
                for (chan, &chan_val) in axis_sample.float_channels.iter().enumerate() {
                    manager.handle_source(
                        &format!("Axis {axis} Chan {chan:03} Current"),
                        SourceKind::Advanced,
                        SourceSample::RollXy(t_sample, chan_val),
                    );
                }
            }

            manager.handle_source(
                "Total Current",
                SourceKind::Normal,
                SourceSample::RollXy(t_sample, total_current),
            );
        }
    }

    for frame_id in event.tagged_entries("Reduced") {
        let Some(frame) = event.entry(frame_id).and_then(EntryValue::as_frame) else {
            continue;
        };

        let t_frame = timestamp_seconds(frame.timestamp);
        for sample in &frame.samples {
            let Some(beam) = &sample.beam_info else {
                continue;
            };
            let t_sample = t_frame + timestamp_seconds(sample.timestamp);

            manager.handle_source(
                "Mean X",
                SourceKind::Normal,
                SourceSample::RollXy(t_sample, beam.mean_x_pos),
            );
            manager.handle_source(
                "Mean Y",
                SourceKind::Normal,
                SourceSample::RollXy(t_sample, beam.mean_y_pos),
            );
            manager.handle_source(
                "Mean XY",
                SourceKind::Normal,
                SourceSample::Xy(beam.mean_x_pos, beam.mean_y_pos),
            );
            manager.handle_source(
                "Mean and Total Current",
                SourceKind::Normal,
                SourceSample::Hist2d(beam.mean_x_pos, beam.mean_y_pos, beam.total_current),
            );
        }
    }
}
