use std::sync::Arc;

use crate::detmap::{self, DetectorMap, HpsCalibration, HpsConfig};
use crate::event::{Event, EntryValue};
use crate::model::{AxisSample, Frame, Sample};

/// Detector-map application: turns raw per-head channel integers into
/// per-axis float currents.
pub struct Mapper {
    detmap: Arc<DetectorMap>,
}

impl Mapper {
    pub fn new(detmap: Arc<DetectorMap>) -> Self {
        Mapper { detmap }
    }

    /// Map every "Frame" entry into a "Mapped" frame. Stale "Mapped"
    /// entries are removed first, so re-mapping is idempotent.
    pub fn process(&self, event: &mut Event) {
        for entry_id in event.tagged_entries("Mapped") {
            event.remove_entry(entry_id);
        }

        for entry_id in event.tagged_entries("Frame") {
            let mapped = {
                let Some(frame) = event.entry(entry_id).and_then(EntryValue::as_frame) else {
                    continue;
                };
                self.map_frame(frame)
            };
            event.add_entry("Mapped", EntryValue::Frame(mapped));
        }
    }

    fn map_frame(&self, frame: &Frame) -> Frame {
        let mut mapped = Frame {
            timestamp: frame.timestamp,
            ..Frame::default()
        };

        for sample in &frame.samples {
            let mut mapped_sample = Sample {
                timestamp: sample.timestamp,
                ..Sample::default()
            };

            for (&uid, hps) in &sample.hps {
                let Some(config) = self.detmap.hps_config_exact(detmap::config_id(uid)) else {
                    continue;
                };
                let calib = self.detmap.hps_calibrations.get(&detmap::calib_id(uid));

                for (i, &val) in hps.channels.iter().enumerate() {
                    map_channel(config, calib, frame, &mut mapped_sample, i, val as f32);
                }
                if hps.channels.is_empty() {
                    for (i, &val) in hps.fixed_channels.iter().enumerate() {
                        map_channel(config, calib, frame, &mut mapped_sample, i, val as f32);
                    }
                }
            }

            mapped.samples.push(mapped_sample);
        }

        mapped
    }
}

fn map_channel(
    config: &HpsConfig,
    calib: Option<&HpsCalibration>,
    raw_frame: &Frame,
    mapped_sample: &mut Sample,
    hps_chan: usize,
    val: f32,
) {
    let current_conv = calib
        .and_then(|c| c.current_conv.get(hps_chan))
        .copied()
        .unwrap_or(config.current_conv);

    let Some(chan_config) = config.channels.get(&(hps_chan as u32)) else {
        return;
    };
    let axis_num = chan_config.axis as usize;
    let axis_chan = chan_config.axis_channel as usize;

    while axis_num >= mapped_sample.axes.len() {
        mapped_sample.axes.push(AxisSample::default());
    }
    let axis = &mut mapped_sample.axes[axis_num];
    if axis_chan >= axis.float_channels.len() {
        axis.float_channels.resize(axis_chan + 1, 0.0);
    }
    axis.float_channels[axis_chan] = val * current_conv;

    if let Some(offsets) = &raw_frame.axis_offsets {
        if let Some(axis_offsets) = offsets.get(axis_num) {
            if let Some(&offset) = axis_offsets.float_channels.get(axis_chan) {
                axis.float_channels[axis_chan] -= offset;
            }
        }
    }

    axis.sum += axis.float_channels[axis_chan];
}
