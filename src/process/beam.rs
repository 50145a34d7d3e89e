use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::detmap::{ChannelConfig, DetectorMap};
use crate::event::{Event, EntryValue};
use crate::model::{BeamInfo, Frame, Sample};

/// Linear beam reconstruction for one stream UID.
///
/// Built once from the detector map's first image configuration:
/// `mean_pos = [x_pos; y_pos] · Tᵀ`, immutable afterwards. Without a
/// usable image configuration the processor is a no-op.
pub struct BeamReconstruction {
    channels: HashMap<u32, ChannelConfig>,
    mean_pos: Option<DMatrix<f64>>,
}

impl BeamReconstruction {
    pub fn new(uid: u64, detmap: &DetectorMap) -> Self {
        let channels = detmap
            .hps_config(uid)
            .map(|c| c.channels.clone())
            .unwrap_or_default();

        let mut mean_pos = None;
        if let Some(image_config) = detmap.image_configs(uid).first() {
            if !image_config.lin_est_t.is_empty() {
                let rows = image_config.lin_est_t.len();
                let cols = image_config.lin_est_t[0].len();
                if image_config.x_pos.len() == cols && image_config.y_pos.len() == cols {
                    let lin_est_t = DMatrix::from_fn(rows, cols, |i, j| {
                        image_config.lin_est_t[i].get(j).copied().unwrap_or(0.0) as f64
                    });
                    let pos = DMatrix::from_fn(2, cols, |i, j| {
                        if i == 0 {
                            image_config.x_pos[j] as f64
                        } else {
                            image_config.y_pos[j] as f64
                        }
                    });
                    mean_pos = Some(pos * lin_est_t.transpose());
                } else {
                    log::warn!(
                        "image config for uid {uid:#x} has mismatched estimator dimensions"
                    );
                }
            }
        }

        BeamReconstruction { channels, mean_pos }
    }

    /// Reduce every "Mapped" frame to per-sample beam info under "Reduced".
    pub fn process(&self, event: &mut Event) {
        let Some(mean_pos) = &self.mean_pos else {
            return;
        };
        let n_estimators = mean_pos.ncols();

        for entry_id in event.tagged_entries("Mapped") {
            let reduced = {
                let Some(frame) = event.entry(entry_id).and_then(EntryValue::as_frame) else {
                    continue;
                };
                self.reduce_frame(frame, mean_pos, n_estimators)
            };
            let Some(reduced) = reduced else {
                continue;
            };
            event.add_entry("Reduced", EntryValue::Frame(reduced));
        }
    }

    fn reduce_frame(
        &self,
        frame: &Frame,
        mean_pos: &DMatrix<f64>,
        n_estimators: usize,
    ) -> Option<Frame> {
        let mut reduced = Frame {
            timestamp: frame.timestamp,
            ..Frame::default()
        };

        for sample in &frame.samples {
            let mut charge = DVector::zeros(n_estimators);
            for i in 0..n_estimators {
                let Some(chan_config) = self.channels.get(&(i as u32)) else {
                    continue;
                };
                match sample
                    .axes
                    .get(chan_config.axis as usize)
                    .and_then(|axis| axis.float_channels.get(chan_config.axis_channel as usize))
                {
                    Some(&val) => charge[i] = val as f64,
                    None => {
                        log::warn!("mapped sample is missing estimator channel {i}, skipping frame");
                        return None;
                    }
                }
            }

            let mut beam_info = BeamInfo::default();
            let total = charge.sum();
            if total != 0.0 {
                charge /= total;
                let pos = mean_pos * &charge;
                beam_info.mean_x_pos = pos[0] as f32;
                beam_info.mean_y_pos = pos[1] as f32;
                beam_info.total_current = total as f32;
            }

            reduced.samples.push(Sample {
                timestamp: sample.timestamp,
                beam_info: Some(beam_info),
                ..Sample::default()
            });
        }

        Some(reduced)
    }
}

#[cfg(test)]
mod test {
    use crate::model::AxisSample;

    use super::*;

    fn mapped_event(channel_values: &[f32]) -> Event {
        let sample = Sample {
            axes: vec![AxisSample {
                float_channels: channel_values.to_vec(),
                sum: channel_values.iter().sum(),
            }],
            ..Sample::default()
        };
        let mut event = Event::new();
        event.add_entry(
            "Mapped",
            EntryValue::Frame(Frame {
                samples: vec![sample],
                ..Frame::default()
            }),
        );
        event
    }

    fn two_channel_map() -> DetectorMap {
        serde_json::from_str(
            r#"{
                "hps_configs": {
                    "1": {
                        "channels": {
                            "0": { "axis": 0, "axis_channel": 0 },
                            "1": { "axis": 0, "axis_channel": 1 }
                        },
                        "current_conv": 1.0,
                        "det_config": 1
                    }
                },
                "det_configs": {
                    "1": {
                        "name": "pair",
                        "image_configs": [
                            {
                                "lin_est_t": [[1.0, 0.0], [0.0, 1.0]],
                                "x_pos": [-1.0, 1.0],
                                "y_pos": [0.0, 0.0]
                            }
                        ]
                    }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn centroid_of_balanced_charge_is_zero() {
        let recon = BeamReconstruction::new(0x0000_0001_0000_0000, &two_channel_map());
        let mut event = mapped_event(&[1.0, 1.0]);
        recon.process(&mut event);

        let ids = event.tagged_entries("Reduced");
        assert_eq!(ids.len(), 1);
        let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
        let beam = frame.samples[0].beam_info.as_ref().unwrap();
        assert!((beam.mean_x_pos - 0.0).abs() < 1e-6);
        assert_eq!(beam.total_current, 2.0);
    }

    #[test]
    fn skewed_charge_moves_the_centroid() {
        let recon = BeamReconstruction::new(0x0000_0001_0000_0000, &two_channel_map());
        let mut event = mapped_event(&[0.0, 2.0]);
        recon.process(&mut event);

        let ids = event.tagged_entries("Reduced");
        let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
        let beam = frame.samples[0].beam_info.as_ref().unwrap();
        assert!((beam.mean_x_pos - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_charge_leaves_beam_info_empty() {
        let recon = BeamReconstruction::new(0x0000_0001_0000_0000, &two_channel_map());
        let mut event = mapped_event(&[0.0, 0.0]);
        recon.process(&mut event);

        let ids = event.tagged_entries("Reduced");
        let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
        let beam = frame.samples[0].beam_info.as_ref().unwrap();
        assert_eq!(beam.total_current, 0.0);
        assert_eq!(beam.mean_x_pos, 0.0);
        assert_eq!(beam.mean_y_pos, 0.0);
    }

    #[test]
    fn missing_image_config_is_a_no_op() {
        let recon = BeamReconstruction::new(0x7, &DetectorMap::default());
        let mut event = mapped_event(&[1.0]);
        recon.process(&mut event);
        assert!(event.tagged_entries("Reduced").is_empty());
    }
}
