use tokio::sync::mpsc;

use crate::event::{Event, EntryValue};
use crate::model::AxisSample;

/// Adaptive pedestal subtraction.
///
/// Keeps an exponentially-weighted running mean per (axis, channel) across
/// the lifetime of the stream. The mean is only updated while the frame's
/// correlation is below `cov_frac^(A(A-1))`, which keeps real beam signal
/// from dragging the pedestals; the threshold is tiny for A >= 3, so the
/// correlator's frame-count window is what bootstraps pedestals there.
#[derive(Default)]
pub struct Pedestals {
    pub alpha: f64,
    pub cov_frac: f64,
    values: Vec<Vec<f64>>,
}

impl Pedestals {
    pub async fn subtract(mut self, mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) {
        if self.alpha == 0.0 {
            self.alpha = 0.0001;
        }
        let inv_alpha = 1.0 - self.alpha;

        if self.cov_frac == 0.0 {
            self.cov_frac = 0.1;
        }
        let cov_frac2 = self.cov_frac * self.cov_frac;

        while let Some(mut event) = input.recv().await {
            let raw_frame_ids = event.tagged_entries("Frame");
            let mapped_frame_ids = event.tagged_entries("Mapped");
            if mapped_frame_ids.len() != raw_frame_ids.len() {
                continue;
            }

            for (i, &mapped_id) in mapped_frame_ids.iter().enumerate() {
                let raw_id = raw_frame_ids[i];

                // Offsets already present means a detector mapping upstream
                // took care of pedestals for this frame.
                let raw_has_offsets = event
                    .entry(raw_id)
                    .and_then(EntryValue::as_frame)
                    .map(|f| f.axis_offsets.is_some())
                    .unwrap_or(true);
                if raw_has_offsets {
                    continue;
                }

                let mut snapshot: Option<Vec<AxisSample>> = None;
                {
                    let Some(frame) = event.entry_mut(mapped_id).and_then(EntryValue::as_frame_mut)
                    else {
                        continue;
                    };
                    if frame.samples.is_empty() {
                        continue;
                    }

                    let n_axes = frame.samples[0].axes.len();
                    let thres = cov_frac2.powi((n_axes * n_axes.saturating_sub(1) / 2) as i32) as f32;
                    let update = frame.correlation < thres;

                    for (sample_num, sample) in frame.samples.iter_mut().enumerate() {
                        for (axis_num, axis) in sample.axes.iter_mut().enumerate() {
                            axis.sum = 0.0;

                            if self.values.len() <= axis_num {
                                self.values.push(Vec::new());
                            }
                            let values = &mut self.values[axis_num];

                            for (chan, val) in axis.float_channels.iter_mut().enumerate() {
                                if values.len() <= chan {
                                    values.push(0.0);
                                }
                                if update {
                                    values[chan] =
                                        inv_alpha * values[chan] + self.alpha * *val as f64;
                                }
                                *val -= values[chan] as f32;
                                axis.sum += *val;
                            }
                        }

                        if sample_num == 0 {
                            snapshot = Some(
                                sample
                                    .axes
                                    .iter()
                                    .enumerate()
                                    .map(|(axis_num, axis)| AxisSample {
                                        float_channels: (0..axis.float_channels.len())
                                            .map(|chan| self.values[axis_num][chan] as f32)
                                            .collect(),
                                        sum: 0.0,
                                    })
                                    .collect(),
                            );
                        }
                    }
                }

                // Publish the state so downstream re-mapping sees offsets
                // consistent with what was subtracted here.
                if let Some(offsets) = snapshot {
                    if let Some(raw) = event.entry_mut(raw_id).and_then(EntryValue::as_frame_mut) {
                        raw.axis_offsets = Some(offsets);
                    }
                }
            }

            if output.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::model::{Frame, Sample};

    use super::*;

    fn paired_event(channel_values: &[&[f32]], correlation: f32, raw_offsets: bool) -> Event {
        let mapped_samples: Vec<Sample> = channel_values
            .iter()
            .map(|axes| Sample {
                axes: axes
                    .iter()
                    .map(|&v| AxisSample {
                        float_channels: vec![v],
                        sum: v,
                    })
                    .collect(),
                ..Sample::default()
            })
            .collect();

        let mut event = Event::new();
        event.add_entry(
            "Frame",
            EntryValue::Frame(Frame {
                axis_offsets: raw_offsets.then(Vec::new),
                ..Frame::default()
            }),
        );
        event.add_entry(
            "Mapped",
            EntryValue::Frame(Frame {
                samples: mapped_samples,
                correlation,
                ..Frame::default()
            }),
        );
        event
    }

    async fn run_pedestals(
        pedestals: Pedestals,
        events: Vec<Event>,
    ) -> Vec<Event> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        let (out_tx, mut out_rx) = mpsc::channel(events.len().max(1));
        tokio::spawn(pedestals.subtract(rx, out_tx));
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        let mut out = Vec::new();
        while let Some(event) = out_rx.recv().await {
            out.push(event);
        }
        out
    }

    fn mapped_channel(event: &Event, axis: usize) -> f32 {
        let ids = event.tagged_entries("Mapped");
        let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
        frame.samples[0].axes[axis].float_channels[0]
    }

    #[tokio::test]
    async fn gating_freezes_pedestals_on_correlated_frames() {
        // Alpha 0.5, CovFrac 0.5, two axes: thres = 0.25.
        let pedestals = Pedestals {
            alpha: 0.5,
            cov_frac: 0.5,
            ..Pedestals::default()
        };

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(paired_event(&[&[8.0, 8.0]], 0.1, false));
        }
        for _ in 0..2 {
            events.push(paired_event(&[&[8.0, 8.0]], 0.9, false));
        }

        let out = run_pedestals(pedestals, events).await;

        // Running mean converges toward 8: 4, 6, 7 after three updates.
        assert_eq!(mapped_channel(&out[0], 0), 8.0 - 4.0);
        assert_eq!(mapped_channel(&out[1], 0), 8.0 - 6.0);
        assert_eq!(mapped_channel(&out[2], 0), 8.0 - 7.0);
        // Correlated frames leave the mean at 7.
        assert_eq!(mapped_channel(&out[3], 0), 8.0 - 7.0);
        assert_eq!(mapped_channel(&out[4], 0), 8.0 - 7.0);
    }

    #[tokio::test]
    async fn existing_offsets_make_it_a_no_op() {
        let pedestals = Pedestals {
            alpha: 0.5,
            cov_frac: 0.5,
            ..Pedestals::default()
        };
        let out = run_pedestals(pedestals, vec![paired_event(&[&[8.0, 8.0]], 0.1, true)]).await;
        assert_eq!(mapped_channel(&out[0], 0), 8.0);
        assert_eq!(mapped_channel(&out[0], 1), 8.0);
    }

    #[tokio::test]
    async fn snapshot_lands_on_raw_frame() {
        let pedestals = Pedestals {
            alpha: 0.5,
            cov_frac: 0.5,
            ..Pedestals::default()
        };
        let out = run_pedestals(pedestals, vec![paired_event(&[&[8.0, 8.0]], 0.1, false)]).await;

        let raw_ids = out[0].tagged_entries("Frame");
        let raw = out[0].entry(raw_ids[0]).unwrap().as_frame().unwrap();
        let offsets = raw.axis_offsets.as_ref().expect("offsets were published");
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].float_channels[0], 4.0);
    }

    #[tokio::test]
    async fn mismatched_frame_counts_drop_the_event() {
        let pedestals = Pedestals::default();
        let mut event = Event::new();
        event.add_entry("Mapped", EntryValue::Frame(Frame::default()));
        let out = run_pedestals(pedestals, vec![event]).await;
        assert!(out.is_empty());
    }
}
