use tokio::sync::mpsc;

use crate::event::{Event, EntryValue};
use crate::model::Frame;

/// Scalar correlation of a mapped frame: the product over axis pairs of
/// squared covariance over the product of variances, starting from 1.0.
///
/// Degenerate frames (a zero variance on some axis) divide by zero here;
/// the resulting inf/NaN is stored as-is and fails every `< threshold`
/// comparison downstream, so such frames never update pedestals.
fn frame_correlation(frame: &Frame) -> Option<f32> {
    let n_samples = frame.samples.len();
    if n_samples == 0 {
        return None;
    }

    let n_axes = frame.samples[0].axes.len();
    let mut sum = vec![0f64; n_axes];
    let mut prod_sum = vec![vec![0f64; n_axes]; n_axes];

    for sample in &frame.samples {
        for j in 0..n_axes {
            let axis_j_sum = sample.axes.get(j).map(|a| a.sum as f64).unwrap_or(0.0);
            sum[j] += axis_j_sum;
            for k in j..n_axes {
                let axis_k_sum = sample.axes.get(k).map(|a| a.sum as f64).unwrap_or(0.0);
                prod_sum[j][k] += axis_j_sum * axis_k_sum;
            }
        }
    }

    let mut cov = vec![vec![0f64; n_axes]; n_axes];
    for j in 0..n_axes {
        for k in j..n_axes {
            cov[j][k] = prod_sum[j][k] - sum[j] * sum[k] / n_samples as f64;
        }
    }

    let mut corr = 1.0f64;
    for j in 0..n_axes {
        for k in j + 1..n_axes {
            corr *= cov[j][k] * cov[j][k] / (cov[j][j] * cov[k][k]);
        }
    }
    Some(corr as f32)
}

/// Per-event variant: correlate every "Mapped" frame.
pub fn correlate_event(event: &mut Event) {
    for entry_id in event.tagged_entries("Mapped") {
        let Some(frame) = event.entry_mut(entry_id).and_then(EntryValue::as_frame_mut) else {
            continue;
        };
        if let Some(corr) = frame_correlation(frame) {
            frame.correlation = corr;
        }
    }
}

/// Streaming variant with a frame-count window.
///
/// With `n_frames > 0` only the first `n_frames` mapped frames are
/// correlated; with `n_frames < 0` every frame after the first
/// `|n_frames|`; with 0, all of them. Outside the window the configured
/// default is written instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct Correlator {
    pub n_frames: i64,
    pub default: f32,
}

impl Correlator {
    pub async fn run(self, mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) {
        let mut i = 0i64;
        while let Some(mut event) = input.recv().await {
            for entry_id in event.tagged_entries("Mapped") {
                i += 1;

                let Some(frame) = event.entry_mut(entry_id).and_then(EntryValue::as_frame_mut)
                else {
                    continue;
                };

                let in_window = self.n_frames == 0
                    || i <= self.n_frames
                    || (self.n_frames < 0 && i > -self.n_frames);
                if in_window {
                    if let Some(corr) = frame_correlation(frame) {
                        frame.correlation = corr;
                    }
                } else {
                    frame.correlation = self.default;
                }
            }

            if output.send(event).await.is_err() {
                return;
            }
        }
    }
}
