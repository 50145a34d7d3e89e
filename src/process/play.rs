use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::event::{Event, EntryValue};
use crate::model::SUBSEC_DIV;

/// Paces a recorded event stream against a virtual clock.
///
/// Each event is released once its earliest frame timestamp has elapsed
/// relative to the anchor, scaled by 1/speed. A timestamp regression
/// (loop restart, spliced recordings) re-anchors the clock.
pub struct Player {
    pub speed: f64,
}

impl Default for Player {
    fn default() -> Self {
        Player { speed: 1.0 }
    }
}

impl Player {
    pub async fn play(mut self, mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) {
        if self.speed == 0.0 {
            self.speed = 1.0;
        }
        let duration_scale = 1.0 / self.speed;

        let mut start = Instant::now();
        let mut init_stamp = u64::MAX;
        let mut last_stamp = u64::MAX;

        while let Some(event) = input.recv().await {
            let mut earliest = u64::MAX;
            for frame_id in event.tagged_entries("Frame") {
                if let Some(frame) = event.entry(frame_id).and_then(EntryValue::as_frame) {
                    earliest = earliest.min(frame.timestamp);
                }
            }

            let stamp_diff = if earliest < last_stamp {
                start = Instant::now();
                init_stamp = earliest;
                0.0
            } else {
                duration_scale * earliest.saturating_sub(init_stamp) as f64 / SUBSEC_DIV
            };
            last_stamp = earliest;

            if stamp_diff.is_finite() && stamp_diff > 0.0 {
                sleep_until(start + Duration::from_secs_f64(stamp_diff)).await;
            }

            if output.send(event).await.is_err() {
                return;
            }
        }
    }
}
