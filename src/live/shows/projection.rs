use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::json;

use crate::live::message::{Cmd, Msg};

use super::{parse_bool, Show, ShowKind, ShowSample, SourceSample, FRAME_MIME};

struct ProjectionState {
    alpha: f64,
    disable_autorange: bool,
    draw_magnitude: bool,
    logscale: bool,
    y_min: f64,
    y_max: f64,
    lines: IndexMap<String, Vec<f64>>,
    frame: Option<Msg>,
    frame_count: u64,
    frame_expired: bool,
}

/// Per-channel projection: one exponentially-averaged value per channel
/// index, one line per source.
pub struct Projection {
    period: Duration,
    state: Arc<Mutex<ProjectionState>>,
}

impl Projection {
    pub fn new(period: Duration) -> Self {
        Projection {
            period,
            state: Arc::new(Mutex::new(ProjectionState {
                alpha: 0.0,
                disable_autorange: false,
                draw_magnitude: false,
                logscale: false,
                y_min: f64::INFINITY,
                y_max: f64::NEG_INFINITY,
                lines: IndexMap::new(),
                frame: None,
                frame_count: 0,
                frame_expired: false,
            })),
        }
    }
}

fn render(st: &mut ProjectionState, period: Duration, handle: &Arc<Mutex<ProjectionState>>) {
    if !st.disable_autorange && !st.lines.is_empty() {
        st.y_min = f64::INFINITY;
        st.y_max = f64::NEG_INFINITY;
        for line in st.lines.values() {
            for &y in line {
                st.y_min = st.y_min.min(y);
                st.y_max = st.y_max.max(y);
            }
        }
    }

    let lines: serde_json::Map<String, serde_json::Value> = st
        .lines
        .iter()
        .map(|(name, ys)| (name.clone(), json!(ys)))
        .collect();
    let payload = json!({
        "lines": lines,
        "y_min": st.y_min,
        "y_max": st.y_max,
    });

    let mut msg = Msg::default();
    msg.metadata.insert("show type".into(), "Projection".into());
    msg.metadata.insert("mime".into(), FRAME_MIME.into());
    msg.metadata.insert("alpha".into(), st.alpha.to_string());
    msg.metadata
        .insert("autorange".into(), (!st.disable_autorange).to_string());
    msg.metadata
        .insert("magnitude".into(), st.draw_magnitude.to_string());
    msg.metadata.insert("min".into(), st.y_min.to_string());
    msg.metadata.insert("max".into(), st.y_max.to_string());
    msg.metadata
        .insert("logscale".into(), st.logscale.to_string());
    msg.payload = serde_json::to_vec(&payload).unwrap_or_default();

    st.frame = Some(msg);
    st.frame_count += 1;

    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        handle.lock().unwrap().frame_expired = true;
    });
}

impl Show for Projection {
    fn kind(&self) -> ShowKind {
        ShowKind::Projection
    }

    fn add_sample(&self, sample: &ShowSample) {
        let SourceSample::Projection(values) = &sample.value else {
            return;
        };

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        if st.alpha <= 0.0 {
            st.alpha = 1.0;
        }
        let alpha = st.alpha;
        let inv_alpha = 1.0 - alpha;

        let line = st.lines.entry(sample.source.clone()).or_default();
        if line.len() != values.len() {
            // Channel count changed: the accumulator starts over.
            *line = vec![0.0; values.len()];
        }
        for (acc, &v) in line.iter_mut().zip(values) {
            let v = if st.draw_magnitude {
                (v as f64).abs()
            } else {
                v as f64
            };
            *acc = inv_alpha * *acc + alpha * v;
        }

        if st.frame_expired {
            st.frame_expired = false;
            drop(guard);
            let state = Arc::clone(&self.state);
            let period = self.period;
            tokio::spawn(async move {
                let mut st = state.lock().unwrap();
                render(&mut st, period, &state);
            });
        }
    }

    fn frame(&self) -> (Option<Msg>, u64) {
        let st = self.state.lock().unwrap();
        (st.frame.clone(), st.frame_count)
    }

    fn update_frame(&self) {
        let mut st = self.state.lock().unwrap();
        render(&mut st, self.period, &self.state);
    }

    fn update_frame_count(&self) {
        self.state.lock().unwrap().frame_count += 1;
    }

    fn execute(&self, cmd: &Cmd) {
        if cmd.command != "set params" {
            return;
        }
        let mut st = self.state.lock().unwrap();
        for (param, value) in &cmd.metadata {
            match param.as_str() {
                "autorange" => st.disable_autorange = !parse_bool(value),
                "magnitude" => st.draw_magnitude = parse_bool(value),
                "min" => {
                    if let Ok(min) = value.parse() {
                        st.y_min = min;
                    }
                }
                "max" => {
                    if let Ok(max) = value.parse() {
                        st.y_max = max;
                    }
                }
                "alpha" => {
                    if let Ok(alpha) = value.parse::<f64>() {
                        if alpha > 0.0 && alpha <= 1.0 {
                            st.alpha = alpha;
                        }
                    }
                }
                "logscale" => st.logscale = parse_bool(value),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn projection_sample(values: &[f32]) -> ShowSample {
        ShowSample {
            source: "axis".to_string(),
            value: SourceSample::Projection(values.to_vec()),
        }
    }

    #[tokio::test]
    async fn averages_with_alpha() {
        let show = Projection::new(Duration::from_millis(50));
        show.execute(&Cmd::new("set params").with("alpha", "0.5"));
        show.add_sample(&projection_sample(&[8.0, 0.0]));
        show.add_sample(&projection_sample(&[8.0, 0.0]));
        let st = show.state.lock().unwrap();
        let line = st.lines.get("axis").unwrap();
        assert_eq!(line[0], 6.0);
        assert_eq!(line[1], 0.0);
    }

    #[tokio::test]
    async fn length_change_resets_accumulator() {
        let show = Projection::new(Duration::from_millis(50));
        show.add_sample(&projection_sample(&[1.0, 2.0]));
        show.add_sample(&projection_sample(&[5.0]));
        let st = show.state.lock().unwrap();
        assert_eq!(st.lines.get("axis").unwrap().as_slice(), &[5.0]);
    }

    #[tokio::test]
    async fn render_carries_parameters() {
        let show = Projection::new(Duration::from_millis(50));
        show.add_sample(&projection_sample(&[1.0]));
        show.update_frame();
        let (frame, count) = show.frame();
        let frame = frame.unwrap();
        assert_eq!(count, 1);
        assert_eq!(frame.metadata.get("show type").unwrap(), "Projection");
        assert_eq!(frame.metadata.get("mime").unwrap(), FRAME_MIME);
        let payload: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert!(payload["lines"]["axis"].is_array());
    }
}
