use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::live::message::{Cmd, Msg};

use super::{Show, ShowKind, ShowSample, SourceSample, FRAME_MIME};

struct XyState {
    n_sample: usize,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    points: Vec<(f64, f64)>,
    frame: Option<Msg>,
    frame_count: u64,
    frame_expired: bool,
}

/// Scatter of the most recent `n_sample` points.
pub struct Xy {
    period: Duration,
    state: Arc<Mutex<XyState>>,
}

impl Xy {
    pub fn new(period: Duration) -> Self {
        Xy {
            period,
            state: Arc::new(Mutex::new(XyState {
                n_sample: 0,
                x_min: f64::INFINITY,
                x_max: f64::NEG_INFINITY,
                y_min: f64::INFINITY,
                y_max: f64::NEG_INFINITY,
                points: Vec::new(),
                frame: None,
                frame_count: 0,
                frame_expired: false,
            })),
        }
    }
}

fn render(st: &mut XyState, period: Duration, handle: &Arc<Mutex<XyState>>) {
    let payload = json!({
        "points": st.points,
        "x_min": st.x_min,
        "x_max": st.x_max,
        "y_min": st.y_min,
        "y_max": st.y_max,
    });

    let mut msg = Msg::default();
    msg.metadata.insert("show type".into(), "XY".into());
    msg.metadata.insert("mime".into(), FRAME_MIME.into());
    msg.metadata.insert("min x".into(), st.x_min.to_string());
    msg.metadata.insert("max x".into(), st.x_max.to_string());
    msg.metadata.insert("min y".into(), st.y_min.to_string());
    msg.metadata.insert("max y".into(), st.y_max.to_string());
    msg.metadata
        .insert("nsample".into(), st.n_sample.to_string());
    msg.payload = serde_json::to_vec(&payload).unwrap_or_default();

    st.frame = Some(msg);
    st.frame_count += 1;

    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        handle.lock().unwrap().frame_expired = true;
    });
}

impl Show for Xy {
    fn kind(&self) -> ShowKind {
        ShowKind::Xy
    }

    fn add_sample(&self, sample: &ShowSample) {
        let (x, y) = match sample.value {
            SourceSample::Xy(x, y) => (x as f64, y as f64),
            _ => return,
        };

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        st.points.push((x, y));
        if st.n_sample == 0 {
            st.n_sample = 100;
        }
        if st.points.len() > st.n_sample {
            let excess = st.points.len() - st.n_sample;
            st.points.drain(..excess);
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
                "min x" => {
                    if let Ok(v) = value.parse() {
                        st.x_min = v;
                    }
                }
                "max x" => {
                    if let Ok(v) = value.parse() {
                        st.x_max = v;
                    }
                }
                "min y" => {
                    if let Ok(v) = value.parse() {
                        st.y_min = v;
                    }
                }
                "max y" => {
                    if let Ok(v) = value.parse() {
                        st.y_max = v;
                    }
                }
                "nsample" => {
                    if let Ok(v) = value.parse::<usize>() {
                        st.n_sample = v;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn xy_sample(x: f32, y: f32) -> ShowSample {
        ShowSample {
            source: "beam".to_string(),
            value: SourceSample::Xy(x, y),
        }
    }

    #[tokio::test]
    async fn keeps_only_the_newest_points() {
        let show = Xy::new(Duration::from_millis(50));
        show.execute(&Cmd::new("set params").with("nsample", "2"));
        show.add_sample(&xy_sample(1.0, 1.0));
        show.add_sample(&xy_sample(2.0, 2.0));
        show.add_sample(&xy_sample(3.0, 3.0));
        let st = show.state.lock().unwrap();
        assert_eq!(st.points, vec![(2.0, 2.0), (3.0, 3.0)]);
    }

    #[tokio::test]
    async fn default_window_is_one_hundred() {
        let show = Xy::new(Duration::from_millis(50));
        for i in 0..150 {
            show.add_sample(&xy_sample(i as f32, 0.0));
        }
        assert_eq!(show.state.lock().unwrap().points.len(), 100);
    }
}
