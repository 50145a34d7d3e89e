use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::live::message::{Cmd, Msg};

use super::{Show, ShowKind, ShowSample, SourceSample, FRAME_MIME};

const DEFAULT_NBINS: usize = 100;

struct Binning {
    nx: usize,
    ny: usize,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    counts: Vec<f64>,
}

impl Binning {
    fn new(nx: usize, x_min: f64, x_max: f64, ny: usize, y_min: f64, y_max: f64) -> Self {
        Binning {
            nx,
            ny,
            x_min,
            x_max,
            y_min,
            y_max,
            counts: vec![0.0; nx * ny],
        }
    }

    /// Fill one weighted entry; values outside the binning range fall off.
    fn fill(&mut self, x: f64, y: f64, weight: f64) {
        if x < self.x_min || x >= self.x_max || y < self.y_min || y >= self.y_max {
            return;
        }
        let i = ((x - self.x_min) / (self.x_max - self.x_min) * self.nx as f64) as usize;
        let j = ((y - self.y_min) / (self.y_max - self.y_min) * self.ny as f64) as usize;
        let i = i.min(self.nx - 1);
        let j = j.min(self.ny - 1);
        self.counts[j * self.nx + i] += weight;
    }
}

struct Hist2dState {
    binning: Binning,
    frame: Option<Msg>,
    frame_count: u64,
    frame_expired: bool,
}

/// Two-dimensional weighted histogram. Any binning change rebuilds the
/// histogram and drops accumulated contents.
pub struct Hist2d {
    period: Duration,
    state: Arc<Mutex<Hist2dState>>,
}

impl Hist2d {
    pub fn new(period: Duration) -> Self {
        Hist2d {
            period,
            state: Arc::new(Mutex::new(Hist2dState {
                binning: Binning::new(DEFAULT_NBINS, -1.0, 1.0, DEFAULT_NBINS, -1.0, 1.0),
                frame: None,
                frame_count: 0,
                frame_expired: false,
            })),
        }
    }
}

fn render(st: &mut Hist2dState, period: Duration, handle: &Arc<Mutex<Hist2dState>>) {
    let b = &st.binning;
    let payload = json!({
        "nx": b.nx,
        "ny": b.ny,
        "x_min": b.x_min,
        "x_max": b.x_max,
        "y_min": b.y_min,
        "y_max": b.y_max,
        "counts": b.counts,
    });

    let mut msg = Msg::default();
    msg.metadata.insert("show type".into(), "Histogram 2D".into());
    msg.metadata.insert("mime".into(), FRAME_MIME.into());
    msg.metadata.insert("nbins x".into(), b.nx.to_string());
    msg.metadata.insert("nbins y".into(), b.ny.to_string());
    msg.metadata.insert("min x".into(), b.x_min.to_string());
    msg.metadata.insert("max x".into(), b.x_max.to_string());
    msg.metadata.insert("min y".into(), b.y_min.to_string());
    msg.metadata.insert("max y".into(), b.y_max.to_string());
    msg.payload = serde_json::to_vec(&payload).unwrap_or_default();

    st.frame = Some(msg);
    st.frame_count += 1;

    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        handle.lock().unwrap().frame_expired = true;
    });
}

impl Show for Hist2d {
    fn kind(&self) -> ShowKind {
        ShowKind::Hist2d
    }

    fn add_sample(&self, sample: &ShowSample) {
        let (x, y, weight) = match sample.value {
            SourceSample::Hist2d(x, y, w) => (x as f64, y as f64, w as f64),
            _ => return,
        };

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        st.binning.fill(x, y, weight);

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
            let b = &st.binning;
            let (nx, x_min, x_max, ny, y_min, y_max) =
                (b.nx, b.x_min, b.x_max, b.ny, b.y_min, b.y_max);
            let rebuilt = match param.as_str() {
                "reset" => Some(Binning::new(nx, x_min, x_max, ny, y_min, y_max)),
                "min x" => value
                    .parse()
                    .ok()
                    .map(|v| Binning::new(nx, v, x_max, ny, y_min, y_max)),
                "max x" => value
                    .parse()
                    .ok()
                    .map(|v| Binning::new(nx, x_min, v, ny, y_min, y_max)),
                "min y" => value
                    .parse()
                    .ok()
                    .map(|v| Binning::new(nx, x_min, x_max, ny, v, y_max)),
                "max y" => value
                    .parse()
                    .ok()
                    .map(|v| Binning::new(nx, x_min, x_max, ny, y_min, v)),
                "nbins x" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .map(|n| Binning::new(n, x_min, x_max, ny, y_min, y_max)),
                "nbins y" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .map(|n| Binning::new(nx, x_min, x_max, n, y_min, y_max)),
                _ => None,
            };
            if let Some(binning) = rebuilt {
                st.binning = binning;
            }
        }
    }
}
