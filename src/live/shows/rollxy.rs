use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::json;

use crate::live::message::{Cmd, Msg};

use super::{parse_bool, Show, ShowKind, ShowSample, Smoother, SourceSample, FRAME_MIME};

struct SmoothLine {
    smoother: Smoother,
    i: u64,
    trig_end: u64,
    xys: Vec<(f64, f64)>,
}

struct RollXyState {
    alpha: f64,
    disable_autorange: bool,
    downsample: u64,
    draw_magnitude: bool,
    n_sample: usize,
    trigger: String,
    trigger_falling: bool,
    trigger_lead_sample: usize,
    trigger_level: f64,
    logscale: bool,
    y_min: f64,
    y_max: f64,
    lines: IndexMap<String, SmoothLine>,
    triggered: bool,
    frame: Option<Msg>,
    frame_count: u64,
    frame_expired: bool,
}

/// Rolling XY strip chart with exponential smoothing, downsampling, and an
/// oscilloscope-style trigger.
///
/// When a trigger channel is configured, a level crossing on that line
/// latches the show until `(n_sample - lead) * downsample` further samples
/// arrive; the trigger window then renders synchronously and every line
/// buffer clears. Without a trigger, rendering is paced by frame expiry.
pub struct RollXy {
    period: Duration,
    state: Arc<Mutex<RollXyState>>,
}

impl RollXy {
    pub fn new(period: Duration) -> Self {
        RollXy {
            period,
            state: Arc::new(Mutex::new(RollXyState {
                alpha: 0.0,
                disable_autorange: false,
                downsample: 0,
                draw_magnitude: false,
                n_sample: 0,
                trigger: String::new(),
                trigger_falling: false,
                trigger_lead_sample: 0,
                trigger_level: 0.0,
                logscale: false,
                y_min: f64::INFINITY,
                y_max: f64::NEG_INFINITY,
                lines: IndexMap::new(),
                triggered: false,
                frame: None,
                frame_count: 0,
                frame_expired: false,
            })),
        }
    }
}

fn render(st: &mut RollXyState, period: Duration, handle: &Arc<Mutex<RollXyState>>) {
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    if !st.disable_autorange {
        st.y_min = f64::INFINITY;
        st.y_max = f64::NEG_INFINITY;
    }
    for line in st.lines.values() {
        for &(x, y) in &line.xys {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            if !st.disable_autorange {
                st.y_min = st.y_min.min(y);
                st.y_max = st.y_max.max(y);
            }
        }
    }

    let lines: serde_json::Map<String, serde_json::Value> = st
        .lines
        .iter()
        .map(|(name, line)| (name.clone(), json!(line.xys)))
        .collect();
    let payload = json!({
        "lines": lines,
        "x_min": x_min,
        "x_max": x_max,
        "y_min": st.y_min,
        "y_max": st.y_max,
    });

    let mut msg = Msg::default();
    msg.metadata.insert("show type".into(), "Roll XY".into());
    msg.metadata.insert("mime".into(), FRAME_MIME.into());
    msg.metadata.insert("trigger".into(), st.trigger.clone());
    msg.metadata
        .insert("triglevel".into(), st.trigger_level.to_string());
    msg.metadata
        .insert("trigfall".into(), st.trigger_falling.to_string());
    msg.metadata
        .insert("trigleadsample".into(), st.trigger_lead_sample.to_string());
    msg.metadata.insert("alpha".into(), st.alpha.to_string());
    msg.metadata
        .insert("nsample".into(), st.n_sample.to_string());
    msg.metadata
        .insert("downsample".into(), st.downsample.to_string());
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

impl Show for RollXy {
    fn kind(&self) -> ShowKind {
        ShowKind::RollXy
    }

    fn add_sample(&self, sample: &ShowSample) {
        let (x, y) = match sample.value {
            SourceSample::RollXy(x, y) => (x, y as f64),
            _ => return,
        };

        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        if st.n_sample == 0 {
            st.n_sample = 500;
        }
        if st.downsample == 0 {
            st.downsample = 1;
        }
        if st.alpha == 0.0 {
            st.alpha = 1.0;
        }

        let alpha = st.alpha;
        let line = st
            .lines
            .entry(sample.source.clone())
            .or_insert_with(|| SmoothLine {
                smoother: Smoother::new(alpha, 0.0),
                i: 0,
                trig_end: 0,
                xys: Vec::new(),
            });
        line.i += 1;

        let y = if st.draw_magnitude { y.abs() } else { y };
        let mut y_smooth = line.smoother.smooth(y);

        if !st.triggered
            && line.xys.len() > st.trigger_lead_sample
            && st.trigger == sample.source
        {
            let last_y = line.xys[line.xys.len() - 1].1;
            let crossed = if st.trigger_falling {
                y_smooth <= st.trigger_level && last_y > st.trigger_level
            } else {
                y_smooth >= st.trigger_level && last_y < st.trigger_level
            };
            if crossed {
                st.triggered = true;
                line.trig_end = line.i
                    + st.n_sample.saturating_sub(st.trigger_lead_sample) as u64 * st.downsample;
            }
        }

        if line.i % st.downsample == 0 {
            if let Some(&(last_x, _)) = line.xys.last() {
                // The x coordinate regressed: the source restarted, so the
                // line and its smoother start over.
                if x < last_x {
                    line.xys.clear();
                    line.smoother = Smoother::new(st.alpha, 0.0);
                    y_smooth = line.smoother.smooth(y);
                }
            }
            line.xys.push((x, y_smooth));
            while line.xys.len() > st.n_sample {
                line.xys.remove(0);
            }
        }

        let at_trig_end = line.i == line.trig_end;
        if at_trig_end {
            if st.frame_expired {
                st.frame_expired = false;
                render(st, self.period, &self.state);
            }
            for line in st.lines.values_mut() {
                line.xys.clear();
            }
            st.triggered = false;
        } else if st.trigger.is_empty() && st.frame_expired {
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
                "logscale" => st.logscale = parse_bool(value),
                "alpha" => {
                    if let Ok(alpha) = value.parse::<f64>() {
                        if alpha > 0.0 && alpha <= 1.0 {
                            st.alpha = alpha;
                            for line in st.lines.values_mut() {
                                let seed = line.xys.last().map(|&(_, y)| y).unwrap_or(0.0);
                                line.smoother = Smoother::new(alpha, seed);
                            }
                        }
                    }
                }
                "nsample" => {
                    if let Ok(n) = value.parse::<usize>() {
                        st.n_sample = n;
                    }
                }
                "downsample" => {
                    if let Ok(n) = value.parse::<u64>() {
                        st.downsample = n;
                    }
                }
                "trigger" => st.trigger = value.clone(),
                "triglevel" => {
                    if let Ok(level) = value.parse() {
                        st.trigger_level = level;
                    }
                }
                "trigleadsample" => {
                    if let Ok(n) = value.parse::<usize>() {
                        st.trigger_lead_sample = n;
                    }
                }
                "trigfall" => st.trigger_falling = parse_bool(value),
                _ => {}
            }
        }
    }
}
