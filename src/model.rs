use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

/// Per-sample timestamp increment, in sub-second ticks of the fixed-point
/// clock (lower 32 bits of a timestamp are the fractional part).
pub const SAMPLE_TICK: u64 = 171_799;

/// Divisor turning the fractional part of a fixed-point timestamp into
/// seconds.
pub const SUBSEC_DIV: f64 = (1u64 << 32) as f64;

/// Convert a fixed-point timestamp (upper 32 bits seconds, lower 32 bits
/// fraction) into floating-point seconds.
pub fn timestamp_seconds(ts: u64) -> f64 {
    ts as f64 / SUBSEC_DIV
}

/// Raw per-channel integer readout from one acquisition head, before any
/// axis mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HpsSample {
    pub sample_number: u32,
    pub channels: Vec<i32>,
    /// Fallback channel vector; iterated only when `channels` is empty.
    pub fixed_channels: Vec<i32>,
    pub sum: i64,
}

/// Mapped float channel vector for one logical axis, with a cached sum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisSample {
    pub float_channels: Vec<f32>,
    pub sum: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BeamInfo {
    pub mean_x_pos: f32,
    pub mean_y_pos: f32,
    pub total_current: f32,
}

/// A single sub-frame measurement across all channels. The timestamp is a
/// delta from the containing frame's timestamp.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: u64,
    pub hps: FxHashMap<u64, HpsSample>,
    pub axes: Vec<AxisSample>,
    pub beam_info: Option<BeamInfo>,
}

/// A time-bounded batch of samples produced per stream UID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: u64,
    pub samples: Vec<Sample>,
    /// Pedestal offsets per axis. `Some` means offsets were published for
    /// this frame; the pedestal stage treats that as "already handled".
    pub axis_offsets: Option<Vec<AxisSample>>,
    pub correlation: f32,
}

/// Slow-control temperature readout carried in event metadata as JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Temp {
    #[serde(default)]
    pub som: Vec<f32>,
    #[serde(default)]
    pub fem: Vec<f32>,
    #[serde(default)]
    pub board: Vec<f32>,
}

/// High-voltage readout carried in event metadata as JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hv {
    #[serde(default)]
    pub dac_value: Vec<u32>,
}
