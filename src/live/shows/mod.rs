//! Shows: accumulating visualizations owned by a stream manager.
//!
//! A show ingests source samples, keeps a mutable display state, and
//! renders frames at a bounded rate. Rendering itself is a collaborator's
//! concern; here a render serializes the display state to JSON bytes with
//! a MIME hint, carrying the display parameters as frame metadata.

mod hist2d;
mod projection;
mod rollxy;
mod xy;

pub use hist2d::Hist2d;
pub use projection::Projection;
pub use rollxy::RollXy;
pub use xy::Xy;

use std::sync::Arc;
use std::time::Duration;

use crate::live::message::{Cmd, Msg};

pub const FRAME_MIME: &str = "application/json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShowKind {
    Projection,
    RollXy,
    Xy,
    Hist2d,
}

impl ShowKind {
    pub fn label(self) -> &'static str {
        match self {
            ShowKind::Projection => "Projection",
            ShowKind::RollXy => "Roll XY",
            ShowKind::Xy => "XY",
            ShowKind::Hist2d => "Histogram 2D",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Projection" => Some(ShowKind::Projection),
            "Roll XY" => Some(ShowKind::RollXy),
            "XY" => Some(ShowKind::Xy),
            "Histogram 2D" => Some(ShowKind::Hist2d),
            _ => None,
        }
    }
}

/// A classified source value. The variant decides which show kind the
/// source is compatible with.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceSample {
    Projection(Vec<f32>),
    RollXy(f64, f32),
    Xy(f32, f32),
    Hist2d(f32, f32, f32),
}

impl SourceSample {
    pub fn kind(&self) -> ShowKind {
        match self {
            SourceSample::Projection(_) => ShowKind::Projection,
            SourceSample::RollXy(..) => ShowKind::RollXy,
            SourceSample::Xy(..) => ShowKind::Xy,
            SourceSample::Hist2d(..) => ShowKind::Hist2d,
        }
    }
}

/// A source sample on its way to a show's input queue, labeled with the
/// source it came from.
#[derive(Clone, Debug)]
pub struct ShowSample {
    pub source: String,
    pub value: SourceSample,
}

/// The show contract. All methods are callable from any task; state sits
/// behind one lock per show, never held across a publish.
pub trait Show: Send + Sync {
    fn kind(&self) -> ShowKind;

    /// Feed one sample. Samples of the wrong shape are ignored. Observing
    /// an expired frame schedules exactly one asynchronous re-render.
    fn add_sample(&self, sample: &ShowSample);

    /// The last rendered frame and the monotone render counter.
    fn frame(&self) -> (Option<Msg>, u64);

    /// Force a synchronous render.
    fn update_frame(&self);

    /// Bump the counter without re-rendering, nudging publishers.
    fn update_frame_count(&self);

    fn execute(&self, cmd: &Cmd);
}

pub fn new_show(kind: ShowKind, period: Duration) -> Arc<dyn Show> {
    match kind {
        ShowKind::Projection => Arc::new(Projection::new(period)),
        ShowKind::RollXy => Arc::new(RollXy::new(period)),
        ShowKind::Xy => Arc::new(Xy::new(period)),
        ShowKind::Hist2d => Arc::new(Hist2d::new(period)),
    }
}

/// Exponentially-weighted smoother.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Smoother {
    alpha: f64,
    value: f64,
}

impl Smoother {
    pub(crate) fn new(alpha: f64, init: f64) -> Self {
        Smoother { alpha, value: init }
    }

    pub(crate) fn smooth(&mut self, new_value: f64) -> f64 {
        self.value = (1.0 - self.alpha) * self.value + self.alpha * new_value;
        self.value
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    !value.eq_ignore_ascii_case("false")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_roundtrip() {
        for kind in [
            ShowKind::Projection,
            ShowKind::RollXy,
            ShowKind::Xy,
            ShowKind::Hist2d,
        ] {
            assert_eq!(ShowKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ShowKind::from_label("Pie Chart"), None);
    }

    #[test]
    fn smoother_converges() {
        let mut s = Smoother::new(0.5, 0.0);
        assert_eq!(s.smooth(8.0), 4.0);
        assert_eq!(s.smooth(8.0), 6.0);
        assert_eq!(s.smooth(8.0), 7.0);
    }
}
