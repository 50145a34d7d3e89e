//! Detector map: the read-only description of how raw acquisition channels
//! map onto logical axes, plus per-detector image reconstruction data.
//!
//! The map is loaded once (from the embedded asset bundle) and never
//! mutated afterwards. Processors take an `Arc<DetectorMap>` parameter
//! rather than reaching for process-global state, so tests can inject
//! private maps.

use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::assets;
use crate::error::{Error, Result};

pub const EMBEDDED_PATH: &str = "detmap/dev.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Current,
    Pulse,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub axis: u32,
    pub axis_channel: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HpsConfig {
    #[serde(default)]
    pub channels: HashMap<u32, ChannelConfig>,
    #[serde(default)]
    pub current_conv: f32,
    #[serde(default)]
    pub det_config: u32,
    #[serde(default)]
    pub mode: Mode,
}

/// Optional per-channel conversion overrides for one physical head.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HpsCalibration {
    #[serde(default)]
    pub current_conv: Vec<f32>,
}

/// Linear-estimator data: transform matrix T plus estimator node positions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub lin_est_t: Vec<Vec<f32>>,
    #[serde(default)]
    pub x_pos: Vec<f32>,
    #[serde(default)]
    pub y_pos: Vec<f32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image_configs: Vec<ImageConfig>,
}

/// A UID decomposes as: upper 32 bits select the `HpsConfig`, lower 32 bits
/// select the `HpsCalibration`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectorMap {
    #[serde(default)]
    pub hps_configs: HashMap<u32, HpsConfig>,
    #[serde(default)]
    pub hps_calibrations: HashMap<u32, HpsCalibration>,
    #[serde(default)]
    pub det_configs: HashMap<u32, DetectorConfig>,
}

pub fn config_id(uid: u64) -> u32 {
    (uid >> 32) as u32
}

pub fn calib_id(uid: u64) -> u32 {
    uid as u32
}

impl DetectorMap {
    /// Deserialize the map shipped in the embedded asset bundle. Failure
    /// here is fatal for the server; callers decide.
    pub fn load_embedded() -> Result<Arc<Self>> {
        let bytes = assets::find(EMBEDDED_PATH)
            .ok_or_else(|| Error::MissingAsset(EMBEDDED_PATH.to_string()))?;
        Ok(Arc::new(serde_json::from_slice(bytes)?))
    }

    /// The head configuration for a UID, falling back to config id 1 for
    /// unknown configuration ids.
    pub fn hps_config(&self, uid: u64) -> Option<&HpsConfig> {
        self.hps_configs
            .get(&config_id(uid))
            .or_else(|| self.hps_configs.get(&1))
    }

    /// Exact-id lookup without the fallback; the mapper skips unknown heads
    /// instead of mapping them with a borrowed configuration.
    pub fn hps_config_exact(&self, config: u32) -> Option<&HpsConfig> {
        self.hps_configs.get(&config)
    }

    pub fn hps_calibration(&self, uid: u64) -> Option<&HpsCalibration> {
        self.hps_calibrations.get(&calib_id(uid))
    }

    pub fn mode(&self, uid: u64) -> Mode {
        self.hps_configs
            .get(&config_id(uid))
            .map(|c| c.mode)
            .unwrap_or_default()
    }

    pub fn det_name(&self, uid: u64) -> Option<&str> {
        let hps_config = self.hps_config(uid)?;
        match self.det_configs.get(&hps_config.det_config) {
            Some(det) => Some(det.name.as_str()),
            None => {
                log::warn!("no detector config {}", hps_config.det_config);
                None
            }
        }
    }

    pub fn image_configs(&self, uid: u64) -> &[ImageConfig] {
        self.hps_config(uid)
            .and_then(|c| self.det_configs.get(&c.det_config))
            .map(|det| det.image_configs.as_slice())
            .unwrap_or(&[])
    }
}
