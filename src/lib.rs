pub mod capture;
pub mod error;
pub mod pipeline;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameCursor, SequenceNumber, Stream};
pub use error::{CaptureError, Result};
pub use pipeline::{CaptureSession, SampleRates, SessionState};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Simulated,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub driver: DriverKind,
    /// Index into the detected device list
    pub device_index: usize,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub shutter_fps: u32,
    /// Transfer rate of the simulated camera
    pub simulated_fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_rates: SampleRates,
    pub decode_threads: usize,
    /// Pull transfers synchronously from `read` instead of a driver callback
    pub single_thread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub readers: usize,
    /// Seconds to run; 0 runs until Ctrl-C
    pub duration_secs: u64,
    /// Register a frame listener instead of polling `read`
    pub push_mode: bool,
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Simulated,
            device_index: 0,
            width: 1246,
            height: 800,
            framerate: 1000,
            shutter_fps: 2000,
            simulated_fps: 200,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rates: SampleRates::default(),
            decode_threads: 4,
            single_thread: false,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            readers: 2,
            duration_secs: 0,
            push_mode: false,
            channel_capacity: 4,
        }
    }
}

impl Config {
    /// Defaults, overlaid with `path` (TOML) if given, then `STROBE__*`
    /// environment variables, e.g. `STROBE__CAPTURE__WIDTH=640`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("STROBE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
