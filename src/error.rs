//! Error types for the capture core

use std::fmt;

use thiserror::Error;

/// Failure reported by a camera driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device not open")]
    NotOpen,

    #[error("no camera detected")]
    NoDevice,

    #[error("device index {index} out of range ({count} detected)")]
    InvalidDevice { index: usize, count: usize },

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer already running")]
    Busy,

    #[error("driver rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to turn one transfer payload into an image.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload holds {actual} bytes, expected at least {expected}")]
    PayloadTooShort { expected: usize, actual: usize },

    #[error("target buffer holds {actual} bytes, image needs {expected}")]
    TargetTooSmall { expected: usize, actual: usize },

    #[error("payload is {actual_width}x{actual_height}, stream expects {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("unsupported pixel layout: {0}")]
    UnsupportedLayout(String),

    #[error("jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
}

/// Negotiation step performed while opening or resuming a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    Detect,
    Open,
    Reset,
    FramerateShutter,
    Resolution,
    TransferMode,
    TransferSize,
    PrimeTransfer,
    QueryResolution,
    Quantization,
    BeginTransfer,
}

impl NegotiationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationStep::Detect => "detect device",
            NegotiationStep::Open => "open device",
            NegotiationStep::Reset => "reset device",
            NegotiationStep::FramerateShutter => "set framerate/shutter",
            NegotiationStep::Resolution => "set resolution",
            NegotiationStep::TransferMode => "set transfer mode",
            NegotiationStep::TransferSize => "query transfer size",
            NegotiationStep::PrimeTransfer => "prime single transfer",
            NegotiationStep::QueryResolution => "query resolution",
            NegotiationStep::Quantization => "query quantization",
            NegotiationStep::BeginTransfer => "begin transfer",
        }
    }
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by [`crate::pipeline::CaptureSession`].
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device not open")]
    DeviceNotOpen,

    #[error("{step} failed: {source}")]
    Negotiation {
        step: NegotiationStep,
        #[source]
        source: DriverError,
    },

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("transfer failed: {0}")]
    Transfer(#[source] DriverError),

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("driver initialization failed: {0}")]
    Runtime(#[source] DriverError),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl CaptureError {
    pub(crate) fn negotiation(step: NegotiationStep) -> impl FnOnce(DriverError) -> Self {
        move |source| CaptureError::Negotiation { step, source }
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
