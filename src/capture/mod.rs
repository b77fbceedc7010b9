pub mod decoder;
pub mod device;
pub mod frame;
pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use decoder::{decoder_for, FrameDecoder, MjpegDecoder, QuantTable, RawLumaDecoder};
pub use device::{CameraDriver, DeviceId, DriverRuntime, TransferHandler};
pub use frame::{
    Frame, FrameCursor, FrameMetadata, Observation, SequenceNumber, Stream, StreamGeometry,
    TransferFormat,
};
pub use sim::{SimulatedCamera, SimulatorHandle};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Driver;
