//! Camera driver contract consumed by the capture session

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::decoder::QuantTable;
use super::frame::{SequenceNumber, TransferFormat};
use crate::error::{CaptureError, DriverError};

/// Index into the list returned by [`CameraDriver::detect`].
pub type DeviceId = usize;

/// Receiver of continuous transfers.
///
/// The driver invokes it on a thread it owns, one transfer at a time.
pub trait TransferHandler: Send + Sync {
    fn on_transfer_received(&self, payload: &[u8], sequence: SequenceNumber);
}

/// Control surface of a camera library.
///
/// Calls are serialized by the session; only the registered
/// [`TransferHandler`] runs concurrently with them.
pub trait CameraDriver: Send {
    /// Encoding of every payload this driver produces.
    fn transfer_format(&self) -> TransferFormat;

    fn detect(&mut self) -> Result<Vec<String>, DriverError>;

    fn open_device(&mut self, device: DeviceId) -> Result<(), DriverError>;

    fn reset_device(&mut self, device: DeviceId) -> Result<(), DriverError>;

    fn close_device(&mut self) -> Result<(), DriverError>;

    fn set_framerate_shutter(&mut self, framerate: u32, shutter_fps: u32)
        -> Result<(), DriverError>;

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), DriverError>;

    fn resolution(&mut self) -> Result<(u32, u32), DriverError>;

    /// Switch the device to compressed transfers.
    fn set_compressed_transfer(&mut self) -> Result<(), DriverError>;

    /// Upper bound on the size of one transfer payload.
    fn transfer_size(&mut self) -> Result<usize, DriverError>;

    fn quantization(&mut self) -> Result<QuantTable, DriverError>;

    /// Start continuous transfers into `handler`.
    fn begin_transfer(&mut self, handler: Arc<dyn TransferHandler>) -> Result<(), DriverError>;

    /// Stop continuous transfers.
    ///
    /// Must not return while a handler invocation is in flight, and the
    /// handler must never be invoked afterwards.
    fn end_transfer(&mut self) -> Result<(), DriverError>;

    /// Pull exactly one transfer into `payload`.
    fn single_transfer(&mut self, payload: &mut Vec<u8>) -> Result<SequenceNumber, DriverError>;
}

struct RuntimeState {
    users: usize,
}

static RUNTIME: Lazy<Mutex<RuntimeState>> = Lazy::new(|| Mutex::new(RuntimeState { users: 0 }));

/// Reference-counted, process-wide driver library initialization.
///
/// The first [`DriverRuntime::acquire`] runs the library's init routine;
/// later calls only bump the count. When the last guard drops, the next
/// acquire initializes again.
#[must_use = "the driver runtime is released when the guard drops"]
pub struct DriverRuntime {
    _private: (),
}

impl DriverRuntime {
    pub fn acquire<F>(init: F) -> Result<Self, CaptureError>
    where
        F: FnOnce() -> Result<(), DriverError>,
    {
        let mut state = RUNTIME.lock();
        if state.users == 0 {
            init().map_err(CaptureError::Runtime)?;
            info!("Driver runtime initialized");
        }
        state.users += 1;
        debug!(users = state.users, "Driver runtime acquired");
        Ok(Self { _private: () })
    }

    pub fn users() -> usize {
        RUNTIME.lock().users
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        let mut state = RUNTIME.lock();
        state.users = state.users.saturating_sub(1);
        debug!(users = state.users, "Driver runtime released");
    }
}
