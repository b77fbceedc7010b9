pub mod gate;
pub mod pool;
pub mod session;

pub use gate::{GateDecision, SampleRateGate, SampleRates};
pub use pool::{DecodeTarget, DirectSlot, FramePool, StreamSlots};
pub use session::{CaptureSession, FrameListener, SessionState};
