//! Deterministic in-process camera
//!
//! Produces raw luma transfers whose every pixel is derived from the frame's
//! sequence number, so a reader can prove a frame was not stitched together
//! from two transfers. Transfers are either pushed by hand through a
//! [`SimulatorHandle`] or generated by a streaming thread at a fixed rate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::decoder::QuantTable;
use super::device::{CameraDriver, DeviceId, TransferHandler};
use super::frame::{Frame, SequenceNumber, Stream, StreamGeometry, TransferFormat, PROXY_BLOCK};
use crate::error::{DriverError, NegotiationStep};

/// Pixel value of the test pattern at `(x, y)` for transfer `sequence`.
#[inline]
pub fn pattern_value(x: u32, y: u32, sequence: SequenceNumber) -> u8 {
    (x.wrapping_mul(31) ^ y.wrapping_mul(17)).wrapping_add(sequence.0.wrapping_mul(13)) as u8
}

/// Packed `width * height` luma payload for transfer `sequence`.
pub fn pattern_payload(width: u32, height: u32, sequence: SequenceNumber) -> Vec<u8> {
    let mut payload = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        payload.extend((0..width).map(|x| pattern_value(x, y, sequence)));
    }
    payload
}

/// True when every pixel of `frame` matches the pattern of its own sequence.
///
/// `source_width` and `source_height` give the full-resolution size the frame
/// was decoded from; proxy pixels are checked against edge-clipped block
/// averages of that source.
pub fn frame_matches_pattern(frame: &Frame, source_width: u32, source_height: u32) -> bool {
    let sequence = frame.sequence();
    match frame.meta.stream {
        Stream::Full => (0..frame.meta.height).all(|y| {
            frame.row(y).is_some_and(|row| {
                row.iter()
                    .enumerate()
                    .all(|(x, &v)| v == pattern_value(x as u32, y, sequence))
            })
        }),
        Stream::Proxy => (0..frame.meta.height).all(|by| {
            let Some(row) = frame.row(by) else {
                return false;
            };
            row.iter().enumerate().all(|(bx, &v)| {
                let bx = bx as u32;
                let ys = by * PROXY_BLOCK..((by + 1) * PROXY_BLOCK).min(source_height);
                let xs = bx * PROXY_BLOCK..((bx + 1) * PROXY_BLOCK).min(source_width);
                let count = ys.len() as u32 * xs.len() as u32;
                let sum: u32 = ys
                    .flat_map(|y| xs.clone().map(move |x| u32::from(pattern_value(x, y, sequence))))
                    .sum();
                v == (sum / count.max(1)) as u8
            })
        }),
    }
}

#[derive(Debug)]
struct SimState {
    devices: usize,
    open: bool,
    width: u32,
    height: u32,
    framerate: u32,
    shutter_fps: u32,
    compressed: bool,
    open_failures: usize,
    failing_step: Option<NegotiationStep>,
    transfer_error: bool,
    next_single: SequenceNumber,
}

struct Shared {
    state: Mutex<SimState>,
    /// Held for reading during every handler invocation; `end_transfer`
    /// takes it for writing to wait out in-flight transfers.
    handler: RwLock<Option<Arc<dyn TransferHandler>>>,
    opens: AtomicUsize,
    resets: AtomicUsize,
    next_stream: AtomicU32,
}

impl Shared {
    fn dispatch(&self, payload: &[u8], sequence: SequenceNumber) -> bool {
        let handler = self.handler.read();
        match handler.as_ref() {
            Some(handler) => {
                handler.on_transfer_received(payload, sequence);
                true
            }
            None => false,
        }
    }

    fn fail_if(&self, step: NegotiationStep) -> Result<(), DriverError> {
        if self.state.lock().failing_step == Some(step) {
            return Err(DriverError::Rejected(format!("injected failure: {step}")));
        }
        Ok(())
    }
}

struct Streamer {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Simulated camera driver.
pub struct SimulatedCamera {
    shared: Arc<Shared>,
    frame_rate: Option<u32>,
    streamer: Option<Streamer>,
}

/// Test-side control of a [`SimulatedCamera`] owned by a session.
#[derive(Clone)]
pub struct SimulatorHandle {
    shared: Arc<Shared>,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    devices: 1,
                    open: false,
                    width,
                    height,
                    framerate: 0,
                    shutter_fps: 0,
                    compressed: false,
                    open_failures: 0,
                    failing_step: None,
                    transfer_error: false,
                    next_single: SequenceNumber(0),
                }),
                handler: RwLock::new(None),
                opens: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                next_stream: AtomicU32::new(0),
            }),
            frame_rate: None,
            streamer: None,
        }
    }

    /// Generate transfers from a background thread at `fps` once
    /// `begin_transfer` is called.
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = Some(fps.max(1));
        self
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            shared: self.shared.clone(),
        }
    }

    fn require_open(&self) -> Result<(), DriverError> {
        if self.shared.state.lock().open {
            Ok(())
        } else {
            Err(DriverError::NotOpen)
        }
    }

    fn stop_streamer(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.running.store(false, Ordering::Release);
            if streamer.thread.join().is_err() {
                warn!("Simulator streaming thread panicked");
            }
        }
    }
}

impl CameraDriver for SimulatedCamera {
    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::RawLuma
    }

    fn detect(&mut self) -> Result<Vec<String>, DriverError> {
        self.shared.fail_if(NegotiationStep::Detect)?;
        let devices = self.shared.state.lock().devices;
        Ok((0..devices).map(|i| format!("sim{i}")).collect())
    }

    fn open_device(&mut self, device: DeviceId) -> Result<(), DriverError> {
        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        self.shared.fail_if(NegotiationStep::Open)?;
        let mut state = self.shared.state.lock();
        if device >= state.devices {
            return Err(DriverError::InvalidDevice {
                index: device,
                count: state.devices,
            });
        }
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(DriverError::Rejected("device busy".into()));
        }
        state.open = true;
        debug!(device, "Simulated camera opened");
        Ok(())
    }

    fn reset_device(&mut self, _device: DeviceId) -> Result<(), DriverError> {
        self.shared.resets.fetch_add(1, Ordering::Relaxed);
        self.shared.fail_if(NegotiationStep::Reset)
    }

    fn close_device(&mut self) -> Result<(), DriverError> {
        self.stop_streamer();
        *self.shared.handler.write() = None;
        self.shared.state.lock().open = false;
        Ok(())
    }

    fn set_framerate_shutter(
        &mut self,
        framerate: u32,
        shutter_fps: u32,
    ) -> Result<(), DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::FramerateShutter)?;
        let mut state = self.shared.state.lock();
        state.framerate = framerate;
        state.shutter_fps = shutter_fps;
        Ok(())
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::Resolution)?;
        if width == 0 || height == 0 {
            return Err(DriverError::Rejected(format!("resolution {width}x{height}")));
        }
        let mut state = self.shared.state.lock();
        state.width = width;
        state.height = height;
        Ok(())
    }

    fn resolution(&mut self) -> Result<(u32, u32), DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::QueryResolution)?;
        let state = self.shared.state.lock();
        Ok((state.width, state.height))
    }

    fn set_compressed_transfer(&mut self) -> Result<(), DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::TransferMode)?;
        self.shared.state.lock().compressed = true;
        Ok(())
    }

    fn transfer_size(&mut self) -> Result<usize, DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::TransferSize)?;
        let state = self.shared.state.lock();
        Ok(state.width as usize * state.height as usize)
    }

    fn quantization(&mut self) -> Result<QuantTable, DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::Quantization)?;
        Ok(QuantTable(vec![16; 8]))
    }

    fn begin_transfer(&mut self, handler: Arc<dyn TransferHandler>) -> Result<(), DriverError> {
        self.require_open()?;
        self.shared.fail_if(NegotiationStep::BeginTransfer)?;
        {
            let mut slot = self.shared.handler.write();
            if slot.is_some() {
                return Err(DriverError::Busy);
            }
            *slot = Some(handler);
        }

        if let Some(fps) = self.frame_rate {
            let running = Arc::new(AtomicBool::new(true));
            let shared = self.shared.clone();
            let flag = running.clone();
            let period = Duration::from_secs(1) / fps;
            let spawned = std::thread::Builder::new()
                .name("sim-transfer".into())
                .spawn(move || {
                    while flag.load(Ordering::Acquire) {
                        let sequence =
                            SequenceNumber(shared.next_stream.fetch_add(1, Ordering::Relaxed));
                        let (width, height) = {
                            let state = shared.state.lock();
                            (state.width, state.height)
                        };
                        shared.dispatch(&pattern_payload(width, height, sequence), sequence);
                        std::thread::sleep(period);
                    }
                });
            let thread = match spawned {
                Ok(thread) => thread,
                Err(e) => {
                    *self.shared.handler.write() = None;
                    return Err(e.into());
                }
            };
            self.streamer = Some(Streamer { running, thread });
            info!(fps, "Simulated transfer thread started");
        }
        Ok(())
    }

    fn end_transfer(&mut self) -> Result<(), DriverError> {
        self.stop_streamer();
        // Waits for any in-flight handler invocation to return.
        *self.shared.handler.write() = None;
        Ok(())
    }

    fn single_transfer(&mut self, payload: &mut Vec<u8>) -> Result<SequenceNumber, DriverError> {
        self.require_open()?;
        let mut state = self.shared.state.lock();
        if state.transfer_error {
            return Err(DriverError::Timeout);
        }
        let sequence = state.next_single;
        state.next_single = sequence.next();
        payload.clear();
        payload.extend_from_slice(&pattern_payload(state.width, state.height, sequence));
        Ok(sequence)
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.stop_streamer();
    }
}

impl SimulatorHandle {
    /// Deliver the pattern transfer for `sequence` on the calling thread.
    /// Returns false when no handler is registered.
    pub fn deliver(&self, sequence: SequenceNumber) -> bool {
        let (width, height) = self.resolution();
        self.shared
            .dispatch(&pattern_payload(width, height, sequence), sequence)
    }

    /// Deliver an arbitrary payload, e.g. a truncated one.
    pub fn deliver_payload(&self, payload: &[u8], sequence: SequenceNumber) -> bool {
        self.shared.dispatch(payload, sequence)
    }

    pub fn is_transferring(&self) -> bool {
        self.shared.handler.read().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    pub fn resolution(&self) -> (u32, u32) {
        let state = self.shared.state.lock();
        (state.width, state.height)
    }

    pub fn geometry(&self, stream: Stream) -> StreamGeometry {
        let (width, height) = self.resolution();
        StreamGeometry::for_stream(stream, width, height)
    }

    pub fn framerate_shutter(&self) -> (u32, u32) {
        let state = self.shared.state.lock();
        (state.framerate, state.shutter_fps)
    }

    pub fn is_compressed(&self) -> bool {
        self.shared.state.lock().compressed
    }

    pub fn set_device_count(&self, devices: usize) {
        self.shared.state.lock().devices = devices;
    }

    /// Make the next `count` open attempts fail.
    pub fn fail_opens(&self, count: usize) {
        self.shared.state.lock().open_failures = count;
    }

    pub fn fail_step(&self, step: Option<NegotiationStep>) {
        self.shared.state.lock().failing_step = step;
    }

    /// Make single transfers time out.
    pub fn fail_transfers(&self, fail: bool) {
        self.shared.state.lock().transfer_error = fail;
    }

    /// Sequence number the next single transfer will carry.
    pub fn set_next_single(&self, sequence: SequenceNumber) {
        self.shared.state.lock().next_single = sequence;
    }

    pub fn open_attempts(&self) -> usize {
        self.shared.opens.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> usize {
        self.shared.resets.load(Ordering::Relaxed)
    }
}
