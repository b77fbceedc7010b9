//! Capture session: camera lifecycle and the transfer → decode → publish path

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::gate::{SampleRateGate, SampleRates};
use super::pool::{DirectSlot, FramePool};
use crate::capture::decoder::{decoder_for, FrameDecoder, QuantTable};
use crate::capture::device::{CameraDriver, DeviceId, TransferHandler};
use crate::capture::frame::{Frame, SequenceNumber, Stream, StreamGeometry};
use crate::error::{CaptureError, DriverError, NegotiationStep, Result};
use crate::{CaptureConfig, PipelineConfig};

/// Lifecycle state of a [`CaptureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    /// Device handle held, buffers released, no transfers.
    Paused,
}

/// Push-style consumer of full-resolution frames.
///
/// While registered, every transfer is decoded straight into a buffer owned
/// by the session and handed over on the driver's thread; sampling and
/// publication are bypassed and `read`/`read_proxy` return nothing.
pub trait FrameListener: Send + Sync {
    fn on_frame_ready(&self, image: &[u8], geometry: StreamGeometry, sequence: SequenceNumber);
}

/// Parameters applied on the next open.
#[derive(Debug, Clone)]
struct Settings {
    device: DeviceId,
    width: u32,
    height: u32,
    framerate: u32,
    shutter_fps: u32,
    single_thread: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            device: capture.device_index,
            width: capture.width,
            height: capture.height,
            framerate: capture.framerate,
            shutter_fps: capture.shutter_fps,
            single_thread: false,
        }
    }
}

/// Buffers of one open period in multithread mode.
struct Pipeline {
    pool: FramePool,
    source: StreamGeometry,
    quant: QuantTable,
    /// Decode target for the listener hand-off.
    listener_image: Mutex<Vec<u8>>,
}

impl Pipeline {
    fn new(width: u32, height: u32, quant: QuantTable) -> Self {
        let source = StreamGeometry::full(width, height);
        Self {
            pool: FramePool::new(width, height),
            source,
            quant,
            listener_image: Mutex::new(vec![0; source.byte_len()]),
        }
    }
}

/// Buffers of one open period in single-thread mode.
struct DirectPipeline {
    full: DirectSlot,
    proxy: DirectSlot,
    source: StreamGeometry,
    quant: QuantTable,
}

impl DirectPipeline {
    fn new(width: u32, height: u32, quant: QuantTable) -> Self {
        Self {
            full: DirectSlot::new(Stream::Full, StreamGeometry::full(width, height)),
            proxy: DirectSlot::new(Stream::Proxy, StreamGeometry::proxy(width, height)),
            source: StreamGeometry::full(width, height),
            quant,
        }
    }
}

/// Control-plane state, serialized behind one lock.
struct Control {
    driver: Box<dyn CameraDriver>,
    state: SessionState,
    settings: Settings,
    transferring: bool,
    direct: Option<DirectPipeline>,
    /// Single-transfer payload buffer.
    payload: Vec<u8>,
}

/// State shared with the driver's transfer thread.
struct Shared {
    gate: SampleRateGate,
    decoder: Box<dyn FrameDecoder>,
    decode_threads: AtomicUsize,
    single_thread: AtomicBool,
    pipeline: ArcSwapOption<Pipeline>,
    listener: RwLock<Option<Arc<dyn FrameListener>>>,
    last_error: Mutex<String>,
    read_sequence: Mutex<[Option<SequenceNumber>; 2]>,
}

impl Shared {
    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        *self.last_error.lock() = message;
    }

    fn record_read(&self, stream: Stream, sequence: SequenceNumber) {
        self.read_sequence.lock()[stream.index()] = Some(sequence);
    }

    fn threads(&self) -> usize {
        self.decode_threads.load(Ordering::Relaxed)
    }

    fn on_transfer(&self, pipeline: &Pipeline, payload: &[u8], sequence: SequenceNumber) {
        metrics::counter!("strobe_transfers").increment(1);

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            self.hand_off(listener.as_ref(), pipeline, payload, sequence);
            return;
        }

        let decision = self.gate.next_cycle();
        for stream in Stream::ALL {
            if decision.decodes(stream) {
                self.decode_and_publish(pipeline, stream, payload, sequence);
            }
        }
    }

    fn decode_and_publish(
        &self,
        pipeline: &Pipeline,
        stream: Stream,
        payload: &[u8],
        sequence: SequenceNumber,
    ) {
        let slots = pipeline.pool.slots(stream);
        let mut target = slots.acquire_decode_target();
        let started = Instant::now();
        let result = match stream {
            Stream::Full => self.decoder.decode_full(
                payload,
                target.buffer(),
                pipeline.source,
                &pipeline.quant,
                self.threads(),
            ),
            Stream::Proxy => {
                self.decoder
                    .decode_proxy(payload, target.buffer(), pipeline.source, &pipeline.quant)
            }
        };
        metrics::histogram!("strobe_decode_time_us", "stream" => stream.as_str())
            .record(started.elapsed().as_micros() as f64);

        match result {
            Ok(()) => {
                target.publish(sequence);
                metrics::counter!("strobe_frames_decoded", "stream" => stream.as_str())
                    .increment(1);
                debug!(%stream, %sequence, "Frame published");
            }
            Err(e) => {
                drop(target);
                metrics::counter!("strobe_decode_failures", "stream" => stream.as_str())
                    .increment(1);
                self.record_error(format!("{stream} decode of {sequence} failed: {e}"));
            }
        }
    }

    fn hand_off(
        &self,
        listener: &dyn FrameListener,
        pipeline: &Pipeline,
        payload: &[u8],
        sequence: SequenceNumber,
    ) {
        let mut image = pipeline.listener_image.lock();
        match self.decoder.decode_full(
            payload,
            &mut image,
            pipeline.source,
            &pipeline.quant,
            self.threads(),
        ) {
            Ok(()) => listener.on_frame_ready(&image, pipeline.source, sequence),
            Err(e) => self.record_error(format!("listener decode of {sequence} failed: {e}")),
        }
    }
}

/// The handler registered with the driver for one open period.
///
/// Holds its own reference to the pipeline, so buffers it may still be
/// writing survive a concurrent pause or close.
struct TransferSink {
    shared: Arc<Shared>,
    pipeline: Arc<Pipeline>,
}

impl TransferHandler for TransferSink {
    fn on_transfer_received(&self, payload: &[u8], sequence: SequenceNumber) {
        self.shared.on_transfer(&self.pipeline, payload, sequence);
    }
}

/// One camera, its buffers and its readers.
///
/// Every method takes `&self`; the session is meant to be shared across
/// threads behind an `Arc`.
pub struct CaptureSession {
    control: Mutex<Control>,
    shared: Arc<Shared>,
}

impl CaptureSession {
    /// Session decoding with the driver's native transfer format.
    pub fn new(driver: Box<dyn CameraDriver>) -> Self {
        let decoder = decoder_for(driver.transfer_format());
        Self::with_decoder(driver, decoder)
    }

    pub fn with_decoder(driver: Box<dyn CameraDriver>, decoder: Box<dyn FrameDecoder>) -> Self {
        Self {
            control: Mutex::new(Control {
                driver,
                state: SessionState::Closed,
                settings: Settings::default(),
                transferring: false,
                direct: None,
                payload: Vec::new(),
            }),
            shared: Arc::new(Shared {
                gate: SampleRateGate::default(),
                decoder,
                decode_threads: AtomicUsize::new(PipelineConfig::default().decode_threads),
                single_thread: AtomicBool::new(false),
                pipeline: ArcSwapOption::empty(),
                listener: RwLock::new(None),
                last_error: Mutex::new(String::new()),
                read_sequence: Mutex::new([None; 2]),
            }),
        }
    }

    /// Closed session configured from the capture and pipeline sections.
    pub fn from_config(
        driver: Box<dyn CameraDriver>,
        capture: &CaptureConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        let session = Self::new(driver);
        {
            let mut control = session.control.lock();
            control.settings = Settings {
                device: capture.device_index,
                width: capture.width,
                height: capture.height,
                framerate: capture.framerate,
                shutter_fps: capture.shutter_fps,
                single_thread: pipeline.single_thread,
            };
        }
        session
            .shared
            .single_thread
            .store(pipeline.single_thread, Ordering::Relaxed);
        session.set_frame_sample_rate(pipeline.sample_rates.full, pipeline.sample_rates.proxy);
        session.set_decode_thread_count(pipeline.decode_threads);
        session
    }

    // ---- lifecycle ------------------------------------------------------

    /// Open the configured device and start streaming.
    ///
    /// An already open session is closed first. On failure everything
    /// acquired so far is released and the session is `Closed`.
    #[instrument(skip(self))]
    pub fn open(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.state != SessionState::Closed {
            self.close_locked(&mut control)?;
        }

        match self.negotiate(&mut control) {
            Ok(()) => {
                info!(
                    width = control.settings.width,
                    height = control.settings.height,
                    single_thread = control.settings.single_thread,
                    "Capture session open"
                );
                Ok(())
            }
            Err(e) => Err(self.unwind(&mut control, e)),
        }
    }

    /// Stop transfers and release the frame buffers, keeping the device.
    #[instrument(skip(self))]
    pub fn pause(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.state != SessionState::Open {
            return Ok(());
        }
        let result = self.release_buffers(&mut control);
        control.state = SessionState::Paused;
        info!("Capture session paused");
        result
    }

    /// Reallocate buffers and restart transfers after [`pause`](Self::pause).
    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<()> {
        let mut control = self.control.lock();
        match control.state {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(self.not_open()),
            SessionState::Paused => match self.setup_buffers(&mut control) {
                Ok(()) => {
                    info!("Capture session resumed");
                    Ok(())
                }
                Err(e) => Err(self.unwind(&mut control, e)),
            },
        }
    }

    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.close_locked(&mut control)
    }

    pub fn state(&self) -> SessionState {
        self.control.lock().state
    }

    pub fn is_opened(&self) -> bool {
        self.state() != SessionState::Closed
    }

    // ---- configuration --------------------------------------------------

    /// Decode the full stream on every `full`-th transfer and the proxy on
    /// every `proxy`-th; 0 disables a stream.
    pub fn set_frame_sample_rate(&self, full: u32, proxy: u32) {
        self.shared.gate.set_rates(SampleRates { full, proxy });
        debug!(full, proxy, "Sample rates updated");
    }

    pub fn sample_rates(&self) -> SampleRates {
        self.shared.gate.rates()
    }

    pub fn set_decode_thread_count(&self, threads: usize) {
        self.shared
            .decode_threads
            .store(threads.max(1), Ordering::Relaxed);
    }

    pub fn decode_thread_count(&self) -> usize {
        self.shared.threads()
    }

    /// Switch between callback-driven and synchronous pull transfers.
    /// Only allowed while closed or paused.
    pub fn set_single_thread_mode(&self, single_thread: bool) -> Result<()> {
        let mut control = self.control.lock();
        if control.state == SessionState::Open {
            return Err(self.invalid("single-thread mode can only change while closed or paused"));
        }
        control.settings.single_thread = single_thread;
        self.shared
            .single_thread
            .store(single_thread, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_single_thread(&self) -> bool {
        self.shared.single_thread.load(Ordering::Relaxed)
    }

    /// Register (or with `None`, remove) the push listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn FrameListener>>) {
        *self.shared.listener.write() = listener;
    }

    pub fn has_listener(&self) -> bool {
        self.shared.listener.read().is_some()
    }

    /// Change the capture resolution.
    ///
    /// Stored for the next open while closed. While open, streaming is
    /// stopped, the device reconfigured and buffers rebuilt for the new size.
    #[instrument(skip(self))]
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut control = self.control.lock();
        if control.state == SessionState::Closed {
            control.settings.width = width;
            control.settings.height = height;
            return Ok(());
        }

        let was_open = control.state == SessionState::Open;
        if was_open {
            let released = self.release_buffers(&mut control);
            control.state = SessionState::Paused;
            if let Err(e) = released {
                return Err(self.unwind(&mut control, e));
            }
        }
        if let Err(e) = control.driver.set_resolution(width, height) {
            let e = CaptureError::negotiation(NegotiationStep::Resolution)(e);
            return Err(self.unwind(&mut control, e));
        }
        control.settings.width = width;
        control.settings.height = height;
        if was_open {
            if let Err(e) = self.setup_buffers(&mut control) {
                return Err(self.unwind(&mut control, e));
            }
        }
        Ok(())
    }

    /// Resolution of the open session, or the one the next open requests.
    pub fn resolution(&self) -> (u32, u32) {
        let control = self.control.lock();
        (control.settings.width, control.settings.height)
    }

    pub fn set_framerate_shutter(&self, framerate: u32, shutter_fps: u32) -> Result<()> {
        let mut control = self.control.lock();
        if control.state != SessionState::Closed {
            if let Err(e) = control.driver.set_framerate_shutter(framerate, shutter_fps) {
                let e = CaptureError::negotiation(NegotiationStep::FramerateShutter)(e);
                self.shared.record_error(e.to_string());
                return Err(e);
            }
        }
        control.settings.framerate = framerate;
        control.settings.shutter_fps = shutter_fps;
        Ok(())
    }

    // ---- readers --------------------------------------------------------

    /// Latest full-resolution frame, or `None` if the stream is disabled,
    /// the session is not open, a listener is registered, or nothing has
    /// been decoded yet. Never waits for a new frame.
    pub fn read(&self) -> Option<Frame> {
        self.read_stream(Stream::Full)
    }

    /// Latest proxy frame; see [`read`](Self::read).
    pub fn read_proxy(&self) -> Option<Frame> {
        self.read_stream(Stream::Proxy)
    }

    /// Sequence number of the last full frame returned by `read`.
    pub fn full_sequence_number(&self) -> Option<SequenceNumber> {
        self.shared.read_sequence.lock()[Stream::Full.index()]
    }

    /// Sequence number of the last proxy frame returned by `read_proxy`.
    pub fn proxy_sequence_number(&self) -> Option<SequenceNumber> {
        self.shared.read_sequence.lock()[Stream::Proxy.index()]
    }

    /// Most recent failure, never cleared.
    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    fn read_stream(&self, stream: Stream) -> Option<Frame> {
        if !self.shared.gate.is_enabled(stream) {
            return None;
        }
        if self.has_listener() {
            return None;
        }
        if self.shared.single_thread.load(Ordering::Relaxed) {
            return self.pull_single(stream);
        }

        let pipeline = self.shared.pipeline.load_full()?;
        let frame = pipeline.pool.slots(stream).copy_current()?;
        self.shared.record_read(stream, frame.sequence());
        Some(frame)
    }

    fn pull_single(&self, stream: Stream) -> Option<Frame> {
        let mut guard = self.control.lock();
        let control = &mut *guard;
        if control.state != SessionState::Open {
            return None;
        }
        let direct = control.direct.as_mut()?;

        let sequence = match control.driver.single_transfer(&mut control.payload) {
            Ok(sequence) => sequence,
            Err(e) => {
                self.shared.record_error(format!("single transfer failed: {e}"));
                return None;
            }
        };

        let decoder = self.shared.decoder.as_ref();
        let payload = control.payload.as_slice();
        let (source, quant) = (direct.source, &direct.quant);
        let decoded = match stream {
            Stream::Full => direct.full.decode_with(sequence, |target, _| {
                decoder.decode_full(payload, target, source, quant, self.shared.threads())
            }),
            Stream::Proxy => direct.proxy.decode_with(sequence, |target, _| {
                decoder.decode_proxy(payload, target, source, quant)
            }),
        };

        match decoded {
            Ok(frame) => {
                self.shared.record_read(stream, sequence);
                Some(frame)
            }
            Err(e) => {
                self.shared
                    .record_error(format!("{stream} decode of {sequence} failed: {e}"));
                None
            }
        }
    }

    // ---- internals ------------------------------------------------------

    fn not_open(&self) -> CaptureError {
        self.shared.record_error(CaptureError::DeviceNotOpen.to_string());
        CaptureError::DeviceNotOpen
    }

    fn invalid(&self, reason: &'static str) -> CaptureError {
        self.shared.record_error(reason);
        CaptureError::InvalidState(reason)
    }

    /// Closed → device open and configured → buffers allocated.
    fn negotiate(&self, control: &mut Control) -> Result<()> {
        let step = CaptureError::negotiation;
        let device = control.settings.device;

        let devices = control.driver.detect().map_err(step(NegotiationStep::Detect))?;
        if devices.is_empty() {
            return Err(step(NegotiationStep::Detect)(DriverError::NoDevice));
        }
        if device >= devices.len() {
            return Err(step(NegotiationStep::Detect)(DriverError::InvalidDevice {
                index: device,
                count: devices.len(),
            }));
        }

        if let Err(e) = control.driver.open_device(device) {
            warn!(device = %devices[device], "Open failed ({e}), resetting device and retrying");
            control
                .driver
                .reset_device(device)
                .map_err(step(NegotiationStep::Reset))?;
            control
                .driver
                .open_device(device)
                .map_err(step(NegotiationStep::Open))?;
        }
        // Device held from here on; unwinding must close it.
        control.state = SessionState::Paused;

        let Settings {
            width,
            height,
            framerate,
            shutter_fps,
            ..
        } = control.settings;
        control
            .driver
            .set_framerate_shutter(framerate, shutter_fps)
            .map_err(step(NegotiationStep::FramerateShutter))?;
        control
            .driver
            .set_resolution(width, height)
            .map_err(step(NegotiationStep::Resolution))?;
        control
            .driver
            .set_compressed_transfer()
            .map_err(step(NegotiationStep::TransferMode))?;

        self.setup_buffers(control)
    }

    /// Paused → Open: size buffers from the device and start transfers.
    fn setup_buffers(&self, control: &mut Control) -> Result<()> {
        let step = CaptureError::negotiation;
        let single_thread = control.settings.single_thread;

        let transfer_size = control
            .driver
            .transfer_size()
            .map_err(step(NegotiationStep::TransferSize))?;
        control.payload = Vec::with_capacity(transfer_size);
        if single_thread {
            control
                .driver
                .single_transfer(&mut control.payload)
                .map_err(step(NegotiationStep::PrimeTransfer))?;
        }

        let (width, height) = control
            .driver
            .resolution()
            .map_err(step(NegotiationStep::QueryResolution))?;
        let quant = control
            .driver
            .quantization()
            .map_err(step(NegotiationStep::Quantization))?;

        if single_thread {
            control.direct = Some(DirectPipeline::new(width, height, quant));
        } else {
            let pipeline = Arc::new(Pipeline::new(width, height, quant));
            let sink = Arc::new(TransferSink {
                shared: self.shared.clone(),
                pipeline: pipeline.clone(),
            });
            self.shared.pipeline.store(Some(pipeline));
            if let Err(e) = control.driver.begin_transfer(sink) {
                self.shared.pipeline.store(None);
                return Err(step(NegotiationStep::BeginTransfer)(e));
            }
            control.transferring = true;
        }

        control.settings.width = width;
        control.settings.height = height;
        control.state = SessionState::Open;
        debug!(width, height, transfer_size, "Frame buffers allocated");
        Ok(())
    }

    /// Stop transfers and drop this session's references to the buffers.
    ///
    /// Buffers are freed once the driver drops the handler; a transfer still
    /// running keeps writing into its own pipeline, never a reader's.
    fn release_buffers(&self, control: &mut Control) -> Result<()> {
        let mut result = Ok(());
        if control.transferring {
            control.transferring = false;
            if let Err(e) = control.driver.end_transfer() {
                self.shared.record_error(format!("end transfer failed: {e}"));
                result = Err(CaptureError::Transfer(e));
            }
        }
        self.shared.pipeline.store(None);
        control.direct = None;
        control.payload = Vec::new();
        result
    }

    fn close_locked(&self, control: &mut Control) -> Result<()> {
        if control.state == SessionState::Closed {
            return Ok(());
        }
        let released = self.release_buffers(control);
        let closed = control.driver.close_device();
        control.state = SessionState::Closed;
        info!("Capture session closed");

        if let Err(e) = closed {
            self.shared
                .record_error(format!("close device failed: {e}"));
            return Err(CaptureError::Transfer(e));
        }
        released
    }

    /// Record `error` and return the session to `Closed`.
    fn unwind(&self, control: &mut Control, error: CaptureError) -> CaptureError {
        error!("{error}");
        if control.state != SessionState::Closed {
            if let Err(e) = self.close_locked(control) {
                warn!("Cleanup after failed negotiation: {e}");
            }
        }
        // Set last so a cleanup failure does not mask the first failing step.
        *self.shared.last_error.lock() = error.to_string();
        error
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        if let Err(e) = self.close_locked(&mut control) {
            warn!("Closing session on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{frame_matches_pattern, SimulatedCamera, SimulatorHandle};

    fn open_session(width: u32, height: u32) -> (CaptureSession, SimulatorHandle) {
        let camera = SimulatedCamera::new(width, height);
        let handle = camera.handle();
        let session = CaptureSession::new(Box::new(camera));
        session.set_resolution(width, height).unwrap();
        session.open().unwrap();
        (session, handle)
    }

    #[test]
    fn closed_session_reads_nothing() {
        let session = CaptureSession::new(Box::new(SimulatedCamera::new(16, 16)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.read().is_none());
        assert!(session.read_proxy().is_none());
    }

    #[test]
    fn open_negotiates_and_registers_handler() {
        let (session, sim) = open_session(64, 48);
        assert_eq!(session.state(), SessionState::Open);
        assert!(sim.is_transferring());
        assert!(sim.is_compressed());
        assert_eq!(sim.framerate_shutter(), (1000, 2000));
        assert_eq!(session.resolution(), (64, 48));
    }

    #[test]
    fn nothing_published_before_first_transfer() {
        let (session, _sim) = open_session(16, 16);
        assert!(session.read().is_none());
        assert_eq!(session.full_sequence_number(), None);
    }

    #[test]
    fn transfer_is_decoded_and_published() {
        let (session, sim) = open_session(20, 10);
        assert!(sim.deliver(SequenceNumber(3)));

        let frame = session.read().unwrap();
        assert_eq!(frame.sequence(), SequenceNumber(3));
        assert_eq!(frame.geometry(), StreamGeometry::full(20, 10));
        assert!(frame_matches_pattern(&frame, 20, 10));
        assert_eq!(session.full_sequence_number(), Some(SequenceNumber(3)));
    }

    #[test]
    fn decode_failure_keeps_last_good_frame() {
        let (session, sim) = open_session(16, 8);
        sim.deliver(SequenceNumber(1));
        assert!(sim.deliver_payload(&[0; 5], SequenceNumber(2)));

        let frame = session.read().unwrap();
        assert_eq!(frame.sequence(), SequenceNumber(1));
        assert!(frame_matches_pattern(&frame, 16, 8));
        assert!(session.last_error().contains("decode"));

        sim.deliver(SequenceNumber(3));
        assert_eq!(session.read().unwrap().sequence(), SequenceNumber(3));
        // Not cleared by later successes.
        assert!(session.last_error().contains("decode"));
    }

    #[test]
    fn pause_releases_and_resume_restarts() {
        let (session, sim) = open_session(16, 8);
        sim.deliver(SequenceNumber(1));

        session.pause().unwrap();
        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        assert!(!sim.is_transferring());
        assert!(session.read().is_none());

        session.resume().unwrap();
        assert!(sim.is_transferring());
        assert!(session.read().is_none());
        sim.deliver(SequenceNumber(2));
        assert_eq!(session.read().unwrap().sequence(), SequenceNumber(2));
    }

    #[test]
    fn resume_while_closed_reports_not_open() {
        let session = CaptureSession::new(Box::new(SimulatedCamera::new(8, 8)));
        assert!(matches!(session.resume(), Err(CaptureError::DeviceNotOpen)));
        assert_eq!(session.last_error(), "device not open");
    }

    #[test]
    fn close_releases_device() {
        let (session, sim) = open_session(8, 8);
        session.close().unwrap();
        session.close().unwrap();
        assert!(!sim.is_open());
        assert!(!session.is_opened());
    }

    #[test]
    fn single_thread_mode_only_changes_when_not_open() {
        let (session, _sim) = open_session(8, 8);
        assert!(matches!(
            session.set_single_thread_mode(true),
            Err(CaptureError::InvalidState(_))
        ));
        session.pause().unwrap();
        session.set_single_thread_mode(true).unwrap();
        session.resume().unwrap();
        assert!(session.is_single_thread());
        assert!(session.read().is_some());
    }

    #[test]
    fn resolution_change_while_open_rebuilds_buffers() {
        let (session, sim) = open_session(16, 16);
        sim.deliver(SequenceNumber(1));

        session.set_resolution(40, 24).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.resolution(), (40, 24));
        assert!(session.read().is_none());

        sim.deliver(SequenceNumber(2));
        let frame = session.read().unwrap();
        assert_eq!((frame.meta.width, frame.meta.height), (40, 24));
        assert!(frame_matches_pattern(&frame, 40, 24));
    }

    #[test]
    fn decode_thread_count_is_at_least_one() {
        let session = CaptureSession::new(Box::new(SimulatedCamera::new(8, 8)));
        session.set_decode_thread_count(0);
        assert_eq!(session.decode_thread_count(), 1);
        session.set_decode_thread_count(12);
        assert_eq!(session.decode_thread_count(), 12);
    }
}
