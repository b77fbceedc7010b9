//! V4L2 camera driver streaming MJPEG through memory-mapped buffers

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder::QuantTable;
use super::device::{CameraDriver, DeviceId, TransferHandler};
use super::frame::{SequenceNumber, TransferFormat};
use crate::error::DriverError;
use crate::utils::{detect_capture_devices, FoundDevice};

const MJPEG: [u8; 4] = *b"MJPG";

/// Poll timeout of the streaming thread, bounding how long `end_transfer`
/// waits for a stalled camera.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

struct Streamer {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Camera behind a V4L2 capture node.
///
/// Continuous transfers run on a dedicated thread that owns its own handle
/// to the node and the mmap stream on it.
pub struct V4l2Driver {
    buffer_count: u32,
    devices: Vec<FoundDevice>,
    device: Option<(Device, String)>,
    streamer: Option<Streamer>,
    /// Frame counter for single transfers on drivers that leave
    /// `sequence` at zero.
    fallback_sequence: u32,
}

impl V4l2Driver {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
            devices: Vec::new(),
            device: None,
            streamer: None,
            fallback_sequence: 0,
        }
    }

    fn device(&self) -> Result<&Device, DriverError> {
        self.device
            .as_ref()
            .map(|(device, _)| device)
            .ok_or(DriverError::NotOpen)
    }

    fn path(&self) -> Result<String, DriverError> {
        self.device
            .as_ref()
            .map(|(_, path)| path.clone())
            .ok_or(DriverError::NotOpen)
    }

    fn stop_streamer(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.running.store(false, Ordering::Release);
            if streamer.thread.join().is_err() {
                warn!("V4L2 streaming thread panicked");
            }
        }
    }

    fn sequence_of(&mut self, reported: u32) -> SequenceNumber {
        self.fallback_sequence = self.fallback_sequence.wrapping_add(1);
        if reported == 0 {
            SequenceNumber(self.fallback_sequence)
        } else {
            SequenceNumber(reported)
        }
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new(4)
    }
}

fn stream_on(device: &Device, buffers: u32) -> io::Result<MmapStream<'_>> {
    let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, buffers)?;
    stream.set_timeout(DEQUEUE_TIMEOUT);
    Ok(stream)
}

fn run_stream(
    path: String,
    buffers: u32,
    handler: Arc<dyn TransferHandler>,
    running: Arc<AtomicBool>,
    ready: flume::Sender<Result<(), DriverError>>,
) {
    let device = match Device::with_path(&path) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut stream = match stream_on(&device, buffers) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut counter = 0u32;
    while running.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                counter = counter.wrapping_add(1);
                let sequence = if meta.sequence == 0 {
                    counter
                } else {
                    meta.sequence
                };
                let used = (meta.bytesused as usize).min(buf.len());
                handler.on_transfer_received(&buf[..used], SequenceNumber(sequence));
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(%path, "Dequeue failed: {}", e);
                std::thread::sleep(DEQUEUE_TIMEOUT);
            }
        }
    }
    debug!(%path, "Streaming thread stopped");
}

impl CameraDriver for V4l2Driver {
    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Mjpeg
    }

    fn detect(&mut self) -> Result<Vec<String>, DriverError> {
        self.devices = detect_capture_devices();
        Ok(self
            .devices
            .iter()
            .map(|d| format!("{} ({})", d.path, d.card))
            .collect())
    }

    #[instrument(skip(self))]
    fn open_device(&mut self, index: DeviceId) -> Result<(), DriverError> {
        let found = self
            .devices
            .get(index)
            .ok_or(DriverError::InvalidDevice {
                index,
                count: self.devices.len(),
            })?
            .clone();

        let device = Device::with_path(&found.path)?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DriverError::Rejected(format!(
                "{} does not support video capture",
                found.path
            )));
        }
        info!("Device: {} ({})", caps.card, caps.driver);
        self.device = Some((device, found.path));
        Ok(())
    }

    /// V4L2 has no device reset; drop any handle and let the retry reopen.
    fn reset_device(&mut self, _index: DeviceId) -> Result<(), DriverError> {
        self.stop_streamer();
        self.device = None;
        Ok(())
    }

    fn close_device(&mut self) -> Result<(), DriverError> {
        self.stop_streamer();
        self.device = None;
        Ok(())
    }

    fn set_framerate_shutter(
        &mut self,
        framerate: u32,
        shutter_fps: u32,
    ) -> Result<(), DriverError> {
        let device = self.device()?;
        if framerate > 0 {
            device.set_params(&Parameters::with_fps(framerate))?;
            debug!(framerate, "Frame rate set");
        }
        // Exposure is left to the camera's auto mode.
        debug!(shutter_fps, "Shutter request not applied on V4L2");
        Ok(())
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), DriverError> {
        let device = self.device()?;
        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(&MJPEG);
        let applied = device.set_format(&fmt)?;
        if (applied.width, applied.height) != (width, height) {
            warn!(
                "Requested {}x{}, device chose {}x{}",
                width, height, applied.width, applied.height
            );
        }
        Ok(())
    }

    fn resolution(&mut self) -> Result<(u32, u32), DriverError> {
        let fmt = self.device()?.format()?;
        Ok((fmt.width, fmt.height))
    }

    fn set_compressed_transfer(&mut self) -> Result<(), DriverError> {
        let device = self.device()?;
        let mut fmt = device.format()?;
        fmt.fourcc = FourCC::new(&MJPEG);
        let applied = device.set_format(&fmt)?;
        if applied.fourcc != FourCC::new(&MJPEG) {
            return Err(DriverError::Rejected(format!(
                "device streams {} instead of MJPG",
                applied.fourcc
            )));
        }
        Ok(())
    }

    fn transfer_size(&mut self) -> Result<usize, DriverError> {
        Ok(self.device()?.format()?.size as usize)
    }

    /// MJPEG payloads carry their own tables.
    fn quantization(&mut self) -> Result<QuantTable, DriverError> {
        self.device()?;
        Ok(QuantTable::default())
    }

    fn begin_transfer(&mut self, handler: Arc<dyn TransferHandler>) -> Result<(), DriverError> {
        if self.streamer.is_some() {
            return Err(DriverError::Busy);
        }
        let path = self.path()?;
        let buffers = self.buffer_count;
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = flume::bounded(1);

        let flag = running.clone();
        let thread = std::thread::Builder::new()
            .name("v4l2-transfer".into())
            .spawn(move || run_stream(path, buffers, handler, flag, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(buffers, "Capture stream started");
                self.streamer = Some(Streamer { running, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DriverError::Rejected("streaming thread exited".into()))
            }
        }
    }

    fn end_transfer(&mut self) -> Result<(), DriverError> {
        self.stop_streamer();
        Ok(())
    }

    fn single_transfer(&mut self, payload: &mut Vec<u8>) -> Result<SequenceNumber, DriverError> {
        let reported = {
            let device = self.device()?;
            let mut stream = stream_on(device, self.buffer_count)?;
            let (buf, meta) = stream.next().map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut => DriverError::Timeout,
                _ => DriverError::Io(e),
            })?;
            let used = (meta.bytesused as usize).min(buf.len());
            payload.clear();
            payload.extend_from_slice(&buf[..used]);
            meta.sequence
        };
        debug!(bytes = payload.len(), "Single transfer");
        Ok(self.sequence_of(reported))
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        self.stop_streamer();
    }
}
