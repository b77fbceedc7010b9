use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use strobe::capture::sim::frame_matches_pattern;
use strobe::capture::{
    FrameDecoder, Observation, QuantTable, RawLumaDecoder, SimulatedCamera, SimulatorHandle,
    StreamGeometry,
};
use strobe::error::{DecodeError, DriverError, NegotiationStep};
use strobe::pipeline::FrameListener;
use strobe::{CaptureError, CaptureSession, FrameCursor, SequenceNumber, SessionState};

fn session(width: u32, height: u32) -> (CaptureSession, SimulatorHandle) {
    let camera = SimulatedCamera::new(width, height);
    let sim = camera.handle();
    let session = CaptureSession::new(Box::new(camera));
    session.set_resolution(width, height).unwrap();
    (session, sim)
}

fn deliver_range(sim: &SimulatorHandle, sequences: std::ops::Range<u32>) {
    for n in sequences {
        assert!(sim.deliver(SequenceNumber(n)));
    }
}

#[test]
fn reference_resolution_pads_stride_and_disables_proxy() {
    let camera = SimulatedCamera::new(1246, 800);
    let sim = camera.handle();
    let session = CaptureSession::new(Box::new(camera));
    session.open().unwrap();
    sim.deliver(SequenceNumber(1));

    let frame = session.read().unwrap();
    assert_eq!(
        frame.geometry(),
        StreamGeometry {
            width: 1246,
            height: 800,
            stride: 1248,
        }
    );
    assert_eq!(frame.data.len(), 1248 * 800);
    assert!(frame_matches_pattern(&frame, 1246, 800));
    assert!(session.read_proxy().is_none());
}

#[test]
fn both_streams_track_the_last_transfer() {
    let (session, sim) = session(100, 60);
    session.set_frame_sample_rate(1, 1);
    session.open().unwrap();
    deliver_range(&sim, 100..110);

    let full = session.read().unwrap();
    let proxy = session.read_proxy().unwrap();
    assert_eq!(full.sequence(), SequenceNumber(109));
    assert_eq!(proxy.sequence(), SequenceNumber(109));
    assert_eq!(proxy.geometry(), StreamGeometry::proxy(100, 60));
    assert!(frame_matches_pattern(&proxy, 100, 60));
    assert_eq!(session.full_sequence_number(), Some(SequenceNumber(109)));
    assert_eq!(session.proxy_sequence_number(), Some(SequenceNumber(109)));
}

#[test]
fn repeated_reads_without_publish_are_identical() {
    let (session, sim) = session(32, 16);
    session.open().unwrap();
    sim.deliver(SequenceNumber(5));

    let a = session.read().unwrap();
    let b = session.read().unwrap();
    assert_eq!(a.sequence(), b.sequence());
    assert_eq!(a.data, b.data);
}

#[test]
fn zero_divisor_disables_stream_until_reconfigured() {
    let (session, sim) = session(32, 16);
    session.set_frame_sample_rate(1, 1);
    session.open().unwrap();
    sim.deliver(SequenceNumber(1));
    assert!(session.read_proxy().is_some());

    session.set_frame_sample_rate(1, 0);
    assert!(session.read_proxy().is_none());
    sim.deliver(SequenceNumber(2));
    assert!(session.read_proxy().is_none());
    assert_eq!(session.read().unwrap().sequence(), SequenceNumber(2));

    session.set_frame_sample_rate(1, 1);
    sim.deliver(SequenceNumber(3));
    assert_eq!(session.read_proxy().unwrap().sequence(), SequenceNumber(3));
}

#[test]
fn divisor_skips_intermediate_transfers() {
    let (session, sim) = session(16, 16);
    session.set_frame_sample_rate(3, 0);
    session.open().unwrap();

    // Cycles 0 and 3 decode.
    deliver_range(&sim, 10..13);
    assert_eq!(session.read().unwrap().sequence(), SequenceNumber(10));
    sim.deliver(SequenceNumber(13));
    assert_eq!(session.read().unwrap().sequence(), SequenceNumber(13));
}

#[test]
fn cursor_reports_missed_frames_and_repeats() {
    let (session, sim) = session(16, 8);
    session.open().unwrap();
    let mut cursor = FrameCursor::new();

    sim.deliver(SequenceNumber(5));
    let seq = session.read().unwrap().sequence();
    assert_eq!(cursor.observe(seq), Observation::New { missed: 0 });
    let seq = session.read().unwrap().sequence();
    assert_eq!(cursor.observe(seq), Observation::Repeat);

    sim.deliver(SequenceNumber(9));
    let seq = session.read().unwrap().sequence();
    assert_eq!(cursor.observe(seq), Observation::New { missed: 3 });
    assert_eq!(cursor.missed_total(), 3);
    assert_eq!(cursor.seen(), 2);
}

/// Raw luma decoding that announces each full decode and then stalls.
struct StallingDecoder {
    started: flume::Sender<SequenceNumber>,
    stall: Duration,
}

impl FrameDecoder for StallingDecoder {
    fn decode_full(
        &self,
        payload: &[u8],
        target: &mut [u8],
        geometry: StreamGeometry,
        quant: &QuantTable,
        threads: usize,
    ) -> Result<(), DecodeError> {
        let _ = self.started.send(SequenceNumber(0));
        std::thread::sleep(self.stall);
        RawLumaDecoder.decode_full(payload, target, geometry, quant, threads)
    }

    fn decode_proxy(
        &self,
        payload: &[u8],
        target: &mut [u8],
        source: StreamGeometry,
        quant: &QuantTable,
    ) -> Result<(), DecodeError> {
        RawLumaDecoder.decode_proxy(payload, target, source, quant)
    }
}

#[test]
fn pause_during_in_flight_decode_then_resume() {
    let camera = SimulatedCamera::new(64, 32);
    let sim = camera.handle();
    let (started_tx, started_rx) = flume::unbounded();
    let decoder = StallingDecoder {
        started: started_tx,
        stall: Duration::from_millis(100),
    };
    let session = Arc::new(CaptureSession::with_decoder(Box::new(camera), Box::new(decoder)));
    session.set_resolution(64, 32).unwrap();
    session.open().unwrap();

    let producer = {
        let sim = sim.clone();
        std::thread::spawn(move || sim.deliver(SequenceNumber(1)))
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    session.pause().unwrap();
    assert!(producer.join().unwrap());
    assert_eq!(session.state(), SessionState::Paused);
    assert!(session.read().is_none());

    session.resume().unwrap();
    if let Some(frame) = session.read() {
        assert!(frame_matches_pattern(&frame, 64, 32));
    }
    sim.deliver(SequenceNumber(2));
    let frame = session.read().unwrap();
    assert_eq!(frame.sequence(), SequenceNumber(2));
    assert!(frame_matches_pattern(&frame, 64, 32));
}

#[test]
fn single_thread_reads_pull_in_order() {
    let (session, sim) = session(24, 16);
    session.set_single_thread_mode(true).unwrap();
    session.set_frame_sample_rate(1, 1);
    sim.set_next_single(SequenceNumber(50));
    session.open().unwrap();
    assert!(!sim.is_transferring());

    let mut last = SequenceNumber(0);
    for i in 0..10 {
        let frame = if i % 2 == 0 {
            session.read().unwrap()
        } else {
            session.read_proxy().unwrap()
        };
        assert!(frame.sequence() >= last);
        assert!(frame_matches_pattern(&frame, 24, 16));
        last = frame.sequence();
    }
}

#[test]
fn single_thread_transfer_failure_is_not_fatal() {
    let (session, sim) = session(8, 8);
    session.set_single_thread_mode(true).unwrap();
    session.open().unwrap();

    sim.fail_transfers(true);
    assert!(session.read().is_none());
    assert!(session.last_error().contains("single transfer"));
    assert_eq!(session.state(), SessionState::Open);

    sim.fail_transfers(false);
    assert!(session.read().is_some());
}

#[test]
fn negotiation_failure_unwinds_to_closed() {
    let (session, sim) = session(16, 16);
    sim.fail_step(Some(NegotiationStep::Quantization));

    let err = session.open().unwrap_err();
    assert!(matches!(
        err,
        CaptureError::Negotiation {
            step: NegotiationStep::Quantization,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!sim.is_open());
    assert!(!sim.is_transferring());
    assert!(session.last_error().contains("query quantization"));

    sim.fail_step(None);
    session.open().unwrap();
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn missing_camera_fails_detection() {
    let (session, sim) = session(16, 16);
    sim.set_device_count(0);
    assert!(matches!(
        session.open(),
        Err(CaptureError::Negotiation {
            step: NegotiationStep::Detect,
            source: DriverError::NoDevice,
        })
    ));
    assert_eq!(sim.open_attempts(), 0);
}

#[test]
fn open_resets_and_retries_exactly_once() {
    let (session, sim) = session(16, 16);
    sim.fail_opens(1);
    session.open().unwrap();
    assert_eq!((sim.open_attempts(), sim.resets()), (2, 1));
    session.close().unwrap();

    let (session, sim) = self::session(16, 16);
    sim.fail_opens(2);
    assert!(matches!(
        session.open(),
        Err(CaptureError::Negotiation {
            step: NegotiationStep::Open,
            ..
        })
    ));
    assert_eq!((sim.open_attempts(), sim.resets()), (2, 1));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn reopen_closes_first() {
    let (session, sim) = session(16, 16);
    session.open().unwrap();
    sim.deliver(SequenceNumber(4));
    session.open().unwrap();
    assert!(session.read().is_none());
    assert!(sim.is_transferring());
}

#[derive(Default)]
struct Collector {
    frames: Mutex<Vec<(SequenceNumber, StreamGeometry, u8)>>,
}

impl FrameListener for Collector {
    fn on_frame_ready(&self, image: &[u8], geometry: StreamGeometry, sequence: SequenceNumber) {
        self.frames.lock().push((sequence, geometry, image[1]));
    }
}

#[test]
fn listener_receives_every_transfer_and_excludes_pull_reads() {
    let (session, sim) = session(16, 8);
    session.set_frame_sample_rate(2, 0);
    session.open().unwrap();

    let collector = Arc::new(Collector::default());
    session.set_listener(Some(collector.clone()));
    deliver_range(&sim, 1..4);
    assert!(session.read().is_none());

    let frames = collector.frames.lock().clone();
    let sequences: Vec<u32> = frames.iter().map(|(s, _, _)| s.0).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(frames
        .iter()
        .all(|(_, g, _)| *g == StreamGeometry::full(16, 8)));
    assert_eq!(
        frames[0].2,
        strobe::capture::sim::pattern_value(1, 0, SequenceNumber(1))
    );

    session.set_listener(None);
    // Gate counter did not advance while the listener was registered.
    sim.deliver(SequenceNumber(4));
    assert_eq!(session.read().unwrap().sequence(), SequenceNumber(4));
}

#[test]
fn errors_are_reported_when_not_open() {
    let (session, _sim) = session(8, 8);
    assert!(matches!(session.resume(), Err(CaptureError::DeviceNotOpen)));
    session.pause().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.last_error().is_empty());
}

#[test]
fn failed_resolution_change_closes_the_session() {
    let (session, sim) = session(16, 16);
    session.open().unwrap();
    sim.fail_step(Some(NegotiationStep::Resolution));

    assert!(matches!(
        session.set_resolution(32, 32),
        Err(CaptureError::Negotiation {
            step: NegotiationStep::Resolution,
            ..
        })
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!sim.is_open());
    assert!(!sim.is_transferring());
    assert!(session.last_error().contains("set resolution"));
}

#[test]
fn listener_excludes_single_thread_reads() {
    let (session, _sim) = session(16, 8);
    session.set_single_thread_mode(true).unwrap();
    session.set_frame_sample_rate(1, 1);
    session.open().unwrap();

    let collector = Arc::new(Collector::default());
    session.set_listener(Some(collector.clone()));
    assert!(session.read().is_none());
    assert!(session.read_proxy().is_none());
    assert!(collector.frames.lock().is_empty());

    session.set_listener(None);
    assert!(session.read().is_some());
}

#[test]
fn framerate_and_shutter_apply_to_open_device() {
    let (session, sim) = session(16, 16);
    session.open().unwrap();

    session.set_framerate_shutter(500, 4000).unwrap();
    assert_eq!(sim.framerate_shutter(), (500, 4000));

    sim.fail_step(Some(NegotiationStep::FramerateShutter));
    assert!(matches!(
        session.set_framerate_shutter(250, 1000),
        Err(CaptureError::Negotiation {
            step: NegotiationStep::FramerateShutter,
            ..
        })
    ));
    assert_eq!(sim.framerate_shutter(), (500, 4000));
    assert_eq!(session.state(), SessionState::Open);

    sim.fail_step(None);
    session.close().unwrap();
    session.set_framerate_shutter(120, 240).unwrap();
    session.open().unwrap();
    assert_eq!(sim.framerate_shutter(), (120, 240));
}
