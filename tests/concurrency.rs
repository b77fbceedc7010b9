use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strobe::capture::sim::frame_matches_pattern;
use strobe::capture::SimulatedCamera;
use strobe::{CaptureSession, FrameCursor, SessionState, Stream};

fn streaming_session(width: u32, height: u32, fps: u32) -> Arc<CaptureSession> {
    let camera = SimulatedCamera::new(width, height).with_frame_rate(fps);
    let session = CaptureSession::new(Box::new(camera));
    session.set_resolution(width, height).unwrap();
    session.set_frame_sample_rate(1, 1);
    session.set_decode_thread_count(2);
    Arc::new(session)
}

#[test]
fn concurrent_readers_never_see_torn_frames() {
    let session = streaming_session(96, 40, 2000);
    session.open().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let checked = Arc::new(AtomicU64::new(0));
    let readers: Vec<_> = (0..4)
        .map(|i| {
            let session = session.clone();
            let running = running.clone();
            let checked = checked.clone();
            let stream = if i % 2 == 0 { Stream::Full } else { Stream::Proxy };
            std::thread::spawn(move || {
                let mut cursor = FrameCursor::new();
                while running.load(Ordering::Relaxed) {
                    let frame = match stream {
                        Stream::Full => session.read(),
                        Stream::Proxy => session.read_proxy(),
                    };
                    if let Some(frame) = frame {
                        assert!(
                            frame_matches_pattern(&frame, 96, 40),
                            "{stream} frame {} is torn",
                            frame.sequence()
                        );
                        cursor.observe(frame.sequence());
                        checked.fetch_add(1, Ordering::Relaxed);
                    }
                }
                cursor
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(300));
    running.store(false, Ordering::Relaxed);
    for reader in readers {
        let cursor = reader.join().unwrap();
        assert!(cursor.seen() > 0);
    }
    assert!(checked.load(Ordering::Relaxed) > 0);
    session.close().unwrap();
}

#[test]
fn held_frames_stay_stable_while_producer_runs() {
    let session = streaming_session(64, 32, 2000);
    session.open().unwrap();

    let first = loop {
        if let Some(frame) = session.read() {
            break frame;
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    let copy = first.data.to_vec();
    std::thread::sleep(Duration::from_millis(50));
    for _ in 0..100 {
        let _ = session.read();
    }
    assert_eq!(first.data.as_ref(), copy.as_slice());
    session.close().unwrap();
}

#[test]
fn lifecycle_churn_under_readers() {
    let session = streaming_session(48, 24, 1000);
    session.open().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let reader = {
        let session = session.clone();
        let running = running.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                if let Some(frame) = session.read() {
                    assert!(frame_matches_pattern(&frame, 48, 24));
                }
                if let Some(frame) = session.read_proxy() {
                    assert!(frame_matches_pattern(&frame, 48, 24));
                }
            }
        })
    };

    for i in 0..10 {
        session.pause().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        session.resume().unwrap();
        if i % 3 == 0 {
            session.set_frame_sample_rate(1 + i % 2, i % 2);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    running.store(false, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(session.state(), SessionState::Open);
    session.close().unwrap();
    assert!(session.read().is_none());
}
