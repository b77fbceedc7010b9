//! Strobe capture demo: opens a camera and reports per-stream throughput

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::WrapErr, Result};
use flume::{bounded, Sender};
use tracing::{error, info, warn};

use strobe::capture::{CameraDriver, DriverRuntime, Observation, SimulatedCamera, StreamGeometry};
use strobe::pipeline::FrameListener;
use strobe::{CaptureSession, Config, DriverKind, FrameCursor, SequenceNumber, Stream};

#[derive(Default)]
struct StreamStats {
    frames: AtomicU64,
    repeats: AtomicU64,
    missed: AtomicU64,
}

impl StreamStats {
    fn record(&self, observation: Observation) {
        match observation {
            Observation::Repeat => {
                self.repeats.fetch_add(1, Ordering::Relaxed);
            }
            Observation::New { missed } => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                self.missed.fetch_add(u64::from(missed), Ordering::Relaxed);
            }
        }
    }

    /// (frames, repeats, missed) since the last call.
    fn take(&self) -> (u64, u64, u64) {
        (
            self.frames.swap(0, Ordering::Relaxed),
            self.repeats.swap(0, Ordering::Relaxed),
            self.missed.swap(0, Ordering::Relaxed),
        )
    }
}

/// Forwards listener frames to an async consumer, dropping when it lags.
struct ChannelListener {
    tx: Sender<(SequenceNumber, StreamGeometry)>,
}

impl FrameListener for ChannelListener {
    fn on_frame_ready(&self, _image: &[u8], geometry: StreamGeometry, sequence: SequenceNumber) {
        let _ = self.tx.try_send((sequence, geometry));
    }
}

fn build_driver(config: &Config) -> Result<Box<dyn CameraDriver>> {
    match config.capture.driver {
        DriverKind::Simulated => Ok(Box::new(
            SimulatedCamera::new(config.capture.width, config.capture.height)
                .with_frame_rate(config.capture.simulated_fps),
        )),
        #[cfg(feature = "v4l2")]
        DriverKind::V4l2 => Ok(Box::new(strobe::capture::V4l2Driver::default())),
        #[cfg(not(feature = "v4l2"))]
        DriverKind::V4l2 => Err(color_eyre::eyre::eyre!("built without the v4l2 feature")),
    }
}

fn spawn_reader(
    session: Arc<CaptureSession>,
    stream: Stream,
    stats: Arc<StreamStats>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut cursor = FrameCursor::new();
        while running.load(Ordering::Relaxed) {
            let frame = match stream {
                Stream::Full => session.read(),
                Stream::Proxy => session.read_proxy(),
            };
            match frame {
                Some(frame) => stats.record(cursor.observe(frame.sequence())),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        info!(
            %stream,
            frames = cursor.seen(),
            missed = cursor.missed_total(),
            "Reader finished"
        );
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("strobe=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Strobe launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref()).wrap_err("loading configuration")?;
    strobe::CONFIG.store(Arc::new(config.clone()));

    // Neither bundled driver has a library to initialize; the guard still
    // brackets the session's lifetime.
    let _runtime = DriverRuntime::acquire(|| Ok(()))?;
    let driver = build_driver(&config)?;
    let session = Arc::new(CaptureSession::from_config(driver, &config.capture, &config.pipeline));
    session.open().wrap_err("opening camera")?;
    let (width, height) = session.resolution();
    info!(width, height, "Capturing");

    let running = Arc::new(AtomicBool::new(true));
    let stats = [Arc::new(StreamStats::default()), Arc::new(StreamStats::default())];
    let mut workers = Vec::new();

    if config.demo.push_mode {
        let (tx, rx) = bounded(config.demo.channel_capacity.max(1));
        session.set_listener(Some(Arc::new(ChannelListener { tx })));
        let full = stats[Stream::Full.index()].clone();
        workers.push(tokio::spawn(async move {
            let mut cursor = FrameCursor::new();
            while let Ok((sequence, _geometry)) = rx.recv_async().await {
                full.record(cursor.observe(sequence));
            }
        }));
    } else {
        for i in 0..config.demo.readers.max(1) {
            let stream = if i % 2 == 0 { Stream::Full } else { Stream::Proxy };
            workers.push(spawn_reader(
                session.clone(),
                stream,
                stats[stream.index()].clone(),
                running.clone(),
            ));
        }
    }

    let deadline = async {
        if config.demo.duration_secs > 0 {
            tokio::time::sleep(Duration::from_secs(config.demo.duration_secs)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for stream in Stream::ALL {
                    let (frames, repeats, missed) = stats[stream.index()].take();
                    info!(%stream, fps = frames, repeats, missed, "Stream stats");
                }
                let last_error = session.last_error();
                if !last_error.is_empty() {
                    warn!(%last_error, "Session reported an error");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Waiting for Ctrl-C failed: {}", e);
                }
                break;
            }
            _ = &mut deadline => break,
        }
    }

    running.store(false, Ordering::Relaxed);
    session.set_listener(None);
    session.close().wrap_err("closing camera")?;
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker failed: {}", e);
        }
    }

    info!("Strobe shutting down");
    Ok(())
}
