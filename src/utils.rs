use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// Highest `/dev/videoN` probed during detection.
const MAX_VIDEO_NODES: usize = 10;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
}

impl FoundDevice {
    pub fn new(path: String, card: String) -> Self {
        Self { path, card }
    }
}

/// Capture nodes that can stream MJPEG, in `/dev/videoN` order.
pub fn detect_capture_devices() -> Vec<FoundDevice> {
    debug!("Scanning for MJPEG capture devices");
    let mut found = Vec::new();

    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let mjpeg = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")))
            .unwrap_or(false);
        if mjpeg {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            found.push(FoundDevice::new(path, caps.card));
        } else {
            debug!("Skipping {}: no MJPEG support", path);
        }
    }

    found
}
