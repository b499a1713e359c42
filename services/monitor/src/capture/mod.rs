//! Capture backends and the seam between them and the session manager.
//!
//! A [`DeviceOpener`] turns a [`CameraSource`] into a live [`CaptureDevice`].
//! Opening, reading and releasing are blocking operations with bounded
//! timeouts; callers on the async side run them through `spawn_blocking`.

pub mod gst_source;
pub mod synthetic;

use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use self::gst_source::GstOpener;
pub use self::synthetic::SyntheticCamera;

/// A decoded frame, packed RGB.
pub type Frame = RgbImage;

/// Errors raised by capture backends.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture backend initialization failed: {0}")]
    Init(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("Frame read failed: {0}")]
    ReadFailed(String),

    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),

    #[error("Device already released")]
    Released,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSource {
    /// Locally attached device (webcam, DroidCam over USB) by index
    Local(u32),
    /// Networked stream (IP camera, DroidCam over Wi-Fi) by URL
    Network(String),
}

impl CameraSource {
    /// Network sources get minimal buffering and frame skipping.
    pub fn is_network(&self) -> bool {
        matches!(self, CameraSource::Network(_))
    }

    /// Whether a string looks like a stream address this service can open.
    pub fn is_stream_url(url: &str) -> bool {
        ["rtsp://", "rtsps://", "http://", "https://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
    }

    /// Local device index, if any.
    pub fn index(&self) -> Option<u32> {
        match self {
            CameraSource::Local(index) => Some(*index),
            CameraSource::Network(_) => None,
        }
    }

    /// Network URL, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            CameraSource::Local(_) => None,
            CameraSource::Network(url) => Some(url),
        }
    }
}

impl Default for CameraSource {
    fn default() -> Self {
        CameraSource::Local(0)
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Local(index) => write!(f, "webcam {}", index),
            CameraSource::Network(url) => f.write_str(url),
        }
    }
}

/// Performance hints applied when a device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHints {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub open_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for CaptureHints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            open_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// An open capture handle.
pub trait CaptureDevice: Send {
    /// Read and decode the next frame, waiting at most the read timeout.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Read the next frame and throw it away without converting it.
    fn grab(&mut self) -> Result<(), CaptureError> {
        self.read().map(|_| ())
    }

    /// Close the underlying handle. Calling it twice is a no-op.
    fn release(&mut self);
}

/// Opens capture handles for a source.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceOpener: Send + Sync {
    fn open(
        &self,
        source: &CameraSource,
        hints: &CaptureHints,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// A local device that opened and produced a frame during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProbe {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub resolution: String,
}

/// Probe local device indices `0..max_index`, one attempt each.
///
/// Devices that open but cannot produce a frame are left out.
pub fn probe_local_devices(
    opener: &dyn DeviceOpener,
    hints: &CaptureHints,
    max_index: u32,
) -> Vec<DeviceProbe> {
    let mut available = Vec::new();

    for index in 0..max_index {
        let source = CameraSource::Local(index);
        let mut device = match opener.open(&source, hints) {
            Ok(device) => device,
            Err(e) => {
                debug!(index = index, error = %e, "Device not available");
                continue;
            }
        };

        match device.read() {
            Ok(frame) => {
                info!(
                    index = index,
                    resolution = format!("{}x{}", frame.width(), frame.height()),
                    "Device available"
                );
                available.push(DeviceProbe {
                    index,
                    kind: "webcam",
                    resolution: format!("{}x{}", frame.width(), frame.height()),
                });
            }
            Err(e) => {
                debug!(index = index, error = %e, "Device opened but cannot read");
            }
        }

        device.release();
    }

    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct FixedDevice {
        frame: Option<Frame>,
    }

    impl CaptureDevice for FixedDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            self.frame
                .clone()
                .ok_or_else(|| CaptureError::ReadFailed("no frame".to_string()))
        }

        fn release(&mut self) {}
    }

    #[test]
    fn test_source_display() {
        assert_eq!(CameraSource::Local(2).to_string(), "webcam 2");
        assert_eq!(
            CameraSource::Network("http://10.0.0.5:4747/video".to_string()).to_string(),
            "http://10.0.0.5:4747/video"
        );
    }

    #[test]
    fn test_stream_url_schemes() {
        assert!(CameraSource::is_stream_url("rtsp://cam/stream"));
        assert!(CameraSource::is_stream_url("https://cam/mjpeg"));
        assert!(!CameraSource::is_stream_url("file:///dev/video0"));
        assert!(!CameraSource::is_stream_url(""));
    }

    #[test]
    fn test_probe_reports_only_readable_devices() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().returning(|source, _| match source.index() {
            Some(0) => Ok(Box::new(FixedDevice {
                frame: Some(Frame::from_pixel(320, 240, Rgb([1, 2, 3]))),
            })),
            Some(1) => Ok(Box::new(FixedDevice { frame: None })),
            _ => Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason: "no such device".to_string(),
            }),
        });

        let found = probe_local_devices(&opener, &CaptureHints::default(), 4);
        assert_eq!(
            found,
            vec![DeviceProbe {
                index: 0,
                kind: "webcam",
                resolution: "320x240".to_string(),
            }]
        );
    }
}
