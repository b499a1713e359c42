//! In-memory capture backend.
//!
//! Serves whatever scene was last shown, regardless of the requested source.
//! Handy for demos without a camera and for driving the full service in tests.

use super::{CameraSource, CaptureDevice, CaptureError, CaptureHints, DeviceOpener, Frame};
use image::Rgb;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A controllable fake camera shared between the opener and its devices.
#[derive(Clone, Default)]
pub struct SyntheticCamera {
    scene: Arc<RwLock<Option<Frame>>>,
    opens: Arc<AtomicU32>,
}

impl SyntheticCamera {
    /// Camera showing the given scene.
    pub fn new(frame: Frame) -> Self {
        Self {
            scene: Arc::new(RwLock::new(Some(frame))),
            opens: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Camera showing a single flat colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(Frame::from_pixel(width, height, Rgb(rgb)))
    }

    /// Replace the scene seen by every open device.
    pub fn show(&self, frame: Frame) {
        *self.scene.write() = Some(frame);
    }

    /// Unplug the camera: opens fail and open devices stop producing frames.
    pub fn disconnect(&self) {
        *self.scene.write() = None;
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceOpener for SyntheticCamera {
    fn open(
        &self,
        source: &CameraSource,
        _hints: &CaptureHints,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.scene.read().is_none() {
            return Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason: "synthetic camera disconnected".to_string(),
            });
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticDevice {
            scene: self.scene.clone(),
            released: false,
        }))
    }
}

struct SyntheticDevice {
    scene: Arc<RwLock<Option<Frame>>>,
    released: bool,
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        self.scene
            .read()
            .clone()
            .ok_or_else(|| CaptureError::ReadFailed("synthetic camera disconnected".to_string()))
    }

    fn release(&mut self) {
        self.released = true;
    }
}
