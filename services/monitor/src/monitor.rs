//! Occupancy monitor facade.
//!
//! Ties the camera session, the region registry and the detector together
//! behind the operations the HTTP layer exposes. Every method here blocks;
//! async callers go through `spawn_blocking`.

use crate::camera_session::{CameraSessionManager, CapturedFrame, SessionError, SessionState};
use crate::capture::{self, CameraSource, DeviceProbe};
use crate::detector::{OccupancyDetector, OccupancyMap};
use crate::region_registry::{ReferenceFrame, Region, RegionRegistry};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by monitor operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid camera source: {0}")]
    InvalidSource(String),
}

/// Outcome of switching to a new source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub camera: String,
    pub resolution: String,
}

/// Snapshot of monitor health.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub background_set: bool,
    pub reference_dimensions: Option<(u32, u32)>,
    pub slots_count: usize,
    pub camera_opened: bool,
    pub camera_state: SessionState,
    pub camera_url: Option<String>,
    pub webcam_index: u32,
    pub frame_readable: bool,
    /// `[height, width, channels]` of the probe frame
    pub frame_shape: Option<[u32; 3]>,
}

/// Parking occupancy monitor.
pub struct ParkingMonitor {
    session: Arc<CameraSessionManager>,
    registry: Arc<RegionRegistry>,
    detector: OccupancyDetector,
    webcam_index: AtomicU32,
    probe_max_index: u32,
}

impl ParkingMonitor {
    pub fn new(
        session: Arc<CameraSessionManager>,
        registry: Arc<RegionRegistry>,
        detector: OccupancyDetector,
        probe_max_index: u32,
    ) -> Self {
        let webcam_index = session.source().index().unwrap_or(0);
        Self {
            session,
            registry,
            detector,
            webcam_index: AtomicU32::new(webcam_index),
            probe_max_index,
        }
    }

    pub fn session(&self) -> &Arc<CameraSessionManager> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    /// Last local device index selected.
    pub fn webcam_index(&self) -> u32 {
        self.webcam_index.load(Ordering::SeqCst)
    }

    /// Work out the source for a "set camera" request.
    ///
    /// A non-blank URL wins; otherwise the given index, otherwise the last
    /// local index used.
    pub fn resolve_source(
        &self,
        url: Option<&str>,
        index: Option<u32>,
    ) -> Result<CameraSource, MonitorError> {
        if let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) {
            if !CameraSource::is_stream_url(url) {
                return Err(MonitorError::InvalidSource(format!(
                    "'{}' is not an rtsp://, rtsps://, http:// or https:// address",
                    url
                )));
            }
            return Ok(CameraSource::Network(url.to_string()));
        }

        Ok(CameraSource::Local(index.unwrap_or_else(|| self.webcam_index())))
    }

    /// Switch to a new source, clear the reference and verify a frame reads.
    pub fn set_source(&self, source: CameraSource) -> Result<SourceReport, MonitorError> {
        // The old baseline belongs to the old scene
        let registry = self.registry.clone();
        self.session
            .configure_with(source.clone(), move || registry.clear_reference())?;
        if let Some(index) = source.index() {
            self.webcam_index.store(index, Ordering::SeqCst);
        }

        let frame = self.session.capture()?;
        let report = SourceReport {
            camera: source.to_string(),
            resolution: format!("{}x{}", frame.width(), frame.height()),
        };
        info!(camera = %report.camera, resolution = %report.resolution, "Camera source verified");
        Ok(report)
    }

    /// Capture the current frame as the "empty" reference.
    pub fn capture_reference(&self) -> Result<ReferenceFrame, MonitorError> {
        let captured = self.session.capture_tagged()?;
        self.store_reference(captured)
    }

    /// Keep a captured frame as the reference unless the source changed
    /// since it was read.
    fn store_reference(&self, captured: CapturedFrame) -> Result<ReferenceFrame, MonitorError> {
        let CapturedFrame { frame, generation } = captured;
        let registry = &self.registry;
        Ok(self
            .session
            .while_current(generation, || registry.set_reference(frame))?)
    }

    /// Replace the region set. Returns the new count.
    pub fn update_regions(&self, regions: Vec<Region>) -> usize {
        self.registry.replace_regions(regions)
    }

    /// Occupancy for every known region.
    ///
    /// An unreadable camera reports every region empty.
    pub fn status(&self) -> OccupancyMap {
        metrics::counter!("lotwatch.status.queries").increment(1);

        let regions = self.registry.regions();
        let reference = self.registry.reference();
        let frame = match self.session.capture() {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(error = %e, "No frame for status, reporting all empty");
                None
            }
        };

        self.detector.classify(
            frame.as_ref(),
            &regions,
            reference.as_ref().map(|r| r.image.as_ref()),
        )
    }

    /// Health report. Never opens the camera.
    pub fn diagnostics(&self) -> Diagnostics {
        let snapshot = self.session.snapshot();
        let probe = match self.session.probe() {
            Ok(probe) => Some(probe),
            Err(e) => {
                warn!(error = %e, "Diagnostic probe skipped");
                None
            }
        };

        let camera_opened = probe
            .as_ref()
            .map(|p| p.opened)
            .unwrap_or_else(|| self.session.is_open());
        let dimensions = probe.as_ref().and_then(|p| p.dimensions);
        let reference = self.registry.reference();

        Diagnostics {
            background_set: reference.is_some(),
            reference_dimensions: reference.map(|r| r.dimensions()),
            slots_count: self.registry.region_count(),
            camera_opened,
            camera_state: self.session.state(),
            camera_url: snapshot.source.url().map(str::to_string),
            webcam_index: self.webcam_index(),
            frame_readable: probe.map(|p| p.readable).unwrap_or(false),
            frame_shape: dimensions.map(|(width, height)| [height, width, 3]),
        }
    }

    /// Probe local device indices for readable cameras.
    pub fn enumerate_devices(&self) -> Vec<DeviceProbe> {
        let opener = self.session.opener();
        capture::probe_local_devices(
            opener.as_ref(),
            &self.session.settings().hints,
            self.probe_max_index,
        )
    }
}
