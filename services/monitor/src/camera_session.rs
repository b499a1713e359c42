//! Camera session lifecycle: bounded-retry acquisition, reads, and release.
//!
//! Exactly one capture handle is live at a time. Reads and reconfiguration go
//! through a single mutex so a reconfiguration never races an in-flight read;
//! opening happens outside it, behind a separate gate, so a dead source being
//! retried never locks out a reconfiguration. Every wait is bounded, so a
//! caller that cannot get in reports [`SessionError::Busy`] instead of hanging.
//!
//! ```text
//! CLOSED -> OPENING -> OPEN <-> DEGRADED
//!    ^         |         |          |
//!    +---------+---------+----------+  (attempts exhausted / failure threshold / release)
//! ```

use crate::capture::{CameraSource, CaptureDevice, CaptureError, CaptureHints, DeviceOpener, Frame};
use crate::config::CameraConfig;
use backoff::backoff::{Backoff, Constant};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to open {camera} after {attempts} attempts: {reason}")]
    SourceUnavailable {
        camera: String,
        attempts: u32,
        reason: String,
    },

    #[error("Frame read failed ({consecutive} consecutive): {reason}")]
    ReadFailure { consecutive: u32, reason: String },

    #[error("No open camera session")]
    NotOpen,

    #[error("Camera session busy, gave up after {0:?}")]
    Busy(Duration),

    #[error("Camera source changed, try again")]
    Reconfigured,

    #[error("Capture task failed: {0}")]
    TaskFailed(String),
}

/// Lifecycle state of the camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    /// Open, but the last read failed
    Degraded,
}

/// Frames to read and discard after each delivered frame.
///
/// Network sources buffer on the sender side; throwing a few frames away
/// after every delivery keeps the viewer close to live. Local devices skip
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipPolicy {
    discard_after_delivery: u32,
}

impl SkipPolicy {
    pub fn for_source(source: &CameraSource, network_skip_frames: u32) -> Self {
        let discard_after_delivery = if source.is_network() {
            network_skip_frames
        } else {
            0
        };
        Self {
            discard_after_delivery,
        }
    }

    pub fn discards(&self) -> u32 {
        self.discard_after_delivery
    }
}

/// Session manager tuning.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    pub max_consecutive_failures: u32,
    pub network_skip_frames: u32,
    pub lock_wait: Duration,
    pub configure_wait: Duration,
    pub hints: CaptureHints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&CameraConfig::default())
    }
}

impl From<&CameraConfig> for SessionSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            open_attempts: config.open_attempts,
            open_retry_delay: config.open_retry_delay(),
            max_consecutive_failures: config.max_consecutive_failures,
            network_skip_frames: config.network_skip_frames,
            lock_wait: config.lock_wait(),
            configure_wait: config.configure_wait(),
            hints: config.hints(),
        }
    }
}

/// Counters for the session manager.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub opens: u64,
    pub open_failures: u64,
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub read_failures: u64,
    pub releases: u64,
    pub reconfigurations: u64,
}

/// Lock-free view of the session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub source: CameraSource,
    pub state: SessionState,
    pub generation: u64,
}

/// A frame and the source generation it was read under.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub generation: u64,
}

/// Result of a diagnostic read against the current session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionProbe {
    pub opened: bool,
    pub readable: bool,
    pub dimensions: Option<(u32, u32)>,
}

struct SessionInner {
    source: CameraSource,
    device: Option<Box<dyn CaptureDevice>>,
    state: SessionState,
    consecutive_failures: u32,
    pending_discards: u32,
    skip: SkipPolicy,
    generation: u64,
}

/// Owns the single active capture handle.
pub struct CameraSessionManager {
    opener: Arc<dyn DeviceOpener>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    /// Held by the one caller currently opening a device
    opening: Mutex<()>,
    snapshot: RwLock<SessionSnapshot>,
    stats: RwLock<SessionStats>,
}

impl CameraSessionManager {
    pub fn new(opener: Arc<dyn DeviceOpener>, source: CameraSource, settings: SessionSettings) -> Self {
        let skip = SkipPolicy::for_source(&source, settings.network_skip_frames);
        let snapshot = SessionSnapshot {
            source: source.clone(),
            state: SessionState::Closed,
            generation: 0,
        };

        Self {
            opener,
            settings,
            inner: Mutex::new(SessionInner {
                source,
                device: None,
                state: SessionState::Closed,
                consecutive_failures: 0,
                pending_discards: 0,
                skip,
                generation: 0,
            }),
            opening: Mutex::new(()),
            snapshot: RwLock::new(snapshot),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn opener(&self) -> Arc<dyn DeviceOpener> {
        self.opener.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.read().state
    }

    pub fn source(&self) -> CameraSource {
        self.snapshot.read().source.clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), SessionState::Open | SessionState::Degraded)
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    /// Switch to a new source. Tears down the open session, if any, without
    /// opening the new one.
    pub fn configure(&self, source: CameraSource) -> Result<(), SessionError> {
        self.configure_with(source, || {})
    }

    /// Switch to a new source, running `on_switch` before any reader can see
    /// the new generation.
    pub fn configure_with<F>(&self, source: CameraSource, on_switch: F) -> Result<(), SessionError>
    where
        F: FnOnce(),
    {
        let mut inner = self.lock(self.settings.configure_wait)?;
        self.release_locked(&mut inner, "reconfigured");

        info!(previous = %inner.source, source = %source, "Camera source configured");
        inner.skip = SkipPolicy::for_source(&source, self.settings.network_skip_frames);
        inner.source = source;
        inner.generation += 1;
        on_switch();
        self.stats.write().reconfigurations += 1;
        self.publish(&inner);
        Ok(())
    }

    /// Make sure a session is open, opening the configured source with
    /// bounded retries if needed.
    ///
    /// Devices are opened and retry delays slept without holding the session
    /// lock, so a reconfiguration can always get in. If one does, the attempt
    /// is abandoned with [`SessionError::Reconfigured`].
    pub fn acquire(&self) -> Result<(), SessionError> {
        let wait = self.settings.lock_wait;
        let _opening = self.opening.try_lock_for(wait).ok_or_else(|| {
            debug!(wait_ms = wait.as_millis() as u64, "Camera open already in progress");
            SessionError::Busy(wait)
        })?;

        let (source, generation) = {
            let inner = self.lock(wait)?;
            if inner.device.is_some() {
                return Ok(());
            }
            (inner.source.clone(), inner.generation)
        };

        let attempts = self.settings.open_attempts;
        let mut delay = Constant::new(self.settings.open_retry_delay);
        let mut last_error = None;

        for attempt in 1..=attempts {
            {
                let mut inner = self.lock(wait)?;
                if inner.generation != generation {
                    return Err(SessionError::Reconfigured);
                }
                inner.state = SessionState::Opening;
                self.publish(&inner);
            }

            let opened = self.open_and_probe(&source);

            let mut inner = match self.lock(wait) {
                Ok(inner) => inner,
                Err(e) => {
                    if let Ok(mut device) = opened {
                        device.release();
                    }
                    return Err(e);
                }
            };
            if inner.generation != generation {
                if let Ok(mut device) = opened {
                    device.release();
                }
                info!(source = %source, "Source changed while opening, abandoning attempt");
                return Err(SessionError::Reconfigured);
            }

            match opened {
                Ok(device) => {
                    inner.device = Some(device);
                    inner.state = SessionState::Open;
                    inner.consecutive_failures = 0;
                    inner.pending_discards = 0;
                    self.stats.write().opens += 1;
                    metrics::counter!("lotwatch.camera.opens").increment(1);
                    info!(source = %source, attempt = attempt, "Camera session open");
                    self.publish(&inner);
                    return Ok(());
                }
                Err(e) => {
                    self.stats.write().open_failures += 1;
                    metrics::counter!("lotwatch.camera.open_failures").increment(1);
                    warn!(
                        source = %source,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to open camera"
                    );
                    last_error = Some(e);
                }
            }
            drop(inner);

            if attempt < attempts {
                if let Some(pause) = delay.next_backoff() {
                    std::thread::sleep(pause);
                }
            }
        }

        let mut inner = self.lock(wait)?;
        if inner.generation != generation {
            return Err(SessionError::Reconfigured);
        }
        inner.state = SessionState::Closed;
        self.publish(&inner);
        error!(source = %source, attempts = attempts, "Camera unavailable");

        Err(SessionError::SourceUnavailable {
            camera: source.to_string(),
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    /// Read the next frame from the open session.
    pub fn read_frame(&self) -> Result<Frame, SessionError> {
        let mut inner = self.lock(self.settings.lock_wait)?;
        self.read_locked(&mut inner)
    }

    /// Acquire then read one frame.
    pub fn capture(&self) -> Result<Frame, SessionError> {
        self.capture_tagged().map(|captured| captured.frame)
    }

    /// Acquire then read one frame, tagged with the source generation it
    /// came from.
    pub fn capture_tagged(&self) -> Result<CapturedFrame, SessionError> {
        self.acquire()?;
        let mut inner = self.lock(self.settings.lock_wait)?;
        if inner.device.is_none() {
            // Torn down between the open and the read
            return Err(SessionError::Reconfigured);
        }
        let frame = self.read_locked(&mut inner)?;
        Ok(CapturedFrame {
            frame,
            generation: inner.generation,
        })
    }

    /// Run `f` only if the source is still at `generation`.
    ///
    /// Holds the session lock for the duration, so no reconfiguration can
    /// interleave with `f`.
    pub fn while_current<T, F>(&self, generation: u64, f: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> T,
    {
        let inner = self.lock(self.settings.lock_wait)?;
        if inner.generation != generation {
            return Err(SessionError::Reconfigured);
        }
        Ok(f())
    }

    /// Read one frame if a session is already open. Never opens a device.
    pub fn probe(&self) -> Result<SessionProbe, SessionError> {
        let mut inner = self.lock(self.settings.lock_wait)?;
        if inner.device.is_none() {
            return Ok(SessionProbe {
                opened: false,
                readable: false,
                dimensions: None,
            });
        }

        let frame = self.read_locked(&mut inner).ok();
        Ok(SessionProbe {
            opened: true,
            readable: frame.is_some(),
            dimensions: frame.map(|f| f.dimensions()),
        })
    }

    /// Close the capture handle. Idempotent.
    pub fn release(&self) -> Result<(), SessionError> {
        let mut inner = self.lock(self.settings.lock_wait)?;
        self.release_locked(&mut inner, "requested");
        Ok(())
    }

    fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, SessionInner>, SessionError> {
        self.inner.try_lock_for(wait).ok_or_else(|| {
            debug!(wait_ms = wait.as_millis() as u64, "Camera session busy");
            SessionError::Busy(wait)
        })
    }

    /// Opening only counts once a probe frame has been read.
    fn open_and_probe(&self, source: &CameraSource) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut device = self.opener.open(source, &self.settings.hints)?;
        match device.read() {
            Ok(frame) => {
                debug!(
                    source = %source,
                    resolution = format!("{}x{}", frame.width(), frame.height()),
                    "Probe frame read"
                );
                Ok(device)
            }
            Err(e) => {
                device.release();
                Err(e)
            }
        }
    }

    fn read_locked(&self, inner: &mut SessionInner) -> Result<Frame, SessionError> {
        let device = inner.device.as_mut().ok_or(SessionError::NotOpen)?;

        // Drain frames the source buffered since the last delivery
        let mut skipped = 0u64;
        while inner.pending_discards > 0 {
            inner.pending_discards -= 1;
            if device.grab().is_err() {
                inner.pending_discards = 0;
                break;
            }
            skipped += 1;
        }

        let result = device.read();
        let mut stats = self.stats.write();
        stats.frames_skipped += skipped;

        match result {
            Ok(frame) => {
                stats.frames_read += 1;
                drop(stats);
                inner.consecutive_failures = 0;
                inner.pending_discards = inner.skip.discards();
                if inner.state != SessionState::Open {
                    inner.state = SessionState::Open;
                    self.publish(inner);
                }
                Ok(frame)
            }
            Err(e) => {
                stats.read_failures += 1;
                drop(stats);
                metrics::counter!("lotwatch.camera.read_failures").increment(1);
                inner.consecutive_failures += 1;
                let consecutive = inner.consecutive_failures;
                let max = self.settings.max_consecutive_failures;
                debug!(
                    source = %inner.source,
                    attempt = consecutive,
                    max_failures = max,
                    error = %e,
                    "Failed to read frame"
                );

                if consecutive >= max {
                    warn!(source = %inner.source, failures = consecutive, "Too many read failures, releasing camera");
                    self.release_locked(inner, "read failures");
                } else if inner.state != SessionState::Degraded {
                    inner.state = SessionState::Degraded;
                    self.publish(inner);
                }

                Err(SessionError::ReadFailure {
                    consecutive,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn release_locked(&self, inner: &mut SessionInner, reason: &str) {
        if let Some(mut device) = inner.device.take() {
            device.release();
            self.stats.write().releases += 1;
            metrics::counter!("lotwatch.camera.releases").increment(1);
            info!(source = %inner.source, reason = reason, "Camera session released");
        }
        inner.state = SessionState::Closed;
        inner.consecutive_failures = 0;
        inner.pending_discards = 0;
        self.publish(inner);
    }

    fn publish(&self, inner: &SessionInner) {
        *self.snapshot.write() = SessionSnapshot {
            source: inner.source.clone(),
            state: inner.state,
            generation: inner.generation,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockDeviceOpener;
    use image::Rgb;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Counters shared between a test and the devices it hands out.
    #[derive(Default)]
    struct DeviceLog {
        reads: AtomicU32,
        grabs: AtomicU32,
        releases: AtomicU32,
    }

    /// Device that follows a script of read outcomes, then succeeds forever.
    struct ScriptedDevice {
        script: Arc<PlMutex<VecDeque<bool>>>,
        log: Arc<DeviceLog>,
        read_delay: Duration,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            self.log.reads.fetch_add(1, Ordering::SeqCst);
            if !self.read_delay.is_zero() {
                std::thread::sleep(self.read_delay);
            }
            match self.script.lock().pop_front() {
                Some(false) => Err(CaptureError::ReadFailed("scripted".to_string())),
                _ => Ok(Frame::from_pixel(4, 3, Rgb([9, 9, 9]))),
            }
        }

        fn grab(&mut self) -> Result<(), CaptureError> {
            self.log.grabs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.log.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(20),
            max_consecutive_failures: 3,
            network_skip_frames: 2,
            lock_wait: Duration::from_millis(50),
            configure_wait: Duration::from_millis(500),
            hints: CaptureHints::default(),
        }
    }

    fn scripted_opener(
        script: Vec<bool>,
        log: Arc<DeviceLog>,
        read_delay: Duration,
    ) -> MockDeviceOpener {
        let script = Arc::new(PlMutex::new(VecDeque::from(script)));
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().returning(move |_, _| {
            Ok(Box::new(ScriptedDevice {
                script: script.clone(),
                log: log.clone(),
                read_delay,
            }))
        });
        opener
    }

    #[test]
    fn test_acquire_gives_up_after_configured_attempts() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().times(3).returning(|source, _| {
            Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason: "unplugged".to_string(),
            })
        });

        let settings = fast_settings();
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(1), settings.clone());

        let started = Instant::now();
        let result = manager.acquire();

        assert!(matches!(
            result,
            Err(SessionError::SourceUnavailable { attempts: 3, .. })
        ));
        // Two waits between three attempts
        assert!(started.elapsed() >= settings.open_retry_delay * 2);
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(manager.stats().open_failures, 3);
    }

    #[test]
    fn test_open_without_probe_frame_is_a_failure() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![false, false, false], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        assert!(matches!(
            manager.acquire(),
            Err(SessionError::SourceUnavailable { .. })
        ));
        assert_eq!(log.reads.load(Ordering::SeqCst), 3);
        assert_eq!(log.releases.load(Ordering::SeqCst), 3);
        assert!(!manager.is_open());
    }

    #[test]
    fn test_acquire_succeeds_on_later_attempt() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![false, true], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        manager.acquire().unwrap();
        assert_eq!(manager.state(), SessionState::Open);
        assert_eq!(manager.stats().opens, 1);
        assert_eq!(manager.stats().open_failures, 1);

        // Already open: no further opens
        manager.acquire().unwrap();
        assert_eq!(manager.stats().opens, 1);
    }

    #[test]
    fn test_read_failure_threshold_releases_session() {
        let log = Arc::new(DeviceLog::default());
        // probe ok, then three failed reads
        let opener = scripted_opener(vec![true, false, false, false], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());
        manager.acquire().unwrap();

        assert!(matches!(
            manager.read_frame(),
            Err(SessionError::ReadFailure { consecutive: 1, .. })
        ));
        assert_eq!(manager.state(), SessionState::Degraded);
        assert!(manager.read_frame().is_err());
        assert!(matches!(
            manager.read_frame(),
            Err(SessionError::ReadFailure { consecutive: 3, .. })
        ));

        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(log.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(manager.read_frame(), Err(SessionError::NotOpen)));

        // Next acquire reopens
        manager.acquire().unwrap();
        assert!(manager.read_frame().is_ok());
        assert_eq!(manager.stats().opens, 2);
    }

    #[test]
    fn test_successful_read_resets_failure_count() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(
            vec![true, false, false, true, false, false],
            log.clone(),
            Duration::ZERO,
        );
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());
        manager.acquire().unwrap();

        for _ in 0..5 {
            let _ = manager.read_frame();
        }
        assert!(manager.is_open());
        assert_eq!(log.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_network_source_skips_frames_between_deliveries() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::ZERO);
        let manager = CameraSessionManager::new(
            Arc::new(opener),
            CameraSource::Network("rtsp://cam/stream".to_string()),
            fast_settings(),
        );

        manager.acquire().unwrap();
        manager.read_frame().unwrap();
        assert_eq!(log.grabs.load(Ordering::SeqCst), 0);

        manager.read_frame().unwrap();
        assert_eq!(log.grabs.load(Ordering::SeqCst), 2);
        manager.read_frame().unwrap();
        assert_eq!(log.grabs.load(Ordering::SeqCst), 4);
        assert_eq!(manager.stats().frames_skipped, 4);
    }

    #[test]
    fn test_local_source_skips_nothing() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        manager.acquire().unwrap();
        for _ in 0..3 {
            manager.read_frame().unwrap();
        }
        assert_eq!(log.grabs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_skip_policy_by_source() {
        let network = CameraSource::Network("http://phone:4747/video".to_string());
        assert_eq!(SkipPolicy::for_source(&network, 2).discards(), 2);
        assert_eq!(SkipPolicy::for_source(&CameraSource::Local(0), 2).discards(), 0);
    }

    #[test]
    fn test_configure_tears_down_without_opening() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());
        manager.acquire().unwrap();

        let url = CameraSource::Network("rtsp://cam/stream".to_string());
        manager.configure(url.clone()).unwrap();

        assert_eq!(log.releases.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(manager.source(), url);
        assert_eq!(manager.snapshot().generation, 1);
        assert_eq!(manager.stats().opens, 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());
        manager.acquire().unwrap();

        manager.release().unwrap();
        manager.release().unwrap();
        assert_eq!(log.releases.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().releases, 1);
    }

    #[test]
    fn test_probe_never_opens() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().never();
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        let probe = manager.probe().unwrap();
        assert!(!probe.opened);
        assert!(!probe.readable);
        assert_eq!(probe.dimensions, None);
    }

    #[test]
    fn test_waiting_reader_gives_up_while_session_is_held() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::from_millis(300));
        let manager = Arc::new(CameraSessionManager::new(
            Arc::new(opener),
            CameraSource::Local(0),
            fast_settings(),
        ));

        let holder = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.capture())
        };
        // Past the probe read (0-300ms) and into the delivered read (300-600ms)
        std::thread::sleep(Duration::from_millis(400));

        let started = Instant::now();
        assert!(matches!(manager.read_frame(), Err(SessionError::Busy(_))));
        assert!(started.elapsed() < Duration::from_millis(250));

        assert!(holder.join().unwrap().is_ok());
    }

    #[test]
    fn test_configure_wins_over_failing_acquire() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().returning(|source, _| {
            std::thread::sleep(Duration::from_millis(50));
            Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason: "no route to host".to_string(),
            })
        });
        let settings = SessionSettings {
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(10),
            configure_wait: Duration::from_millis(100),
            ..fast_settings()
        };
        let manager = Arc::new(CameraSessionManager::new(
            Arc::new(opener),
            CameraSource::Network("rtsp://dead/x".to_string()),
            settings,
        ));

        let viewer = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.capture())
        };
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        manager.configure(CameraSource::Local(1)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));

        // The dead source's retries stop at the next attempt boundary
        assert!(matches!(
            viewer.join().unwrap(),
            Err(SessionError::Reconfigured)
        ));
        assert_eq!(manager.stats().open_failures, 0);
        assert_eq!(manager.source(), CameraSource::Local(1));
    }

    #[test]
    fn test_device_opened_for_old_source_is_discarded() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log.clone(), Duration::from_millis(100));
        let manager = Arc::new(CameraSessionManager::new(
            Arc::new(opener),
            CameraSource::Local(0),
            fast_settings(),
        ));

        let opener_thread = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.acquire())
        };
        std::thread::sleep(Duration::from_millis(30));
        manager.configure(CameraSource::Local(1)).unwrap();

        assert!(matches!(
            opener_thread.join().unwrap(),
            Err(SessionError::Reconfigured)
        ));
        assert_eq!(log.releases.load(Ordering::SeqCst), 1);
        assert!(!manager.is_open());
        assert_eq!(manager.stats().opens, 0);
    }

    #[test]
    fn test_while_current_rejects_old_generation() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log, Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        let captured = manager.capture_tagged().unwrap();
        assert_eq!(captured.generation, 0);
        assert_eq!(manager.while_current(captured.generation, || 7).unwrap(), 7);

        manager.configure(CameraSource::Local(2)).unwrap();
        assert!(matches!(
            manager.while_current(captured.generation, || 7),
            Err(SessionError::Reconfigured)
        ));
    }

    #[test]
    fn test_configure_with_runs_hook() {
        let log = Arc::new(DeviceLog::default());
        let opener = scripted_opener(vec![], log, Duration::ZERO);
        let manager =
            CameraSessionManager::new(Arc::new(opener), CameraSource::Local(0), fast_settings());

        let mut switched = false;
        manager
            .configure_with(CameraSource::Local(1), || switched = true)
            .unwrap();
        assert!(switched);
        assert_eq!(manager.snapshot().generation, 1);
    }
}
