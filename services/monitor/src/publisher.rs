//! Primary stream publisher.
//!
//! Every viewer gets its own lazy frame sequence driven by the shared camera
//! session. Reads and encodes run on the blocking pool so one slow viewer
//! never stalls another. While no session can be established the sequence
//! keeps going with a labelled placeholder at the reconnect rate.

use crate::camera_session::{CameraSessionManager, SessionError};
use crate::capture::Frame;
use crate::config::StreamConfig;
use crate::mjpeg::{self, EncodeError};
use crate::placeholder::{self, Placeholder};
use backoff::backoff::{Backoff, Constant};
use bytes::Bytes;
use futures::stream::{self, Stream};
use parking_lot::RwLock;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub max_width: u32,
    pub target_fps: f32,
    pub jpeg_quality: u8,
    pub reconnect_delay: Duration,
    pub read_retry_delay: Duration,
    pub release_when_idle: bool,
}

impl From<&StreamConfig> for PublisherSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_width: config.max_width,
            target_fps: config.target_fps,
            jpeg_quality: config.jpeg_quality,
            reconnect_delay: config.reconnect_delay(),
            read_retry_delay: config.read_retry_delay(),
            release_when_idle: config.release_when_idle,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Statistics for the publisher.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PublisherStats {
    pub frames_published: u64,
    pub placeholders_sent: u64,
    pub reconnect_attempts: u64,
    pub encode_failures: u64,
}

/// Enforces a minimum interval between delivered frames.
#[derive(Debug)]
pub struct FramePacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl FramePacer {
    pub fn new(target_fps: f32) -> Self {
        let min_interval = if target_fps > 0.0 {
            Duration::from_secs_f64(1.0 / target_fps as f64)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next frame is due, then mark it delivered.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let due = last + self.min_interval;
            if due > Instant::now() {
                tokio::time::sleep_until(due).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Downscale, encode and frame one camera frame.
pub fn prepare_frame(frame: Frame, max_width: u32, quality: u8) -> Result<Bytes, EncodeError> {
    let frame = mjpeg::downscale(frame, max_width);
    let jpeg = mjpeg::encode_jpeg(&frame, quality)?;
    Ok(mjpeg::encode_part(&jpeg))
}

/// Publishes the camera session as continuous multipart streams.
pub struct StreamPublisher {
    session: Arc<CameraSessionManager>,
    settings: PublisherSettings,
    placeholder: Placeholder,
    viewers: Arc<AtomicUsize>,
    stats: Arc<RwLock<PublisherStats>>,
}

impl StreamPublisher {
    pub fn new(
        session: Arc<CameraSessionManager>,
        settings: PublisherSettings,
        placeholder: Placeholder,
    ) -> Self {
        Self {
            session,
            settings,
            placeholder,
            viewers: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(RwLock::new(PublisherStats::default())),
        }
    }

    /// Publisher with the default "camera disconnected" placeholder.
    pub fn with_default_placeholder(
        session: Arc<CameraSessionManager>,
        settings: PublisherSettings,
        width: u32,
        height: u32,
    ) -> Result<Self, EncodeError> {
        let placeholder = Placeholder::new(
            width,
            height,
            placeholder::CAMERA_DISCONNECTED,
            settings.jpeg_quality,
        )?;
        Ok(Self::new(session, settings, placeholder))
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats.read().clone()
    }

    pub fn placeholder(&self) -> &Placeholder {
        &self.placeholder
    }

    /// Start a new viewer's frame sequence.
    ///
    /// The sequence never ends on its own; dropping it ends the viewer.
    pub fn stream(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let guard = ViewerGuard::register(
            self.viewers.clone(),
            self.session.clone(),
            self.settings.release_when_idle,
        );
        info!(viewers = self.viewer_count(), "Viewer connected");

        let viewer = Viewer {
            session: self.session.clone(),
            settings: self.settings.clone(),
            placeholder: self.placeholder.part(),
            stats: self.stats.clone(),
            pacer: FramePacer::new(self.settings.target_fps),
            reconnect: Constant::new(self.settings.reconnect_delay),
            pending_delay: None,
            _guard: guard,
        };

        stream::unfold(viewer, |mut viewer| async move {
            let part = viewer.next_part().await;
            Some((Ok(part), viewer))
        })
    }
}

/// State of one viewer's sequence.
struct Viewer {
    session: Arc<CameraSessionManager>,
    settings: PublisherSettings,
    placeholder: Bytes,
    stats: Arc<RwLock<PublisherStats>>,
    pacer: FramePacer,
    reconnect: Constant,
    pending_delay: Option<Duration>,
    _guard: ViewerGuard,
}

impl Viewer {
    async fn next_part(&mut self) -> Bytes {
        loop {
            if let Some(delay) = self.pending_delay.take() {
                tokio::time::sleep(delay).await;
            }

            let session = self.session.clone();
            let captured = tokio::task::spawn_blocking(move || session.capture())
                .await
                .map_err(|e| SessionError::TaskFailed(e.to_string()))
                .and_then(|result| result);

            match captured {
                Ok(frame) => {
                    self.reconnect.reset();
                    self.pacer.wait().await;

                    let max_width = self.settings.max_width;
                    let quality = self.settings.jpeg_quality;
                    let encoded =
                        tokio::task::spawn_blocking(move || prepare_frame(frame, max_width, quality))
                            .await
                            .map_err(|e| EncodeError::TaskFailed(e.to_string()))
                            .and_then(|result| result);

                    match encoded {
                        Ok(part) => {
                            self.stats.write().frames_published += 1;
                            metrics::counter!("lotwatch.stream.frames_published").increment(1);
                            trace!(bytes = part.len(), "Frame published");
                            return part;
                        }
                        Err(e) => {
                            self.stats.write().encode_failures += 1;
                            warn!(error = %e, "Failed to encode frame");
                        }
                    }
                }
                Err(SessionError::SourceUnavailable { camera, attempts, .. }) => {
                    warn!(
                        source = %camera,
                        attempts = attempts,
                        "Camera unavailable, sending placeholder"
                    );
                    return self.placeholder_part();
                }
                Err(SessionError::Busy(_)) if !self.session.is_open() => {
                    // Another caller is still opening the source
                    debug!("Camera open in progress, sending placeholder");
                    return self.placeholder_part();
                }
                Err(e) => {
                    // Read miss or reconfiguration in flight, nothing to emit this round
                    debug!(error = %e, "No frame this iteration");
                    self.pending_delay = Some(self.settings.read_retry_delay);
                }
            }
        }
    }

    fn placeholder_part(&mut self) -> Bytes {
        let attempt = {
            let mut stats = self.stats.write();
            stats.reconnect_attempts += 1;
            stats.placeholders_sent += 1;
            stats.reconnect_attempts
        };
        metrics::counter!("lotwatch.stream.placeholders").increment(1);
        debug!(reconnect_attempt = attempt, "Placeholder sent");

        self.pending_delay = self.reconnect.next_backoff();
        self.placeholder.clone()
    }
}

/// Counts live viewers and releases the camera when the last one leaves.
struct ViewerGuard {
    viewers: Arc<AtomicUsize>,
    session: Arc<CameraSessionManager>,
    release_when_idle: bool,
}

impl ViewerGuard {
    fn register(
        viewers: Arc<AtomicUsize>,
        session: Arc<CameraSessionManager>,
        release_when_idle: bool,
    ) -> Self {
        viewers.fetch_add(1, Ordering::SeqCst);
        Self {
            viewers,
            session,
            release_when_idle,
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let remaining = self.viewers.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(viewers = remaining, "Viewer disconnected");

        if remaining > 0 || !self.release_when_idle {
            return;
        }

        let viewers = self.viewers.clone();
        let session = self.session.clone();
        let release = move || {
            // A new viewer may have arrived in the meantime
            if viewers.load(Ordering::SeqCst) > 0 {
                return;
            }
            if let Err(e) = session.release() {
                warn!(error = %e, "Failed to release idle camera session");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_session::{SessionSettings, SessionState};
    use crate::capture::{CameraSource, CaptureError, MockDeviceOpener, SyntheticCamera};
    use futures::StreamExt;

    fn quick_session(camera: &SyntheticCamera) -> Arc<CameraSessionManager> {
        let settings = SessionSettings {
            open_attempts: 2,
            open_retry_delay: Duration::from_millis(5),
            lock_wait: Duration::from_millis(200),
            ..SessionSettings::default()
        };
        Arc::new(CameraSessionManager::new(
            Arc::new(camera.clone()),
            CameraSource::Local(0),
            settings,
        ))
    }

    fn quick_settings() -> PublisherSettings {
        PublisherSettings {
            target_fps: 200.0,
            reconnect_delay: Duration::from_millis(20),
            read_retry_delay: Duration::from_millis(5),
            ..PublisherSettings::default()
        }
    }

    fn publisher(camera: &SyntheticCamera) -> StreamPublisher {
        StreamPublisher::with_default_placeholder(quick_session(camera), quick_settings(), 64, 48)
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_emits_camera_frames() {
        let camera = SyntheticCamera::solid(32, 24, [90, 90, 90]);
        let publisher = publisher(&camera);

        let parts: Vec<Bytes> = publisher
            .stream()
            .take(2)
            .map(|part| part.unwrap())
            .collect()
            .await;

        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
            assert_ne!(part, &publisher.placeholder().part());
        }
        assert_eq!(publisher.stats().frames_published, 2);
        assert_eq!(camera.open_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_camera_yields_placeholder() {
        let camera = SyntheticCamera::default();
        let publisher = publisher(&camera);

        let mut stream = Box::pin(publisher.stream());
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first, publisher.placeholder().part());
        assert_eq!(second, publisher.placeholder().part());
        assert_eq!(publisher.stats().reconnect_attempts, 2);
    }

    #[tokio::test]
    async fn test_stream_recovers_when_camera_returns() {
        let camera = SyntheticCamera::default();
        let publisher = publisher(&camera);
        let mut stream = Box::pin(publisher.stream());

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            publisher.placeholder().part()
        );

        camera.show(Frame::from_pixel(32, 24, image::Rgb([10, 200, 10])));
        let part = stream.next().await.unwrap().unwrap();
        assert_ne!(part, publisher.placeholder().part());
        assert_eq!(publisher.stats().frames_published, 1);
    }

    #[tokio::test]
    async fn test_last_viewer_releases_camera() {
        let camera = SyntheticCamera::solid(16, 16, [0, 0, 0]);
        let publisher = publisher(&camera);

        let mut stream = Box::pin(publisher.stream());
        stream.next().await.unwrap().unwrap();
        assert_eq!(publisher.viewer_count(), 1);
        assert!(publisher.session.is_open());

        drop(stream);
        assert_eq!(publisher.viewer_count(), 0);

        for _ in 0..50 {
            if publisher.session.state() == SessionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_remaining_viewer_keeps_camera() {
        let camera = SyntheticCamera::solid(16, 16, [0, 0, 0]);
        let publisher = publisher(&camera);

        let mut first = Box::pin(publisher.stream());
        let mut second = Box::pin(publisher.stream());
        first.next().await.unwrap().unwrap();
        second.next().await.unwrap().unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.viewer_count(), 1);
        assert!(publisher.session.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_viewer_sees_placeholder_while_first_is_opening() {
        let mut opener = MockDeviceOpener::new();
        opener.expect_open().returning(|source, _| {
            std::thread::sleep(Duration::from_millis(200));
            Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason: "timed out".to_string(),
            })
        });
        let session = Arc::new(CameraSessionManager::new(
            Arc::new(opener),
            CameraSource::Network("rtsp://slow/stream".to_string()),
            SessionSettings {
                open_attempts: 2,
                open_retry_delay: Duration::from_millis(5),
                lock_wait: Duration::from_millis(50),
                ..SessionSettings::default()
            },
        ));
        let publisher =
            StreamPublisher::with_default_placeholder(session, quick_settings(), 64, 48).unwrap();

        let mut first = Box::pin(publisher.stream());
        let opening = tokio::spawn(async move { first.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let mut second = Box::pin(publisher.stream());
        let part = second.next().await.unwrap().unwrap();
        assert_eq!(part, publisher.placeholder().part());
        assert!(started.elapsed() < Duration::from_millis(200));

        let first_part = opening.await.unwrap().unwrap().unwrap();
        assert_eq!(first_part, publisher.placeholder().part());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_frames() {
        let mut pacer = FramePacer::new(10.0);
        assert_eq!(pacer.min_interval(), Duration::from_millis(100));

        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(1));

        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_does_not_wait_when_late() {
        let mut pacer = FramePacer::new(10.0);
        pacer.wait().await;
        tokio::time::advance(Duration::from_millis(250)).await;

        let before = Instant::now();
        pacer.wait().await;
        assert_eq!(Instant::now(), before);
    }

    #[test]
    fn test_prepare_frame_downscales_wide_frames() {
        let frame = Frame::from_pixel(1600, 400, image::Rgb([200, 10, 10]));
        let part = prepare_frame(frame, 1280, 85).unwrap();

        let header_end = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let jpeg = &part[header_end..part.len() - 2];
        let decoded = image::load_from_memory(jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1280, 320));
    }
}
