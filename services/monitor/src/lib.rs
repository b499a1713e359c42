//! Lotwatch Monitor
//!
//! Parking slot occupancy monitor. A single camera (local device or network
//! stream) is watched through a resilient capture session; regions drawn over
//! the frame are classified empty or occupied by comparing against a
//! reference "empty lot" frame. Phones can act as extra cameras by pushing
//! frames through a token-protected relay.
//!
//! ## Features
//!
//! - **Resilient capture**: bounded open retries, a read-failure threshold
//!   that recycles the session, and frame skipping for buffered network feeds
//! - **Occupancy detection**: per-region intensity difference against a
//!   reference frame, with clamping and a stale-reference guard
//! - **Continuous MJPEG streams**: one lazy stream per viewer, with a labelled
//!   placeholder while the camera is unreachable
//! - **Mobile relay**: short-lived session tokens, WebSocket and HTTP ingest,
//!   and a per-token MJPEG view
//!
//! ## Architecture
//!
//! ```text
//!  Camera ──▶ DeviceOpener ──▶ CameraSessionManager ──┬──▶ StreamPublisher ──▶ /video
//!                                                     │
//!                                                     └──▶ ParkingMonitor ──▶ /status, /debug
//!                                                              │
//!                                      RegionRegistry ◀────────┤
//!                                      OccupancyDetector ◀─────┘
//!
//!  Phone ──▶ /mobile_ws, /mobile_frame ──▶ MobileRelay ──▶ /mobile_video/{token}
//! ```

pub mod api;
pub mod camera_session;
pub mod capture;
pub mod config;
pub mod detector;
pub mod mjpeg;
pub mod monitor;
pub mod network;
pub mod placeholder;
pub mod publisher;
pub mod region_registry;
pub mod relay;

pub use api::{create_router, start_api_server, ApiError, AppState};
pub use camera_session::{CameraSessionManager, SessionError, SessionSettings, SessionState};
pub use capture::{CameraSource, CaptureDevice, CaptureError, DeviceOpener, Frame};
pub use config::MonitorConfig;
pub use detector::{DetectionParams, Occupancy, OccupancyDetector, OccupancyMap};
pub use monitor::{Diagnostics, MonitorError, ParkingMonitor};
pub use network::ShareLinkBuilder;
pub use publisher::{PublisherSettings, StreamPublisher};
pub use region_registry::{Region, RegionRegistry};
pub use relay::{MobileRelay, RelayError, RelaySettings};
