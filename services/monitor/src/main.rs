//! Parking occupancy monitor service.
//!
//! Watches a camera, classifies parking regions against a reference frame and
//! relays frames pushed from phones.
//!
//! # Architecture
//!
//! ```text
//! Camera -> CameraSessionManager -> StreamPublisher / ParkingMonitor -> HTTP
//! Phone  -> MobileRelay -> HTTP
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with LOTWATCH_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use lotwatch_monitor::api::{start_api_server, AppState};
use lotwatch_monitor::camera_session::{CameraSessionManager, SessionSettings};
use lotwatch_monitor::capture::{self, DeviceOpener, GstOpener, SyntheticCamera};
use lotwatch_monitor::config::{self, CaptureBackend, MonitorConfig};
use lotwatch_monitor::detector::{DetectionParams, OccupancyDetector};
use lotwatch_monitor::monitor::ParkingMonitor;
use lotwatch_monitor::network::{self, ShareLinkBuilder};
use lotwatch_monitor::publisher::{PublisherSettings, StreamPublisher};
use lotwatch_monitor::region_registry::RegionRegistry;
use lotwatch_monitor::relay::{MobileRelay, RelaySettings};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Local indices checked at startup.
const STARTUP_PROBE_INDICES: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "lotwatch-monitor",
        version = env!("CARGO_PKG_VERSION"),
        "Starting parking occupancy monitor"
    );

    // Validate configuration
    config.validate()?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let opener = create_opener(&config)?;
    probe_startup_devices(opener.clone(), &config).await;

    // Initialize components
    let session = Arc::new(CameraSessionManager::new(
        opener,
        config.initial_source(),
        SessionSettings::from(&config.camera),
    ));
    let monitor = Arc::new(ParkingMonitor::new(
        session.clone(),
        Arc::new(RegionRegistry::new()),
        OccupancyDetector::new(DetectionParams::from(&config.detection)),
        config.camera.probe_max_index,
    ));
    let publisher = Arc::new(
        StreamPublisher::with_default_placeholder(
            session.clone(),
            PublisherSettings::from(&config.stream),
            config.stream.placeholder_width,
            config.stream.placeholder_height,
        )
        .context("Failed to render camera placeholder")?,
    );
    let relay = Arc::new(
        MobileRelay::with_default_placeholder(
            RelaySettings::from(&config.relay),
            config.stream.placeholder_width,
            config.stream.placeholder_height,
            config.stream.jpeg_quality,
        )
        .context("Failed to render relay placeholder")?,
    );

    let local_ip = network::local_ip();
    info!(local_ip = %local_ip, port = config.server.port, "Local network address");
    let links = Arc::new(ShareLinkBuilder::new(local_ip, config.server.port));

    let sweeper_handle = relay.clone().spawn_sweeper(config.relay.sweep_interval());

    // Create API state
    let api_state = AppState {
        monitor,
        publisher,
        relay,
        links,
    };

    // Spawn API server task
    let server_config = config.server.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &server_config).await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!(source = %session.source(), "Monitor started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down monitor");

    api_handle.abort();
    sweeper_handle.abort();

    let release = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || release.release()).await? {
        warn!(error = %e, "Failed to release camera on shutdown");
    }

    let stats = session.stats();
    info!(
        opens = stats.opens,
        open_failures = stats.open_failures,
        frames_read = stats.frames_read,
        read_failures = stats.read_failures,
        "Monitor stopped"
    );

    Ok(())
}

/// Load configuration.
fn load_config() -> Result<MonitorConfig> {
    // Try loading from files first, fall back to environment
    let config = MonitorConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        MonitorConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("lotwatch_monitor={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("tower_http=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

fn create_opener(config: &MonitorConfig) -> Result<Arc<dyn DeviceOpener>> {
    match config.camera.backend {
        CaptureBackend::Gstreamer => {
            let opener = GstOpener::new().context("Failed to initialize GStreamer")?;
            Ok(Arc::new(opener))
        }
        CaptureBackend::Synthetic => {
            warn!("Using the synthetic capture backend");
            Ok(Arc::new(SyntheticCamera::solid(
                config.camera.target_width,
                config.camera.target_height,
                [128, 128, 128],
            )))
        }
    }
}

/// Log which local devices answer, without holding any of them open.
async fn probe_startup_devices(opener: Arc<dyn DeviceOpener>, config: &MonitorConfig) {
    let hints = config.camera.hints();
    let probed = tokio::task::spawn_blocking(move || {
        capture::probe_local_devices(opener.as_ref(), &hints, STARTUP_PROBE_INDICES)
    })
    .await;

    match probed {
        Ok(devices) if devices.is_empty() => {
            warn!("No local camera answered; configure a network source via /set_camera")
        }
        Ok(devices) => {
            for device in devices {
                info!(index = device.index, resolution = %device.resolution, "Local camera found");
            }
        }
        Err(e) => warn!(error = %e, "Startup camera probe failed"),
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
