//! Mobile frame relay.
//!
//! A phone is handed a short-lived session token, pushes JPEG frames under
//! that token, and any number of viewers watch the latest frame for it.
//! Tokens are independent: a push under one token is never visible under
//! another, and an unknown or expired token's push leaves the store
//! untouched.

use crate::config::RelayConfig;
use crate::mjpeg::{self, EncodeError};
use crate::placeholder::{self, Placeholder};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, trace};

/// Errors that can occur in the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid frame payload: {0}")]
    InvalidPayload(String),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub token_ttl: Duration,
    pub frame_interval: Duration,
    pub max_frame_bytes: usize,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            token_ttl: config.token_ttl(),
            frame_interval: config.frame_interval(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// A freshly issued session token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct MobileSession {
    issued_at: Instant,
    latest: Mutex<Option<Bytes>>,
    frames: AtomicU64,
    evicted: AtomicBool,
}

impl MobileSession {
    fn new() -> Self {
        Self {
            issued_at: Instant::now(),
            latest: Mutex::new(None),
            frames: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    fn is_live(&self, ttl: Duration) -> bool {
        !self.evicted.load(Ordering::SeqCst) && self.issued_at.elapsed() <= ttl
    }
}

/// Token-keyed store of the latest pushed frame.
pub struct MobileRelay {
    settings: RelaySettings,
    sessions: RwLock<HashMap<String, Arc<MobileSession>>>,
    placeholder: Placeholder,
}

impl MobileRelay {
    pub fn new(settings: RelaySettings, placeholder: Placeholder) -> Self {
        Self {
            settings,
            sessions: RwLock::new(HashMap::new()),
            placeholder,
        }
    }

    /// Relay with the default "waiting for mobile" placeholder.
    pub fn with_default_placeholder(
        settings: RelaySettings,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Self, EncodeError> {
        let placeholder =
            Placeholder::new(width, height, placeholder::WAITING_FOR_MOBILE, quality)?;
        Ok(Self::new(settings, placeholder))
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn placeholder(&self) -> &Placeholder {
        &self.placeholder
    }

    /// Issue a new token, evicting expired ones first.
    pub fn issue_token(&self) -> IssuedToken {
        self.evict_expired();

        let token = generate_token();
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(self.settings.token_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        self.sessions
            .write()
            .insert(token.clone(), Arc::new(MobileSession::new()));
        metrics::counter!("lotwatch.mobile.tokens_issued").increment(1);
        info!(token = %redact(&token), expires_at = %expires_at, "Mobile session token issued");

        IssuedToken {
            token,
            issued_at,
            expires_at,
        }
    }

    /// Whether a token exists and is within its TTL.
    pub fn is_valid(&self, token: &str) -> bool {
        self.live_session(token).is_some()
    }

    /// Store a pushed frame given as a data URL or bare base64.
    ///
    /// Returns the decoded frame size.
    pub fn ingest(&self, token: &str, payload: &str) -> Result<usize, RelayError> {
        let result = self
            .live_session(token)
            .ok_or(RelayError::InvalidToken)
            .and_then(|session| {
                let frame = decode_payload(payload, self.settings.max_frame_bytes)?;
                Ok(self.store(token, &session, frame))
            });

        if let Err(e) = &result {
            metrics::counter!("lotwatch.mobile.frames_rejected").increment(1);
            debug!(token = %redact(token), error = %e, "Mobile frame dropped");
        }
        result
    }

    /// Latest frame pushed under a token, if any.
    pub fn latest(&self, token: &str) -> Option<Bytes> {
        self.live_session(token)
            .and_then(|session| session.latest.lock().clone())
    }

    /// Number of frames pushed under a token so far.
    pub fn frame_count(&self, token: &str) -> Option<u64> {
        self.sessions
            .read()
            .get(token)
            .map(|session| session.frames.load(Ordering::SeqCst))
    }

    pub fn active_tokens(&self) -> usize {
        self.sessions.read().len()
    }

    /// Continuous multipart sequence for a token.
    ///
    /// Emits once per frame interval: the latest pushed frame, or the
    /// placeholder until one arrives. Ends once the token expires.
    pub fn stream(
        &self,
        token: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static, RelayError> {
        let session = self.live_session(token).ok_or(RelayError::InvalidToken)?;
        let ttl = self.settings.token_ttl;
        let placeholder = self.placeholder.part();
        let label = redact(token);

        let mut interval = tokio::time::interval(self.settings.frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let alive = session.clone();
        let stream = IntervalStream::new(interval)
            .take_while(move |_| future::ready(alive.is_live(ttl)))
            .map(move |_| {
                let part = match session.latest.lock().as_ref() {
                    Some(frame) => mjpeg::encode_part(frame),
                    None => placeholder.clone(),
                };
                trace!(token = %label, bytes = part.len(), "Relay frame sent");
                Ok(part)
            });

        Ok(stream)
    }

    /// Drop expired tokens and their frames. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.settings.token_ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();

        sessions.retain(|token, session| {
            if session.issued_at.elapsed() <= ttl {
                return true;
            }
            session.evicted.store(true, Ordering::SeqCst);
            debug!(token = %redact(token), "Mobile session token expired");
            false
        });

        let removed = before - sessions.len();
        if removed > 0 {
            metrics::counter!("lotwatch.mobile.tokens_expired").increment(removed as u64);
            info!(removed = removed, remaining = sessions.len(), "Expired mobile tokens evicted");
        }
        removed
    }

    /// Evict expired tokens on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evict_expired();
            }
        })
    }

    fn live_session(&self, token: &str) -> Option<Arc<MobileSession>> {
        self.sessions
            .read()
            .get(token)
            .filter(|session| session.is_live(self.settings.token_ttl))
            .cloned()
    }

    fn store(&self, token: &str, session: &MobileSession, frame: Bytes) -> usize {
        let size = frame.len();
        *session.latest.lock() = Some(frame);
        let count = session.frames.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::counter!("lotwatch.mobile.frames_ingested").increment(1);
        trace!(token = %redact(token), bytes = size, frames = count, "Mobile frame stored");
        size
    }
}

/// 16 random bytes, URL-safe base64 without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Tokens are credentials; only a prefix goes to the logs.
fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…", prefix)
}

fn check_size(size: usize, limit: usize) -> Result<(), RelayError> {
    if size > limit {
        return Err(RelayError::FrameTooLarge { size, limit });
    }
    Ok(())
}

/// Decode a `data:image/...;base64,` URL or bare base64 string.
pub fn decode_payload(payload: &str, max_bytes: usize) -> Result<Bytes, RelayError> {
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (_, data) = rest
                .split_once(',')
                .ok_or_else(|| RelayError::InvalidPayload("data URL has no payload".to_string()))?;
            data
        }
        None => payload,
    }
    .trim();

    if encoded.is_empty() {
        return Err(RelayError::InvalidPayload("empty frame".to_string()));
    }

    // Reject oversized payloads before decoding them
    check_size(encoded.len() / 4 * 3, max_bytes)?;

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| RelayError::InvalidPayload(e.to_string()))?;
    check_size(decoded.len(), max_bytes)?;
    Ok(Bytes::from(decoded))
}
