//! Mobile session endpoints: link issue, capture page, ingest and relay view.

use super::{ApiError, AppState};
use crate::mjpeg;
use crate::network;
use crate::relay::MobileRelay;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A pushed frame, over WebSocket or HTTP.
#[derive(Debug, Deserialize)]
pub struct MobileFrame {
    pub token: String,
    pub frame: String,
}

/// `POST /set_public_url` body.
#[derive(Debug, Deserialize)]
pub struct SetPublicUrlRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[instrument(skip(state))]
pub async fn generate_mobile_link(State(state): State<AppState>) -> Json<Value> {
    let issued = state.relay.issue_token();
    let link = state.links.link(&issued.token);
    info!(url = %link.url, mode = ?link.mode, "Generated mobile link");

    Json(json!({
        "status": "ok",
        "token": issued.token,
        "url": link.url,
        "mode": link.mode,
        "expires_at": issued.expires_at,
    }))
}

/// Capture page for a phone.
///
/// Served only to clients coming through a public address; local clients get
/// a page pointing them at the tunnel URL.
#[instrument(skip(state, headers, peer, token))]
pub async fn mobile_page(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if !state.relay.is_valid(&token) {
        return (StatusCode::FORBIDDEN, "Invalid or expired token").into_response();
    }

    let client = network::client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let local = client.map(|ip| network::is_private(&ip)).unwrap_or(true);
    if local {
        debug!(client = ?client, "Mobile page requested from a local address");
        return Html(local_access_page(state.links.public_url().as_deref(), &token)).into_response();
    }

    Html(capture_page(&token)).into_response()
}

/// Relay MJPEG stream for a token.
pub async fn mobile_video(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let stream = state
        .relay
        .stream(&token)
        .map_err(|e| ApiError::Forbidden(e.to_string()))?;
    Ok(mjpeg::response(stream))
}

/// WebSocket ingest. Accepted frames are acknowledged, dropped ones are not.
pub async fn mobile_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(mut socket: WebSocket, relay: Arc<MobileRelay>) {
    debug!("Mobile WebSocket connected");

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Mobile WebSocket error");
                break;
            }
        };

        let frame: MobileFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Malformed mobile frame message");
                continue;
            }
        };

        if relay.ingest(&frame.token, &frame.frame).is_ok() {
            let ack = json!({ "status": "ok" }).to_string();
            if socket.send(Message::Text(ack)).await.is_err() {
                break;
            }
        }
    }

    debug!("Mobile WebSocket closed");
}

/// HTTP ingest: 202 when stored, 204 when dropped.
pub async fn mobile_frame(
    State(state): State<AppState>,
    Json(frame): Json<MobileFrame>,
) -> Response {
    match state.relay.ingest(&frame.token, &frame.frame) {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))).into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[instrument(skip(state))]
pub async fn set_public_url(
    State(state): State<AppState>,
    Json(request): Json<SetPublicUrlRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(url) = request.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        if let Err(e) = network::validate_public_url(url) {
            warn!(url = %url, error = %e, "Rejected public URL");
            return Err(ApiError::BadRequest(e.to_string()));
        }
    }

    Ok(Json(match state.links.set_public_url(request.url.as_deref()) {
        Some(url) => json!({ "status": "ok", "url": url }),
        None => json!({ "status": "ok", "message": "Using local address" }),
    }))
}

fn local_access_page(public_url: Option<&str>, token: &str) -> String {
    let hint = match public_url {
        Some(base) => {
            let link = escape_html(&format!("{}/mobile/{}", base, token));
            format!("<p>Open <a href=\"{link}\">{link}</a> instead.</p>", link = link)
        }
        None => "<p>Ask the operator to set a public tunnel URL and generate a new link.</p>"
            .to_string(),
    };

    LOCAL_ACCESS_PAGE.replace("{hint}", &hint)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn capture_page(token: &str) -> String {
    CAPTURE_PAGE.replace("{token}", token)
}

const LOCAL_ACCESS_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1">
<title>Use the public link</title></head>
<body style="font-family: sans-serif; padding: 1.5em">
<h2>This link must be opened through the public address</h2>
<p>Mobile camera capture is only served through the public tunnel, not over the local network.</p>
{hint}
</body>
</html>
"#;

const CAPTURE_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1">
<title>Mobile camera</title></head>
<body style="margin: 0; background: #000; color: #fff; font-family: sans-serif">
<video id="preview" autoplay playsinline muted style="width: 100%"></video>
<canvas id="canvas" style="display: none"></canvas>
<p id="state" style="padding: 0.5em">Starting camera...</p>
<script>
const token = "{token}";
const video = document.getElementById("preview");
const canvas = document.getElementById("canvas");
const state = document.getElementById("state");
const scheme = location.protocol === "https:" ? "wss://" : "ws://";
const socket = new WebSocket(scheme + location.host + "/mobile_ws");
let sent = 0;

socket.onmessage = () => { sent += 1; state.textContent = "Streaming, " + sent + " frames sent"; };
socket.onclose = () => { state.textContent = "Disconnected"; };

navigator.mediaDevices.getUserMedia({ video: { facingMode: "environment" }, audio: false })
  .then((stream) => {
    video.srcObject = stream;
    setInterval(() => {
      if (socket.readyState !== WebSocket.OPEN || !video.videoWidth) return;
      canvas.width = video.videoWidth;
      canvas.height = video.videoHeight;
      canvas.getContext("2d").drawImage(video, 0, 0);
      socket.send(JSON.stringify({ token: token, frame: canvas.toDataURL("image/jpeg", 0.7) }));
    }, 100);
  })
  .catch((err) => { state.textContent = "Camera unavailable: " + err; });
</script>
</body>
</html>
"#;
