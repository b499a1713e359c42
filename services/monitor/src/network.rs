//! Address discovery and share-link construction for mobile sessions.

use axum::http::{HeaderMap, Uri};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use thiserror::Error;
use tracing::{debug, info};

/// Best-effort address of this host on the local network.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn local_ip() -> IpAddr {
    let discovered = UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match discovered {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "Local address discovery failed");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Whether an address is on a private, loopback or link-local network.
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(&v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Originating client address.
///
/// Tunnel and proxy headers are honoured only when the socket peer is
/// loopback, where the tunnel connector runs; anyone else could forge them.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let peer = peer?.ip();
    let behind_tunnel = match peer {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    };
    if !behind_tunnel {
        return Some(peer);
    }

    let header_ip = |name: &str, first_only: bool| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let value = if first_only {
                    value.split(',').next().unwrap_or_default()
                } else {
                    value
                };
                value.trim().parse::<IpAddr>().ok()
            })
    };

    header_ip("cf-connecting-ip", false)
        .or_else(|| header_ip("x-forwarded-for", true))
        .or_else(|| header_ip("x-real-ip", false))
        .or(Some(peer))
}

/// A public base URL that failed validation.
#[derive(Debug, Error)]
#[error("Invalid public URL: {0}")]
pub struct InvalidPublicUrl(String);

/// Check a public base URL before it is stored and echoed into pages.
///
/// Accepts only absolute `http`/`https` URLs with a host and without
/// characters that could break out of an HTML attribute.
pub fn validate_public_url(url: &str) -> Result<(), InvalidPublicUrl> {
    if let Some(c) = url
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '<' | '>' | '`'))
    {
        return Err(InvalidPublicUrl(format!("unexpected character {:?}", c)));
    }

    let uri: Uri = url
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| InvalidPublicUrl(e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(InvalidPublicUrl("must start with http:// or https://".to_string())),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(InvalidPublicUrl("missing host".to_string()));
    }
    if uri.query().is_some() {
        return Err(InvalidPublicUrl("query strings are not allowed".to_string()));
    }
    Ok(())
}

/// How a share link reaches this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkMode {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "local network")]
    LocalNetwork,
}

/// A shareable link for a mobile session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareLink {
    pub url: String,
    pub mode: LinkMode,
}

/// Builds mobile share links from the public URL override or the local address.
pub struct ShareLinkBuilder {
    public_url: RwLock<Option<String>>,
    local_ip: IpAddr,
    port: u16,
}

impl ShareLinkBuilder {
    pub fn new(local_ip: IpAddr, port: u16) -> Self {
        Self {
            public_url: RwLock::new(None),
            local_ip,
            port,
        }
    }

    /// Set or clear the public base URL. Blank input clears it.
    ///
    /// Returns the stored URL with any trailing slashes removed.
    pub fn set_public_url(&self, url: Option<&str>) -> Option<String> {
        let normalized = url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());

        match &normalized {
            Some(url) => info!(url = %url, "Public URL set"),
            None => info!("Public URL cleared, using local address"),
        }

        *self.public_url.write() = normalized.clone();
        normalized
    }

    pub fn public_url(&self) -> Option<String> {
        self.public_url.read().clone()
    }

    pub fn link(&self, token: &str) -> ShareLink {
        match self.public_url.read().as_deref() {
            Some(base) => ShareLink {
                url: format!("{}/mobile/{}", base, token),
                mode: LinkMode::Online,
            },
            None => ShareLink {
                url: format!("http://{}/mobile/{}", SocketAddr::new(self.local_ip, self.port), token),
                mode: LinkMode::LocalNetwork,
            },
        }
    }
}
