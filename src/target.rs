//! Upstream target construction and classification (`spec.md` §3, §4.1).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;

use http::uri::Uri;

/// One upstream endpoint the pool may connect to.
///
/// `Target`s are appended to a pool's target list and never removed or
/// reordered for the lifetime of the pool — callbacks and balancer state
/// refer to targets by index, so the index must stay a stable identifier
/// (`spec.md` §9, "Target indices as stable identifiers").
#[derive(Debug)]
pub struct Target<C = ()> {
    pub(crate) url: Uri,
    pub(crate) kind: TargetKind,
    /// Opaque per-target datum handed to the balancer (`spec.md` §4.5).
    pub(crate) balancer_config: Option<C>,
    /// Sockets currently checked out *or* mid-connect against this target.
    ///
    /// Signed so that the documented idle-hit asymmetry (see
    /// `DESIGN.md`, "request_count idle-hit asymmetry") can drift below
    /// zero without wrapping, exactly as it would with a signed counter in
    /// the source this crate is modeled on.
    pub(crate) request_count: AtomicI64,
    /// For `tracing` spans / `Debug` only; never consulted for routing.
    name: Option<Box<str>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Sockaddr(SockKind),
    Named { host: String, port: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SockKind {
    Inet(SocketAddr),
    #[allow(dead_code)] // only constructed when unix sockets are in play
    Unix(PathBuf),
}

/// Key used by a global pool (`spec.md` §4.2) to find-or-add a `Target`:
/// scheme equality, port equality (after URL port defaulting), and
/// case-insensitive host equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TargetKey {
    scheme: String,
    host: String,
    port: u16,
}

impl TargetKey {
    pub(crate) fn from_uri(uri: &Uri) -> Option<Self> {
        let scheme = uri.scheme_str()?.to_ascii_lowercase();
        let host = uri.host()?.to_ascii_lowercase();
        let port = uri.port_u16().or_else(|| default_port(&scheme))?;
        Some(TargetKey { scheme, host, port })
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" | "unix" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

impl<C> Target<C> {
    /// Build a `Target` from an already-parsed URI, per `spec.md` §4.1:
    ///
    /// - a `unix` scheme is treated as a Unix-domain-socket address, and its
    ///   host/authority are *not* lower-cased (I4);
    /// - a numeric IPv4/IPv6 host becomes a resolved `Sockaddr`;
    /// - anything else becomes a `Named` target, with the port pre-rendered
    ///   once as a string to avoid reformatting it on every connect.
    pub fn new(url: Uri, balancer_config: Option<C>) -> Result<Self, crate::Error> {
        let is_unix = url.scheme_str() == Some("unix");

        let kind = if is_unix {
            let path = PathBuf::from(url.path());
            TargetKind::Sockaddr(SockKind::Unix(path))
        } else {
            let host = url.host().ok_or(crate::Error::ConnectionFailed)?;
            let host = host.to_ascii_lowercase();

            match host.parse::<IpAddr>() {
                Ok(ip) => {
                    let port = url
                        .port_u16()
                        .or_else(|| default_port(url.scheme_str().unwrap_or("")))
                        .ok_or(crate::Error::ConnectionFailed)?;
                    TargetKind::Sockaddr(SockKind::Inet(SocketAddr::new(ip, port)))
                }
                Err(_) => {
                    let port = url
                        .port_u16()
                        .or_else(|| default_port(url.scheme_str().unwrap_or("")))
                        .ok_or(crate::Error::ConnectionFailed)?;
                    TargetKind::Named {
                        host,
                        port: port.to_string(),
                    }
                }
            }
        };

        let url = if is_unix { url } else { lower_case_uri(url) };

        Ok(Target {
            url,
            kind,
            balancer_config,
            request_count: AtomicI64::new(0),
            name: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<Box<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn balancer_config(&self) -> Option<&C> {
        self.balancer_config.as_ref()
    }

    /// Current count of sockets checked out or mid-connect against this
    /// target. Advisory/observability only (`spec.md` §5, "Atomicity").
    pub fn request_count(&self) -> i64 {
        self.request_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn key(&self) -> Option<TargetKey> {
        TargetKey::from_uri(&self.url)
    }
}

/// Lower-case the host/authority portion of a URI, leaving everything else
/// (scheme, path, query) untouched. `http::Uri` has no in-place mutation, so
/// this rebuilds the authority.
fn lower_case_uri(uri: Uri) -> Uri {
    let Some(authority) = uri.authority() else {
        return uri;
    };
    let lowered = authority.as_str().to_ascii_lowercase();
    if lowered == authority.as_str() {
        return uri;
    }

    let mut parts = uri.into_parts();
    parts.authority = lowered.parse().ok();
    Uri::from_parts(parts).expect("lower-casing authority cannot invalidate a valid Uri")
}
