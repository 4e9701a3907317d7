//! The DNS and socket collaborators (`spec.md` §6).
//!
//! Both contracts are intentionally trait objects rather than extra generic
//! parameters on [`crate::Pool`]: the spec treats DNS and connect as
//! pluggable collaborators the pool never needs to monomorphize over, and a
//! pool handing out connections to more than one target already pays for a
//! trait-object balancer call per attempt, so there's no zero-cost property
//! being given up.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A resolved or dead-on-arrival connection handed out by the pool.
///
/// This is the crate's default [`PoolableConnection`] and what
/// [`TokioConnect`] produces; embedders may use their own connection type
/// and their own `Connect` implementation instead (`spec.md` §6, the
/// "Socket" collaborator).
#[derive(Debug)]
pub enum Conn {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

/// Outcome of the non-destructive idle-socket liveness probe (`spec.md`
/// §4.4, §9 "Raw fd liveness probe").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekResult {
    /// `EAGAIN`/`EWOULDBLOCK`: nothing queued, peer hasn't closed. Usable.
    Alive,
    /// Peer closed the connection (`recv` returned `0`).
    Eof,
    /// Data arrived on a socket the pool believed idle: a protocol
    /// violation from the pool's point of view.
    UnexpectedData,
}

/// A value the pool can hand out, keep idle, and liveness-probe.
///
/// Generalizes the teacher's `Poolable` trait (`is_open`/`reserve`/
/// `can_share`); `reserve`/`can_share` have no counterpart here because
/// this pool's connections are always exclusively owned (no HTTP/2-style
/// shared reservation, `spec.md` §1 non-goals: "any knowledge of request
/// contents").
pub trait PoolableConnection: Send + Unpin + 'static {
    /// A cheap, always-available liveness check.
    fn is_open(&self) -> bool;

    /// The non-blocking 1-byte peek (`spec.md` §9). Returns `None` when the
    /// connection type can't support the probe (e.g. a test stub), in
    /// which case the pool falls back to trusting `is_open`.
    fn poll_peek(&self) -> Option<PeekResult> {
        None
    }
}

impl PoolableConnection for Conn {
    fn is_open(&self) -> bool {
        true
    }

    fn poll_peek(&self) -> Option<PeekResult> {
        peek_raw_fd(self)
    }
}

#[cfg(unix)]
fn peek_raw_fd(conn: &Conn) -> Option<PeekResult> {
    let mut buf = [0u8; 1];
    let result = match conn {
        Conn::Tcp(s) => socket2::SockRef::from(s).peek(&mut buf),
        Conn::Unix(s) => socket2::SockRef::from(s).peek(&mut buf),
    };
    match result {
        Ok(0) => Some(PeekResult::Eof),
        Ok(_) => Some(PeekResult::UnexpectedData),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(PeekResult::Alive),
        Err(_) => Some(PeekResult::Eof),
    }
}

#[cfg(not(unix))]
fn peek_raw_fd(_conn: &Conn) -> Option<PeekResult> {
    None
}

/// The async DNS collaborator (`spec.md` §6, "Host resolver").
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `host` (already lower-cased) and pre-rendered numeric
    /// `port` into an address list, selecting as if with
    /// `ADDRCONFIG | NUMERICSERV` hints.
    fn resolve(&self, host: &str, port: &str) -> BoxFuture<io::Result<Vec<SocketAddr>>>;

    /// The collaborator's address-selection policy (`spec.md` §4.4 Phase
    /// C: "pick one address per the collaborator's selection policy").
    fn select_one(&self, addrs: &[SocketAddr]) -> Option<SocketAddr> {
        addrs.first().copied()
    }
}

/// DNS via `tokio::net::lookup_host`, preferring IPv6 addresses first —
/// grounded in `xulek-RustSocks/src/server/resolver.rs`'s
/// `resolve_address`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve(&self, host: &str, port: &str) -> BoxFuture<io::Result<Vec<SocketAddr>>> {
        let lookup = format!("{host}:{port}");
        Box::pin(async move {
            let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(lookup).await?.collect();
            addrs.sort_by_key(|a| if a.is_ipv6() { 0 } else { 1 });
            Ok(addrs)
        })
    }
}

/// The socket collaborator (`spec.md` §6, "Socket"): non-blocking connect.
///
/// Generic in the connection type it produces, so a test can plug in a
/// lightweight stub without touching real sockets, the same role the
/// teacher's `T: Poolable` generic parameter plays.
pub trait Connect<Conn: PoolableConnection>: Send + Sync + 'static {
    fn connect_inet(&self, addr: SocketAddr) -> BoxFuture<io::Result<Conn>>;

    fn connect_unix(&self, path: PathBuf) -> BoxFuture<io::Result<Conn>> {
        let _ = path;
        Box::pin(async {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "this Connect implementation does not support unix sockets",
            ))
        })
    }
}

/// Connects over TCP (and, on unix, Unix-domain sockets) via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioConnect;

impl Connect<Conn> for TokioConnect {
    fn connect_inet(&self, addr: SocketAddr) -> BoxFuture<io::Result<Conn>> {
        Box::pin(async move { tokio::net::TcpStream::connect(addr).await.map(Conn::Tcp) })
    }

    #[cfg(unix)]
    fn connect_unix(&self, path: PathBuf) -> BoxFuture<io::Result<Conn>> {
        Box::pin(async move { tokio::net::UnixStream::connect(path).await.map(Conn::Unix) })
    }

    #[cfg(not(unix))]
    fn connect_unix(&self, path: PathBuf) -> BoxFuture<io::Result<Conn>> {
        let _ = path;
        Box::pin(async {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix-domain sockets are not supported on this platform",
            ))
        })
    }
}
