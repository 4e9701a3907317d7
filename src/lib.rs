//! A keep-alive connection pool for outbound byte streams to one or more
//! upstream targets.
//!
//! This crate owns idle sockets, hands them out on demand, creates new
//! connections when none are idle, enforces an idle-expiration policy, and
//! — when more than one upstream target is configured — cooperates with a
//! pluggable [`balance::Balancer`] to pick among them and retry other
//! targets on connect failure.
//!
//! URL parsing, DNS resolution, and the socket I/O substrate are modeled as
//! external collaborators (see [`connect`]); this crate never does TLS,
//! HTTP framing, or anything that requires looking at request contents.

#[macro_use]
mod macros;

pub(crate) mod common;

pub mod balance;
pub mod client;
pub mod connect;
mod error;
pub mod target;

#[cfg(feature = "tokio")]
pub mod rt;

pub use client::legacy::pool::{AcquireHandle, Config, Pool, PoolBuilder, Pooled};
pub use error::Error;
pub use target::Target;
