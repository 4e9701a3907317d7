//! Feature-gated logging macros, same shape as `hyper-util`'s own
//! `tracing`-or-nothing logging: these compile (and do nothing) whether or
//! not the `tracing` feature — and therefore the `tracing` crate itself —
//! is enabled, so call sites never need their own `#[cfg(...)]`.

macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::trace!($($arg)*);
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        tracing::warn!($($arg)*);
    };
}

pub(crate) use trace;
pub(crate) use warn;
