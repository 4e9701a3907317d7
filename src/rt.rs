//! Runtime glue: bridges `hyper::rt::{Executor, Timer}` to tokio.
//!
//! Only compiled with the `tokio` feature. An embedder that wants to run on
//! another runtime supplies its own types implementing the same two traits
//! to [`crate::Pool::builder`]; the pool itself never names tokio directly
//! outside this module.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use hyper::rt::{Executor, Sleep, Timer};
use pin_project_lite::pin_project;

/// Spawns futures onto the tokio runtime that's current at the call site.
#[derive(Default, Debug, Clone, Copy)]
#[non_exhaustive]
pub struct TokioExecutor {}

impl TokioExecutor {
    pub fn new() -> Self {
        Self {}
    }
}

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

/// A `hyper::rt::Timer` backed by `tokio::time`.
#[derive(Default, Debug, Clone, Copy)]
#[non_exhaustive]
pub struct TokioTimer {}

impl TokioTimer {
    pub fn new() -> Self {
        Self {}
    }
}

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(TokioSleep {
            inner: tokio::time::sleep(duration),
        })
    }

    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        Box::pin(TokioSleep {
            inner: tokio::time::sleep_until(deadline.into()),
        })
    }

    // `reset` keeps `hyper::rt::Timer`'s default implementation (replace the
    // sleep outright); tokio's `Sleep::reset` would avoid a reallocation but
    // needs a concrete type behind the trait object, which isn't worth the
    // unsafe downcast for a 1s-cadence expirer timer.
}

pin_project! {
    struct TokioSleep {
        #[pin]
        inner: tokio::time::Sleep,
    }
}

impl Future for TokioSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

impl Sleep for TokioSleep {}
