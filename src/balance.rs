//! The load-balancer plug-in interface (`spec.md` §4.5).
//!
//! The spec frames the collaborator as three C-style entry points —
//! `init`/`selector`/`dispose`. The idiomatic Rust rendition folds those
//! into a trait: `init` is the concrete implementation's constructor,
//! `selector` is [`Balancer::select`], and `dispose` is `Drop` (see
//! `DESIGN.md`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::target::Target;

/// A pluggable policy for choosing a target when a pool has more than one.
///
/// `select` is invoked while the pool's internal mutex is held (`spec.md`
/// §4.5: "Called under the pool mutex; must be non-blocking"), so
/// implementations must not allocate unboundedly, lock anything else, or do
/// I/O.
pub trait Balancer<C = ()>: Send + Sync + 'static {
    /// Caller-supplied data threaded through from `Pool::acquire_with` to
    /// each `select` call for that one acquire (`spec.md`'s `lb_extra`).
    type Extra: Send + 'static;

    /// Return an index `i` into `targets` such that `tried[i] == false`.
    ///
    /// Panics if every entry of `tried` is `true`; the pool never calls
    /// `select` in that state (it stops retrying once `tried` is full).
    fn select(&self, targets: &[Arc<Target<C>>], tried: &[bool], extra: &Self::Extra) -> usize;
}

/// The pool's built-in balancer: round-robins over untried targets.
///
/// Grounded in the endpoint-selection shape of
/// `examples/other_examples/194a69bd_..._pool-p2c.rs.rs` (linkerd2-proxy's
/// power-of-two-choices pool), simplified to plain round robin since this
/// crate's selector contract is a pure, synchronous, feedback-free pick
/// rather than a load-aware one.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> Balancer<C> for RoundRobin {
    type Extra = ();

    fn select(&self, targets: &[Arc<Target<C>>], tried: &[bool], _extra: &()) -> usize {
        let len = targets.len();
        assert!(len > 0, "RoundRobin::select called with no targets");

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if !tried[idx] {
                return idx;
            }
        }
        unreachable!("select called with every target already tried")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_skips_tried_targets() {
        let targets: Vec<Arc<Target<()>>> = (0..3)
            .map(|i| {
                Arc::new(
                    Target::new(format!("http://host{i}:80").parse().unwrap(), None).unwrap(),
                )
            })
            .collect();
        let rr = RoundRobin::new();
        let mut tried = vec![false; 3];

        let first = Balancer::select(&rr, &targets, &tried, &());
        tried[first] = true;
        let second = Balancer::select(&rr, &targets, &tried, &());
        assert_ne!(first, second);
        tried[second] = true;
        let third = Balancer::select(&rr, &targets, &tried, &());
        assert!(tried.iter().enumerate().all(|(i, &t)| t || i == third));
    }

    #[test]
    fn round_robin_distributes_across_many_selects() {
        let targets: Vec<Arc<Target<()>>> = (0..4)
            .map(|i| {
                Arc::new(
                    Target::new(format!("http://host{i}:80").parse().unwrap(), None).unwrap(),
                )
            })
            .collect();
        let rr = RoundRobin::new();
        let tried = vec![false; 4];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            seen.insert(Balancer::select(&rr, &targets, &tried, &()));
        }
        assert_eq!(seen.len(), 4);
    }
}
