//! Client-facing pieces built on top of the pool.
//!
//! Named `legacy` to mirror `hyper-util`'s own layout, where
//! `client::legacy` houses the pre-`tower` connection-pooling client that
//! every downstream crate in the pack still depends on.

pub mod legacy;
