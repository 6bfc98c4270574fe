//! Core types and trait definitions for the Concord fact store.
//!
//! This crate is deliberately free of HTTP and database dependencies. It holds
//! the pure consensus and vector-clock logic plus the component traits that
//! storage backends implement.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod audit;
pub mod clock;
pub mod cluster;
pub mod consensus;
pub mod error;
pub mod fact;
pub mod store;

pub use error::{Error, Result};
