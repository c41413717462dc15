//! The Kiln serving-control core.
//!
//! Kiln fronts a native model-execution subprocess (the "runtime") and
//! mediates concurrent streaming generation requests under memory, GPU-queue,
//! and latency constraints. The crate is embeddable: construct an
//! [`Engine`] from a [`KilnConfig`] and a connected [`rpc::RpcTransport`],
//! then drive generations through it. The `cluster` module adds the
//! controller-side pieces (worker registry, load balancer, circuit breaker)
//! for fleets of worker hosts.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

#[macro_use]
extern crate tracing;

pub mod batch;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod flags;
mod internal_events;
pub mod limiter;
pub mod models;
pub mod rpc;
pub mod streams;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::KilnConfig;
pub use engine::Engine;
