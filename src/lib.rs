//! Ephemeral, Kubernetes-backed dependencies for automated test runs.
//!
//! A [`lifecycle::ResourceLifecycleController`] creates the network resource
//! and workload of a [`lifecycle::ManagedResource`], waits for it with a
//! [`wait::WaitStrategy`] and resolves an external endpoint through the
//! cluster's [`access::AccessStrategy`].

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod internal_events;

pub mod access;
pub mod app;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod namespace;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;
pub mod trace;
pub mod wait;

pub use error::Error;
