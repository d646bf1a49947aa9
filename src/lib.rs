//! burrow — a virtual Kubernetes cluster syncer.
//!
//! Tenants talk to an embedded control plane and see an isolated cluster;
//! burrow projects the objects that need real execution (pods, services,
//! endpoints, secrets, config maps, ingresses, claims) into one namespace of
//! the host cluster, keeps the two object graphs eventually consistent in
//! both directions, and fronts the embedded API server with a proxy that
//! rewrites the few requests it cannot serve itself.

pub mod client;
pub mod config;
pub mod error;
pub mod index;
pub mod locks;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod sync;
pub mod translate;

pub use error::{Error, Result};
