//! Connector agent.
//!
//! Runs next to a destination (a Kubernetes cluster or an SSH host), keeps
//! the destination's local access in step with the grants on the server and
//! answers just-in-time credential requests for it.

pub mod authn;
pub mod certs;
pub mod config;
pub mod error;
pub mod kubernetes;
pub mod metrics;
pub mod proxy;
pub mod ssh;
pub mod startup;
pub mod sync;
