//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that keeps objects in memory and behaves like the real
//! API server where reconciliation depends on it: UIDs are assigned on create,
//! every write bumps `resourceVersion`, and replaces carrying a stale version are
//! rejected with `409 Conflict`.

pub mod discovery;
mod helpers;
pub mod http;

pub use discovery::{MockApiResource, MockDiscovery};
pub use http::{Fault, HttpMockK8sServer, RunningHttpMockK8sServer};
