//! Desired-state reconciliation for operator-managed Kubernetes resources.
//!
//! The crate keeps a small, fixed set of objects (a controller Deployment plus a
//! mutating and a validating webhook configuration) converged to their templates:
//!
//! - [`client`] talks to the object store with optimistic concurrency,
//! - [`desired`] supplies and validates the templates,
//! - [`preserve`] keeps externally injected CA bundles across writes,
//! - [`diff`] turns desired vs observed into a typed patch,
//! - [`reconcile`] drives fetch, diff and write for a single resource,
//! - [`controller`] runs reconciles on ticks, watch events and requests,
//! - [`watch`] turns Kubernetes watch events into reconcile requests,
//! - [`verify`] polls until a predicate holds or a deadline passes,
//! - [`status`] derives availability for health reporting.

pub mod backoff;
pub mod client;
pub mod config;
pub mod controller;
pub mod desired;
pub mod diff;
pub mod preserve;
pub mod reconcile;
pub mod resource;
pub mod status;
#[cfg(test)]
pub mod test_utils;
pub mod verify;
pub mod watch;
pub mod webhook;

pub use client::{ClientError, KubeResourceClient, Operation, ResourceClient};
pub use config::ReconcileConfig;
pub use controller::{LoopHandle, ReconcileLoop};
pub use desired::{DesiredStateError, DesiredStateProvider, StaticDesiredState};
pub use diff::{diff, DiffAction, FieldPath, Patch};
pub use preserve::PreservationPolicy;
pub use reconcile::{ReconcileError, ReconcileOutcome, Reconciler, StateTracker, SyncState};
pub use resource::{ManagedObject, ResourceKind, ResourceRef, ResourceScope};
pub use status::{ConditionType, OperatorStatus};
pub use verify::{Verifier, VerifyError, WaitOptions};
pub use watch::spawn_watchers;
