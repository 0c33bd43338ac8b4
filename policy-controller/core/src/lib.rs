//! Reconciles group-based network policies into derivative policies.
//!
//! A parent `NetworkPolicy` may reference external groups (e.g. cloud
//! security groups) in its egress rules. The data plane cannot enforce such
//! rules, so for every parent that references a group this crate maintains a
//! derivative policy in which each group has been replaced by the networks
//! it currently resolves to:
//!
//! ```text
//! [ watch ] -> [ Orchestrator ] -> [ Schedule ] -> [ resolve (bounded retry) ]
//!                                                      -> [ upsert derivative ]
//!                                                      -> [ parent status ]
//! ```
//!
//! Resolution is retried a bounded number of times with a fixed delay. When
//! it cannot succeed, a deny-all derivative is written instead so that the
//! data plane fails closed rather than enforcing stale rules.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod derivative;
pub mod metrics;
mod orchestrator;
mod reconcile;
pub mod resolve;
pub mod schedule;
pub mod store;


pub use self::{
    cache::DerivativeCache,
    derivative::{Parent, ParentError, ParentId},
    metrics::ReconcileMetrics,
    orchestrator::{Config, InvalidKeyScope, KeyScope, Orchestrator},
    reconcile::RetryConfig,
    resolve::{GroupProvider, GroupResolver, ProviderResolver, StaticProvider},
    schedule::{Op, Schedule, TaskKey, TaskScheduler, Work},
    store::{PolicyStore, StatusSink},
};
pub use groups_policy_controller_k8s_api as k8s;
