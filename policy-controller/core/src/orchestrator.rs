use crate::{
    cache::DerivativeCache,
    derivative::{Parent, ParentId},
    metrics::ReconcileMetrics,
    reconcile::{Reconciler, RetryConfig},
    resolve::GroupResolver,
    schedule::{Op, Schedule, TaskKey, Work},
    store::{PolicyStore, StatusSink},
};
use anyhow::Result;
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};

/// Determines which submissions supersede one another.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum KeyScope {
    /// Tasks are keyed by operation and parent, so that e.g. an update does
    /// not supersede a pending add for the same parent. Tasks for one parent
    /// may run concurrently.
    #[default]
    PerOperation,

    /// Tasks are keyed by parent only, so that all work for a parent is
    /// serialized and the latest submission always wins.
    PerParent,
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub retry: RetryConfig,
    pub key_scope: KeyScope,
}

/// Decides whether policy events require reconciliation and submits the
/// work.
///
/// Entry points never wait for reconciliation to complete; its outcome is
/// observable only through the parent's status.
pub struct Orchestrator {
    scheduler: Arc<dyn Schedule>,
    reconciler: Arc<Reconciler>,
    key_scope: KeyScope,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid key scope {0:?}; expected `per-operation` or `per-parent`")]
pub struct InvalidKeyScope(String);

// === impl KeyScope ===

impl FromStr for KeyScope {
    type Err = InvalidKeyScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-operation" => Ok(Self::PerOperation),
            "per-parent" => Ok(Self::PerParent),
            s => Err(InvalidKeyScope(s.to_string())),
        }
    }
}

// === impl Orchestrator ===

impl Orchestrator {
    pub fn new(
        scheduler: impl Schedule,
        resolver: impl GroupResolver,
        store: impl PolicyStore,
        status: impl StatusSink,
        cache: DerivativeCache,
        metrics: ReconcileMetrics,
        config: Config,
    ) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            reconciler: Arc::new(Reconciler {
                resolver: Arc::new(resolver),
                store: Arc::new(store),
                status: Arc::new(status),
                cache,
                metrics,
                retry: config.retry,
            }),
            key_scope: config.key_scope,
        }
    }

    /// Submits reconciliation for a newly observed parent.
    pub fn on_add(&self, parent: Parent) {
        if !parent.requires_derivative() {
            debug!(
                namespace = %parent.id().namespace,
                name = %parent.id().name,
                "NetworkPolicy does not have derivative policies, skipped",
            );
            return;
        }

        let id = parent.id().clone();
        let reconciler = self.reconciler.clone();
        self.submit(
            Op::Add,
            &id,
            Box::pin(async move { reconciler.reconcile(&parent).await }),
        );
    }

    /// Submits the work for a parent whose previously observed rules are
    /// unknown.
    ///
    /// A parent that requires a derivative is reconciled as an add.
    /// Otherwise any derivative left behind by an earlier version of the
    /// parent is deleted.
    pub fn on_resync(&self, parent: Parent) {
        if parent.requires_derivative() {
            return self.on_add(parent);
        }

        let id = parent.id().clone();
        let reconciler = self.reconciler.clone();
        self.submit(
            Op::Delete,
            &id,
            Box::pin(async move { reconciler.purge(&parent).await }),
        );
    }

    /// Submits the work needed to move from `old` to `new`.
    ///
    /// Returns true iff `new` requires a derivative. If `old` required one
    /// and `new` does not, the derivative is deleted.
    pub fn on_update(&self, old: Parent, new: Parent) -> bool {
        if !new.requires_derivative() {
            if old.requires_derivative() {
                info!(
                    namespace = %new.id().namespace,
                    name = %new.id().name,
                    "NetworkPolicy no longer has group rules; deleting derivative policies",
                );
                let id = old.id().clone();
                let reconciler = self.reconciler.clone();
                self.submit(
                    Op::Delete,
                    &id,
                    Box::pin(async move { reconciler.delete(&old).await }),
                );
            }
            return false;
        }

        let id = new.id().clone();
        let reconciler = self.reconciler.clone();
        self.submit(
            Op::Update,
            &id,
            Box::pin(async move { reconciler.reconcile(&new).await }),
        );
        true
    }

    /// Stops tracking the parent without touching the store.
    ///
    /// Used once the parent itself is gone; its derivatives are removed by
    /// the store through their owner references.
    pub fn on_delete_from_cache(&self, parent: &Parent) {
        if self.reconciler.cache.remove(parent.id()) {
            debug!(namespace = %parent.id().namespace, name = %parent.id().name, "Stopped tracking NetworkPolicy");
        }
    }

    /// Deletes the parent's derivatives from the store and stops tracking
    /// it.
    pub async fn on_delete(&self, parent: &Parent) -> Result<()> {
        self.reconciler.delete(parent).await
    }

    /// Re-resolves the tracked parents among `parents` so that derivatives
    /// follow group membership changes.
    pub fn refresh(&self, parents: impl IntoIterator<Item = Parent>) {
        for parent in parents {
            if !parent.requires_derivative() || !self.reconciler.cache.contains(parent.id()) {
                continue;
            }
            let id = parent.id().clone();
            let reconciler = self.reconciler.clone();
            self.submit(
                Op::Update,
                &id,
                Box::pin(async move { reconciler.reconcile(&parent).await }),
            );
        }
    }

    pub fn cache(&self) -> &DerivativeCache {
        &self.reconciler.cache
    }

    fn submit(&self, op: Op, id: &ParentId, work: Work) {
        let key = match self.key_scope {
            KeyScope::PerOperation => TaskKey::new(op, &id.namespace, &id.name),
            KeyScope::PerParent => TaskKey::parent(&id.namespace, &id.name),
        };
        debug!(%key, "Submitting reconciliation");
        self.scheduler.submit(key, work);
    }
}
