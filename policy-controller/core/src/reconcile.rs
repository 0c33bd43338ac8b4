use crate::{
    cache::DerivativeCache,
    derivative::Parent,
    k8s::policy::NetworkPolicy,
    metrics::{ErrorKind, ReconcileMetrics},
    resolve::GroupResolver,
    store::{PolicyStore, StatusSink},
};
use anyhow::Result;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info};

/// Bounds the calls made into group providers for a single reconciliation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// The number of resolution attempts, including the first.
    pub max_attempts: u32,

    /// The fixed delay between attempts.
    pub delay: time::Duration,
}

/// Runs the resolve, upsert and status steps for a single parent.
pub(crate) struct Reconciler {
    pub(crate) resolver: Arc<dyn GroupResolver>,
    pub(crate) store: Arc<dyn PolicyStore>,
    pub(crate) status: Arc<dyn StatusSink>,
    pub(crate) cache: DerivativeCache,
    pub(crate) metrics: ReconcileMetrics,
    pub(crate) retry: RetryConfig,
}

/// The derivative to write and, if resolution never succeeded, the last
/// resolution error.
pub(crate) struct Resolution {
    pub(crate) policy: NetworkPolicy,
    pub(crate) error: Option<anyhow::Error>,
}

// === impl RetryConfig ===

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: time::Duration::from_secs(5),
        }
    }
}

// === impl Reconciler ===

impl Reconciler {
    /// Resolves the parent's groups and writes its derivative.
    ///
    /// A derivative is always written: when resolution fails it denies all
    /// traffic. Resolution errors are reported only through the parent's
    /// status; store errors are also returned.
    pub(crate) async fn reconcile(&self, parent: &Parent) -> Result<()> {
        let Resolution { policy, error } = self.resolve(parent).await;
        let derivative = parent.derivative_name();

        if let Err(error) = self.upsert(parent, policy).await {
            self.metrics.inc_error(ErrorKind::Store);
            self.propagate_status(parent, &derivative, Some(&format!("{error:#}")))
                .await;
            return Err(error.context(format!(
                "failed to write NetworkPolicy {}/{}",
                parent.id().namespace,
                derivative
            )));
        }

        let error = error.map(|e| format!("{e:#}"));
        self.propagate_status(parent, &derivative, error.as_deref())
            .await;
        Ok(())
    }

    /// Attempts resolution a bounded number of times.
    ///
    /// Errors are absorbed rather than returned so that a failing provider
    /// is never called more often than the retry budget allows.
    pub(crate) async fn resolve(&self, parent: &Parent) -> Resolution {
        let id = parent.id();
        let attempts = self.retry.max_attempts.max(1);
        let mut fallback = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.resolver.resolve(parent).await {
                Ok(spec) => {
                    debug!(namespace = %id.namespace, name = %id.name, attempt, "Resolved groups");
                    return Resolution {
                        policy: parent.derivative(spec),
                        error: None,
                    };
                }
                Err(error) => {
                    self.metrics.inc_error(ErrorKind::Resolve);
                    error!(
                        namespace = %id.namespace,
                        name = %id.name,
                        attempt,
                        %error,
                        "Cannot resolve groups; installing deny-all derivative",
                    );
                    let fallback = fallback.get_or_insert_with(|| parent.deny_all());
                    let derivative = fallback.metadata.name.clone().unwrap_or_default();
                    self.propagate_status(parent, &derivative, Some(&format!("{error:#}")))
                        .await;
                    last_error = Some(error);
                }
            }

            if attempt < attempts {
                time::sleep(self.retry.delay).await;
            }
        }

        Resolution {
            policy: fallback.unwrap_or_else(|| parent.deny_all()),
            error: last_error,
        }
    }

    /// Writes the derivative and starts tracking the parent.
    async fn upsert(&self, parent: &Parent, policy: NetworkPolicy) -> Result<()> {
        self.store.upsert(policy).await?;
        self.cache.insert(parent.id().clone());
        debug!(namespace = %parent.id().namespace, name = %parent.id().name, "Wrote derivative");
        Ok(())
    }

    /// Records the outcome on the parent. Failures are logged and counted
    /// but never retried.
    async fn propagate_status(&self, parent: &Parent, derivative: &str, error: Option<&str>) {
        if let Err(error) = self.status.write_status(parent.id(), derivative, error).await {
            self.metrics.inc_error(ErrorKind::Status);
            error!(
                namespace = %parent.id().namespace,
                name = %parent.id().name,
                %error,
                "Cannot update NetworkPolicy status for derivative",
            );
        }
    }

    /// Deletes every derivative labeled with the parent's uid.
    ///
    /// The parent stays tracked if the store cannot delete its derivatives
    /// so that deletion may be attempted again.
    pub(crate) async fn delete(&self, parent: &Parent) -> Result<()> {
        let id = parent.id();
        if !parent.requires_derivative() {
            debug!(
                namespace = %id.namespace,
                name = %id.name,
                "NetworkPolicy does not have derivative policies, skipped",
            );
            return Ok(());
        }
        self.purge(parent).await
    }

    /// Deletes any derivatives labeled with the parent's uid, whatever the
    /// parent's current rules.
    ///
    /// Used when the parent's previous rules are unknown, e.g. after events
    /// were missed while another replica held the lease.
    pub(crate) async fn purge(&self, parent: &Parent) -> Result<()> {
        let id = parent.id();
        if let Err(error) = self
            .store
            .delete_collection(&id.namespace, &id.label_selector())
            .await
        {
            self.metrics.inc_error(ErrorKind::Store);
            return Err(error);
        }

        self.cache.remove(id);
        info!(namespace = %id.namespace, name = %id.name, "Deleted derivative policies");
        Ok(())
    }
}
