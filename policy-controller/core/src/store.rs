use crate::{derivative::ParentId, k8s::policy::NetworkPolicy};
use anyhow::Result;

/// Writes derivative policies to the cluster.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Creates the policy, or replaces the policy of the same name.
    async fn upsert(&self, policy: NetworkPolicy) -> Result<NetworkPolicy>;

    /// Deletes every policy in the namespace matching the label selector.
    ///
    /// Succeeds when nothing matches.
    async fn delete_collection(&self, namespace: &str, label_selector: &str) -> Result<()>;
}

/// Records the outcome of a reconciliation on the parent policy.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync + 'static {
    async fn write_status(
        &self,
        parent: &ParentId,
        derivative: &str,
        error: Option<&str>,
    ) -> Result<()>;
}
