use crate::{
    core::PolicyStore,
    k8s::{self, policy::NetworkPolicy, DeleteParams, ListParams, Patch, PatchParams},
    status::FIELD_MANAGER,
};
use anyhow::{Context, Result};
use tokio::time;

/// Writes derivative policies with server-side apply.
#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
    timeout: time::Duration,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait::async_trait]
impl PolicyStore for KubeStore {
    async fn upsert(&self, policy: NetworkPolicy) -> Result<NetworkPolicy> {
        let namespace = policy
            .metadata
            .namespace
            .clone()
            .context("NetworkPolicy must have a namespace")?;
        let name = policy
            .metadata
            .name
            .clone()
            .context("NetworkPolicy must have a name")?;
        let api = k8s::Api::<NetworkPolicy>::namespaced(self.client.clone(), &namespace);

        // Derivatives are owned by this controller, so conflicting field
        // managers are overridden.
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let policy = time::timeout(self.timeout, api.patch(&name, &params, &Patch::Apply(&policy)))
            .await
            .with_context(|| format!("timed out applying NetworkPolicy {namespace}/{name}"))?
            .with_context(|| format!("failed to apply NetworkPolicy {namespace}/{name}"))?;
        tracing::debug!(%namespace, %name, "Applied NetworkPolicy");
        Ok(policy)
    }

    async fn delete_collection(&self, namespace: &str, label_selector: &str) -> Result<()> {
        let api = k8s::Api::<NetworkPolicy>::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        time::timeout(
            self.timeout,
            api.delete_collection(&DeleteParams::background(), &params),
        )
        .await
        .with_context(|| format!("timed out deleting NetworkPolicies in {namespace}"))?
        .with_context(|| {
            format!("failed to delete NetworkPolicies in {namespace} matching {label_selector}")
        })?;
        tracing::debug!(%namespace, %label_selector, "Deleted NetworkPolicies");
        Ok(())
    }
}
