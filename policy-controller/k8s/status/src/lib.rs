//! Records reconciliation outcomes on parent `NetworkPolicy` resources.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use groups_policy_controller_core::{ParentId, StatusSink};
use groups_policy_controller_k8s_api::{self as k8s, policy::NetworkPolicy};
use tokio::time;


const POLICY_API_VERSION: &str = "policy.groups.io/v1alpha1";
pub const FIELD_MANAGER: &str = "policy.groups.io";

/// Merge-patches the `status` subresource of parent policies.
///
/// Each derivative has its own entry under `status.derivativePolicies`, so a
/// patch never clobbers the outcome recorded for another derivative.
#[derive(Clone)]
pub struct StatusPatcher {
    client: k8s::Client,
    timeout: time::Duration,
}

// === impl StatusPatcher ===

impl StatusPatcher {
    pub fn new(client: k8s::Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait::async_trait]
impl StatusSink for StatusPatcher {
    async fn write_status(
        &self,
        parent: &ParentId,
        derivative: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let api = k8s::Api::<NetworkPolicy>::namespaced(self.client.clone(), &parent.namespace);
        let patch = make_patch(derivative, error, Utc::now());
        let params = k8s::PatchParams::apply(FIELD_MANAGER);

        time::timeout(self.timeout, api.patch_status(&parent.name, &params, &patch))
            .await
            .with_context(|| format!("timed out patching NetworkPolicy {parent} status"))?
            .with_context(|| format!("failed to patch NetworkPolicy {parent} status"))?;
        tracing::debug!(
            namespace = %parent.namespace,
            name = %parent.name,
            %derivative,
            ok = error.is_none(),
            "Patched status",
        );
        Ok(())
    }
}

/// Builds a merge patch recording the outcome for a single derivative.
///
/// A successful outcome clears any previously recorded error.
pub(crate) fn make_patch(
    derivative: &str,
    error: Option<&str>,
    timestamp: DateTime<Utc>,
) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": POLICY_API_VERSION,
        "kind": "NetworkPolicy",
        "status": {
            "derivativePolicies": {
                derivative: {
                    "ok": error.is_none(),
                    "error": error,
                    "lastUpdated": timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                },
            },
        },
    });
    k8s::Patch::Merge(value)
}
