use super::network::Cidr;
use crate::labels::Selector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A network policy whose egress rules may reference external groups.
///
/// Policies that reference groups are never enforced directly; the
/// controller maintains a derivative `NetworkPolicy` with every group
/// replaced by the concrete networks it resolves to.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy.groups.io",
    version = "v1alpha1",
    kind = "NetworkPolicy",
    status = "NetworkPolicyStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub endpoint_selector: Selector,

    /// A present but empty list denies all ingress to the selected endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<IngressRule>>,

    /// A present but empty list denies all egress from the selected endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<EgressRule>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IngressRule {
    #[serde(rename = "fromCIDR", default, skip_serializing_if = "Option::is_none")]
    pub from_cidr: Option<Vec<Cidr>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct EgressRule {
    #[serde(rename = "toCIDR", default, skip_serializing_if = "Option::is_none")]
    pub to_cidr: Option<Vec<Cidr>>,

    #[serde(rename = "toGroups", default, skip_serializing_if = "Option::is_none")]
    pub to_groups: Option<Vec<Group>>,
}

/// References a group of addresses maintained by an external provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct Group {
    pub provider: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyStatus {
    /// The outcome of the last reconciliation, keyed by derivative name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derivative_policies: BTreeMap<String, DerivativeStatus>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,
}

// === impl NetworkPolicySpec ===

impl NetworkPolicySpec {
    /// Indicates whether any rule references an external group.
    pub fn requires_derivative(&self) -> bool {
        self.rules.iter().any(Rule::requires_derivative)
    }
}

// === impl Rule ===

impl Rule {
    pub fn requires_derivative(&self) -> bool {
        self.egress
            .iter()
            .flatten()
            .any(EgressRule::requires_derivative)
    }

    /// Returns a rule that denies all traffic to and from the selected
    /// endpoints.
    pub fn deny_all(endpoint_selector: Selector) -> Self {
        Self {
            endpoint_selector,
            ingress: Some(vec![]),
            egress: Some(vec![]),
        }
    }

    pub fn is_deny_all(&self) -> bool {
        matches!(&self.ingress, Some(rules) if rules.is_empty())
            && matches!(&self.egress, Some(rules) if rules.is_empty())
    }
}

// === impl EgressRule ===

impl EgressRule {
    pub fn requires_derivative(&self) -> bool {
        self.to_groups
            .as_ref()
            .map_or(false, |groups| !groups.is_empty())
    }
}
