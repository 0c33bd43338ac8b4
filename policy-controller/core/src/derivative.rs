use crate::k8s::{
    policy::{NetworkPolicy, NetworkPolicySpec, Rule},
    ObjectMeta, Resource, Selector,
};
use std::{fmt, sync::Arc};

/// Labels a derivative policy with the uid of the policy it was derived from.
pub const PARENT_LABEL: &str = "policy.groups.io/parent";

const DERIVATIVE_SUFFIX: &str = "-derivative";

/// Identifies a parent policy.
///
/// The uid distinguishes a policy from a later one recreated under the same
/// name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ParentId {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// A user-authored policy along with its identity.
#[derive(Clone, Debug)]
pub struct Parent {
    id: ParentId,
    policy: Arc<NetworkPolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParentError {
    #[error("NetworkPolicy must have a namespace")]
    MissingNamespace,

    #[error("NetworkPolicy must have a name")]
    MissingName,

    #[error("NetworkPolicy must have a uid")]
    MissingUid,
}

/// Returns the name of the derivative maintained for the named parent.
pub fn derivative_name(parent: &str) -> String {
    format!("{parent}{DERIVATIVE_SUFFIX}")
}

/// Builds the fallback rules installed when a parent's groups cannot be
/// resolved.
///
/// Every endpoint selected by a group-based rule is denied all traffic. Rules
/// sharing a selector share a single deny-all rule.
pub fn deny_all_spec(spec: &NetworkPolicySpec) -> NetworkPolicySpec {
    let mut selectors = Vec::<&Selector>::new();
    for rule in spec.rules.iter().filter(|r| r.requires_derivative()) {
        if !selectors.contains(&&rule.endpoint_selector) {
            selectors.push(&rule.endpoint_selector);
        }
    }

    if selectors.is_empty() {
        return NetworkPolicySpec {
            rules: vec![Rule::deny_all(Selector::default())],
        };
    }

    NetworkPolicySpec {
        rules: selectors.into_iter().cloned().map(Rule::deny_all).collect(),
    }
}

// === impl ParentId ===

impl ParentId {
    /// Selects every derivative created for this parent, regardless of the
    /// derivative's name.
    pub fn label_selector(&self) -> String {
        format!("{}={}", PARENT_LABEL, self.uid)
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Parent ===

impl TryFrom<NetworkPolicy> for Parent {
    type Error = ParentError;

    fn try_from(policy: NetworkPolicy) -> Result<Self, Self::Error> {
        let meta = &policy.metadata;
        let id = ParentId {
            namespace: meta.namespace.clone().ok_or(ParentError::MissingNamespace)?,
            name: meta.name.clone().ok_or(ParentError::MissingName)?,
            uid: meta.uid.clone().ok_or(ParentError::MissingUid)?,
        };
        Ok(Self {
            id,
            policy: Arc::new(policy),
        })
    }
}

impl Parent {
    pub fn id(&self) -> &ParentId {
        &self.id
    }

    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    pub fn requires_derivative(&self) -> bool {
        self.policy.spec.requires_derivative()
    }

    pub fn derivative_name(&self) -> String {
        derivative_name(&self.id.name)
    }

    /// Wraps resolved rules in a derivative policy owned by this parent.
    pub fn derivative(&self, spec: NetworkPolicySpec) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(self.derivative_name()),
                namespace: Some(self.id.namespace.clone()),
                labels: Some(
                    Some((PARENT_LABEL.to_string(), self.id.uid.clone()))
                        .into_iter()
                        .collect(),
                ),
                owner_references: self.policy.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Returns the deny-all derivative installed when resolution fails.
    pub fn deny_all(&self) -> NetworkPolicy {
        self.derivative(deny_all_spec(&self.policy.spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::policy::{EgressRule, Group};
    use std::iter::FromIterator;

    fn group_rule(selector: Selector) -> Rule {
        Rule {
            endpoint_selector: selector,
            ingress: None,
            egress: Some(vec![EgressRule {
                to_cidr: None,
                to_groups: Some(vec![Group {
                    provider: "static".to_string(),
                    name: "db".to_string(),
                }]),
            }]),
        }
    }

    fn mk_policy(rules: Vec<Rule>) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("p".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            spec: NetworkPolicySpec { rules },
            status: None,
        }
    }

    #[test]
    fn parent_requires_identity() {
        let mut policy = mk_policy(vec![]);
        policy.metadata.uid = None;
        assert!(matches!(
            Parent::try_from(policy),
            Err(ParentError::MissingUid)
        ));

        let mut policy = mk_policy(vec![]);
        policy.metadata.namespace = None;
        assert!(matches!(
            Parent::try_from(policy),
            Err(ParentError::MissingNamespace)
        ));
    }

    #[test]
    fn derivative_is_labeled_and_owned() {
        let parent = Parent::try_from(mk_policy(vec![group_rule(Selector::default())])).unwrap();
        assert_eq!(parent.id().to_string(), "ns/p");
        assert_eq!(parent.id().label_selector(), "policy.groups.io/parent=u1");

        let derivative = parent.derivative(NetworkPolicySpec { rules: vec![] });
        assert_eq!(derivative.metadata.name.as_deref(), Some("p-derivative"));
        assert_eq!(derivative.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(
            derivative.metadata.labels,
            Some(maplit::btreemap! {
                PARENT_LABEL.to_string() => "u1".to_string(),
            })
        );
        let owners = derivative.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "u1");
        assert_eq!(owners[0].kind, "NetworkPolicy");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn deny_all_covers_each_group_selector_once() {
        let web = Selector::from_iter(Some(("app", "web")));
        let api = Selector::from_iter(Some(("app", "api")));
        let spec = NetworkPolicySpec {
            rules: vec![
                group_rule(web.clone()),
                Rule {
                    endpoint_selector: Selector::from_iter(Some(("app", "other"))),
                    ..Rule::default()
                },
                group_rule(api.clone()),
                group_rule(web.clone()),
            ],
        };

        let fallback = deny_all_spec(&spec);
        assert_eq!(
            fallback.rules,
            vec![Rule::deny_all(web), Rule::deny_all(api)]
        );
        assert!(!fallback.requires_derivative());
    }

    #[test]
    fn single_group_rule_yields_single_deny_all_rule() {
        let parent = Parent::try_from(mk_policy(vec![group_rule(Selector::default())])).unwrap();
        let fallback = parent.deny_all();
        assert_eq!(fallback.spec.rules.len(), 1);
        assert!(fallback.spec.rules[0].is_deny_all());
    }
}
