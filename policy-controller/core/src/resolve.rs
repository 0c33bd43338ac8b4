use crate::{
    derivative::Parent,
    k8s::policy::{Cidr, CidrParseError, EgressRule, NetworkPolicySpec, Rule},
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

/// The provider name under which [`StaticProvider`] is registered.
pub const STATIC_PROVIDER: &str = "static";

/// Resolves a parent's group-based rules into concrete rules.
#[async_trait::async_trait]
pub trait GroupResolver: Send + Sync + 'static {
    async fn resolve(&self, parent: &Parent) -> Result<NetworkPolicySpec>;
}

/// Looks up the current members of a group.
#[async_trait::async_trait]
pub trait GroupProvider: Send + Sync + 'static {
    async fn cidrs(&self, namespace: &str, group: &str) -> Result<Vec<Cidr>>;
}

/// Resolves groups through the provider named by each group reference.
#[derive(Clone, Default)]
pub struct ProviderResolver {
    providers: HashMap<String, Arc<dyn GroupProvider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no provider registered for group {provider}/{name}")]
    UnknownProvider { provider: String, name: String },

    #[error("failed to resolve group {provider}/{name}")]
    Provider {
        provider: String,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Serves groups from a fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticProvider {
    groups: HashMap<String, Vec<Cidr>>,
}

/// A statically configured group, parsed from `NAME=CIDR[,CIDR...]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticGroup {
    pub name: String,
    pub cidrs: Vec<Cidr>,
}

#[derive(Debug, thiserror::Error)]
pub enum StaticGroupError {
    #[error("static group must be of the form NAME=CIDR[,CIDR...]: {0:?}")]
    Malformed(String),

    #[error(transparent)]
    Cidr(#[from] CidrParseError),
}

// === impl ProviderResolver ===

impl ProviderResolver {
    pub fn with_provider(mut self, name: impl ToString, provider: impl GroupProvider) -> Self {
        self.providers.insert(name.to_string(), Arc::new(provider));
        self
    }

    /// Replaces each egress rule's groups with the networks they resolve to.
    ///
    /// Rules that do not reference groups are copied unchanged.
    async fn resolve_egress(
        &self,
        namespace: &str,
        rule: &EgressRule,
    ) -> Result<EgressRule, ResolveError> {
        if !rule.requires_derivative() {
            return Ok(rule.clone());
        }

        let mut cidrs = rule
            .to_cidr
            .iter()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>();
        for group in rule.to_groups.iter().flatten() {
            let provider = self.providers.get(&group.provider).ok_or_else(|| {
                ResolveError::UnknownProvider {
                    provider: group.provider.clone(),
                    name: group.name.clone(),
                }
            })?;
            let members = provider
                .cidrs(namespace, &group.name)
                .await
                .map_err(|source| ResolveError::Provider {
                    provider: group.provider.clone(),
                    name: group.name.clone(),
                    source: source.into(),
                })?;
            cidrs.extend(members);
        }

        Ok(EgressRule {
            to_cidr: Some(cidrs.into_iter().collect()),
            to_groups: None,
        })
    }
}

impl fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderResolver")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl GroupResolver for ProviderResolver {
    async fn resolve(&self, parent: &Parent) -> Result<NetworkPolicySpec> {
        let namespace = &parent.id().namespace;
        let mut rules = Vec::with_capacity(parent.policy().spec.rules.len());
        for rule in &parent.policy().spec.rules {
            let egress = match &rule.egress {
                None => None,
                Some(egress) => {
                    let mut resolved = Vec::with_capacity(egress.len());
                    for e in egress {
                        resolved.push(self.resolve_egress(namespace, e).await?);
                    }
                    Some(resolved)
                }
            };
            rules.push(Rule {
                endpoint_selector: rule.endpoint_selector.clone(),
                ingress: rule.ingress.clone(),
                egress,
            });
        }
        Ok(NetworkPolicySpec { rules })
    }
}

// === impl StaticProvider ===

impl std::iter::FromIterator<StaticGroup> for StaticProvider {
    fn from_iter<T: IntoIterator<Item = StaticGroup>>(iter: T) -> Self {
        Self {
            groups: iter.into_iter().map(|g| (g.name, g.cidrs)).collect(),
        }
    }
}

#[async_trait::async_trait]
impl GroupProvider for StaticProvider {
    async fn cidrs(&self, _namespace: &str, group: &str) -> Result<Vec<Cidr>> {
        self.groups
            .get(group)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown static group {group:?}"))
    }
}

// === impl StaticGroup ===

impl FromStr for StaticGroup {
    type Err = StaticGroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, cidrs) = s
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| StaticGroupError::Malformed(s.to_string()))?;
        let cidrs = cidrs
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Cidr::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            cidrs,
        })
    }
}
