pub mod network;
pub mod network_policy;

pub use self::{
    network::{Cidr, CidrParseError},
    network_policy::{
        DerivativeStatus, EgressRule, Group, IngressRule, NetworkPolicy, NetworkPolicySpec,
        NetworkPolicyStatus, Rule,
    },
};
