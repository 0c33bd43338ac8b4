/// A network block as accepted in `toCIDR`/`fromCIDR` rule fields.
///
/// Bare addresses are accepted and treated as host-length networks.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(untagged)]
pub enum Cidr {
    Addr(std::net::IpAddr),
    Net(ipnet::IpNet),
}

#[derive(Debug, thiserror::Error)]
#[error("not a valid CIDR or IP address: {0}")]
pub struct CidrParseError(String);

// === impl Cidr ===

impl schemars::JsonSchema for Cidr {
    fn schema_name() -> String {
        "Cidr".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

impl std::str::FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(net) = s.parse() {
            return Ok(Self::Net(net));
        }

        if let Ok(addr) = s.parse() {
            return Ok(Self::Addr(addr));
        }

        Err(CidrParseError(s.to_string()))
    }
}

impl From<Cidr> for ipnet::IpNet {
    fn from(cidr: Cidr) -> ipnet::IpNet {
        match cidr {
            Cidr::Net(net) => net,
            Cidr::Addr(addr) => ipnet::IpNet::from(addr),
        }
    }
}

impl From<ipnet::IpNet> for Cidr {
    fn from(net: ipnet::IpNet) -> Self {
        Self::Net(net)
    }
}

impl From<std::net::IpAddr> for Cidr {
    fn from(net: std::net::IpAddr) -> Self {
        Self::Addr(net)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addr(addr) => addr.fmt(f),
            Self::Net(net) => net.fmt(f),
        }
    }
}
