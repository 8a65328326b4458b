use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;

use crate::{Error, Result};

/// Cloudlet network scheme, parsed from a string such as
/// `cidr=10.101.X.0/24,floatingipnet=public,floatingipsubnet=public-v4,vnictype=direct`.
///
/// The `X` in the CIDR is the per-cluster third octet the provider fills in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkScheme {
    pub cidr: String,
    pub floating_ip_net: Option<String>,
    pub floating_ip_subnet: Option<String>,
    pub floating_ip_external_net: Option<String>,
    pub vnic_type: Option<String>,
}

impl NetworkScheme {
    pub fn uses_floating_ips(&self) -> bool {
        self.floating_ip_net.is_some()
    }

    /// The network covering every subnet the scheme can hand out
    /// (`10.101.X.0/24` widens to `10.101.0.0/16`).
    pub fn supernet(&self) -> Result<Ipv4Network> {
        let addr = self.cidr.replace('X', "0");
        let net: Ipv4Network = addr
            .parse()
            .map_err(|e| Error::Config(format!("network scheme cidr {}: {e}", self.cidr)))?;
        let octets = net.ip().octets();
        Ipv4Network::new(Ipv4Addr::new(octets[0], octets[1], 0, 0), 16)
            .map_err(|e| Error::Config(format!("network scheme cidr {}: {e}", self.cidr)))
    }

    pub fn vnic_type(&self) -> &str {
        self.vnic_type.as_deref().unwrap_or("normal")
    }
}

impl FromStr for NetworkScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut cidr = None;
        let mut scheme = NetworkScheme {
            cidr: String::new(),
            floating_ip_net: None,
            floating_ip_subnet: None,
            floating_ip_external_net: None,
            vnic_type: None,
        };
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("network scheme item {item:?} is not key=value")))?;
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "cidr" => cidr = Some(value),
                "floatingipnet" => scheme.floating_ip_net = Some(value),
                "floatingipsubnet" => scheme.floating_ip_subnet = Some(value),
                "floatingipextnet" => scheme.floating_ip_external_net = Some(value),
                "vnictype" => scheme.vnic_type = Some(value),
                other => {
                    return Err(Error::Config(format!("unknown network scheme key {other:?}")));
                }
            }
        }
        let cidr = cidr.ok_or_else(|| Error::Config(format!("network scheme {s:?} has no cidr")))?;
        let octets: Vec<&str> = cidr.split('/').next().unwrap_or_default().split('.').collect();
        if octets.len() != 4 || octets[2] != "X" || !cidr.ends_with("/24") {
            return Err(Error::Config(format!(
                "network scheme cidr {cidr:?} must look like a.b.X.0/24"
            )));
        }
        if scheme.floating_ip_net.is_some() != scheme.floating_ip_subnet.is_some() {
            return Err(Error::Config(
                "floatingipnet and floatingipsubnet must be set together".into(),
            ));
        }
        scheme.cidr = cidr;
        Ok(scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_scheme_parses() {
        let scheme: NetworkScheme = "cidr=10.101.X.0/24".parse().unwrap();
        assert_eq!(scheme.cidr, "10.101.X.0/24");
        assert!(!scheme.uses_floating_ips());
        assert_eq!(scheme.vnic_type(), "normal");
        assert_eq!(scheme.supernet().unwrap().to_string(), "10.101.0.0/16");
    }

    #[test]
    fn floating_ip_scheme_parses() {
        let scheme: NetworkScheme =
            "cidr=10.102.X.0/24,floatingipnet=public,floatingipsubnet=public-v4,vnictype=direct"
                .parse()
                .unwrap();
        assert!(scheme.uses_floating_ips());
        assert_eq!(scheme.floating_ip_net.as_deref(), Some("public"));
        assert_eq!(scheme.vnic_type(), "direct");
    }

    #[test]
    fn bad_schemes_are_configuration_errors() {
        for bad in [
            "",
            "cidr=10.101.0.0/24",
            "cidr=10.101.X.0/16",
            "cidr=10.101.X.0/24,color=blue",
            "cidr=10.101.X.0/24,floatingipnet=public",
            "cidr",
        ] {
            assert!(
                matches!(bad.parse::<NetworkScheme>(), Err(Error::Config(_))),
                "{bad:?} should not parse"
            );
        }
    }
}
