use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Placeholder for values the provider resolves during
/// `populate_orchestration_params` (subnet CIDR, fixed IPs, floating IP ids).
pub const NEXT_AVAILABLE: &str = "NextAvailable";

/// Server status reported once a VM is up.
pub const SERVER_ACTIVE: &str = "ACTIVE";

/// Boot volume device name.
pub const BOOT_VOLUME_DEVICE: &str = "vda";

/// Shared (NFS exported) volume device name.
pub const SHARED_VOLUME_DEVICE: &str = "vdb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

/// Role of a VM within a group. The role decides which ports get synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmType {
    RootLb,
    Platform,
    AppVm,
    ClusterMaster,
    ClusterK8sNode,
    ClusterDockerNode,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootLb => "rootlb",
            Self::Platform => "platform",
            Self::AppVm => "appvm",
            Self::ClusterMaster => "cluster-master",
            Self::ClusterK8sNode => "cluster-k8s-node",
            Self::ClusterDockerNode => "cluster-docker-node",
        }
    }

    pub fn is_load_balancer(&self) -> bool {
        matches!(self, Self::RootLb)
    }

    /// Cluster members that only make sense on the cluster subnet.
    pub fn requires_subnet(&self) -> bool {
        matches!(
            self,
            Self::ClusterMaster | Self::ClusterK8sNode | Self::ClusterDockerNode
        )
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Network,
    Subnet,
    SecurityGroup,
    Router,
    Flavor,
    Image,
    Server,
    Port,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security group",
            Self::Router => "router",
            Self::Flavor => "flavor",
            Self::Image => "image",
            Self::Server => "server",
            Self::Port => "port",
        };
        f.write_str(s)
    }
}

/// Cross-reference between resources of a plan.
///
/// `preexisting` resources live outside the plan (the external network, the
/// cloudlet security group) and are not expected in the plan's own lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceReference {
    pub name: String,
    pub id: String,
    pub preexisting: bool,
}

impl ResourceReference {
    pub fn new(name: impl Into<String>, id: impl Into<String>, preexisting: bool) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            preexisting,
        }
    }

    /// Reference to a resource created by the same plan.
    pub fn planned(name: impl Into<String>) -> Self {
        Self::new(name, "", false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Any => "any",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "any" => Ok(Self::Any),
            other => Err(Error::InvalidPlan(format!("unknown protocol {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// A single firewall rule. Port range `0..=0` means all ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub remote_cidr: String,
}

impl SecurityRule {
    /// Explicit "anything may leave" rule.
    pub fn allow_all_egress() -> Self {
        Self {
            direction: Direction::Egress,
            protocol: Protocol::Any,
            port_range_min: 0,
            port_range_max: 0,
            remote_cidr: "0.0.0.0/0".into(),
        }
    }

    pub fn ingress(protocol: Protocol, min: u16, max: u16, remote_cidr: impl Into<String>) -> Self {
        Self {
            direction: Direction::Ingress,
            protocol,
            port_range_min: min,
            port_range_max: max,
            remote_cidr: remote_cidr.into(),
        }
    }

    pub fn is_allow_all_egress(&self) -> bool {
        *self == Self::allow_all_egress()
    }
}

/// A port (or port range) exposed to the outside, parsed from `tcp:80` or
/// `udp:1000-2000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPort {
    pub protocol: Protocol,
    pub port_min: u16,
    pub port_max: u16,
}

impl AccessPort {
    /// Parse a comma-separated list. Empty input yields an empty list.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn to_ingress_rule(&self, remote_cidr: &str) -> SecurityRule {
        SecurityRule::ingress(self.protocol, self.port_min, self.port_max, remote_cidr)
    }
}

impl FromStr for AccessPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (proto, ports) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidPlan(format!("access port {s:?} is not proto:port")))?;
        let protocol: Protocol = proto.trim().parse()?;
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidPlan(format!("invalid port {p:?} in {s:?}")))
        };
        let (port_min, port_max) = match ports.split_once('-') {
            Some((lo, hi)) => (parse_port(lo)?, parse_port(hi)?),
            None => {
                let p = parse_port(ports)?;
                (p, p)
            }
        };
        if port_min == 0 || port_min > port_max {
            return Err(Error::InvalidPlan(format!("invalid port range in {s:?}")));
        }
        Ok(Self {
            protocol,
            port_min,
            port_max,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetOrchestrationParams {
    pub name: String,
    pub id: String,
    pub network_name: String,
    /// Resolved CIDR, or [`NEXT_AVAILABLE`] before population.
    pub cidr: String,
    /// Scheme pattern with an `X` third octet, e.g. `10.101.X.0/24`.
    pub cidr_pattern: String,
    /// Resolved gateway, [`NEXT_AVAILABLE`] before population, empty when skipped.
    pub gateway_ip: String,
    pub skip_gateway: bool,
    pub dhcp_enabled: bool,
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedIpOrchestrationParams {
    pub last_ip_octet: u32,
    /// Resolved address, or [`NEXT_AVAILABLE`] before population.
    pub address: String,
    pub subnet: ResourceReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    External,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortOrchestrationParams {
    pub name: String,
    pub id: String,
    pub network_name: String,
    pub network_id: String,
    pub network_type: NetworkType,
    pub vnic_type: String,
    pub fixed_ips: Vec<FixedIpOrchestrationParams>,
    pub security_groups: Vec<ResourceReference>,
    /// Port is created with the group but attached later (router ports).
    pub skip_attach_vm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupOrchestrationParams {
    pub name: String,
    pub access_ports: Vec<AccessPort>,
    pub egress_restricted: bool,
    pub egress_rules: Vec<SecurityRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIpOrchestrationParams {
    pub name: String,
    /// Positional template parameter: `floatingIpId`, `floatingIpId2`, ...
    pub param_name: String,
    pub floating_ip_id: String,
    /// External network the address is allocated from.
    pub pool: String,
    pub port: ResourceReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterInterfaceOrchestrationParams {
    pub router_name: String,
    pub router_port: ResourceReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeOrchestrationParams {
    pub name: String,
    /// Image the volume is cloned from; empty for blank volumes.
    pub image_name: String,
    pub size_gb: u64,
    pub device_name: String,
    pub unit_number: u32,
    pub attach_external_disk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmOrchestrationParams {
    pub name: String,
    pub id: String,
    pub role: VmType,
    /// Boot image, empty when a boot volume supplies the disk.
    pub image_name: String,
    pub hostname: String,
    pub flavor_name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub compute_availability_zone: Option<String>,
    pub ports: Vec<ResourceReference>,
    pub volumes: Vec<VolumeOrchestrationParams>,
    pub shared_volume: bool,
    /// Base64 encoded cloud-init document.
    pub user_data: String,
}

impl VmOrchestrationParams {
    pub fn boot_volume(&self) -> Option<&VolumeOrchestrationParams> {
        self.volumes
            .iter()
            .find(|v| v.device_name == BOOT_VOLUME_DEVICE)
    }
}

/// Fully resolved description of every resource a VM group needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmGroupOrchestrationParams {
    pub group_name: String,
    pub subnets: Vec<SubnetOrchestrationParams>,
    pub ports: Vec<PortOrchestrationParams>,
    pub router_interfaces: Vec<RouterInterfaceOrchestrationParams>,
    pub security_groups: Vec<SecurityGroupOrchestrationParams>,
    pub floating_ips: Vec<FloatingIpOrchestrationParams>,
    pub vms: Vec<VmOrchestrationParams>,
    pub skip_default_secgrp: bool,
    pub skip_subnet_gateway: bool,
    pub skip_cleanup_on_failure: bool,
}

impl VmGroupOrchestrationParams {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    pub fn port(&self, name: &str) -> Option<&PortOrchestrationParams> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn vm(&self, name: &str) -> Option<&VmOrchestrationParams> {
        self.vms.iter().find(|v| v.name == name)
    }

    pub fn subnet(&self, name: &str) -> Option<&SubnetOrchestrationParams> {
        self.subnets.iter().find(|s| s.name == name)
    }

    /// Check referential integrity: every planned reference points at a
    /// resource of this plan, and names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut vm_names = HashSet::new();
        for vm in &self.vms {
            if !vm_names.insert(vm.name.as_str()) {
                return Err(Error::InvalidPlan(format!("duplicate vm name {}", vm.name)));
            }
        }
        let mut port_names = HashSet::new();
        for port in &self.ports {
            if !port_names.insert(port.name.as_str()) {
                return Err(Error::InvalidPlan(format!("duplicate port name {}", port.name)));
            }
        }
        let subnet_names: HashSet<&str> = self.subnets.iter().map(|s| s.name.as_str()).collect();
        let secgrp_names: HashSet<&str> = self
            .security_groups
            .iter()
            .map(|s| s.name.as_str())
            .collect();

        for port in &self.ports {
            for fip in &port.fixed_ips {
                if !fip.subnet.preexisting && !subnet_names.contains(fip.subnet.name.as_str()) {
                    return Err(Error::InvalidPlan(format!(
                        "port {} references unknown subnet {}",
                        port.name, fip.subnet.name
                    )));
                }
            }
            for sg in &port.security_groups {
                if !sg.preexisting && !secgrp_names.contains(sg.name.as_str()) {
                    return Err(Error::InvalidPlan(format!(
                        "port {} references unknown security group {}",
                        port.name, sg.name
                    )));
                }
            }
        }
        for vm in &self.vms {
            for port in &vm.ports {
                if !port.preexisting && !port_names.contains(port.name.as_str()) {
                    return Err(Error::InvalidPlan(format!(
                        "vm {} references unknown port {}",
                        vm.name, port.name
                    )));
                }
            }
        }
        for fip in &self.floating_ips {
            if !port_names.contains(fip.port.name.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "floating ip {} references unknown port {}",
                    fip.name, fip.port.name
                )));
            }
        }
        for ri in &self.router_interfaces {
            if !port_names.contains(ri.router_port.name.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "router interface on {} references unknown port {}",
                    ri.router_name, ri.router_port.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve every [`NEXT_AVAILABLE`] subnet of the plan onto the given
    /// third octet, along with its gateway and the fixed IPs on it.
    ///
    /// Subnets that are already resolved are left alone, so calling this twice
    /// never renumbers a group.
    pub fn resolve_next_available(&mut self, third_octet: u8) -> Result<()> {
        let mut resolved = Vec::new();
        for subnet in &mut self.subnets {
            if subnet.cidr != NEXT_AVAILABLE {
                continue;
            }
            subnet.cidr = substitute_octet(&subnet.cidr_pattern, third_octet, None)?;
            if !subnet.skip_gateway {
                subnet.gateway_ip = substitute_octet(&subnet.cidr_pattern, third_octet, Some(1))?;
            }
            resolved.push((subnet.name.clone(), subnet.cidr_pattern.clone()));
        }
        for port in &mut self.ports {
            for fip in &mut port.fixed_ips {
                if fip.address != NEXT_AVAILABLE {
                    continue;
                }
                if let Some((_, pattern)) = resolved.iter().find(|(n, _)| *n == fip.subnet.name) {
                    fip.address =
                        substitute_octet(pattern, third_octet, Some(fip.last_ip_octet))?;
                }
            }
        }
        Ok(())
    }
}

/// Replace the `X` octet of a `a.b.X.d/nn` pattern. With `last` set, return the
/// host address with that final octet instead of the network CIDR.
fn substitute_octet(pattern: &str, third: u8, last: Option<u32>) -> Result<String> {
    let (addr, prefix) = pattern
        .split_once('/')
        .ok_or_else(|| Error::InvalidPlan(format!("cidr pattern {pattern:?} has no prefix")))?;
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 || octets[2] != "X" {
        return Err(Error::InvalidPlan(format!(
            "cidr pattern {pattern:?} must look like a.b.X.d/nn"
        )));
    }
    match last {
        Some(last) => {
            if last == 0 || last > 254 {
                return Err(Error::InvalidPlan(format!("invalid last ip octet {last}")));
            }
            Ok(format!("{}.{}.{third}.{last}", octets[0], octets[1]))
        }
        None => Ok(format!(
            "{}.{}.{third}.{}/{prefix}",
            octets[0], octets[1], octets[3]
        )),
    }
}

/// A resolved network address on a server port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIp {
    pub network: String,
    pub subnet: String,
    pub port_name: String,
    pub mac_address: String,
    pub internal_addr: String,
    /// Equal to `internal_addr` unless a floating IP is bound.
    pub external_addr: String,
    pub external_addr_is_floating: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetail {
    pub name: String,
    pub id: String,
    pub status: String,
    pub addresses: Vec<ServerIp>,
}

impl ServerDetail {
    pub fn is_active(&self) -> bool {
        self.status == SERVER_ACTIVE
    }

    pub fn ip_on_network(&self, network: &str) -> Option<&ServerIp> {
        self.addresses.iter().find(|a| a.network == network)
    }

    pub fn ip_on_subnet(&self, subnet: &str) -> Option<&ServerIp> {
        self.addresses.iter().find(|a| a.subnet == subnet)
    }

    pub fn ip_on_port(&self, port_name: &str) -> Option<&ServerIp> {
        self.addresses.iter().find(|a| a.port_name == port_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorInfo {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub gpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(name: &str) -> SubnetOrchestrationParams {
        SubnetOrchestrationParams {
            name: name.into(),
            id: String::new(),
            network_name: "mex-k8s-net-1".into(),
            cidr: NEXT_AVAILABLE.into(),
            cidr_pattern: "10.101.X.0/24".into(),
            gateway_ip: NEXT_AVAILABLE.into(),
            skip_gateway: false,
            dhcp_enabled: true,
            dns_servers: vec![],
        }
    }

    fn internal_port(name: &str, subnet: &str, octet: u32) -> PortOrchestrationParams {
        PortOrchestrationParams {
            name: name.into(),
            id: String::new(),
            network_name: "mex-k8s-net-1".into(),
            network_id: String::new(),
            network_type: NetworkType::Internal,
            vnic_type: "normal".into(),
            fixed_ips: vec![FixedIpOrchestrationParams {
                last_ip_octet: octet,
                address: NEXT_AVAILABLE.into(),
                subnet: ResourceReference::planned(subnet),
            }],
            security_groups: vec![],
            skip_attach_vm: false,
        }
    }

    #[test]
    fn access_ports_parse_single_ports_and_ranges() {
        let ports = AccessPort::parse_list("tcp:80, udp:1000-2000").unwrap();
        assert_eq!(
            ports,
            vec![
                AccessPort {
                    protocol: Protocol::Tcp,
                    port_min: 80,
                    port_max: 80
                },
                AccessPort {
                    protocol: Protocol::Udp,
                    port_min: 1000,
                    port_max: 2000
                },
            ]
        );
        assert!(AccessPort::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn access_ports_reject_garbage() {
        assert!("tcp".parse::<AccessPort>().is_err());
        assert!("sctp:80".parse::<AccessPort>().is_err());
        assert!("tcp:90-80".parse::<AccessPort>().is_err());
        assert!("tcp:0".parse::<AccessPort>().is_err());
        assert!("tcp:http".parse::<AccessPort>().is_err());
    }

    #[test]
    fn next_available_resolution_fills_cidr_gateway_and_fixed_ips_once() {
        let mut plan = VmGroupOrchestrationParams::new("g");
        plan.subnets.push(subnet("s1"));
        plan.ports.push(internal_port("p1", "s1", 10));

        plan.resolve_next_available(7).unwrap();
        assert_eq!(plan.subnets[0].cidr, "10.101.7.0/24");
        assert_eq!(plan.subnets[0].gateway_ip, "10.101.7.1");
        assert_eq!(plan.ports[0].fixed_ips[0].address, "10.101.7.10");

        // a second pass must not renumber
        plan.resolve_next_available(9).unwrap();
        assert_eq!(plan.subnets[0].cidr, "10.101.7.0/24");
        assert_eq!(plan.ports[0].fixed_ips[0].address, "10.101.7.10");
    }

    #[test]
    fn skipped_gateway_stays_empty() {
        let mut plan = VmGroupOrchestrationParams::new("g");
        let mut s = subnet("s1");
        s.skip_gateway = true;
        s.gateway_ip = String::new();
        plan.subnets.push(s);
        plan.resolve_next_available(3).unwrap();
        assert_eq!(plan.subnets[0].gateway_ip, "");
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        let mut plan = VmGroupOrchestrationParams::new("g");
        let mut s = subnet("s1");
        s.cidr_pattern = "10.101.0.0/24".into();
        plan.subnets.push(s);
        assert!(plan.resolve_next_available(3).is_err());
    }

    #[test]
    fn validate_catches_dangling_references() {
        let mut plan = VmGroupOrchestrationParams::new("g");
        plan.ports.push(internal_port("p1", "missing", 10));
        assert!(plan.validate().is_err());

        plan.subnets.push(subnet("missing"));
        assert!(plan.validate().is_ok());

        plan.floating_ips.push(FloatingIpOrchestrationParams {
            name: "fip".into(),
            param_name: "floatingIpId".into(),
            floating_ip_id: NEXT_AVAILABLE.into(),
            pool: "internet".into(),
            port: ResourceReference::planned("nope"),
        });
        assert!(plan.validate().is_err());
    }

    #[test]
    fn allow_all_egress_is_recognizable() {
        assert!(SecurityRule::allow_all_egress().is_allow_all_egress());
        assert!(!SecurityRule::ingress(Protocol::Tcp, 22, 22, "0.0.0.0/0").is_allow_all_egress());
    }
}
