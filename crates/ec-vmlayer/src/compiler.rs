//! Expands a [`VmGroupRequestSpec`] into a fully described
//! [`VmGroupOrchestrationParams`].
//!
//! Compilation is split in two. [`gather_lookups`] performs the read-only
//! provider queries a compile depends on; [`compile`] is a pure function of
//! the request, the platform configuration, and those lookups.

use ec_infra::VmProvider;
use ec_infra::types::{
    BOOT_VOLUME_DEVICE, FixedIpOrchestrationParams, FlavorInfo, FloatingIpOrchestrationParams,
    NEXT_AVAILABLE, NetworkType, PortOrchestrationParams, ResourceReference, ResourceType,
    RouterInterfaceOrchestrationParams, SHARED_VOLUME_DEVICE, SecurityGroupOrchestrationParams,
    SubnetOrchestrationParams, VmGroupOrchestrationParams, VmOrchestrationParams, VmType,
    VolumeOrchestrationParams,
};
use tracing::debug;

use crate::cloudinit::{ChefParams, CloudConfigParams};
use crate::config::PlatformConfig;
use crate::names;
use crate::netscheme::NetworkScheme;
use crate::security;
use crate::spec::{VmGroupRequestSpec, VmRequestSpec};
use crate::{Error, Result};

/// Last octet of a load balancer's (or router's) internal address, which is
/// also the subnet gateway.
pub const GATEWAY_OCTET: u32 = 1;
pub const MASTER_OCTET: u32 = 10;
/// First octet handed out to VMs without a reserved address.
pub const FIRST_NODE_OCTET: u32 = 101;

/// Boot command added to VMs on GPU flavors so the node can be found
/// for driver installation.
pub const GPU_BOOT_COMMAND: &str = "mkdir -p /etc/edgecloud && touch /etc/edgecloud/gpu-node";

/// Provider facts a compile depends on.
#[derive(Debug, Clone, Default)]
pub struct CompileLookups {
    pub flavors: Vec<FlavorInfo>,
    /// Empty when the default security group is skipped.
    pub cloudlet_secgrp_id: String,
    /// Id of the network external ports are created on.
    pub external_network_id: String,
    /// Present when the external router was verified to exist.
    pub router_id: Option<String>,
}

impl CompileLookups {
    fn flavor(&self, name: &str) -> Result<&FlavorInfo> {
        self.flavors
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::Lookup(format!("flavor {name} not found")))
    }
}

/// Name of the network external ports attach to: the floating IP network
/// when the scheme uses floating IPs, the external network otherwise.
pub(crate) fn external_port_network(config: &PlatformConfig, scheme: &NetworkScheme) -> String {
    scheme
        .floating_ip_net
        .clone()
        .unwrap_or_else(|| config.external_network.clone())
}

fn lookup_error(what: &str, name: &str, err: ec_infra::Error) -> Error {
    match err {
        ec_infra::Error::NotFound { .. } => Error::Lookup(format!("{what} {name}: {err}")),
        other => other.into(),
    }
}

/// Query the provider for everything [`compile`] needs.
pub async fn gather_lookups(
    provider: &dyn VmProvider,
    config: &PlatformConfig,
    spec: &VmGroupRequestSpec,
) -> Result<CompileLookups> {
    let scheme = config.parsed_network_scheme()?;
    let flavors = provider.get_flavor_list().await?;

    let ext_net = external_port_network(config, &scheme);
    let external_network_id = provider
        .get_resource_id(ResourceType::Network, &ext_net)
        .await
        .map_err(|e| lookup_error("external network", &ext_net, e))?;

    let cloudlet_secgrp_id = if spec.options.skip_default_secgrp {
        String::new()
    } else {
        provider
            .get_resource_id(ResourceType::SecurityGroup, &config.cloudlet_secgrp_name)
            .await
            .map_err(|e| lookup_error("cloudlet security group", &config.cloudlet_secgrp_name, e))?
    };

    let router_id = match &config.external_router {
        Some(router) => Some(
            provider
                .get_resource_id(ResourceType::Router, router)
                .await
                .map_err(|e| lookup_error("external router", router, e))?,
        ),
        None => None,
    };

    Ok(CompileLookups {
        flavors,
        cloudlet_secgrp_id,
        external_network_id,
        router_id,
    })
}

/// Per-compile bookkeeping.
struct Compiler<'a> {
    spec: &'a VmGroupRequestSpec,
    config: &'a PlatformConfig,
    lookups: &'a CompileLookups,
    scheme: NetworkScheme,
    group_secgrp: String,
    next_octet: u32,
    plan: VmGroupOrchestrationParams,
}

/// Compile a request into a plan. Subnet CIDRs, fixed IPs, and floating IP
/// ids are left as [`NEXT_AVAILABLE`] for the provider to resolve.
pub fn compile(
    spec: &VmGroupRequestSpec,
    config: &PlatformConfig,
    lookups: &CompileLookups,
) -> Result<VmGroupOrchestrationParams> {
    let scheme = config.parsed_network_scheme()?;
    let group_secgrp = spec
        .options
        .new_secgrp_name
        .clone()
        .unwrap_or_else(|| names::secgrp_name(&spec.group_name));

    let opts = &spec.options;
    let mut plan = VmGroupOrchestrationParams::new(&spec.group_name);
    plan.skip_default_secgrp = opts.skip_default_secgrp;
    plan.skip_subnet_gateway = opts.skip_subnet_gateway;
    plan.skip_cleanup_on_failure = opts.skip_cleanup_on_failure;

    let mut compiler = Compiler {
        spec,
        config,
        lookups,
        scheme,
        group_secgrp,
        next_octet: FIRST_NODE_OCTET,
        plan,
    };
    compiler.add_security_group();
    compiler.add_subnet();
    for vm in &spec.vms {
        compiler.add_vm(vm)?;
    }

    let plan = compiler.plan;
    plan.validate()
        .map_err(|e| Error::Config(format!("compiled plan for {}: {e}", spec.group_name)))?;
    debug!(
        group = %plan.group_name,
        vms = plan.vms.len(),
        ports = plan.ports.len(),
        "compiled orchestration params"
    );
    Ok(plan)
}

impl Compiler<'_> {
    fn router_active(&self) -> bool {
        self.config.external_router.is_some() && self.spec.options.new_subnet_name.is_some()
    }

    fn cloudlet_secgrp_ref(&self) -> ResourceReference {
        ResourceReference::new(
            &self.config.cloudlet_secgrp_name,
            &self.lookups.cloudlet_secgrp_id,
            true,
        )
    }

    /// Security group for internal ports. With a router the cloudlet group
    /// already governs traffic between subnets.
    fn internal_secgrp_ref(&self) -> ResourceReference {
        if self.router_active() && !self.spec.options.skip_default_secgrp {
            self.cloudlet_secgrp_ref()
        } else {
            ResourceReference::planned(&self.group_secgrp)
        }
    }

    fn add_security_group(&mut self) {
        let policy = self.spec.options.privacy_policy.as_ref();
        self.plan.security_groups.push(SecurityGroupOrchestrationParams {
            name: self.group_secgrp.clone(),
            access_ports: self.spec.options.access_ports.clone(),
            egress_restricted: policy.is_some(),
            egress_rules: policy
                .map(|p| security::egress_rules(&p.outbound_security_rules))
                .unwrap_or_default(),
        });
    }

    fn add_subnet(&mut self) {
        let Some(subnet) = self.spec.options.new_subnet_name.clone() else {
            return;
        };
        let skip_gateway = self.spec.options.skip_subnet_gateway;
        self.plan.subnets.push(SubnetOrchestrationParams {
            name: subnet.clone(),
            id: String::new(),
            network_name: self.config.internal_network.clone(),
            cidr: NEXT_AVAILABLE.into(),
            cidr_pattern: self.scheme.cidr.clone(),
            gateway_ip: if skip_gateway {
                String::new()
            } else {
                NEXT_AVAILABLE.into()
            },
            skip_gateway,
            dhcp_enabled: true,
            dns_servers: if self.config.subnet_dns {
                self.config.dns_servers.clone()
            } else {
                Vec::new()
            },
        });

        if let Some(router) = self.config.external_router.clone() {
            let port = format!("{subnet}-router-port");
            let sg = self.internal_secgrp_ref();
            let router_port = self.internal_port(&port, &subnet, GATEWAY_OCTET, sg, true);
            self.plan.ports.push(router_port);
            self.plan.router_interfaces.push(RouterInterfaceOrchestrationParams {
                router_name: router,
                router_port: ResourceReference::planned(port),
            });
        }
    }

    fn internal_port(
        &self,
        name: &str,
        subnet: &str,
        octet: u32,
        secgrp: ResourceReference,
        skip_attach_vm: bool,
    ) -> PortOrchestrationParams {
        PortOrchestrationParams {
            name: name.to_string(),
            id: String::new(),
            network_name: self.config.internal_network.clone(),
            network_id: String::new(),
            network_type: NetworkType::Internal,
            vnic_type: self.scheme.vnic_type().to_string(),
            fixed_ips: vec![FixedIpOrchestrationParams {
                last_ip_octet: octet,
                address: NEXT_AVAILABLE.into(),
                subnet: ResourceReference::planned(subnet),
            }],
            security_groups: vec![secgrp],
            skip_attach_vm,
        }
    }

    fn add_external_port(&mut self, vm: &VmRequestSpec) -> ResourceReference {
        let network = external_port_network(self.config, &self.scheme);
        let name = names::external_port_name(&vm.name, &network);
        let mut security_groups = vec![ResourceReference::planned(&self.group_secgrp)];
        if !self.spec.options.skip_default_secgrp {
            security_groups.push(self.cloudlet_secgrp_ref());
        }
        self.plan.ports.push(PortOrchestrationParams {
            name: name.clone(),
            id: String::new(),
            network_name: network,
            network_id: self.lookups.external_network_id.clone(),
            network_type: NetworkType::External,
            vnic_type: self.scheme.vnic_type().to_string(),
            fixed_ips: Vec::new(),
            security_groups,
            skip_attach_vm: false,
        });

        if self.scheme.uses_floating_ips() {
            let n = self.plan.floating_ips.len();
            let param_name = if n == 0 {
                "floatingIpId".to_string()
            } else {
                format!("floatingIpId{}", n + 1)
            };
            self.plan.floating_ips.push(FloatingIpOrchestrationParams {
                name: format!("{name}-fip"),
                param_name,
                floating_ip_id: NEXT_AVAILABLE.into(),
                pool: self
                    .scheme
                    .floating_ip_external_net
                    .clone()
                    .unwrap_or_else(|| self.config.external_network.clone()),
                port: ResourceReference::planned(&name),
            });
        }
        ResourceReference::planned(name)
    }

    fn check_subnet(&self, vm: &VmRequestSpec) -> Result<Option<String>> {
        match (&vm.connect_to_subnet, &self.spec.options.new_subnet_name) {
            (None, _) if vm.role.requires_subnet() => Err(Error::Config(format!(
                "{} vm {} must be connected to a subnet",
                vm.role, vm.name
            ))),
            (None, _) => Ok(None),
            (Some(want), Some(new)) if want == new => Ok(Some(want.clone())),
            (Some(want), _) => Err(Error::Config(format!(
                "vm {} connects to subnet {want}, which is not created by group {}",
                vm.name, self.spec.group_name
            ))),
        }
    }

    fn octet_for(&mut self, role: VmType) -> u32 {
        match role {
            VmType::RootLb => GATEWAY_OCTET,
            VmType::ClusterMaster => MASTER_OCTET,
            _ => {
                let octet = self.next_octet;
                self.next_octet += 1;
                octet
            }
        }
    }

    fn add_vm(&mut self, vm: &VmRequestSpec) -> Result<()> {
        let flavor = self.lookups.flavor(&vm.flavor_name)?.clone();
        let subnet = self.check_subnet(vm)?;

        let mut ports = Vec::new();
        if vm.role.is_load_balancer() || vm.connect_to_external_net {
            ports.push(self.add_external_port(vm));
        }
        if let Some(subnet) = subnet
            && !(vm.role.is_load_balancer() && self.router_active())
        {
            let octet = self.octet_for(vm.role);
            let name = names::internal_port_name(&vm.name, &subnet);
            let sg = self.internal_secgrp_ref();
            let port = self.internal_port(&name, &subnet, octet, sg, false);
            self.plan.ports.push(port);
            ports.push(ResourceReference::planned(name));
        }

        let mut volumes = Vec::new();
        let mut image_name = vm.image_name.clone();
        let mut disk_gb = flavor.disk_gb;
        if vm.external_volume_size_gb > 0 {
            volumes.push(VolumeOrchestrationParams {
                name: format!("{}-volume", vm.name),
                image_name: std::mem::take(&mut image_name),
                size_gb: vm.external_volume_size_gb,
                device_name: BOOT_VOLUME_DEVICE.into(),
                unit_number: 0,
                attach_external_disk: true,
            });
            disk_gb = vm.external_volume_size_gb;
        }
        let shared_volume = vm.shared_volume_size_gb > 0;
        if shared_volume {
            volumes.push(VolumeOrchestrationParams {
                name: format!("{}-shared-volume", vm.name),
                image_name: String::new(),
                size_gb: vm.shared_volume_size_gb,
                device_name: SHARED_VOLUME_DEVICE.into(),
                unit_number: 1,
                attach_external_disk: false,
            });
        }

        let mut extra_boot_commands = vm.extra_boot_commands.clone();
        if flavor.gpus > 0 {
            extra_boot_commands.push(GPU_BOOT_COMMAND.into());
        }
        let chef = self.spec.options.chef_params.as_ref().map(|tmpl| ChefParams {
            node_name: vm.name.clone(),
            server_path: if tmpl.server_path.is_empty() {
                self.config.chef_server_path.clone().unwrap_or_default()
            } else {
                tmpl.server_path.clone()
            },
            client_key: tmpl.client_key.clone(),
        });
        let cloud_config = CloudConfigParams {
            hostname: names::sanitize(&vm.name),
            chef,
            extra_boot_commands,
            dns_servers: if self.config.subnet_dns {
                Vec::new()
            } else {
                self.config.dns_servers.clone()
            },
            shared_volume,
        };

        self.plan.vms.push(VmOrchestrationParams {
            name: vm.name.clone(),
            id: String::new(),
            role: vm.role,
            image_name,
            hostname: cloud_config.hostname.clone(),
            flavor_name: flavor.name.clone(),
            vcpus: flavor.vcpus,
            ram_mb: flavor.ram_mb,
            disk_gb,
            compute_availability_zone: vm.compute_availability_zone.clone(),
            ports,
            volumes,
            shared_volume,
            user_data: cloud_config.encode(),
        });
        Ok(())
    }
}
