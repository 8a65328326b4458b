//! Declarative VM and VM group requests.

use serde::{Deserialize, Serialize};

use ec_infra::types::{AccessPort, VmType};

use crate::cloudinit::ChefParams;
use crate::model::PrivacyPolicy;

/// One desired VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRequestSpec {
    pub name: String,
    pub role: VmType,
    pub flavor_name: String,
    pub image_name: String,
    /// Boot from a volume of this size instead of the image's own disk.
    #[serde(default)]
    pub external_volume_size_gb: u64,
    #[serde(default)]
    pub shared_volume_size_gb: u64,
    /// Subnet of the group this VM joins.
    #[serde(default)]
    pub connect_to_subnet: Option<String>,
    /// Give a non-LB VM its own external port.
    #[serde(default)]
    pub connect_to_external_net: bool,
    #[serde(default)]
    pub extra_boot_commands: Vec<String>,
    #[serde(default)]
    pub compute_availability_zone: Option<String>,
}

impl VmRequestSpec {
    pub fn new(
        name: impl Into<String>,
        role: VmType,
        flavor_name: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            flavor_name: flavor_name.into(),
            image_name: image_name.into(),
            external_volume_size_gb: 0,
            shared_volume_size_gb: 0,
            connect_to_subnet: None,
            connect_to_external_net: false,
            extra_boot_commands: Vec::new(),
            compute_availability_zone: None,
        }
    }

    pub fn subnet(mut self, subnet: impl Into<String>) -> Self {
        self.connect_to_subnet = Some(subnet.into());
        self
    }

    pub fn external_net(mut self) -> Self {
        self.connect_to_external_net = true;
        self
    }

    pub fn external_volume(mut self, size_gb: u64) -> Self {
        self.external_volume_size_gb = size_gb;
        self
    }

    pub fn shared_volume(mut self, size_gb: u64) -> Self {
        self.shared_volume_size_gb = size_gb;
        self
    }

    pub fn boot_command(mut self, cmd: impl Into<String>) -> Self {
        self.extra_boot_commands.push(cmd.into());
        self
    }

    pub fn availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.compute_availability_zone = Some(zone.into());
        self
    }
}

/// Group-wide settings for a compile.
///
/// ```
/// # use ec_vmlayer::spec::VmGroupRequestOptions;
/// let opts = VmGroupRequestOptions::default()
///     .new_subnet("mex-k8s-subnet-c1-acme")
///     .skip_cleanup_on_failure(true);
/// assert_eq!(opts.new_subnet_name.as_deref(), Some("mex-k8s-subnet-c1-acme"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmGroupRequestOptions {
    pub new_subnet_name: Option<String>,
    /// Defaults to `<group>-sg`.
    pub new_secgrp_name: Option<String>,
    pub access_ports: Vec<AccessPort>,
    pub privacy_policy: Option<PrivacyPolicy>,
    pub skip_default_secgrp: bool,
    pub skip_subnet_gateway: bool,
    pub skip_cleanup_on_failure: bool,
    /// Template for every VM's bootstrap registration; the node name is
    /// filled in per VM.
    pub chef_params: Option<ChefParams>,
}

impl VmGroupRequestOptions {
    pub fn new_subnet(mut self, name: impl Into<String>) -> Self {
        self.new_subnet_name = Some(name.into());
        self
    }

    pub fn new_secgrp(mut self, name: impl Into<String>) -> Self {
        self.new_secgrp_name = Some(name.into());
        self
    }

    pub fn access_ports(mut self, ports: Vec<AccessPort>) -> Self {
        self.access_ports = ports;
        self
    }

    pub fn privacy_policy(mut self, policy: Option<PrivacyPolicy>) -> Self {
        self.privacy_policy = policy;
        self
    }

    pub fn skip_default_secgrp(mut self, skip: bool) -> Self {
        self.skip_default_secgrp = skip;
        self
    }

    pub fn skip_subnet_gateway(mut self, skip: bool) -> Self {
        self.skip_subnet_gateway = skip;
        self
    }

    pub fn skip_cleanup_on_failure(mut self, skip: bool) -> Self {
        self.skip_cleanup_on_failure = skip;
        self
    }

    pub fn chef_params(mut self, params: ChefParams) -> Self {
        self.chef_params = Some(params);
        self
    }
}

/// A set of VMs created and updated together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmGroupRequestSpec {
    pub group_name: String,
    pub vms: Vec<VmRequestSpec>,
    #[serde(default)]
    pub options: VmGroupRequestOptions,
}

impl VmGroupRequestSpec {
    pub fn new(
        group_name: impl Into<String>,
        vms: Vec<VmRequestSpec>,
        options: VmGroupRequestOptions,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            vms,
            options,
        }
    }
}
