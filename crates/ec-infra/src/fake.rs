use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::{
    ActionType, FlavorInfo, NEXT_AVAILABLE, NetworkType, ResourceType, SERVER_ACTIVE,
    SecurityRule, ServerDetail, ServerIp, VmGroupOrchestrationParams,
};
use crate::{Error, ProviderName, Result, VmProvider};

/// In-memory provider used for development cloudlets and tests.
///
/// Keeps every created group, server, and security rule in process memory and
/// resolves `NextAvailable` subnets by handing out the lowest free third octet.
pub struct FakeProvider {
    state: Mutex<FakeState>,
    flavors: Vec<FlavorInfo>,
    router_gateway: Option<String>,
    require_ip_mapping: bool,
    known_resources: Option<BTreeMap<(ResourceType, String), String>>,
}

#[derive(Default)]
struct FakeState {
    groups: BTreeMap<String, VmGroupOrchestrationParams>,
    servers: BTreeMap<String, FakeServer>,
    subnet_octets: BTreeMap<String, u8>,
    rules: BTreeMap<(String, String), Vec<SecurityRule>>,
    cloudlet_rules: BTreeMap<String, Vec<SecurityRule>>,
    images: BTreeSet<String>,
    failures: HashSet<String>,
    calls: Vec<String>,
    next_mac: u32,
    next_external: u32,
    next_floating: u32,
}

struct FakeServer {
    group: String,
    detail: ServerDetail,
}

impl FakeState {
    fn record(&mut self, call: String) -> Result<()> {
        let op = call.split(':').next().unwrap_or_default().to_string();
        self.calls.push(call);
        if self.failures.contains(&op) {
            return Err(Error::Provider(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn mac(&mut self) -> String {
        self.next_mac += 1;
        format!(
            "fa:16:3e:00:{:02x}:{:02x}",
            (self.next_mac >> 8) & 0xff,
            self.next_mac & 0xff
        )
    }

    fn external_addr(&mut self) -> String {
        self.next_external += 1;
        format!("203.0.113.{}", self.next_external)
    }

    fn free_octet(&self) -> Result<u8> {
        let used: BTreeSet<u8> = self.subnet_octets.values().copied().collect();
        (1..=254u8)
            .find(|o| !used.contains(o))
            .ok_or_else(|| Error::Provider("no free subnets left in network scheme".into()))
    }

    fn add_servers(&mut self, plan: &VmGroupOrchestrationParams) -> Result<()> {
        for vm in &plan.vms {
            if self.servers.contains_key(&vm.name) {
                continue;
            }
            let mut addresses = Vec::new();
            for port_ref in &vm.ports {
                let Some(port) = plan.port(&port_ref.name) else {
                    return Err(Error::InvalidPlan(format!(
                        "vm {} references unknown port {}",
                        vm.name, port_ref.name
                    )));
                };
                let mac_address = self.mac();
                let ip = match port.network_type {
                    NetworkType::Internal => {
                        let fixed = port.fixed_ips.first().ok_or_else(|| {
                            Error::InvalidPlan(format!("internal port {} has no fixed ip", port.name))
                        })?;
                        if fixed.address == NEXT_AVAILABLE {
                            return Err(Error::InvalidPlan(format!(
                                "port {} was not populated",
                                port.name
                            )));
                        }
                        ServerIp {
                            network: port.network_name.clone(),
                            subnet: fixed.subnet.name.clone(),
                            port_name: port.name.clone(),
                            mac_address,
                            internal_addr: fixed.address.clone(),
                            external_addr: fixed.address.clone(),
                            external_addr_is_floating: false,
                        }
                    }
                    NetworkType::External => {
                        let floating = plan.floating_ips.iter().any(|f| f.port.name == port.name);
                        let external = self.external_addr();
                        let internal = if floating {
                            self.next_floating += 1;
                            format!("10.200.0.{}", self.next_floating)
                        } else {
                            external.clone()
                        };
                        ServerIp {
                            network: port.network_name.clone(),
                            subnet: String::new(),
                            port_name: port.name.clone(),
                            mac_address,
                            internal_addr: internal,
                            external_addr: external,
                            external_addr_is_floating: floating,
                        }
                    }
                };
                addresses.push(ip);
            }
            self.servers.insert(
                vm.name.clone(),
                FakeServer {
                    group: plan.group_name.clone(),
                    detail: ServerDetail {
                        name: vm.name.clone(),
                        id: format!("server-{}", vm.name),
                        status: SERVER_ACTIVE.into(),
                        addresses,
                    },
                },
            );
        }
        Ok(())
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// A permissive fake: every network, security group, and router name resolves.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            flavors: default_flavors(),
            router_gateway: None,
            require_ip_mapping: false,
            known_resources: None,
        }
    }

    /// Create from env vars:
    ///
    /// - `FAKE_PROVIDER_ENABLED` (required, `true` or `1`)
    /// - `FAKE_ROUTER_GATEWAY` (optional internal router gateway address)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let enabled = std::env::var("FAKE_PROVIDER_ENABLED")
            .map_err(|_| Error::MissingEnv("FAKE_PROVIDER_ENABLED".into()))?;
        if !matches!(enabled.as_str(), "true" | "1") {
            return Err(Error::MissingEnv("FAKE_PROVIDER_ENABLED".into()));
        }

        let mut provider = Self::new();
        provider.router_gateway = std::env::var("FAKE_ROUTER_GATEWAY").ok();
        Ok(provider)
    }

    pub fn with_router_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.router_gateway = Some(gateway.into());
        self
    }

    pub fn with_external_ip_mapping(mut self) -> Self {
        self.require_ip_mapping = true;
        self
    }

    /// Switch to strict resource resolution and register one resource.
    pub fn with_resource(mut self, kind: ResourceType, name: &str) -> Self {
        self.known_resources
            .get_or_insert_with(BTreeMap::new)
            .insert((kind, name.to_string()), format!("{kind}-{name}"));
        self
    }

    /// Make every subsequent call of `op` (e.g. `"create_vms"`) fail.
    pub async fn fail_on(&self, op: &str) {
        self.state.lock().await.failures.insert(op.to_string());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Every call made so far, as `op:argument` strings.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.state.lock().await.servers.keys().cloned().collect()
    }

    /// Every server's current detail, without recording a call.
    pub async fn servers(&self) -> Vec<ServerDetail> {
        self.state
            .lock()
            .await
            .servers
            .values()
            .map(|s| s.detail.clone())
            .collect()
    }

    pub async fn group(&self, name: &str) -> Option<VmGroupOrchestrationParams> {
        self.state.lock().await.groups.get(name).cloned()
    }

    pub async fn rules(&self, secgrp: &str, label: &str) -> Vec<SecurityRule> {
        self.state
            .lock()
            .await
            .rules
            .get(&(secgrp.to_string(), label.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn cloudlet_rules(&self, secgrp: &str) -> Vec<SecurityRule> {
        self.state
            .lock()
            .await
            .cloudlet_rules
            .get(secgrp)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_server_status(&self, name: &str, status: &str) {
        if let Some(server) = self.state.lock().await.servers.get_mut(name) {
            server.detail.status = status.to_string();
        }
    }

    pub async fn add_image(&self, name: &str) {
        self.state.lock().await.images.insert(name.to_string());
    }

    /// Register a standalone server (a shared root LB created out of band).
    pub async fn add_server(&self, detail: ServerDetail) {
        self.state.lock().await.servers.insert(
            detail.name.clone(),
            FakeServer {
                group: String::new(),
                detail,
            },
        );
    }
}

fn default_flavors() -> Vec<FlavorInfo> {
    vec![
        FlavorInfo {
            name: "m4.tiny".into(),
            vcpus: 1,
            ram_mb: 1024,
            disk_gb: 10,
            gpus: 0,
        },
        FlavorInfo {
            name: "m4.small".into(),
            vcpus: 2,
            ram_mb: 4096,
            disk_gb: 40,
            gpus: 0,
        },
        FlavorInfo {
            name: "m4.medium".into(),
            vcpus: 4,
            ram_mb: 8192,
            disk_gb: 40,
            gpus: 0,
        },
        FlavorInfo {
            name: "gpu.large".into(),
            vcpus: 8,
            ram_mb: 32768,
            disk_gb: 80,
            gpus: 1,
        },
    ]
}

#[async_trait]
impl VmProvider for FakeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Fake
    }

    async fn get_flavor_list(&self) -> Result<Vec<FlavorInfo>> {
        self.state.lock().await.record("get_flavor_list".into())?;
        Ok(self.flavors.clone())
    }

    async fn get_resource_id(&self, kind: ResourceType, name: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.record(format!("get_resource_id:{kind}:{name}"))?;
        match kind {
            ResourceType::Server => state
                .servers
                .get(name)
                .map(|s| s.detail.id.clone())
                .ok_or_else(|| Error::ServerDoesNotExist(name.to_string())),
            ResourceType::Flavor => self
                .flavors
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.name.clone())
                .ok_or_else(|| Error::NotFound {
                    kind,
                    name: name.to_string(),
                }),
            _ => match &self.known_resources {
                None => Ok(format!("{kind}-{name}")),
                Some(known) => known
                    .get(&(kind, name.to_string()))
                    .cloned()
                    .ok_or_else(|| Error::NotFound {
                        kind,
                        name: name.to_string(),
                    }),
            },
        }
    }

    async fn populate_orchestration_params(
        &self,
        plan: &mut VmGroupOrchestrationParams,
        action: ActionType,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("populate_orchestration_params:{}", plan.group_name))?;
        if action == ActionType::Delete {
            return Ok(());
        }
        if plan.subnets.iter().any(|s| s.cidr == NEXT_AVAILABLE) {
            let existing = state.subnet_octets.get(&plan.group_name).copied();
            let octet = match existing {
                Some(o) => o,
                None => {
                    let o = state.free_octet()?;
                    state.subnet_octets.insert(plan.group_name.clone(), o);
                    o
                }
            };
            plan.resolve_next_available(octet)?;
            debug!(group = %plan.group_name, octet, "fake: resolved next available subnet");
        }
        for fip in &mut plan.floating_ips {
            if fip.floating_ip_id == NEXT_AVAILABLE {
                state.next_floating += 1;
                fip.floating_ip_id = format!("{}-fip-{}", fip.pool, state.next_floating);
            }
        }
        Ok(())
    }

    async fn create_vms(&self, plan: &VmGroupOrchestrationParams) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("create_vms:{}", plan.group_name))?;
        if state.groups.contains_key(&plan.group_name) {
            return Err(Error::Provider(format!(
                "vm group {} already exists",
                plan.group_name
            )));
        }
        plan.validate()?;
        if plan.subnets.iter().any(|s| s.cidr == NEXT_AVAILABLE) {
            return Err(Error::InvalidPlan(format!(
                "group {} was not populated",
                plan.group_name
            )));
        }
        state.add_servers(plan)?;
        state.groups.insert(plan.group_name.clone(), plan.clone());
        info!(group = %plan.group_name, vms = plan.vms.len(), "fake: vm group created");
        Ok(())
    }

    async fn update_vms(&self, plan: &VmGroupOrchestrationParams) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("update_vms:{}", plan.group_name))?;
        plan.validate()?;
        let keep: BTreeSet<&str> = plan.vms.iter().map(|v| v.name.as_str()).collect();
        state
            .servers
            .retain(|name, s| s.group != plan.group_name || keep.contains(name.as_str()));
        state.add_servers(plan)?;
        state.groups.insert(plan.group_name.clone(), plan.clone());
        info!(group = %plan.group_name, vms = plan.vms.len(), "fake: vm group updated");
        Ok(())
    }

    async fn delete_vms(&self, group_name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("delete_vms:{group_name}"))?;
        let existed = state.groups.remove(group_name).is_some();
        state.servers.retain(|_, s| s.group != group_name);
        state.subnet_octets.remove(group_name);
        if existed {
            info!(group = %group_name, "fake: vm group deleted");
        } else {
            debug!(group = %group_name, "fake: vm group already absent");
        }
        Ok(())
    }

    async fn get_server_detail(&self, server_name: &str) -> Result<ServerDetail> {
        let mut state = self.state.lock().await;
        state.record(format!("get_server_detail:{server_name}"))?;
        state
            .servers
            .get(server_name)
            .map(|s| s.detail.clone())
            .ok_or_else(|| Error::ServerDoesNotExist(server_name.to_string()))
    }

    async fn attach_port_to_server(
        &self,
        server_name: &str,
        subnet_name: &str,
        port_name: &str,
        ip_addr: &str,
        _action: ActionType,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("attach_port_to_server:{server_name}:{port_name}"))?;
        let network = state
            .groups
            .values()
            .flat_map(|g| g.subnets.iter())
            .find(|s| s.name == subnet_name)
            .map(|s| s.network_name.clone())
            .unwrap_or_default();
        let mac_address = state.mac();
        let server = state
            .servers
            .get_mut(server_name)
            .ok_or_else(|| Error::ServerDoesNotExist(server_name.to_string()))?;
        if server.detail.ip_on_port(port_name).is_some() {
            return Ok(());
        }
        server.detail.addresses.push(ServerIp {
            network,
            subnet: subnet_name.to_string(),
            port_name: port_name.to_string(),
            mac_address,
            internal_addr: ip_addr.to_string(),
            external_addr: ip_addr.to_string(),
            external_addr_is_floating: false,
        });
        Ok(())
    }

    async fn detach_port_from_server(
        &self,
        server_name: &str,
        _subnet_name: &str,
        port_name: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("detach_port_from_server:{server_name}:{port_name}"))?;
        let server = state
            .servers
            .get_mut(server_name)
            .ok_or_else(|| Error::ServerDoesNotExist(server_name.to_string()))?;
        server.detail.addresses.retain(|a| a.port_name != port_name);
        Ok(())
    }

    async fn whitelist_security_rules(
        &self,
        secgrp_name: &str,
        _server_name: &str,
        label: &str,
        rules: &[SecurityRule],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("whitelist_security_rules:{secgrp_name}:{label}"))?;
        let entry = state
            .rules
            .entry((secgrp_name.to_string(), label.to_string()))
            .or_default();
        for rule in rules {
            if !entry.contains(rule) {
                entry.push(rule.clone());
            }
        }
        Ok(())
    }

    async fn remove_whitelist_security_rules(
        &self,
        secgrp_name: &str,
        _server_name: &str,
        label: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("remove_whitelist_security_rules:{secgrp_name}:{label}"))?;
        state
            .rules
            .remove(&(secgrp_name.to_string(), label.to_string()));
        Ok(())
    }

    async fn get_security_rules(
        &self,
        secgrp_name: &str,
        label: &str,
    ) -> Result<Vec<SecurityRule>> {
        let mut state = self.state.lock().await;
        state.record(format!("get_security_rules:{secgrp_name}:{label}"))?;
        Ok(state
            .rules
            .get(&(secgrp_name.to_string(), label.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn configure_cloudlet_security_rules(
        &self,
        secgrp_name: &str,
        egress_restricted: bool,
        egress_rules: &[SecurityRule],
        action: ActionType,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(format!("configure_cloudlet_security_rules:{secgrp_name}"))?;
        if action == ActionType::Delete {
            state.cloudlet_rules.remove(secgrp_name);
            return Ok(());
        }
        let rules = if egress_restricted {
            egress_rules.to_vec()
        } else {
            vec![SecurityRule::allow_all_egress()]
        };
        state.cloudlet_rules.insert(secgrp_name.to_string(), rules);
        Ok(())
    }

    async fn image_exists(&self, image_name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.record(format!("image_exists:{image_name}"))?;
        Ok(state.images.contains(image_name))
    }

    async fn add_image_from_file(&self, image_name: &str, path: &Path) -> Result<()> {
        tokio::fs::metadata(path).await?;
        let mut state = self.state.lock().await;
        state.record(format!("add_image_from_file:{image_name}"))?;
        state.images.insert(image_name.to_string());
        Ok(())
    }

    async fn get_router_gateway_ip(&self, router_name: &str) -> Result<String> {
        self.state
            .lock()
            .await
            .record(format!("get_router_gateway_ip:{router_name}"))?;
        self.router_gateway.clone().ok_or_else(|| Error::NotFound {
            kind: ResourceType::Router,
            name: router_name.to_string(),
        })
    }

    async fn prepare_root_lb(&self, server_name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .record(format!("prepare_root_lb:{server_name}"))
    }

    fn requires_external_ip_mapping(&self) -> bool {
        self.require_ip_mapping
    }
}
