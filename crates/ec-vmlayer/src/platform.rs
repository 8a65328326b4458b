use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ec_infra::VmProvider;
use ec_infra::types::{ActionType, VmGroupOrchestrationParams};
use tracing::{debug, error, info, warn};

use crate::cache::Caches;
use crate::compiler;
use crate::config::PlatformConfig;
use crate::dns::DnsProvider;
use crate::names;
use crate::progress::{UpdateCallback, UpdateKind};
use crate::rootlb::RootLbManager;
use crate::security;
use crate::spec::{VmGroupRequestOptions, VmGroupRequestSpec, VmRequestSpec};
use crate::ssh::{SshClient, SshConnector};
use crate::{Error, Result};

/// The orchestration engine for one cloudlet.
///
/// Owns the provider, the collaborators it talks to, and the root LB state
/// shared between concurrent lifecycle operations.
pub struct VmPlatform {
    pub(crate) config: PlatformConfig,
    pub(crate) provider: Arc<dyn VmProvider>,
    pub(crate) ssh: Arc<dyn SshConnector>,
    pub(crate) dns: Arc<dyn DnsProvider>,
    pub(crate) caches: Caches,
    pub(crate) root_lb: RootLbManager,
    pub(crate) http: reqwest::Client,
}

impl VmPlatform {
    pub fn new(
        config: PlatformConfig,
        provider: Arc<dyn VmProvider>,
        ssh: Arc<dyn SshConnector>,
        dns: Arc<dyn DnsProvider>,
        caches: Caches,
    ) -> Result<Self> {
        config.parsed_network_scheme()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        info!(
            cloudlet = %config.cloudlet_name,
            provider = %provider.name(),
            shared_lb = %config.shared_root_lb_name,
            "vm platform initialized"
        );
        Ok(Self {
            root_lb: RootLbManager::new(&config.shared_root_lb_name),
            config,
            provider,
            ssh,
            dns,
            caches,
            http,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn VmProvider> {
        &self.provider
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn root_lb(&self) -> &RootLbManager {
        &self.root_lb
    }

    /// Compile `vms` into a plan and apply it with `action`.
    ///
    /// A failed create removes whatever was created unless the options ask
    /// to keep it. Deletes tolerate groups that are already gone and return
    /// an empty plan.
    pub async fn orchestrate_vms_from_vm_spec(
        &self,
        group_name: &str,
        vms: Vec<VmRequestSpec>,
        action: ActionType,
        progress: &UpdateCallback,
        options: VmGroupRequestOptions,
    ) -> Result<VmGroupOrchestrationParams> {
        if action == ActionType::Delete {
            progress(UpdateKind::Task, &format!("Deleting VM group {group_name}"));
            self.delete_group(group_name).await?;
            return Ok(VmGroupOrchestrationParams::new(group_name));
        }

        let spec = VmGroupRequestSpec::new(group_name, vms, options);
        let plan = self
            .compile_spec(&spec)
            .await
            .map_err(|e| Error::phase("compile", e))?;
        progress(
            UpdateKind::Task,
            &format!("{} VMs for {group_name}", verb(action)),
        );
        self.apply_plan(plan, action).await
    }

    pub(crate) async fn compile_spec(
        &self,
        spec: &VmGroupRequestSpec,
    ) -> Result<VmGroupOrchestrationParams> {
        let lookups = compiler::gather_lookups(&*self.provider, &self.config, spec).await?;
        compiler::compile(spec, &self.config, &lookups)
    }

    /// Populate and execute a compiled plan. Returns the populated plan.
    pub(crate) async fn apply_plan(
        &self,
        mut plan: VmGroupOrchestrationParams,
        action: ActionType,
    ) -> Result<VmGroupOrchestrationParams> {
        self.provider
            .populate_orchestration_params(&mut plan, action)
            .await
            .map_err(|e| Error::phase("populate orchestration params", e))?;

        let result = match action {
            ActionType::Create => self.provider.create_vms(&plan).await,
            ActionType::Update => self.provider.update_vms(&plan).await,
            ActionType::Delete => self.provider.delete_vms(&plan.group_name).await,
        };
        if let Err(e) = result {
            if action == ActionType::Create && !plan.skip_cleanup_on_failure {
                warn!(group = %plan.group_name, error = %e, "create failed, cleaning up");
                if let Err(cleanup) = self.delete_group(&plan.group_name).await {
                    error!(group = %plan.group_name, error = %cleanup, "cleanup after failed create failed");
                }
            }
            return Err(Error::phase(phase_name(action), e));
        }
        info!(group = %plan.group_name, vms = plan.vms.len(), ?action, "vm group applied");
        Ok(plan)
    }

    /// Delete a VM group, treating "already gone" as done.
    pub(crate) async fn delete_group(&self, group_name: &str) -> Result<()> {
        match self.provider.delete_vms(group_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_server_not_found() => {
                debug!(group = group_name, "vm group already gone");
                Ok(())
            }
            Err(e) => Err(Error::phase("delete VMs", e)),
        }
    }

    /// SSH client to a load balancer through its external address.
    pub async fn root_lb_client(&self, lb_name: &str) -> Result<Arc<dyn SshClient>> {
        let ip = self
            .root_lb
            .external_ip(&*self.provider, &self.config, lb_name)
            .await?;
        self.ssh.connect(&ip.external_addr)
    }

    /// A client for every load balancer that is up: the shared one plus
    /// the dedicated LB of each cached cluster.
    pub async fn get_root_lb_clients(&self) -> Result<BTreeMap<String, Arc<dyn SshClient>>> {
        let mut names = vec![self.config.shared_root_lb_name.clone()];
        for key in self.caches.cluster_insts.get_all_keys().await {
            if let Some(cluster) = self.caches.cluster_insts.get(&key).await
                && cluster.is_dedicated()
            {
                names.push(names::dedicated_lb_name(&key, &self.config.app_dns_root));
            }
        }

        let mut clients = BTreeMap::new();
        for name in names {
            let detail = match self.provider.get_server_detail(&name).await {
                Ok(d) => d,
                Err(e) if e.is_server_not_found() => {
                    debug!(lb = %name, "load balancer does not exist, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !detail.is_active() {
                debug!(lb = %name, status = %detail.status, "load balancer not active, skipping");
                continue;
            }
            match self.root_lb_client(&name).await {
                Ok(client) => {
                    clients.insert(name, client);
                }
                Err(e) if e.is_not_found() => {
                    debug!(lb = %name, "load balancer removed while listing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(clients)
    }

    /// Apply the named trust policy (or none) to the cloudlet security group.
    pub async fn configure_trust_policy(&self, policy_name: Option<&str>) -> Result<()> {
        let policy = match policy_name {
            Some(name) => Some(
                self.caches
                    .trust_policies
                    .get(name)
                    .await
                    .ok_or_else(|| Error::Lookup(format!("trust policy {name} not found")))?,
            ),
            None => None,
        };
        security::configure_cloudlet_security(
            &*self.provider,
            &self.config.cloudlet_secgrp_name,
            policy.as_ref(),
            ActionType::Update,
        )
        .await
    }
}

fn verb(action: ActionType) -> &'static str {
    match action {
        ActionType::Create => "Creating",
        ActionType::Update => "Updating",
        ActionType::Delete => "Deleting",
    }
}

fn phase_name(action: ActionType) -> &'static str {
    match action {
        ActionType::Create => "create VMs",
        ActionType::Update => "update VMs",
        ActionType::Delete => "delete VMs",
    }
}
