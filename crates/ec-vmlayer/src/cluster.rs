//! Cluster create, update, and delete.
//!
//! A cluster is one VM group: a master and workers (or a single docker
//! node) on a subnet of their own, plus a dedicated load balancer when the
//! cluster asks for one. Without a dedicated LB the cloudlet's shared LB
//! gets an interface on the cluster subnet instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ec_infra::types::{ActionType, FlavorInfo, VmGroupOrchestrationParams, VmType};
use tracing::{debug, error, info, warn};

use crate::cloudinit::ChefParams;
use crate::config::PlatformConfig;
use crate::gpu;
use crate::image;
use crate::model::{ClusterInst, ClusterInstKey, Deployment, PrivacyPolicy};
use crate::names;
use crate::platform::VmPlatform;
use crate::progress::{TaskCounter, UpdateCallback};
use crate::readiness::{self, GET_NODES_CMD, ReadinessTarget, TimeoutBudget};
use crate::security;
use crate::spec::{VmGroupRequestOptions, VmGroupRequestSpec, VmRequestSpec};
use crate::ssh::SshClient;
use crate::{Error, Result};

const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";

/// Where a cluster's kubeconfig is written.
pub fn kubeconfig_path(config: &PlatformConfig, key: &ClusterInstKey) -> PathBuf {
    config.kubeconfig_dir.join(format!(
        "{}.{}.kubeconfig",
        key.cluster_name, key.organization
    ))
}

/// Workers numbered above `num_nodes`, in node order. Masters and anything
/// not following the worker naming convention are never selected.
pub fn nodes_to_remove(node_names: &[String], num_nodes: u32) -> Vec<String> {
    let mut remove: Vec<(u32, &String)> = node_names
        .iter()
        .filter_map(|name| names::node_number(name).map(|n| (n, name)))
        .filter(|(n, _)| *n > num_nodes)
        .collect();
    remove.sort();
    remove.into_iter().map(|(_, name)| name.clone()).collect()
}

/// Node names from `kubectl get nodes --no-headers`.
fn node_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn worker_count(node_names: &[String]) -> u32 {
    node_names
        .iter()
        .filter(|n| names::node_number(n).is_some())
        .count() as u32
}

impl VmPlatform {
    /// Name of the load balancer fronting `cluster`.
    pub fn cluster_lb_name(&self, cluster: &ClusterInst) -> String {
        if cluster.is_dedicated() {
            names::dedicated_lb_name(&cluster.key, &self.config.app_dns_root)
        } else {
            self.config.shared_root_lb_name.clone()
        }
    }

    /// Docker clusters with a dedicated LB run on the LB itself and have no
    /// subnet.
    fn cluster_has_subnet(cluster: &ClusterInst) -> bool {
        !(cluster.deployment == Deployment::Docker && cluster.is_dedicated())
    }

    /// Shared LB without a router reaches the subnet through an interface
    /// of its own.
    fn needs_shared_lb_interface(&self, cluster: &ClusterInst) -> bool {
        !cluster.is_dedicated() && !self.config.has_external_router()
    }

    /// VM group request for a cluster at its current size.
    pub fn cluster_group_spec(
        &self,
        cluster: &ClusterInst,
        privacy: Option<&PrivacyPolicy>,
    ) -> VmGroupRequestSpec {
        let key = &cluster.key;
        let image = &self.config.base_image_name;
        let subnet = names::subnet_name(key);
        let lb_name = self.cluster_lb_name(cluster);
        let volume = cluster.external_volume_size_gb;

        let mut options = VmGroupRequestOptions::default()
            .privacy_policy(privacy.cloned())
            .skip_cleanup_on_failure(cluster.skip_crm_cleanup_on_failure);
        if let Some(path) = &self.config.chef_server_path {
            options = options.chef_params(ChefParams {
                server_path: path.clone(),
                ..Default::default()
            });
        }

        let mut vms = Vec::new();
        match cluster.deployment {
            Deployment::Docker if cluster.is_dedicated() => {
                vms.push(
                    VmRequestSpec::new(&lb_name, VmType::RootLb, &cluster.node_flavor, image)
                        .external_volume(volume),
                );
            }
            Deployment::Docker => {
                options = options.new_subnet(&subnet);
                vms.push(
                    VmRequestSpec::new(
                        names::docker_vm_name(key),
                        VmType::ClusterDockerNode,
                        &cluster.node_flavor,
                        image,
                    )
                    .subnet(&subnet)
                    .external_volume(volume),
                );
            }
            Deployment::Kubernetes => {
                options = options.new_subnet(&subnet);
                if cluster.is_dedicated() {
                    vms.push(
                        VmRequestSpec::new(&lb_name, VmType::RootLb, &self.config.root_lb_flavor, image)
                            .subnet(&subnet),
                    );
                }
                vms.push(
                    VmRequestSpec::new(
                        names::master_name(key),
                        VmType::ClusterMaster,
                        cluster.master_flavor(),
                        image,
                    )
                    .subnet(&subnet)
                    .external_volume(volume)
                    .shared_volume(cluster.shared_volume_size_gb),
                );
                for n in 1..=cluster.num_nodes {
                    vms.push(
                        VmRequestSpec::new(
                            names::node_name(key, n),
                            VmType::ClusterK8sNode,
                            &cluster.node_flavor,
                            image,
                        )
                        .subnet(&subnet)
                        .external_volume(volume),
                    );
                }
            }
        }
        VmGroupRequestSpec::new(names::cluster_group_name(key), vms, options)
    }

    async fn node_flavor(&self, cluster: &ClusterInst) -> Result<FlavorInfo> {
        self.provider
            .get_flavor_list()
            .await?
            .into_iter()
            .find(|f| f.name == cluster.node_flavor)
            .ok_or_else(|| Error::Lookup(format!("flavor {} not found", cluster.node_flavor)))
    }

    fn check_disk(&self, cluster: &ClusterInst, flavor: &FlavorInfo) -> Result<()> {
        if cluster.external_volume_size_gb > 0 || flavor.disk_gb >= self.config.min_disk_gb {
            return Ok(());
        }
        Err(Error::Config(format!(
            "flavor {} has {} GB of disk, at least {} GB is required",
            flavor.name, flavor.disk_gb, self.config.min_disk_gb
        )))
    }

    /// Create a cluster and wait until it is usable.
    ///
    /// Every phase draws on the same `timeout`. A failure after VMs were
    /// created tears the cluster down again unless the cluster opts out of
    /// cleanup.
    pub async fn create_cluster_inst(
        &self,
        cluster: &ClusterInst,
        privacy: Option<&PrivacyPolicy>,
        progress: &UpdateCallback,
        timeout: Duration,
    ) -> Result<()> {
        let budget = TimeoutBudget::new(timeout);
        let mut tasks = TaskCounter::new(progress.clone(), 4);
        info!(cluster = %cluster.key, deployment = ?cluster.deployment, ip_access = ?cluster.ip_access, "creating cluster");

        tasks.task("Validating cluster");
        let flavor = self
            .node_flavor(cluster)
            .await
            .map_err(|e| Error::phase("validate flavor", e))?;
        self.check_disk(cluster, &flavor)?;
        image::ensure_base_image(&*self.provider, &self.http, &self.config)
            .await
            .map_err(|e| Error::phase("ensure base image", e))?;

        tasks.task("Creating VMs");
        let spec = self.cluster_group_spec(cluster, privacy);
        let plan = self
            .compile_spec(&spec)
            .await
            .map_err(|e| Error::phase("compile", e))?;
        let plan = self.apply_plan(plan, ActionType::Create).await?;

        let result = self
            .finish_cluster_create(cluster, privacy, &plan, &flavor, &budget, &mut tasks)
            .await;
        if let Err(e) = &result {
            if cluster.skip_crm_cleanup_on_failure {
                warn!(cluster = %cluster.key, error = %e, "cluster create failed, leaving resources for inspection");
            } else {
                warn!(cluster = %cluster.key, error = %e, "cluster create failed, cleaning up");
                if let Err(cleanup) = self.delete_cluster_resources(cluster).await {
                    error!(cluster = %cluster.key, error = %cleanup, "cleanup after failed cluster create failed");
                }
            }
        }
        result
    }

    async fn finish_cluster_create(
        &self,
        cluster: &ClusterInst,
        privacy: Option<&PrivacyPolicy>,
        plan: &VmGroupOrchestrationParams,
        flavor: &FlavorInfo,
        budget: &TimeoutBudget,
        tasks: &mut TaskCounter,
    ) -> Result<()> {
        let key = &cluster.key;
        let lb_name = self.cluster_lb_name(cluster);
        let subnet_name = names::subnet_name(key);

        self.reconcile_privacy_policy(cluster, privacy).await?;

        tasks.task("Configuring load balancer");
        if cluster.is_dedicated() {
            let secgrp = names::secgrp_name(&plan.group_name);
            self.setup_root_lb(&lb_name, &secgrp, &tasks.callback())
                .await?;
        }
        if Self::cluster_has_subnet(cluster) && !self.config.has_external_router() {
            let subnet = plan.subnet(&subnet_name).ok_or_else(|| {
                Error::Fatal(format!("plan for {} has no subnet {subnet_name}", plan.group_name))
            })?;
            self.attach_and_enable_root_lb_interface(
                &lb_name,
                !cluster.is_dedicated(),
                subnet,
                ActionType::Create,
            )
            .await
            .map_err(|e| Error::phase("attach root LB interface", e))?;
        }

        if cluster.deployment != Deployment::Kubernetes {
            info!(cluster = %key, "docker cluster ready");
            return Ok(());
        }

        tasks.task("Waiting for cluster to become ready");
        let lb_client = self.root_lb_client(&lb_name).await?;
        let master_name = names::master_name(key);
        let master = readiness::wait_cluster_ready(
            &*self.provider,
            &*lb_client,
            &ReadinessTarget {
                master_name: &master_name,
                subnet_name: &subnet_name,
                expected_nodes: cluster.num_nodes + cluster.num_masters,
            },
            self.config.cluster_ready_poll_interval,
            budget.remaining(),
            &tasks.callback(),
        )
        .await
        .map_err(|e| Error::phase("wait for cluster", e))?;

        self.write_kubeconfig(key, &*master)
            .await
            .map_err(|e| Error::phase("write kubeconfig", e))?;
        if cluster.num_nodes == 0 {
            set_master_taint(&*master, &master_name, false).await?;
        }

        if flavor.gpus > 0 {
            tasks.step("Installing GPU drivers");
            let mut nodes: Vec<(String, Arc<dyn SshClient>)> = vec![(master_name.clone(), master)];
            for n in 1..=cluster.num_nodes {
                let name = names::node_name(key, n);
                let client =
                    readiness::master_client(&*self.provider, &*lb_client, &name, &subnet_name)
                        .await?;
                nodes.push((name, client));
            }
            gpu::install_gpu_drivers(
                nodes,
                &self.config.gpu_driver_install_cmds,
                self.config.gpu_install_timeout,
            )
            .await
            .map_err(|e| Error::phase("install GPU drivers", e))?;
        }

        info!(cluster = %key, nodes = cluster.num_nodes, elapsed = ?budget.elapsed(), "cluster ready");
        Ok(())
    }

    async fn write_kubeconfig(&self, key: &ClusterInstKey, master: &dyn SshClient) -> Result<()> {
        let kubeconfig = master.output("cat ~/.kube/config").await?;
        let path = kubeconfig_path(&self.config, key);
        tokio::fs::write(&path, kubeconfig).await?;
        debug!(cluster = %key, path = %path.display(), "kubeconfig written");
        Ok(())
    }

    /// Resize a kubernetes cluster to `cluster.num_nodes` workers.
    ///
    /// Surplus workers are drained and removed from kubernetes before their
    /// VMs are deleted. The VM group is only updated when its VMs differ
    /// from the requested size, and nothing happens at all when both the
    /// VMs and the kubernetes workers already match. The privacy policy is
    /// reconciled either way.
    pub async fn update_cluster_inst(
        &self,
        cluster: &ClusterInst,
        privacy: Option<&PrivacyPolicy>,
        progress: &UpdateCallback,
        timeout: Duration,
    ) -> Result<()> {
        if cluster.deployment != Deployment::Kubernetes {
            return Err(Error::Config(format!(
                "cluster {} is a docker cluster and cannot be resized",
                cluster.key
            )));
        }
        let budget = TimeoutBudget::new(timeout);
        let mut tasks = TaskCounter::new(progress.clone(), 3);
        let key = &cluster.key;
        let lb_name = self.cluster_lb_name(cluster);
        let master_name = names::master_name(key);
        let subnet_name = names::subnet_name(key);

        tasks.task("Checking current nodes");
        self.reconcile_privacy_policy(cluster, privacy).await?;
        let spec = self.cluster_group_spec(cluster, privacy);
        let missing = self.missing_vms(&spec).await?;
        let surplus = self.surplus_worker_vms(cluster).await?;
        let vms_match = missing.is_empty() && surplus.is_empty();

        let lb_client = self.root_lb_client(&lb_name).await?;
        let master =
            readiness::master_client(&*self.provider, &*lb_client, &master_name, &subnet_name)
                .await
                .map_err(|e| Error::phase("reach master", e))?;
        let current = node_names(&master.output(GET_NODES_CMD).await?);
        let workers_before = worker_count(&current);
        if vms_match && workers_before == cluster.num_nodes {
            info!(cluster = %key, nodes = workers_before, "node count unchanged, nothing to update");
            return Ok(());
        }

        tasks.task("Removing surplus nodes");
        for node in nodes_to_remove(&current, cluster.num_nodes) {
            tasks.step(&format!("Draining {node}"));
            master
                .output(&format!(
                    "kubectl drain {node} --ignore-daemonsets --delete-emptydir-data --force --timeout=300s"
                ))
                .await
                .map_err(|e| Error::phase("drain node", e))?;
            master
                .output(&format!("kubectl delete node {node}"))
                .await
                .map_err(|e| Error::phase("delete node", e))?;
            info!(cluster = %key, node = %node, "node removed from cluster");
        }

        tasks.task("Updating VMs");
        if vms_match {
            debug!(cluster = %key, "vm group already matches, waiting for nodes to join");
        } else {
            info!(cluster = %key, ?missing, ?surplus, "updating vm group");
            let plan = self
                .compile_spec(&spec)
                .await
                .map_err(|e| Error::phase("compile", e))?;
            self.apply_plan(plan, ActionType::Update).await?;
        }

        if cluster.num_nodes > workers_before {
            readiness::wait_cluster_ready(
                &*self.provider,
                &*lb_client,
                &ReadinessTarget {
                    master_name: &master_name,
                    subnet_name: &subnet_name,
                    expected_nodes: cluster.num_nodes + cluster.num_masters,
                },
                self.config.cluster_ready_poll_interval,
                budget.remaining(),
                &tasks.callback(),
            )
            .await
            .map_err(|e| Error::phase("wait for cluster", e))?;
        }
        match (workers_before, cluster.num_nodes) {
            (0, n) if n > 0 => set_master_taint(&*master, &master_name, true).await?,
            (before, 0) if before > 0 => set_master_taint(&*master, &master_name, false).await?,
            _ => {}
        }
        info!(cluster = %key, from = workers_before, to = cluster.num_nodes, "cluster updated");
        Ok(())
    }

    /// Planned VMs the provider does not have.
    async fn missing_vms(&self, spec: &VmGroupRequestSpec) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for vm in &spec.vms {
            match self.provider.get_server_detail(&vm.name).await {
                Ok(_) => {}
                Err(e) if e.is_server_not_found() => missing.push(vm.name.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }

    /// Worker VMs numbered above the requested size. Workers are numbered
    /// consecutively, so the scan stops at the first missing one.
    async fn surplus_worker_vms(&self, cluster: &ClusterInst) -> Result<Vec<String>> {
        let mut surplus = Vec::new();
        for n in cluster.num_nodes + 1.. {
            let name = names::node_name(&cluster.key, n);
            match self.provider.get_server_detail(&name).await {
                Ok(_) => surplus.push(name),
                Err(e) if e.is_server_not_found() => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(surplus)
    }

    /// Bring the cluster security group's privacy policy rules in line with
    /// `privacy`. Without a policy the rules are cleared.
    async fn reconcile_privacy_policy(
        &self,
        cluster: &ClusterInst,
        privacy: Option<&PrivacyPolicy>,
    ) -> Result<()> {
        let group = names::cluster_group_name(&cluster.key);
        security::apply_privacy_policy(
            &*self.provider,
            &names::secgrp_name(&group),
            &group,
            privacy,
        )
        .await
        .map_err(|e| Error::phase("apply privacy policy", e))?;
        Ok(())
    }

    /// Delete a cluster. Resources that are already gone count as deleted.
    pub async fn delete_cluster_inst(
        &self,
        cluster: &ClusterInst,
        progress: &UpdateCallback,
    ) -> Result<()> {
        let mut tasks = TaskCounter::new(progress.clone(), 1);
        tasks.task("Deleting cluster");
        self.delete_cluster_resources(cluster).await?;
        info!(cluster = %cluster.key, "cluster deleted");
        Ok(())
    }

    /// Remove everything a cluster owns. Every step runs even when an
    /// earlier one failed; the first error is returned at the end.
    pub(crate) async fn delete_cluster_resources(&self, cluster: &ClusterInst) -> Result<()> {
        let key = &cluster.key;
        let mut first_err: Option<Error> = None;
        let mut note = |e: Error| {
            warn!(cluster = %key, error = %e, "cluster cleanup step failed, continuing");
            first_err.get_or_insert(e);
        };

        if Self::cluster_has_subnet(cluster) && self.needs_shared_lb_interface(cluster) {
            if let Err(e) = self
                .detach_and_disable_root_lb_interface(
                    &self.config.shared_root_lb_name,
                    &names::subnet_name(key),
                )
                .await
            {
                note(Error::phase("detach root LB interface", e));
            }
        }

        if let Err(e) = self.delete_group(&names::cluster_group_name(key)).await {
            note(e);
        }

        if cluster.is_dedicated() {
            let lb_name = self.cluster_lb_name(cluster);
            if let Err(e) = self.dns.delete_records(&lb_name).await {
                note(Error::phase("delete DNS records", e));
            }
            self.root_lb.invalidate(&lb_name).await;
        }

        let path = kubeconfig_path(&self.config, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(cluster = %key, "kubeconfig removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => note(e.into()),
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Add or remove the control-plane `NoSchedule` taint on the master.
async fn set_master_taint(master: &dyn SshClient, master_name: &str, tainted: bool) -> Result<()> {
    let cmd = if tainted {
        format!("kubectl taint nodes {master_name} {CONTROL_PLANE_TAINT}=:NoSchedule --overwrite")
    } else {
        format!("kubectl taint nodes {master_name} {CONTROL_PLANE_TAINT}:NoSchedule-")
    };
    master
        .output(&cmd)
        .await
        .map_err(|e| Error::phase("update master taint", e))?;
    info!(master = master_name, tainted, "master taint updated");
    Ok(())
}
