//! Shared fixtures: a platform wired to the in-memory provider and a
//! scripted SSH layer that answers from the provider's server list.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ec_infra::fake::FakeProvider;
use ec_infra::types::{ServerDetail, ServerIp};
use tempfile::TempDir;

use crate::cache::{Caches, InMemoryTrustPolicyCache, KeyedCache};
use crate::config::PlatformConfig;
use crate::dns::InMemoryDns;
use crate::model::{AppInst, ClusterInst, ClusterInstKey, Deployment, IpAccess, TrackedState};
use crate::names;
use crate::platform::VmPlatform;
use crate::readiness::GET_NODES_CMD;
use crate::ssh::{SshClient, SshConnector};
use crate::{Error, Result};

pub const SHARED_LB: &str = "hamburg.edge.local";
pub const SHARED_LB_ADDR: &str = "203.0.113.200";
pub const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\n";

#[derive(Default)]
struct Script {
    log: Mutex<Vec<(String, String)>>,
    failing: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
}

/// SSH connector whose clients answer the commands the engine runs.
pub struct ScriptedConnector {
    script: Arc<Script>,
    provider: Arc<FakeProvider>,
}

impl ScriptedConnector {
    pub fn new(provider: Arc<FakeProvider>) -> Self {
        Self {
            script: Arc::new(Script::default()),
            provider,
        }
    }

    /// Fail every command starting with `prefix`.
    pub fn fail(&self, prefix: &str) {
        self.script.failing.lock().unwrap().push(prefix.to_string());
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn respond(&self, prefix: &str, output: &str) {
        self.script
            .responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), output.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.script
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.script
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl SshConnector for ScriptedConnector {
    fn connect(&self, host: &str) -> Result<Arc<dyn SshClient>> {
        Ok(Arc::new(ScriptedClient {
            host: host.to_string(),
            script: self.script.clone(),
            provider: self.provider.clone(),
        }))
    }
}

struct ScriptedClient {
    host: String,
    script: Arc<Script>,
    provider: Arc<FakeProvider>,
}

impl ScriptedClient {
    async fn server(&self) -> Option<ServerDetail> {
        self.provider.servers().await.into_iter().find(|s| {
            s.addresses
                .iter()
                .any(|a| a.internal_addr == self.host || a.external_addr == self.host)
        })
    }

    async fn links(&self) -> String {
        let mut out = "lo UNKNOWN 00:00:00:00:00:00 <LOOPBACK,UP,LOWER_UP>\n".to_string();
        if let Some(server) = self.server().await {
            for (i, addr) in server.addresses.iter().enumerate() {
                out.push_str(&format!(
                    "ens{} UP {} <BROADCAST,MULTICAST,UP,LOWER_UP>\n",
                    i + 3,
                    addr.mac_address
                ));
            }
        }
        out
    }

    /// Every server of the master's cluster, all `Ready`.
    async fn nodes(&self) -> String {
        let Some(master) = self.server().await else {
            return String::new();
        };
        let Some(suffix) = master
            .name
            .strip_prefix(&format!("{}-", names::MASTER_PREFIX))
        else {
            return String::new();
        };
        self.provider
            .servers()
            .await
            .into_iter()
            .filter(|s| {
                s.name == master.name
                    || (s.name.starts_with(names::NODE_PREFIX) && s.name.ends_with(suffix))
            })
            .map(|s| format!("{}   Ready   <none>   1m   v1.29.0\n", s.name))
            .collect()
    }
}

#[async_trait]
impl SshClient for ScriptedClient {
    async fn output(&self, cmd: &str) -> Result<String> {
        self.script
            .log
            .lock()
            .unwrap()
            .push((self.host.clone(), cmd.to_string()));
        let failing = self
            .script
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|p| cmd.starts_with(p.as_str()));
        if failing {
            return Err(Error::Ssh(format!("{cmd:?} on {} exited 1", self.host)));
        }
        let scripted = self
            .script
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| cmd.starts_with(p.as_str()))
            .map(|(_, out)| out.clone());
        if let Some(out) = scripted {
            return Ok(out);
        }
        Ok(match cmd {
            "ip -br link" => self.links().await,
            "ip route show default" => "default via 203.0.113.254 dev ens3\n".to_string(),
            "cat ~/.kube/config" => KUBECONFIG.to_string(),
            c if c.starts_with(GET_NODES_CMD) => self.nodes().await,
            _ => String::new(),
        })
    }

    fn add_hop(&self, host: &str, _port: u16) -> Result<Arc<dyn SshClient>> {
        Ok(Arc::new(ScriptedClient {
            host: host.to_string(),
            script: self.script.clone(),
            provider: self.provider.clone(),
        }))
    }
}

pub struct Harness {
    pub platform: Arc<VmPlatform>,
    pub provider: Arc<FakeProvider>,
    pub ssh: Arc<ScriptedConnector>,
    pub dns: Arc<InMemoryDns>,
    pub clusters: Arc<KeyedCache<ClusterInst>>,
    pub apps: Arc<KeyedCache<AppInst>>,
    pub policies: Arc<InMemoryTrustPolicyCache>,
    pub kubeconfig_dir: TempDir,
}

pub fn test_config(kubeconfig_dir: &TempDir) -> PlatformConfig {
    let mut config = PlatformConfig::for_cloudlet("hamburg");
    config.kubeconfig_dir = kubeconfig_dir.path().to_path_buf();
    config.public_ip_url = "http://127.0.0.1:9/ip".into();
    config.root_lb_ready_timeout = Duration::from_secs(60);
    config.root_lb_poll_interval = Duration::from_secs(1);
    config.cluster_ready_poll_interval = Duration::from_secs(1);
    config
}

pub async fn harness() -> Harness {
    harness_with(|_, provider| provider).await
}

/// Harness with config and provider adjusted before wiring.
pub async fn harness_with(
    adjust: impl FnOnce(&mut PlatformConfig, FakeProvider) -> FakeProvider,
) -> Harness {
    let kubeconfig_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&kubeconfig_dir);
    let provider = Arc::new(adjust(&mut config, FakeProvider::new()));
    provider.add_image(&config.base_image_name).await;
    add_shared_lb(&provider).await;

    let ssh = Arc::new(ScriptedConnector::new(provider.clone()));
    let dns = Arc::new(InMemoryDns::default());
    let (caches, clusters, apps, policies) = Caches::in_memory();
    let platform = VmPlatform::new(config, provider.clone(), ssh.clone(), dns.clone(), caches)
        .unwrap();
    Harness {
        platform: Arc::new(platform),
        provider,
        ssh,
        dns,
        clusters,
        apps,
        policies,
        kubeconfig_dir,
    }
}

/// The cloudlet's shared LB, created outside of any group.
pub async fn add_shared_lb(provider: &FakeProvider) {
    provider
        .add_server(ServerDetail {
            name: SHARED_LB.into(),
            id: "server-shared-lb".into(),
            status: "ACTIVE".into(),
            addresses: vec![ServerIp {
                network: "external-network-shared".into(),
                subnet: String::new(),
                port_name: format!("{SHARED_LB}-external-network-shared-port"),
                mac_address: "fa:16:3e:ff:00:01".into(),
                internal_addr: SHARED_LB_ADDR.into(),
                external_addr: SHARED_LB_ADDR.into(),
                external_addr_is_floating: false,
            }],
        })
        .await;
}

pub fn cluster_key(name: &str) -> ClusterInstKey {
    ClusterInstKey {
        cluster_name: name.into(),
        organization: "acme".into(),
        cloudlet: "hamburg".into(),
    }
}

/// Kubernetes cluster behind the shared LB.
pub fn k8s_cluster(name: &str, num_nodes: u32) -> ClusterInst {
    ClusterInst {
        key: cluster_key(name),
        deployment: Deployment::Kubernetes,
        ip_access: IpAccess::Shared,
        num_masters: 1,
        num_nodes,
        node_flavor: "m4.small".into(),
        master_node_flavor: None,
        external_volume_size_gb: 0,
        shared_volume_size_gb: 0,
        privacy_policy: None,
        skip_crm_cleanup_on_failure: false,
        state: TrackedState::Ready,
        errors: Vec::new(),
        state_changed_at: None,
    }
}

pub fn dedicated_cluster(name: &str, num_nodes: u32) -> ClusterInst {
    ClusterInst {
        ip_access: IpAccess::Dedicated,
        ..k8s_cluster(name, num_nodes)
    }
}

pub fn docker_cluster(name: &str, ip_access: IpAccess) -> ClusterInst {
    ClusterInst {
        deployment: Deployment::Docker,
        ip_access,
        num_masters: 0,
        num_nodes: 1,
        ..k8s_cluster(name, 1)
    }
}
