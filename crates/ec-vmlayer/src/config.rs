use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ec_infra::types::AccessPort;

use crate::netscheme::NetworkScheme;
use crate::{Error, Result};

/// Value of `EXTERNAL_ROUTER` meaning the cloudlet has no external router.
pub const NO_EXTERNAL_ROUTER: &str = "NONE";

pub const DEFAULT_NETWORK_SCHEME: &str = "cidr=10.101.X.0/24";

/// Per-cloudlet settings for the orchestration engine.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub cloudlet_name: String,
    /// DNS zone under which root LB names are published.
    pub app_dns_root: String,
    pub shared_root_lb_name: String,
    pub root_lb_flavor: String,
    pub network_scheme: String,
    pub external_network: String,
    /// Network holding every cluster subnet.
    pub internal_network: String,
    pub external_router: Option<String>,
    pub cloudlet_secgrp_name: String,
    /// Push DNS servers on the subnet instead of through cloud-init.
    pub subnet_dns: bool,
    pub dns_servers: Vec<String>,
    pub min_disk_gb: u64,
    pub base_image_name: String,
    pub base_image_url: String,
    pub base_image_checksum: String,
    pub image_cache_dir: PathBuf,
    pub chef_server_path: Option<String>,
    pub kubeconfig_dir: PathBuf,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    pub public_ip_url: String,
    pub skip_install_resource_tracker: bool,
    pub resource_tracker_install_cmd: String,
    pub root_lb_ready_timeout: Duration,
    pub root_lb_poll_interval: Duration,
    pub cluster_ready_poll_interval: Duration,
    pub gpu_install_timeout: Duration,
    pub gpu_driver_install_cmds: Vec<String>,
    pub exposed_lb_ports: Vec<AccessPort>,
    /// Internal to external address translation for NATed cloudlets.
    pub external_ip_map: HashMap<String, String>,
}

impl PlatformConfig {
    /// Defaults for a cloudlet; every field can be overridden afterwards.
    pub fn for_cloudlet(cloudlet_name: impl Into<String>) -> Self {
        let cloudlet_name = cloudlet_name.into();
        let app_dns_root = "edge.local".to_string();
        Self {
            shared_root_lb_name: format!("{cloudlet_name}.{app_dns_root}"),
            cloudlet_secgrp_name: format!("{cloudlet_name}-cloudlet-sg"),
            cloudlet_name,
            app_dns_root,
            root_lb_flavor: "m4.small".into(),
            network_scheme: DEFAULT_NETWORK_SCHEME.into(),
            external_network: "external-network-shared".into(),
            internal_network: "mex-k8s-net-1".into(),
            external_router: None,
            subnet_dns: false,
            dns_servers: vec!["1.1.1.1".into(), "1.0.0.1".into()],
            min_disk_gb: 20,
            base_image_name: "edgecloud-base".into(),
            base_image_url: String::new(),
            base_image_checksum: String::new(),
            image_cache_dir: PathBuf::from("/var/cache/edgecloud/images"),
            chef_server_path: None,
            kubeconfig_dir: PathBuf::from("."),
            ssh_user: "ubuntu".into(),
            ssh_key_path: PathBuf::from("id_rsa_edgecloud"),
            public_ip_url: "https://api.ipify.org".into(),
            skip_install_resource_tracker: false,
            resource_tracker_install_cmd:
                "sudo apt-get install -y edgecloud-resource-tracker && sudo systemctl enable --now resource-tracker"
                    .into(),
            root_lb_ready_timeout: Duration::from_secs(300),
            root_lb_poll_interval: Duration::from_secs(5),
            cluster_ready_poll_interval: Duration::from_secs(30),
            gpu_install_timeout: Duration::from_secs(30 * 60),
            gpu_driver_install_cmds: vec![
                "sudo apt-get update".into(),
                "sudo apt-get install -y nvidia-driver-535 nvidia-container-toolkit".into(),
            ],
            exposed_lb_ports: vec![AccessPort {
                protocol: ec_infra::types::Protocol::Tcp,
                port_min: 443,
                port_max: 443,
            }],
            external_ip_map: HashMap::new(),
        }
    }

    /// Create from env vars:
    ///
    /// - `CLOUDLET_NAME` (required)
    /// - `APP_DNS_ROOT`, `SHARED_ROOTLB_NAME`, `ROOTLB_FLAVOR`
    /// - `NETWORK_SCHEME` (default `cidr=10.101.X.0/24`)
    /// - `EXTERNAL_NETWORK`, `INTERNAL_NETWORK`, `EXTERNAL_ROUTER` (`NONE` disables)
    /// - `CLOUDLET_SECGRP_NAME`, `SUBNET_DNS`, `DNS_SERVERS` (comma-separated)
    /// - `MIN_DISK_GB`, `BASE_IMAGE_NAME`, `BASE_IMAGE_URL`, `BASE_IMAGE_CHECKSUM`, `IMAGE_CACHE_DIR`
    /// - `CHEF_SERVER_PATH`, `KUBECONFIG_DIR`, `SSH_USER`, `SSH_KEY_PATH`, `PUBLIC_IP_URL`
    /// - `SKIP_INSTALL_RESOURCE_TRACKER`, `ROOTLB_READY_TIMEOUT_SECS`,
    ///   `CLUSTER_READY_POLL_SECS`, `GPU_INSTALL_TIMEOUT_SECS`
    /// - `LB_EXPOSED_PORTS` (e.g. `tcp:443,udp:5000-5100`)
    /// - `EXTERNAL_IP_MAP` (`internal=external,...`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let cloudlet_name = env::var("CLOUDLET_NAME")
            .map_err(|_| Error::Config("missing env var: CLOUDLET_NAME".into()))?;
        let mut config = Self::for_cloudlet(cloudlet_name);

        if let Ok(root) = env::var("APP_DNS_ROOT") {
            config.shared_root_lb_name = format!("{}.{root}", config.cloudlet_name);
            config.app_dns_root = root;
        }
        override_string("SHARED_ROOTLB_NAME", &mut config.shared_root_lb_name);
        override_string("ROOTLB_FLAVOR", &mut config.root_lb_flavor);
        override_string("NETWORK_SCHEME", &mut config.network_scheme);
        override_string("EXTERNAL_NETWORK", &mut config.external_network);
        override_string("INTERNAL_NETWORK", &mut config.internal_network);
        override_string("CLOUDLET_SECGRP_NAME", &mut config.cloudlet_secgrp_name);
        override_string("BASE_IMAGE_NAME", &mut config.base_image_name);
        override_string("BASE_IMAGE_URL", &mut config.base_image_url);
        override_string("BASE_IMAGE_CHECKSUM", &mut config.base_image_checksum);
        override_string("SSH_USER", &mut config.ssh_user);
        override_string("PUBLIC_IP_URL", &mut config.public_ip_url);

        config.external_router = env::var("EXTERNAL_ROUTER")
            .ok()
            .filter(|r| !r.is_empty() && r != NO_EXTERNAL_ROUTER);
        config.chef_server_path = env::var("CHEF_SERVER_PATH").ok();

        if let Ok(dir) = env::var("IMAGE_CACHE_DIR") {
            config.image_cache_dir = dir.into();
        }
        if let Ok(dir) = env::var("KUBECONFIG_DIR") {
            config.kubeconfig_dir = dir.into();
        }
        if let Ok(path) = env::var("SSH_KEY_PATH") {
            config.ssh_key_path = path.into();
        }
        if let Ok(servers) = env::var("DNS_SERVERS") {
            config.dns_servers = split_list(&servers);
        }

        config.subnet_dns = parse_env("SUBNET_DNS", config.subnet_dns)?;
        config.skip_install_resource_tracker = parse_env(
            "SKIP_INSTALL_RESOURCE_TRACKER",
            config.skip_install_resource_tracker,
        )?;
        config.min_disk_gb = parse_env("MIN_DISK_GB", config.min_disk_gb)?;
        config.root_lb_ready_timeout = Duration::from_secs(parse_env(
            "ROOTLB_READY_TIMEOUT_SECS",
            config.root_lb_ready_timeout.as_secs(),
        )?);
        config.cluster_ready_poll_interval = Duration::from_secs(parse_env(
            "CLUSTER_READY_POLL_SECS",
            config.cluster_ready_poll_interval.as_secs(),
        )?);
        config.gpu_install_timeout = Duration::from_secs(parse_env(
            "GPU_INSTALL_TIMEOUT_SECS",
            config.gpu_install_timeout.as_secs(),
        )?);

        if let Ok(ports) = env::var("LB_EXPOSED_PORTS") {
            config.exposed_lb_ports = AccessPort::parse_list(&ports)
                .map_err(|e| Error::Config(format!("LB_EXPOSED_PORTS: {e}")))?;
        }
        if let Ok(map) = env::var("EXTERNAL_IP_MAP") {
            config.external_ip_map = parse_ip_map(&map)?;
        }

        // scheme must parse before any cluster work starts
        config.parsed_network_scheme()?;

        Ok(config)
    }

    pub fn parsed_network_scheme(&self) -> Result<NetworkScheme> {
        self.network_scheme.parse()
    }

    pub fn has_external_router(&self) -> bool {
        self.external_router.is_some()
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(v) = env::var(var)
        && !v.is_empty()
    {
        *target = v;
    }
}

fn parse_env<T: FromStr>(var: &str, default: T) -> Result<T> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("{var} has invalid value {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_ip_map(s: &str) -> Result<HashMap<String, String>> {
    split_list(s)
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(from, to)| (from.trim().to_string(), to.trim().to_string()))
                .ok_or_else(|| Error::Config(format!("EXTERNAL_IP_MAP entry {pair:?} is not from=to")))
        })
        .collect()
}
