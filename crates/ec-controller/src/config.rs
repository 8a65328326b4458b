use std::env;
use std::net::SocketAddr;

use ec_infra::ProviderName;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub provider: ProviderName,
    pub cluster_timeout_secs: u64,
    pub setup_shared_root_lb: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            provider: env::var("VM_PROVIDER")
                .unwrap_or_else(|_| "fake".into())
                .parse()
                .expect("VM_PROVIDER must name a compiled-in provider"),
            cluster_timeout_secs: env::var("CLUSTER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "1800".into())
                .parse()
                .expect("CLUSTER_TIMEOUT_SECS must be a valid u64"),
            setup_shared_root_lb: env::var("SETUP_SHARED_ROOTLB")
                .map(|v| matches!(v.as_str(), "true" | "1"))
                .unwrap_or(true),
        }
    }
}
