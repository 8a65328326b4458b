pub mod fake;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{
    ActionType, FlavorInfo, ResourceType, SecurityRule, ServerDetail, VmGroupOrchestrationParams,
};

/// Text every backend uses when a server lookup misses. Delete paths match on
/// it to treat "already gone" as success.
pub const SERVER_DOES_NOT_EXIST: &str = "Server does not exist";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("Server does not exist: {0}")]
    ServerDoesNotExist(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceType, name: String },

    #[error("invalid orchestration plan: {0}")]
    InvalidPlan(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the provider reported that the server is gone, either through
    /// the typed variant or through the well-known error text.
    pub fn is_server_not_found(&self) -> bool {
        match self {
            Self::ServerDoesNotExist(_) => true,
            Self::NotFound {
                kind: ResourceType::Server,
                ..
            } => true,
            other => other.to_string().contains(SERVER_DOES_NOT_EXIST),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure backends compiled into this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Fake,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fake => "fake",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fake" => Ok(Self::Fake),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic interface for realizing a compiled VM group plan.
///
/// Each backend (OpenStack, vSphere, bare metal, the in-memory fake) implements
/// this trait and owns its own configuration. The orchestration engine only
/// ever talks to `dyn VmProvider`.
#[async_trait]
pub trait VmProvider: Send + Sync + 'static {
    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Flavors available on the cloudlet.
    async fn get_flavor_list(&self) -> Result<Vec<FlavorInfo>>;

    /// Resolve the backend id of a named resource. Misses return `NotFound`.
    async fn get_resource_id(&self, kind: ResourceType, name: &str) -> Result<String>;

    /// Fill in backend-resolved values (next available subnet, fixed IPs,
    /// floating IP ids) before the plan is executed.
    async fn populate_orchestration_params(
        &self,
        plan: &mut VmGroupOrchestrationParams,
        action: ActionType,
    ) -> Result<()>;

    /// Create every resource in the plan.
    async fn create_vms(&self, plan: &VmGroupOrchestrationParams) -> Result<()>;

    /// Converge an existing group to the plan, adding and removing VMs as needed.
    async fn update_vms(&self, plan: &VmGroupOrchestrationParams) -> Result<()>;

    /// Delete every resource belonging to the named group. Missing groups are
    /// not an error.
    async fn delete_vms(&self, group_name: &str) -> Result<()>;

    /// Current server status and addresses. Misses must return an error whose
    /// text contains [`SERVER_DOES_NOT_EXIST`].
    async fn get_server_detail(&self, server_name: &str) -> Result<ServerDetail>;

    /// Create (for `ActionType::Create`) and attach a port on `subnet_name`
    /// to the server, reserving `ip_addr`.
    async fn attach_port_to_server(
        &self,
        server_name: &str,
        subnet_name: &str,
        port_name: &str,
        ip_addr: &str,
        action: ActionType,
    ) -> Result<()>;

    /// Detach and delete the port. Missing ports are not an error.
    async fn detach_port_from_server(
        &self,
        server_name: &str,
        subnet_name: &str,
        port_name: &str,
    ) -> Result<()>;

    /// Add a labeled set of rules to a security group.
    async fn whitelist_security_rules(
        &self,
        secgrp_name: &str,
        server_name: &str,
        label: &str,
        rules: &[SecurityRule],
    ) -> Result<()>;

    /// Remove every rule carrying `label` from the security group.
    async fn remove_whitelist_security_rules(
        &self,
        secgrp_name: &str,
        server_name: &str,
        label: &str,
    ) -> Result<()>;

    /// Rules currently installed under `label`.
    async fn get_security_rules(&self, secgrp_name: &str, label: &str)
    -> Result<Vec<SecurityRule>>;

    /// Apply the cloudlet-wide egress policy to the cloudlet security group.
    async fn configure_cloudlet_security_rules(
        &self,
        secgrp_name: &str,
        egress_restricted: bool,
        egress_rules: &[SecurityRule],
        action: ActionType,
    ) -> Result<()>;

    /// Whether the named image is already registered with the backend.
    async fn image_exists(&self, image_name: &str) -> Result<bool>;

    /// Register a locally downloaded image file.
    async fn add_image_from_file(&self, image_name: &str, path: &Path) -> Result<()>;

    /// Internal gateway address of an external router.
    async fn get_router_gateway_ip(&self, router_name: &str) -> Result<String>;

    /// Backend-specific preparation of a root load balancer once it is reachable.
    async fn prepare_root_lb(&self, _server_name: &str) -> Result<()> {
        Ok(())
    }

    /// Whether external addresses reported by the backend go through a NAT
    /// mapping that must be validated before use.
    fn requires_external_ip_mapping(&self) -> bool {
        false
    }
}

/// Registry of all configured providers.
///
/// Each provider is constructed from environment variables at startup.
/// Providers whose required env vars are missing are silently skipped.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn VmProvider>>,
}

impl ProviderRegistry {
    /// Look up a provider by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn VmProvider>> {
        self.providers.get(&name)
    }

    /// List the names of all available providers.
    pub fn available(&self) -> Vec<ProviderName> {
        self.providers.keys().copied().collect()
    }

    /// Returns `true` if at least one provider is configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build all providers whose required env vars are present.
///
/// Returns an error only if no providers could be constructed at all.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut providers: HashMap<ProviderName, Arc<dyn VmProvider>> = HashMap::new();

    match fake::FakeProvider::from_env() {
        Ok(p) => {
            tracing::info!("registered fake VM provider");
            providers.insert(ProviderName::Fake, Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping fake provider: {e}"),
    }

    if providers.is_empty() {
        return Err(Error::MissingEnv(
            "no VM providers configured (set FAKE_PROVIDER_ENABLED)".into(),
        ));
    }

    Ok(ProviderRegistry { providers })
}
