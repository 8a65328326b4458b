use std::fmt;

use chrono::{DateTime, Utc};
use ec_infra::types::SecurityRule;
use serde::{Deserialize, Serialize};

// ── Keys ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterInstKey {
    pub cluster_name: String,
    pub organization: String,
    pub cloudlet: String,
}

impl fmt::Display for ClusterInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.organization, self.cluster_name, self.cloudlet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppInstKey {
    pub app_name: String,
    pub organization: String,
    pub cluster: ClusterInstKey,
}

impl fmt::Display for AppInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} on {}", self.organization, self.app_name, self.cluster)
    }
}

// ── States ──────────────────────────────────────────────────────────

/// Lifecycle state tracked for clusters and app instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackedState {
    #[default]
    NotPresent,
    CreateRequested,
    Creating,
    CreateError,
    Ready,
    UpdateRequested,
    Updating,
    UpdateError,
    DeleteRequested,
    Deleting,
    DeleteError,
    DeletePrepare,
}

impl TrackedState {
    /// States in which a lifecycle operation is still running.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CreateRequested
                | Self::Creating
                | Self::UpdateRequested
                | Self::Updating
                | Self::DeleteRequested
                | Self::Deleting
                | Self::DeletePrepare
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::CreateError | Self::UpdateError | Self::DeleteError)
    }
}

impl fmt::Display for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotPresent => "NOT_PRESENT",
            Self::CreateRequested => "CREATE_REQUESTED",
            Self::Creating => "CREATING",
            Self::CreateError => "CREATE_ERROR",
            Self::Ready => "READY",
            Self::UpdateRequested => "UPDATE_REQUESTED",
            Self::Updating => "UPDATING",
            Self::UpdateError => "UPDATE_ERROR",
            Self::DeleteRequested => "DELETE_REQUESTED",
            Self::Deleting => "DELETING",
            Self::DeleteError => "DELETE_ERROR",
            Self::DeletePrepare => "DELETE_PREPARE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    Kubernetes,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAccess {
    Dedicated,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppDeployment {
    Vm,
    Kubernetes,
    Docker,
    Helm,
}

// ── ClusterInst ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInst {
    pub key: ClusterInstKey,
    pub deployment: Deployment,
    pub ip_access: IpAccess,
    pub num_masters: u32,
    pub num_nodes: u32,
    pub node_flavor: String,
    #[serde(default)]
    pub master_node_flavor: Option<String>,
    #[serde(default)]
    pub external_volume_size_gb: u64,
    #[serde(default)]
    pub shared_volume_size_gb: u64,
    #[serde(default)]
    pub privacy_policy: Option<String>,
    #[serde(default)]
    pub skip_crm_cleanup_on_failure: bool,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub state_changed_at: Option<DateTime<Utc>>,
}

impl ClusterInst {
    pub fn is_dedicated(&self) -> bool {
        self.ip_access == IpAccess::Dedicated
    }

    pub fn master_flavor(&self) -> &str {
        self.master_node_flavor
            .as_deref()
            .unwrap_or(&self.node_flavor)
    }
}

// ── AppInst ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInst {
    pub key: AppInstKey,
    pub deployment: AppDeployment,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub state_changed_at: Option<DateTime<Utc>>,
}

// ── Policies ────────────────────────────────────────────────────────

/// Cloudlet-level egress policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub name: String,
    pub outbound_security_rules: Vec<SecurityRule>,
}

/// Cluster-level egress policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    pub name: String,
    pub outbound_security_rules: Vec<SecurityRule>,
}
