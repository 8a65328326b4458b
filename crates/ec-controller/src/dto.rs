use ec_infra::types::ActionType;
use ec_vmlayer::model::{ClusterInst, ClusterInstKey, PrivacyPolicy, TrackedState, TrustPolicy};
use ec_vmlayer::spec::{VmGroupRequestOptions, VmRequestSpec};
use serde::{Deserialize, Serialize};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClusterRequest {
    pub cluster: ClusterInst,
    #[serde(default)]
    pub privacy_policy: Option<PrivacyPolicy>,
    /// Overrides the configured cluster timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteClusterRequest {
    pub key: ClusterInstKey,
}

#[derive(Debug, Deserialize)]
pub struct VmGroupRequest {
    pub group_name: String,
    #[serde(default)]
    pub vms: Vec<VmRequestSpec>,
    pub action: ActionType,
    #[serde(default)]
    pub options: VmGroupRequestOptions,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct TrustPolicyRequest {
    /// `None` clears the cloudlet restriction.
    pub policy: Option<TrustPolicy>,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub key: ClusterInstKey,
    pub state: TrackedState,
    pub errors: Vec<String>,
}

impl From<ClusterInst> for ClusterResponse {
    fn from(c: ClusterInst) -> Self {
        Self {
            key: c.key,
            state: c.state,
            errors: c.errors,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub recovering: bool,
}

#[derive(Debug, Serialize)]
pub struct RootLbResponse {
    pub name: String,
    pub shared: bool,
}
