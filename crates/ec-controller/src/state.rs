use std::sync::Arc;

use ec_vmlayer::VmPlatform;
use ec_vmlayer::cache::{InMemoryTrustPolicyCache, KeyedCache};
use ec_vmlayer::model::{AppInst, ClusterInst};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub platform: Arc<VmPlatform>,
    pub clusters: Arc<KeyedCache<ClusterInst>>,
    pub apps: Arc<KeyedCache<AppInst>>,
    pub policies: Arc<InMemoryTrustPolicyCache>,
    pub config: AppConfig,
}
