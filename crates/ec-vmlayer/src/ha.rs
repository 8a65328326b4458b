//! Recovery of lifecycle operations interrupted by a controller switchover.
//!
//! The newly active controller cannot resume work the previous one had in
//! flight, so every cluster and app instance left in a transient state is
//! moved to the matching error state. Where the interrupted work may have
//! left VMs behind they are deleted first.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::model::{AppDeployment, AppInst, ClusterInst, TrackedState};
use crate::names;
use crate::platform::VmPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing reached the infrastructure yet.
    Fail(TrackedState),
    /// Resources may be half created or half deleted.
    CleanupThenFail(TrackedState),
}

/// What to do with an object found in `state`. `None` for settled states.
pub fn recovery_for(state: TrackedState) -> Option<Recovery> {
    use TrackedState::*;
    match state {
        CreateRequested => Some(Recovery::Fail(CreateError)),
        UpdateRequested | Updating => Some(Recovery::Fail(UpdateError)),
        DeleteRequested | DeletePrepare => Some(Recovery::Fail(DeleteError)),
        Creating => Some(Recovery::CleanupThenFail(CreateError)),
        Deleting => Some(Recovery::CleanupThenFail(DeleteError)),
        NotPresent | Ready | CreateError | UpdateError | DeleteError => None,
    }
}

fn interrupted(state: TrackedState) -> String {
    format!("operation interrupted by controller switchover while {state}")
}

impl VmPlatform {
    /// Called when this controller's HA role changes. On becoming active,
    /// starts the recovery scan in the background and returns its handle.
    pub fn active_changed(self: &Arc<Self>, active: bool) -> Option<JoinHandle<()>> {
        if !active {
            debug!(cloudlet = %self.config.cloudlet_name, "standby, nothing to recover");
            return None;
        }
        info!(cloudlet = %self.config.cloudlet_name, "became active, recovering in-flight operations");
        let platform = self.clone();
        Some(tokio::spawn(async move {
            platform.recover_in_flight().await;
        }))
    }

    async fn recover_in_flight(self: Arc<Self>) {
        let mut cleanups = JoinSet::new();

        for key in self.caches.cluster_insts.get_all_keys().await {
            let Some(cluster) = self.caches.cluster_insts.get(&key).await else {
                continue;
            };
            match recovery_for(cluster.state) {
                None => {}
                Some(Recovery::Fail(to)) => self.fail_cluster(&cluster, to, None).await,
                Some(Recovery::CleanupThenFail(to)) => {
                    let platform = self.clone();
                    cleanups.spawn(async move {
                        let cleanup = platform.delete_cluster_resources(&cluster).await;
                        platform
                            .fail_cluster(&cluster, to, cleanup.err().map(|e| e.to_string()))
                            .await;
                    });
                }
            }
        }

        for key in self.caches.app_insts.get_all_keys().await {
            let Some(app) = self.caches.app_insts.get(&key).await else {
                continue;
            };
            match recovery_for(app.state) {
                None => {}
                Some(Recovery::CleanupThenFail(to)) if app.deployment == AppDeployment::Vm => {
                    let platform = self.clone();
                    cleanups.spawn(async move {
                        let group = names::app_vm_group_name(&app.key);
                        let cleanup = platform.delete_group(&group).await;
                        platform
                            .fail_app(&app, to, cleanup.err().map(|e| e.to_string()))
                            .await;
                    });
                }
                Some(Recovery::Fail(to) | Recovery::CleanupThenFail(to)) => {
                    self.fail_app(&app, to, None).await
                }
            }
        }

        let mut count = 0;
        while let Some(joined) = cleanups.join_next().await {
            count += 1;
            if let Err(e) = joined {
                error!(error = %e, "recovery cleanup task failed");
            }
        }
        info!(cleanups = count, "in-flight operation recovery finished");
    }

    async fn fail_cluster(&self, cluster: &ClusterInst, to: TrackedState, cleanup_err: Option<String>) {
        let mut msg = interrupted(cluster.state);
        if let Some(e) = cleanup_err {
            warn!(cluster = %cluster.key, error = %e, "recovery cleanup failed");
            msg.push_str(&format!("; cleanup failed: {e}"));
        }
        match self.caches.cluster_insts.set_error(&cluster.key, to, msg).await {
            Ok(()) => info!(cluster = %cluster.key, from = %cluster.state, to = %to, "cluster marked failed"),
            Err(e) => error!(cluster = %cluster.key, error = %e, "could not record cluster failure"),
        }
    }

    async fn fail_app(&self, app: &AppInst, to: TrackedState, cleanup_err: Option<String>) {
        let mut msg = interrupted(app.state);
        if let Some(e) = cleanup_err {
            warn!(app = %app.key, error = %e, "recovery cleanup failed");
            msg.push_str(&format!("; cleanup failed: {e}"));
        }
        match self.caches.app_insts.set_error(&app.key, to, msg).await {
            Ok(()) => info!(app = %app.key, from = %app.state, to = %to, "app instance marked failed"),
            Err(e) => error!(app = %app.key, error = %e, "could not record app instance failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppInstKey, ClusterInst};
    use crate::progress;
    use crate::spec::{VmGroupRequestOptions, VmRequestSpec};
    use crate::testutil;
    use ec_infra::types::{ActionType, VmType};
    use std::time::Duration;

    fn in_state(mut cluster: ClusterInst, state: TrackedState) -> ClusterInst {
        cluster.state = state;
        cluster
    }

    fn app(name: &str, deployment: AppDeployment, state: TrackedState) -> AppInst {
        AppInst {
            key: AppInstKey {
                app_name: name.into(),
                organization: "acme".into(),
                cluster: testutil::cluster_key("c1"),
            },
            deployment,
            state,
            errors: Vec::new(),
            state_changed_at: None,
        }
    }

    #[test]
    fn requested_states_fail_without_cleanup() {
        assert_eq!(
            recovery_for(TrackedState::CreateRequested),
            Some(Recovery::Fail(TrackedState::CreateError))
        );
        assert_eq!(
            recovery_for(TrackedState::Updating),
            Some(Recovery::Fail(TrackedState::UpdateError))
        );
        assert_eq!(
            recovery_for(TrackedState::DeleteRequested),
            Some(Recovery::Fail(TrackedState::DeleteError))
        );
        assert_eq!(
            recovery_for(TrackedState::Creating),
            Some(Recovery::CleanupThenFail(TrackedState::CreateError))
        );
        assert_eq!(
            recovery_for(TrackedState::Deleting),
            Some(Recovery::CleanupThenFail(TrackedState::DeleteError))
        );
        assert_eq!(recovery_for(TrackedState::Ready), None);
        assert_eq!(recovery_for(TrackedState::CreateError), None);
    }

    #[tokio::test]
    async fn standby_does_nothing() {
        let h = testutil::harness().await;
        assert!(h.platform.active_changed(false).is_none());
    }

    #[tokio::test]
    async fn transient_clusters_end_in_error_states() {
        let h = testutil::harness().await;
        let creating = testutil::k8s_cluster("c1", 1);
        h.platform
            .create_cluster_inst(&creating, None, &progress::noop(), Duration::from_secs(600))
            .await
            .unwrap();
        h.clusters
            .update(in_state(creating.clone(), TrackedState::Creating))
            .await;
        h.clusters
            .update(in_state(testutil::k8s_cluster("c2", 1), TrackedState::UpdateRequested))
            .await;
        h.clusters.update(testutil::k8s_cluster("c3", 1)).await;

        h.platform.active_changed(true).unwrap().await.unwrap();

        let caches = h.platform.caches();
        let c1 = caches.cluster_insts.get(&creating.key).await.unwrap();
        assert_eq!(c1.state, TrackedState::CreateError);
        assert!(c1.errors[0].contains("CREATING"), "{:?}", c1.errors);
        assert!(h.provider.group("c1-acme").await.is_none());

        let c2 = caches
            .cluster_insts
            .get(&testutil::cluster_key("c2"))
            .await
            .unwrap();
        assert_eq!(c2.state, TrackedState::UpdateError);
        assert!(!h.provider.calls().await.contains(&"delete_vms:c2-acme".to_string()));

        let c3 = caches
            .cluster_insts
            .get(&testutil::cluster_key("c3"))
            .await
            .unwrap();
        assert_eq!(c3.state, TrackedState::Ready);
    }

    #[tokio::test]
    async fn app_vms_are_deleted_before_failing() {
        let h = testutil::harness().await;
        let vm_app = app("web", AppDeployment::Vm, TrackedState::Deleting);
        let group = names::app_vm_group_name(&vm_app.key);
        h.platform
            .orchestrate_vms_from_vm_spec(
                &group,
                vec![VmRequestSpec::new("web", VmType::AppVm, "m4.small", "edgecloud-base").external_net()],
                ActionType::Create,
                &progress::noop(),
                VmGroupRequestOptions::default(),
            )
            .await
            .unwrap();
        h.apps.update(vm_app.clone()).await;
        let k8s_app = app("api", AppDeployment::Kubernetes, TrackedState::Creating);
        h.apps.update(k8s_app.clone()).await;

        h.platform.active_changed(true).unwrap().await.unwrap();

        assert!(h.provider.group(&group).await.is_none());
        let caches = h.platform.caches();
        assert_eq!(
            caches.app_insts.get(&vm_app.key).await.unwrap().state,
            TrackedState::DeleteError
        );
        assert_eq!(
            caches.app_insts.get(&k8s_app.key).await.unwrap().state,
            TrackedState::CreateError
        );
    }

    #[tokio::test]
    async fn cleanup_failure_is_recorded_and_state_still_set() {
        let h = testutil::harness().await;
        let cluster = in_state(testutil::dedicated_cluster("c1", 1), TrackedState::Deleting);
        h.clusters.update(cluster.clone()).await;
        h.provider.fail_on("delete_vms").await;

        h.platform.active_changed(true).unwrap().await.unwrap();

        let stored = h.platform.caches().cluster_insts.get(&cluster.key).await.unwrap();
        assert_eq!(stored.state, TrackedState::DeleteError);
        assert!(stored.errors[0].contains("cleanup failed"), "{:?}", stored.errors);
    }
}
