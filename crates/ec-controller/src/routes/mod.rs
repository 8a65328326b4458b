pub mod apps;
pub mod clusters;
pub mod platform;
pub mod vm_groups;

use axum::Router;
use axum::routing::{get, post, put};

use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Cluster lifecycle
        .route(
            "/clusters",
            get(clusters::list_clusters)
                .post(clusters::create_cluster)
                .put(clusters::update_cluster),
        )
        .route("/clusters/delete", post(clusters::delete_cluster))
        // App instances
        .route("/apps", get(apps::list_apps).put(apps::upsert_app))
        // Raw VM groups
        .route("/vm-groups", post(vm_groups::orchestrate_vm_group))
        // Cloudlet
        .route("/ha/active", post(platform::set_active))
        .route("/rootlbs", get(platform::list_root_lbs))
        .route("/trust-policy", put(platform::set_trust_policy))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ec_infra::fake::FakeProvider;
    use ec_vmlayer::cache::{Caches, ClusterInstCache};
    use ec_vmlayer::config::PlatformConfig;
    use ec_vmlayer::dns::InMemoryDns;
    use ec_vmlayer::model::TrackedState;
    use ec_vmlayer::ssh::{SshClient, SshConnector};
    use ec_vmlayer::VmPlatform;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;

    /// Every connection attempt fails, as with an unreachable cloudlet.
    struct Unreachable;

    impl SshConnector for Unreachable {
        fn connect(&self, host: &str) -> ec_vmlayer::Result<Arc<dyn SshClient>> {
            Err(ec_vmlayer::Error::Ssh(format!("connect to {host}: timed out")))
        }
    }

    async fn test_state() -> (AppState, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new());
        provider.add_image("edgecloud-base").await;
        let (caches, clusters, apps, policies) = Caches::in_memory();
        let platform = VmPlatform::new(
            PlatformConfig::for_cloudlet("hamburg"),
            provider.clone(),
            Arc::new(Unreachable),
            Arc::new(InMemoryDns::default()),
            caches,
        )
        .unwrap();
        let state = AppState {
            platform: Arc::new(platform),
            clusters,
            apps,
            policies,
            config: AppConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                provider: ec_infra::ProviderName::Fake,
                cluster_timeout_secs: 60,
                setup_shared_root_lb: false,
            },
        };
        (state, provider)
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = api_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn cluster_json(name: &str) -> Value {
        json!({
            "key": { "cluster_name": name, "organization": "acme", "cloudlet": "hamburg" },
            "deployment": "kubernetes",
            "ip_access": "shared",
            "num_masters": 1,
            "num_nodes": 1,
            "node_flavor": "m4.small"
        })
    }

    #[tokio::test]
    async fn vm_group_create_returns_populated_plan() {
        let (state, provider) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/vm-groups",
            json!({
                "group_name": "web-acme",
                "action": "create",
                "vms": [{
                    "name": "web",
                    "role": "app-vm",
                    "flavor_name": "m4.small",
                    "image_name": "edgecloud-base",
                    "connect_to_external_net": true
                }]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["group_name"], "web-acme");
        assert_eq!(body["vms"][0]["name"], "web");
        assert!(provider.group("web-acme").await.is_some());
    }

    #[tokio::test]
    async fn unknown_flavor_is_unprocessable() {
        let (state, _) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/vm-groups",
            json!({
                "group_name": "web-acme",
                "action": "create",
                "vms": [{
                    "name": "web",
                    "role": "app-vm",
                    "flavor_name": "m9.huge",
                    "image_name": "edgecloud-base"
                }]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        assert!(body["error"].as_str().unwrap().contains("m9.huge"));
    }

    #[tokio::test]
    async fn failed_create_is_recorded_on_the_cluster() {
        let (state, provider) = test_state().await;
        let (status, body) = call(&state, "POST", "/clusters", json!({ "cluster": cluster_json("c1") })).await;
        // the shared LB does not exist in this cloudlet
        assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");

        let key = ec_vmlayer::model::ClusterInstKey {
            cluster_name: "c1".into(),
            organization: "acme".into(),
            cloudlet: "hamburg".into(),
        };
        let stored = ClusterInstCache::get(&*state.clusters, &key).await.unwrap();
        assert_eq!(stored.state, TrackedState::CreateError);
        assert_eq!(stored.errors.len(), 1);
        assert!(provider.group("c1-acme").await.is_none());

        let (_, list) = call(&state, "GET", "/clusters", Value::Null).await;
        assert_eq!(list[0]["state"], "CREATE_ERROR");
    }

    #[tokio::test]
    async fn deleting_twice_succeeds_both_times() {
        let (state, _) = test_state().await;
        call(&state, "POST", "/clusters", json!({ "cluster": cluster_json("c1") })).await;
        let delete = json!({ "key": { "cluster_name": "c1", "organization": "acme", "cloudlet": "hamburg" } });

        let (status, body) = call(&state, "POST", "/clusters/delete", delete.clone()).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{body}");
        let (_, list) = call(&state, "GET", "/clusters", Value::Null).await;
        assert_eq!(list, json!([]));

        let (status, body) = call(&state, "POST", "/clusters/delete", delete).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{body}");
    }

    #[tokio::test]
    async fn tracked_apps_are_recovered_on_activation() {
        let (state, _) = test_state().await;
        let app = json!({
            "key": {
                "app_name": "api",
                "organization": "acme",
                "cluster": { "cluster_name": "c1", "organization": "acme", "cloudlet": "hamburg" }
            },
            "deployment": "kubernetes",
            "state": "UPDATE_REQUESTED"
        });
        let (status, _) = call(&state, "PUT", "/apps", app).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let handle = state.platform.active_changed(true).unwrap();
        handle.await.unwrap();
        let (_, apps) = call(&state, "GET", "/apps", Value::Null).await;
        assert_eq!(apps[0]["state"], "UPDATE_ERROR");
    }

    #[tokio::test]
    async fn ha_and_root_lb_endpoints() {
        let (state, _) = test_state().await;
        let (status, body) = call(&state, "POST", "/ha/active", json!({ "active": false })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["recovering"], false);

        let (status, body) = call(&state, "GET", "/rootlbs", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn trust_policy_is_applied_to_cloudlet_group() {
        let (state, provider) = test_state().await;
        let (status, _) = call(
            &state,
            "PUT",
            "/trust-policy",
            json!({ "policy": { "name": "tp", "outbound_security_rules": [] } }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(provider.cloudlet_rules("hamburg-cloudlet-sg").await.len(), 1);
    }
}
