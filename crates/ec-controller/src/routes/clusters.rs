use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use ec_vmlayer::cache::ClusterInstCache;
use ec_vmlayer::model::{ClusterInst, Deployment, TrackedState};
use ec_vmlayer::progress;

use crate::dto::{ClusterRequest, ClusterResponse, DeleteClusterRequest};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_clusters(State(state): State<AppState>) -> Json<Vec<ClusterResponse>> {
    let mut clusters = Vec::new();
    for key in state.clusters.get_all_keys().await {
        if let Some(cluster) = ClusterInstCache::get(&*state.clusters, &key).await {
            clusters.push(cluster.into());
        }
    }
    Json(clusters)
}

fn timeout(state: &AppState, req: &ClusterRequest) -> Duration {
    Duration::from_secs(req.timeout_secs.unwrap_or(state.config.cluster_timeout_secs))
}

/// Record the outcome of a lifecycle operation on the cached cluster.
async fn settle(
    state: &AppState,
    cluster: &ClusterInst,
    result: ec_vmlayer::Result<()>,
    on_error: TrackedState,
) -> Result<ClusterResponse, ApiError> {
    match result {
        Ok(()) => {
            state.clusters.set_state(&cluster.key, TrackedState::Ready).await?;
        }
        Err(e) => {
            tracing::error!(cluster = %cluster.key, error = %e, "cluster operation failed");
            state
                .clusters
                .set_error(&cluster.key, on_error, e.to_string())
                .await?;
            return Err(e.into());
        }
    }
    ClusterInstCache::get(&*state.clusters, &cluster.key)
        .await
        .map(ClusterResponse::from)
        .ok_or(ApiError::NotFound)
}

pub async fn create_cluster(
    State(state): State<AppState>,
    Json(req): Json<ClusterRequest>,
) -> Result<(StatusCode, Json<ClusterResponse>), ApiError> {
    let key = req.cluster.key.clone();
    if let Some(existing) = ClusterInstCache::get(&*state.clusters, &key).await
        && existing.state != TrackedState::CreateError
    {
        return Err(ApiError::Conflict(format!(
            "cluster {key} already exists in state {}",
            existing.state
        )));
    }
    if req.cluster.num_masters == 0 && req.cluster.deployment == Deployment::Kubernetes {
        return Err(ApiError::BadRequest("kubernetes clusters need a master".into()));
    }

    let mut cluster = req.cluster.clone();
    cluster.state = TrackedState::Creating;
    cluster.errors.clear();
    state.clusters.update(cluster.clone()).await;

    let result = state
        .platform
        .create_cluster_inst(
            &cluster,
            req.privacy_policy.as_ref(),
            &progress::logging(key.to_string()),
            timeout(&state, &req),
        )
        .await;
    let response = settle(&state, &cluster, result, TrackedState::CreateError).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn update_cluster(
    State(state): State<AppState>,
    Json(req): Json<ClusterRequest>,
) -> Result<Json<ClusterResponse>, ApiError> {
    let key = req.cluster.key.clone();
    let existing = ClusterInstCache::get(&*state.clusters, &key)
        .await
        .ok_or(ApiError::NotFound)?;
    if existing.state.is_transient() {
        return Err(ApiError::Conflict(format!(
            "cluster {key} is busy ({})",
            existing.state
        )));
    }

    let mut cluster = req.cluster.clone();
    cluster.state = TrackedState::Updating;
    cluster.errors = existing.errors;
    state.clusters.update(cluster.clone()).await;

    let result = state
        .platform
        .update_cluster_inst(
            &cluster,
            req.privacy_policy.as_ref(),
            &progress::logging(key.to_string()),
            timeout(&state, &req),
        )
        .await;
    Ok(Json(settle(&state, &cluster, result, TrackedState::UpdateError).await?))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Json(req): Json<DeleteClusterRequest>,
) -> Result<StatusCode, ApiError> {
    let Some(cluster) = ClusterInstCache::get(&*state.clusters, &req.key).await else {
        tracing::debug!(cluster = %req.key, "cluster not tracked, already deleted");
        return Ok(StatusCode::NO_CONTENT);
    };
    state
        .clusters
        .set_state(&req.key, TrackedState::Deleting)
        .await?;

    let result = state
        .platform
        .delete_cluster_inst(&cluster, &progress::logging(req.key.to_string()))
        .await;
    if let Err(e) = result {
        tracing::error!(cluster = %req.key, error = %e, "cluster delete failed");
        state
            .clusters
            .set_error(&req.key, TrackedState::DeleteError, e.to_string())
            .await?;
        return Err(e.into());
    }
    state.clusters.delete(&req.key).await;
    Ok(StatusCode::NO_CONTENT)
}
