use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use crate::dto::{ActiveRequest, ActiveResponse, RootLbResponse, TrustPolicyRequest};
use crate::error::ApiError;
use crate::state::AppState;

/// HA role notification. Recovery runs in the background.
pub async fn set_active(
    State(state): State<AppState>,
    Json(req): Json<ActiveRequest>,
) -> (StatusCode, Json<ActiveResponse>) {
    let recovering = state.platform.active_changed(req.active).is_some();
    (StatusCode::ACCEPTED, Json(ActiveResponse { recovering }))
}

pub async fn list_root_lbs(
    State(state): State<AppState>,
) -> Result<Json<Vec<RootLbResponse>>, ApiError> {
    let shared = state.platform.config().shared_root_lb_name.clone();
    let lbs = state
        .platform
        .get_root_lb_clients()
        .await?
        .into_keys()
        .map(|name| RootLbResponse {
            shared: name == shared,
            name,
        })
        .collect();
    Ok(Json(lbs))
}

pub async fn set_trust_policy(
    State(state): State<AppState>,
    Json(req): Json<TrustPolicyRequest>,
) -> Result<StatusCode, ApiError> {
    let name = match req.policy {
        Some(policy) => {
            let name = policy.name.clone();
            state.policies.update(policy).await;
            Some(name)
        }
        None => None,
    };
    state
        .platform
        .configure_trust_policy(name.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
