use axum::Json;
use axum::extract::State;
use ec_infra::types::VmGroupOrchestrationParams;
use ec_vmlayer::progress;

use crate::dto::VmGroupRequest;
use crate::error::ApiError;
use crate::state::AppState;

/// Compile and apply a VM group; responds with the populated plan.
pub async fn orchestrate_vm_group(
    State(state): State<AppState>,
    Json(req): Json<VmGroupRequest>,
) -> Result<Json<VmGroupOrchestrationParams>, ApiError> {
    if req.group_name.is_empty() {
        return Err(ApiError::BadRequest("group_name is required".into()));
    }
    let plan = state
        .platform
        .orchestrate_vms_from_vm_spec(
            &req.group_name,
            req.vms,
            req.action,
            &progress::logging(req.group_name.clone()),
            req.options,
        )
        .await?;
    Ok(Json(plan))
}
