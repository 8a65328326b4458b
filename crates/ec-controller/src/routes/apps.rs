use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use ec_vmlayer::cache::AppInstCache;
use ec_vmlayer::model::AppInst;

use crate::state::AppState;

pub async fn list_apps(State(state): State<AppState>) -> Json<Vec<AppInst>> {
    let mut apps = Vec::new();
    for key in state.apps.get_all_keys().await {
        if let Some(app) = AppInstCache::get(&*state.apps, &key).await {
            apps.push(app);
        }
    }
    Json(apps)
}

/// Track an app instance so HA recovery can see it.
pub async fn upsert_app(State(state): State<AppState>, Json(app): Json<AppInst>) -> StatusCode {
    tracing::debug!(app = %app.key, state = %app.state, "app instance tracked");
    state.apps.update(app).await;
    StatusCode::NO_CONTENT
}
