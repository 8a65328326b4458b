use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Engine(#[from] ec_vmlayer::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use ec_vmlayer::Error as E;

        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Engine(e) => match e.root() {
                E::Config(_) => StatusCode::BAD_REQUEST,
                E::Lookup(_) => StatusCode::UNPROCESSABLE_ENTITY,
                E::NotReady(_) => StatusCode::GATEWAY_TIMEOUT,
                E::Infra(_) | E::Ssh(_) | E::Http(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

