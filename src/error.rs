use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("chat template error: {0}")]
    Template(String),
    #[error("hub download failed: {0}")]
    Hub(String),
    #[error("model artifact missing: {0}")]
    MissingArtifact(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<minijinja::Error> for ServiceError {
    fn from(err: minijinja::Error) -> Self {
        ServiceError::Template(err.to_string())
    }
}

#[cfg(feature = "tch-backend")]
impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::MissingArtifact(_) | ServiceError::Hub(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::Adapter(_)
            | ServiceError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) | ServiceError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(error = %self, "request failed");

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
