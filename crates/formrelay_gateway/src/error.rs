use axum::{
    response::{IntoResponse, Response},
    Json,
};
use formrelay_contract::ValidationError;
use formrelay_queue::QueueError;
use http::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub const ACCEPTED_MESSAGE: &str = "Formulario recibido con éxito";
pub const ENQUEUE_FAILED_MESSAGE: &str = "Error al enviar los datos. Intente de nuevo más tarde.";
pub const NOT_FOUND_MESSAGE: &str = "No encontrado";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    MalformedBody(String),
    #[error("failed to queue submission: {source}")]
    Enqueue {
        #[source]
        source: QueueError,
        expose_detail: bool,
    },
}

impl ApiError {
    pub fn enqueue(source: QueueError, expose_detail: bool) -> Self {
        ApiError::Enqueue {
            source,
            expose_detail,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Enqueue { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Validation(err) => err.to_string(),
            ApiError::MalformedBody(detail) => detail.clone(),
            ApiError::Enqueue {
                source,
                expose_detail,
            } => {
                error!(error = %source, "submission could not be queued");
                if *expose_detail {
                    source.to_string()
                } else {
                    ENQUEUE_FAILED_MESSAGE.to_string()
                }
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
