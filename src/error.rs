//! Error taxonomy shared by the ingest, aggregate, and recommendation paths.
//!
//! Validation problems map to 400, everything else to 500. Handlers return
//! `Result<_, AnalyticsError>` and let `IntoResponse` shape the JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// Batch failed schema validation; the whole batch is rejected.
    #[error("Invalid analytics batch format: {0}")]
    InvalidBatch(String),

    /// Configuration update violates a documented constraint.
    #[error("{0}")]
    InvalidConfig(String),

    /// Unsupported query parameter or admin action.
    #[error("{0}")]
    InvalidQuery(String),

    /// No recommendation session exists under this id.
    #[error("Unknown session")]
    UnknownSession,

    /// Metrics store failed while folding or persisting.
    #[error("metrics store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Content catalogue could not be fetched.
    #[error("catalogue error: {0}")]
    Catalog(#[source] anyhow::Error),
}

impl AnalyticsError {
    pub fn status(&self) -> StatusCode {
        match self {
            AnalyticsError::InvalidBatch(_)
            | AnalyticsError::InvalidConfig(_)
            | AnalyticsError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AnalyticsError::UnknownSession => StatusCode::NOT_FOUND,
            AnalyticsError::Store(_) | AnalyticsError::Catalog(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AnalyticsError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            // Clients get the fixed message; the detail goes to the log only.
            AnalyticsError::InvalidBatch(detail) => {
                tracing::warn!(target: "api", %detail, "rejected analytics batch");
                json!({ "error": "Invalid analytics batch format" })
            }
            AnalyticsError::InvalidConfig(msg) | AnalyticsError::InvalidQuery(msg) => {
                json!({ "success": false, "error": msg })
            }
            AnalyticsError::UnknownSession => {
                json!({ "success": false, "error": self.to_string() })
            }
            AnalyticsError::Store(e) | AnalyticsError::Catalog(e) => {
                tracing::error!(target: "api", error = ?e, "analytics request failed");
                json!({
                    "error": "Failed to process analytics request",
                    "message": e.to_string(),
                })
            }
        };
        (status, Json(body)).into_response()
    }
}
