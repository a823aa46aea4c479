use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use arbor_storage::StorageError;
use serde::Serialize;

use crate::error::ChatError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    stage: &'static str,
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GenerationConflict { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Storage { source, .. } => storage_status(source),
            Self::Provider { .. }
            | Self::Settings { .. }
            | Self::Bind { .. }
            | Self::Serve { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(stage = self.stage(), error = %self, "request failed");
        } else {
            tracing::debug!(
                stage = self.stage(),
                error = %self,
                status = status.as_u16(),
                "request rejected"
            );
        }

        HttpResponse::build(status).json(ErrorBody {
            error: self.to_string(),
            stage: self.stage(),
        })
    }
}

fn storage_status(error: &StorageError) -> StatusCode {
    match error {
        StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
        StorageError::ParentNotFound { .. }
        | StorageError::InvalidId { .. }
        | StorageError::UnsupportedAttachment { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
