//! Unified error handling for the task dispatch services.
//!
//! Three error kinds cross component boundaries (`NotFound`, `Conflict`,
//! `ExternalUnavailable`); everything else is logged and handled locally by
//! the caller. `ServiceError` carries the HTTP mapping for the three kinds
//! that do cross into `services/api`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// `{"detail": "..."}` body shape required by the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Service-level error type shared by the store, outbox, broker and HTTP layers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ExternalUnavailable(String),

    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::ExternalUnavailable(_) => 503,
            ServiceError::Validation(_) => 422,
            ServiceError::Database(_) | ServiceError::Internal(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(ServiceError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            detail: self.to_string(),
        })
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound("resource not found".to_string()),
            _ => ServiceError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ServiceError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ServiceError::Conflict("x".into()).status_code(), 409);
        assert_eq!(ServiceError::ExternalUnavailable("x".into()).status_code(), 503);
        assert_eq!(ServiceError::Validation("x".into()).status_code(), 422);
    }

    #[test]
    fn test_error_response_detail_shape() {
        let err = ServiceError::NotFound("task not found".into());
        let resp = err.error_response();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: ServiceError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
