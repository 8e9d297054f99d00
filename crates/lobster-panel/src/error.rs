//! Error type shared by the panel services and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use lobster_client::ErrorResponse;

use crate::driver::DriverError;
use crate::storage::DatabaseError;

/// Errors surfaced by panel operations.
///
/// The `Display` text of the user-facing variants is shown to end users;
/// driver, database and internal detail is logged and replaced with a
/// generic message.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("{0}")]
    Validation(String),

    #[error("VM is not ready yet")]
    VmNotReady,

    #[error("VM is suspended due to negative credit, make a payment first")]
    VmSuspendedAuto,

    #[error("VM is suspended, please see abuse ticket under Support tab")]
    VmSuspendedManual,

    #[error("VM has pending task, please try again later")]
    VmTaskPending,

    #[error("operation not supported")]
    Unsupported,

    #[error("insufficient credit (make a payment from the Billing tab)")]
    InsufficientCredit,

    #[error("too many attempts, please try again later")]
    TryAgainLater,

    #[error("authentication failure")]
    AuthFailure,

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden")]
    Forbidden,

    #[error("provider error: {0}")]
    Driver(DriverError),

    #[error("database error: {0}")]
    Database(DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DatabaseError> for PanelError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

impl From<DriverError> for PanelError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Unsupported => Self::Unsupported,
            other => Self::Driver(other),
        }
    }
}

impl PanelError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::VmNotReady
            | Self::VmSuspendedAuto
            | Self::VmSuspendedManual
            | Self::VmTaskPending
            | Self::Unsupported
            | Self::InsufficientCredit => StatusCode::BAD_REQUEST,
            Self::TryAgainLater => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Driver(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The message safe to show to an end user.
    pub fn public_message(&self) -> String {
        match self {
            Self::Driver(_) | Self::Database(_) | Self::Internal(_) => {
                "an internal error occurred, please try again later".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
