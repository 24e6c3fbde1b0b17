use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio_postgres::error::SqlState;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy. The kind strings are a stable contract:
/// they are persisted on failed task rows and returned to API callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("external dependency unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable identifier persisted on task rows and surfaced to callers.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::Validation(_) => "Validation",
            Error::PreconditionFailed(_) => "PreconditionFailed",
            Error::Unauthenticated(_) => "Unauthenticated",
            Error::Forbidden(_) => "Forbidden",
            Error::Transient(_) => "Transient",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::ExternalUnavailable(_) => "ExternalUnavailable",
            Error::Internal(_) => "Internal",
        }
    }

    /// Whether a task failing with this error should be retried with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Timeout(_) | Error::ExternalUnavailable(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Transient(_) | Error::ExternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Cancelled => StatusCode::CONFLICT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        // Internal details stay in the log, not the response body.
        let reason = match &self {
            Error::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (
            code,
            Json(serde_json::json!({"kind": self.kind_str(), "reason": reason})),
        )
            .into_response()
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(state) = e.code() {
            match *state {
                SqlState::UNIQUE_VIOLATION
                | SqlState::EXCLUSION_VIOLATION
                | SqlState::FOREIGN_KEY_VIOLATION => {
                    return Error::Conflict(
                        e.as_db_error()
                            .map(|d| d.message().to_string())
                            .unwrap_or_else(|| e.to_string()),
                    );
                }
                SqlState::CHECK_VIOLATION => return Error::Validation(e.to_string()),
                SqlState::T_R_SERIALIZATION_FAILURE | SqlState::T_R_DEADLOCK_DETECTED => {
                    return Error::Transient(e.to_string());
                }
                _ => {}
            }
        }
        if e.is_closed() {
            return Error::Transient(format!("database connection lost: {e}"));
        }
        Error::Internal(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Error::Transient(format!("failed to get db connection: {e}"))
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound(ae.message.clone()),
                409 => Error::Conflict(ae.message.clone()),
                401 => Error::Unauthenticated(ae.message.clone()),
                403 => Error::Forbidden(ae.message.clone()),
                422 => Error::Validation(ae.message.clone()),
                _ => Error::ExternalUnavailable(ae.message.clone()),
            },
            // Transport-level failures (connection refused, TLS, DNS)
            // are all retriable against the host apiserver.
            _ => Error::ExternalUnavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failure: {e}"))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds_are_exactly_transient_timeout_unavailable() {
        let retriable = [
            Error::Transient("x".into()),
            Error::Timeout("x".into()),
            Error::ExternalUnavailable("x".into()),
        ];
        for e in &retriable {
            assert!(e.is_retriable(), "{}", e.kind_str());
        }
        let terminal = [
            Error::NotFound("x".into()),
            Error::Conflict("x".into()),
            Error::Validation("x".into()),
            Error::PreconditionFailed("x".into()),
            Error::Unauthenticated("x".into()),
            Error::Forbidden("x".into()),
            Error::Cancelled,
            Error::Internal("x".into()),
        ];
        for e in &terminal {
            assert!(!e.is_retriable(), "{}", e.kind_str());
        }
    }

    #[test]
    fn kube_api_errors_map_to_taxonomy() {
        let not_found = kube::Error::Api(Box::new(kube::error::ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: "gone".into(),
            reason: "NotFound".into(),
            code: 404,
            metadata: None,
            details: None,
        }));
        assert!(matches!(Error::from(not_found), Error::NotFound(_)));

        let conflict = kube::Error::Api(Box::new(kube::error::ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: "exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
            metadata: None,
            details: None,
        }));
        assert!(matches!(Error::from(conflict), Error::Conflict(_)));
    }

    #[test]
    fn cancelled_maps_to_conflict_status() {
        assert_eq!(Error::Cancelled.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::PreconditionFailed("x".into()).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
    }
}
