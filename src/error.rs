use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("malformed stored document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record already exists")]
    Duplicate,

    #[error("record was modified concurrently")]
    Conflict,

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("lesson {0} is locked until the previous lesson is completed")]
    LessonLocked(String),

    #[error("already enrolled in course {0}")]
    AlreadyEnrolled(uuid::Uuid),

    #[error("an exam attempt is already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("{0} is already finalized")]
    AlreadySubmitted(String),

    #[error("exam attempt {0} is past its deadline")]
    AttemptExpired(uuid::Uuid),

    #[error("exam attempt {0} is still within its time window")]
    AttemptStillOpen(uuid::Uuid),

    #[error("retake not allowed: {0}")]
    RetakeNotAllowed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing caller identity")]
    Unauthenticated,

    #[error("concurrent update on {0}, try again")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        EngineError::NotFound(what.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::LessonLocked(_) => "lesson_locked",
            EngineError::AlreadyEnrolled(_) => "already_enrolled",
            EngineError::AlreadyInProgress(_) => "already_in_progress",
            EngineError::AlreadySubmitted(_) => "already_submitted",
            EngineError::AttemptExpired(_) => "attempt_expired",
            EngineError::AttemptStillOpen(_) => "attempt_still_open",
            EngineError::RetakeNotAllowed(_) => "retake_not_allowed",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::Conflict(_) => "conflict",
            EngineError::Store(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::LessonLocked(_) => StatusCode::FORBIDDEN,
            EngineError::AlreadyEnrolled(_)
            | EngineError::AlreadyInProgress(_)
            | EngineError::AlreadySubmitted(_)
            | EngineError::AttemptStillOpen(_)
            | EngineError::RetakeNotAllowed(_)
            | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::AttemptExpired(_) => StatusCode::GONE,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            EngineError::Store(e) => {
                tracing::error!(error = %e, "internal error");
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
