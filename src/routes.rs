use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    engine::{Actor, Engine},
    error::{EngineError, EngineResult},
    models::*,
};

/// Header the upstream auth gateway fills with the authenticated student id.
pub const CALLER_HEADER: &str = "x-student-id";

/// Caller identity, passed explicitly into every engine operation.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or(EngineError::Unauthenticated)
    }
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        // enrollment + progress
        .route("/enroll", post(enroll))
        .route("/progress/:course_id", get(get_progress))
        // lessons
        .route("/lesson/:lesson_id", get(get_lesson).put(update_lesson))
        // final exam; `:id` is a course id for start/retake, an attempt id otherwise
        .route("/exam/:id", get(get_attempt))
        .route("/exam/:id/start", post(start_exam))
        .route("/exam/:id/answer", put(record_answer))
        .route("/exam/:id/submit", post(submit))
        .route("/exam/:id/expire", post(expire))
        .route("/exam/:id/evaluate", post(evaluate))
        .route("/exam/:id/retake", post(retake))
        // certificates
        .route("/certificates", get(certificates))
        .with_state(engine)
}

async fn health(State(engine): State<Engine>) -> (StatusCode, &'static str) {
    if engine.store().health_check().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

async fn enroll(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Json(req): Json<EnrollReq>,
) -> EngineResult<Json<ProgressView>> {
    Ok(Json(engine.enroll(&student, req.course_id).await?))
}

async fn get_progress(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(course_id): Path<Uuid>,
) -> EngineResult<Json<ProgressView>> {
    Ok(Json(engine.progress(&student, course_id).await?))
}

async fn get_lesson(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(lesson_id): Path<Uuid>,
) -> EngineResult<Json<Lesson>> {
    Ok(Json(engine.lesson_content(&student, lesson_id).await?))
}

async fn update_lesson(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(lesson_id): Path<Uuid>,
    Json(req): Json<LessonUpdateReq>,
) -> EngineResult<Json<ProgressView>> {
    Ok(Json(engine.update_lesson(&student, lesson_id, &req).await?))
}

async fn start_exam(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(course_id): Path<Uuid>,
) -> EngineResult<Json<AttemptView>> {
    Ok(Json(engine.start_exam(&student, course_id).await?))
}

async fn get_attempt(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(attempt_id): Path<Uuid>,
) -> EngineResult<Json<AttemptView>> {
    Ok(Json(engine.attempt(&student, attempt_id).await?))
}

async fn record_answer(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(attempt_id): Path<Uuid>,
    Json(req): Json<AnswerReq>,
) -> EngineResult<Json<serde_json::Value>> {
    engine.record_answer(&student, attempt_id, &req).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn submit(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(attempt_id): Path<Uuid>,
) -> EngineResult<Json<ExamOutcome>> {
    Ok(Json(engine.submit(&student, attempt_id).await?))
}

async fn expire(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(attempt_id): Path<Uuid>,
) -> EngineResult<Json<ExamOutcome>> {
    Ok(Json(
        engine
            .finalize_expired(Actor::Student(&student), attempt_id)
            .await?,
    ))
}

async fn evaluate(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(attempt_id): Path<Uuid>,
) -> EngineResult<Json<Certificate>> {
    Ok(Json(engine.evaluate(Actor::Student(&student), attempt_id).await?))
}

async fn retake(
    State(engine): State<Engine>,
    Caller(student): Caller,
    Path(course_id): Path<Uuid>,
) -> EngineResult<Json<ProgressView>> {
    Ok(Json(engine.retake(&student, course_id).await?))
}

async fn certificates(
    State(engine): State<Engine>,
    Caller(student): Caller,
) -> EngineResult<Json<Vec<Certificate>>> {
    Ok(Json(engine.certificates(&student).await?))
}
