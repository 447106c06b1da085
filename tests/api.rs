mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{fixture, Fixture};
use course_progress_engine::{app, routes::CALLER_HEADER};

async fn call(app: &Router, method: &str, uri: &str, student: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(student) = student {
        req = req.header(CALLER_HEADER, student);
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()));
    (status, value)
}

fn setup(f: &Fixture) -> Router {
    app(f.engine.clone())
}

#[tokio::test]
async fn health_endpoint_is_ok() {
    let f = fixture(1).await;
    let (status, body) = call(&setup(&f), "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
}

#[tokio::test]
async fn health_reports_store_outage() {
    let f = fixture(1).await;
    let (engine, store) = f.flaky();
    store.set_down(true);
    let (status, body) = call(&app(engine), "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, Value::String("unavailable".into()));
}

#[tokio::test]
async fn caller_identity_is_required() {
    let f = fixture(1).await;
    let (status, body) = call(&setup(&f), "GET", "/certificates", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn enroll_and_gate() {
    let f = fixture(2).await;
    let app = setup(&f);
    let enroll = json!({ "course_id": f.course.id });

    let (status, body) = call(&app, "POST", "/enroll", Some("alice"), Some(enroll.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["final_exam"]["status"], "not_started");
    assert_eq!(body["lessons"][0]["unlocked"], true);
    assert_eq!(body["lessons"][1]["unlocked"], false);

    let (status, body) = call(&app, "POST", "/enroll", Some("alice"), Some(enroll)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_enrolled");

    let uri = format!("/lesson/{}", f.lesson(2));
    let (status, body) = call(&app, "GET", &uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "lesson_locked");

    let (status, _) = call(
        &app,
        "PUT",
        &uri,
        Some("alice"),
        Some(json!({ "status": "in_progress" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, "GET", &format!("/progress/{}", f.course.id), Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn full_course_to_certificate() {
    let f = fixture(2).await;
    let app = setup(&f);
    let student = Some("alice");

    call(&app, "POST", "/enroll", student, Some(json!({ "course_id": f.course.id }))).await;
    for position in 1..=2 {
        let uri = format!("/lesson/{}", f.lesson(position));
        let (status, body) = call(
            &app,
            "PUT",
            &uri,
            student,
            Some(json!({ "status": "completed", "note": "watched" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let (status, body) = call(&app, "POST", &format!("/exam/{}/start", f.course.id), student, None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(!body.to_string().contains("is_correct"));
    let attempt_id = body["attempt"]["id"].as_str().unwrap().to_string();

    let answers = [
        (f.q1().id, vec![f.answer(f.q1(), "A")]),
        (f.q2().id, vec![f.answer(f.q2(), "B"), f.answer(f.q2(), "C")]),
    ];
    for (question_id, selected) in answers {
        let (status, body) = call(
            &app,
            "PUT",
            &format!("/exam/{attempt_id}/answer"),
            student,
            Some(json!({ "question_id": question_id, "selected_answer_ids": selected })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    let (status, body) = call(&app, "POST", &format!("/exam/{attempt_id}/submit"), student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["score"], 10);
    assert_eq!(body["isPassed"], true);

    let (status, body) = call(&app, "POST", &format!("/exam/{attempt_id}/submit"), student, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_submitted");

    let (status, body) = call(&app, "POST", &format!("/exam/{}/retake", f.course.id), student, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "retake_not_allowed");

    let (status, body) = call(&app, "GET", "/certificates", student, None).await;
    assert_eq!(status, StatusCode::OK);
    let certs = body.as_array().unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0]["isPassed"], true);
    assert_eq!(certs[0]["exam_attempt_id"], attempt_id.as_str());
}

#[tokio::test]
async fn late_answer_is_gone() {
    let f = fixture(1).await;
    let app = setup(&f);
    let student = Some("alice");

    call(&app, "POST", "/enroll", student, Some(json!({ "course_id": f.course.id }))).await;
    f.complete_all_lessons("alice").await;
    let (_, body) = call(&app, "POST", &format!("/exam/{}/start", f.course.id), student, None).await;
    let attempt_id = body["attempt"]["id"].as_str().unwrap().to_string();

    f.clock.advance(chrono::Duration::minutes(45));
    let (status, body) = call(
        &app,
        "PUT",
        &format!("/exam/{attempt_id}/answer"),
        student,
        Some(json!({ "question_id": f.q1().id, "selected_answer_ids": [f.answer(f.q1(), "A")] })),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "attempt_expired");

    let (status, body) = call(&app, "POST", &format!("/exam/{attempt_id}/expire"), student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "expired");
    assert_eq!(body["isPassed"], false);

    let (status, body) = call(&app, "GET", &format!("/exam/{attempt_id}"), student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt"]["status"], "expired");
    assert_eq!(body["remaining_seconds"], 0);
}
