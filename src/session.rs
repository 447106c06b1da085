//! Exam attempt state machine.
//!
//! `Open -> Submitted` when the student submits inside the window,
//! `Open -> Expired` once the window has passed. Both are terminal. The
//! deadline is checked here, against the server clock passed in as `now`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::gate;
use crate::models::{AttemptStatus, Course, ExamAttempt, ExamStatus, Exam, Progress};
use crate::scoring;

fn attempt_label(attempt: &ExamAttempt) -> String {
    format!("exam attempt {}", attempt.id)
}

fn ensure_open(attempt: &ExamAttempt) -> EngineResult<()> {
    if attempt.status.is_terminal() {
        return Err(EngineError::AlreadySubmitted(attempt_label(attempt)));
    }
    Ok(())
}

/// Opens a new attempt and marks the final exam in progress.
///
/// `existing_open` is the student's current open attempt for this exam, if
/// the store has one.
pub fn open_attempt(
    progress: &mut Progress,
    course: &Course,
    exam: &Exam,
    existing_open: Option<&ExamAttempt>,
    now: DateTime<Utc>,
) -> EngineResult<ExamAttempt> {
    if exam.course_id != course.id || progress.course_id != course.id {
        return Err(EngineError::not_found(format!(
            "exam {} for course {}",
            exam.id, course.id
        )));
    }
    if !gate::final_exam_accessible(progress, &course.lessons) {
        return Err(EngineError::LessonLocked(format!("final exam of course {}", course.id)));
    }
    if progress.final_exam.status == ExamStatus::Completed {
        return Err(EngineError::AlreadySubmitted(format!(
            "final exam of course {}",
            course.id
        )));
    }
    if let Some(open) = existing_open {
        return Err(EngineError::AlreadyInProgress(open.id.to_string()));
    }

    let attempt = ExamAttempt {
        id: Uuid::new_v4(),
        student_id: progress.student_id.clone(),
        course_id: course.id,
        exam_id: exam.id,
        started_at: now,
        duration_minutes: exam.duration_minutes,
        answers: Default::default(),
        status: AttemptStatus::Open,
        score: None,
        finalized_at: None,
    };
    progress.final_exam.status = ExamStatus::InProgress;
    progress.final_exam.attempt_id = Some(attempt.id);
    Ok(attempt)
}

/// Last write wins per question; an empty selection clears the answer.
pub fn record_answer(
    attempt: &mut ExamAttempt,
    exam: &Exam,
    question_id: Uuid,
    selected: &[Uuid],
    now: DateTime<Utc>,
) -> EngineResult<()> {
    ensure_open(attempt)?;
    if attempt.is_past_deadline(now) {
        return Err(EngineError::AttemptExpired(attempt.id));
    }
    let question = exam
        .question(question_id)
        .ok_or_else(|| EngineError::not_found(format!("question {question_id}")))?;
    if let Some(bad) = selected.iter().find(|id| !question.has_answer(**id)) {
        return Err(EngineError::InvalidRequest(format!(
            "answer {bad} does not belong to question {question_id}"
        )));
    }

    let selected: BTreeSet<Uuid> = selected.iter().copied().collect();
    attempt.answers.insert(question_id, selected);
    Ok(())
}

fn finalize(attempt: &mut ExamAttempt, exam: &Exam, status: AttemptStatus, now: DateTime<Utc>) -> u32 {
    let score = scoring::score(exam, &attempt.answers);
    attempt.status = status;
    attempt.score = Some(score);
    attempt.finalized_at = Some(now);
    score
}

/// Student-initiated finalization, only inside the window.
pub fn submit(attempt: &mut ExamAttempt, exam: &Exam, now: DateTime<Utc>) -> EngineResult<u32> {
    ensure_open(attempt)?;
    if attempt.is_past_deadline(now) {
        return Err(EngineError::AttemptExpired(attempt.id));
    }
    Ok(finalize(attempt, exam, AttemptStatus::Submitted, now))
}

/// Time-driven finalization. Scores whatever answers were recorded.
pub fn expire(attempt: &mut ExamAttempt, exam: &Exam, now: DateTime<Utc>) -> EngineResult<u32> {
    ensure_open(attempt)?;
    if !attempt.is_past_deadline(now) {
        return Err(EngineError::AttemptStillOpen(attempt.id));
    }
    Ok(finalize(attempt, exam, AttemptStatus::Expired, now))
}

pub fn complete_final_exam(progress: &mut Progress, attempt_id: Uuid) {
    progress.final_exam.status = ExamStatus::Completed;
    progress.final_exam.attempt_id = Some(attempt_id);
}
