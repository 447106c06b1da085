//! Lesson state transitions and the cascade unlock.
//!
//! Each function mutates a `Progress` in place and reports whether anything
//! changed, so the caller can skip a write for no-ops.

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::gate;
use crate::models::{Lesson, LessonStatus, Progress};

/// NotStarted -> InProgress. Already started or completed lessons are left alone.
pub fn start_lesson(progress: &mut Progress, lessons: &[Lesson], lesson_id: Uuid) -> EngineResult<bool> {
    gate::ensure_lesson(progress, lessons, lesson_id)?;

    let state = progress.lesson_state_mut(lesson_id);
    if state.status != LessonStatus::NotStarted {
        return Ok(false);
    }
    state.status = LessonStatus::InProgress;
    Ok(true)
}

/// Marks the lesson completed and pre-opens the next one.
///
/// A second call on a completed lesson is a no-op, so the cascade runs at
/// most once per lesson. Completing the last lesson leaves the final exam
/// NotStarted; it needs its own explicit start.
pub fn complete_lesson(
    progress: &mut Progress,
    lessons: &[Lesson],
    lesson_id: Uuid,
    note: Option<&str>,
) -> EngineResult<bool> {
    gate::ensure_lesson(progress, lessons, lesson_id)?;

    let state = progress.lesson_state_mut(lesson_id);
    if state.status == LessonStatus::Completed {
        return Ok(false);
    }
    state.status = LessonStatus::Completed;
    if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
        state.note = Some(note.to_string());
    }

    if let Some(next) = gate::next_lesson(lessons, lesson_id) {
        let next_state = progress.lesson_state_mut(next.id);
        if next_state.status == LessonStatus::NotStarted {
            next_state.status = LessonStatus::InProgress;
        }
    }
    Ok(true)
}

/// Notes never affect gating. Any lesson the gate lets the student into may
/// carry one.
pub fn save_note(
    progress: &mut Progress,
    lessons: &[Lesson],
    lesson_id: Uuid,
    note: &str,
) -> EngineResult<bool> {
    let accessed = progress.lesson_status(lesson_id) != LessonStatus::NotStarted
        || gate::lesson_accessible(progress, lessons, lesson_id)?;
    if !accessed {
        return Err(EngineError::LessonLocked(lesson_id.to_string()));
    }

    let state = progress.lesson_state_mut(lesson_id);
    let note = Some(note.to_string()).filter(|n| !n.is_empty());
    if state.note == note {
        return Ok(false);
    }
    state.note = note;
    Ok(true)
}
