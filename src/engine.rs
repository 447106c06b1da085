//! Request-level operations. Each one is a read-modify-write against the
//! store, serialised per Progress / per attempt by [`KeyedLocks`] and
//! guarded across processes by the store's conditional writes.

use std::sync::Arc;

use uuid::Uuid;

use crate::certification;
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::gate;
use crate::locks::KeyedLocks;
use crate::models::*;
use crate::session;
use crate::store::{Finalized, Store};
use crate::tracker;

const SAVE_RETRIES: usize = 3;

/// Who is driving an operation. Expiry may be triggered by the system.
#[derive(Debug, Clone, Copy)]
pub enum Actor<'a> {
    Student(&'a str),
    System,
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // --- lookups ---

    async fn course(&self, course_id: Uuid) -> EngineResult<Course> {
        self.store
            .course(course_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("course {course_id}")))
    }

    async fn lesson(&self, lesson_id: Uuid) -> EngineResult<Lesson> {
        self.store
            .lesson(lesson_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("lesson {lesson_id}")))
    }

    async fn load_progress(&self, student_id: &str, course_id: Uuid) -> EngineResult<Progress> {
        self.store
            .progress(student_id, course_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("enrollment of {student_id} in course {course_id}"))
            })
    }

    async fn exam_by_id(&self, exam_id: Uuid) -> EngineResult<Exam> {
        self.store
            .exam(exam_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("exam {exam_id}")))
    }

    /// Attempts owned by someone else read as missing.
    async fn owned_attempt(&self, actor: Actor<'_>, attempt_id: Uuid) -> EngineResult<ExamAttempt> {
        let attempt = self
            .store
            .attempt(attempt_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("exam attempt {attempt_id}")))?;
        match actor {
            Actor::Student(id) if id != attempt.student_id => {
                Err(EngineError::not_found(format!("exam attempt {attempt_id}")))
            }
            _ => Ok(attempt),
        }
    }

    /// Applies `apply` and saves. On an optimistic conflict the record is
    /// re-read and the (idempotent) transition applied again. Unchanged
    /// records are not written. Callers hold the progress lock.
    async fn commit_progress<T, F>(&self, mut progress: Progress, mut apply: F) -> EngineResult<(Progress, T)>
    where
        F: FnMut(&mut Progress) -> EngineResult<T> + Send,
        T: Send,
    {
        for _ in 0..SAVE_RETRIES {
            let before = progress.clone();
            let value = apply(&mut progress)?;
            if progress == before {
                return Ok((progress, value));
            }
            progress.updated_at = self.clock.now();
            match self.store.save_progress(&progress).await {
                Ok(saved) => return Ok((saved, value)),
                Err(StoreError::Conflict) => {
                    tracing::debug!(
                        student = %progress.student_id,
                        course = %progress.course_id,
                        "progress changed underneath, retrying"
                    );
                    progress = self.load_progress(&before.student_id, before.course_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "progress of {} in course {}",
            progress.student_id, progress.course_id
        )))
    }

    // --- enrollment store ---

    pub async fn enroll(&self, student_id: &str, course_id: Uuid) -> EngineResult<ProgressView> {
        let course = self.course(course_id).await?;
        let _guard = self.locks.lock(KeyedLocks::progress_key(student_id, course_id)).await;

        let progress = Progress::new(student_id, &course, self.clock.now());
        match self.store.insert_progress(&progress).await {
            Ok(()) => {}
            Err(StoreError::Duplicate) => return Err(EngineError::AlreadyEnrolled(course_id)),
            Err(e) => return Err(e.into()),
        }
        tracing::info!(student = %student_id, course = %course_id, "enrolled");
        Ok(gate::view(progress, &course.lessons))
    }

    pub async fn progress(&self, student_id: &str, course_id: Uuid) -> EngineResult<ProgressView> {
        let course = self.course(course_id).await?;
        let progress = self.load_progress(student_id, course_id).await?;
        Ok(gate::view(progress, &course.lessons))
    }

    // --- lesson gate / tracker ---

    /// Lesson content, served only through the gate.
    pub async fn lesson_content(&self, student_id: &str, lesson_id: Uuid) -> EngineResult<Lesson> {
        let lesson = self.lesson(lesson_id).await?;
        let course = self.course(lesson.course_id).await?;
        let progress = self.load_progress(student_id, course.id).await?;
        let allowed = gate::ensure_lesson(&progress, &course.lessons, lesson_id)?;
        Ok(allowed.clone())
    }

    async fn mutate_lesson<F>(&self, student_id: &str, lesson_id: Uuid, apply: F) -> EngineResult<(ProgressView, bool)>
    where
        F: Fn(&mut Progress, &[Lesson]) -> EngineResult<bool> + Send + Sync,
    {
        let lesson = self.lesson(lesson_id).await?;
        let course = self.course(lesson.course_id).await?;
        let _guard = self.locks.lock(KeyedLocks::progress_key(student_id, course.id)).await;

        let progress = self.load_progress(student_id, course.id).await?;
        let lessons: &[Lesson] = &course.lessons;
        let (saved, changed) = self
            .commit_progress(progress, |p| apply(p, lessons))
            .await?;
        Ok((gate::view(saved, lessons), changed))
    }

    pub async fn start_lesson(&self, student_id: &str, lesson_id: Uuid) -> EngineResult<ProgressView> {
        let (view, changed) = self
            .mutate_lesson(student_id, lesson_id, |p, lessons| {
                tracker::start_lesson(p, lessons, lesson_id)
            })
            .await?;
        if changed {
            tracing::info!(student = %student_id, lesson = %lesson_id, "lesson started");
        }
        Ok(view)
    }

    pub async fn complete_lesson(
        &self,
        student_id: &str,
        lesson_id: Uuid,
        note: Option<&str>,
    ) -> EngineResult<ProgressView> {
        let (view, changed) = self
            .mutate_lesson(student_id, lesson_id, |p, lessons| {
                tracker::complete_lesson(p, lessons, lesson_id, note)
            })
            .await?;
        if changed {
            tracing::info!(student = %student_id, lesson = %lesson_id, "lesson completed");
        } else {
            tracing::debug!(student = %student_id, lesson = %lesson_id, "lesson already completed");
        }
        Ok(view)
    }

    pub async fn save_note(&self, student_id: &str, lesson_id: Uuid, note: &str) -> EngineResult<ProgressView> {
        let (view, _) = self
            .mutate_lesson(student_id, lesson_id, |p, lessons| {
                tracker::save_note(p, lessons, lesson_id, note)
            })
            .await?;
        Ok(view)
    }

    /// `PUT /lesson/{id}`: the requested status picks the transition, a note
    /// rides along with any of them.
    pub async fn update_lesson(
        &self,
        student_id: &str,
        lesson_id: Uuid,
        req: &LessonUpdateReq,
    ) -> EngineResult<ProgressView> {
        let note = req.note.as_deref();
        match req.status {
            LessonStatus::Completed => {
                let view = self.complete_lesson(student_id, lesson_id, note).await?;
                // completing an already completed lesson can still edit its note
                let stale = note.filter(|n| !n.trim().is_empty()).filter(|n| {
                    view.lessons
                        .iter()
                        .any(|l| l.lesson_id == lesson_id && l.note.as_deref() != Some(*n))
                });
                match stale {
                    Some(n) => self.save_note(student_id, lesson_id, n).await,
                    None => Ok(view),
                }
            }
            LessonStatus::InProgress => {
                let view = self.start_lesson(student_id, lesson_id).await?;
                match note {
                    Some(n) => self.save_note(student_id, lesson_id, n).await,
                    None => Ok(view),
                }
            }
            LessonStatus::NotStarted => match note {
                Some(n) => self.save_note(student_id, lesson_id, n).await,
                None => Err(EngineError::InvalidRequest(
                    "status not_started only carries a note; note is missing".into(),
                )),
            },
        }
    }

    // --- exam session manager ---

    pub async fn start_exam(&self, student_id: &str, course_id: Uuid) -> EngineResult<AttemptView> {
        let course = self.course(course_id).await?;
        let exam = self
            .store
            .exam_for_course(course_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("final exam of course {course_id}")))?;
        let _guard = self.locks.lock(KeyedLocks::progress_key(student_id, course_id)).await;

        for _ in 0..SAVE_RETRIES {
            let mut progress = self.load_progress(student_id, course_id).await?;
            let open = self.store.open_attempt(student_id, exam.id).await?;
            let now = self.clock.now();
            let attempt = session::open_attempt(&mut progress, &course, &exam, open.as_ref(), now)?;
            progress.updated_at = now;

            match self.store.begin_attempt(&attempt, &progress).await {
                Ok(_) => {
                    tracing::info!(
                        student = %student_id,
                        course = %course_id,
                        attempt = %attempt.id,
                        deadline = %attempt.deadline(),
                        "exam started"
                    );
                    return Ok(AttemptView {
                        deadline: attempt.deadline(),
                        remaining_seconds: attempt.remaining_seconds(now),
                        exam: exam.public_view(),
                        attempt,
                    });
                }
                Err(StoreError::Duplicate) => {
                    return Err(EngineError::AlreadyInProgress(format!("final exam of course {course_id}")))
                }
                // progress moved underneath; re-check the gate against fresh state
                Err(StoreError::Conflict) => {
                    tracing::debug!(student = %student_id, course = %course_id, "exam start raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!("progress of {student_id} in course {course_id}")))
    }

    pub async fn attempt(&self, student_id: &str, attempt_id: Uuid) -> EngineResult<AttemptView> {
        let attempt = self.owned_attempt(Actor::Student(student_id), attempt_id).await?;
        let exam = self.exam_by_id(attempt.exam_id).await?;
        Ok(AttemptView {
            deadline: attempt.deadline(),
            remaining_seconds: attempt.remaining_seconds(self.clock.now()),
            exam: exam.public_view(),
            attempt,
        })
    }

    pub async fn record_answer(
        &self,
        student_id: &str,
        attempt_id: Uuid,
        req: &AnswerReq,
    ) -> EngineResult<ExamAttempt> {
        let _guard = self.locks.lock(KeyedLocks::attempt_key(attempt_id)).await;
        let mut attempt = self.owned_attempt(Actor::Student(student_id), attempt_id).await?;
        let exam = self.exam_by_id(attempt.exam_id).await?;

        session::record_answer(
            &mut attempt,
            &exam,
            req.question_id,
            &req.selected_answer_ids,
            self.clock.now(),
        )?;
        if !self.store.save_answers(&attempt).await? {
            return Err(EngineError::AlreadySubmitted(format!("exam attempt {attempt_id}")));
        }
        tracing::debug!(
            student = %student_id,
            attempt = %attempt_id,
            question = %req.question_id,
            selected = req.selected_answer_ids.len(),
            "answer recorded"
        );
        Ok(attempt)
    }

    pub async fn submit(&self, student_id: &str, attempt_id: Uuid) -> EngineResult<ExamOutcome> {
        self.finalize(Actor::Student(student_id), attempt_id, session::submit).await
    }

    /// Closes an attempt whose window has passed, scoring what was recorded.
    pub async fn finalize_expired(&self, actor: Actor<'_>, attempt_id: Uuid) -> EngineResult<ExamOutcome> {
        self.finalize(actor, attempt_id, session::expire).await
    }

    async fn finalize<F>(&self, actor: Actor<'_>, attempt_id: Uuid, transition: F) -> EngineResult<ExamOutcome>
    where
        F: FnOnce(&mut ExamAttempt, &Exam, chrono::DateTime<chrono::Utc>) -> EngineResult<u32> + Send,
    {
        let _attempt_guard = self.locks.lock(KeyedLocks::attempt_key(attempt_id)).await;
        let mut attempt = self.owned_attempt(actor, attempt_id).await?;
        let exam = self.exam_by_id(attempt.exam_id).await?;
        let course = self.course(attempt.course_id).await?;

        let now = self.clock.now();
        let score = transition(&mut attempt, &exam, now)?;
        let candidate = certification::certificate_for(&attempt, course.pass_policy, exam.total_mark(), now)?;

        // attempt close, progress and certificate commit together
        let _progress_guard = self
            .locks
            .lock(KeyedLocks::progress_key(&attempt.student_id, attempt.course_id))
            .await;
        let mut finalized = None;
        for _ in 0..SAVE_RETRIES {
            let mut progress = self.load_progress(&attempt.student_id, attempt.course_id).await?;
            session::complete_final_exam(&mut progress, attempt_id);
            progress.updated_at = now;

            match self.store.finalize_attempt(&attempt, &progress, &candidate).await {
                Ok(Some(done)) => {
                    finalized = Some(done);
                    break;
                }
                // another process finalized it first
                Ok(None) => return Err(EngineError::AlreadySubmitted(format!("exam attempt {attempt_id}"))),
                Err(StoreError::Conflict) => {
                    tracing::debug!(attempt = %attempt_id, "progress changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let Finalized { certificate, .. } = finalized.ok_or_else(|| {
            EngineError::Conflict(format!(
                "progress of {} in course {}",
                attempt.student_id, attempt.course_id
            ))
        })?;

        tracing::info!(
            student = %attempt.student_id,
            course = %attempt.course_id,
            attempt = %attempt_id,
            status = attempt.status.as_str(),
            score,
            passed = certificate.is_passed,
            "exam attempt finalized"
        );
        Ok(ExamOutcome {
            attempt_id,
            status: attempt.status,
            score,
            total_mark: exam.total_mark(),
            is_passed: certificate.is_passed,
            certificate,
        })
    }

    /// Expires every open attempt that is past its deadline. Returns how many
    /// were closed by this sweep.
    pub async fn sweep_expired(&self) -> EngineResult<usize> {
        let due = self.store.expired_attempts(self.clock.now()).await?;
        let mut closed = 0;
        for attempt_id in due {
            match self.finalize_expired(Actor::System, attempt_id).await {
                Ok(_) => closed += 1,
                // raced with a submit or another sweeper
                Err(EngineError::AlreadySubmitted(_)) | Err(EngineError::AttemptStillOpen(_)) => {}
                Err(e) => {
                    tracing::warn!(attempt = %attempt_id, error = %e, "failed to expire exam attempt")
                }
            }
        }
        Ok(closed)
    }

    // --- certification decider ---

    async fn issue(&self, attempt: &ExamAttempt, exam: &Exam) -> EngineResult<Certificate> {
        if let Some(existing) = self.store.certificate_for_attempt(attempt.id).await? {
            return Ok(existing);
        }
        let course = self.course(attempt.course_id).await?;
        let candidate = certification::certificate_for(
            attempt,
            course.pass_policy,
            exam.total_mark(),
            self.clock.now(),
        )?;
        let stored = self.store.insert_certificate(&candidate).await?;
        if stored.id == candidate.id {
            tracing::info!(
                student = %stored.student_id,
                course = %stored.course_id,
                attempt = %attempt.id,
                passed = stored.is_passed,
                "certificate recorded"
            );
        } else {
            tracing::debug!(certificate = %stored.id, "certificate already on record");
        }
        Ok(stored)
    }

    /// Idempotent: a finalized attempt maps to exactly one certificate, and a
    /// student never holds two passing ones for a course.
    pub async fn evaluate(&self, actor: Actor<'_>, attempt_id: Uuid) -> EngineResult<Certificate> {
        let attempt = self.owned_attempt(actor, attempt_id).await?;
        if !attempt.status.is_terminal() {
            return Err(EngineError::InvalidRequest(format!(
                "exam attempt {attempt_id} is not finalized"
            )));
        }
        let exam = self.exam_by_id(attempt.exam_id).await?;
        self.issue(&attempt, &exam).await
    }

    pub async fn retake(&self, student_id: &str, course_id: Uuid) -> EngineResult<ProgressView> {
        let course = self.course(course_id).await?;
        let _guard = self.locks.lock(KeyedLocks::progress_key(student_id, course_id)).await;

        let progress = self.load_progress(student_id, course_id).await?;
        let latest = self.store.latest_certificate(student_id, course_id).await?;
        let (saved, ()) = self
            .commit_progress(progress, |p| certification::reopen_for_retake(p, latest.as_ref()))
            .await?;
        tracing::info!(student = %student_id, course = %course_id, "final exam reopened for retake");
        Ok(gate::view(saved, &course.lessons))
    }

    pub async fn certificates(&self, student_id: &str) -> EngineResult<Vec<Certificate>> {
        Ok(self.store.certificates(student_id).await?)
    }
}
