//! Persistence seam for the engine.
//!
//! Course content is read-only here. Progress, attempts and certificates are
//! written by the engine; the conditional writes (`save_progress`,
//! `save_answers`, `begin_attempt`, `finalize_attempt`, `insert_certificate`)
//! carry the concurrency guarantees so that they hold across processes too.
//! `begin_attempt` and `finalize_attempt` are all-or-nothing: on any error
//! none of their writes is visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Certificate, Course, Exam, ExamAttempt, Lesson, Progress};

mod memory;
mod postgres;

pub use memory::{Catalog, MemoryStore};
pub use postgres::PgStore;

/// What `finalize_attempt` committed.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub progress: Progress,
    pub certificate: Certificate,
}

#[async_trait]
pub trait Store: Send + Sync {
    // === Content (read-only) ===

    /// Course with its lessons sorted by position.
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>>;

    async fn lesson(&self, lesson_id: Uuid) -> StoreResult<Option<Lesson>>;

    async fn exam(&self, exam_id: Uuid) -> StoreResult<Option<Exam>>;

    /// The final exam attached to a course.
    async fn exam_for_course(&self, course_id: Uuid) -> StoreResult<Option<Exam>>;

    // === Progress ===

    /// `Duplicate` if the (student, course) pair already has a record.
    async fn insert_progress(&self, progress: &Progress) -> StoreResult<()>;

    async fn progress(&self, student_id: &str, course_id: Uuid) -> StoreResult<Option<Progress>>;

    /// Compare-and-swap on `progress.version`. Returns the stored record with
    /// the bumped version, or `Conflict` if someone else saved first.
    async fn save_progress(&self, progress: &Progress) -> StoreResult<Progress>;

    // === Exam attempts ===

    /// Inserts a new open attempt and saves `progress` (version CAS) as one
    /// unit. `Duplicate` if the student already holds an open attempt for the
    /// exam, `Conflict` if the progress moved.
    async fn begin_attempt(&self, attempt: &ExamAttempt, progress: &Progress) -> StoreResult<Progress>;

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<ExamAttempt>>;

    async fn open_attempt(&self, student_id: &str, exam_id: Uuid) -> StoreResult<Option<ExamAttempt>>;

    /// Persists recorded answers. `false` if the attempt is no longer open.
    async fn save_answers(&self, attempt: &ExamAttempt) -> StoreResult<bool>;

    /// Open -> terminal, together with the progress save (version CAS) and
    /// the certificate insert. `None` if the stored attempt was already
    /// terminal, `Conflict` if the progress moved. The certificate follows
    /// the `insert_certificate` rules.
    async fn finalize_attempt(
        &self,
        attempt: &ExamAttempt,
        progress: &Progress,
        certificate: &Certificate,
    ) -> StoreResult<Option<Finalized>>;

    /// Open attempts whose deadline is before `now`.
    async fn expired_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    // === Certificates (append-only) ===

    /// Inserts unless the attempt already has a certificate, or the record is
    /// passing and the student already holds a passing one for the course.
    /// In both cases the existing record is returned instead.
    async fn insert_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate>;

    async fn certificate_for_attempt(&self, attempt_id: Uuid) -> StoreResult<Option<Certificate>>;

    async fn latest_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StoreResult<Option<Certificate>>;

    /// Oldest first.
    async fn certificates(&self, student_id: &str) -> StoreResult<Vec<Certificate>>;

    async fn health_check(&self) -> bool;
}
