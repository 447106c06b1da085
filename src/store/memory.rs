//! In-process store. Same conditional-write semantics as Postgres.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Finalized, Store};
use crate::error::{StoreError, StoreResult};
use crate::models::{Certificate, Course, Exam, ExamAttempt, Lesson, Progress};

/// Course content fed to the memory backend.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Catalog {
    #[serde(default)]
    pub courses: Vec<Course>,
    #[serde(default)]
    pub exams: Vec<Exam>,
}

impl Catalog {
    /// Parses and checks exam marks before anything is served.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let catalog: Catalog = serde_json::from_str(raw)?;
        for exam in &catalog.exams {
            exam.validate().map_err(StoreError::Other)?;
        }
        Ok(catalog)
    }
}

#[derive(Default)]
struct Inner {
    courses: HashMap<Uuid, Course>,
    exams: HashMap<Uuid, Exam>,
    progress: HashMap<(String, Uuid), Progress>,
    attempts: HashMap<Uuid, ExamAttempt>,
    certificates: Vec<Certificate>,
}

impl Inner {
    fn check_version(&self, progress: &Progress) -> StoreResult<()> {
        let key = (progress.student_id.clone(), progress.course_id);
        match self.progress.get(&key) {
            Some(stored) if stored.version == progress.version => Ok(()),
            _ => Err(StoreError::Conflict),
        }
    }

    /// Callers run `check_version` first.
    fn put_progress(&mut self, progress: &Progress) -> Progress {
        let mut saved = progress.clone();
        saved.version += 1;
        self.progress
            .insert((saved.student_id.clone(), saved.course_id), saved.clone());
        saved
    }

    fn attempt_clash(&self, attempt: &ExamAttempt) -> bool {
        self.attempts.contains_key(&attempt.id)
            || self.attempts.values().any(|a| {
                !a.status.is_terminal()
                    && a.student_id == attempt.student_id
                    && a.exam_id == attempt.exam_id
            })
    }

    fn is_open(&self, attempt_id: Uuid) -> bool {
        self.attempts
            .get(&attempt_id)
            .is_some_and(|a| !a.status.is_terminal())
    }

    fn existing_certificate(&self, certificate: &Certificate) -> Option<&Certificate> {
        self.certificates.iter().find(|c| {
            c.exam_attempt_id == certificate.exam_attempt_id
                || (certificate.is_passed
                    && c.is_passed
                    && c.student_id == certificate.student_id
                    && c.course_id == certificate.course_id)
        })
    }

    fn record_certificate(&mut self, certificate: &Certificate) -> Certificate {
        if let Some(existing) = self.existing_certificate(certificate) {
            return existing.clone();
        }
        self.certificates.push(certificate.clone());
        certificate.clone()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        let mut inner = Inner::default();
        for mut course in catalog.courses {
            course.sort_lessons();
            inner.courses.insert(course.id, course);
        }
        for exam in catalog.exams {
            inner.exams.insert(exam.id, exam);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn load_catalog(path: impl AsRef<Path>) -> StoreResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| StoreError::Other(format!("reading {}: {e}", path.as_ref().display())))?;
        let catalog = Catalog::parse(&raw)?;
        tracing::info!(
            courses = catalog.courses.len(),
            exams = catalog.exams.len(),
            "catalog loaded"
        );
        Ok(Self::from_catalog(catalog))
    }

    pub async fn put_course(&self, mut course: Course) {
        course.sort_lessons();
        self.inner.write().await.courses.insert(course.id, course);
    }

    pub async fn put_exam(&self, exam: Exam) {
        self.inner.write().await.exams.insert(exam.id, exam);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>> {
        Ok(self.inner.read().await.courses.get(&course_id).cloned())
    }

    async fn lesson(&self, lesson_id: Uuid) -> StoreResult<Option<Lesson>> {
        let inner = self.inner.read().await;
        Ok(inner
            .courses
            .values()
            .flat_map(|c| c.lessons.iter())
            .find(|l| l.id == lesson_id)
            .cloned())
    }

    async fn exam(&self, exam_id: Uuid) -> StoreResult<Option<Exam>> {
        Ok(self.inner.read().await.exams.get(&exam_id).cloned())
    }

    async fn exam_for_course(&self, course_id: Uuid) -> StoreResult<Option<Exam>> {
        let inner = self.inner.read().await;
        Ok(inner
            .exams
            .values()
            .find(|e| e.course_id == course_id)
            .cloned())
    }

    async fn insert_progress(&self, progress: &Progress) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = (progress.student_id.clone(), progress.course_id);
        if inner.progress.contains_key(&key) {
            return Err(StoreError::Duplicate);
        }
        inner.progress.insert(key, progress.clone());
        Ok(())
    }

    async fn progress(&self, student_id: &str, course_id: Uuid) -> StoreResult<Option<Progress>> {
        let inner = self.inner.read().await;
        Ok(inner
            .progress
            .get(&(student_id.to_string(), course_id))
            .cloned())
    }

    async fn save_progress(&self, progress: &Progress) -> StoreResult<Progress> {
        let mut inner = self.inner.write().await;
        inner.check_version(progress)?;
        Ok(inner.put_progress(progress))
    }

    async fn begin_attempt(&self, attempt: &ExamAttempt, progress: &Progress) -> StoreResult<Progress> {
        let mut inner = self.inner.write().await;
        if inner.attempt_clash(attempt) {
            return Err(StoreError::Duplicate);
        }
        inner.check_version(progress)?;
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(inner.put_progress(progress))
    }

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        Ok(self.inner.read().await.attempts.get(&attempt_id).cloned())
    }

    async fn open_attempt(&self, student_id: &str, exam_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .values()
            .find(|a| !a.status.is_terminal() && a.student_id == student_id && a.exam_id == exam_id)
            .cloned())
    }

    async fn save_answers(&self, attempt: &ExamAttempt) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.attempts.get_mut(&attempt.id) {
            Some(stored) if !stored.status.is_terminal() => {
                stored.answers = attempt.answers.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_attempt(
        &self,
        attempt: &ExamAttempt,
        progress: &Progress,
        certificate: &Certificate,
    ) -> StoreResult<Option<Finalized>> {
        let mut inner = self.inner.write().await;
        if !inner.is_open(attempt.id) {
            return Ok(None);
        }
        inner.check_version(progress)?;

        inner.attempts.insert(attempt.id, attempt.clone());
        let progress = inner.put_progress(progress);
        let certificate = inner.record_certificate(certificate);
        Ok(Some(Finalized { progress, certificate }))
    }

    async fn expired_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .values()
            .filter(|a| !a.status.is_terminal() && a.is_past_deadline(now))
            .map(|a| a.id)
            .collect())
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate> {
        Ok(self.inner.write().await.record_certificate(certificate))
    }

    async fn certificate_for_attempt(&self, attempt_id: Uuid) -> StoreResult<Option<Certificate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .certificates
            .iter()
            .find(|c| c.exam_attempt_id == attempt_id)
            .cloned())
    }

    async fn latest_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StoreResult<Option<Certificate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .certificates
            .iter()
            .rev()
            .find(|c| c.student_id == student_id && c.course_id == course_id)
            .cloned())
    }

    async fn certificates(&self, student_id: &str) -> StoreResult<Vec<Certificate>> {
        let inner = self.inner.read().await;
        Ok(inner
            .certificates
            .iter()
            .filter(|c| c.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
