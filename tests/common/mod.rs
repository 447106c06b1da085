#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use course_progress_engine::clock::ManualClock;
use course_progress_engine::error::{StoreError, StoreResult};
use course_progress_engine::models::*;
use course_progress_engine::store::{Finalized, MemoryStore, Store};
use course_progress_engine::Engine;

/// A course with `lessons` lessons and the two-question final exam:
/// Q1 single choice worth 6 (A correct), Q2 multiple choice worth 4
/// (B and C correct). Pass policy 8 out of 10.
pub struct Fixture {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub course: Course,
    pub exam: Exam,
}

impl Fixture {
    pub fn lesson(&self, position: usize) -> Uuid {
        self.course.lessons[position - 1].id
    }

    pub fn q1(&self) -> &Question {
        &self.exam.questions[0]
    }

    pub fn q2(&self) -> &Question {
        &self.exam.questions[1]
    }

    /// Answer id on `question` by its text label.
    pub fn answer(&self, question: &Question, label: &str) -> Uuid {
        question
            .answers
            .iter()
            .find(|a| a.text == label)
            .map(|a| a.id)
            .unwrap()
    }

    pub async fn complete_all_lessons(&self, student: &str) {
        for l in &self.course.lessons {
            self.engine.complete_lesson(student, l.id, None).await.unwrap();
        }
    }

    pub async fn answer_q1(&self, student: &str, attempt_id: Uuid, labels: &[&str]) {
        let q = self.q1().clone();
        self.answer_question(student, attempt_id, &q, labels).await;
    }

    pub async fn answer_q2(&self, student: &str, attempt_id: Uuid, labels: &[&str]) {
        let q = self.q2().clone();
        self.answer_question(student, attempt_id, &q, labels).await;
    }

    async fn answer_question(&self, student: &str, attempt_id: Uuid, q: &Question, labels: &[&str]) {
        let req = AnswerReq {
            question_id: q.id,
            selected_answer_ids: labels.iter().map(|l| self.answer(q, l)).collect(),
        };
        self.engine.record_answer(student, attempt_id, &req).await.unwrap();
    }
}

fn answers(correct: &[&str]) -> Vec<Answer> {
    ["A", "B", "C", "D"]
        .iter()
        .map(|label| Answer {
            id: Uuid::new_v4(),
            text: label.to_string(),
            is_correct: correct.contains(label),
        })
        .collect()
}

pub fn course_with_exam(lessons: u32) -> (Course, Exam) {
    let course_id = Uuid::new_v4();
    let course = Course {
        id: course_id,
        title: "Practical Rust".into(),
        lessons: (1..=lessons)
            .map(|position| Lesson {
                id: Uuid::new_v4(),
                course_id,
                position,
                title: format!("Lesson {position}"),
                content_ref: format!("media/{course_id}/{position}.mp4"),
            })
            .collect(),
        pass_policy: PassPolicy::Scaled { min: 8, out_of: 10 },
    };
    let exam = Exam {
        id: Uuid::new_v4(),
        course_id,
        title: "Final exam".into(),
        duration_minutes: 30,
        questions: vec![
            Question {
                id: Uuid::new_v4(),
                text: "Which trait marks types safe to send across threads?".into(),
                marks: 6,
                question_type: QuestionType::SingleChoice,
                answers: answers(&["A"]),
            },
            Question {
                id: Uuid::new_v4(),
                text: "Which of these are smart pointers?".into(),
                marks: 4,
                question_type: QuestionType::MultipleChoice,
                answers: answers(&["B", "C"]),
            },
        ],
    };
    (course, exam)
}

pub async fn fixture(lessons: u32) -> Fixture {
    let (course, exam) = course_with_exam(lessons);
    let store = Arc::new(MemoryStore::new());
    store.put_course(course.clone()).await;
    store.put_exam(exam.clone()).await;

    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()));
    let engine = Engine::with_clock(store.clone(), clock.clone());
    Fixture {
        engine,
        store,
        clock,
        course,
        exam,
    }
}

/// Delegates to a `MemoryStore`; while `down` is set every write fails
/// before touching it, like a database connection that dropped.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Other("db down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>> {
        self.inner.course(course_id).await
    }

    async fn lesson(&self, lesson_id: Uuid) -> StoreResult<Option<Lesson>> {
        self.inner.lesson(lesson_id).await
    }

    async fn exam(&self, exam_id: Uuid) -> StoreResult<Option<Exam>> {
        self.inner.exam(exam_id).await
    }

    async fn exam_for_course(&self, course_id: Uuid) -> StoreResult<Option<Exam>> {
        self.inner.exam_for_course(course_id).await
    }

    async fn insert_progress(&self, progress: &Progress) -> StoreResult<()> {
        self.check()?;
        self.inner.insert_progress(progress).await
    }

    async fn progress(&self, student_id: &str, course_id: Uuid) -> StoreResult<Option<Progress>> {
        self.inner.progress(student_id, course_id).await
    }

    async fn save_progress(&self, progress: &Progress) -> StoreResult<Progress> {
        self.check()?;
        self.inner.save_progress(progress).await
    }

    async fn begin_attempt(&self, attempt: &ExamAttempt, progress: &Progress) -> StoreResult<Progress> {
        self.check()?;
        self.inner.begin_attempt(attempt, progress).await
    }

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        self.inner.attempt(attempt_id).await
    }

    async fn open_attempt(&self, student_id: &str, exam_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        self.inner.open_attempt(student_id, exam_id).await
    }

    async fn save_answers(&self, attempt: &ExamAttempt) -> StoreResult<bool> {
        self.check()?;
        self.inner.save_answers(attempt).await
    }

    async fn finalize_attempt(
        &self,
        attempt: &ExamAttempt,
        progress: &Progress,
        certificate: &Certificate,
    ) -> StoreResult<Option<Finalized>> {
        self.check()?;
        self.inner.finalize_attempt(attempt, progress, certificate).await
    }

    async fn expired_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        self.inner.expired_attempts(now).await
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> StoreResult<Certificate> {
        self.check()?;
        self.inner.insert_certificate(certificate).await
    }

    async fn certificate_for_attempt(&self, attempt_id: Uuid) -> StoreResult<Option<Certificate>> {
        self.inner.certificate_for_attempt(attempt_id).await
    }

    async fn latest_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StoreResult<Option<Certificate>> {
        self.inner.latest_certificate(student_id, course_id).await
    }

    async fn certificates(&self, student_id: &str) -> StoreResult<Vec<Certificate>> {
        self.inner.certificates(student_id).await
    }

    async fn health_check(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

impl Fixture {
    /// A second engine over the same store, with its own lock table, the way
    /// a second server process would see it.
    pub fn other_process(&self) -> Engine {
        Engine::with_clock(self.store.clone(), self.clock.clone())
    }

    /// An engine whose store writes can be switched off.
    pub fn flaky(&self) -> (Engine, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::new(self.store.clone()));
        (Engine::with_clock(store.clone(), self.clock.clone()), store)
    }
}
