use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgConnection};
use uuid::Uuid;

use super::{Finalized, Store};
use crate::db::Db;
use crate::error::{StoreError, StoreResult};
use crate::models::*;

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn unsigned(v: i32, column: &str) -> StoreResult<u32> {
    u32::try_from(v).map_err(|_| StoreError::Other(format!("negative {column}: {v}")))
}

fn signed(v: u32, column: &str) -> StoreResult<i32> {
    i32::try_from(v).map_err(|_| StoreError::Other(format!("{column} out of range: {v}")))
}

fn unique_as_duplicate(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Sqlx(e),
    }
}

// --- row types ---

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    title: String,
    pass_policy: Json<PassPolicy>,
}

#[derive(sqlx::FromRow)]
struct LessonRow {
    id: Uuid,
    course_id: Uuid,
    position: i32,
    title: String,
    content_ref: String,
}

impl TryFrom<LessonRow> for Lesson {
    type Error = StoreError;

    fn try_from(r: LessonRow) -> StoreResult<Self> {
        Ok(Lesson {
            id: r.id,
            course_id: r.course_id,
            position: unsigned(r.position, "lessons.position")?,
            title: r.title,
            content_ref: r.content_ref,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExamRow {
    id: Uuid,
    course_id: Uuid,
    title: String,
    duration_minutes: i32,
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: Uuid,
    text: String,
    marks: i32,
    question_type: String,
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: Uuid,
    question_id: Uuid,
    text: String,
    is_correct: bool,
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    student_id: String,
    course_id: Uuid,
    lesson_states: Json<BTreeMap<Uuid, LessonState>>,
    final_exam_status: String,
    final_exam_attempt_id: Option<Uuid>,
    version: i64,
    enrolled_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProgressRow> for Progress {
    type Error = StoreError;

    fn try_from(r: ProgressRow) -> StoreResult<Self> {
        let status = ExamStatus::parse(&r.final_exam_status)
            .ok_or_else(|| StoreError::Other(format!("bad final_exam_status {}", r.final_exam_status)))?;
        Ok(Progress {
            student_id: r.student_id,
            course_id: r.course_id,
            lesson_states: r.lesson_states.0,
            final_exam: FinalExamState {
                status,
                attempt_id: r.final_exam_attempt_id,
            },
            version: r.version,
            enrolled_at: r.enrolled_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    student_id: String,
    course_id: Uuid,
    exam_id: Uuid,
    started_at: DateTime<Utc>,
    duration_minutes: i32,
    answers: Json<BTreeMap<Uuid, BTreeSet<Uuid>>>,
    status: String,
    score: Option<i32>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for ExamAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> StoreResult<Self> {
        let status = AttemptStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Other(format!("bad attempt status {}", r.status)))?;
        Ok(ExamAttempt {
            id: r.id,
            student_id: r.student_id,
            course_id: r.course_id,
            exam_id: r.exam_id,
            started_at: r.started_at,
            duration_minutes: unsigned(r.duration_minutes, "exam_attempts.duration_minutes")?,
            answers: r.answers.0,
            status,
            score: r.score.map(|s| unsigned(s, "exam_attempts.score")).transpose()?,
            finalized_at: r.finalized_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    student_id: String,
    course_id: Uuid,
    exam_attempt_id: Uuid,
    score: i32,
    total_mark: i32,
    is_passed: bool,
    issue_date: DateTime<Utc>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = StoreError;

    fn try_from(r: CertificateRow) -> StoreResult<Self> {
        Ok(Certificate {
            id: r.id,
            student_id: r.student_id,
            course_id: r.course_id,
            exam_attempt_id: r.exam_attempt_id,
            score: unsigned(r.score, "certificates.score")?,
            total_mark: unsigned(r.total_mark, "certificates.total_mark")?,
            is_passed: r.is_passed,
            issue_date: r.issue_date,
        })
    }
}

const PROGRESS_COLS: &str = "student_id, course_id, lesson_states, final_exam_status, \
     final_exam_attempt_id, version, enrolled_at, updated_at";
const ATTEMPT_COLS: &str = "id, student_id, course_id, exam_id, started_at, duration_minutes, \
     answers, status, score, finalized_at";
const CERT_COLS: &str = "id, student_id, course_id, exam_attempt_id, score, total_mark, is_passed, issue_date";

impl PgStore {
    async fn load_exam(&self, row: ExamRow) -> StoreResult<Exam> {
        let questions: Vec<QuestionRow> = sqlx::query_as(
            "SELECT id, text, marks, question_type FROM questions WHERE exam_id = $1 ORDER BY position",
        )
        .bind(row.id)
        .fetch_all(&self.db)
        .await?;

        let ids: Vec<Uuid> = questions.iter().map(|q| q.id).collect();
        let answers: Vec<AnswerRow> = sqlx::query_as(
            "SELECT id, question_id, text, is_correct FROM answers \
             WHERE question_id = ANY($1) ORDER BY question_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.db)
        .await?;

        let mut by_question: BTreeMap<Uuid, Vec<Answer>> = BTreeMap::new();
        for a in answers {
            by_question.entry(a.question_id).or_default().push(Answer {
                id: a.id,
                text: a.text,
                is_correct: a.is_correct,
            });
        }

        let questions = questions
            .into_iter()
            .map(|q| {
                let question_type = QuestionType::parse(&q.question_type)
                    .ok_or_else(|| StoreError::Other(format!("bad question_type {}", q.question_type)))?;
                Ok(Question {
                    id: q.id,
                    text: q.text,
                    marks: unsigned(q.marks, "questions.marks")?,
                    question_type,
                    answers: by_question.remove(&q.id).unwrap_or_default(),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Exam {
            id: row.id,
            course_id: row.course_id,
            title: row.title,
            duration_minutes: unsigned(row.duration_minutes, "exams.duration_minutes")?,
            questions,
        })
    }
}

// --- conditional writes, shared by the single-statement and the
// transactional paths ---

async fn update_progress(conn: &mut PgConnection, p: &Progress) -> StoreResult<Progress> {
    let row: Option<ProgressRow> = sqlx::query_as(&format!(
        "UPDATE progress SET lesson_states = $3, final_exam_status = $4, \
         final_exam_attempt_id = $5, updated_at = $6, version = version + 1 \
         WHERE student_id = $1 AND course_id = $2 AND version = $7 \
         RETURNING {PROGRESS_COLS}"
    ))
    .bind(&p.student_id)
    .bind(p.course_id)
    .bind(Json(&p.lesson_states))
    .bind(p.final_exam.status.as_str())
    .bind(p.final_exam.attempt_id)
    .bind(p.updated_at)
    .bind(p.version)
    .fetch_optional(&mut *conn)
    .await?;
    row.ok_or(StoreError::Conflict)?.try_into()
}

async fn insert_attempt_row(conn: &mut PgConnection, a: &ExamAttempt) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO exam_attempts ({ATTEMPT_COLS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
    ))
    .bind(a.id)
    .bind(&a.student_id)
    .bind(a.course_id)
    .bind(a.exam_id)
    .bind(a.started_at)
    .bind(signed(a.duration_minutes, "duration_minutes")?)
    .bind(Json(&a.answers))
    .bind(a.status.as_str())
    .bind(a.score.map(|s| signed(s, "score")).transpose()?)
    .bind(a.finalized_at)
    .execute(&mut *conn)
    .await
    .map_err(unique_as_duplicate)?;
    Ok(())
}

/// `false` if the attempt was no longer open.
async fn close_attempt_row(conn: &mut PgConnection, a: &ExamAttempt) -> StoreResult<bool> {
    let res = sqlx::query(
        "UPDATE exam_attempts SET status = $2, score = $3, finalized_at = $4, answers = $5 \
         WHERE id = $1 AND status = 'open'",
    )
    .bind(a.id)
    .bind(a.status.as_str())
    .bind(a.score.map(|s| signed(s, "score")).transpose()?)
    .bind(a.finalized_at)
    .bind(Json(&a.answers))
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

async fn certificate_by_attempt(conn: &mut PgConnection, attempt_id: Uuid) -> StoreResult<Option<Certificate>> {
    let row: Option<CertificateRow> = sqlx::query_as(&format!(
        "SELECT {CERT_COLS} FROM certificates WHERE exam_attempt_id = $1"
    ))
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Certificate::try_from).transpose()
}

async fn passing_certificate(
    conn: &mut PgConnection,
    student_id: &str,
    course_id: Uuid,
) -> StoreResult<Option<Certificate>> {
    let row: Option<CertificateRow> = sqlx::query_as(&format!(
        "SELECT {CERT_COLS} FROM certificates WHERE student_id = $1 AND course_id = $2 AND is_passed"
    ))
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Certificate::try_from).transpose()
}

/// `ON CONFLICT DO NOTHING` covers both the per-attempt unique key and the
/// one-passing-certificate index; the row that won is returned instead.
async fn insert_certificate_row(conn: &mut PgConnection, c: &Certificate) -> StoreResult<Certificate> {
    let row: Option<CertificateRow> = sqlx::query_as(&format!(
        "INSERT INTO certificates ({CERT_COLS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT DO NOTHING RETURNING {CERT_COLS}"
    ))
    .bind(c.id)
    .bind(&c.student_id)
    .bind(c.course_id)
    .bind(c.exam_attempt_id)
    .bind(signed(c.score, "score")?)
    .bind(signed(c.total_mark, "total_mark")?)
    .bind(c.is_passed)
    .bind(c.issue_date)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = row {
        return row.try_into();
    }
    if let Some(existing) = certificate_by_attempt(conn, c.exam_attempt_id).await? {
        return Ok(existing);
    }
    passing_certificate(conn, &c.student_id, c.course_id)
        .await?
        .ok_or_else(|| StoreError::Other(format!("certificate {} conflicted with no visible row", c.id)))
}

#[async_trait]
impl Store for PgStore {
    async fn course(&self, course_id: Uuid) -> StoreResult<Option<Course>> {
        let row: Option<CourseRow> =
            sqlx::query_as("SELECT id, title, pass_policy FROM courses WHERE id = $1")
                .bind(course_id)
                .fetch_optional(&self.db)
                .await?;
        let Some(row) = row else { return Ok(None) };

        let lessons: Vec<LessonRow> = sqlx::query_as(
            "SELECT id, course_id, position, title, content_ref FROM lessons \
             WHERE course_id = $1 ORDER BY position",
        )
        .bind(course_id)
        .fetch_all(&self.db)
        .await?;

        Ok(Some(Course {
            id: row.id,
            title: row.title,
            lessons: lessons
                .into_iter()
                .map(Lesson::try_from)
                .collect::<StoreResult<Vec<_>>>()?,
            pass_policy: row.pass_policy.0,
        }))
    }

    async fn lesson(&self, lesson_id: Uuid) -> StoreResult<Option<Lesson>> {
        let row: Option<LessonRow> = sqlx::query_as(
            "SELECT id, course_id, position, title, content_ref FROM lessons WHERE id = $1",
        )
        .bind(lesson_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Lesson::try_from).transpose()
    }

    async fn exam(&self, exam_id: Uuid) -> StoreResult<Option<Exam>> {
        let row: Option<ExamRow> =
            sqlx::query_as("SELECT id, course_id, title, duration_minutes FROM exams WHERE id = $1")
                .bind(exam_id)
                .fetch_optional(&self.db)
                .await?;
        match row {
            Some(row) => Ok(Some(self.load_exam(row).await?)),
            None => Ok(None),
        }
    }

    async fn exam_for_course(&self, course_id: Uuid) -> StoreResult<Option<Exam>> {
        let row: Option<ExamRow> = sqlx::query_as(
            "SELECT id, course_id, title, duration_minutes FROM exams \
             WHERE course_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => Ok(Some(self.load_exam(row).await?)),
            None => Ok(None),
        }
    }

    async fn insert_progress(&self, p: &Progress) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO progress (student_id, course_id, lesson_states, final_exam_status, \
             final_exam_attempt_id, version, enrolled_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&p.student_id)
        .bind(p.course_id)
        .bind(Json(&p.lesson_states))
        .bind(p.final_exam.status.as_str())
        .bind(p.final_exam.attempt_id)
        .bind(p.version)
        .bind(p.enrolled_at)
        .bind(p.updated_at)
        .execute(&self.db)
        .await
        .map_err(unique_as_duplicate)?;
        Ok(())
    }

    async fn progress(&self, student_id: &str, course_id: Uuid) -> StoreResult<Option<Progress>> {
        let row: Option<ProgressRow> = sqlx::query_as(&format!(
            "SELECT {PROGRESS_COLS} FROM progress WHERE student_id = $1 AND course_id = $2"
        ))
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Progress::try_from).transpose()
    }

    async fn save_progress(&self, p: &Progress) -> StoreResult<Progress> {
        let mut conn = self.db.acquire().await?;
        update_progress(&mut conn, p).await
    }

    async fn begin_attempt(&self, a: &ExamAttempt, p: &Progress) -> StoreResult<Progress> {
        let mut tx = self.db.begin().await?;
        insert_attempt_row(&mut tx, a).await?;
        let saved = update_progress(&mut tx, p).await?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn attempt(&self, attempt_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        let row: Option<AttemptRow> =
            sqlx::query_as(&format!("SELECT {ATTEMPT_COLS} FROM exam_attempts WHERE id = $1"))
                .bind(attempt_id)
                .fetch_optional(&self.db)
                .await?;
        row.map(ExamAttempt::try_from).transpose()
    }

    async fn open_attempt(&self, student_id: &str, exam_id: Uuid) -> StoreResult<Option<ExamAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLS} FROM exam_attempts \
             WHERE student_id = $1 AND exam_id = $2 AND status = 'open'"
        ))
        .bind(student_id)
        .bind(exam_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(ExamAttempt::try_from).transpose()
    }

    async fn save_answers(&self, a: &ExamAttempt) -> StoreResult<bool> {
        let res = sqlx::query("UPDATE exam_attempts SET answers = $2 WHERE id = $1 AND status = 'open'")
            .bind(a.id)
            .bind(Json(&a.answers))
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn finalize_attempt(
        &self,
        a: &ExamAttempt,
        p: &Progress,
        c: &Certificate,
    ) -> StoreResult<Option<Finalized>> {
        let mut tx = self.db.begin().await?;
        if !close_attempt_row(&mut tx, a).await? {
            tx.rollback().await?;
            return Ok(None);
        }
        let progress = update_progress(&mut tx, p).await?;
        let certificate = insert_certificate_row(&mut tx, c).await?;
        tx.commit().await?;
        Ok(Some(Finalized { progress, certificate }))
    }

    async fn expired_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM exam_attempts \
             WHERE status = 'open' AND started_at + make_interval(mins => duration_minutes) < $1",
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    async fn insert_certificate(&self, c: &Certificate) -> StoreResult<Certificate> {
        let mut conn = self.db.acquire().await?;
        insert_certificate_row(&mut conn, c).await
    }

    async fn certificate_for_attempt(&self, attempt_id: Uuid) -> StoreResult<Option<Certificate>> {
        let mut conn = self.db.acquire().await?;
        certificate_by_attempt(&mut conn, attempt_id).await
    }

    async fn latest_certificate(
        &self,
        student_id: &str,
        course_id: Uuid,
    ) -> StoreResult<Option<Certificate>> {
        let row: Option<CertificateRow> = sqlx::query_as(&format!(
            "SELECT {CERT_COLS} FROM certificates WHERE student_id = $1 AND course_id = $2 \
             ORDER BY seq DESC LIMIT 1"
        ))
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Certificate::try_from).transpose()
    }

    async fn certificates(&self, student_id: &str) -> StoreResult<Vec<Certificate>> {
        let rows: Vec<CertificateRow> = sqlx::query_as(&format!(
            "SELECT {CERT_COLS} FROM certificates WHERE student_id = $1 ORDER BY seq"
        ))
        .bind(student_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Certificate::try_from).collect()
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.db).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "database health check failed");
                false
            }
        }
    }
}
