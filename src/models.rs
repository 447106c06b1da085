use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- course content (read-only here, owned by the authoring side) ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Lesson {
    pub id: Uuid,
    pub course_id: Uuid,
    /// 1-based; defines the sequence.
    pub position: u32,
    pub title: String,
    pub content_ref: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PassPolicy {
    /// Score normalised to `out_of` must reach `min`.
    Scaled { min: u32, out_of: u32 },
    /// Absolute marks.
    Marks { min: u32 },
}

impl Default for PassPolicy {
    fn default() -> Self {
        PassPolicy::Scaled { min: 8, out_of: 10 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    /// Kept sorted by `position`.
    pub lessons: Vec<Lesson>,
    #[serde(default)]
    pub pass_policy: PassPolicy,
}

impl Course {
    pub fn lesson(&self, lesson_id: Uuid) -> Option<&Lesson> {
        self.lessons.iter().find(|l| l.id == lesson_id)
    }

    pub fn sort_lessons(&mut self) {
        self.lessons.sort_by_key(|l| l.position);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultipleChoice => "multiple_choice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single_choice" => Some(QuestionType::SingleChoice),
            "multiple_choice" => Some(QuestionType::MultipleChoice),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub id: Uuid,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    pub marks: u32,
    pub question_type: QuestionType,
    pub answers: Vec<Answer>,
}

impl Question {
    pub fn correct_answers(&self) -> BTreeSet<Uuid> {
        self.answers
            .iter()
            .filter(|a| a.is_correct)
            .map(|a| a.id)
            .collect()
    }

    pub fn has_answer(&self, answer_id: Uuid) -> bool {
        self.answers.iter().any(|a| a.id == answer_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Exam {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub duration_minutes: u32,
    pub questions: Vec<Question>,
}

impl Exam {
    /// Derived, never stored. Saturates; loaded catalogs pass `validate`.
    pub fn total_mark(&self) -> u32 {
        self.questions
            .iter()
            .fold(0u32, |total, q| total.saturating_add(q.marks))
    }

    /// Marks must be positive and their sum must fit the certificate columns.
    pub fn validate(&self) -> Result<(), String> {
        if self.duration_minutes == 0 {
            return Err(format!("exam {} has no duration", self.id));
        }
        let mut total: u32 = 0;
        for q in &self.questions {
            if q.marks == 0 {
                return Err(format!("question {} is worth no marks", q.id));
            }
            total = total
                .checked_add(q.marks)
                .filter(|t| i32::try_from(*t).is_ok())
                .ok_or_else(|| format!("marks of exam {} exceed {}", self.id, i32::MAX))?;
        }
        Ok(())
    }

    pub fn question(&self, question_id: Uuid) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }

    /// Client payload: correctness flags are stripped.
    pub fn public_view(&self) -> PublicExam {
        PublicExam {
            id: self.id,
            title: self.title.clone(),
            duration_minutes: self.duration_minutes,
            total_mark: self.total_mark(),
            questions: self
                .questions
                .iter()
                .map(|q| PublicQuestion {
                    id: q.id,
                    text: q.text.clone(),
                    marks: q.marks,
                    question_type: q.question_type,
                    answers: q
                        .answers
                        .iter()
                        .map(|a| PublicAnswer {
                            id: a.id,
                            text: a.text.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicExam {
    pub id: Uuid,
    pub title: String,
    pub duration_minutes: u32,
    pub total_mark: u32,
    pub questions: Vec<PublicQuestion>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicQuestion {
    pub id: Uuid,
    pub text: String,
    pub marks: u32,
    pub question_type: QuestionType,
    pub answers: Vec<PublicAnswer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicAnswer {
    pub id: Uuid,
    pub text: String,
}

// --- progress ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LessonState {
    pub status: LessonStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::NotStarted => "not_started",
            ExamStatus::InProgress => "in_progress",
            ExamStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(ExamStatus::NotStarted),
            "in_progress" => Some(ExamStatus::InProgress),
            "completed" => Some(ExamStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FinalExamState {
    pub status: ExamStatus,
    pub attempt_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub student_id: String,
    pub course_id: Uuid,
    pub lesson_states: BTreeMap<Uuid, LessonState>,
    pub final_exam: FinalExamState,
    /// Optimistic concurrency token, bumped by every successful save.
    pub version: i64,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn new(student_id: &str, course: &Course, now: DateTime<Utc>) -> Self {
        Self {
            student_id: student_id.to_string(),
            course_id: course.id,
            lesson_states: course
                .lessons
                .iter()
                .map(|l| (l.id, LessonState::default()))
                .collect(),
            final_exam: FinalExamState::default(),
            version: 0,
            enrolled_at: now,
            updated_at: now,
        }
    }

    /// Lessons added to the course after enrollment read as NotStarted.
    pub fn lesson_status(&self, lesson_id: Uuid) -> LessonStatus {
        self.lesson_states
            .get(&lesson_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn lesson_state_mut(&mut self, lesson_id: Uuid) -> &mut LessonState {
        self.lesson_states.entry(lesson_id).or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LessonAccess {
    pub lesson_id: Uuid,
    pub position: u32,
    pub title: String,
    pub status: LessonStatus,
    pub note: Option<String>,
    pub unlocked: bool,
}

/// Progress plus what the gate currently allows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressView {
    #[serde(flatten)]
    pub progress: Progress,
    pub lessons: Vec<LessonAccess>,
    pub final_exam_unlocked: bool,
}

// --- exam attempts ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Open,
    Submitted,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Open => "open",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AttemptStatus::Open),
            "submitted" => Some(AttemptStatus::Submitted),
            "expired" => Some(AttemptStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Open)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExamAttempt {
    pub id: Uuid,
    pub student_id: String,
    pub course_id: Uuid,
    pub exam_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Copied from the exam at start; never changes for the attempt.
    pub duration_minutes: u32,
    pub answers: BTreeMap<Uuid, BTreeSet<Uuid>>,
    pub status: AttemptStatus,
    pub score: Option<u32>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl ExamAttempt {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// The deadline instant itself is still inside the window.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline()
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline() - now).num_seconds().max(0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptView {
    pub attempt: ExamAttempt,
    pub deadline: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub exam: PublicExam,
}

// --- certificates ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: String,
    pub course_id: Uuid,
    pub exam_attempt_id: Uuid,
    pub score: u32,
    pub total_mark: u32,
    #[serde(rename = "isPassed")]
    pub is_passed: bool,
    pub issue_date: DateTime<Utc>,
}

// --- requests / responses ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LessonUpdateReq {
    pub status: LessonStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnswerReq {
    pub question_id: Uuid,
    pub selected_answer_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExamOutcome {
    pub attempt_id: Uuid,
    pub status: AttemptStatus,
    pub score: u32,
    pub total_mark: u32,
    #[serde(rename = "isPassed")]
    pub is_passed: bool,
    pub certificate: Certificate,
}
