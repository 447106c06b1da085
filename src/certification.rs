use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Certificate, ExamAttempt, ExamStatus, PassPolicy, Progress};

impl PassPolicy {
    /// Integer comparison; an exam worth nothing only passes a zero threshold.
    pub fn is_passing(&self, score: u32, total_mark: u32) -> bool {
        match *self {
            PassPolicy::Marks { min } => score >= min,
            PassPolicy::Scaled { min, out_of } => {
                if total_mark == 0 {
                    return min == 0;
                }
                u64::from(score) * u64::from(out_of) >= u64::from(min) * u64::from(total_mark)
            }
        }
    }
}

/// Builds the certificate record for a finalized attempt.
pub fn certificate_for(
    attempt: &ExamAttempt,
    policy: PassPolicy,
    total_mark: u32,
    now: DateTime<Utc>,
) -> EngineResult<Certificate> {
    let score = match (attempt.status.is_terminal(), attempt.score) {
        (true, Some(score)) => score,
        _ => {
            return Err(EngineError::InvalidRequest(format!(
                "exam attempt {} is not finalized",
                attempt.id
            )))
        }
    };

    Ok(Certificate {
        id: Uuid::new_v4(),
        student_id: attempt.student_id.clone(),
        course_id: attempt.course_id,
        exam_attempt_id: attempt.id,
        score,
        total_mark,
        is_passed: policy.is_passing(score, total_mark),
        issue_date: now,
    })
}

/// A retake needs a most recent certificate, and it must be a failing one.
/// The final exam goes back to NotStarted; earlier certificates stay.
pub fn reopen_for_retake(progress: &mut Progress, latest: Option<&Certificate>) -> EngineResult<()> {
    match latest {
        None => Err(EngineError::RetakeNotAllowed(format!(
            "no exam result recorded for course {}",
            progress.course_id
        ))),
        Some(cert) if cert.is_passed => Err(EngineError::RetakeNotAllowed(format!(
            "course {} already passed",
            progress.course_id
        ))),
        Some(_) if progress.final_exam.status != ExamStatus::Completed => {
            Err(EngineError::RetakeNotAllowed(format!(
                "final exam of course {} is not completed",
                progress.course_id
            )))
        }
        Some(_) => {
            progress.final_exam.status = ExamStatus::NotStarted;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, Course};

    fn finalized(score: Option<u32>, status: AttemptStatus) -> ExamAttempt {
        ExamAttempt {
            id: Uuid::new_v4(),
            student_id: "stu".into(),
            course_id: Uuid::new_v4(),
            exam_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_minutes: 10,
            answers: Default::default(),
            status,
            score,
            finalized_at: Some(Utc::now()),
        }
    }

    #[test]
    fn scaled_threshold() {
        let policy = PassPolicy::Scaled { min: 8, out_of: 10 };
        assert!(!policy.is_passing(6, 10));
        assert!(policy.is_passing(8, 10));
        assert!(policy.is_passing(9, 10));
        // 16/20 normalises to 8/10
        assert!(policy.is_passing(16, 20));
        assert!(!policy.is_passing(15, 20));
        assert!(!policy.is_passing(0, 0));
        assert!(PassPolicy::Scaled { min: 0, out_of: 10 }.is_passing(0, 0));
    }

    #[test]
    fn absolute_threshold() {
        let policy = PassPolicy::Marks { min: 12 };
        assert!(policy.is_passing(12, 40));
        assert!(!policy.is_passing(11, 12));
    }

    #[test]
    fn certificate_needs_finalized_attempt() {
        let open = finalized(None, AttemptStatus::Open);
        assert!(certificate_for(&open, PassPolicy::default(), 10, Utc::now()).is_err());

        let expired = finalized(Some(9), AttemptStatus::Expired);
        let cert = certificate_for(&expired, PassPolicy::default(), 10, Utc::now()).unwrap();
        assert!(cert.is_passed);
        assert_eq!(cert.exam_attempt_id, expired.id);
        assert_eq!(cert.score, 9);
    }

    #[test]
    fn retake_rules() {
        let course = Course {
            id: Uuid::new_v4(),
            title: "C".into(),
            lessons: vec![],
            pass_policy: PassPolicy::default(),
        };
        let mut progress = Progress::new("stu", &course, Utc::now());

        let err = reopen_for_retake(&mut progress, None).unwrap_err();
        assert!(matches!(err, EngineError::RetakeNotAllowed(_)));

        let attempt = finalized(Some(6), AttemptStatus::Submitted);
        let failing = certificate_for(&attempt, PassPolicy::default(), 10, Utc::now()).unwrap();
        progress.final_exam.status = ExamStatus::Completed;
        reopen_for_retake(&mut progress, Some(&failing)).unwrap();
        assert_eq!(progress.final_exam.status, ExamStatus::NotStarted);

        let attempt = finalized(Some(10), AttemptStatus::Submitted);
        let passing = certificate_for(&attempt, PassPolicy::default(), 10, Utc::now()).unwrap();
        progress.final_exam.status = ExamStatus::Completed;
        let err = reopen_for_retake(&mut progress, Some(&passing)).unwrap_err();
        assert!(matches!(err, EngineError::RetakeNotAllowed(_)));
        assert_eq!(progress.final_exam.status, ExamStatus::Completed);
    }
}
