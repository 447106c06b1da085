//! Sequential access rules for lessons and the final exam.
//!
//! Everything here is a pure function of a [`Progress`] record and the
//! course's lesson list (sorted by position). Callers check the gate before
//! serving lesson content and before opening an exam attempt.

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Lesson, LessonAccess, LessonStatus, Progress, ProgressView};

/// Index of `lesson_id` in the ordered list, or `NotFound` if the lesson does
/// not belong to this course.
fn index_of(lessons: &[Lesson], lesson_id: Uuid) -> EngineResult<usize> {
    lessons
        .iter()
        .position(|l| l.id == lesson_id)
        .ok_or_else(|| EngineError::not_found(format!("lesson {lesson_id}")))
}

fn unlocked_at(progress: &Progress, lessons: &[Lesson], idx: usize) -> bool {
    idx == 0 || progress.lesson_status(lessons[idx - 1].id) == LessonStatus::Completed
}

pub fn lesson_accessible(
    progress: &Progress,
    lessons: &[Lesson],
    lesson_id: Uuid,
) -> EngineResult<bool> {
    let idx = index_of(lessons, lesson_id)?;
    Ok(unlocked_at(progress, lessons, idx))
}

/// Like [`lesson_accessible`] but rejects with `LessonLocked`.
pub fn ensure_lesson<'a>(
    progress: &Progress,
    lessons: &'a [Lesson],
    lesson_id: Uuid,
) -> EngineResult<&'a Lesson> {
    let idx = index_of(lessons, lesson_id)?;
    if !unlocked_at(progress, lessons, idx) {
        return Err(EngineError::LessonLocked(lesson_id.to_string()));
    }
    Ok(&lessons[idx])
}

/// The final exam unit opens once every real lesson is completed.
pub fn final_exam_accessible(progress: &Progress, lessons: &[Lesson]) -> bool {
    lessons
        .iter()
        .all(|l| progress.lesson_status(l.id) == LessonStatus::Completed)
}

pub fn next_lesson<'a>(lessons: &'a [Lesson], lesson_id: Uuid) -> Option<&'a Lesson> {
    let idx = lessons.iter().position(|l| l.id == lesson_id)?;
    lessons.get(idx + 1)
}

pub fn view(progress: Progress, lessons: &[Lesson]) -> ProgressView {
    let access = lessons
        .iter()
        .enumerate()
        .map(|(idx, l)| {
            let state = progress.lesson_states.get(&l.id);
            LessonAccess {
                lesson_id: l.id,
                position: l.position,
                title: l.title.clone(),
                status: state.map(|s| s.status).unwrap_or_default(),
                note: state.and_then(|s| s.note.clone()),
                unlocked: unlocked_at(&progress, lessons, idx),
            }
        })
        .collect();
    let final_exam_unlocked = final_exam_accessible(&progress, lessons);

    ProgressView {
        progress,
        lessons: access,
        final_exam_unlocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Course, PassPolicy};
    use chrono::Utc;

    fn course(n: u32) -> Course {
        let id = Uuid::new_v4();
        Course {
            id,
            title: "Rust for the impatient".into(),
            lessons: (1..=n)
                .map(|position| Lesson {
                    id: Uuid::new_v4(),
                    course_id: id,
                    position,
                    title: format!("Lesson {position}"),
                    content_ref: format!("videos/{position}.mp4"),
                })
                .collect(),
            pass_policy: PassPolicy::default(),
        }
    }

    #[test]
    fn first_lesson_always_open() {
        let c = course(3);
        let p = Progress::new("stu", &c, Utc::now());
        assert!(lesson_accessible(&p, &c.lessons, c.lessons[0].id).unwrap());
        assert!(!lesson_accessible(&p, &c.lessons, c.lessons[1].id).unwrap());
        assert!(!final_exam_accessible(&p, &c.lessons));
    }

    #[test]
    fn lesson_k_needs_all_previous_completed() {
        let n = 6;
        let c = course(n);
        let mut p = Progress::new("stu", &c, Utc::now());

        for k in 1..n as usize {
            // only lessons[0..k] are reachable
            for (idx, l) in c.lessons.iter().enumerate() {
                let open = lesson_accessible(&p, &c.lessons, l.id).unwrap();
                assert_eq!(open, idx < k, "lesson at index {idx} with {k} reachable");
            }
            p.lesson_state_mut(c.lessons[k - 1].id).status = LessonStatus::Completed;
        }
        assert!(!final_exam_accessible(&p, &c.lessons));
        p.lesson_state_mut(c.lessons[n as usize - 1].id).status = LessonStatus::Completed;
        assert!(final_exam_accessible(&p, &c.lessons));
    }

    #[test]
    fn in_progress_predecessor_does_not_unlock() {
        let c = course(2);
        let mut p = Progress::new("stu", &c, Utc::now());
        p.lesson_state_mut(c.lessons[0].id).status = LessonStatus::InProgress;
        let err = ensure_lesson(&p, &c.lessons, c.lessons[1].id).unwrap_err();
        assert!(matches!(err, EngineError::LessonLocked(_)));
    }

    #[test]
    fn unknown_lesson_is_not_found() {
        let c = course(2);
        let p = Progress::new("stu", &c, Utc::now());
        let err = lesson_accessible(&p, &c.lessons, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn course_without_lessons_opens_exam() {
        let c = course(0);
        let p = Progress::new("stu", &c, Utc::now());
        assert!(final_exam_accessible(&p, &c.lessons));
    }

    #[test]
    fn view_reports_unlocked_flags() {
        let c = course(3);
        let mut p = Progress::new("stu", &c, Utc::now());
        p.lesson_state_mut(c.lessons[0].id).status = LessonStatus::Completed;
        let v = view(p, &c.lessons);
        let flags: Vec<bool> = v.lessons.iter().map(|l| l.unlocked).collect();
        assert_eq!(flags, vec![true, true, false]);
        assert!(!v.final_exam_unlocked);
    }
}
