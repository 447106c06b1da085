use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::models::{Exam, Question, QuestionType};

/// Marks awarded for one question. All-or-nothing: the selection has to
/// equal the correct set exactly, for both question types.
pub fn award(question: &Question, selected: &BTreeSet<Uuid>) -> u32 {
    let correct = question.correct_answers();
    let exact = match question.question_type {
        QuestionType::SingleChoice => correct.len() == 1 && *selected == correct,
        QuestionType::MultipleChoice => !correct.is_empty() && *selected == correct,
    };
    if exact {
        question.marks
    } else {
        0
    }
}

/// Sum of awarded marks. Unanswered questions award 0; answers keyed by a
/// question that is not on the exam are ignored.
pub fn score(exam: &Exam, answers: &BTreeMap<Uuid, BTreeSet<Uuid>>) -> u32 {
    exam.questions
        .iter()
        .map(|q| answers.get(&q.id).map(|sel| award(q, sel)).unwrap_or(0))
        .sum()
}
