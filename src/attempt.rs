//! One student's run through a quiz, from start to full grading.
//!
//! ```text
//! in_progress ──submit──▶ completed
//!      │
//!      └──sweep──▶ timed_out | abandoned
//! ```
//!
//! Terminal states never transition again. Grading works on the question
//! snapshot taken at start, so later edits to the quiz have no effect here.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::quiz::{PublicQuestion, Question, QuestionKind, QuizDefinition};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    Abandoned,
    TimedOut,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Abandoned => "abandoned",
            AttemptStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

/// A validated answer, shaped by the question it answers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    Choice(String),
    Boolean(bool),
    Text(String),
    Essay(String),
}

/// Answer exactly as the client sent it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawAnswer {
    pub question_id: Uuid,
    #[serde(default)]
    pub answer: Value,
}

impl AnswerValue {
    /// Interpret a raw JSON answer against the question type.
    pub fn ingest(question: &Question, raw: &Value) -> AppResult<Option<AnswerValue>> {
        if raw.is_null() {
            return Ok(None);
        }
        let wrong_shape = || {
            AppError::Validation(format!(
                "answer for question {} must be a {}",
                question.id,
                match question.kind {
                    QuestionKind::TrueFalse { .. } => "boolean",
                    _ => "string",
                }
            ))
        };
        let value = match &question.kind {
            QuestionKind::TrueFalse { .. } => match raw {
                Value::Bool(b) => AnswerValue::Boolean(*b),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => AnswerValue::Boolean(true),
                    "false" => AnswerValue::Boolean(false),
                    _ => return Err(wrong_shape()),
                },
                _ => return Err(wrong_shape()),
            },
            QuestionKind::MultipleChoice { .. } => AnswerValue::Choice(raw.as_str().ok_or_else(wrong_shape)?.to_string()),
            QuestionKind::ShortAnswer { .. } | QuestionKind::FillBlank { .. } => {
                AnswerValue::Text(raw.as_str().ok_or_else(wrong_shape)?.to_string())
            }
            QuestionKind::Essay => AnswerValue::Essay(raw.as_str().ok_or_else(wrong_shape)?.to_string()),
        };
        Ok(Some(value))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradedAnswer {
    pub question_id: Uuid,
    pub answer: Option<AnswerValue>,
    /// `None` for essays: they are never auto-resolved.
    pub is_correct: Option<bool>,
    pub points_awarded: f64,
    pub feedback: Option<String>,
    pub graded_at: Option<DateTime<Utc>>,
    pub graded_by: Option<Uuid>,
}

/// Outcome of auto-grading a single question.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuestionGrade {
    pub is_correct: Option<bool>,
    pub points_awarded: f64,
}

pub fn grade_question(question: &Question, answer: Option<&AnswerValue>) -> QuestionGrade {
    let verdict = |ok: bool| QuestionGrade {
        is_correct: Some(ok),
        points_awarded: if ok { question.points } else { 0.0 },
    };
    match (&question.kind, answer) {
        (QuestionKind::Essay, _) => QuestionGrade { is_correct: None, points_awarded: 0.0 },
        (_, None) => verdict(false),
        (QuestionKind::MultipleChoice { .. }, Some(AnswerValue::Choice(chosen))) => {
            verdict(question.correct_option() == Some(chosen.as_str()))
        }
        (QuestionKind::TrueFalse { correct_answer }, Some(AnswerValue::Boolean(b))) => verdict(b == correct_answer),
        (
            QuestionKind::ShortAnswer { accepted_answers, case_sensitive }
            | QuestionKind::FillBlank { accepted_answers, case_sensitive },
            Some(AnswerValue::Text(text)),
        ) => {
            let given = text.trim();
            verdict(accepted_answers.iter().any(|accepted| {
                let accepted = accepted.trim();
                if *case_sensitive {
                    accepted == given
                } else {
                    accepted.to_lowercase() == given.to_lowercase()
                }
            }))
        }
        // ingestion guarantees shapes line up; a mismatch can only score zero
        _ => verdict(false),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub course_id: Uuid,
    pub student_id: Uuid,
    pub attempt_number: u32,
    /// Authoritative snapshot, including correct answers.
    questions: Vec<Question>,
    pub total_points: f64,
    pub passing_score: f64,
    pub answers: Vec<GradedAnswer>,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub time_spent: Option<i64>,
    pub status: AttemptStatus,
    pub score: Option<f64>,
    pub percentage: Option<f64>,
    pub passed: Option<bool>,
    pub needs_manual_grading: bool,
    pub fully_graded: bool,
    pub grade_item_created: bool,
    pub grade_item_id: Option<Uuid>,
    /// Set in the same write as every score change of a fully graded
    /// attempt; cleared only once the gradebook holds that score.
    #[serde(default)]
    pub sync_pending: bool,
}

impl QuizAttempt {
    /// Start a new attempt with a frozen (and possibly shuffled) question list.
    pub fn start(quiz: &QuizDefinition, student_id: Uuid, attempt_number: u32, now: DateTime<Utc>) -> Self {
        let questions = quiz.snapshot();
        let total_points = questions.iter().map(|q| q.points).sum();
        Self {
            id: Uuid::new_v4(),
            quiz_id: quiz.id,
            course_id: quiz.course_id,
            student_id,
            attempt_number,
            questions,
            total_points,
            passing_score: quiz.passing_score,
            answers: Vec::new(),
            started_at: now,
            deadline: quiz.time_limit.map(|m| now + Duration::minutes(i64::from(m))),
            completed_at: None,
            time_spent: None,
            status: AttemptStatus::InProgress,
            score: None,
            percentage: None,
            passed: None,
            needs_manual_grading: false,
            fully_graded: false,
            grade_item_created: false,
            grade_item_id: None,
            sync_pending: false,
        }
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn question(&self, id: Uuid) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Store the answers, auto-grade and complete the attempt.
    ///
    /// The whole new state is computed before anything on `self` changes, so
    /// an invalid submission leaves the attempt exactly as it was.
    pub fn submit(&mut self, raw: &[RawAnswer], now: DateTime<Utc>) -> AppResult<()> {
        if self.status != AttemptStatus::InProgress {
            return Err(AppError::InvalidState(format!(
                "attempt is {} and can no longer be submitted",
                self.status.as_str()
            )));
        }

        let mut by_question: HashMap<Uuid, Option<AnswerValue>> = HashMap::with_capacity(raw.len());
        for r in raw {
            let question = self.question(r.question_id).ok_or_else(|| {
                AppError::InvalidQuestion(format!("question {} is not part of this attempt", r.question_id))
            })?;
            let value = AnswerValue::ingest(question, &r.answer)?;
            if by_question.insert(r.question_id, value).is_some() {
                return Err(AppError::Validation(format!(
                    "question {} was answered more than once",
                    r.question_id
                )));
            }
        }

        let answers: Vec<GradedAnswer> = self
            .questions
            .iter()
            .map(|q| {
                let answer = by_question.remove(&q.id).flatten();
                let grade = grade_question(q, answer.as_ref());
                GradedAnswer {
                    question_id: q.id,
                    answer,
                    is_correct: grade.is_correct,
                    points_awarded: grade.points_awarded,
                    feedback: None,
                    graded_at: (!q.kind.is_essay()).then_some(now),
                    graded_by: None,
                }
            })
            .collect();

        let has_essay = self.questions.iter().any(|q| q.kind.is_essay());
        self.answers = answers;
        self.status = AttemptStatus::Completed;
        self.completed_at = Some(now);
        self.time_spent = Some((now - self.started_at).num_seconds().max(0));
        self.needs_manual_grading = has_essay;
        self.fully_graded = !has_essay;
        self.rescore();
        Ok(())
    }

    /// Record a manual grade for one essay answer.
    pub fn grade_essay(
        &mut self,
        question_id: Uuid,
        points: f64,
        feedback: Option<String>,
        grader: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if self.status != AttemptStatus::Completed {
            return Err(AppError::InvalidState(format!(
                "attempt is {}; only completed attempts can be graded",
                self.status.as_str()
            )));
        }
        if !points.is_finite() {
            return Err(AppError::Validation("pointsAwarded must be a number".into()));
        }
        let question = self
            .question(question_id)
            .ok_or_else(|| AppError::InvalidQuestion(format!("question {question_id} is not part of this attempt")))?;
        if !question.kind.is_essay() {
            return Err(AppError::InvalidQuestion(format!(
                "question {question_id} is {}, only essay questions are graded manually",
                question.kind.name()
            )));
        }
        let clamped = points.clamp(0.0, question.points);

        let answer = self
            .answers
            .iter_mut()
            .find(|a| a.question_id == question_id)
            .ok_or_else(|| AppError::InvalidQuestion(format!("no answer recorded for question {question_id}")))?;
        answer.points_awarded = clamped;
        answer.feedback = feedback;
        answer.graded_at = Some(now);
        answer.graded_by = Some(grader);

        let essay_ids: HashSet<Uuid> = self
            .questions
            .iter()
            .filter(|q| q.kind.is_essay())
            .map(|q| q.id)
            .collect();
        self.fully_graded = self
            .answers
            .iter()
            .filter(|a| essay_ids.contains(&a.question_id))
            .all(|a| a.graded_at.is_some());
        self.needs_manual_grading = !self.fully_graded;
        self.rescore();
        Ok(())
    }

    fn rescore(&mut self) {
        let score: f64 = self.answers.iter().map(|a| a.points_awarded).sum();
        let percentage = if self.total_points > 0.0 {
            score / self.total_points * 100.0
        } else {
            0.0
        };
        self.score = Some(score);
        self.percentage = Some(percentage);
        self.passed = Some(percentage >= self.passing_score);
        self.sync_pending = self.fully_graded;
    }

    /// Move a live attempt into a terminal state without grading it.
    pub fn expire(&mut self, status: AttemptStatus, now: DateTime<Utc>) -> AppResult<()> {
        if self.status != AttemptStatus::InProgress || status == AttemptStatus::InProgress {
            return Err(AppError::InvalidState(format!(
                "cannot move attempt from {} to {}",
                self.status.as_str(),
                status.as_str()
            )));
        }
        self.status = status;
        self.completed_at = Some(now);
        self.time_spent = Some((now - self.started_at).num_seconds().max(0));
        Ok(())
    }

    /// A completed, fully graded attempt whose current score has not reached
    /// the gradebook yet.
    pub fn needs_gradebook_sync(&self) -> bool {
        self.status == AttemptStatus::Completed && self.fully_graded && self.sync_pending
    }

    /// Record that the gradebook row `item_id` now holds this attempt's score.
    pub fn mark_synced(&mut self, item_id: Uuid) {
        self.grade_item_created = true;
        self.grade_item_id = Some(item_id);
        self.sync_pending = false;
    }

    /// Student-facing copy. Correct answers, explanations and per-question
    /// correctness are only included when `reveal` is set.
    pub fn view(&self, reveal: bool) -> AttemptView {
        AttemptView {
            id: self.id,
            quiz_id: self.quiz_id,
            student_id: self.student_id,
            attempt_number: self.attempt_number,
            status: self.status,
            started_at: self.started_at,
            deadline: self.deadline,
            completed_at: self.completed_at,
            time_spent: self.time_spent,
            total_points: self.total_points,
            score: self.score,
            percentage: self.percentage,
            passed: self.passed,
            needs_manual_grading: self.needs_manual_grading,
            fully_graded: self.fully_graded,
            questions: self.questions.iter().map(Question::public).collect(),
            answers: self
                .answers
                .iter()
                .map(|a| AnswerView {
                    question_id: a.question_id,
                    answer: a.answer.clone(),
                    is_correct: if reveal { a.is_correct } else { None },
                    points_awarded: a.points_awarded,
                    feedback: a.feedback.clone(),
                    graded_at: a.graded_at,
                })
                .collect(),
            solutions: if reveal && self.status == AttemptStatus::Completed {
                self.questions.iter().map(Solution::of).collect()
            } else {
                Vec::new()
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerView {
    pub question_id: Uuid,
    pub answer: Option<AnswerValue>,
    pub is_correct: Option<bool>,
    pub points_awarded: f64,
    pub feedback: Option<String>,
    pub graded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub question_id: Uuid,
    pub correct_answer: Option<Value>,
    pub explanation: Option<String>,
}

impl Solution {
    fn of(q: &Question) -> Self {
        let correct_answer = match &q.kind {
            QuestionKind::MultipleChoice { .. } => q.correct_option().map(|s| Value::String(s.to_string())),
            QuestionKind::TrueFalse { correct_answer } => Some(Value::Bool(*correct_answer)),
            QuestionKind::ShortAnswer { accepted_answers, .. } | QuestionKind::FillBlank { accepted_answers, .. } => {
                Some(Value::from(accepted_answers.clone()))
            }
            QuestionKind::Essay => None,
        };
        Self {
            question_id: q.id,
            correct_answer,
            explanation: q.explanation.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub student_id: Uuid,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent: Option<i64>,
    pub total_points: f64,
    pub score: Option<f64>,
    pub percentage: Option<f64>,
    pub passed: Option<bool>,
    pub needs_manual_grading: bool,
    pub fully_graded: bool,
    pub questions: Vec<PublicQuestion>,
    pub answers: Vec<AnswerView>,
    pub solutions: Vec<Solution>,
}
