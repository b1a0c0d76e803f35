//! Quiz definitions: the question bank, scoring data and attempt policy.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

/// When a student may see correct answers and explanations for their attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnswerVisibility {
    #[default]
    Immediate,
    AfterDue,
    Never,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

/// Type-specific correctness data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum QuestionKind {
    MultipleChoice {
        options: Vec<QuestionOption>,
    },
    TrueFalse {
        correct_answer: bool,
    },
    ShortAnswer {
        accepted_answers: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    FillBlank {
        accepted_answers: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    Essay,
}

impl QuestionKind {
    pub fn name(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice { .. } => "multiple_choice",
            QuestionKind::TrueFalse { .. } => "true_false",
            QuestionKind::ShortAnswer { .. } => "short_answer",
            QuestionKind::FillBlank { .. } => "fill_blank",
            QuestionKind::Essay => "essay",
        }
    }

    pub fn is_essay(&self) -> bool {
        matches!(self, QuestionKind::Essay)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub order: u32,
    pub points: f64,
    pub prompt: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: &str| Err(AppError::Validation(format!("question {}: {msg}", self.id)));

        if !self.points.is_finite() || self.points <= 0.0 {
            return invalid("points must be greater than 0");
        }
        if self.prompt.trim().is_empty() {
            return invalid("prompt is required");
        }
        match &self.kind {
            QuestionKind::MultipleChoice { options } => {
                if options.len() < 2 {
                    return invalid("multiple choice needs at least two options");
                }
                if !options.iter().any(|o| o.is_correct) {
                    return invalid("multiple choice needs an option flagged correct");
                }
            }
            QuestionKind::ShortAnswer { accepted_answers, .. }
            | QuestionKind::FillBlank { accepted_answers, .. } => {
                if accepted_answers.iter().all(|a| a.trim().is_empty()) {
                    return invalid("at least one accepted answer is required");
                }
            }
            QuestionKind::TrueFalse { .. } | QuestionKind::Essay => {}
        }
        Ok(())
    }

    /// Option text flagged correct, for multiple choice questions.
    pub fn correct_option(&self) -> Option<&str> {
        match &self.kind {
            QuestionKind::MultipleChoice { options } => options
                .iter()
                .find(|o| o.is_correct)
                .map(|o| o.text.as_str()),
            _ => None,
        }
    }

    /// Copy of this question with its options in a fresh uniform order.
    pub fn shuffled_options(&self) -> Question {
        let mut q = self.clone();
        if let QuestionKind::MultipleChoice { options } = &mut q.kind {
            options.shuffle(&mut rand::thread_rng());
        }
        q
    }

    /// Student-facing view without correct answers or explanation.
    pub fn public(&self) -> PublicQuestion {
        let kind = match &self.kind {
            QuestionKind::MultipleChoice { options } => PublicQuestionKind::MultipleChoice {
                options: options.iter().map(|o| o.text.clone()).collect(),
            },
            QuestionKind::TrueFalse { .. } => PublicQuestionKind::TrueFalse,
            QuestionKind::ShortAnswer { .. } => PublicQuestionKind::ShortAnswer,
            QuestionKind::FillBlank { .. } => PublicQuestionKind::FillBlank,
            QuestionKind::Essay => PublicQuestionKind::Essay,
        };
        PublicQuestion {
            id: self.id,
            order: self.order,
            points: self.points,
            prompt: self.prompt.clone(),
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublicQuestionKind {
    MultipleChoice { options: Vec<String> },
    TrueFalse,
    ShortAnswer,
    FillBlank,
    Essay,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicQuestion {
    pub id: Uuid,
    pub order: u32,
    pub points: f64,
    pub prompt: String,
    #[serde(flatten)]
    pub kind: PublicQuestionKind,
}

/// Authoring payload for create and update. Everything but the title and
/// questions has a default.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizDraft {
    pub course_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub questions: Vec<Question>,
    pub passing_score: Option<f64>,
    /// For the schedule fields, an absent key keeps the current value and an
    /// explicit `null` clears it.
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub available_from: Option<Option<DateTime<Utc>>>,
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub available_until: Option<Option<DateTime<Utc>>>,
    #[serde(deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub time_limit: Option<u32>,
    pub max_attempts: Option<u32>,
    pub allow_retake: Option<bool>,
    pub shuffle_questions: Option<bool>,
    pub shuffle_options: Option<bool>,
    pub show_correct_answers: Option<AnswerVisibility>,
    pub is_active: Option<bool>,
}

/// Maps a key that is present to `Some`, so `null` becomes `Some(None)`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizDefinition {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    questions: Vec<Question>,
    total_points: f64,
    pub passing_score: f64,
    pub available_from: Option<DateTime<Utc>>,
    pub available_until: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    /// Minutes.
    pub time_limit: Option<u32>,
    pub max_attempts: u32,
    pub allow_retake: bool,
    pub shuffle_questions: bool,
    pub shuffle_options: bool,
    pub show_correct_answers: AnswerVisibility,
    pub status: QuizStatus,
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuizDefinition {
    pub fn create(course_id: Uuid, draft: QuizDraft, created_by: Uuid, now: DateTime<Utc>) -> AppResult<Self> {
        let mut quiz = Self {
            id: Uuid::new_v4(),
            course_id,
            title: String::new(),
            description: None,
            questions: Vec::new(),
            total_points: 0.0,
            passing_score: 60.0,
            available_from: None,
            available_until: None,
            due_date: None,
            time_limit: None,
            max_attempts: 1,
            allow_retake: false,
            shuffle_questions: false,
            shuffle_options: false,
            show_correct_answers: AnswerVisibility::Immediate,
            status: QuizStatus::Draft,
            is_active: true,
            created_by,
            created_at: now,
            updated_at: now,
        };
        quiz.apply(draft, now)?;
        Ok(quiz)
    }

    /// Apply an authoring payload. Validation happens against a copy, so a
    /// rejected draft leaves the quiz untouched.
    pub fn apply(&mut self, draft: QuizDraft, now: DateTime<Utc>) -> AppResult<()> {
        let mut next = self.clone();

        if !draft.title.trim().is_empty() {
            next.title = draft.title.trim().to_string();
        }
        if next.title.is_empty() {
            return Err(AppError::Validation("title is required".into()));
        }
        if draft.description.is_some() {
            next.description = draft.description;
        }
        if let Some(score) = draft.passing_score {
            if !(0.0..=100.0).contains(&score) {
                return Err(AppError::Validation("passingScore must be between 0 and 100".into()));
            }
            next.passing_score = score;
        }
        if let Some(max) = draft.max_attempts {
            if max == 0 {
                return Err(AppError::Validation("maxAttempts must be at least 1".into()));
            }
            next.max_attempts = max;
        }
        if let Some(limit) = draft.time_limit {
            next.time_limit = (limit > 0).then_some(limit);
        }
        if let Some(from) = draft.available_from {
            next.available_from = from;
        }
        if let Some(until) = draft.available_until {
            next.available_until = until;
        }
        if let Some(due) = draft.due_date {
            next.due_date = due;
        }
        if let (Some(from), Some(until)) = (next.available_from, next.available_until) {
            if until < from {
                return Err(AppError::Validation("availableUntil is before availableFrom".into()));
            }
        }
        next.allow_retake = draft.allow_retake.unwrap_or(next.allow_retake);
        next.shuffle_questions = draft.shuffle_questions.unwrap_or(next.shuffle_questions);
        next.shuffle_options = draft.shuffle_options.unwrap_or(next.shuffle_options);
        next.show_correct_answers = draft.show_correct_answers.unwrap_or(next.show_correct_answers);
        next.is_active = draft.is_active.unwrap_or(next.is_active);

        if !draft.questions.is_empty() {
            next.set_questions(draft.questions)?;
        }
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    /// Replace the question list and recompute `total_points`.
    pub fn set_questions(&mut self, mut questions: Vec<Question>) -> AppResult<()> {
        for q in &questions {
            q.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        if !questions.iter().all(|q| seen.insert(q.id)) {
            return Err(AppError::Validation("question ids must be unique".into()));
        }
        questions.sort_by_key(|q| q.order);
        self.questions = questions;
        self.total_points = self.questions.iter().map(|q| q.points).sum();
        Ok(())
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn total_points(&self) -> f64 {
        self.total_points
    }

    pub fn publish(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        match self.status {
            QuizStatus::Archived => Err(AppError::InvalidState("an archived quiz cannot be published".into())),
            _ if self.questions.is_empty() => {
                Err(AppError::Validation("a quiz needs at least one question to be published".into()))
            }
            _ => {
                self.status = QuizStatus::Published;
                self.updated_at = now;
                Ok(())
            }
        }
    }

    pub fn archive(&mut self, now: DateTime<Utc>) {
        self.status = QuizStatus::Archived;
        self.is_active = false;
        self.updated_at = now;
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == QuizStatus::Published
            && self.is_active
            && self.available_from.map_or(true, |from| now >= from)
            && self.available_until.map_or(true, |until| now <= until)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_some_and(|due| due < now)
    }

    /// Whether a student may see correct answers for their attempt right now.
    pub fn reveals_answers(&self, now: DateTime<Utc>) -> bool {
        match self.show_correct_answers {
            AnswerVisibility::Immediate => true,
            AnswerVisibility::AfterDue => self.is_overdue(now),
            AnswerVisibility::Never => false,
        }
    }

    /// Questions in a fresh uniform order.
    pub fn shuffled_questions(&self) -> Vec<Question> {
        let mut qs = self.questions.clone();
        qs.shuffle(&mut rand::thread_rng());
        qs
    }

    /// The frozen question list for a new attempt, shuffled per the quiz flags.
    pub fn snapshot(&self) -> Vec<Question> {
        let questions = if self.shuffle_questions {
            self.shuffled_questions()
        } else {
            self.questions.clone()
        };
        if self.shuffle_options {
            questions.iter().map(Question::shuffled_options).collect()
        } else {
            questions
        }
    }

    pub fn public_view(&self) -> PublicQuiz {
        PublicQuiz {
            id: self.id,
            course_id: self.course_id,
            title: self.title.clone(),
            description: self.description.clone(),
            total_points: self.total_points,
            passing_score: self.passing_score,
            question_count: self.questions.len(),
            available_from: self.available_from,
            available_until: self.available_until,
            due_date: self.due_date,
            time_limit: self.time_limit,
            max_attempts: self.max_attempts,
            allow_retake: self.allow_retake,
            status: self.status,
        }
    }
}

/// Quiz summary shown to students before they start.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicQuiz {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub total_points: f64,
    pub passing_score: f64,
    pub question_count: usize,
    pub available_from: Option<DateTime<Utc>>,
    pub available_until: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub time_limit: Option<u32>,
    pub max_attempts: u32,
    pub allow_retake: bool,
    pub status: QuizStatus,
}
