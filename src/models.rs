//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attempt::{AttemptView, RawAnswer};
use crate::gradebook::GradeItemInput;
use crate::quiz::{PublicQuiz, QuizDefinition};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GradeItemReq {
    pub student_id: Uuid,
    pub course_id: Uuid,
    #[serde(flatten)]
    pub item: GradeItemInput,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BulkGradeRow {
    pub student_id: Uuid,
    #[serde(flatten)]
    pub item: GradeItemInput,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BulkGradeReq {
    pub course_id: Uuid,
    pub grades: Vec<BulkGradeRow>,
}

/// Outcome of one row of a bulk operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RowResult {
    pub index: usize,
    pub student_id: Uuid,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_grade: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub succeeded: usize,
    pub failed: usize,
    pub rows: Vec<RowResult>,
}

impl BulkReport {
    pub fn push(&mut self, row: RowResult) {
        if row.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.rows.push(row);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReq {
    pub answers: Vec<RawAnswer>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GradeEssayReq {
    pub question_id: Uuid,
    pub points_awarded: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReq {
    pub current_time: f64,
    pub total_duration: f64,
    /// Seconds watched since the previous report.
    #[serde(default)]
    pub watch_time: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartResp {
    pub attempt: AttemptView,
    /// True when an already running attempt was returned instead of a new one.
    pub resumed: bool,
}

/// What instructors and students get back for a quiz lookup.
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum QuizView {
    Full(QuizDefinition),
    Public(PublicQuiz),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    Archived,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub timed_out: usize,
    pub abandoned: usize,
    pub synced: usize,
    pub failed: usize,
}
