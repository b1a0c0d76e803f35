//! Per-student, per-course grade aggregation.
//!
//! A [`GradebookEntry`] owns its [`GradeItem`]s. Items are only ever changed
//! through [`GradebookEntry::upsert_item`] or [`GradebookEntry::recalculate`],
//! so the derived totals can never drift from the item list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Assignment,
    Quiz,
    Discussion,
    Attendance,
    Manual,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    NotSubmitted,
    Submitted,
    Graded,
    Late,
    Excused,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Passing,
    Failing,
    AtRisk,
    #[default]
    Incomplete,
}

/// Thresholds used to classify a current grade.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradePolicy {
    pub passing_threshold: u32,
    pub at_risk_threshold: u32,
    /// `(minimum grade, letter)` pairs, highest band first. Anything below the
    /// last band is an `F`.
    pub letter_bands: Vec<(u32, String)>,
}

impl Default for GradePolicy {
    fn default() -> Self {
        Self {
            passing_threshold: 50,
            at_risk_threshold: 40,
            letter_bands: vec![
                (90, "A".into()),
                (80, "B".into()),
                (70, "C".into()),
                (60, "D".into()),
            ],
        }
    }
}

impl GradePolicy {
    pub fn letter_for(&self, grade: u32) -> String {
        self.letter_bands
            .iter()
            .find(|(min, _)| grade >= *min)
            .map(|(_, letter)| letter.clone())
            .unwrap_or_else(|| "F".into())
    }

    /// A zero weighted denominator means nothing counts yet.
    pub fn status_for(&self, grade: u32, weighted_possible: f64) -> EntryStatus {
        if weighted_possible <= 0.0 {
            EntryStatus::Incomplete
        } else if grade >= self.passing_threshold {
            EntryStatus::Passing
        } else if grade >= self.at_risk_threshold {
            EntryStatus::AtRisk
        } else {
            EntryStatus::Failing
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeItem {
    pub id: Uuid,
    pub item_type: ItemType,
    pub item_id: Option<Uuid>,
    pub item_name: String,
    pub max_points: f64,
    pub weight: f64,
    pub earned_points: f64,
    pub percentage: u32,
    pub status: ItemStatus,
    pub is_excused: bool,
    pub feedback: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
    pub graded_by: Option<Uuid>,
}

impl GradeItem {
    fn counts(&self) -> bool {
        !self.is_excused && self.status == ItemStatus::Graded
    }

    fn matches(&self, key: &DedupKey<'_>) -> bool {
        if self.item_type != key.item_type {
            return false;
        }
        match key.item_id {
            Some(id) => self.item_id == Some(id),
            None => self.item_id.is_none() && self.item_name == key.item_name,
        }
    }

    fn refresh_percentage(&mut self) {
        self.percentage = percentage_of(self.earned_points, self.max_points);
    }
}

/// `round(earned / max * 100)`, or 0 when `max` is not positive.
pub fn percentage_of(earned: f64, max: f64) -> u32 {
    if max > 0.0 {
        (earned / max * 100.0).round().max(0.0) as u32
    } else {
        0
    }
}

struct DedupKey<'a> {
    item_type: ItemType,
    item_id: Option<Uuid>,
    item_name: &'a str,
}

/// Fields a grading action wants applied to one item. `None` leaves the
/// existing value alone when merging.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GradeItemInput {
    pub item_type: Option<ItemType>,
    pub item_id: Option<Uuid>,
    #[serde(default)]
    pub item_name: String,
    pub max_points: Option<f64>,
    pub earned_points: Option<f64>,
    pub weight: Option<f64>,
    pub status: Option<ItemStatus>,
    pub is_excused: Option<bool>,
    pub feedback: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl GradeItemInput {
    /// Rejects anything that would break the aggregate before it is touched.
    pub fn validate(&self) -> AppResult<(ItemType, f64)> {
        let item_type = self
            .item_type
            .ok_or_else(|| AppError::Validation("itemType is required".into()))?;
        let max_points = self
            .max_points
            .ok_or_else(|| AppError::Validation("maxPoints is required".into()))?;
        if !max_points.is_finite() || max_points <= 0.0 {
            return Err(AppError::Validation("maxPoints must be greater than 0".into()));
        }
        if let Some(earned) = self.earned_points {
            if !earned.is_finite() || earned < 0.0 {
                return Err(AppError::Validation("earnedPoints must be 0 or more".into()));
            }
        }
        if let Some(weight) = self.weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AppError::Validation("weight must be 0 or more".into()));
            }
        }
        if self.item_id.is_none() && self.item_name.trim().is_empty() {
            return Err(AppError::Validation(
                "itemName is required when itemId is absent".into(),
            ));
        }
        Ok((item_type, max_points))
    }

    fn effective_status(&self) -> Option<ItemStatus> {
        match (self.status, self.is_excused, self.earned_points) {
            (Some(status), _, _) => Some(status),
            (None, Some(true), _) => Some(ItemStatus::Excused),
            (None, _, Some(_)) => Some(ItemStatus::Graded),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradebookEntry {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    items: Vec<GradeItem>,
    pub total_earned: f64,
    pub total_possible: f64,
    pub current_grade: u32,
    pub letter_grade: String,
    pub status: EntryStatus,
    pub last_calculated: DateTime<Utc>,
}

impl GradebookEntry {
    pub fn new(student_id: Uuid, course_id: Uuid, policy: &GradePolicy, now: DateTime<Utc>) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            items: Vec::new(),
            total_earned: 0.0,
            total_possible: 0.0,
            current_grade: 0,
            letter_grade: String::new(),
            status: EntryStatus::Incomplete,
            last_calculated: now,
        };
        entry.recalculate(policy, now);
        entry
    }

    pub fn items(&self) -> &[GradeItem] {
        &self.items
    }

    pub fn item(&self, id: Uuid) -> Option<&GradeItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Merge `input` into the item sharing its dedup key, or append a new
    /// item, then recompute the aggregate. Returns the id of the touched item.
    pub fn upsert_item(
        &mut self,
        input: &GradeItemInput,
        graded_by: Option<Uuid>,
        policy: &GradePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let (item_type, max_points) = input.validate()?;
        let key = DedupKey {
            item_type,
            item_id: input.item_id,
            item_name: input.item_name.trim(),
        };
        let status = input.effective_status();

        let idx = match self.items.iter().position(|i| i.matches(&key)) {
            Some(idx) => idx,
            None => {
                self.items.push(GradeItem {
                    id: Uuid::new_v4(),
                    item_type,
                    item_id: input.item_id,
                    item_name: key.item_name.to_string(),
                    max_points,
                    weight: 1.0,
                    earned_points: 0.0,
                    percentage: 0,
                    status: ItemStatus::NotSubmitted,
                    is_excused: false,
                    feedback: None,
                    submitted_at: None,
                    graded_at: None,
                    graded_by: None,
                });
                self.items.len() - 1
            }
        };

        let item = &mut self.items[idx];
        item.max_points = max_points;
        if !key.item_name.is_empty() {
            item.item_name = key.item_name.to_string();
        }
        if let Some(earned) = input.earned_points {
            item.earned_points = earned;
        }
        if let Some(weight) = input.weight {
            item.weight = weight;
        }
        if let Some(excused) = input.is_excused {
            item.is_excused = excused;
        }
        if let Some(status) = status {
            item.status = status;
            if status == ItemStatus::Excused {
                item.is_excused = true;
            }
        }
        if input.feedback.is_some() {
            item.feedback = input.feedback.clone();
        }
        if input.submitted_at.is_some() {
            item.submitted_at = input.submitted_at;
        }
        if status == Some(ItemStatus::Graded) {
            item.graded_at = Some(input.graded_at.unwrap_or(now));
            if graded_by.is_some() {
                item.graded_by = graded_by;
            }
        }
        item.refresh_percentage();
        let id = item.id;

        self.recalculate(policy, now);
        Ok(id)
    }

    /// Recompute every derived field from the item list.
    pub fn recalculate(&mut self, policy: &GradePolicy, now: DateTime<Utc>) {
        let mut earned = 0.0;
        let mut possible = 0.0;
        let mut weighted_earned = 0.0;
        let mut weighted_possible = 0.0;

        for item in self.items.iter_mut() {
            item.refresh_percentage();
            if !item.counts() {
                continue;
            }
            earned += item.earned_points;
            possible += item.max_points;
            weighted_earned += item.earned_points * item.weight;
            weighted_possible += item.max_points * item.weight;
        }

        let grade = if weighted_possible > 0.0 {
            (weighted_earned / weighted_possible * 100.0).round().max(0.0) as u32
        } else {
            0
        };

        self.total_earned = earned;
        self.total_possible = possible;
        self.current_grade = grade;
        self.letter_grade = policy.letter_for(grade);
        self.status = policy.status_for(grade, weighted_possible);
        self.last_calculated = now;
    }
}
