//! Watch progress per content item and the sequential unlock predicate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Video,
    Reading,
    Assignment,
    Quiz,
    Other,
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(ContentKind::Video),
            "reading" => Ok(ContentKind::Reading),
            "assignment" => Ok(ContentKind::Assignment),
            "quiz" => Ok(ContentKind::Quiz),
            "other" => Ok(ContentKind::Other),
            other => Err(format!("unknown content kind `{other}`")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnlockCondition {
    #[default]
    None,
    Sequential,
}

/// One entry of a module's ordered content sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: Uuid,
    pub kind: ContentKind,
    #[serde(default)]
    pub unlock_condition: UnlockCondition,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub user_id: Uuid,
    pub module_id: Uuid,
    pub item_id: Uuid,
    /// Seconds into the item.
    pub current_position: f64,
    pub total_duration: f64,
    pub watched_percentage: u32,
    is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated seconds actually spent watching.
    pub total_watch_time: f64,
    pub last_watched_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(user_id: Uuid, module_id: Uuid, item_id: Uuid) -> Self {
        Self {
            user_id,
            module_id,
            item_id,
            current_position: 0.0,
            total_duration: 0.0,
            watched_percentage: 0,
            is_completed: false,
            completed_at: None,
            total_watch_time: 0.0,
            last_watched_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Record a playback position. Completion is stamped the first time the
    /// watched percentage reaches `threshold` and is never undone.
    pub fn update_progress(
        &mut self,
        current_time: f64,
        total_duration: f64,
        watch_delta: f64,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if !total_duration.is_finite() || total_duration <= 0.0 {
            return Err(AppError::Validation("totalDuration must be greater than 0".into()));
        }
        if !current_time.is_finite() || current_time < 0.0 {
            return Err(AppError::Validation("currentTime must be 0 or more".into()));
        }
        if !watch_delta.is_finite() || watch_delta < 0.0 {
            return Err(AppError::Validation("watchTime must be 0 or more".into()));
        }

        let position = current_time.min(total_duration);
        self.current_position = position;
        self.total_duration = total_duration;
        self.watched_percentage = ((position / total_duration) * 100.0).round() as u32;
        self.total_watch_time += watch_delta;
        self.last_watched_at = Some(now);

        if self.watched_percentage >= threshold {
            self.mark_complete(now);
        }
        Ok(())
    }

    pub fn mark_complete(&mut self, now: DateTime<Utc>) {
        if !self.is_completed {
            self.is_completed = true;
            self.completed_at = Some(now);
        }
    }
}

/// How an item proves it is done for the purpose of unlocking its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRule {
    /// A progress record with `isCompleted` must exist.
    RequiresRecord,
    /// Treated as done without any signal.
    Automatic,
}

/// Per-kind completion rules. Videos always need a record; other kinds are
/// automatic unless listed in `require_record`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnlockPolicy {
    require_record: HashSet<ContentKind>,
}

impl Default for UnlockPolicy {
    fn default() -> Self {
        Self::requiring(std::iter::empty::<ContentKind>())
    }
}

impl UnlockPolicy {
    pub fn requiring(kinds: impl IntoIterator<Item = ContentKind>) -> Self {
        let mut require_record: HashSet<ContentKind> = kinds.into_iter().collect();
        require_record.insert(ContentKind::Video);
        Self { require_record }
    }

    pub fn rule_for(&self, kind: ContentKind) -> CompletionRule {
        if self.require_record.contains(&kind) {
            CompletionRule::RequiresRecord
        } else {
            CompletionRule::Automatic
        }
    }

    /// Whether `item` may be viewed given its predecessor and the
    /// predecessor's progress record, if any.
    pub fn is_unlocked(
        &self,
        item: &ContentItem,
        previous: Option<&ContentItem>,
        previous_record: Option<&ProgressRecord>,
    ) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        match item.unlock_condition {
            UnlockCondition::None => true,
            UnlockCondition::Sequential => match self.rule_for(previous.kind) {
                CompletionRule::Automatic => true,
                CompletionRule::RequiresRecord => previous_record.is_some_and(ProgressRecord::is_completed),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnlockStatus {
    pub is_unlocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ContentKind, cond: UnlockCondition) -> ContentItem {
        ContentItem { id: Uuid::new_v4(), kind, unlock_condition: cond }
    }

    #[test]
    fn completes_at_threshold_and_stays_complete() {
        let now = Utc::now();
        let mut rec = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        rec.update_progress(50.0, 100.0, 50.0, 90, now).unwrap();
        assert_eq!(rec.watched_percentage, 50);
        assert!(!rec.is_completed());

        rec.update_progress(89.6, 100.0, 39.6, 90, now).unwrap();
        assert_eq!(rec.watched_percentage, 90);
        assert!(rec.is_completed());
        let stamped = rec.completed_at;

        rec.update_progress(10.0, 100.0, 5.0, 90, now + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(rec.watched_percentage, 10);
        assert!(rec.is_completed());
        assert_eq!(rec.completed_at, stamped);
        assert!((rec.total_watch_time - 94.6).abs() < 1e-9);
    }

    #[test]
    fn rejects_zero_duration() {
        let mut rec = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(rec.update_progress(1.0, 0.0, 0.0, 90, Utc::now()).is_err());
        assert_eq!(rec.last_watched_at, None);
    }

    #[test]
    fn position_past_end_caps_at_hundred() {
        let mut rec = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        rec.update_progress(130.0, 100.0, 0.0, 90, Utc::now()).unwrap();
        assert_eq!(rec.watched_percentage, 100);
    }

    #[test]
    fn sequential_gate_on_videos() {
        let policy = UnlockPolicy::default();
        let first = item(ContentKind::Video, UnlockCondition::Sequential);
        let second = item(ContentKind::Video, UnlockCondition::Sequential);

        assert!(policy.is_unlocked(&first, None, None));
        assert!(!policy.is_unlocked(&second, Some(&first), None));

        let mut rec = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), first.id);
        assert!(!policy.is_unlocked(&second, Some(&first), Some(&rec)));
        rec.mark_complete(Utc::now());
        assert!(policy.is_unlocked(&second, Some(&first), Some(&rec)));
    }

    #[test]
    fn non_video_predecessors_are_pluggable() {
        let reading = item(ContentKind::Reading, UnlockCondition::None);
        let next = item(ContentKind::Video, UnlockCondition::Sequential);

        assert!(UnlockPolicy::default().is_unlocked(&next, Some(&reading), None));

        let strict = UnlockPolicy::requiring([ContentKind::Reading]);
        assert!(!strict.is_unlocked(&next, Some(&reading), None));
        assert_eq!(strict.rule_for(ContentKind::Quiz), CompletionRule::Automatic);
    }

    #[test]
    fn unconditioned_items_are_open() {
        let video = item(ContentKind::Video, UnlockCondition::None);
        let next = item(ContentKind::Video, UnlockCondition::None);
        assert!(UnlockPolicy::default().is_unlocked(&next, Some(&video), None));
    }
}
