//! Narrow interfaces to the systems this engine does not own: access
//! control, enrollment, the content catalog and notification delivery.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AppResult;
use crate::gradebook::{EntryStatus, ItemType};
use crate::progress::ContentItem;

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn is_course_instructor(&self, user_id: Uuid, course_id: Uuid) -> AppResult<bool>;
}

#[async_trait]
pub trait Enrollment: Send + Sync {
    async fn course_exists(&self, course_id: Uuid) -> AppResult<bool>;
    async fn is_enrolled(&self, student_id: Uuid, course_id: Uuid) -> AppResult<bool>;
}

#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// Ordered items of a module, or `None` when the module is unknown.
    async fn module_items(&self, module_id: Uuid) -> AppResult<Option<Vec<ContentItem>>>;
}

/// Published after every gradebook mutation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum GradeEvent {
    GradeUpdated {
        student_id: Uuid,
        course_id: Uuid,
        item_type: Option<ItemType>,
        item_id: Option<Uuid>,
        current_grade: u32,
        letter_grade: String,
        status: EntryStatus,
    },
}

pub trait Notifier: Send + Sync {
    fn publish(&self, event: GradeEvent);
}

/// Fans grade events out over a tokio broadcast channel. Having no
/// subscribers is not an error.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<GradeEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GradeEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: GradeEvent) {
        tracing::debug!(?event, "publishing grade event");
        let _ = self.tx.send(event);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CourseRecord {
    pub id: Uuid,
    #[serde(default)]
    pub instructors: Vec<Uuid>,
    #[serde(default)]
    pub students: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub id: Uuid,
    #[serde(default)]
    pub items: Vec<ContentItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryFile {
    #[serde(default)]
    pub courses: Vec<CourseRecord>,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
}

#[derive(Debug, Default)]
struct Course {
    instructors: HashSet<Uuid>,
    students: HashSet<Uuid>,
}

/// Read-only directory of courses, enrollments and module content, usually
/// loaded from a JSON file at startup.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    courses: HashMap<Uuid, Course>,
    modules: HashMap<Uuid, Vec<ContentItem>>,
}

impl StaticDirectory {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let parsed: DirectoryFile = serde_json::from_str(&raw)?;
        Ok(Self::from(parsed))
    }
}

impl From<DirectoryFile> for StaticDirectory {
    fn from(file: DirectoryFile) -> Self {
        let courses = file
            .courses
            .into_iter()
            .map(|c| {
                (
                    c.id,
                    Course {
                        instructors: c.instructors.into_iter().collect(),
                        students: c.students.into_iter().collect(),
                    },
                )
            })
            .collect();
        let modules = file.modules.into_iter().map(|m| (m.id, m.items)).collect();
        Self { courses, modules }
    }
}

#[async_trait]
impl AccessControl for StaticDirectory {
    async fn is_course_instructor(&self, user_id: Uuid, course_id: Uuid) -> AppResult<bool> {
        Ok(self
            .courses
            .get(&course_id)
            .is_some_and(|c| c.instructors.contains(&user_id)))
    }
}

#[async_trait]
impl Enrollment for StaticDirectory {
    async fn course_exists(&self, course_id: Uuid) -> AppResult<bool> {
        Ok(self.courses.contains_key(&course_id))
    }

    async fn is_enrolled(&self, student_id: Uuid, course_id: Uuid) -> AppResult<bool> {
        Ok(self
            .courses
            .get(&course_id)
            .is_some_and(|c| c.students.contains(&student_id)))
    }
}

#[async_trait]
impl ContentCatalog for StaticDirectory {
    async fn module_items(&self, module_id: Uuid) -> AppResult<Option<Vec<ContentItem>>> {
        Ok(self.modules.get(&module_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ContentKind, UnlockCondition};

    #[tokio::test]
    async fn directory_answers_from_file_contents() {
        let course = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let student = Uuid::new_v4();
        let module = Uuid::new_v4();
        let json = serde_json::json!({
            "courses": [{ "id": course, "instructors": [teacher], "students": [student] }],
            "modules": [{ "id": module, "items": [
                { "id": Uuid::new_v4(), "kind": "video" },
                { "id": Uuid::new_v4(), "kind": "reading", "unlockCondition": "sequential" }
            ]}]
        });
        let dir = StaticDirectory::from(serde_json::from_value::<DirectoryFile>(json).unwrap());

        assert!(dir.course_exists(course).await.unwrap());
        assert!(!dir.course_exists(Uuid::new_v4()).await.unwrap());
        assert!(dir.is_course_instructor(teacher, course).await.unwrap());
        assert!(!dir.is_course_instructor(student, course).await.unwrap());
        assert!(dir.is_enrolled(student, course).await.unwrap());

        let items = dir.module_items(module).await.unwrap().unwrap();
        assert_eq!(items[0].kind, ContentKind::Video);
        assert_eq!(items[0].unlock_condition, UnlockCondition::None);
        assert_eq!(items[1].unlock_condition, UnlockCondition::Sequential);
        assert!(dir.module_items(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        let event = GradeEvent::GradeUpdated {
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            item_type: Some(ItemType::Quiz),
            item_id: None,
            current_grade: 75,
            letter_grade: "C".into(),
            status: EntryStatus::Passing,
        };
        notifier.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
