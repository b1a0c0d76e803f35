use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{AttemptStore, GradebookStore, ProgressStore, QuizStore, Versioned};
use crate::attempt::{AttemptStatus, QuizAttempt};
use crate::error::StoreError;
use crate::gradebook::GradebookEntry;
use crate::progress::ProgressRecord;
use crate::quiz::QuizDefinition;

#[derive(Default)]
struct Inner {
    gradebooks: HashMap<(Uuid, Uuid), Versioned<GradebookEntry>>,
    quizzes: HashMap<Uuid, Versioned<QuizDefinition>>,
    attempts: HashMap<Uuid, Versioned<QuizAttempt>>,
    progress: HashMap<(Uuid, Uuid, Uuid), Versioned<ProgressRecord>>,
}

/// In-memory backend for tests and database-less runs. One lock guards all
/// maps, so every check-and-write below is atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

/// Replace `slot` if its version still matches.
fn swap<T: Clone>(slot: Option<&mut Versioned<T>>, value: &T, expected: i64) -> Result<i64, StoreError> {
    let slot = slot.ok_or(StoreError::NotFound)?;
    if slot.version != expected {
        return Err(StoreError::Conflict);
    }
    slot.value = value.clone();
    slot.version += 1;
    Ok(slot.version)
}

#[async_trait]
impl GradebookStore for MemoryStore {
    async fn find(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Versioned<GradebookEntry>>, StoreError> {
        Ok(self.lock()?.gradebooks.get(&(student_id, course_id)).cloned())
    }

    async fn insert(&self, entry: &GradebookEntry) -> Result<Versioned<GradebookEntry>, StoreError> {
        let mut guard = self.lock()?;
        let key = (entry.student_id, entry.course_id);
        if guard.gradebooks.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        let stored = Versioned::new(entry.clone(), 1);
        guard.gradebooks.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, entry: &GradebookEntry, expected_version: i64) -> Result<i64, StoreError> {
        let mut guard = self.lock()?;
        let slot = guard.gradebooks.get_mut(&(entry.student_id, entry.course_id));
        swap(slot, entry, expected_version)
    }

    async fn list_course(&self, course_id: Uuid) -> Result<Vec<Versioned<GradebookEntry>>, StoreError> {
        let guard = self.lock()?;
        let mut entries: Vec<_> = guard
            .gradebooks
            .values()
            .filter(|e| e.value.course_id == course_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.value.student_id);
        Ok(entries)
    }
}

#[async_trait]
impl QuizStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizDefinition>>, StoreError> {
        Ok(self.lock()?.quizzes.get(&id).cloned())
    }

    async fn insert(&self, quiz: &QuizDefinition) -> Result<Versioned<QuizDefinition>, StoreError> {
        let mut guard = self.lock()?;
        if guard.quizzes.contains_key(&quiz.id) {
            return Err(StoreError::Conflict);
        }
        let stored = Versioned::new(quiz.clone(), 1);
        guard.quizzes.insert(quiz.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, quiz: &QuizDefinition, expected_version: i64) -> Result<i64, StoreError> {
        let mut guard = self.lock()?;
        swap(guard.quizzes.get_mut(&quiz.id), quiz, expected_version)
    }

    async fn delete_unattempted(&self, id: Uuid) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        if guard.attempts.values().any(|a| a.value.quiz_id == id) {
            return Err(StoreError::Conflict);
        }
        guard.quizzes.remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError> {
        Ok(self.lock()?.attempts.get(&id).cloned())
    }

    async fn find_in_progress(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .find(|a| {
                a.value.quiz_id == quiz_id
                    && a.value.student_id == student_id
                    && a.value.status == AttemptStatus::InProgress
            })
            .cloned())
    }

    async fn count_completed(&self, quiz_id: Uuid, student_id: Uuid) -> Result<u32, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| {
                a.value.quiz_id == quiz_id
                    && a.value.student_id == student_id
                    && a.value.status == AttemptStatus::Completed
            })
            .count() as u32)
    }

    async fn count_for_quiz(&self, quiz_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.value.quiz_id == quiz_id)
            .count() as u64)
    }

    async fn list_for_student(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError> {
        let guard = self.lock()?;
        let mut attempts: Vec<_> = guard
            .attempts
            .values()
            .filter(|a| a.value.quiz_id == quiz_id && a.value.student_id == student_id)
            .map(|a| a.value.clone())
            .collect();
        attempts.sort_by_key(|a| (a.attempt_number, a.started_at));
        Ok(attempts)
    }

    async fn insert(&self, attempt: &QuizAttempt) -> Result<Versioned<QuizAttempt>, StoreError> {
        let mut guard = self.lock()?;
        let live = guard.attempts.values().any(|a| {
            a.value.quiz_id == attempt.quiz_id
                && a.value.student_id == attempt.student_id
                && a.value.status == AttemptStatus::InProgress
        });
        if live || guard.attempts.contains_key(&attempt.id) {
            return Err(StoreError::Conflict);
        }
        let stored = Versioned::new(attempt.clone(), 1);
        guard.attempts.insert(attempt.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, attempt: &QuizAttempt, expected_version: i64) -> Result<i64, StoreError> {
        let mut guard = self.lock()?;
        swap(guard.attempts.get_mut(&attempt.id), attempt, expected_version)
    }

    async fn list_in_progress(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.value.status == AttemptStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn list_pending_sync(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError> {
        Ok(self
            .lock()?
            .attempts
            .values()
            .filter(|a| a.value.needs_gradebook_sync())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get(&self, user_id: Uuid, module_id: Uuid, item_id: Uuid) -> Result<Option<Versioned<ProgressRecord>>, StoreError> {
        Ok(self.lock()?.progress.get(&(user_id, module_id, item_id)).cloned())
    }

    async fn insert(&self, record: &ProgressRecord) -> Result<Versioned<ProgressRecord>, StoreError> {
        let mut guard = self.lock()?;
        let key = (record.user_id, record.module_id, record.item_id);
        if guard.progress.contains_key(&key) {
            return Err(StoreError::Conflict);
        }
        let stored = Versioned::new(record.clone(), 1);
        guard.progress.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &ProgressRecord, expected_version: i64) -> Result<i64, StoreError> {
        let mut guard = self.lock()?;
        let slot = guard
            .progress
            .get_mut(&(record.user_id, record.module_id, record.item_id));
        swap(slot, record, expected_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradebook::GradePolicy;
    use crate::quiz::tests::mc;
    use crate::quiz::QuizDraft;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = MemoryStore::new();
        let policy = GradePolicy::default();
        let entry = GradebookEntry::new(Uuid::new_v4(), Uuid::new_v4(), &policy, Utc::now());

        let stored = GradebookStore::insert(&store, &entry).await.unwrap();
        assert_eq!(stored.version, 1);
        assert!(matches!(
            GradebookStore::insert(&store, &entry).await,
            Err(StoreError::Conflict)
        ));

        let v2 = GradebookStore::update(&store, &entry, 1).await.unwrap();
        assert_eq!(v2, 2);
        assert!(matches!(
            GradebookStore::update(&store, &entry, 1).await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let store = MemoryStore::new();
        let record = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(
            ProgressStore::update(&store, &record, 1).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn attempts_list_in_attempt_number_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let draft = QuizDraft { title: "Quiz".into(), questions: vec![mc(1.0, "a", &["b"])], ..Default::default() };
        let quiz = QuizDefinition::create(Uuid::new_v4(), draft, Uuid::new_v4(), now).unwrap();
        let student = Uuid::new_v4();

        // higher attempt numbers carry earlier clocks
        for n in [2u32, 10, 1] {
            let mut attempt = QuizAttempt::start(&quiz, student, n, now - Duration::minutes(i64::from(n)));
            attempt.expire(AttemptStatus::Abandoned, now).unwrap();
            AttemptStore::insert(&store, &attempt).await.unwrap();
        }
        let numbers: Vec<u32> = AttemptStore::list_for_student(&store, quiz.id, student)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 10]);
    }
}
