//! Persistence contracts for the engine's aggregates.
//!
//! Every stored aggregate carries a version. Writers pass the version they
//! read and get [`StoreError::Conflict`] when someone else wrote first; the
//! service layer re-reads and retries.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::attempt::QuizAttempt;
use crate::db::Db;
use crate::error::StoreError;
use crate::gradebook::GradebookEntry;
use crate::progress::ProgressRecord;
use crate::quiz::QuizDefinition;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: i64) -> Self {
        Self { value, version }
    }
}

#[async_trait]
pub trait GradebookStore: Send + Sync {
    async fn find(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Versioned<GradebookEntry>>, StoreError>;

    /// Fails with `Conflict` when the (student, course) pair already has an entry.
    async fn insert(&self, entry: &GradebookEntry) -> Result<Versioned<GradebookEntry>, StoreError>;

    /// Conditional write; returns the new version.
    async fn update(&self, entry: &GradebookEntry, expected_version: i64) -> Result<i64, StoreError>;

    async fn list_course(&self, course_id: Uuid) -> Result<Vec<Versioned<GradebookEntry>>, StoreError>;
}

#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizDefinition>>, StoreError>;

    async fn insert(&self, quiz: &QuizDefinition) -> Result<Versioned<QuizDefinition>, StoreError>;

    async fn update(&self, quiz: &QuizDefinition, expected_version: i64) -> Result<i64, StoreError>;

    /// Hard delete. Fails with `Conflict` if any attempt references the quiz.
    async fn delete_unattempted(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError>;

    async fn find_in_progress(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError>;

    async fn count_completed(&self, quiz_id: Uuid, student_id: Uuid) -> Result<u32, StoreError>;

    async fn count_for_quiz(&self, quiz_id: Uuid) -> Result<u64, StoreError>;

    /// Ordered by attempt number.
    async fn list_for_student(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError>;

    /// Fails with `Conflict` when the student already has an in-progress
    /// attempt on the same quiz.
    async fn insert(&self, attempt: &QuizAttempt) -> Result<Versioned<QuizAttempt>, StoreError>;

    async fn update(&self, attempt: &QuizAttempt, expected_version: i64) -> Result<i64, StoreError>;

    async fn list_in_progress(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError>;

    /// Completed, fully graded attempts whose current score is not yet in
    /// the gradebook.
    async fn list_pending_sync(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, user_id: Uuid, module_id: Uuid, item_id: Uuid) -> Result<Option<Versioned<ProgressRecord>>, StoreError>;

    /// Fails with `Conflict` when a record for the key already exists.
    async fn insert(&self, record: &ProgressRecord) -> Result<Versioned<ProgressRecord>, StoreError>;

    async fn update(&self, record: &ProgressRecord, expected_version: i64) -> Result<i64, StoreError>;
}

/// Aggregates the repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub gradebooks: Arc<dyn GradebookStore>,
    pub quizzes: Arc<dyn QuizStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Storage {
    pub fn in_memory() -> Self {
        let store = MemoryStore::new();
        Self {
            gradebooks: Arc::new(store.clone()),
            quizzes: Arc::new(store.clone()),
            attempts: Arc::new(store.clone()),
            progress: Arc::new(store),
        }
    }

    pub fn postgres(db: Db) -> Self {
        let store = PgStore::new(db);
        Self {
            gradebooks: Arc::new(store.clone()),
            quizzes: Arc::new(store.clone()),
            attempts: Arc::new(store.clone()),
            progress: Arc::new(store),
        }
    }
}
