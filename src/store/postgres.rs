//! Postgres backend. Aggregates live in JSONB `doc` columns next to the key
//! columns used for lookups, uniqueness and version checks.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use super::{AttemptStore, GradebookStore, ProgressStore, QuizStore, Versioned};
use crate::attempt::QuizAttempt;
use crate::db::Db;
use crate::error::StoreError;
use crate::gradebook::GradebookEntry;
use crate::progress::ProgressRecord;
use crate::quiz::QuizDefinition;

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn decode<T: DeserializeOwned>(row: &PgRow) -> Result<Versioned<T>, StoreError> {
    let Json(value): Json<T> = row.try_get("doc")?;
    let version: i64 = row.try_get("version")?;
    Ok(Versioned::new(value, version))
}

fn decode_all<T: DeserializeOwned>(rows: &[PgRow]) -> Result<Vec<Versioned<T>>, StoreError> {
    rows.iter().map(decode).collect()
}

/// Turns the affected-row count of a conditional update into a new version.
fn bumped(rows_affected: u64, expected: i64) -> Result<i64, StoreError> {
    if rows_affected == 0 {
        Err(StoreError::Conflict)
    } else {
        Ok(expected + 1)
    }
}

#[async_trait]
impl GradebookStore for PgStore {
    async fn find(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Versioned<GradebookEntry>>, StoreError> {
        let row = sqlx::query("SELECT doc, version FROM gradebook_entries WHERE student_id = $1 AND course_id = $2")
            .bind(student_id)
            .bind(course_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert(&self, entry: &GradebookEntry) -> Result<Versioned<GradebookEntry>, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO gradebook_entries (id, student_id, course_id, doc, version)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (student_id, course_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.student_id)
        .bind(entry.course_id)
        .bind(Json(entry))
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(Versioned::new(entry.clone(), 1))
    }

    async fn update(&self, entry: &GradebookEntry, expected_version: i64) -> Result<i64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE gradebook_entries
            SET doc = $1, version = version + 1, updated_at = now()
            WHERE student_id = $2 AND course_id = $3 AND version = $4
            "#,
        )
        .bind(Json(entry))
        .bind(entry.student_id)
        .bind(entry.course_id)
        .bind(expected_version)
        .execute(&self.db)
        .await?;
        bumped(res.rows_affected(), expected_version)
    }

    async fn list_course(&self, course_id: Uuid) -> Result<Vec<Versioned<GradebookEntry>>, StoreError> {
        let rows = sqlx::query("SELECT doc, version FROM gradebook_entries WHERE course_id = $1 ORDER BY student_id")
            .bind(course_id)
            .fetch_all(&self.db)
            .await?;
        decode_all(&rows)
    }
}

#[async_trait]
impl QuizStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizDefinition>>, StoreError> {
        let row = sqlx::query("SELECT doc, version FROM quizzes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert(&self, quiz: &QuizDefinition) -> Result<Versioned<QuizDefinition>, StoreError> {
        sqlx::query("INSERT INTO quizzes (id, course_id, doc, version) VALUES ($1, $2, $3, 1)")
            .bind(quiz.id)
            .bind(quiz.course_id)
            .bind(Json(quiz))
            .execute(&self.db)
            .await?;
        Ok(Versioned::new(quiz.clone(), 1))
    }

    async fn update(&self, quiz: &QuizDefinition, expected_version: i64) -> Result<i64, StoreError> {
        let res = sqlx::query(
            "UPDATE quizzes SET doc = $1, version = version + 1, updated_at = now() WHERE id = $2 AND version = $3",
        )
        .bind(Json(quiz))
        .bind(quiz.id)
        .bind(expected_version)
        .execute(&self.db)
        .await?;
        bumped(res.rows_affected(), expected_version)
    }

    async fn delete_unattempted(&self, id: Uuid) -> Result<(), StoreError> {
        // the attempts foreign key turns a racing start into a violation
        let res = sqlx::query(
            "DELETE FROM quizzes WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM quiz_attempts WHERE quiz_id = $1)",
        )
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::Conflict,
            other => StoreError::from(other),
        })?;
        if res.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM quizzes WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.db)
                .await?;
            return Err(if exists { StoreError::Conflict } else { StoreError::NotFound });
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError> {
        let row = sqlx::query("SELECT doc, version FROM quiz_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn find_in_progress(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Option<Versioned<QuizAttempt>>, StoreError> {
        let row = sqlx::query(
            "SELECT doc, version FROM quiz_attempts WHERE quiz_id = $1 AND student_id = $2 AND status = 'in_progress'",
        )
        .bind(quiz_id)
        .bind(student_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn count_completed(&self, quiz_id: Uuid, student_id: Uuid) -> Result<u32, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM quiz_attempts WHERE quiz_id = $1 AND student_id = $2 AND status = 'completed'",
        )
        .bind(quiz_id)
        .bind(student_id)
        .fetch_one(&self.db)
        .await?;
        Ok(n as u32)
    }

    async fn count_for_quiz(&self, quiz_id: Uuid) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quiz_attempts WHERE quiz_id = $1")
            .bind(quiz_id)
            .fetch_one(&self.db)
            .await?;
        Ok(n as u64)
    }

    async fn list_for_student(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc, version FROM quiz_attempts
            WHERE quiz_id = $1 AND student_id = $2
            ORDER BY (doc->>'attemptNumber')::int, (doc->>'startedAt')::timestamptz
            "#,
        )
        .bind(quiz_id)
        .bind(student_id)
        .fetch_all(&self.db)
        .await?;
        Ok(decode_all::<QuizAttempt>(&rows)?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    async fn insert(&self, attempt: &QuizAttempt) -> Result<Versioned<QuizAttempt>, StoreError> {
        // the partial unique index rejects a second in-progress attempt
        sqlx::query(
            "INSERT INTO quiz_attempts (id, quiz_id, student_id, status, doc, version) VALUES ($1, $2, $3, $4, $5, 1)",
        )
        .bind(attempt.id)
        .bind(attempt.quiz_id)
        .bind(attempt.student_id)
        .bind(attempt.status.as_str())
        .bind(Json(attempt))
        .execute(&self.db)
        .await?;
        Ok(Versioned::new(attempt.clone(), 1))
    }

    async fn update(&self, attempt: &QuizAttempt, expected_version: i64) -> Result<i64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE quiz_attempts
            SET doc = $1, status = $2, version = version + 1, updated_at = now()
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(Json(attempt))
        .bind(attempt.status.as_str())
        .bind(attempt.id)
        .bind(expected_version)
        .execute(&self.db)
        .await?;
        bumped(res.rows_affected(), expected_version)
    }

    async fn list_in_progress(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError> {
        let rows = sqlx::query("SELECT doc, version FROM quiz_attempts WHERE status = 'in_progress'")
            .fetch_all(&self.db)
            .await?;
        decode_all(&rows)
    }

    async fn list_pending_sync(&self) -> Result<Vec<Versioned<QuizAttempt>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc, version FROM quiz_attempts
            WHERE status = 'completed'
              AND (doc->>'fullyGraded')::boolean
              AND COALESCE((doc->>'syncPending')::boolean, false)
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        decode_all(&rows)
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn get(&self, user_id: Uuid, module_id: Uuid, item_id: Uuid) -> Result<Option<Versioned<ProgressRecord>>, StoreError> {
        let row = sqlx::query(
            "SELECT doc, version FROM progress_records WHERE user_id = $1 AND module_id = $2 AND item_id = $3",
        )
        .bind(user_id)
        .bind(module_id)
        .bind(item_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert(&self, record: &ProgressRecord) -> Result<Versioned<ProgressRecord>, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO progress_records (user_id, module_id, item_id, doc, version)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (user_id, module_id, item_id) DO NOTHING
            "#,
        )
        .bind(record.user_id)
        .bind(record.module_id)
        .bind(record.item_id)
        .bind(Json(record))
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(Versioned::new(record.clone(), 1))
    }

    async fn update(&self, record: &ProgressRecord, expected_version: i64) -> Result<i64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE progress_records
            SET doc = $1, version = version + 1, updated_at = now()
            WHERE user_id = $2 AND module_id = $3 AND item_id = $4 AND version = $5
            "#,
        )
        .bind(Json(record))
        .bind(record.user_id)
        .bind(record.module_id)
        .bind(record.item_id)
        .bind(expected_version)
        .execute(&self.db)
        .await?;
        bumped(res.rows_affected(), expected_version)
    }
}
