use chrono::Utc;
use uuid::Uuid;

use super::{retry_on_conflict, Collaborators};
use crate::auth::Caller;
use crate::collaborators::GradeEvent;
use crate::config::Config;
use crate::error::{AppError, AppResult, StoreError};
use crate::gradebook::{GradeItemInput, GradePolicy, GradebookEntry};
use crate::models::{BulkGradeReq, BulkReport, GradeItemReq, RowResult};
use crate::store::{Storage, Versioned};

#[derive(Clone)]
pub struct GradebookService {
    storage: Storage,
    collab: Collaborators,
    policy: GradePolicy,
    retries: u32,
}

impl GradebookService {
    pub fn new(storage: Storage, collab: Collaborators, config: &Config) -> Self {
        Self {
            storage,
            collab,
            policy: config.grade_policy.clone(),
            retries: config.max_write_retries,
        }
    }

    pub fn policy(&self) -> &GradePolicy {
        &self.policy
    }

    async fn load_or_create(&self, student_id: Uuid, course_id: Uuid) -> AppResult<Versioned<GradebookEntry>> {
        let store = &self.storage.gradebooks;
        if let Some(found) = store.find(student_id, course_id).await? {
            return Ok(found);
        }
        let fresh = GradebookEntry::new(student_id, course_id, &self.policy, Utc::now());
        match store.insert(&fresh).await {
            Ok(created) => {
                tracing::debug!(%student_id, %course_id, "gradebook entry created");
                Ok(created)
            }
            // lost the insert race; the winner's row is there now
            Err(StoreError::Conflict) => store
                .find(student_id, course_id)
                .await?
                .ok_or_else(|| AppError::Consistency("gradebook entry".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch-or-insert; a missing entry is never an error.
    pub async fn get_or_create(&self, student_id: Uuid, course_id: Uuid) -> AppResult<GradebookEntry> {
        Ok(self.load_or_create(student_id, course_id).await?.value)
    }

    /// The single write path for gradebook entries: read, apply `f`, write
    /// back with a version check, retrying on conflict.
    async fn mutate<R, F>(&self, student_id: Uuid, course_id: Uuid, f: F) -> AppResult<(GradebookEntry, R)>
    where
        F: Fn(&mut GradebookEntry) -> AppResult<R>,
    {
        let f = &f;
        retry_on_conflict("gradebook entry", self.retries, || async move {
            let current = self.load_or_create(student_id, course_id).await?;
            let mut next = current.value;
            let out = f(&mut next)?;
            self.storage.gradebooks.update(&next, current.version).await?;
            Ok((next, out))
        })
        .await
    }

    /// Upsert one item (dedup on item type and id) and recompute the entry.
    /// Returns the entry and the id of the touched item.
    pub async fn upsert_item(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        input: &GradeItemInput,
        graded_by: Option<Uuid>,
    ) -> AppResult<(GradebookEntry, Uuid)> {
        input.validate()?;
        let policy = &self.policy;
        let (entry, item_id) = self
            .mutate(student_id, course_id, |entry| {
                entry.upsert_item(input, graded_by, policy, Utc::now())
            })
            .await?;

        tracing::info!(
            %student_id,
            %course_id,
            item_type = ?input.item_type,
            current_grade = entry.current_grade,
            "grade item upserted"
        );
        self.collab.notifier.publish(GradeEvent::GradeUpdated {
            student_id,
            course_id,
            item_type: input.item_type,
            item_id: input.item_id,
            current_grade: entry.current_grade,
            letter_grade: entry.letter_grade.clone(),
            status: entry.status,
        });
        Ok((entry, item_id))
    }

    pub async fn recalculate(&self, student_id: Uuid, course_id: Uuid) -> AppResult<GradebookEntry> {
        let policy = &self.policy;
        let (entry, ()) = self
            .mutate(student_id, course_id, |entry| {
                entry.recalculate(policy, Utc::now());
                Ok(())
            })
            .await?;
        self.collab.notifier.publish(GradeEvent::GradeUpdated {
            student_id,
            course_id,
            item_type: None,
            item_id: None,
            current_grade: entry.current_grade,
            letter_grade: entry.letter_grade.clone(),
            status: entry.status,
        });
        Ok(entry)
    }

    pub async fn my_grades(&self, caller: &Caller, course_id: Uuid) -> AppResult<GradebookEntry> {
        self.collab.ensure_course(course_id).await?;
        self.collab.ensure_enrolled(caller, course_id).await?;
        self.get_or_create(caller.user_id, course_id).await
    }

    pub async fn student_grades(&self, caller: &Caller, student_id: Uuid, course_id: Uuid) -> AppResult<GradebookEntry> {
        self.collab.ensure_course(course_id).await?;
        if caller.user_id != student_id {
            self.collab.ensure_instructor(caller, course_id).await?;
        }
        if !self.collab.enrollment.is_enrolled(student_id, course_id).await? {
            return Err(AppError::not_found("student enrollment"));
        }
        self.get_or_create(student_id, course_id).await
    }

    pub async fn course_gradebook(&self, caller: &Caller, course_id: Uuid) -> AppResult<Vec<GradebookEntry>> {
        self.collab.ensure_course(course_id).await?;
        self.collab.ensure_instructor(caller, course_id).await?;
        let entries = self.storage.gradebooks.list_course(course_id).await?;
        Ok(entries.into_iter().map(|e| e.value).collect())
    }

    /// Instructor grade entry for one student.
    pub async fn record_item(&self, caller: &Caller, req: &GradeItemReq) -> AppResult<GradebookEntry> {
        req.item.validate()?;
        self.collab.ensure_course(req.course_id).await?;
        self.collab.ensure_instructor(caller, req.course_id).await?;
        self.ensure_student(req.student_id, req.course_id).await?;
        let (entry, _) = self
            .upsert_item(req.student_id, req.course_id, &req.item, Some(caller.user_id))
            .await?;
        Ok(entry)
    }

    async fn ensure_student(&self, student_id: Uuid, course_id: Uuid) -> AppResult<()> {
        if self.collab.enrollment.is_enrolled(student_id, course_id).await? {
            Ok(())
        } else {
            Err(AppError::Validation(format!("student {student_id} is not enrolled in this course")))
        }
    }

    /// Each row is applied on its own; one bad row never aborts the batch.
    pub async fn bulk_import(&self, caller: &Caller, req: &BulkGradeReq) -> AppResult<BulkReport> {
        self.collab.ensure_course(req.course_id).await?;
        self.collab.ensure_instructor(caller, req.course_id).await?;

        let mut report = BulkReport::default();
        for (index, row) in req.grades.iter().enumerate() {
            let outcome = match self.ensure_student(row.student_id, req.course_id).await {
                Ok(()) => {
                    self.upsert_item(row.student_id, req.course_id, &row.item, Some(caller.user_id))
                        .await
                }
                Err(e) => Err(e),
            };
            report.push(match outcome {
                Ok((entry, _)) => RowResult {
                    index,
                    student_id: row.student_id,
                    success: true,
                    message: "grade recorded".into(),
                    current_grade: Some(entry.current_grade),
                },
                Err(e) => {
                    tracing::warn!(index, student_id = %row.student_id, error = %e, "bulk grade row rejected");
                    RowResult {
                        index,
                        student_id: row.student_id,
                        success: false,
                        message: e.to_string(),
                        current_grade: None,
                    }
                }
            });
        }
        tracing::info!(course_id = %req.course_id, succeeded = report.succeeded, failed = report.failed, "bulk grade import finished");
        Ok(report)
    }

    /// Recompute every entry of a course, reporting per entry.
    pub async fn recalculate_course(&self, caller: &Caller, course_id: Uuid) -> AppResult<BulkReport> {
        self.collab.ensure_course(course_id).await?;
        self.collab.ensure_instructor(caller, course_id).await?;

        let entries = self.storage.gradebooks.list_course(course_id).await?;
        let mut report = BulkReport::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let student_id = entry.value.student_id;
            report.push(match self.recalculate(student_id, course_id).await {
                Ok(updated) => RowResult {
                    index,
                    student_id,
                    success: true,
                    message: "recalculated".into(),
                    current_grade: Some(updated.current_grade),
                },
                Err(e) => RowResult {
                    index,
                    student_id,
                    success: false,
                    message: e.to_string(),
                    current_grade: None,
                },
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradebook::{EntryStatus, ItemType};
    use crate::models::BulkGradeRow;
    use crate::services::testkit::fixture;

    fn graded(item_id: Uuid, max: f64, earned: f64) -> GradeItemInput {
        GradeItemInput {
            item_type: Some(ItemType::Assignment),
            item_id: Some(item_id),
            item_name: "Essay 1".into(),
            max_points: Some(max),
            earned_points: Some(earned),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_or_create_is_lazy_and_stable() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        let first = svc.get_or_create(fx.student.user_id, fx.course).await.unwrap();
        let second = svc.get_or_create(fx.student.user_id, fx.course).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, EntryStatus::Incomplete);
    }

    #[tokio::test]
    async fn regrade_updates_instead_of_duplicating() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        let assignment = Uuid::new_v4();
        let req = |earned| GradeItemReq {
            student_id: fx.student.user_id,
            course_id: fx.course,
            item: graded(assignment, 20.0, earned),
        };

        svc.record_item(&fx.teacher, &req(10.0)).await.unwrap();
        let entry = svc.record_item(&fx.teacher, &req(18.0)).await.unwrap();
        assert_eq!(entry.items().len(), 1);
        assert_eq!(entry.current_grade, 90);
        assert_eq!(entry.items()[0].graded_by, Some(fx.teacher.user_id));
    }

    #[tokio::test]
    async fn grade_entry_requires_instructor_and_enrollment() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        let mut req = GradeItemReq {
            student_id: fx.student.user_id,
            course_id: fx.course,
            item: graded(Uuid::new_v4(), 10.0, 5.0),
        };
        let err = svc.record_item(&fx.student, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        req.student_id = fx.outsider.user_id;
        let err = svc.record_item(&fx.teacher, &req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        req.course_id = Uuid::new_v4();
        let err = svc.record_item(&fx.teacher, &req).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_lose_nothing() {
        let fx = fixture();
        let svc = fx.engine.gradebook.clone();
        let student = fx.student.user_id;
        let course = fx.course;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move {
                    svc.upsert_item(student, course, &graded(Uuid::new_v4(), 10.0, 10.0), None)
                        .await
                })
            })
            .collect();
        let mut acknowledged = 0;
        for t in tasks {
            // a writer may exhaust its retries, but an acknowledged write is never lost
            if t.await.unwrap().is_ok() {
                acknowledged += 1;
            }
        }

        let entry = svc.get_or_create(student, course).await.unwrap();
        assert!(acknowledged >= 1);
        assert_eq!(entry.items().len(), acknowledged);
        assert_eq!(entry.total_possible, 10.0 * acknowledged as f64);
        assert_eq!(entry.current_grade, 100);
    }

    #[tokio::test]
    async fn sequential_upserts_accumulate_every_item() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        for _ in 0..5 {
            svc.upsert_item(fx.student.user_id, fx.course, &graded(Uuid::new_v4(), 10.0, 5.0), None)
                .await
                .unwrap();
        }
        let entry = svc.get_or_create(fx.student.user_id, fx.course).await.unwrap();
        assert_eq!(entry.items().len(), 5);
        assert_eq!(entry.current_grade, 50);
        assert_eq!(entry.status, EntryStatus::Passing);
    }

    #[tokio::test]
    async fn bulk_import_reports_per_row() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        let mut bad = graded(Uuid::new_v4(), 10.0, 5.0);
        bad.max_points = Some(0.0);
        let req = BulkGradeReq {
            course_id: fx.course,
            grades: vec![
                BulkGradeRow { student_id: fx.student.user_id, item: graded(Uuid::new_v4(), 10.0, 7.0) },
                BulkGradeRow { student_id: fx.student.user_id, item: bad },
                BulkGradeRow { student_id: fx.outsider.user_id, item: graded(Uuid::new_v4(), 10.0, 7.0) },
            ],
        };

        let report = svc.bulk_import(&fx.teacher, &req).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(report.rows[0].success);
        assert_eq!(report.rows[0].current_grade, Some(70));
        assert!(report.rows[1].message.contains("maxPoints"));
        assert!(!report.rows[2].success);
    }

    #[tokio::test]
    async fn publishes_grade_updated_events() {
        let fx = fixture();
        let mut rx = fx.notifier.subscribe();
        fx.engine
            .gradebook
            .upsert_item(fx.student.user_id, fx.course, &graded(Uuid::new_v4(), 4.0, 3.0), None)
            .await
            .unwrap();
        let GradeEvent::GradeUpdated { current_grade, letter_grade, .. } = rx.recv().await.unwrap();
        assert_eq!(current_grade, 75);
        assert_eq!(letter_grade, "C");
    }

    #[tokio::test]
    async fn course_recalculation_covers_every_entry() {
        let fx = fixture();
        let svc = &fx.engine.gradebook;
        svc.upsert_item(fx.student.user_id, fx.course, &graded(Uuid::new_v4(), 10.0, 9.0), None)
            .await
            .unwrap();
        let report = svc.recalculate_course(&fx.teacher, fx.course).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.rows[0].current_grade, Some(90));

        let all = svc.course_gradebook(&fx.teacher, fx.course).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(svc.course_gradebook(&fx.student, fx.course).await.is_err());
    }
}
