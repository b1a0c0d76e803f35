use chrono::Utc;
use uuid::Uuid;

use super::{retry_on_conflict, Collaborators};
use crate::auth::Caller;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::ProgressReq;
use crate::progress::{ContentItem, ProgressRecord, UnlockPolicy, UnlockStatus};
use crate::store::Storage;

#[derive(Clone)]
pub struct ProgressService {
    storage: Storage,
    collab: Collaborators,
    policy: UnlockPolicy,
    threshold: u32,
    retries: u32,
}

/// An item and its predecessor in module order.
struct Placement {
    item: ContentItem,
    previous: Option<ContentItem>,
}

impl ProgressService {
    pub fn new(storage: Storage, collab: Collaborators, config: &Config) -> Self {
        Self {
            storage,
            collab,
            policy: config.unlock_policy.clone(),
            threshold: config.completion_threshold,
            retries: config.max_write_retries,
        }
    }

    async fn locate(&self, module_id: Uuid, item_id: Uuid) -> AppResult<Placement> {
        let items = self
            .collab
            .catalog
            .module_items(module_id)
            .await?
            .ok_or_else(|| AppError::not_found("module"))?;
        let index = items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| AppError::not_found("content item"))?;
        Ok(Placement {
            item: items[index].clone(),
            previous: index.checked_sub(1).map(|p| items[p].clone()),
        })
    }

    async fn unlock_status(&self, user_id: Uuid, module_id: Uuid, placement: &Placement) -> AppResult<UnlockStatus> {
        let previous_record = match &placement.previous {
            Some(prev) => self
                .storage
                .progress
                .get(user_id, module_id, prev.id)
                .await?
                .map(|v| v.value),
            None => None,
        };
        let is_unlocked = self
            .policy
            .is_unlocked(&placement.item, placement.previous.as_ref(), previous_record.as_ref());
        Ok(UnlockStatus {
            is_unlocked,
            message: (!is_unlocked).then(|| "complete the previous item to unlock this one".to_string()),
        })
    }

    pub async fn check_unlock(&self, caller: &Caller, module_id: Uuid, item_id: Uuid) -> AppResult<UnlockStatus> {
        let placement = self.locate(module_id, item_id).await?;
        self.unlock_status(caller.user_id, module_id, &placement).await
    }

    async fn ensure_unlocked(&self, caller: &Caller, module_id: Uuid, item_id: Uuid) -> AppResult<()> {
        let placement = self.locate(module_id, item_id).await?;
        let status = self.unlock_status(caller.user_id, module_id, &placement).await?;
        if status.is_unlocked {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                status.message.unwrap_or_else(|| "content item is locked".into()),
            ))
        }
    }

    /// Read-modify-write of the caller's record, creating it on first touch.
    async fn mutate<F>(&self, user_id: Uuid, module_id: Uuid, item_id: Uuid, f: F) -> AppResult<ProgressRecord>
    where
        F: Fn(&mut ProgressRecord) -> AppResult<()>,
    {
        let f = &f;
        let store = &self.storage.progress;
        retry_on_conflict("progress record", self.retries, || async move {
            match store.get(user_id, module_id, item_id).await? {
                Some(current) => {
                    let mut next = current.value;
                    f(&mut next)?;
                    store.update(&next, current.version).await?;
                    Ok(next)
                }
                None => {
                    let mut fresh = ProgressRecord::new(user_id, module_id, item_id);
                    f(&mut fresh)?;
                    Ok(store.insert(&fresh).await?.value)
                }
            }
        })
        .await
    }

    pub async fn update(&self, caller: &Caller, module_id: Uuid, item_id: Uuid, req: &ProgressReq) -> AppResult<ProgressRecord> {
        self.ensure_unlocked(caller, module_id, item_id).await?;
        let threshold = self.threshold;
        let record = self
            .mutate(caller.user_id, module_id, item_id, |r| {
                r.update_progress(req.current_time, req.total_duration, req.watch_time, threshold, Utc::now())
            })
            .await?;
        tracing::debug!(
            user_id = %caller.user_id,
            %item_id,
            watched = record.watched_percentage,
            completed = record.is_completed(),
            "progress recorded"
        );
        Ok(record)
    }

    pub async fn mark_complete(&self, caller: &Caller, module_id: Uuid, item_id: Uuid) -> AppResult<ProgressRecord> {
        self.ensure_unlocked(caller, module_id, item_id).await?;
        let record = self
            .mutate(caller.user_id, module_id, item_id, |r| {
                r.mark_complete(Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(user_id = %caller.user_id, %module_id, %item_id, "content item completed");
        Ok(record)
    }

    /// The caller's record, or an untouched one if nothing was written yet.
    pub async fn get(&self, caller: &Caller, module_id: Uuid, item_id: Uuid) -> AppResult<ProgressRecord> {
        self.locate(module_id, item_id).await?;
        Ok(self
            .storage
            .progress
            .get(caller.user_id, module_id, item_id)
            .await?
            .map(|v| v.value)
            .unwrap_or_else(|| ProgressRecord::new(caller.user_id, module_id, item_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ContentKind, UnlockCondition};
    use crate::services::testkit::{fixture_with, Fixture};

    fn item(kind: ContentKind, unlock_condition: UnlockCondition) -> ContentItem {
        ContentItem { id: Uuid::new_v4(), kind, unlock_condition }
    }

    fn watched(current_time: f64) -> ProgressReq {
        ProgressReq { current_time, total_duration: 100.0, watch_time: 10.0 }
    }

    fn course(config: Config) -> Fixture {
        fixture_with(
            vec![
                item(ContentKind::Video, UnlockCondition::None),
                item(ContentKind::Video, UnlockCondition::Sequential),
                item(ContentKind::Reading, UnlockCondition::Sequential),
                item(ContentKind::Video, UnlockCondition::Sequential),
            ],
            config,
        )
    }

    #[tokio::test]
    async fn sequential_video_waits_for_previous_completion() {
        let fx = course(Config::default());
        let svc = &fx.engine.progress;
        let (first, second) = (fx.items[0].id, fx.items[1].id);

        assert!(svc.check_unlock(&fx.student, fx.module, first).await.unwrap().is_unlocked);
        let locked = svc.check_unlock(&fx.student, fx.module, second).await.unwrap();
        assert!(!locked.is_unlocked);
        assert!(locked.message.is_some());
        assert!(matches!(
            svc.update(&fx.student, fx.module, second, &watched(5.0)).await,
            Err(AppError::Forbidden(_))
        ));

        svc.update(&fx.student, fx.module, first, &watched(50.0)).await.unwrap();
        assert!(!svc.check_unlock(&fx.student, fx.module, second).await.unwrap().is_unlocked);

        let done = svc.update(&fx.student, fx.module, first, &watched(95.0)).await.unwrap();
        assert!(done.is_completed());
        assert_eq!(done.total_watch_time, 20.0);
        assert!(svc.check_unlock(&fx.student, fx.module, second).await.unwrap().is_unlocked);

        // other users are unaffected
        assert!(!svc.check_unlock(&fx.outsider, fx.module, second).await.unwrap().is_unlocked);
    }

    #[tokio::test]
    async fn non_video_predecessor_is_auto_satisfied_by_default() {
        let fx = course(Config::default());
        let svc = &fx.engine.progress;
        assert!(svc.check_unlock(&fx.student, fx.module, fx.items[3].id).await.unwrap().is_unlocked);
    }

    #[tokio::test]
    async fn policy_can_require_records_for_other_kinds() {
        let config = Config {
            unlock_policy: UnlockPolicy::requiring([ContentKind::Reading]),
            ..Config::default()
        };
        let fx = course(config);
        let svc = &fx.engine.progress;
        let (reading, after) = (fx.items[2].id, fx.items[3].id);

        assert!(!svc.check_unlock(&fx.student, fx.module, after).await.unwrap().is_unlocked);
        svc.mark_complete(&fx.student, fx.module, fx.items[0].id).await.unwrap();
        svc.mark_complete(&fx.student, fx.module, fx.items[1].id).await.unwrap();
        svc.mark_complete(&fx.student, fx.module, reading).await.unwrap();
        assert!(svc.check_unlock(&fx.student, fx.module, after).await.unwrap().is_unlocked);
    }

    #[tokio::test]
    async fn completion_survives_rewinding() {
        let fx = course(Config::default());
        let svc = &fx.engine.progress;
        let first = fx.items[0].id;

        svc.mark_complete(&fx.student, fx.module, first).await.unwrap();
        let rewound = svc.update(&fx.student, fx.module, first, &watched(3.0)).await.unwrap();
        assert_eq!(rewound.watched_percentage, 3);
        assert!(rewound.is_completed());
        assert!(svc.get(&fx.student, fx.module, first).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn unknown_module_or_item_is_not_found() {
        let fx = course(Config::default());
        let svc = &fx.engine.progress;
        assert!(matches!(
            svc.check_unlock(&fx.student, Uuid::new_v4(), fx.items[0].id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            svc.get(&fx.student, fx.module, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_duration_is_rejected_and_nothing_is_stored() {
        let fx = course(Config::default());
        let svc = &fx.engine.progress;
        let first = fx.items[0].id;
        let bad = ProgressReq { current_time: 1.0, total_duration: 0.0, watch_time: 0.0 };
        assert!(matches!(
            svc.update(&fx.student, fx.module, first, &bad).await,
            Err(AppError::Validation(_))
        ));
        let untouched = svc.get(&fx.student, fx.module, first).await.unwrap();
        assert_eq!(untouched.last_watched_at, None);
    }
}
