use chrono::Utc;
use uuid::Uuid;

use super::{retry_on_conflict, Collaborators};
use crate::auth::Caller;
use crate::config::Config;
use crate::error::{AppError, AppResult, StoreError};
use crate::models::{DeleteOutcome, QuizView};
use crate::quiz::{QuizDefinition, QuizDraft, QuizStatus};
use crate::store::{Storage, Versioned};

#[derive(Clone)]
pub struct QuizService {
    storage: Storage,
    collab: Collaborators,
    retries: u32,
}

impl QuizService {
    pub fn new(storage: Storage, collab: Collaborators, config: &Config) -> Self {
        Self {
            storage,
            collab,
            retries: config.max_write_retries,
        }
    }

    pub async fn load(&self, id: Uuid) -> AppResult<Versioned<QuizDefinition>> {
        self.storage
            .quizzes
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("quiz"))
    }

    pub async fn create(&self, caller: &Caller, draft: QuizDraft) -> AppResult<QuizDefinition> {
        let course_id = draft
            .course_id
            .ok_or_else(|| AppError::Validation("courseId is required".into()))?;
        self.collab.ensure_course(course_id).await?;
        self.collab.ensure_instructor(caller, course_id).await?;

        let quiz = QuizDefinition::create(course_id, draft, caller.user_id, Utc::now())?;
        let stored = self.storage.quizzes.insert(&quiz).await?;
        tracing::info!(quiz_id = %quiz.id, %course_id, questions = quiz.questions().len(), "quiz created");
        Ok(stored.value)
    }

    /// Instructors get the full definition. Enrolled students get the
    /// public summary of a published quiz and nothing else.
    pub async fn get_for(&self, caller: &Caller, id: Uuid) -> AppResult<QuizView> {
        let quiz = self.load(id).await?.value;
        if self.collab.is_instructor(caller, quiz.course_id).await? {
            return Ok(QuizView::Full(quiz));
        }
        self.collab.ensure_enrolled(caller, quiz.course_id).await?;
        if quiz.status != QuizStatus::Published {
            return Err(AppError::not_found("quiz"));
        }
        Ok(QuizView::Public(quiz.public_view()))
    }

    async fn mutate<F>(&self, caller: &Caller, id: Uuid, f: F) -> AppResult<QuizDefinition>
    where
        F: Fn(&mut QuizDefinition) -> AppResult<()>,
    {
        let f = &f;
        retry_on_conflict("quiz", self.retries, || async move {
            let current = self.load(id).await?;
            self.collab.ensure_instructor(caller, current.value.course_id).await?;
            let mut next = current.value;
            f(&mut next)?;
            self.storage.quizzes.update(&next, current.version).await?;
            Ok(next)
        })
        .await
    }

    pub async fn update(&self, caller: &Caller, id: Uuid, draft: QuizDraft) -> AppResult<QuizDefinition> {
        let draft = &draft;
        let quiz = self
            .mutate(caller, id, |quiz| {
                if draft.course_id.is_some_and(|c| c != quiz.course_id) {
                    return Err(AppError::Validation("a quiz cannot move to another course".into()));
                }
                quiz.apply(draft.clone(), Utc::now())
            })
            .await?;
        tracing::info!(quiz_id = %id, "quiz updated");
        Ok(quiz)
    }

    pub async fn publish(&self, caller: &Caller, id: Uuid) -> AppResult<QuizDefinition> {
        let quiz = self.mutate(caller, id, |quiz| quiz.publish(Utc::now())).await?;
        tracing::info!(quiz_id = %id, "quiz published");
        Ok(quiz)
    }

    pub async fn archive(&self, caller: &Caller, id: Uuid) -> AppResult<QuizDefinition> {
        let quiz = self
            .mutate(caller, id, |quiz| {
                quiz.archive(Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(quiz_id = %id, "quiz archived");
        Ok(quiz)
    }

    /// Hard delete when nobody has attempted the quiz, archive otherwise.
    pub async fn delete(&self, caller: &Caller, id: Uuid) -> AppResult<DeleteOutcome> {
        let quiz = self.load(id).await?.value;
        self.collab.ensure_instructor(caller, quiz.course_id).await?;

        if self.storage.attempts.count_for_quiz(id).await? == 0 {
            match self.storage.quizzes.delete_unattempted(id).await {
                Ok(()) => {
                    tracing::info!(quiz_id = %id, "quiz deleted");
                    return Ok(DeleteOutcome::Deleted);
                }
                // an attempt started in between
                Err(StoreError::Conflict) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.archive(caller, id).await?;
        Ok(DeleteOutcome::Archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::tests::{essay, mc};
    use crate::services::testkit::fixture;

    fn draft(course_id: Uuid) -> QuizDraft {
        QuizDraft {
            course_id: Some(course_id),
            title: "Unit 3 check".into(),
            questions: vec![mc(2.0, "4", &["3", "5"]), essay(3.0)],
            max_attempts: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn only_instructors_author() {
        let fx = fixture();
        let svc = &fx.engine.quizzes;
        let err = svc.create(&fx.student, draft(fx.course)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let quiz = svc.create(&fx.teacher, draft(fx.course)).await.unwrap();
        assert_eq!(quiz.total_points(), 5.0);
        assert_eq!(quiz.status, QuizStatus::Draft);
        assert!(svc.publish(&fx.student, quiz.id).await.is_err());
    }

    #[tokio::test]
    async fn update_recomputes_total_points() {
        let fx = fixture();
        let svc = &fx.engine.quizzes;
        let quiz = svc.create(&fx.teacher, draft(fx.course)).await.unwrap();

        let change = QuizDraft {
            questions: vec![mc(10.0, "yes", &["no"])],
            ..Default::default()
        };
        let updated = svc.update(&fx.teacher, quiz.id, change).await.unwrap();
        assert_eq!(updated.title, "Unit 3 check");
        assert_eq!(updated.total_points(), 10.0);

        let bad = QuizDraft {
            questions: vec![mc(0.0, "yes", &["no"])],
            ..Default::default()
        };
        assert!(matches!(svc.update(&fx.teacher, quiz.id, bad).await, Err(AppError::Validation(_))));
        assert_eq!(svc.load(quiz.id).await.unwrap().value.total_points(), 10.0);
    }

    #[tokio::test]
    async fn students_only_see_published_public_view() {
        let fx = fixture();
        let svc = &fx.engine.quizzes;
        let quiz = svc.create(&fx.teacher, draft(fx.course)).await.unwrap();

        assert!(matches!(svc.get_for(&fx.student, quiz.id).await, Err(AppError::NotFound(_))));
        svc.publish(&fx.teacher, quiz.id).await.unwrap();
        match svc.get_for(&fx.student, quiz.id).await.unwrap() {
            QuizView::Public(public) => assert_eq!(public.question_count, 2),
            QuizView::Full(_) => panic!("student received the full definition"),
        }
        assert!(matches!(svc.get_for(&fx.outsider, quiz.id).await, Err(AppError::Forbidden(_))));
        assert!(matches!(svc.get_for(&fx.teacher, quiz.id).await.unwrap(), QuizView::Full(_)));
    }

    #[tokio::test]
    async fn delete_without_attempts_is_hard() {
        let fx = fixture();
        let svc = &fx.engine.quizzes;
        let quiz = svc.create(&fx.teacher, draft(fx.course)).await.unwrap();
        assert_eq!(svc.delete(&fx.teacher, quiz.id).await.unwrap(), DeleteOutcome::Deleted);
        assert!(matches!(svc.load(quiz.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_with_attempts_archives() {
        let fx = fixture();
        let svc = &fx.engine.quizzes;
        let quiz = svc.create(&fx.teacher, draft(fx.course)).await.unwrap();
        svc.publish(&fx.teacher, quiz.id).await.unwrap();
        fx.engine.attempts.start(&fx.student, quiz.id).await.unwrap();

        assert_eq!(svc.delete(&fx.teacher, quiz.id).await.unwrap(), DeleteOutcome::Archived);
        let stored = svc.load(quiz.id).await.unwrap().value;
        assert_eq!(stored.status, QuizStatus::Archived);
        assert!(!stored.is_active);
        assert!(matches!(svc.publish(&fx.teacher, quiz.id).await, Err(AppError::InvalidState(_))));
    }
}
