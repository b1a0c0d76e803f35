use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{retry_on_conflict, Collaborators, GradebookService, QuizService};
use crate::attempt::{AttemptStatus, AttemptView, QuizAttempt, RawAnswer};
use crate::auth::Caller;
use crate::config::Config;
use crate::error::{AppError, AppResult, StoreError};
use crate::gradebook::{GradeItemInput, ItemStatus, ItemType};
use crate::models::{GradeEssayReq, StartResp, SweepReport};
use crate::store::{Storage, Versioned};

#[derive(Clone)]
pub struct AttemptService {
    storage: Storage,
    collab: Collaborators,
    gradebook: GradebookService,
    quizzes: QuizService,
    retries: u32,
    grace: Duration,
    abandon_after: Option<Duration>,
}

impl AttemptService {
    pub fn new(
        storage: Storage,
        collab: Collaborators,
        gradebook: GradebookService,
        quizzes: QuizService,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            collab,
            gradebook,
            quizzes,
            retries: config.max_write_retries,
            grace: Duration::seconds(config.timeout_grace_secs.max(0)),
            abandon_after: config.abandon_after_hours.map(Duration::hours),
        }
    }

    async fn load(&self, id: Uuid) -> AppResult<Versioned<QuizAttempt>> {
        self.storage
            .attempts
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found("attempt"))
    }

    /// Start a new attempt, or hand back the one already running.
    pub async fn start(&self, caller: &Caller, quiz_id: Uuid) -> AppResult<StartResp> {
        let quiz = self.quizzes.load(quiz_id).await?.value;
        self.collab.ensure_enrolled(caller, quiz.course_id).await?;
        let now = Utc::now();
        if !quiz.is_available(now) {
            return Err(AppError::QuizUnavailable);
        }

        let attempts = &self.storage.attempts;
        if let Some(running) = attempts.find_in_progress(quiz_id, caller.user_id).await? {
            return Ok(StartResp { attempt: running.value.view(false), resumed: true });
        }

        let completed = attempts.count_completed(quiz_id, caller.user_id).await?;
        if completed >= quiz.max_attempts && !quiz.allow_retake {
            return Err(AppError::AttemptLimit { max: quiz.max_attempts });
        }

        let attempt = QuizAttempt::start(&quiz, caller.user_id, completed + 1, now);
        match attempts.insert(&attempt).await {
            Ok(stored) => {
                tracing::info!(
                    attempt_id = %attempt.id,
                    %quiz_id,
                    student_id = %caller.user_id,
                    attempt_number = attempt.attempt_number,
                    "attempt started"
                );
                Ok(StartResp { attempt: stored.value.view(false), resumed: false })
            }
            // another request for the same student won the insert
            Err(StoreError::Conflict) => {
                let winner = attempts
                    .find_in_progress(quiz_id, caller.user_id)
                    .await?
                    .ok_or_else(|| AppError::Consistency("attempt".into()))?;
                Ok(StartResp { attempt: winner.value.view(false), resumed: true })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> AppResult<QuizAttempt>
    where
        F: Fn(&mut QuizAttempt) -> AppResult<()>,
    {
        let f = &f;
        retry_on_conflict("attempt", self.retries, || async move {
            let current = self.load(id).await?;
            let mut next = current.value;
            f(&mut next)?;
            self.storage.attempts.update(&next, current.version).await?;
            Ok(next)
        })
        .await
    }

    pub async fn submit(&self, caller: &Caller, attempt_id: Uuid, answers: &[RawAnswer]) -> AppResult<AttemptView> {
        let owner = self.load(attempt_id).await?.value.student_id;
        if owner != caller.user_id {
            return Err(AppError::Forbidden("only the student who started the attempt may submit it".into()));
        }

        let mut attempt = self.mutate(attempt_id, |a| a.submit(answers, Utc::now())).await?;
        tracing::info!(
            %attempt_id,
            student_id = %attempt.student_id,
            score = attempt.score,
            needs_manual_grading = attempt.needs_manual_grading,
            "attempt submitted"
        );

        if attempt.needs_gradebook_sync() {
            attempt = self.sync_or_defer(attempt, None).await;
        }
        let quiz = self.quizzes.load(attempt.quiz_id).await?.value;
        Ok(attempt.view(quiz.reveals_answers(Utc::now())))
    }

    pub async fn grade_essay(&self, caller: &Caller, attempt_id: Uuid, req: &GradeEssayReq) -> AppResult<AttemptView> {
        let course_id = self.load(attempt_id).await?.value.course_id;
        self.collab.ensure_instructor(caller, course_id).await?;

        let grader = caller.user_id;
        let mut attempt = self
            .mutate(attempt_id, |a| {
                a.grade_essay(req.question_id, req.points_awarded, req.feedback.clone(), grader, Utc::now())
            })
            .await?;
        tracing::info!(
            %attempt_id,
            question_id = %req.question_id,
            fully_graded = attempt.fully_graded,
            "essay graded"
        );

        // re-grades after the first sync update the same gradebook row
        if attempt.needs_gradebook_sync() {
            attempt = self.sync_or_defer(attempt, Some(grader)).await;
        }
        Ok(attempt.view(true))
    }

    /// Owner or course instructor. Students see solutions only when the
    /// quiz's answer visibility allows it.
    pub async fn view(&self, caller: &Caller, attempt_id: Uuid) -> AppResult<AttemptView> {
        let attempt = self.load(attempt_id).await?.value;
        if self.collab.is_instructor(caller, attempt.course_id).await? {
            return Ok(attempt.view(true));
        }
        if attempt.student_id != caller.user_id {
            return Err(AppError::Forbidden("this attempt belongs to another student".into()));
        }
        let quiz = self.quizzes.load(attempt.quiz_id).await?.value;
        Ok(attempt.view(quiz.reveals_answers(Utc::now())))
    }

    pub async fn my_attempts(&self, caller: &Caller, quiz_id: Uuid) -> AppResult<Vec<AttemptView>> {
        let quiz = self.quizzes.load(quiz_id).await?.value;
        let reveal = quiz.reveals_answers(Utc::now());
        let attempts = self.storage.attempts.list_for_student(quiz_id, caller.user_id).await?;
        Ok(attempts.iter().map(|a| a.view(reveal)).collect())
    }

    /// The score change is already committed with `sync_pending` set, so a
    /// failed sync is logged and left for the sweep instead of failing the
    /// request.
    async fn sync_or_defer(&self, attempt: QuizAttempt, graded_by: Option<Uuid>) -> QuizAttempt {
        match self.sync_gradebook(attempt.id, graded_by).await {
            Ok(synced) => synced,
            Err(e) => {
                tracing::error!(attempt_id = %attempt.id, error = %e, "gradebook sync failed, left pending");
                attempt
            }
        }
    }

    /// Upsert the quiz row of the student's gradebook from the latest stored
    /// state of a fully graded attempt and clear its pending flag.
    ///
    /// The flag is cleared with a version-checked write. If the attempt was
    /// re-graded after it was read, the write conflicts and the newer score is
    /// pushed again, so the last gradebook write always carries the score the
    /// attempt ends up with.
    pub async fn sync_gradebook(&self, attempt_id: Uuid, graded_by: Option<Uuid>) -> AppResult<QuizAttempt> {
        let mut pushed = false;
        for round in 1..=self.retries.max(1) {
            let current = self.load(attempt_id).await?;
            let mut attempt = current.value;
            if attempt.status != AttemptStatus::Completed || !attempt.fully_graded {
                return Err(AppError::InvalidState("only fully graded attempts reach the gradebook".into()));
            }
            if !pushed && !attempt.sync_pending {
                return Ok(attempt);
            }

            let item_id = self.push_score(&attempt, graded_by).await?;
            pushed = true;
            attempt.mark_synced(item_id);
            match self.storage.attempts.update(&attempt, current.version).await {
                Ok(_) => {
                    tracing::info!(%attempt_id, grade_item_id = %item_id, score = attempt.score, "attempt synced to gradebook");
                    return Ok(attempt);
                }
                Err(StoreError::Conflict) => {
                    tracing::warn!(%attempt_id, round, "attempt changed during gradebook sync, pushing again");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Consistency("attempt gradebook sync".into()))
    }

    async fn push_score(&self, attempt: &QuizAttempt, graded_by: Option<Uuid>) -> AppResult<Uuid> {
        let title = match self.storage.quizzes.get(attempt.quiz_id).await? {
            Some(quiz) => quiz.value.title,
            None => format!("Quiz {}", attempt.quiz_id),
        };
        let input = GradeItemInput {
            item_type: Some(ItemType::Quiz),
            item_id: Some(attempt.quiz_id),
            item_name: title,
            max_points: Some(attempt.total_points),
            earned_points: attempt.score,
            status: Some(ItemStatus::Graded),
            submitted_at: attempt.completed_at,
            ..Default::default()
        };
        let (_, item_id) = self
            .gradebook
            .upsert_item(attempt.student_id, attempt.course_id, &input, graded_by)
            .await?;
        Ok(item_id)
    }

    /// Terminate live attempts that ran past their deadline (plus grace) or,
    /// when untimed, were left open longer than the abandon window.
    pub async fn expire_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) -> AppResult<()> {
        for Versioned { value: mut attempt, version } in self.storage.attempts.list_in_progress().await? {
            let target = match attempt.deadline {
                Some(deadline) if deadline + self.grace < now => AttemptStatus::TimedOut,
                None if self
                    .abandon_after
                    .is_some_and(|window| attempt.started_at + window < now) =>
                {
                    AttemptStatus::Abandoned
                }
                _ => continue,
            };
            attempt.expire(target, now)?;
            match self.storage.attempts.update(&attempt, version).await {
                Ok(_) => {
                    tracing::info!(attempt_id = %attempt.id, status = target.as_str(), "attempt expired");
                    match target {
                        AttemptStatus::TimedOut => report.timed_out += 1,
                        _ => report.abandoned += 1,
                    }
                }
                // submitted or expired by someone else meanwhile
                Err(StoreError::Conflict) => {
                    tracing::debug!(attempt_id = %attempt.id, "attempt changed during sweep, skipped");
                }
                Err(e) => {
                    tracing::error!(attempt_id = %attempt.id, error = %e, "failed to expire attempt");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Push every fully graded attempt whose latest score has not reached
    /// the gradebook.
    pub async fn resync_pending(&self, report: &mut SweepReport) -> AppResult<()> {
        for pending in self.storage.attempts.list_pending_sync().await? {
            match self.sync_gradebook(pending.value.id, None).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    tracing::error!(attempt_id = %pending.value.id, error = %e, "gradebook resync failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let mut report = SweepReport::default();
        self.expire_stale(now, &mut report).await?;
        self.resync_pending(&mut report).await?;
        Ok(report)
    }
}
