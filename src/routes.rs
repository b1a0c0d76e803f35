use axum::{
    extract::{FromRequest, FromRequestParts, State},
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::{
    attempt::AttemptView,
    auth::Caller,
    error::{AppError, AppResult},
    gradebook::GradebookEntry,
    models::*,
    progress::{ProgressRecord, UnlockStatus},
    quiz::{QuizDefinition, QuizDraft},
    response::{ok, ApiResponse},
    services::Engine,
};

/// `axum::Json` whose rejection renders as the error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `axum::extract::Path` whose rejection renders as the error envelope.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

type Reply<T> = AppResult<ApiResponse<T>>;

pub fn router(engine: Engine) -> Router {
    Router::new()
        // quiz authoring
        .route("/quizzes", post(create_quiz))
        .route("/quizzes/:id", get(get_quiz).put(update_quiz).delete(delete_quiz))
        .route("/quizzes/:id/publish", post(publish_quiz))
        .route("/quizzes/:id/archive", post(archive_quiz))
        // attempts
        .route("/quizzes/:id/start", post(start_attempt))
        .route("/quizzes/:id/my-attempts", get(my_attempts))
        .route("/attempts/:id", get(get_attempt))
        .route("/attempts/:id/submit", post(submit_attempt))
        .route("/attempts/:id/grade-essay", post(grade_essay))
        // gradebook
        .route("/grades/my-grades/:course_id", get(my_grades))
        .route("/grades/course/:course_id", get(course_grades))
        .route("/grades/course/:course_id/recalculate", post(recalculate_course))
        .route("/grades/student/:student_id/:course_id", get(student_grades))
        .route("/grades/item", post(record_item))
        .route("/grades/bulk", post(bulk_grades))
        // content progress
        .route("/video-progress/check-unlock/:module_id/:item_id", get(check_unlock))
        .route("/video-progress/:module_id/:item_id", get(get_progress).post(update_progress))
        .route("/video-progress/:module_id/:item_id/complete", post(complete_item))
        .with_state(engine)
}

async fn create_quiz(State(engine): State<Engine>, caller: Caller, ApiJson(draft): ApiJson<QuizDraft>) -> Reply<QuizDefinition> {
    let quiz = engine.quizzes.create(&caller, draft).await?;
    Ok(ok(quiz, "Quiz created"))
}

async fn get_quiz(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<QuizView> {
    Ok(ok(engine.quizzes.get_for(&caller, id).await?, "Quiz retrieved"))
}

async fn update_quiz(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(draft): ApiJson<QuizDraft>,
) -> Reply<QuizDefinition> {
    Ok(ok(engine.quizzes.update(&caller, id, draft).await?, "Quiz updated"))
}

async fn delete_quiz(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<DeleteOutcome> {
    let outcome = engine.quizzes.delete(&caller, id).await?;
    let message = match outcome {
        DeleteOutcome::Deleted => "Quiz deleted",
        DeleteOutcome::Archived => "Quiz has attempts and was archived instead",
    };
    Ok(ok(outcome, message))
}

async fn publish_quiz(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<QuizDefinition> {
    Ok(ok(engine.quizzes.publish(&caller, id).await?, "Quiz published"))
}

async fn archive_quiz(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<QuizDefinition> {
    Ok(ok(engine.quizzes.archive(&caller, id).await?, "Quiz archived"))
}

async fn start_attempt(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<StartResp> {
    let started = engine.attempts.start(&caller, id).await?;
    let message = if started.resumed { "Attempt resumed" } else { "Attempt started" };
    Ok(ok(started, message))
}

async fn my_attempts(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<Vec<AttemptView>> {
    Ok(ok(engine.attempts.my_attempts(&caller, id).await?, "Attempts retrieved"))
}

async fn get_attempt(State(engine): State<Engine>, caller: Caller, ApiPath(id): ApiPath<Uuid>) -> Reply<AttemptView> {
    Ok(ok(engine.attempts.view(&caller, id).await?, "Attempt retrieved"))
}

async fn submit_attempt(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SubmitReq>,
) -> Reply<AttemptView> {
    let view = engine.attempts.submit(&caller, id, &req.answers).await?;
    let message = if view.needs_manual_grading {
        "Quiz submitted, awaiting manual grading"
    } else {
        "Quiz submitted"
    };
    Ok(ok(view, message))
}

async fn grade_essay(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<GradeEssayReq>,
) -> Reply<AttemptView> {
    Ok(ok(engine.attempts.grade_essay(&caller, id, &req).await?, "Essay graded"))
}

async fn my_grades(State(engine): State<Engine>, caller: Caller, ApiPath(course_id): ApiPath<Uuid>) -> Reply<GradebookEntry> {
    Ok(ok(engine.gradebook.my_grades(&caller, course_id).await?, "Grades retrieved"))
}

async fn course_grades(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath(course_id): ApiPath<Uuid>,
) -> Reply<Vec<GradebookEntry>> {
    Ok(ok(engine.gradebook.course_gradebook(&caller, course_id).await?, "Course gradebook retrieved"))
}

async fn student_grades(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath((student_id, course_id)): ApiPath<(Uuid, Uuid)>,
) -> Reply<GradebookEntry> {
    Ok(ok(
        engine.gradebook.student_grades(&caller, student_id, course_id).await?,
        "Grades retrieved",
    ))
}

async fn record_item(State(engine): State<Engine>, caller: Caller, ApiJson(req): ApiJson<GradeItemReq>) -> Reply<GradebookEntry> {
    Ok(ok(engine.gradebook.record_item(&caller, &req).await?, "Grade recorded"))
}

async fn bulk_grades(State(engine): State<Engine>, caller: Caller, ApiJson(req): ApiJson<BulkGradeReq>) -> Reply<BulkReport> {
    let report = engine.gradebook.bulk_import(&caller, &req).await?;
    let message = format!("{} grades recorded, {} failed", report.succeeded, report.failed);
    Ok(ok(report, message))
}

async fn recalculate_course(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath(course_id): ApiPath<Uuid>,
) -> Reply<BulkReport> {
    let report = engine.gradebook.recalculate_course(&caller, course_id).await?;
    let message = format!("{} entries recalculated", report.succeeded);
    Ok(ok(report, message))
}

async fn update_progress(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath((module_id, item_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(req): ApiJson<ProgressReq>,
) -> Reply<ProgressRecord> {
    Ok(ok(engine.progress.update(&caller, module_id, item_id, &req).await?, "Progress saved"))
}

async fn complete_item(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath((module_id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Reply<ProgressRecord> {
    Ok(ok(engine.progress.mark_complete(&caller, module_id, item_id).await?, "Marked as complete"))
}

async fn get_progress(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath((module_id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Reply<ProgressRecord> {
    Ok(ok(engine.progress.get(&caller, module_id, item_id).await?, "Progress retrieved"))
}

async fn check_unlock(
    State(engine): State<Engine>,
    caller: Caller,
    ApiPath((module_id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Reply<UnlockStatus> {
    Ok(ok(engine.progress.check_unlock(&caller, module_id, item_id).await?, "Unlock status retrieved"))
}
