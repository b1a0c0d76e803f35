//! Request-level operations: authorization, retry-on-conflict and the flows
//! that cross aggregates (attempt grading feeding the gradebook).

use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{Caller, Role};
use crate::collaborators::{AccessControl, ContentCatalog, Enrollment, Notifier, StaticDirectory};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::store::Storage;

pub mod attempts;
pub mod gradebook;
pub mod progress;
pub mod quizzes;

pub use attempts::AttemptService;
pub use gradebook::GradebookService;
pub use progress::ProgressService;
pub use quizzes::QuizService;

/// Handles to everything outside the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub access: Arc<dyn AccessControl>,
    pub enrollment: Arc<dyn Enrollment>,
    pub catalog: Arc<dyn ContentCatalog>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn from_directory(directory: Arc<StaticDirectory>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            access: directory.clone(),
            enrollment: directory.clone(),
            catalog: directory,
            notifier,
        }
    }

    /// Course instructors and admins pass; everyone else is refused.
    pub async fn ensure_instructor(&self, caller: &Caller, course_id: Uuid) -> AppResult<()> {
        if caller.is_admin() {
            return Ok(());
        }
        if caller.role == Role::Teacher && self.access.is_course_instructor(caller.user_id, course_id).await? {
            return Ok(());
        }
        Err(AppError::Forbidden("only the course instructor or an admin may do this".into()))
    }

    /// Like [`Self::ensure_instructor`], but a refusal is `false`. Collaborator
    /// failures still surface as errors.
    pub async fn is_instructor(&self, caller: &Caller, course_id: Uuid) -> AppResult<bool> {
        match self.ensure_instructor(caller, course_id).await {
            Ok(()) => Ok(true),
            Err(AppError::Forbidden(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn ensure_course(&self, course_id: Uuid) -> AppResult<()> {
        if self.enrollment.course_exists(course_id).await? {
            Ok(())
        } else {
            Err(AppError::not_found("course"))
        }
    }

    pub async fn ensure_enrolled(&self, caller: &Caller, course_id: Uuid) -> AppResult<()> {
        if self.enrollment.is_enrolled(caller.user_id, course_id).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden("you are not enrolled in this course".into()))
        }
    }
}

/// Everything a request handler needs.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub collab: Collaborators,
    pub gradebook: GradebookService,
    pub quizzes: QuizService,
    pub attempts: AttemptService,
    pub progress: ProgressService,
}

impl Engine {
    pub fn new(config: Config, storage: Storage, collab: Collaborators) -> Self {
        let config = Arc::new(config);
        let gradebook = GradebookService::new(storage.clone(), collab.clone(), &config);
        let quizzes = QuizService::new(storage.clone(), collab.clone(), &config);
        let attempts = AttemptService::new(storage.clone(), collab.clone(), gradebook.clone(), quizzes.clone(), &config);
        let progress = ProgressService::new(storage, collab.clone(), &config);
        Self {
            config,
            collab,
            gradebook,
            quizzes,
            attempts,
            progress,
        }
    }
}

/// Run a read-modify-write `op` until it stops losing version races, at most
/// `limit` times.
pub(crate) async fn retry_on_conflict<T, F, Fut>(what: &str, limit: u32, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    for attempt in 1..=limit.max(1) {
        match op().await {
            Err(e) if e.is_conflict() => {
                tracing::warn!(what, attempt, "write conflict, retrying");
            }
            other => return other,
        }
    }
    Err(AppError::Consistency(what.to_string()))
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::collaborators::{BroadcastNotifier, CourseRecord, DirectoryFile, ModuleRecord};
    use crate::progress::ContentItem;

    pub struct Fixture {
        pub engine: Engine,
        pub notifier: BroadcastNotifier,
        pub course: Uuid,
        pub module: Uuid,
        pub items: Vec<ContentItem>,
        pub teacher: Caller,
        pub student: Caller,
        pub outsider: Caller,
    }

    pub fn fixture_with(items: Vec<ContentItem>, config: Config) -> Fixture {
        fixture_on(items, config, Storage::in_memory())
    }

    pub fn fixture_on(items: Vec<ContentItem>, config: Config, storage: Storage) -> Fixture {
        let course = Uuid::new_v4();
        let module = Uuid::new_v4();
        let teacher = Caller::new(Uuid::new_v4(), Role::Teacher);
        let student = Caller::new(Uuid::new_v4(), Role::Student);
        let outsider = Caller::new(Uuid::new_v4(), Role::Student);
        let directory = StaticDirectory::from(DirectoryFile {
            courses: vec![CourseRecord {
                id: course,
                instructors: vec![teacher.user_id],
                students: vec![student.user_id],
            }],
            modules: vec![ModuleRecord { id: module, items: items.clone() }],
        });
        let notifier = BroadcastNotifier::new(64);
        let collab = Collaborators::from_directory(Arc::new(directory), Arc::new(notifier.clone()));
        Fixture {
            engine: Engine::new(config, storage, collab),
            notifier,
            course,
            module,
            items,
            teacher,
            student,
            outsider,
        }
    }

    pub fn fixture() -> Fixture {
        fixture_with(Vec::new(), Config::default())
    }
}
