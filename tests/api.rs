use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use lms_assessment::{
    collaborators::{BroadcastNotifier, CourseRecord, DirectoryFile, ModuleRecord, StaticDirectory},
    config::Config,
    progress::{ContentItem, ContentKind, UnlockCondition},
    services::{Collaborators, Engine},
    store::Storage,
};

struct Harness {
    app: Router,
    course: Uuid,
    module: Uuid,
    items: Vec<Uuid>,
    teacher: Uuid,
    student: Uuid,
}

fn harness() -> Harness {
    let course = Uuid::new_v4();
    let module = Uuid::new_v4();
    let teacher = Uuid::new_v4();
    let student = Uuid::new_v4();
    let items = vec![
        ContentItem { id: Uuid::new_v4(), kind: ContentKind::Video, unlock_condition: UnlockCondition::None },
        ContentItem { id: Uuid::new_v4(), kind: ContentKind::Video, unlock_condition: UnlockCondition::Sequential },
    ];
    let directory = StaticDirectory::from(DirectoryFile {
        courses: vec![CourseRecord { id: course, instructors: vec![teacher], students: vec![student] }],
        modules: vec![ModuleRecord { id: module, items: items.clone() }],
    });
    let collab = Collaborators::from_directory(Arc::new(directory), Arc::new(BroadcastNotifier::new(16)));
    let engine = Engine::new(Config::default(), Storage::in_memory(), collab);
    Harness {
        app: lms_assessment::app(engine),
        course,
        module,
        items: items.iter().map(|i| i.id).collect(),
        teacher,
        student,
    }
}

async fn call(app: &Router, method: &str, uri: &str, who: Option<(Uuid, &str)>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some((id, role)) = who {
        req = req.header("x-user-id", id.to_string()).header("x-user-role", role);
    }
    let req = match body {
        Some(b) => req
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

fn quiz_body(course: Uuid) -> Value {
    json!({
        "courseId": course,
        "title": "Ownership basics",
        "passingScore": 60,
        "questions": [{
            "type": "multiple_choice",
            "order": 1,
            "points": 10,
            "prompt": "Which one moves?",
            "explanation": "String is not Copy",
            "options": [
                { "text": "A", "isCorrect": false },
                { "text": "B", "isCorrect": true },
                { "text": "C", "isCorrect": false }
            ]
        }]
    })
}

#[tokio::test]
async fn health_uses_the_envelope() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", &format!("/grades/my-grades/{}", h.course), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn malformed_body_gets_the_error_envelope() {
    let h = harness();
    let (status, body) = call(&h.app, "POST", "/grades/item", Some((h.teacher, "teacher")), Some(json!({ "nope": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn quiz_flow_from_authoring_to_gradebook() {
    let h = harness();
    let teacher = Some((h.teacher, "teacher"));
    let student = Some((h.student, "student"));

    let (status, _) = call(&h.app, "POST", "/quizzes", student, Some(quiz_body(h.course))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&h.app, "POST", "/quizzes", teacher, Some(quiz_body(h.course))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["totalPoints"], 10.0);
    let quiz_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = call(&h.app, "POST", &format!("/quizzes/{quiz_id}/start"), student, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&h.app, "POST", &format!("/quizzes/{quiz_id}/publish"), teacher, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&h.app, "GET", &format!("/quizzes/{quiz_id}"), student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].get("questions").is_none());

    let (status, body) = call(&h.app, "POST", &format!("/quizzes/{quiz_id}/start"), student, None).await;
    assert_eq!(status, StatusCode::OK);
    let attempt = &body["data"]["attempt"];
    assert!(!attempt.to_string().contains("isCorrect"));
    let attempt_id = attempt["id"].as_str().unwrap().to_string();
    let question_id = attempt["questions"][0]["id"].clone();

    let submit = json!({ "answers": [{ "questionId": question_id, "answer": "B" }] });
    let (status, body) = call(&h.app, "POST", &format!("/attempts/{attempt_id}/submit"), student, Some(submit.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["score"], 10.0);
    assert_eq!(body["data"]["percentage"], 100.0);
    assert_eq!(body["data"]["passed"], true);

    let (status, _) = call(&h.app, "POST", &format!("/attempts/{attempt_id}/submit"), student, Some(submit)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&h.app, "POST", &format!("/quizzes/{quiz_id}/start"), student, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&h.app, "GET", &format!("/grades/my-grades/{}", h.course), student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["currentGrade"], 100);
    assert_eq!(body["data"]["letterGrade"], "A");
    assert_eq!(body["data"]["status"], "passing");
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);

    let (status, body) = call(&h.app, "DELETE", &format!("/quizzes/{quiz_id}"), teacher, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "archived");
}

#[tokio::test]
async fn unknown_attempt_is_not_found() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", &format!("/attempts/{}", Uuid::new_v4()), Some((h.student, "student")), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn instructor_grade_entry_and_bulk_import() {
    let h = harness();
    let teacher = Some((h.teacher, "instructor"));
    let item = json!({
        "studentId": h.student,
        "courseId": h.course,
        "itemType": "assignment",
        "itemId": Uuid::new_v4(),
        "itemName": "Lab 1",
        "maxPoints": 20,
        "earnedPoints": 15
    });
    let (status, body) = call(&h.app, "POST", "/grades/item", teacher, Some(item)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["currentGrade"], 75);

    let bulk = json!({
        "courseId": h.course,
        "grades": [
            { "studentId": h.student, "itemType": "manual", "itemName": "Participation", "maxPoints": 10, "earnedPoints": 10 },
            { "studentId": h.student, "itemType": "manual", "itemName": "Broken", "maxPoints": 0 }
        ]
    });
    let (status, body) = call(&h.app, "POST", "/grades/bulk", teacher, Some(bulk)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["succeeded"], 1);
    assert_eq!(body["data"]["failed"], 1);

    let (status, body) = call(&h.app, "GET", &format!("/grades/course/{}", h.course), teacher, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["items"].as_array().unwrap().len(), 2);

    let (status, _) = call(&h.app, "GET", &format!("/grades/course/{}", h.course), Some((h.student, "student")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn sequential_video_unlocks_after_completion() {
    let h = harness();
    let student = Some((h.student, "student"));
    let (first, second) = (h.items[0], h.items[1]);
    let unlock_uri = format!("/video-progress/check-unlock/{}/{second}", h.module);

    let (status, body) = call(&h.app, "GET", &unlock_uri, student, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["isUnlocked"], false);

    let progress = json!({ "currentTime": 5, "totalDuration": 100 });
    let (status, _) = call(&h.app, "POST", &format!("/video-progress/{}/{second}", h.module), student, Some(progress)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let progress = json!({ "currentTime": 92, "totalDuration": 100, "watchTime": 92 });
    let (status, body) = call(&h.app, "POST", &format!("/video-progress/{}/{first}", h.module), student, Some(progress)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["isCompleted"], true);
    assert_eq!(body["data"]["watchedPercentage"], 92);

    let (_, body) = call(&h.app, "GET", &unlock_uri, student, None).await;
    assert_eq!(body["data"]["isUnlocked"], true);
    assert!(body["data"].get("message").is_none());

    let bad = json!({ "currentTime": 1, "totalDuration": 0 });
    let (status, _) = call(&h.app, "POST", &format!("/video-progress/{}/{first}", h.module), student, Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bad_path_id_is_a_validation_error() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", "/attempts/not-a-uuid", Some((h.student, "student")), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}
