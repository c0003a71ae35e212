mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{PASSWORD, TestApp};

async fn call(
    app: &TestApp,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_direct(app: &TestApp, from: &str, to: &str) -> (StatusCode, Value) {
    call(
        app,
        Method::POST,
        "/conversations",
        Some(&app.token(from)),
        Some(json!({"type": "direct", "participantIds": [app.id(to)]})),
    )
    .await
}

#[tokio::test]
async fn protected_routes_require_a_valid_token() {
    let app = TestApp::new();

    let (status, body) = call(&app, Method::GET, "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");

    let (status, _) = call(&app, Method::GET, "/recipients", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_issues_a_usable_token() {
    let app = TestApp::new();

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({"username": "tom", "password": PASSWORD})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userId"], app.id("tom").to_string());
    assert_eq!(body["role"], "teacher");

    let token = body["token"].as_str().unwrap().to_string();
    let (status, _) = call(&app, Method::GET, "/recipients", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({"username": "tom", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn recipients_follow_enrollment() {
    let app = TestApp::new();
    let (status, body) = call(&app, Method::GET, "/recipients", Some(&app.token("sue")), None).await;
    assert_eq!(status, StatusCode::OK);

    let names = |bucket: &str| -> Vec<String> {
        body[bucket]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap().to_string())
            .collect()
    };
    assert_eq!(names("teachers"), vec!["tom"]);
    assert_eq!(names("classmates"), vec!["sam"]);
    assert!(names("admins").is_empty());
    assert!(names("students").is_empty());
}

#[tokio::test]
async fn teacher_recipients_list_enrolled_students_separately() {
    let app = TestApp::new();
    let (status, body) = call(&app, Method::GET, "/recipients", Some(&app.token("tom")), None).await;
    assert_eq!(status, StatusCode::OK);

    let names = |bucket: &str| -> Vec<String> {
        body[bucket]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap().to_string())
            .collect()
    };
    // zed is not enrolled in Algebra.
    assert_eq!(names("students"), vec!["sam", "sue"]);
    assert!(names("classmates").is_empty());
    assert!(names("teachers").is_empty());
}

#[tokio::test]
async fn conversation_and_message_flow() {
    let app = TestApp::new();

    let (status, conv) = create_direct(&app, "sue", "tom").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conv["type"], "direct");
    assert_eq!(conv["displayName"], "Tom");
    let conv_id = conv["id"].as_str().unwrap().to_string();

    // Same pair from the other side reuses the conversation.
    let (status, again) = create_direct(&app, "tom", "sue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], conv["id"]);

    let (status, msg) = call(
        &app,
        Method::POST,
        "/messages",
        Some(&app.token("sue")),
        Some(json!({"conversationId": conv_id, "content": "Is the quiz tomorrow?"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(msg["status"], "sent");
    assert_eq!(msg["messageType"], "text");
    assert_eq!(msg["readBy"].as_array().unwrap().len(), 1);

    let tom = app.token("tom");
    let (_, list) = call(&app, Method::GET, "/conversations", Some(&tom), None).await;
    assert_eq!(list[0]["unreadCount"], 1);
    assert_eq!(list[0]["lastMessage"]["content"], "Is the quiz tomorrow?");

    // Fetching is what marks the page read.
    let uri = format!("/conversations/{}/messages?page=1&limit=20", conv_id);
    let (status, page) = call(&app, Method::GET, &uri, Some(&tom), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["page"], 1);
    assert_eq!(page["limit"], 20);
    assert_eq!(page["hasMore"], false);
    let first = &page["messages"][0];
    assert_eq!(first["status"], "read");
    assert_eq!(first["readBy"].as_array().unwrap().len(), 2);

    let (_, list) = call(&app, Method::GET, "/conversations", Some(&tom), None).await;
    assert_eq!(list[0]["unreadCount"], 0);

    let read_uri = format!("/conversations/{}/read", conv_id);
    let (status, body) = call(&app, Method::POST, &read_uri, Some(&tom), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"updated": 0}));
}

#[tokio::test]
async fn whitespace_message_is_invalid_input() {
    let app = TestApp::new();
    let (_, conv) = create_direct(&app, "sue", "sam").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/messages",
        Some(&app.token("sue")),
        Some(json!({"conversationId": conv["id"], "content": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");

    let uri = format!("/conversations/{}/messages", conv["id"].as_str().unwrap());
    let (_, page) = call(&app, Method::GET, &uri, Some(&app.token("sam")), None).await;
    assert!(page["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn outsiders_are_forbidden_and_unknown_ids_not_found() {
    let app = TestApp::new();
    let (_, conv) = create_direct(&app, "sue", "tom").await;
    let conv_id = conv["id"].as_str().unwrap();
    let zed = app.token("zed");

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}/messages", conv_id),
        Some(&zed),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = call(&app, Method::GET, &format!("/conversations/{}", conv_id), Some(&zed), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // zed shares no class with sue.
    let (status, body) = create_direct(&app, "zed", "sue").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/conversations/{}/messages", missing),
        Some(&zed),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn class_conversation_and_deletion() {
    let app = TestApp::new();
    let class = app
        .state
        .db
        .get_class_section_by_name("Algebra")
        .unwrap()
        .unwrap();

    let (status, conv) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&app.token("sue")),
        Some(json!({"type": "class", "classId": class.id})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(conv["error"]["code"], "forbidden");

    let (status, conv) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&app.token("tom")),
        Some(json!({"type": "class", "classId": class.id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conv["displayName"], "Algebra");
    assert_eq!(conv["participants"].as_array().unwrap().len(), 3);

    let (_, msg) = call(
        &app,
        Method::POST,
        "/messages",
        Some(&app.token("tom")),
        Some(json!({"conversationId": conv["id"], "content": "Homework is posted"})),
    )
    .await;
    let msg_uri = format!("/messages/{}", msg["id"].as_str().unwrap());

    let (status, _) = call(&app, Method::DELETE, &msg_uri, Some(&app.token("sue")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, deleted) = call(&app, Method::DELETE, &msg_uri, Some(&app.token("tom")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["isDeleted"], true);

    let uri = format!("/conversations/{}/messages", conv["id"].as_str().unwrap());
    let (_, page) = call(&app, Method::GET, &uri, Some(&app.token("sam")), None).await;
    assert!(page["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn deactivated_conversation_drops_out_of_listing() {
    let app = TestApp::new();
    let (_, conv) = create_direct(&app, "sue", "sam").await;
    let uri = format!("/conversations/{}/deactivate", conv["id"].as_str().unwrap());

    let (status, body) = call(&app, Method::POST, &uri, Some(&app.token("sam")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], false);

    let (_, list) = call(&app, Method::GET, "/conversations", Some(&app.token("sue")), None).await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, fresh) = create_direct(&app, "sue", "sam").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(fresh["id"], conv["id"]);
}
