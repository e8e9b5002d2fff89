#![cfg(feature = "inmem-store")]

use actix_web::body::MessageBody;
use actix_web::{test, web, App};
use nevermind::auth::create_jwt;
use nevermind::client::SseDecoder;
use nevermind::models::{NewUser, Notification};
use nevermind::repo::inmem::InMemRepo;
use nevermind::repo::UserRepo;
use nevermind::{config, AppState};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

const INGEST_TOKEN: &str = "matcher-shared-secret";

fn state(dir: &tempfile::TempDir, ingest: Option<&str>) -> web::Data<AppState> {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let repo = InMemRepo::at(dir.path().join("state.json"));
    let mut state = AppState::new(Arc::new(repo));
    if let Some(token) = ingest {
        state = state.with_ingest_token(token);
    }
    web::Data::new(state)
}

async fn register(state: &web::Data<AppState>, email: &str) -> Uuid {
    let user = NewUser { email: email.into(), password_hash: "h".into() };
    state.repo.create_user(user).await.unwrap().id
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

fn notification_for(recipient: Uuid) -> Value {
    json!({
        "recipient_user_id": recipient,
        "from_message_id": Uuid::new_v4(),
        "from_user_id": Uuid::new_v4(),
        "distance_km": 0.8,
        "similarity": 0.87,
        "preview": "Someone nearby wrote something similar"
    })
}

#[actix_web::test]
#[serial]
async fn ingest_is_disabled_without_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(state(&dir, None)).configure(config)).await;
    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", "anything"))
        .set_json(notification_for(Uuid::new_v4()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 503);
}

#[actix_web::test]
#[serial]
async fn ingest_checks_token_and_payload() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&dir, Some(INGEST_TOKEN));
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let recipient = register(&state, "ana@example.com").await;

    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .set_json(notification_for(recipient))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    // nobody to deliver to
    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(notification_for(Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "not found");

    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", "wrong"))
        .set_json(notification_for(recipient))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let mut negative = notification_for(recipient);
    negative["distance_km"] = json!(-1.0);
    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(negative)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(notification_for(recipient))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let row: Value = test::read_body_json(resp).await;
    assert_eq!(row["recipient_user_id"], recipient.to_string());
    assert!(row["read_at"].is_null());
}

#[actix_web::test]
#[serial]
async fn list_and_mark_read() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&dir, Some(INGEST_TOKEN));
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let recipient = register(&state, "ana@example.com").await;
    let me = create_jwt(recipient, "ana@example.com").unwrap();
    let stranger = create_jwt(Uuid::new_v4(), "bob@example.com").unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(notification_for(recipient))
        .to_request();
    let row: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let id = row["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get().uri("/api/v1/notifications?unread=true").insert_header(bearer(&me)).to_request();
    let unread: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(unread.as_array().unwrap().len(), 1);

    let req = test::TestRequest::get().uri("/api/v1/notifications").insert_header(bearer(&stranger)).to_request();
    let theirs: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert!(theirs.as_array().unwrap().is_empty());

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{id}/read"))
        .insert_header(bearer(&stranger))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/{id}/read"))
        .insert_header(bearer(&me))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let read: Value = test::read_body_json(resp).await;
    assert!(read["read_at"].is_string());

    let req = test::TestRequest::get().uri("/api/v1/notifications?unread=true").insert_header(bearer(&me)).to_request();
    let unread: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert!(unread.as_array().unwrap().is_empty());
    let req = test::TestRequest::get().uri("/api/v1/notifications").insert_header(bearer(&me)).to_request();
    let all: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[actix_web::test]
#[serial]
async fn ingested_rows_reach_live_stream() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(&dir, Some(INGEST_TOKEN));
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let recipient = register(&state, "ana@example.com").await;
    let neighbour = register(&state, "bob@example.com").await;
    let me = create_jwt(recipient, "ana@example.com").unwrap();

    let req = test::TestRequest::get().uri("/api/v1/notifications/stream").insert_header(bearer(&me)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/event-stream");
    assert_eq!(state.notifications.subscriber_count(recipient), 1);

    let mut body = Box::pin(resp.into_body());
    let mut decoder = SseDecoder::default();
    let hello = futures_util::future::poll_fn(|cx| body.as_mut().poll_next(cx)).await.unwrap().unwrap();
    assert!(decoder.push(&hello).is_empty(), "greeting is a comment frame");

    // someone else's notification is not relayed to this stream
    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(notification_for(neighbour))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::post()
        .uri("/api/v1/internal/notifications")
        .insert_header(("x-ingest-token", INGEST_TOKEN))
        .set_json(notification_for(recipient))
        .to_request();
    let stored: Notification = test::read_body_json(test::call_service(&app, req).await).await;

    let chunk = futures_util::future::poll_fn(|cx| body.as_mut().poll_next(cx)).await.unwrap().unwrap();
    let events = decoder.push(&chunk);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.as_deref(), Some("notification"));
    let relayed: Notification = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(relayed, stored);

    drop(body);
    // a publish with nobody listening clears the channel
    assert_eq!(state.notifications.publish(&stored), 0);
    assert_eq!(state.notifications.subscriber_count(recipient), 0);
}
