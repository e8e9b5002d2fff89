#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use nevermind::auth::create_jwt;
use nevermind::repo::inmem::InMemRepo;
use nevermind::{config, AppState, SecurityHeaders};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup(dir: &tempfile::TempDir) -> web::Data<AppState> {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let repo = InMemRepo::at(dir.path().join("state.json"));
    web::Data::new(AppState::new(Arc::new(repo)))
}

fn token_for(user: Uuid) -> String {
    create_jwt(user, &format!("{user}@example.com")).unwrap()
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

#[actix_web::test]
#[serial]
async fn signup_login_session_logout_flow() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().wrap(SecurityHeaders::from_env()).app_data(state.clone()).configure(config)).await;

    let creds = json!({"email": " Ana@Example.com ", "password": "password123"});
    let req = test::TestRequest::post().uri("/api/v1/auth/signup").set_json(&creds).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let user: Value = test::read_body_json(resp).await;
    assert_eq!(user["email"], "ana@example.com");
    assert!(user.get("password_hash").is_none());

    // same address, different case
    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(json!({"email": "ana@example.COM", "password": "password456"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "user already registered");

    let req = test::TestRequest::post()
        .uri("/api/v1/auth/signup")
        .set_json(json!({"email": "bob@example.com", "password": "short"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    for bad in [json!({"email": "ana@example.com", "password": "nope-nope"}), json!({"email": "who@example.com", "password": "password123"})] {
        let req = test::TestRequest::post().uri("/api/v1/auth/login").set_json(&bad).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "invalid login credentials");
    }

    let req = test::TestRequest::post().uri("/api/v1/auth/login").set_json(&creds).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let login: Value = test::read_body_json(resp).await;
    let token = login["token"].as_str().unwrap().to_string();
    assert_eq!(login["user_id"], user["user_id"]);

    let req = test::TestRequest::get().uri("/api/v1/auth/session").insert_header(bearer(&token)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let session: Value = test::read_body_json(resp).await;
    assert_eq!(session["email"], "ana@example.com");

    let req = test::TestRequest::post().uri("/api/v1/auth/refresh").insert_header(bearer(&token)).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let refreshed: Value = test::read_body_json(resp).await;
    let second = refreshed["token"].as_str().unwrap().to_string();

    let req = test::TestRequest::post().uri("/api/v1/auth/logout").insert_header(bearer(&token)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    // the signed-out token is dead, the refreshed one lives on
    let req = test::TestRequest::get().uri("/api/v1/auth/session").insert_header(bearer(&token)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
    let req = test::TestRequest::get().uri("/api/v1/auth/session").insert_header(bearer(&second)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    let req = test::TestRequest::get().uri("/api/v1/auth/session").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
}

#[actix_web::test]
#[serial]
async fn rejected_sessions_get_json_errors() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let token = token_for(Uuid::new_v4());

    let req = test::TestRequest::post().uri("/api/v1/auth/logout").insert_header(bearer(&token)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    let cases = [
        (None, "authorization required"),
        (Some("not-a-jwt"), "invalid token"),
        (Some(token.as_str()), "session ended"),
    ];
    for (sent, expected) in cases {
        let mut req = test::TestRequest::get().uri("/api/v1/categories");
        if let Some(t) = sent {
            req = req.insert_header(bearer(t));
        }
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], expected);
    }
}

#[actix_web::test]
#[serial]
async fn category_and_message_crud() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let me = token_for(Uuid::new_v4());

    let req = test::TestRequest::get().uri("/api/v1/categories").insert_header(bearer(&me)).to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: Value = test::read_body_json(resp).await;
    assert_eq!(v.as_array().unwrap().len(), 0);

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&me))
        .set_json(json!({"title": "  Dreams  "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let cat: Value = test::read_body_json(resp).await;
    assert_eq!(cat["title"], "Dreams");
    let cat_id = cat["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&me))
        .set_json(json!({"category_id": cat_id, "content": " flying over the city "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let msg: Value = test::read_body_json(resp).await;
    assert_eq!(msg["content"], "flying over the city");
    let msg_id = msg["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/categories/{cat_id}/messages"))
        .insert_header(bearer(&me))
        .to_request();
    let msgs: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(msgs.as_array().unwrap().len(), 1);

    let req = test::TestRequest::delete().uri(&format!("/api/v1/messages/{msg_id}")).insert_header(bearer(&me)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::delete().uri(&format!("/api/v1/messages/{msg_id}")).insert_header(bearer(&me)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // deleting the category takes its messages along
    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&me))
        .set_json(json!({"category_id": cat_id, "content": "second"}))
        .to_request();
    let second: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let req = test::TestRequest::delete().uri(&format!("/api/v1/categories/{cat_id}")).insert_header(bearer(&me)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/categories/{cat_id}/messages"))
        .insert_header(bearer(&me))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/messages/{}", second["id"].as_str().unwrap()))
        .insert_header(bearer(&me))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn validation_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let me = token_for(Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&me))
        .set_json(json!({"title": "   "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "title must not be empty");

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&me))
        .set_json(json!({"title": "x".repeat(121)}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&me))
        .set_json(json!({"title": "Log"}))
        .to_request();
    let cat: Value = test::read_body_json(test::call_service(&app, req).await).await;

    let long = "y".repeat(10_001);
    for content in ["", "   \n ", long.as_str()] {
        let req = test::TestRequest::post()
            .uri("/api/v1/messages")
            .insert_header(bearer(&me))
            .set_json(json!({"category_id": cat["id"], "content": content}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);
    }

    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&me))
        .set_json(json!({"category_id": Uuid::new_v4(), "content": "orphan"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn other_users_rows_are_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let ana = token_for(Uuid::new_v4());
    let bob = token_for(Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(bearer(&ana))
        .set_json(json!({"title": "Private"}))
        .to_request();
    let cat: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let cat_id = cat["id"].as_str().unwrap().to_string();
    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&ana))
        .set_json(json!({"category_id": cat_id, "content": "secret"}))
        .to_request();
    let msg: Value = test::read_body_json(test::call_service(&app, req).await).await;

    let req = test::TestRequest::get().uri("/api/v1/categories").insert_header(bearer(&bob)).to_request();
    let listed: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert!(listed.as_array().unwrap().is_empty());

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/categories/{cat_id}/messages"))
        .insert_header(bearer(&bob))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/messages")
        .insert_header(bearer(&bob))
        .set_json(json!({"category_id": cat_id, "content": "intrusion"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/messages/{}", msg["id"].as_str().unwrap()))
        .insert_header(bearer(&bob))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::delete().uri(&format!("/api/v1/categories/{cat_id}")).insert_header(bearer(&bob)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::get().uri("/api/v1/categories").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
}

#[actix_web::test]
#[serial]
async fn health_is_public() {
    let dir = tempfile::tempdir().unwrap();
    let state = setup(&dir);
    let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["status"], "ok");
}
