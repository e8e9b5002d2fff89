use std::convert::Infallible;
use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::{future, stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::auth::{create_jwt, hash_password, verify_password_or_dummy, Auth, SessionRevocations};
use crate::error::{ApiError, ApiErrorBody};
use crate::geo;
use crate::models::*;
use crate::notify::{sse_frame, NotificationHub};
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{Repo, RepoError};
use crate::telemetry;

pub const DEFAULT_PUBLIC_LIMIT: usize = 300;
pub const MAX_PUBLIC_LIMIT: usize = 1000;
pub const MIN_PASSWORD_CHARS: usize = 8;
pub const INGEST_TOKEN_HEADER: &str = "x-ingest-token";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/auth/signup").route(web::post().to(signup)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/auth/logout").route(web::post().to(logout)))
            .service(web::resource("/auth/session").route(web::get().to(session)))
            .service(web::resource("/auth/refresh").route(web::post().to(refresh_token)))
            .service(
                web::resource("/categories")
                    .route(web::get().to(list_categories))
                    .route(web::post().to(create_category)),
            )
            .service(web::resource("/categories/{id}").route(web::delete().to(delete_category)))
            .service(web::resource("/categories/{id}/messages").route(web::get().to(list_messages)))
            .service(web::resource("/messages").route(web::post().to(create_message)))
            .service(web::resource("/messages/{id}").route(web::delete().to(delete_message)))
            .service(
                web::resource("/public-posts")
                    .route(web::get().to(list_public_posts))
                    .route(web::post().to(publish_message)),
            )
            // fixed segments before the {id} resource
            .service(web::resource("/public-posts/map").route(web::get().to(public_map)))
            .service(web::resource("/public-posts/mine").route(web::get().to(list_own_public_posts)))
            .service(web::resource("/public-posts/{id}").route(web::delete().to(delete_public_post)))
            .service(web::resource("/notifications").route(web::get().to(list_notifications)))
            .service(web::resource("/notifications/stream").route(web::get().to(notification_stream)))
            .service(web::resource("/notifications/{id}/read").route(web::post().to(mark_notification_read)))
            .service(web::resource("/internal/notifications").route(web::post().to(ingest_notification))),
    );
    cfg.route("/health", web::get().to(telemetry::health));
    cfg.route("/metrics", web::get().to(telemetry::metrics_endpoint));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub notifications: NotificationHub,
    pub sessions: SessionRevocations,
    pub rate_limiter: Option<RateLimiterFacade>,
    pub ingest_token: Option<String>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self {
            repo,
            notifications: NotificationHub::default(),
            sessions: SessionRevocations::new(),
            rate_limiter: None,
            ingest_token: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiterFacade) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_ingest_token(mut self, token: impl Into<String>) -> Self {
        self.ingest_token = Some(token.into());
        self
    }
}

// ---------------- input cleaning -----------------------------------

fn clean_text(raw: &str, field: &str, max_chars: usize) -> Result<String, ApiError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    if text.chars().count() > max_chars {
        return Err(ApiError::BadRequest(format!("{field} is too long (max {max_chars} characters)")));
    }
    Ok(text.to_string())
}

fn clean_city(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim).filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(city) => clean_text(city, "city", MAX_CITY_CHARS).map(Some),
    }
}

fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_lowercase();
    let valid = email.len() <= 254
        && matches!(email.split_once('@'), Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') && !email.contains(char::is_whitespace));
    if valid {
        Ok(email)
    } else {
        Err(ApiError::BadRequest("invalid email address".into()))
    }
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string()
}

fn tokens_match(expected: &str, provided: &str) -> bool {
    expected.len() == provided.len()
        && expected.bytes().zip(provided.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

// ---------------- auth ---------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SessionUser {
    pub user_id: Id,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: Id,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

fn guard_auth_rate(req: &HttpRequest, data: &AppState) -> Result<(), ApiError> {
    match &data.rate_limiter {
        Some(rl) if !rl.allow_auth(&client_ip(req)) => Err(ApiError::TooManyRequests),
        _ => Ok(()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/signup",
    request_body = Credentials,
    responses(
        (status = 201, description = "Account created", body = SessionUser),
        (status = 400, description = "Invalid email or password", body = ApiErrorBody),
        (status = 409, description = "Email already registered", body = ApiErrorBody)
    )
)]
pub async fn signup(req: HttpRequest, data: web::Data<AppState>, payload: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    guard_auth_rate(&req, &data)?;
    let Credentials { email, password } = payload.into_inner();
    let email = normalize_email(&email)?;
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ApiError::BadRequest(format!("password must be at least {MIN_PASSWORD_CHARS} characters")));
    }
    let password_hash = web::block(move || hash_password(&password)).await.map_err(|_| ApiError::Internal)??;
    let user = data
        .repo
        .create_user(NewUser { email, password_hash })
        .await
        .map_err(|e| match e {
            RepoError::Conflict => ApiError::Conflict("user already registered".into()),
            other => other.into(),
        })?;
    info!(user_id = %user.id, "account created");
    Ok(HttpResponse::Created().json(SessionUser { user_id: user.id, email: user.email }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = Credentials,
    responses(
        (status = 200, description = "Signed in", body = LoginResponse),
        (status = 401, description = "Invalid login credentials", body = ApiErrorBody)
    )
)]
pub async fn login(req: HttpRequest, data: web::Data<AppState>, payload: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    guard_auth_rate(&req, &data)?;
    let rejected = || {
        metrics::counter!(telemetry::LOGIN_FAILURES).increment(1);
        ApiError::Unauthorized("invalid login credentials".into())
    };
    let Credentials { email, password } = payload.into_inner();
    let Ok(email) = normalize_email(&email) else { return Err(rejected()) };
    let user = match data.repo.find_user_by_email(&email).await {
        Ok(u) => Some(u),
        Err(RepoError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };
    // unknown emails still pay for one hash check
    let hash = user.as_ref().map(|u| u.password_hash.clone());
    let ok = web::block(move || verify_password_or_dummy(&password, hash.as_deref()))
        .await
        .map_err(|_| ApiError::Internal)??;
    let Some(user) = user.filter(|_| ok) else { return Err(rejected()) };
    let token = create_jwt(user.id, &user.email)?;
    info!(user_id = %user.id, "signed in");
    Ok(HttpResponse::Ok().json(LoginResponse { token, user_id: user.id, email: user.email }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    responses((status = 204, description = "Session ended"), (status = 401, description = "Unauthorized"))
)]
pub async fn logout(auth: Auth, data: web::Data<AppState>) -> HttpResponse {
    data.sessions.revoke(&auth.0);
    info!(user_id = %auth.user_id(), "signed out");
    HttpResponse::NoContent().finish()
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/session",
    responses(
        (status = 200, description = "Current session", body = SessionUser),
        (status = 401, description = "No session")
    )
)]
pub async fn session(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(auth.user_id()).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Unauthorized("account no longer exists".into()),
        other => other.into(),
    })?;
    Ok(HttpResponse::Ok().json(SessionUser { user_id: user.id, email: user.email }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    responses((status = 200, description = "Fresh token", body = TokenResponse), (status = 401, description = "Unauthorized"))
)]
pub async fn refresh_token(auth: Auth) -> Result<HttpResponse, ApiError> {
    let token = create_jwt(auth.0.sub, &auth.0.email)?;
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}

// ---------------- categories & messages ----------------------------

#[utoipa::path(
    get,
    path = "/api/v1/categories",
    responses((status = 200, description = "Own categories, oldest first", body = [Category]))
)]
pub async fn list_categories(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let categories = data.repo.list_categories(auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(categories))
}

#[utoipa::path(
    post,
    path = "/api/v1/categories",
    request_body = NewCategory,
    responses(
        (status = 201, description = "Category created", body = Category),
        (status = 400, description = "Empty or oversized title", body = ApiErrorBody)
    )
)]
pub async fn create_category(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewCategory>) -> Result<HttpResponse, ApiError> {
    let title = clean_text(&payload.title, "title", MAX_TITLE_CHARS)?;
    let category = data.repo.create_category(auth.user_id(), NewCategory { title }).await?;
    Ok(HttpResponse::Created().json(category))
}

#[utoipa::path(
    delete,
    path = "/api/v1/categories/{id}",
    params(("id" = Id, Path, description = "Category id")),
    responses((status = 204, description = "Category and its messages deleted"), (status = 404, description = "Not found"))
)]
pub async fn delete_category(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_category(auth.user_id(), path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/categories/{id}/messages",
    params(("id" = Id, Path, description = "Category id")),
    responses(
        (status = 200, description = "Messages, oldest first", body = [Message]),
        (status = 404, description = "Category not found")
    )
)]
pub async fn list_messages(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let messages = data.repo.list_messages(auth.user_id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(messages))
}

#[utoipa::path(
    post,
    path = "/api/v1/messages",
    request_body = NewMessage,
    responses(
        (status = 201, description = "Message stored", body = Message),
        (status = 400, description = "Empty or oversized content", body = ApiErrorBody),
        (status = 404, description = "Category not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_message(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewMessage>) -> Result<HttpResponse, ApiError> {
    let owner = auth.user_id();
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_message(&owner.to_string()) { return Err(ApiError::TooManyRequests); }
    }
    let NewMessage { category_id, content } = payload.into_inner();
    let content = clean_text(&content, "content", MAX_CONTENT_CHARS)?;
    let message = data.repo.create_message(owner, NewMessage { category_id, content }).await?;
    metrics::counter!(telemetry::MESSAGES_CREATED).increment(1);
    Ok(HttpResponse::Created().json(message))
}

#[utoipa::path(
    delete,
    path = "/api/v1/messages/{id}",
    params(("id" = Id, Path, description = "Message id")),
    responses((status = 204, description = "Message deleted"), (status = 404, description = "Not found"))
)]
pub async fn delete_message(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_message(auth.user_id(), path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- public posts -------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn clamped(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PUBLIC_LIMIT).clamp(1, MAX_PUBLIC_LIMIT)
    }
}

async fn anonymous_posts(data: &AppState, limit: usize) -> Result<Vec<AnonymousPost>, ApiError> {
    let posts = data.repo.list_public_posts(limit).await?;
    Ok(posts.into_iter().map(AnonymousPost::from).collect())
}

#[utoipa::path(
    get,
    path = "/api/v1/public-posts",
    params(("limit" = Option<usize>, Query, description = "Max posts (default 300, at most 1000)")),
    responses((status = 200, description = "Public posts, newest first", body = [AnonymousPost]))
)]
pub async fn list_public_posts(data: web::Data<AppState>, query: web::Query<LimitQuery>) -> Result<HttpResponse, ApiError> {
    let posts = anonymous_posts(&data, query.clamped()).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/v1/public-posts/map",
    params(("limit" = Option<usize>, Query, description = "Max posts considered (default 300, at most 1000)")),
    responses((status = 200, description = "Clustered map pins", body = PublicMap))
)]
pub async fn public_map(data: web::Data<AppState>, query: web::Query<LimitQuery>) -> Result<HttpResponse, ApiError> {
    let posts = anonymous_posts(&data, query.clamped()).await?;
    Ok(HttpResponse::Ok().json(PublicMap::from_posts(posts)))
}

#[utoipa::path(
    get,
    path = "/api/v1/public-posts/mine",
    responses((status = 200, description = "Posts the caller published", body = [PublicPost]))
)]
pub async fn list_own_public_posts(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let posts = data.repo.list_own_public_posts(auth.user_id()).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    post,
    path = "/api/v1/public-posts",
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Published with rounded coordinates", body = PublicPost),
        (status = 400, description = "Bad coordinates or city", body = ApiErrorBody),
        (status = 404, description = "Message not found"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn publish_message(auth: Auth, data: web::Data<AppState>, payload: web::Json<PublishRequest>) -> Result<HttpResponse, ApiError> {
    let owner = auth.user_id();
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_publish(&owner.to_string()) { return Err(ApiError::TooManyRequests); }
    }
    let req = payload.into_inner();
    if !geo::valid_latitude(req.lat) {
        return Err(ApiError::BadRequest("lat must be a number between -90 and 90".into()));
    }
    if !geo::valid_longitude(req.lng) {
        return Err(ApiError::BadRequest("lng must be a number between -180 and 180".into()));
    }
    let city = clean_city(req.city.as_deref())?;
    let message = data.repo.get_message(owner, req.message_id).await?;
    let post = data
        .repo
        .create_public_post(NewPublicPost {
            user_id: owner,
            content: message.content,
            city,
            lat: geo::round_coordinate(req.lat),
            lng: geo::round_coordinate(req.lng),
        })
        .await?;
    metrics::counter!(telemetry::PUBLIC_POSTS_CREATED).increment(1);
    info!(post_id = %post.id, "message published");
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    delete,
    path = "/api/v1/public-posts/{id}",
    params(("id" = Id, Path, description = "Public post id")),
    responses((status = 204, description = "Post removed"), (status = 404, description = "Not found or not yours"))
)]
pub async fn delete_public_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_public_post(auth.user_id(), path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- notifications ------------------------------------

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    params(("unread" = Option<bool>, Query, description = "Only rows without read_at")),
    responses((status = 200, description = "Own notifications, newest first", body = [Notification]))
)]
pub async fn list_notifications(auth: Auth, data: web::Data<AppState>, query: web::Query<NotificationQuery>) -> Result<HttpResponse, ApiError> {
    let rows = data.repo.list_notifications(auth.user_id(), query.unread).await?;
    Ok(HttpResponse::Ok().json(rows))
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications/{id}/read",
    params(("id" = Id, Path, description = "Notification id")),
    responses((status = 200, description = "Marked read", body = Notification), (status = 404, description = "Not found"))
)]
pub async fn mark_notification_read(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let row = data.repo.mark_notification_read(auth.user_id(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(row))
}

/// Server-sent events: one `notification` event per row inserted for the caller.
#[utoipa::path(
    get,
    path = "/api/v1/notifications/stream",
    responses(
        (status = 200, description = "`notification` events whose data is a Notification row", content_type = "text/event-stream", body = String),
        (status = 401, description = "Unauthorized", body = ApiErrorBody)
    )
)]
pub async fn notification_stream(auth: Auth, data: web::Data<AppState>) -> HttpResponse {
    let user = auth.user_id();
    let rx = data.notifications.subscribe(user);
    info!(%user, "notification stream opened");

    let hello = stream::once(future::ready(Ok::<_, Infallible>(web::Bytes::from_static(b": connected\n\n"))));
    let events = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(row) => match sse_frame(&row) {
                    Ok(frame) => {
                        metrics::counter!(telemetry::NOTIFICATIONS_DELIVERED).increment(1);
                        return Some((Ok::<_, Infallible>(web::Bytes::from(frame)), rx));
                    }
                    Err(e) => tracing::error!("cannot encode notification {}: {e}", row.id),
                },
                Err(RecvError::Lagged(skipped)) => warn!(%user, skipped, "notification stream lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(hello.chain(events))
}

#[utoipa::path(
    post,
    path = "/api/v1/internal/notifications",
    request_body = NewNotification,
    params(("X-Ingest-Token" = String, Header, description = "Shared secret of the notification producer")),
    responses(
        (status = 201, description = "Stored and relayed", body = Notification),
        (status = 401, description = "Bad ingest token", body = ApiErrorBody),
        (status = 503, description = "Ingest not configured", body = ApiErrorBody)
    )
)]
pub async fn ingest_notification(req: HttpRequest, data: web::Data<AppState>, payload: web::Json<NewNotification>) -> Result<HttpResponse, ApiError> {
    let Some(expected) = data.ingest_token.as_deref() else {
        return Err(ApiError::Unavailable("notification ingest is not configured".into()));
    };
    let provided = req.headers().get(INGEST_TOKEN_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !tokens_match(expected, provided) {
        warn!(ip = %client_ip(&req), "rejected notification ingest");
        return Err(ApiError::Unauthorized("invalid ingest token".into()));
    }
    let new = payload.into_inner();
    if !new.distance_km.is_finite() || new.distance_km < 0.0 {
        return Err(ApiError::BadRequest("distance_km must be a non-negative number".into()));
    }
    if !new.similarity.is_finite() {
        return Err(ApiError::BadRequest("similarity must be a number".into()));
    }
    let row = data.repo.insert_notification(new).await?;
    let delivered = data.notifications.publish(&row);
    metrics::counter!(telemetry::NOTIFICATIONS_INGESTED).increment(1);
    info!(notification_id = %row.id, delivered, "notification ingested");
    Ok(HttpResponse::Created().json(row))
}
