//! HTTP client for the journal API, used by front-ends and tools.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt as _};
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ApiErrorBody;
use crate::models::*;
use crate::routes::{LoginResponse, SessionUser, TokenResponse};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    /// Error reported by the server; `message` is its text, unchanged.
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("not signed in")]
    NotSignedIn,
    #[error("malformed notification event: {0}")]
    Stream(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Data-access calls the journal view depends on.
#[async_trait]
pub trait JournalApi: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<Category>, ClientError>;
    async fn create_category(&self, title: &str) -> Result<Category, ClientError>;
    async fn delete_category(&self, id: Id) -> Result<(), ClientError>;
    async fn list_messages(&self, category_id: Id) -> Result<Vec<Message>, ClientError>;
    async fn create_message(&self, category_id: Id, content: &str) -> Result<Message, ClientError>;
    async fn delete_message(&self, id: Id) -> Result<(), ClientError>;
    async fn publish(&self, req: PublishRequest) -> Result<PublicPost, ClientError>;
}

#[derive(Clone, Debug)]
pub struct JournalClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl JournalClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), token: None }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, rb: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let token = self.token.as_deref().ok_or(ClientError::NotSignedIn)?;
        Ok(rb.bearer_auth(token))
    }

    async fn check(resp: Response) -> Result<Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|b| b.error)
            .ok()
            .filter(|m| !m.is_empty())
            .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(ClientError::Api { status: status.as_u16(), message })
    }

    async fn json<T: DeserializeOwned>(rb: RequestBuilder) -> Result<T, ClientError> {
        let resp = Self::check(rb.send().await?).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn empty(rb: RequestBuilder) -> Result<(), ClientError> {
        Self::check(rb.send().await?).await?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, ClientError> {
        self.authed(self.http.get(self.url(path)))
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<RequestBuilder, ClientError> {
        self.authed(self.http.post(self.url(path)).json(body))
    }

    fn delete(&self, path: &str) -> Result<RequestBuilder, ClientError> {
        self.authed(self.http.delete(self.url(path)))
    }

    // ---------------- session ----------------

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SessionUser, ClientError> {
        let body = serde_json::json!({ "email": email, "password": password });
        Self::json(self.http.post(self.url("/auth/signup")).json(&body)).await
    }

    /// Signs in and keeps the token for later calls.
    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let body = serde_json::json!({ "email": email, "password": password });
        let login: LoginResponse = Self::json(self.http.post(self.url("/auth/login")).json(&body)).await?;
        self.token = Some(login.token.clone());
        Ok(login)
    }

    /// Ends the session server side; the local token is dropped either way.
    pub async fn sign_out(&mut self) -> Result<(), ClientError> {
        let result = match self.authed(self.http.post(self.url("/auth/logout"))) {
            Ok(rb) => Self::empty(rb).await,
            Err(ClientError::NotSignedIn) => Ok(()),
            Err(e) => Err(e),
        };
        self.token = None;
        result
    }

    /// `None` when there is no usable session.
    pub async fn session(&self) -> Result<Option<SessionUser>, ClientError> {
        let rb = match self.get("/auth/session") {
            Ok(rb) => rb,
            Err(ClientError::NotSignedIn) => return Ok(None),
            Err(e) => return Err(e),
        };
        let resp = rb.send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        Ok(Some(Self::check(resp).await?.json().await?))
    }

    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        let fresh: TokenResponse = Self::json(self.authed(self.http.post(self.url("/auth/refresh")))?).await?;
        self.token = Some(fresh.token);
        Ok(())
    }

    // ---------------- public map ----------------

    pub async fn public_posts(&self, limit: Option<usize>) -> Result<Vec<AnonymousPost>, ClientError> {
        let mut rb = self.http.get(self.url("/public-posts"));
        if let Some(limit) = limit {
            rb = rb.query(&[("limit", limit)]);
        }
        Self::json(rb).await
    }

    pub async fn public_map(&self, limit: Option<usize>) -> Result<PublicMap, ClientError> {
        let mut rb = self.http.get(self.url("/public-posts/map"));
        if let Some(limit) = limit {
            rb = rb.query(&[("limit", limit)]);
        }
        Self::json(rb).await
    }

    pub async fn own_public_posts(&self) -> Result<Vec<PublicPost>, ClientError> {
        Self::json(self.get("/public-posts/mine")?).await
    }

    pub async fn delete_public_post(&self, id: Id) -> Result<(), ClientError> {
        Self::empty(self.delete(&format!("/public-posts/{id}"))?).await
    }

    // ---------------- notifications ----------------

    pub async fn notifications(&self, unread_only: bool) -> Result<Vec<Notification>, ClientError> {
        Self::json(self.get("/notifications")?.query(&[("unread", unread_only)])).await
    }

    pub async fn mark_notification_read(&self, id: Id) -> Result<Notification, ClientError> {
        Self::json(self.authed(self.http.post(self.url(&format!("/notifications/{id}/read"))))?).await
    }

    /// Live feed of notifications addressed to the signed-in user. Drop the
    /// stream to unsubscribe.
    pub async fn notification_stream(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification, ClientError>>, ClientError> {
        let rb = self.get("/notifications/stream")?.header(header::ACCEPT, "text/event-stream");
        let resp = Self::check(rb.send().await?).await?;
        let bytes = Box::pin(resp.bytes_stream());

        let state = (bytes, SseDecoder::default(), VecDeque::new());
        Ok(stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for event in decoder.push(&chunk) {
                            if event.event.as_deref() != Some("notification") {
                                continue;
                            }
                            pending.push_back(
                                serde_json::from_str::<Notification>(&event.data)
                                    .map_err(|e| ClientError::Stream(e.to_string())),
                            );
                        }
                    }
                    Some(Err(e)) => return Some((Err(ClientError::Http(e)), (bytes, decoder, pending))),
                    None => return None,
                }
            }
        }))
    }
}

#[async_trait]
impl JournalApi for JournalClient {
    async fn list_categories(&self) -> Result<Vec<Category>, ClientError> {
        Self::json(self.get("/categories")?).await
    }
    async fn create_category(&self, title: &str) -> Result<Category, ClientError> {
        Self::json(self.post("/categories", &serde_json::json!({ "title": title }))?).await
    }
    async fn delete_category(&self, id: Id) -> Result<(), ClientError> {
        Self::empty(self.delete(&format!("/categories/{id}"))?).await
    }
    async fn list_messages(&self, category_id: Id) -> Result<Vec<Message>, ClientError> {
        Self::json(self.get(&format!("/categories/{category_id}/messages"))?).await
    }
    async fn create_message(&self, category_id: Id, content: &str) -> Result<Message, ClientError> {
        let body = NewMessage { category_id, content: content.to_string() };
        Self::json(self.post("/messages", &body)?).await
    }
    async fn delete_message(&self, id: Id) -> Result<(), ClientError> {
        Self::empty(self.delete(&format!("/messages/{id}"))?).await
    }
    async fn publish(&self, req: PublishRequest) -> Result<PublicPost, ClientError> {
        Self::json(self.post("/public-posts", &req)?).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser; frames may be split across chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent { event, data: data.join("\n") })
}
