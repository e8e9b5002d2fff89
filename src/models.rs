use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::geo::{self, Cluster, Geotagged};

pub type Id = Uuid;

pub const MAX_TITLE_CHARS: usize = 120;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_CITY_CHARS: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub password_hash: String, // PHC string, never sent to clients
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Category {
    pub id: Id,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub user_id: Id, // owner
}
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCategory {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Message {
    pub id: Id,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub category_id: Id,
    pub user_id: Id, // owner
}
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMessage {
    pub category_id: Id,
    pub content: String,
}

/// A message republished on the public map. Only the creator ever sees
/// `user_id`; everyone else gets an [`AnonymousPost`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PublicPost {
    pub id: Id,
    pub user_id: Id,
    pub content: String,
    pub city: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub created_at: DateTime<Utc>,
}

/// Row handed to the repository; coordinates already rounded.
#[derive(Debug, Clone)]
pub struct NewPublicPost {
    pub user_id: Id,
    pub content: String,
    pub city: Option<String>,
    pub lat: f64,
    pub lng: f64,
}

/// Body of `POST /public-posts`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublishRequest {
    pub message_id: Id,
    pub lat: f64,
    pub lng: f64,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnonymousPost {
    pub id: Id,
    pub content: String,
    pub city: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub created_at: DateTime<Utc>,
}

impl From<PublicPost> for AnonymousPost {
    fn from(p: PublicPost) -> Self {
        Self { id: p.id, content: p.content, city: p.city, lat: p.lat, lng: p.lng, created_at: p.created_at }
    }
}

impl Geotagged for PublicPost {
    fn lat(&self) -> f64 { self.lat }
    fn lng(&self) -> f64 { self.lng }
    fn created_at(&self) -> DateTime<Utc> { self.created_at }
}

impl Geotagged for AnonymousPost {
    fn lat(&self) -> f64 { self.lat }
    fn lng(&self) -> f64 { self.lng }
    fn created_at(&self) -> DateTime<Utc> { self.created_at }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MapCluster {
    pub key: String,
    pub lat: f64,
    pub lng: f64,
    /// Hover text for the newest post.
    pub preview: String,
    pub posts: Vec<AnonymousPost>,
}

impl From<Cluster<AnonymousPost>> for MapCluster {
    fn from(c: Cluster<AnonymousPost>) -> Self {
        let preview = c
            .posts
            .first()
            .map(|p| geo::preview(&p.content, geo::PREVIEW_CHARS))
            .unwrap_or_default();
        Self { key: c.key, lat: c.lat, lng: c.lng, preview, posts: c.posts }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublicMap {
    pub center: LatLng,
    pub clusters: Vec<MapCluster>,
}

impl PublicMap {
    pub fn from_posts(posts: Vec<AnonymousPost>) -> Self {
        let (lat, lng) = geo::map_center(&posts);
        let clusters = geo::build_clusters(posts).into_iter().map(MapCluster::from).collect();
        Self { center: LatLng { lat, lng }, clusters }
    }
}

/// "Nearby similar" notification row, produced by an external matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Notification {
    pub id: Id,
    pub recipient_user_id: Id,
    pub from_message_id: Id,
    pub from_user_id: Id,
    pub distance_km: f64,
    pub similarity: f64,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewNotification {
    pub recipient_user_id: Id,
    pub from_message_id: Id,
    pub from_user_id: Id,
    pub distance_km: f64,
    pub similarity: f64,
    pub preview: String,
}
