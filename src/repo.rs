use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

// Every owner-scoped call takes the caller's id; rows belonging to someone
// else are reported as NotFound.

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn find_user_by_email(&self, email: &str) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
}

#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list_categories(&self, owner: Id) -> RepoResult<Vec<Category>>;
    async fn create_category(&self, owner: Id, new: NewCategory) -> RepoResult<Category>;
    async fn get_category(&self, owner: Id, id: Id) -> RepoResult<Category>;
    /// Removes the category and all of its messages.
    async fn delete_category(&self, owner: Id, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn list_messages(&self, owner: Id, category_id: Id) -> RepoResult<Vec<Message>>;
    async fn create_message(&self, owner: Id, new: NewMessage) -> RepoResult<Message>;
    async fn get_message(&self, owner: Id, id: Id) -> RepoResult<Message>;
    async fn delete_message(&self, owner: Id, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait PublicPostRepo: Send + Sync {
    /// Newest first.
    async fn list_public_posts(&self, limit: usize) -> RepoResult<Vec<PublicPost>>;
    async fn list_own_public_posts(&self, owner: Id) -> RepoResult<Vec<PublicPost>>;
    async fn create_public_post(&self, new: NewPublicPost) -> RepoResult<PublicPost>;
    async fn delete_public_post(&self, owner: Id, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Newest first.
    async fn list_notifications(&self, recipient: Id, unread_only: bool) -> RepoResult<Vec<Notification>>;
    async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification>;
    async fn mark_notification_read(&self, recipient: Id, id: Id) -> RepoResult<Notification>;
}

pub trait Repo: UserRepo + CategoryRepo + MessageRepo + PublicPostRepo + NotificationRepo {}

impl<T> Repo for T where T: UserRepo + CategoryRepo + MessageRepo + PublicPostRepo + NotificationRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use uuid::Uuid;

    const SNAPSHOT_PATH: &str = "data/state.json";
    const DATA_DIR_VAR: &str = "NEVERMIND_DATA_DIR";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        categories: HashMap<Id, Category>,
        messages: HashMap<Id, Message>,
        public_posts: HashMap<Id, PublicPost>,
        notifications: HashMap<Id, Notification>,
    }

    /// Single-process store persisted as a JSON snapshot after every write.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var(DATA_DIR_VAR) {
                Ok(dir) => PathBuf::from(dir).join("state.json"),
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("[inmem] loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        let aside = Self::set_aside(path);
                        log::error!(
                            "[inmem] failed to parse snapshot '{}': {e}; kept it as '{}', starting empty",
                            path.display(),
                            aside.display()
                        );
                        State::default()
                    }
                },
                Err(e) => {
                    log::info!("[inmem] no snapshot at '{}': {e}; starting empty", path.display());
                    State::default()
                }
            }
        }

        /// Move an unreadable snapshot out of the way so the next write
        /// cannot replace it.
        fn set_aside(path: &Path) -> PathBuf {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
            let aside = path.with_extension(format!("json.corrupt-{stamp}"));
            if let Err(e) = std::fs::rename(path, &aside) {
                log::error!("[inmem] failed to move '{}' aside: {e}", path.display());
            }
            aside
        }

        /// Open the store at `NEVERMIND_DATA_DIR/state.json` (or `data/state.json`).
        pub fn new() -> Self {
            Self::at(Self::snapshot_path())
        }

        pub fn at(snapshot_path: PathBuf) -> Self {
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        // Called with the write guard held, so snapshots land in commit order.
        // Failures are logged, the in-memory write stands.
        fn persist(&self, state: &State) {
            let path = self.snapshot_path.as_path();
            let bytes = match serde_json::to_vec_pretty(state) {
                Ok(b) => b,
                Err(e) => {
                    log::error!("[inmem] failed to serialise snapshot: {e}");
                    return;
                }
            };
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            let tmp = path.with_extension("json.tmp");
            let written = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path));
            if let Err(e) = written {
                log::error!("[inmem] failed to write snapshot '{}': {e}", path.display());
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    fn newest_first<T>(v: &mut [T], key: impl Fn(&T) -> chrono::DateTime<Utc>) {
        v.sort_by(|a, b| key(b).cmp(&key(a)));
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.write()?;
            if s.users.values().any(|u| u.email == new.email) {
                return Err(RepoError::Conflict);
            }
            let user = User {
                id: Uuid::new_v4(),
                email: new.email,
                password_hash: new.password_hash,
                created_at: Utc::now(),
            };
            s.users.insert(user.id, user.clone());
            self.persist(&s);
            Ok(user)
        }
        async fn find_user_by_email(&self, email: &str) -> RepoResult<User> {
            let s = self.read()?;
            s.users.values().find(|u| u.email == email).cloned().ok_or(RepoError::NotFound)
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let s = self.read()?;
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }
    }

    #[async_trait]
    impl CategoryRepo for InMemRepo {
        async fn list_categories(&self, owner: Id) -> RepoResult<Vec<Category>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.categories.values().filter(|c| c.user_id == owner).cloned().collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at)); // ascending
            Ok(v)
        }
        async fn create_category(&self, owner: Id, new: NewCategory) -> RepoResult<Category> {
            let mut s = self.write()?;
            let category = Category {
                id: Uuid::new_v4(),
                title: new.title,
                created_at: Utc::now(),
                user_id: owner,
            };
            s.categories.insert(category.id, category.clone());
            self.persist(&s);
            Ok(category)
        }
        async fn get_category(&self, owner: Id, id: Id) -> RepoResult<Category> {
            let s = self.read()?;
            s.categories
                .get(&id)
                .filter(|c| c.user_id == owner)
                .cloned()
                .ok_or(RepoError::NotFound)
        }
        async fn delete_category(&self, owner: Id, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if !s.categories.get(&id).is_some_and(|c| c.user_id == owner) {
                return Err(RepoError::NotFound);
            }
            s.categories.remove(&id);
            s.messages.retain(|_, m| m.category_id != id);
            self.persist(&s);
            Ok(())
        }
    }

    #[async_trait]
    impl MessageRepo for InMemRepo {
        async fn list_messages(&self, owner: Id, category_id: Id) -> RepoResult<Vec<Message>> {
            let s = self.read()?;
            if !s.categories.get(&category_id).is_some_and(|c| c.user_id == owner) {
                return Err(RepoError::NotFound);
            }
            let mut v: Vec<_> = s
                .messages
                .values()
                .filter(|m| m.category_id == category_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at)); // ascending
            Ok(v)
        }
        async fn create_message(&self, owner: Id, new: NewMessage) -> RepoResult<Message> {
            let mut s = self.write()?;
            if !s.categories.get(&new.category_id).is_some_and(|c| c.user_id == owner) {
                return Err(RepoError::NotFound);
            }
            let message = Message {
                id: Uuid::new_v4(),
                content: new.content,
                created_at: Utc::now(),
                category_id: new.category_id,
                user_id: owner,
            };
            s.messages.insert(message.id, message.clone());
            self.persist(&s);
            Ok(message)
        }
        async fn get_message(&self, owner: Id, id: Id) -> RepoResult<Message> {
            let s = self.read()?;
            s.messages
                .get(&id)
                .filter(|m| m.user_id == owner)
                .cloned()
                .ok_or(RepoError::NotFound)
        }
        async fn delete_message(&self, owner: Id, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if !s.messages.get(&id).is_some_and(|m| m.user_id == owner) {
                return Err(RepoError::NotFound);
            }
            s.messages.remove(&id);
            self.persist(&s);
            Ok(())
        }
    }

    #[async_trait]
    impl PublicPostRepo for InMemRepo {
        async fn list_public_posts(&self, limit: usize) -> RepoResult<Vec<PublicPost>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.public_posts.values().cloned().collect();
            newest_first(&mut v, |p| p.created_at);
            v.truncate(limit);
            Ok(v)
        }
        async fn list_own_public_posts(&self, owner: Id) -> RepoResult<Vec<PublicPost>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.public_posts.values().filter(|p| p.user_id == owner).cloned().collect();
            newest_first(&mut v, |p| p.created_at);
            Ok(v)
        }
        async fn create_public_post(&self, new: NewPublicPost) -> RepoResult<PublicPost> {
            let mut s = self.write()?;
            let post = PublicPost {
                id: Uuid::new_v4(),
                user_id: new.user_id,
                content: new.content,
                city: new.city,
                lat: new.lat,
                lng: new.lng,
                created_at: Utc::now(),
            };
            s.public_posts.insert(post.id, post.clone());
            self.persist(&s);
            Ok(post)
        }
        async fn delete_public_post(&self, owner: Id, id: Id) -> RepoResult<()> {
            let mut s = self.write()?;
            if !s.public_posts.get(&id).is_some_and(|p| p.user_id == owner) {
                return Err(RepoError::NotFound);
            }
            s.public_posts.remove(&id);
            self.persist(&s);
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationRepo for InMemRepo {
        async fn list_notifications(&self, recipient: Id, unread_only: bool) -> RepoResult<Vec<Notification>> {
            let s = self.read()?;
            let mut v: Vec<_> = s
                .notifications
                .values()
                .filter(|n| n.recipient_user_id == recipient)
                .filter(|n| !unread_only || n.read_at.is_none())
                .cloned()
                .collect();
            newest_first(&mut v, |n| n.created_at);
            Ok(v)
        }
        async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
            let mut s = self.write()?;
            if !s.users.contains_key(&new.recipient_user_id) {
                return Err(RepoError::NotFound);
            }
            let row = Notification {
                id: Uuid::new_v4(),
                recipient_user_id: new.recipient_user_id,
                from_message_id: new.from_message_id,
                from_user_id: new.from_user_id,
                distance_km: new.distance_km,
                similarity: new.similarity,
                preview: new.preview,
                created_at: Utc::now(),
                read_at: None,
            };
            s.notifications.insert(row.id, row.clone());
            self.persist(&s);
            Ok(row)
        }
        async fn mark_notification_read(&self, recipient: Id, id: Id) -> RepoResult<Notification> {
            let mut s = self.write()?;
            let row = s
                .notifications
                .get_mut(&id)
                .filter(|n| n.recipient_user_id == recipient)
                .ok_or(RepoError::NotFound)?;
            if row.read_at.is_none() {
                row.read_at = Some(Utc::now());
            }
            let updated = row.clone();
            self.persist(&s);
            Ok(updated)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }
    }

    impl From<sqlx::Error> for RepoError {
        fn from(e: sqlx::Error) -> Self {
            match e {
                sqlx::Error::RowNotFound => RepoError::NotFound,
                sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepoError::NotFound,
                other => RepoError::Internal(other.to_string()),
            }
        }
    }

    fn affected(rows: u64) -> RepoResult<()> {
        if rows == 0 { Err(RepoError::NotFound) } else { Ok(()) }
    }

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let rec = sqlx::query_as::<_, User>(
                "INSERT INTO users (email, password_hash) VALUES ($1,$2) RETURNING id, email, password_hash, created_at",
            )
            .bind(&new.email)
            .bind(&new.password_hash)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn find_user_by_email(&self, email: &str) -> RepoResult<User> {
            let rec = sqlx::query_as::<_, User>("SELECT id, email, password_hash, created_at FROM users WHERE email = $1")
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
            Ok(rec)
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            let rec = sqlx::query_as::<_, User>("SELECT id, email, password_hash, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            Ok(rec)
        }
    }

    #[async_trait]
    impl CategoryRepo for PgRepo {
        async fn list_categories(&self, owner: Id) -> RepoResult<Vec<Category>> {
            let recs = sqlx::query_as::<_, Category>(
                "SELECT id, title, created_at, user_id FROM categories WHERE user_id = $1 ORDER BY created_at ASC",
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
            Ok(recs)
        }
        async fn create_category(&self, owner: Id, new: NewCategory) -> RepoResult<Category> {
            let rec = sqlx::query_as::<_, Category>(
                "INSERT INTO categories (title, user_id) VALUES ($1,$2) RETURNING id, title, created_at, user_id",
            )
            .bind(&new.title)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn get_category(&self, owner: Id, id: Id) -> RepoResult<Category> {
            let rec = sqlx::query_as::<_, Category>(
                "SELECT id, title, created_at, user_id FROM categories WHERE id = $1 AND user_id = $2",
            )
            .bind(id)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn delete_category(&self, owner: Id, id: Id) -> RepoResult<()> {
            // messages go with it (ON DELETE CASCADE)
            let res = sqlx::query("DELETE FROM categories WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(owner)
                .execute(&self.pool)
                .await?;
            affected(res.rows_affected())
        }
    }

    #[async_trait]
    impl MessageRepo for PgRepo {
        async fn list_messages(&self, owner: Id, category_id: Id) -> RepoResult<Vec<Message>> {
            self.get_category(owner, category_id).await?;
            let recs = sqlx::query_as::<_, Message>(
                "SELECT id, content, created_at, category_id, user_id FROM messages WHERE category_id = $1 ORDER BY created_at ASC",
            )
            .bind(category_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(recs)
        }
        async fn create_message(&self, owner: Id, new: NewMessage) -> RepoResult<Message> {
            // insert only when the category belongs to the caller
            let rec = sqlx::query_as::<_, Message>(r#"
                INSERT INTO messages (content, category_id, user_id)
                SELECT $1, c.id, c.user_id FROM categories c WHERE c.id = $2 AND c.user_id = $3
                RETURNING id, content, created_at, category_id, user_id
            "#)
            .bind(&new.content)
            .bind(new.category_id)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn get_message(&self, owner: Id, id: Id) -> RepoResult<Message> {
            let rec = sqlx::query_as::<_, Message>(
                "SELECT id, content, created_at, category_id, user_id FROM messages WHERE id = $1 AND user_id = $2",
            )
            .bind(id)
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn delete_message(&self, owner: Id, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM messages WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(owner)
                .execute(&self.pool)
                .await?;
            affected(res.rows_affected())
        }
    }

    #[async_trait]
    impl PublicPostRepo for PgRepo {
        async fn list_public_posts(&self, limit: usize) -> RepoResult<Vec<PublicPost>> {
            let recs = sqlx::query_as::<_, PublicPost>(
                "SELECT id, user_id, content, city, lat, lng, created_at FROM public_posts ORDER BY created_at DESC LIMIT $1",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(recs)
        }
        async fn list_own_public_posts(&self, owner: Id) -> RepoResult<Vec<PublicPost>> {
            let recs = sqlx::query_as::<_, PublicPost>(
                "SELECT id, user_id, content, city, lat, lng, created_at FROM public_posts WHERE user_id = $1 ORDER BY created_at DESC",
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
            Ok(recs)
        }
        async fn create_public_post(&self, new: NewPublicPost) -> RepoResult<PublicPost> {
            let rec = sqlx::query_as::<_, PublicPost>(r#"
                INSERT INTO public_posts (user_id, content, city, lat, lng)
                VALUES ($1,$2,$3,$4,$5)
                RETURNING id, user_id, content, city, lat, lng, created_at
            "#)
            .bind(new.user_id)
            .bind(&new.content)
            .bind(new.city.as_ref())
            .bind(new.lat)
            .bind(new.lng)
            .fetch_one(&self.pool)
            .await?;
            Ok(rec)
        }
        async fn delete_public_post(&self, owner: Id, id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM public_posts WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(owner)
                .execute(&self.pool)
                .await?;
            affected(res.rows_affected())
        }
    }

    const NOTIFICATION_COLUMNS: &str =
        "id, recipient_user_id, from_message_id, from_user_id, distance_km, similarity, preview, created_at, read_at";

    #[async_trait]
    impl NotificationRepo for PgRepo {
        async fn list_notifications(&self, recipient: Id, unread_only: bool) -> RepoResult<Vec<Notification>> {
            let sql = format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE recipient_user_id = $1 AND ($2 = FALSE OR read_at IS NULL)
                 ORDER BY created_at DESC"
            );
            let recs = sqlx::query_as::<_, Notification>(&sql)
                .bind(recipient)
                .bind(unread_only)
                .fetch_all(&self.pool)
                .await?;
            Ok(recs)
        }
        async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
            let sql = format!(
                "INSERT INTO notifications (recipient_user_id, from_message_id, from_user_id, distance_km, similarity, preview)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 RETURNING {NOTIFICATION_COLUMNS}"
            );
            let rec = sqlx::query_as::<_, Notification>(&sql)
                .bind(new.recipient_user_id)
                .bind(new.from_message_id)
                .bind(new.from_user_id)
                .bind(new.distance_km)
                .bind(new.similarity)
                .bind(&new.preview)
                .fetch_one(&self.pool)
                .await?;
            Ok(rec)
        }
        async fn mark_notification_read(&self, recipient: Id, id: Id) -> RepoResult<Notification> {
            let sql = format!(
                "UPDATE notifications SET read_at = COALESCE(read_at, now())
                 WHERE id = $1 AND recipient_user_id = $2
                 RETURNING {NOTIFICATION_COLUMNS}"
            );
            let rec = sqlx::query_as::<_, Notification>(&sql)
                .bind(id)
                .bind(recipient)
                .fetch_one(&self.pool)
                .await?;
            Ok(rec)
        }
    }
}
