//! Client-side journal state with optimistic updates.
//!
//! Local changes show up immediately and are rolled back when the server
//! rejects them.

use chrono::{DateTime, Utc};

use crate::client::{ClientError, JournalApi};
use crate::geo::round_coordinate;
use crate::location::{locate, LocationError, LocationOptions, LocationProvider};
use crate::models::{Category, Id, Message, PublicPost, PublishRequest};

pub const TEMP_ID_PREFIX: &str = "optimistic-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalId {
    /// Not yet acknowledged by the server.
    Pending(String),
    Saved(Id),
}

impl LocalId {
    pub fn temporary() -> Self {
        LocalId::Pending(format!("{TEMP_ID_PREFIX}{:016x}", rand::random::<u64>()))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LocalId::Pending(_))
    }

    pub fn saved(&self) -> Option<Id> {
        match self {
            LocalId::Saved(id) => Some(*id),
            LocalId::Pending(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub id: LocalId,
    pub category_id: Id,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for LocalMessage {
    fn from(m: Message) -> Self {
        Self { id: LocalId::Saved(m.id), category_id: m.category_id, content: m.content, created_at: m.created_at }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ViewError {
    #[error(transparent)]
    Api(#[from] ClientError),
    #[error(transparent)]
    Location(#[from] LocationError),
}

pub struct JournalView<A> {
    api: A,
    categories: Vec<Category>,
    active: Option<Id>,
    messages: Vec<LocalMessage>,
}

impl<A: JournalApi> JournalView<A> {
    pub fn new(api: A) -> Self {
        Self { api, categories: Vec::new(), active: None, messages: Vec::new() }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn active_category(&self) -> Option<&Category> {
        let id = self.active?;
        self.categories.iter().find(|c| c.id == id)
    }

    /// Messages of the active category, oldest first.
    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    /// Fetches categories and selects the first one unless the current
    /// selection still exists.
    pub async fn load_categories(&mut self) -> Result<(), ViewError> {
        self.categories = self.api.list_categories().await?;
        let still_there = self.active.is_some_and(|id| self.categories.iter().any(|c| c.id == id));
        if !still_there {
            self.active = self.categories.first().map(|c| c.id);
        }
        self.reload_messages().await
    }

    pub async fn select_category(&mut self, id: Id) -> Result<(), ViewError> {
        if !self.categories.iter().any(|c| c.id == id) {
            return Ok(());
        }
        self.active = Some(id);
        self.reload_messages().await
    }

    pub async fn reload_messages(&mut self) -> Result<(), ViewError> {
        self.messages.clear();
        let Some(active) = self.active else {
            return Ok(());
        };
        let rows = self.api.list_messages(active).await?;
        self.messages = rows.into_iter().map(LocalMessage::from).collect();
        Ok(())
    }

    /// Creates a category and makes it active. Blank titles are ignored.
    pub async fn add_category(&mut self, title: &str) -> Result<Option<Category>, ViewError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        let created = self.api.create_category(title).await?;
        self.categories.push(created.clone());
        self.active = Some(created.id);
        self.messages.clear();
        Ok(Some(created))
    }

    /// Shows the message immediately under a temporary id, then swaps in the
    /// stored row. On failure the placeholder is removed and the error returned.
    pub async fn send_message(&mut self, draft: &str) -> Result<Option<LocalMessage>, ViewError> {
        let content = draft.trim();
        let Some(category_id) = self.active else {
            return Ok(None);
        };
        if content.is_empty() {
            return Ok(None);
        }

        let temp_id = LocalId::temporary();
        self.messages.push(LocalMessage {
            id: temp_id.clone(),
            category_id,
            content: content.to_string(),
            created_at: Utc::now(),
        });

        match self.api.create_message(category_id, content).await {
            Ok(saved) => {
                let saved = LocalMessage::from(saved);
                if let Some(slot) = self.messages.iter_mut().find(|m| m.id == temp_id) {
                    *slot = saved.clone();
                }
                Ok(Some(saved))
            }
            Err(e) => {
                self.messages.retain(|m| m.id != temp_id);
                Err(e.into())
            }
        }
    }

    /// Removes the message locally, restoring it at the same position if the
    /// server refuses.
    pub async fn delete_message(&mut self, id: Id) -> Result<(), ViewError> {
        let Some(pos) = self.messages.iter().position(|m| m.id == LocalId::Saved(id)) else {
            return Ok(());
        };
        let removed = self.messages.remove(pos);
        if let Err(e) = self.api.delete_message(id).await {
            let pos = pos.min(self.messages.len());
            self.messages.insert(pos, removed);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn delete_category(&mut self, id: Id) -> Result<(), ViewError> {
        let Some(pos) = self.categories.iter().position(|c| c.id == id) else {
            return Ok(());
        };
        let prev_categories = self.categories.clone();
        let prev_active = self.active;
        let prev_messages = self.messages.clone();

        self.categories.remove(pos);
        let was_active = self.active == Some(id);
        if was_active {
            self.active = self.categories.first().map(|c| c.id);
            self.messages.clear();
        }

        if let Err(e) = self.api.delete_category(id).await {
            self.categories = prev_categories;
            self.active = prev_active;
            self.messages = prev_messages;
            return Err(e.into());
        }
        if was_active {
            self.reload_messages().await?;
        }
        Ok(())
    }

    /// Publishes a saved message at the device's current position, rounded
    /// to two decimals before it leaves the client.
    pub async fn publish_message(
        &self,
        message_id: Id,
        city: Option<&str>,
        location: &dyn LocationProvider,
    ) -> Result<PublicPost, ViewError> {
        let pos = locate(location, LocationOptions::default()).await?;
        let city = city.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string);
        let req = PublishRequest { message_id, lat: round_coordinate(pos.lat), lng: round_coordinate(pos.lng), city };
        Ok(self.api.publish(req).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_prefixed_and_distinct() {
        let a = LocalId::temporary();
        let b = LocalId::temporary();
        assert_ne!(a, b);
        match a {
            LocalId::Pending(s) => assert!(s.starts_with(TEMP_ID_PREFIX)),
            LocalId::Saved(_) => panic!("expected pending id"),
        }
        assert!(b.is_pending());
        assert_eq!(b.saved(), None);
    }
}
