//! The durable-state collaborator the engine mutates through.
//!
//! Durable storage and schema maintenance are explicitly out of scope:
//! this module defines only the trait boundary the router, timer service,
//! and phase sequencer call into, plus an in-memory test double.

use std::collections::HashMap;

use async_trait::async_trait;

use retrotro_wire::{ItemId, RoomId, UserId};

use crate::error::EngineError;
use crate::phase::{Phase, SessionType};

/// The columns the core reads/writes on a session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_type: SessionType,
    pub current_phase: Phase,
    pub timer_started_at: Option<i64>,
    pub timer_duration_seconds: Option<u64>,
    pub timer_paused_at: Option<i64>,
    pub timer_remaining_seconds: Option<u64>,
    pub max_votes_per_user: u32,
    pub max_votes_per_item: u32,
    pub allow_item_edit: bool,
    pub allow_vote_change: bool,
    pub anonymous_items: bool,
    pub anonymous_voting: bool,
    pub facilitator_id: Option<UserId>,
    pub roti_revealed: bool,
}

/// A single board item (card).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub id: ItemId,
    pub column_id: String,
    pub content: String,
    pub author_id: UserId,
    pub group_id: Option<ItemId>,
}

/// One ROTI rating captured for `(session, user)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotiVoteRecord {
    pub user_id: UserId,
    pub rating: u8,
}

/// The collaborator the engine persists durable session/item/vote/mood/roti
/// state through. Implementations are expected to be cheap to clone
/// (typically an `Arc` around a connection pool) since the router holds one
/// per dispatch.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn session_state(&self, room: &RoomId) -> Result<SessionState, EngineError>;
    async fn set_phase(&self, room: &RoomId, phase: Phase) -> Result<(), EngineError>;
    async fn set_facilitator(
        &self,
        room: &RoomId,
        facilitator: Option<UserId>,
    ) -> Result<(), EngineError>;
    async fn set_roti_revealed(&self, room: &RoomId, revealed: bool) -> Result<(), EngineError>;

    async fn save_timer_state(
        &self,
        room: &RoomId,
        started_at: Option<i64>,
        duration_seconds: Option<u64>,
        paused_at: Option<i64>,
        remaining_seconds: Option<u64>,
    ) -> Result<(), EngineError>;
    async fn clear_timer_state(&self, room: &RoomId) -> Result<(), EngineError>;

    async fn create_item(
        &self,
        room: &RoomId,
        column_id: &str,
        content: &str,
        author: UserId,
    ) -> Result<ItemRecord, EngineError>;
    async fn update_item(
        &self,
        room: &RoomId,
        item: ItemId,
        content: &str,
    ) -> Result<ItemRecord, EngineError>;
    async fn delete_item(&self, room: &RoomId, item: ItemId) -> Result<(), EngineError>;
    async fn item(&self, room: &RoomId, item: ItemId) -> Result<ItemRecord, EngineError>;
    async fn items(&self, room: &RoomId) -> Result<Vec<ItemRecord>, EngineError>;
    /// Returns every item whose `group_id` chain (transitively) leads to `root`.
    async fn descendants(&self, room: &RoomId, root: ItemId) -> Result<Vec<ItemId>, EngineError>;
    async fn set_item_group(
        &self,
        room: &RoomId,
        item: ItemId,
        group: Option<ItemId>,
    ) -> Result<(), EngineError>;

    async fn vote_counts(
        &self,
        room: &RoomId,
        user: UserId,
        item: ItemId,
    ) -> Result<(u32, u32), EngineError>;
    async fn add_vote(&self, room: &RoomId, user: UserId, item: ItemId)
        -> Result<u32, EngineError>;
    async fn remove_vote(
        &self,
        room: &RoomId,
        user: UserId,
        item: ItemId,
    ) -> Result<u32, EngineError>;

    async fn set_mood(&self, room: &RoomId, user: UserId, mood: &str) -> Result<(), EngineError>;

    async fn submit_roti_vote(
        &self,
        room: &RoomId,
        user: UserId,
        rating: u8,
    ) -> Result<(), EngineError>;
    async fn roti_votes(&self, room: &RoomId) -> Result<Vec<RotiVoteRecord>, EngineError>;
}

#[derive(Debug, Default, Clone)]
struct RoomData {
    state: SessionState,
    items: HashMap<ItemId, ItemRecord>,
    votes: HashMap<(UserId, ItemId), u32>,
    moods: HashMap<UserId, String>,
    roti_votes: HashMap<UserId, u8>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session_type: SessionType::Retro,
            current_phase: Phase::Waiting,
            timer_started_at: None,
            timer_duration_seconds: None,
            timer_paused_at: None,
            timer_remaining_seconds: None,
            max_votes_per_user: 5,
            max_votes_per_item: 3,
            allow_item_edit: true,
            allow_vote_change: true,
            anonymous_items: false,
            anonymous_voting: false,
            facilitator_id: None,
            roti_revealed: false,
        }
    }
}

/// An in-memory [`Repository`] test double: exists so the engine and its
/// integration tests don't need a real database to exercise router/timer/
/// phase behavior.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    rooms: parking_lot::Mutex<HashMap<RoomId, RoomData>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_room<T>(&self, room: &RoomId, f: impl FnOnce(&mut RoomData) -> T) -> T {
        let mut rooms = self.rooms.lock();
        let data = rooms.entry(room.clone()).or_default();
        f(data)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn session_state(&self, room: &RoomId) -> Result<SessionState, EngineError> {
        Ok(self.with_room(room, |data| data.state.clone()))
    }

    async fn set_phase(&self, room: &RoomId, phase: Phase) -> Result<(), EngineError> {
        self.with_room(room, |data| data.state.current_phase = phase);
        Ok(())
    }

    async fn set_facilitator(
        &self,
        room: &RoomId,
        facilitator: Option<UserId>,
    ) -> Result<(), EngineError> {
        self.with_room(room, |data| data.state.facilitator_id = facilitator);
        Ok(())
    }

    async fn set_roti_revealed(&self, room: &RoomId, revealed: bool) -> Result<(), EngineError> {
        self.with_room(room, |data| data.state.roti_revealed = revealed);
        Ok(())
    }

    async fn save_timer_state(
        &self,
        room: &RoomId,
        started_at: Option<i64>,
        duration_seconds: Option<u64>,
        paused_at: Option<i64>,
        remaining_seconds: Option<u64>,
    ) -> Result<(), EngineError> {
        self.with_room(room, |data| {
            data.state.timer_started_at = started_at;
            data.state.timer_duration_seconds = duration_seconds;
            data.state.timer_paused_at = paused_at;
            data.state.timer_remaining_seconds = remaining_seconds;
        });
        Ok(())
    }

    async fn clear_timer_state(&self, room: &RoomId) -> Result<(), EngineError> {
        self.save_timer_state(room, None, None, None, None).await
    }

    async fn create_item(
        &self,
        room: &RoomId,
        column_id: &str,
        content: &str,
        author: UserId,
    ) -> Result<ItemRecord, EngineError> {
        let record = ItemRecord {
            id: ItemId::generate(),
            column_id: column_id.to_string(),
            content: content.to_string(),
            author_id: author,
            group_id: None,
        };
        self.with_room(room, |data| {
            data.items.insert(record.id, record.clone());
        });
        Ok(record)
    }

    async fn update_item(
        &self,
        room: &RoomId,
        item: ItemId,
        content: &str,
    ) -> Result<ItemRecord, EngineError> {
        self.with_room(room, |data| {
            let record = data
                .items
                .get_mut(&item)
                .ok_or_else(|| EngineError::NotFound(format!("item {item}")))?;
            record.content = content.to_string();
            Ok(record.clone())
        })
    }

    async fn delete_item(&self, room: &RoomId, item: ItemId) -> Result<(), EngineError> {
        self.with_room(room, |data| {
            data.items.remove(&item);
        });
        Ok(())
    }

    async fn item(&self, room: &RoomId, item: ItemId) -> Result<ItemRecord, EngineError> {
        self.with_room(room, |data| {
            data.items
                .get(&item)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("item {item}")))
        })
    }

    async fn items(&self, room: &RoomId) -> Result<Vec<ItemRecord>, EngineError> {
        Ok(self.with_room(room, |data| data.items.values().cloned().collect()))
    }

    async fn descendants(&self, room: &RoomId, root: ItemId) -> Result<Vec<ItemId>, EngineError> {
        Ok(self.with_room(room, |data| {
            let mut out = Vec::new();
            let mut frontier = vec![root];
            while let Some(parent) = frontier.pop() {
                for item in data.items.values() {
                    if item.group_id == Some(parent) {
                        out.push(item.id);
                        frontier.push(item.id);
                    }
                }
            }
            out
        }))
    }

    async fn set_item_group(
        &self,
        room: &RoomId,
        item: ItemId,
        group: Option<ItemId>,
    ) -> Result<(), EngineError> {
        self.with_room(room, |data| {
            if let Some(record) = data.items.get_mut(&item) {
                record.group_id = group;
            }
        });
        Ok(())
    }

    async fn vote_counts(
        &self,
        room: &RoomId,
        user: UserId,
        item: ItemId,
    ) -> Result<(u32, u32), EngineError> {
        Ok(self.with_room(room, |data| {
            let per_item = data.votes.get(&(user, item)).copied().unwrap_or(0);
            let total = data
                .votes
                .iter()
                .filter(|((u, _), _)| *u == user)
                .map(|(_, count)| *count)
                .sum();
            (total, per_item)
        }))
    }

    async fn add_vote(
        &self,
        room: &RoomId,
        user: UserId,
        item: ItemId,
    ) -> Result<u32, EngineError> {
        Ok(self.with_room(room, |data| {
            let count = data.votes.entry((user, item)).or_insert(0);
            *count += 1;
            data.votes
                .iter()
                .filter(|((u, _), _)| *u == user)
                .map(|(_, count)| *count)
                .sum()
        }))
    }

    async fn remove_vote(
        &self,
        room: &RoomId,
        user: UserId,
        item: ItemId,
    ) -> Result<u32, EngineError> {
        Ok(self.with_room(room, |data| {
            if let Some(count) = data.votes.get_mut(&(user, item)) {
                if *count > 0 {
                    *count -= 1;
                }
                if *count == 0 {
                    data.votes.remove(&(user, item));
                }
            }
            data.votes
                .iter()
                .filter(|((u, _), _)| *u == user)
                .map(|(_, count)| *count)
                .sum()
        }))
    }

    async fn set_mood(&self, room: &RoomId, user: UserId, mood: &str) -> Result<(), EngineError> {
        self.with_room(room, |data| {
            data.moods.insert(user, mood.to_string());
        });
        Ok(())
    }

    async fn submit_roti_vote(
        &self,
        room: &RoomId,
        user: UserId,
        rating: u8,
    ) -> Result<(), EngineError> {
        self.with_room(room, |data| {
            data.roti_votes.insert(user, rating);
        });
        Ok(())
    }

    async fn roti_votes(&self, room: &RoomId) -> Result<Vec<RotiVoteRecord>, EngineError> {
        Ok(self.with_room(room, |data| {
            data.roti_votes
                .iter()
                .map(|(&user_id, &rating)| RotiVoteRecord { user_id, rating })
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn descendants_follows_the_group_chain_transitively() {
        let repo = InMemoryRepository::new();
        let room = RoomId::new("sess-1");
        let author = UserId::generate();
        let a = repo.create_item(&room, "ideas", "a", author).await.unwrap();
        let b = repo.create_item(&room, "ideas", "b", author).await.unwrap();
        let c = repo.create_item(&room, "ideas", "c", author).await.unwrap();
        repo.set_item_group(&room, b.id, Some(a.id)).await.unwrap();
        repo.set_item_group(&room, c.id, Some(b.id)).await.unwrap();

        let mut descendants = repo.descendants(&room, a.id).await.unwrap();
        descendants.sort_by_key(|id| id.to_string());
        let mut expected = vec![b.id, c.id];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(descendants, expected);
    }

    #[tokio::test]
    async fn vote_counts_are_scoped_per_user_and_per_item() {
        let repo = InMemoryRepository::new();
        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let item = ItemId::generate();
        assert_eq!(repo.add_vote(&room, user, item).await.unwrap(), 1);
        assert_eq!(repo.add_vote(&room, user, item).await.unwrap(), 2);
        let (total, per_item) = repo.vote_counts(&room, user, item).await.unwrap();
        assert_eq!((total, per_item), (2, 2));
    }
}
