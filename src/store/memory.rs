//! In-memory membership backend
//!
//! Process-local maps. Intended for standalone deployments; all state is
//! lost on restart and never shared across processes.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AppError;
use crate::store::{Channel, ChannelStore, lowest_free_id};

#[derive(Default)]
struct AppState {
    channels: HashMap<String, Channel>,
    uids: HashSet<u32>,
}

/// In-memory membership store.
///
/// Application entries materialize on first use; the supervisor has
/// already validated the application name against configuration.
#[derive(Default)]
pub struct MemoryStore {
    apps: DashMap<String, AppState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn list_channels(&self, app: &str) -> Result<HashMap<String, Channel>, AppError> {
        Ok(self
            .apps
            .get(app)
            .map(|state| state.channels.clone())
            .unwrap_or_default())
    }

    async fn channel(&self, app: &str, channel: &str) -> Result<Channel, AppError> {
        self.apps
            .get(app)
            .and_then(|state| state.channels.get(channel).cloned())
            .ok_or_else(|| AppError::not_found("No such channel"))
    }

    async fn get_or_create_channel(&self, app: &str, channel: &str) -> Result<Channel, AppError> {
        let mut state = self.apps.entry(app.to_string()).or_default();
        Ok(state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel))
            .clone())
    }

    async fn subscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError> {
        let mut state = self.apps.entry(app.to_string()).or_default();
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel))
            .subscribe_user(uid);
        Ok(())
    }

    async fn unsubscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError> {
        if let Some(mut state) = self.apps.get_mut(app)
            && let Some(ch) = state.channels.get_mut(channel)
        {
            ch.unsubscribe_user(uid);
        }
        Ok(())
    }

    async fn remove_user_from_channel(
        &self,
        app: &str,
        channel: &str,
        uid: u32,
    ) -> Result<(), AppError> {
        if let Some(mut state) = self.apps.get_mut(app)
            && let Some(ch) = state.channels.get_mut(channel)
        {
            ch.remove_user(uid);
        }
        Ok(())
    }

    async fn allocate_user_id(&self, app: &str) -> Result<u32, AppError> {
        let mut state = self.apps.entry(app.to_string()).or_default();
        let live: Vec<u32> = state.uids.iter().copied().collect();
        let uid = lowest_free_id(&live);
        state.uids.insert(uid);
        Ok(uid)
    }

    async fn release_user_id(&self, app: &str, uid: u32) -> Result<(), AppError> {
        if let Some(mut state) = self.apps.get_mut(app) {
            state.uids.remove(&uid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocation_is_dense() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 0);
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 1);
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 2);
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_allocation_reuses_freed_id() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.allocate_user_id("testapp").await.unwrap();
        }

        // current = {0,2} -> next allocation returns 1
        store.release_user_id("testapp", 1).await.unwrap();
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 1);

        // current = {0,1,2} -> next returns 3
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_release_unknown_id_is_noop() {
        let store = MemoryStore::new();
        store.release_user_id("testapp", 42).await.unwrap();
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allocation_is_per_application() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_user_id("testapp").await.unwrap(), 0);
        assert_eq!(store.allocate_user_id("testapp2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_creates_channel() {
        let store = MemoryStore::new();
        store.subscribe("testapp", "my-channel", 0).await.unwrap();

        let ch = store.channel("testapp", "my-channel").await.unwrap();
        assert_eq!(ch.users.get(&0), Some(&1));
    }

    #[tokio::test]
    async fn test_strict_lookup_of_absent_channel() {
        let store = MemoryStore::new();
        let err = store.channel("testapp", "nochannel").await.unwrap_err();
        assert_eq!(err.code, 404);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        store
            .get_or_create_channel("testapp", "my-channel")
            .await
            .unwrap();
        store.subscribe("testapp", "my-channel", 5).await.unwrap();

        let ch = store
            .get_or_create_channel("testapp", "my-channel")
            .await
            .unwrap();
        assert_eq!(ch.users.get(&5), Some(&1));
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_channel_is_noop() {
        let store = MemoryStore::new();
        store.unsubscribe("testapp", "nochannel", 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_user_purges_multi_subscription() {
        let store = MemoryStore::new();
        store.subscribe("testapp", "my-channel", 0).await.unwrap();
        store.subscribe("testapp", "my-channel", 0).await.unwrap();

        store
            .remove_user_from_channel("testapp", "my-channel", 0)
            .await
            .unwrap();
        let ch = store.channel("testapp", "my-channel").await.unwrap();
        assert!(ch.users.is_empty());
    }

    #[tokio::test]
    async fn test_list_channels() {
        let store = MemoryStore::new();
        assert!(store.list_channels("testapp").await.unwrap().is_empty());

        store.subscribe("testapp", "a", 0).await.unwrap();
        store.subscribe("testapp", "b", 0).await.unwrap();

        let channels = store.list_channels("testapp").await.unwrap();
        assert_eq!(channels.len(), 2);
        assert!(channels.contains_key("a"));
        assert!(channels.contains_key("b"));
    }
}
