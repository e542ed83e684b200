//! Membership store abstraction
//!
//! Channels and user-ID allocation live behind a single contract with two
//! backends:
//!
//! - `memory` - process-local maps for standalone deployments
//! - `redis` - shared keys in Redis for multi-process deployments
//!
//! Channels are implicit: created on first subscribe or first publish,
//! never explicitly deleted. Applications themselves are fixed at startup
//! from configuration and are resolved by the supervisor, not here.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A named multicast destination scoped to one application.
///
/// `users` maps a user ID to its subscription count. A user appears here
/// iff it holds at least one outstanding subscription; the entry is
/// removed when the count would reach zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub users: HashMap<u32, u32>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: HashMap::new(),
        }
    }

    /// Number of users subscribing the channel.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of subscriptions. A user can subscribe the same channel
    /// multiple times, so this can be greater than `user_count`.
    pub fn subscription_count(&self) -> u64 {
        self.users.values().map(|&n| u64::from(n)).sum()
    }

    /// Record one more subscription by `uid`. Returns the new count.
    pub fn subscribe_user(&mut self, uid: u32) -> u32 {
        let count = self.users.entry(uid).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one subscription by `uid`, removing the entry at zero.
    /// Returns the updated count; unsubscribing a non-subscriber is a
    /// no-op returning 0.
    pub fn unsubscribe_user(&mut self, uid: u32) -> u32 {
        match self.users.get_mut(&uid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.users.remove(&uid);
                0
            }
            None => 0,
        }
    }

    /// Remove the user's entry outright, whatever its count. Used on
    /// disconnect so a departed user never lingers in the map.
    pub fn remove_user(&mut self, uid: u32) -> bool {
        self.users.remove(&uid).is_some()
    }
}

/// The membership-store contract shared by both backends.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// All channels of the application, keyed by name.
    async fn list_channels(&self, app: &str) -> Result<HashMap<String, Channel>, AppError>;

    /// The named channel. Strict: an absent channel is NotFound.
    async fn channel(&self, app: &str, channel: &str) -> Result<Channel, AppError>;

    /// The named channel, created empty on miss.
    async fn get_or_create_channel(&self, app: &str, channel: &str) -> Result<Channel, AppError>;

    /// Increment the user's subscription count, creating the channel if
    /// needed.
    async fn subscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError>;

    /// Decrement the user's subscription count, removing the entry at
    /// zero. Unsubscribing from a channel that was never subscribed is a
    /// no-op.
    async fn unsubscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError>;

    /// Purge the user from the channel regardless of its count.
    async fn remove_user_from_channel(
        &self,
        app: &str,
        channel: &str,
        uid: u32,
    ) -> Result<(), AppError>;

    /// Allocate the smallest non-negative user ID not currently live in
    /// the application.
    async fn allocate_user_id(&self, app: &str) -> Result<u32, AppError>;

    /// Return a user ID to the pool. Idempotent; releasing an unknown ID
    /// is not an error.
    async fn release_user_id(&self, app: &str, uid: u32) -> Result<(), AppError>;
}

/// Smallest non-negative integer absent from `ids`. A dense range
/// `[0..n-1]` yields `n`.
pub(crate) fn lowest_free_id(ids: &[u32]) -> u32 {
    let mut taken = vec![false; ids.len()];
    for &id in ids {
        if let Some(slot) = taken.get_mut(id as usize) {
            *slot = true;
        }
    }
    taken
        .iter()
        .position(|&t| !t)
        .map(|i| i as u32)
        .unwrap_or(ids.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_counts() {
        let mut ch = Channel::new("my-channel");
        assert_eq!(ch.subscribe_user(0), 1);
        assert_eq!(ch.subscribe_user(0), 2);
        assert_eq!(ch.subscribe_user(1), 1);

        assert_eq!(ch.user_count(), 2);
        assert_eq!(ch.subscription_count(), 3);
    }

    #[test]
    fn test_unsubscribe_to_zero_removes_entry() {
        let mut ch = Channel::new("my-channel");
        ch.subscribe_user(0);
        ch.subscribe_user(0);

        assert_eq!(ch.unsubscribe_user(0), 1);
        assert!(ch.users.contains_key(&0));
        assert_eq!(ch.unsubscribe_user(0), 0);
        assert!(!ch.users.contains_key(&0));
        assert_eq!(ch.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_never_subscribed_is_noop() {
        let mut ch = Channel::new("my-channel");
        assert_eq!(ch.unsubscribe_user(7), 0);
        assert_eq!(ch.user_count(), 0);
    }

    #[test]
    fn test_counts_stay_consistent() {
        // SubscriptionCount == sum of per-user counts, every count >= 1
        let mut ch = Channel::new("my-channel");
        ch.subscribe_user(0);
        ch.subscribe_user(1);
        ch.subscribe_user(1);
        ch.unsubscribe_user(0);

        assert!(ch.users.values().all(|&n| n >= 1));
        assert_eq!(
            ch.subscription_count(),
            ch.users.values().map(|&n| u64::from(n)).sum::<u64>()
        );
        assert!(ch.subscription_count() >= ch.user_count() as u64);
    }

    #[test]
    fn test_remove_user_drops_all_subscriptions() {
        let mut ch = Channel::new("my-channel");
        ch.subscribe_user(0);
        ch.subscribe_user(0);
        ch.subscribe_user(0);

        assert!(ch.remove_user(0));
        assert!(!ch.remove_user(0));
        assert_eq!(ch.user_count(), 0);
    }

    #[test]
    fn test_lowest_free_id() {
        assert_eq!(lowest_free_id(&[]), 0);
        assert_eq!(lowest_free_id(&[0, 2]), 1);
        assert_eq!(lowest_free_id(&[0, 1, 2, 3]), 4);
        assert_eq!(lowest_free_id(&[1, 2]), 0);
    }

    #[test]
    fn test_channel_record_roundtrip() {
        let mut ch = Channel::new("my-channel");
        ch.subscribe_user(3);
        ch.subscribe_user(3);

        let raw = serde_json::to_string(&ch).unwrap();
        // integer keys serialize as JSON strings
        assert!(raw.contains(r#""3":2"#));

        let back: Channel = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.name, "my-channel");
        assert_eq!(back.users.get(&3), Some(&2));
    }
}
