//! Local Connection Hub
//!
//! Registry of the WebSocket users this process owns, keyed by
//! `(application, user id)`. Publishers and the pub/sub receiver hand
//! encoded frames to the hub; each frame lands on the per-connection
//! outbound queue and is written by that connection's own task.
//!
//! A user ID lives in the hub of exactly one process: whichever accepted
//! the connection.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound queue capacity per connection.
const OUTBOUND_CAPACITY: usize = 64;

/// A locally-owned user: the live side of one WebSocket.
#[derive(Debug, Clone)]
pub struct UserHandle {
    pub uid: u32,
    /// Opaque per-connection identifier used in private-channel
    /// signatures.
    pub socket_id: String,
    outbound: mpsc::Sender<String>,
}

/// Hub of all locally-owned users.
#[derive(Debug, Default)]
pub struct Hub {
    users: DashMap<(String, u32), UserHandle>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbound queue for a fresh connection and register its
    /// user. Returns the receiving end for the connection task.
    pub fn register(&self, app: &str, uid: u32, socket_id: String) -> mpsc::Receiver<String> {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        debug!(app, uid, socket_id, "user registered");
        self.users.insert(
            (app.to_string(), uid),
            UserHandle {
                uid,
                socket_id,
                outbound,
            },
        );
        rx
    }

    /// Drop a user's registration. Closing the outbound queue ends the
    /// connection task's write side.
    pub fn remove(&self, app: &str, uid: u32) -> Option<UserHandle> {
        let removed = self.users.remove(&(app.to_string(), uid));
        if removed.is_some() {
            debug!(app, uid, "user removed");
        }
        removed.map(|(_, handle)| handle)
    }

    /// Whether this process owns the user.
    pub fn contains(&self, app: &str, uid: u32) -> bool {
        self.users.contains_key(&(app.to_string(), uid))
    }

    /// Queue an encoded frame for one locally-owned user. Returns false
    /// when the user is not here or its connection is going away.
    pub async fn send(&self, app: &str, uid: u32, frame: String) -> bool {
        // Clone the sender out before awaiting; holding a map guard
        // across the send would block other lanes.
        let outbound = self
            .users
            .get(&(app.to_string(), uid))
            .map(|handle| handle.outbound.clone());

        match outbound {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Number of locally-owned users across all applications.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// Generate a fresh socket ID: two random 64-bit integers joined by '.'.
/// Drawn from the thread-local CSPRNG so two processes will not collide
/// in practice.
pub fn generate_socket_id() -> String {
    format!("{}.{}", rand::random::<u64>(), rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_send_remove() {
        let hub = Hub::new();
        let mut rx = hub.register("testapp", 0, "1.2".to_string());

        assert!(hub.contains("testapp", 0));
        assert!(hub.send("testapp", 0, "frame".to_string()).await);
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));

        let handle = hub.remove("testapp", 0).unwrap();
        assert_eq!(handle.uid, 0);
        assert_eq!(handle.socket_id, "1.2");
        assert!(!hub.contains("testapp", 0));
        drop(handle);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_user() {
        let hub = Hub::new();
        assert!(!hub.send("testapp", 9, "frame".to_string()).await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let hub = Hub::new();
        let _rx = hub.register("testapp", 0, "1.2".to_string());
        assert!(hub.remove("testapp", 0).is_some());
        assert!(hub.remove("testapp", 0).is_none());
    }

    #[tokio::test]
    async fn test_same_uid_in_different_apps() {
        let hub = Hub::new();
        let _a = hub.register("testapp", 0, "1.2".to_string());
        let _b = hub.register("testapp2", 0, "3.4".to_string());

        assert_eq!(hub.user_count(), 2);
        assert!(hub.contains("testapp", 0));
        assert!(hub.contains("testapp2", 0));
    }

    #[test]
    fn test_socket_id_shape() {
        let sid = generate_socket_id();
        let (a, b) = sid.split_once('.').unwrap();
        a.parse::<u64>().unwrap();
        b.parse::<u64>().unwrap();
    }
}
