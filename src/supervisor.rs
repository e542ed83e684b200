//! Supervisor
//!
//! Root of the runtime structure: the fixed application namespaces from
//! configuration, the hub of locally-owned connections, and the
//! membership store backend picked by configuration.
//!
//! Also the event bus. Publishing in standalone mode walks the channel's
//! subscribers locally. In distributed mode the publish side only puts an
//! [`EventRequest`] on the Redis events topic; local sockets everywhere
//! (including in the publishing process) are reached by each process's
//! subscriber loop.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info};

use crate::config::{AppConfig, Config};
use crate::error::AppError;
use crate::hub::{Hub, generate_socket_id};
use crate::pusher;
use crate::store::{Channel, ChannelStore, MemoryStore, RedisStore};

/// Back-off before re-subscribing after the event subscription drops.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// The actual event to be sent.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Always a string on the wire; structured payloads are serialized
    /// before they get here.
    pub data: String,
}

/// Packet dispersed via the pub/sub topic in distributed mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventRequest {
    pub name: String,
    pub data: String,
    pub application: String,
    pub channel: String,
}

/// Called for every event request received from the pub/sub topic.
/// Returning false suppresses the local fan-out. Mainly used for testing.
pub type EventCallback = Box<dyn Fn(&EventRequest) -> bool + Send + Sync>;

/// Supervisor over applications, users, channels and the event bus.
pub struct Supervisor {
    config: Config,
    hub: Hub,
    store: Arc<dyn ChannelStore>,
    redis: Option<Arc<RedisStore>>,
    event_callback: Mutex<Option<EventCallback>>,
    shutdown: watch::Sender<bool>,
}

impl Supervisor {
    /// Build the supervisor: a Redis-backed store when the config carries
    /// a Redis address, the in-memory store otherwise.
    pub async fn new(config: Config) -> Result<Arc<Self>, AppError> {
        let (redis, store): (Option<Arc<RedisStore>>, Arc<dyn ChannelStore>) =
            if config.distributed() {
                let redis = Arc::new(RedisStore::connect(&config.redis).await?);
                (Some(redis.clone()), redis)
            } else {
                (None, Arc::new(MemoryStore::new()))
            };

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            hub: Hub::new(),
            store,
            redis,
            event_callback: Mutex::new(None),
            shutdown,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The named application.
    pub fn app(&self, name: &str) -> Result<&AppConfig, AppError> {
        self.config
            .app(name)
            .ok_or_else(|| AppError::not_found("No such application"))
    }

    /// The application with the given public key.
    pub fn app_by_key(&self, key: &str) -> Result<&AppConfig, AppError> {
        self.config
            .app_by_key(key)
            .ok_or_else(|| AppError::not_found("Unknown application key"))
    }

    /// Names of all configured applications, in configuration order.
    pub fn application_names(&self) -> Vec<String> {
        self.config
            .applications
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    /// All channels of the application.
    pub async fn channels(&self, app: &str) -> Result<HashMap<String, Channel>, AppError> {
        self.app(app)?;
        self.store.list_channels(app).await
    }

    /// The named channel, created empty on miss.
    pub async fn get_or_create_channel(
        &self,
        app: &str,
        channel: &str,
    ) -> Result<Channel, AppError> {
        self.app(app)?;
        self.store.get_or_create_channel(app, channel).await
    }

    /// Create a new user for a fresh connection: allocate the lowest free
    /// ID, generate a socket ID, and register the outbound queue with the
    /// hub. Returns the receiving end for the connection task.
    pub async fn add_user(&self, app: &str) -> Result<NewUser, AppError> {
        self.app(app)?;
        let uid = self.store.allocate_user_id(app).await?;
        let socket_id = generate_socket_id();
        let outbound = self.hub.register(app, uid, socket_id.clone());
        Ok(NewUser {
            uid,
            socket_id,
            outbound,
        })
    }

    /// Tear a user down: drop the local registration, purge it from every
    /// channel it subscribed, then release its ID for reuse.
    pub async fn remove_user(&self, app: &str, uid: u32) -> Result<(), AppError> {
        self.app(app)?;
        if self.hub.remove(app, uid).is_none() {
            return Err(AppError::internal(format!(
                "remove_user called on an unmanaged user (app={app}, uid={uid})"
            )));
        }

        let channels = self.store.list_channels(app).await?;
        for (name, channel) in &channels {
            if !channel.users.contains_key(&uid) {
                continue;
            }
            if let Err(err) = self.store.remove_user_from_channel(app, name, uid).await {
                info!(app, channel = %name, uid, error = %err,
                    "removing user from channel failed");
            }
        }

        self.store.release_user_id(app, uid).await
    }

    /// Let the user subscribe the named channel. The user must be owned
    /// by this process.
    pub async fn subscribe(&self, app: &str, uid: u32, channel: &str) -> Result<(), AppError> {
        self.app(app)?;
        if !self.hub.contains(app, uid) {
            return Err(AppError::internal(format!(
                "subscribe called on an unmanaged user (app={app}, uid={uid}, channel={channel})"
            )));
        }
        self.store.subscribe(app, channel, uid).await
    }

    /// Let the user unsubscribe the named channel. The user must be owned
    /// by this process.
    pub async fn unsubscribe(&self, app: &str, uid: u32, channel: &str) -> Result<(), AppError> {
        self.app(app)?;
        if !self.hub.contains(app, uid) {
            return Err(AppError::internal(format!(
                "unsubscribe called on an unmanaged user (app={app}, uid={uid}, channel={channel})"
            )));
        }
        self.store.unsubscribe(app, channel, uid).await
    }

    /// Send the event to every user subscribing the channel, wherever its
    /// connection lives. Standalone: walk the channel locally.
    /// Distributed: publish to the events topic and let every process's
    /// subscriber loop (this one included) deliver to its own sockets.
    pub async fn broadcast(&self, app: &str, event: &Event, channel: &str) -> Result<(), AppError> {
        if let Some(redis) = &self.redis {
            debug!(event = %event.name, channel, "queueing");
            return redis
                .publish_event(&EventRequest {
                    name: event.name.clone(),
                    data: event.data.clone(),
                    application: app.to_string(),
                    channel: channel.to_string(),
                })
                .await;
        }
        self.fan_out(app, event, channel).await
    }

    /// Deliver the event to every subscribed user this process owns.
    async fn fan_out(&self, app: &str, event: &Event, channel: &str) -> Result<(), AppError> {
        debug!(event = %event.name, channel, "broadcasting");
        let record = self.store.get_or_create_channel(app, channel).await?;
        let frame = pusher::encode_frame(&event.name, channel, &Value::String(event.data.clone()))
            .map_err(|err| AppError::wrap(500, err))?;

        for &uid in record.users.keys() {
            if !self.hub.send(app, uid, frame.clone()).await {
                debug!(app, uid, "subscriber has no local socket");
            }
        }
        Ok(())
    }

    /// Handle one event request received from the pub/sub topic.
    pub async fn handle_event_request(&self, request: EventRequest) -> Result<(), AppError> {
        {
            let callback = self.event_callback.lock();
            if let Some(callback) = callback.as_ref()
                && !callback(&request)
            {
                return Ok(());
            }
        }

        let app = self.app(&request.application)?.name.clone();
        let event = Event {
            name: request.name,
            data: request.data,
        };
        self.fan_out(&app, &event, &request.channel).await
    }

    /// Install the event interception callback.
    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.event_callback.lock() = Some(callback);
    }

    /// Spawn the long-lived subscriber loop. No-op in standalone mode.
    /// The loop re-subscribes with a fixed back-off until shutdown.
    pub fn start_event_subscriber(self: &Arc<Self>) {
        let Some(redis) = self.redis.clone() else {
            return;
        };
        let supervisor = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!("starting event subscriber");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("event subscriber shut down");
                        return;
                    }
                    result = supervisor.receive_events(&redis) => {
                        if let Err(err) = result {
                            error!(error = %err, "event subscription lost, retrying");
                        }
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("event subscriber shut down");
                        return;
                    }
                    _ = sleep(RESUBSCRIBE_BACKOFF) => {}
                }
            }
        });
    }

    async fn receive_events(&self, redis: &RedisStore) -> Result<(), AppError> {
        let mut subscription = redis.event_subscription().await?;
        let mut messages = subscription.on_message();

        while let Some(message) = messages.next().await {
            let payload: String = message.get_payload()?;
            match serde_json::from_str::<EventRequest>(&payload) {
                Ok(request) => {
                    if let Err(err) = self.handle_event_request(request).await {
                        info!(error = %err, "event request handling failed");
                    }
                }
                Err(err) => {
                    info!(error = %err, payload, "event message decoding error");
                }
            }
        }

        Err(AppError::internal("event subscription stream closed"))
    }

    /// Signal every background lane to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

/// What a fresh connection gets back from [`Supervisor::add_user`].
pub struct NewUser {
    pub uid: u32,
    pub socket_id: String,
    pub outbound: mpsc::Receiver<String>,
}
