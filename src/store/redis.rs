//! Redis membership backend
//!
//! Authoritative state for distributed deployments. Key families, flat
//! namespace in the selected logical database:
//!
//! - `<application>/channels/<channel>` - serialized [`Channel`] record
//! - `<application>/users`              - serialized `{"uids":[...]}`
//! - `events`                           - pub/sub topic for cross-process fan-out
//!
//! Channel state is never cached locally; every read goes to Redis.
//! Compound updates run the optimistic WATCH/GET/MULTI/SET/EXEC cycle on a
//! dedicated connection (WATCH state is per-connection) and retry on
//! conflict up to a fixed ceiling. Plain reads and PUBLISH go through a
//! shared auto-reconnecting connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Value};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::AppError;
use crate::store::{Channel, ChannelStore, lowest_free_id};
use crate::supervisor::EventRequest;

/// Pub/sub topic events are dispersed on.
pub const EVENTS_TOPIC: &str = "events";

/// Master name queried from a Sentinel quorum.
const SENTINEL_MASTER: &str = "mymaster";

/// Ceiling on dialing a connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling on optimistic-concurrency retries for one compound update.
/// Collisions are rare because writes are per-channel; hitting the
/// ceiling is surfaced as an internal error.
const CAS_MAX_ATTEMPTS: usize = 100;

/// Contents of the `<application>/users` key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UidSet {
    uids: Vec<u32>,
}

/// What a compound update decided after reading the current record.
enum CasOutcome<T> {
    /// Write the new record and commit.
    Commit { record: String, value: T },
    /// Nothing to write; unwatch and return.
    Done(T),
}

/// Redis-backed membership store.
pub struct RedisStore {
    config: RedisConfig,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect according to the config parameters, resolving the master
    /// through Sentinel when configured.
    pub async fn connect(config: &RedisConfig) -> Result<Self, AppError> {
        let client = build_client(config).await?;
        let manager = timeout(DIAL_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| AppError::internal("timed out connecting to Redis"))??;

        Ok(Self {
            config: config.clone(),
            manager,
        })
    }

    /// Dial a dedicated connection for a WATCH..EXEC sequence. Under
    /// Sentinel the master is re-resolved on every dial.
    async fn dedicated(&self) -> Result<MultiplexedConnection, AppError> {
        let client = build_client(&self.config).await?;
        timeout(DIAL_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| AppError::internal("timed out dialing Redis"))?
            .map_err(AppError::from)
    }

    /// Run one optimistic compound update: WATCH the key, read it, let
    /// `compute` derive the new record, then MULTI/SET/EXEC. A nil EXEC
    /// means another writer committed first; retry from the top.
    async fn update<T, F>(&self, key: &str, mut compute: F) -> Result<T, AppError>
    where
        F: FnMut(Option<&str>) -> Result<CasOutcome<T>, AppError> + Send,
        T: Send,
    {
        for attempt in 0..CAS_MAX_ATTEMPTS {
            let mut conn = self.dedicated().await?;
            let _: () = redis::cmd("WATCH").arg(key).query_async(&mut conn).await?;

            let current: Option<String> =
                match redis::cmd("GET").arg(key).query_async(&mut conn).await {
                    Ok(value) => value,
                    Err(err) => {
                        abort(&mut conn, "UNWATCH").await;
                        return Err(err.into());
                    }
                };

            let outcome = match compute(current.as_deref()) {
                Ok(outcome) => outcome,
                Err(err) => {
                    abort(&mut conn, "UNWATCH").await;
                    return Err(err);
                }
            };

            let (record, value) = match outcome {
                CasOutcome::Done(value) => {
                    abort(&mut conn, "UNWATCH").await;
                    return Ok(value);
                }
                CasOutcome::Commit { record, value } => (record, value),
            };

            let queued: Result<(), redis::RedisError> = async {
                let _: () = redis::cmd("MULTI").query_async(&mut conn).await?;
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(&record)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            .await;
            if let Err(err) = queued {
                abort(&mut conn, "DISCARD").await;
                return Err(err.into());
            }

            let committed: Value = match redis::cmd("EXEC").query_async(&mut conn).await {
                Ok(value) => value,
                Err(err) => {
                    abort(&mut conn, "DISCARD").await;
                    return Err(err.into());
                }
            };
            if matches!(committed, Value::Nil) {
                // Somebody committed the key since WATCH.
                debug!(key, attempt, "optimistic update conflicted, retrying");
                continue;
            }
            return Ok(value);
        }

        Err(AppError::internal(format!(
            "optimistic update on {key} exceeded {CAS_MAX_ATTEMPTS} attempts"
        )))
    }

    /// Publish an event request on the events topic.
    pub async fn publish_event(&self, request: &EventRequest) -> Result<(), AppError> {
        let payload = serde_json::to_string(request)?;
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(EVENTS_TOPIC)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to the events
    /// topic. The caller owns the receive loop and its retry policy.
    pub async fn event_subscription(&self) -> Result<PubSub, AppError> {
        let client = build_client(&self.config).await?;
        let mut pubsub = timeout(DIAL_TIMEOUT, client.get_async_pubsub())
            .await
            .map_err(|_| AppError::internal("timed out dialing Redis pub/sub"))??;
        pubsub.subscribe(EVENTS_TOPIC).await?;
        Ok(pubsub)
    }

    /// Wipe the selected logical database. Test support only.
    pub async fn flush_db(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for RedisStore {
    async fn list_channels(&self, app: &str) -> Result<HashMap<String, Channel>, AppError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{app}/channels/*");
        let mut channels = HashMap::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let raw: Option<String> =
                    redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                if let Some(raw) = raw {
                    let channel: Channel = serde_json::from_str(&raw)?;
                    channels.insert(channel.name.clone(), channel);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(channels)
    }

    async fn channel(&self, app: &str, channel: &str) -> Result<Channel, AppError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(channel_key(app, channel))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(AppError::not_found(format!(
                "No such channel: {channel} in {app}"
            ))),
        }
    }

    async fn get_or_create_channel(&self, app: &str, channel: &str) -> Result<Channel, AppError> {
        let key = channel_key(app, channel);
        self.update(&key, |current| match current {
            Some(raw) => Ok(CasOutcome::Done(serde_json::from_str(raw)?)),
            None => {
                let created = Channel::new(channel);
                Ok(CasOutcome::Commit {
                    record: serde_json::to_string(&created)?,
                    value: created,
                })
            }
        })
        .await
    }

    async fn subscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError> {
        let key = channel_key(app, channel);
        self.update(&key, |current| {
            let mut record: Channel = match current {
                Some(raw) => serde_json::from_str(raw)?,
                None => Channel::new(channel),
            };
            record.subscribe_user(uid);
            Ok(CasOutcome::Commit {
                record: serde_json::to_string(&record)?,
                value: (),
            })
        })
        .await
    }

    async fn unsubscribe(&self, app: &str, channel: &str, uid: u32) -> Result<(), AppError> {
        let key = channel_key(app, channel);
        self.update(&key, |current| {
            let Some(raw) = current else {
                // never subscribed; a no-op, same as the memory backend
                return Ok(CasOutcome::Done(()));
            };
            let mut record: Channel = serde_json::from_str(raw)?;
            record.unsubscribe_user(uid);
            Ok(CasOutcome::Commit {
                record: serde_json::to_string(&record)?,
                value: (),
            })
        })
        .await
    }

    async fn remove_user_from_channel(
        &self,
        app: &str,
        channel: &str,
        uid: u32,
    ) -> Result<(), AppError> {
        let key = channel_key(app, channel);
        self.update(&key, |current| {
            let Some(raw) = current else {
                return Ok(CasOutcome::Done(()));
            };
            let mut record: Channel = serde_json::from_str(raw)?;
            record.remove_user(uid);
            Ok(CasOutcome::Commit {
                record: serde_json::to_string(&record)?,
                value: (),
            })
        })
        .await
    }

    async fn allocate_user_id(&self, app: &str) -> Result<u32, AppError> {
        let key = users_key(app);
        self.update(&key, |current| {
            let mut set: UidSet = match current {
                Some(raw) => serde_json::from_str(raw)?,
                None => UidSet::default(),
            };
            let uid = lowest_free_id(&set.uids);
            set.uids.push(uid);
            Ok(CasOutcome::Commit {
                record: serde_json::to_string(&set)?,
                value: uid,
            })
        })
        .await
    }

    async fn release_user_id(&self, app: &str, uid: u32) -> Result<(), AppError> {
        let key = users_key(app);
        self.update(&key, |current| {
            let Some(raw) = current else {
                return Ok(CasOutcome::Done(()));
            };
            let mut set: UidSet = serde_json::from_str(raw)?;
            if !set.uids.contains(&uid) {
                // no such uid; we don't complain
                return Ok(CasOutcome::Done(()));
            }
            set.uids.retain(|&id| id != uid);
            Ok(CasOutcome::Commit {
                record: serde_json::to_string(&set)?,
                value: (),
            })
        })
        .await
    }
}

/// Best-effort UNWATCH/DISCARD before surfacing an error. The dedicated
/// connection is dropped right after, so failures here are irrelevant.
async fn abort(conn: &mut MultiplexedConnection, command: &str) {
    let _: Result<Value, _> = redis::cmd(command).query_async(conn).await;
}

fn channel_key(app: &str, channel: &str) -> String {
    format!("{app}/channels/{channel}")
}

fn users_key(app: &str) -> String {
    format!("{app}/users")
}

async fn build_client(config: &RedisConfig) -> Result<Client, AppError> {
    let (host, port) = if config.sentinel {
        resolve_master(config).await?
    } else {
        split_address(&config.address)?
    };
    Client::open(connection_info(config, host, port)).map_err(AppError::from)
}

/// Ask the Sentinel quorum for the current master address.
async fn resolve_master(config: &RedisConfig) -> Result<(String, u16), AppError> {
    let (host, port) = split_address(&config.address)?;
    let sentinel = Client::open(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host, port),
        redis: RedisConnectionInfo::default(),
    })?;
    let mut conn = timeout(DIAL_TIMEOUT, sentinel.get_multiplexed_async_connection())
        .await
        .map_err(|_| AppError::internal("timed out dialing Redis Sentinel"))??;

    let reply: Vec<String> = redis::cmd("SENTINEL")
        .arg("GET-MASTER-ADDR-BY-NAME")
        .arg(SENTINEL_MASTER)
        .query_async(&mut conn)
        .await?;

    match reply.as_slice() {
        [master_host, master_port, ..] => {
            let port = master_port.parse().map_err(|_| {
                AppError::internal(format!("sentinel returned a weird port: {master_port}"))
            })?;
            Ok((master_host.clone(), port))
        }
        _ => Err(AppError::internal(format!(
            "sentinel has no master named {SENTINEL_MASTER}"
        ))),
    }
}

fn connection_info(config: &RedisConfig, host: String, port: u16) -> ConnectionInfo {
    let addr = if config.secure {
        ConnectionAddr::TcpTls {
            host,
            port,
            insecure: false,
            tls_params: None,
        }
    } else {
        ConnectionAddr::Tcp(host, port)
    };

    ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db: config.database,
            password: (!config.password.is_empty()).then(|| config.password.clone()),
            ..Default::default()
        },
    }
}

fn split_address(address: &str) -> Result<(String, u16), AppError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AppError::internal(format!("invalid redis address: {address}")))?;
    let port = port
        .parse()
        .map_err(|_| AppError::internal(format!("invalid redis address: {address}")))?;
    Ok((host.to_string(), port))
}
