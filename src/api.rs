//! Admin REST API
//!
//! Thin projection of membership and the event bus over HTTP. The JSON
//! mapping of the response structures matches the Pusher API, including
//! its habit of omitting zero counts: a channel nobody ever touched
//! reads back as `{}`.
//!
//! Channel-status and channel-users lookups go through get-or-create, so
//! asking about a channel brings it into existence. Both backends behave
//! the same way here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::timeout::TimeoutLayer;
use tracing::error;

use crate::error::AppError;
use crate::pusher;
use crate::supervisor::{Event, Supervisor};

/// Request timeout for the REST surface. The WebSocket endpoint is not
/// behind this layer; its connections are long-lived.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub fn router() -> Router<Arc<Supervisor>> {
    Router::new()
        .route("/apps", get(list_applications))
        .route("/apps/{app}/channels", get(app_channels))
        .route("/apps/{app}/channels/{chan}", get(channel_status))
        .route("/apps/{app}/channels/{chan}/users", get(channel_users))
        .route("/apps/{app}/events", post(publish_events))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[derive(Serialize)]
struct ApplicationsResponse {
    applications: Vec<String>,
}

#[derive(Serialize)]
struct ChannelsResponse {
    channels: HashMap<String, ChannelsItem>,
}

#[derive(Serialize)]
struct ChannelsItem {
    user_count: usize,
}

#[derive(Serialize, Default)]
struct ChannelStatus {
    #[serde(skip_serializing_if = "is_false")]
    occupied: bool,
    #[serde(skip_serializing_if = "is_zero")]
    subscription_count: u64,
    #[serde(skip_serializing_if = "is_zero")]
    user_count: u64,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<UserItem>,
}

#[derive(Serialize)]
struct UserItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    name: String,
    channels: Vec<String>,
    /// Usually a string; structured payloads are serialized before
    /// broadcasting.
    data: Value,
    /// Accepted for Pusher API compatibility; sender exclusion is not
    /// implemented.
    #[serde(default)]
    #[allow(dead_code)]
    socket_id: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

async fn list_applications(
    State(supervisor): State<Arc<Supervisor>>,
) -> Json<ApplicationsResponse> {
    Json(ApplicationsResponse {
        applications: supervisor.application_names(),
    })
}

async fn app_channels(
    Path(app): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<Json<ChannelsResponse>, AppError> {
    let channels = supervisor.channels(&app).await?;
    Ok(Json(ChannelsResponse {
        channels: channels
            .into_iter()
            .map(|(name, channel)| {
                (
                    name,
                    ChannelsItem {
                        user_count: channel.user_count(),
                    },
                )
            })
            .collect(),
    }))
}

async fn channel_status(
    Path((app, chan)): Path<(String, String)>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<Json<ChannelStatus>, AppError> {
    let channel = supervisor.get_or_create_channel(&app, &chan).await?;

    let mut status = ChannelStatus {
        occupied: channel.user_count() > 0,
        subscription_count: channel.subscription_count(),
        user_count: 0,
    };
    if chan.starts_with(pusher::PRESENCE_PREFIX) {
        status.user_count = channel.user_count() as u64;
    }
    Ok(Json(status))
}

async fn channel_users(
    Path((app, chan)): Path<(String, String)>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<Json<UsersResponse>, AppError> {
    let channel = supervisor.get_or_create_channel(&app, &chan).await?;

    let mut uids: Vec<u32> = channel.users.keys().copied().collect();
    uids.sort_unstable();
    Ok(Json(UsersResponse {
        users: uids
            .into_iter()
            .map(|uid| UserItem {
                id: uid.to_string(),
            })
            .collect(),
    }))
}

async fn publish_events(
    Path(app): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let request: PublishRequest =
        serde_json::from_str(&body).map_err(|err| AppError::wrap(400, err))?;
    let application = supervisor.app(&app)?.name.clone();

    let data = match request.data {
        Value::String(data) => data,
        other => serde_json::to_string(&other)?,
    };
    let event = Event {
        name: request.name,
        data,
    };

    for channel in &request.channels {
        if let Err(err) = supervisor.broadcast(&application, &event, channel).await {
            error!(app = %application, channel = %channel, error = %err, "broadcast error");
        }
    }

    Ok(Json(Value::Null))
}
