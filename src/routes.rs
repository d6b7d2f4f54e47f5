use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::events::{self, Event};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/internal/events", post(publish_event))
        .merge(crate::gateway::server::router())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Body of the data API's post-commit hook. Identifiers are strings on
/// the wire; the room is derived here from the stable id so every
/// instance computes the same address.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DomainEventBody {
    ThreadCreated {
        episode_id: String,
        thread: Value,
    },
    PostCreated {
        episode_id: String,
        post: Value,
    },
    ReactionToggled {
        episode_id: String,
        post_id: String,
        user_id: String,
        emoji: String,
        active: bool,
    },
    DmMessageCreated {
        conversation_id: String,
        message: Value,
    },
    DmReadUpdated {
        conversation_id: String,
        user_id: String,
        last_read_post_id: String,
    },
}

/// The only entry point for domain events: called by the data API after a
/// write commits. The publish is handed off to the pump task, so the
/// caller never waits on fan-out.
async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DomainEventBody>,
) -> Result<StatusCode, ApiError> {
    authorize_internal(&state, &headers)?;

    let (room, event) = match body {
        DomainEventBody::ThreadCreated { episode_id, thread } => (
            events::discussion_room(&episode_id),
            Event::thread_created(&episode_id, thread),
        ),
        DomainEventBody::PostCreated { episode_id, post } => (
            events::discussion_room(&episode_id),
            Event::post_created(&episode_id, post),
        ),
        DomainEventBody::ReactionToggled {
            episode_id,
            post_id,
            user_id,
            emoji,
            active,
        } => (
            events::discussion_room(&episode_id),
            Event::reaction_toggled(&post_id, &user_id, &emoji, active),
        ),
        DomainEventBody::DmMessageCreated {
            conversation_id,
            message,
        } => (
            events::dm_room(&conversation_id),
            Event::dm_message_created(&conversation_id, message),
        ),
        DomainEventBody::DmReadUpdated {
            conversation_id,
            user_id,
            last_read_post_id,
        } => (
            events::dm_room(&conversation_id),
            Event::dm_read_updated(&conversation_id, &user_id, &last_read_post_id),
        ),
    };

    state.publisher.try_publish(room, event);
    Ok(StatusCode::ACCEPTED)
}

fn authorize_internal(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    if token != state.config.internal_api_token {
        return Err(ApiError::unauthorized("Invalid internal token"));
    }
    Ok(())
}
