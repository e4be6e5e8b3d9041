use crate::error::{ApiError, Result};
use crate::{AuthUser, State};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use palaver_common::{ChatMessage, ServerEvent, UserId};
use serde::Deserialize;
use uuid::Uuid;

// One key space per unordered pair; both directions land under the same
// prefix so a single scan yields the conversation in order.
fn conversation_prefix(a: &UserId, b: &UserId) -> String {
    let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("message/{}/{}/", first.0, second.0)
}

fn message_key(message: &ChatMessage) -> String {
    format!(
        "{}{:020}/{}",
        conversation_prefix(&message.sender_id, &message.receiver_id),
        message.created_at.timestamp_millis(),
        message.id
    )
}

pub fn store_message(state: &State, message: &ChatMessage) -> Result<()> {
    state
        .db
        .insert(message_key(message), serde_json::to_vec(message)?)?;
    Ok(())
}

pub fn conversation(state: &State, a: &UserId, b: &UserId) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::new();
    for entry in state.db.scan_prefix(conversation_prefix(a, b).as_bytes()) {
        let (_, value) = entry?;
        messages.push(serde_json::from_slice(&value)?);
    }
    Ok(messages)
}

#[derive(Deserialize)]
pub struct SendMessage {
    pub text: String,
}

pub async fn send(
    Extension(state): Extension<State>,
    AuthUser(sender): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SendMessage>,
) -> Result<(StatusCode, Json<ChatMessage>)> {
    let receiver_id = UserId(id);
    state.user(&receiver_id)?;
    if !sender.is_friend(&receiver_id) {
        return Err(ApiError::NotFriends);
    }
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        sender_id: sender.id.clone(),
        receiver_id: receiver_id.clone(),
        text: body.text,
        created_at: Utc::now(),
    };
    store_message(&state, &message)?;
    state
        .registry
        .push(
            &receiver_id,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn history(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>> {
    Ok(Json(conversation(&state, &caller.id, &UserId(id))?))
}
