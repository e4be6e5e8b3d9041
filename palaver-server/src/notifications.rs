use crate::error::Result;
use crate::{AuthUser, State};
use axum::{Extension, Json};
use chrono::Utc;
use palaver_common::{Notification, NotificationKind, ServerEvent, UserId};
use uuid::Uuid;

// Keys sort by timestamp so a prefix scan yields chronological order.
fn notification_key(notification: &Notification) -> String {
    format!(
        "notif/{}/{:020}/{}",
        notification.receiver_id.0,
        notification.created_at.timestamp_millis(),
        notification.id
    )
}

fn user_prefix(user: &UserId) -> String {
    format!("notif/{}/", user.0)
}

#[derive(Copy, Clone, Debug)]
pub enum RequestEvent {
    Sent,
    Accepted,
    Rejected,
}

pub fn store_notification(state: &State, notification: &Notification) -> Result<()> {
    state.db.insert(
        notification_key(notification),
        serde_json::to_vec(notification)?,
    )?;
    Ok(())
}

/// Fans a friend-request lifecycle event out to the durable store and,
/// when the target holds a live connection, to an immediate push.
///
/// `sender` and `receiver` keep the request's original orientation;
/// `actor_name` is the display name of the user who triggered the event
/// (the sender for `Sent`, the receiver for `Accepted`/`Rejected`).
/// Acceptance writes no record of its own: the triggering notification
/// was already deleted with the accept commit, and the confirmation is
/// delivered purely via push.
pub async fn notify(
    state: &State,
    event: RequestEvent,
    sender: &UserId,
    actor_name: &str,
    receiver: &UserId,
) -> Result<()> {
    let (target, record) = match event {
        RequestEvent::Sent => (
            receiver,
            Some(Notification {
                id: Uuid::new_v4().to_string(),
                sender_id: sender.clone(),
                sender_name: actor_name.to_string(),
                receiver_id: receiver.clone(),
                message: format!("{actor_name} sent you a friend request"),
                kind: NotificationKind::FriendRequest,
                read: false,
                created_at: Utc::now(),
            }),
        ),
        RequestEvent::Accepted => (sender, None),
        RequestEvent::Rejected => (
            sender,
            Some(Notification {
                id: Uuid::new_v4().to_string(),
                sender_id: receiver.clone(),
                sender_name: actor_name.to_string(),
                receiver_id: sender.clone(),
                message: format!("{actor_name} rejected your friend request"),
                kind: NotificationKind::FriendRequestRejected,
                read: false,
                created_at: Utc::now(),
            }),
        ),
    };
    if let Some(record) = &record {
        store_notification(state, record)?;
    }
    let push = match event {
        RequestEvent::Sent => ServerEvent::FriendRequestReceived {
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
        },
        RequestEvent::Accepted => ServerEvent::FriendRequestAccepted {
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
        },
        RequestEvent::Rejected => ServerEvent::FriendRequestRejected {
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
        },
    };
    state.registry.push(target, push).await;
    Ok(())
}

pub fn list_notifications(state: &State, user: &UserId) -> Result<Vec<Notification>> {
    let mut notifications = Vec::new();
    for entry in state.db.scan_prefix(user_prefix(user).as_bytes()).rev() {
        let (_, value) = entry?;
        notifications.push(serde_json::from_slice(&value)?);
    }
    Ok(notifications)
}

/// Keys of the stored friend-request notifications `sender` produced for
/// `receiver`, for deletion alongside the accept commit.
pub fn request_notification_keys(
    state: &State,
    receiver: &UserId,
    sender: &UserId,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in state.db.scan_prefix(user_prefix(receiver).as_bytes()) {
        let (key, value) = entry?;
        let notification: Notification = serde_json::from_slice(&value)?;
        if notification.kind == NotificationKind::FriendRequest && notification.sender_id == *sender
        {
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
    }
    Ok(keys)
}

pub async fn list(
    Extension(state): Extension<State>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<Notification>>> {
    Ok(Json(list_notifications(&state, &caller.id)?))
}
