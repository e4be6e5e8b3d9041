use anyhow::Result;
use chrono::Utc;
use futures::{Stream, StreamExt};
use palaver_common::{
    FriendRequest, Notification, NotificationKind, RequestId, ServerEvent, User, UserId,
};
use tokio_tungstenite::tungstenite::protocol::Message;

pub mod client {
    //! Thin wrappers over the server's HTTP surface. The caller's
    //! identity travels in the `x-user-id` header on every call.
    use anyhow::Result;
    use palaver_common::{ChatMessage, FriendRequest, Notification, RequestId, User, UserId};
    use reqwest::Client;

    pub async fn add_user(
        http: &Client,
        base: &str,
        display_name: &str,
        password: &str,
    ) -> Result<User> {
        Ok(http
            .post(format!("{base}/add-user"))
            .json(&serde_json::json!({ "displayName": display_name, "password": password }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn search_users(
        http: &Client,
        base: &str,
        caller: &UserId,
        name: &str,
    ) -> Result<Vec<User>> {
        Ok(http
            .get(format!("{base}/friend/search/{name}"))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn send_friend_request(
        http: &Client,
        base: &str,
        caller: &UserId,
        receiver: &UserId,
    ) -> Result<FriendRequest> {
        Ok(http
            .post(format!("{base}/friend/send-request/{}", receiver.0))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn accept_friend_request(
        http: &Client,
        base: &str,
        caller: &UserId,
        request: &RequestId,
    ) -> Result<()> {
        http.put(format!("{base}/friend/accept-request/{}", request.0))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn reject_friend_request(
        http: &Client,
        base: &str,
        caller: &UserId,
        request: &RequestId,
    ) -> Result<()> {
        http.put(format!("{base}/friend/reject-request/{}", request.0))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn pending_requests(
        http: &Client,
        base: &str,
        caller: &UserId,
    ) -> Result<Vec<FriendRequest>> {
        Ok(http
            .get(format!("{base}/friend/requests"))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn friend_list(http: &Client, base: &str, caller: &UserId) -> Result<Vec<UserId>> {
        Ok(http
            .get(format!("{base}/friend/list"))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn notifications(
        http: &Client,
        base: &str,
        caller: &UserId,
    ) -> Result<Vec<Notification>> {
        Ok(http
            .get(format!("{base}/notifications"))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn send_message(
        http: &Client,
        base: &str,
        caller: &UserId,
        receiver: &UserId,
        text: &str,
    ) -> Result<ChatMessage> {
        Ok(http
            .post(format!("{base}/messages/send/{}", receiver.0))
            .header("x-user-id", &caller.0)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn message_history(
        http: &Client,
        base: &str,
        caller: &UserId,
        other: &UserId,
    ) -> Result<Vec<ChatMessage>> {
        Ok(http
            .get(format!("{base}/messages/{}", other.0))
            .header("x-user-id", &caller.0)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Connects the live event stream for `user`. Yields every decoded
/// [`ServerEvent`], ready to be fed into [`FriendSession::apply`].
pub async fn connect_events(
    base_url: &str,
    user: &UserId,
) -> Result<impl Stream<Item = Result<ServerEvent>>> {
    let ws_base = base_url.replacen("http", "ws", 1);
    let (socket, _) =
        tokio_tungstenite::connect_async(format!("{ws_base}/ws?userId={}", user.0)).await?;
    Ok(socket.filter_map(|message| async move {
        match message {
            Ok(Message::Text(text)) => {
                Some(serde_json::from_str::<ServerEvent>(&text).map_err(anyhow::Error::from))
            }
            Ok(_) => None,
            Err(err) => Some(Err(err.into())),
        }
    }))
}

/// Local mirror of the authenticated user's friend state. Kept eventually
/// consistent with the server by pairing every action with the matching
/// local mutation and by folding pushed events in via [`apply`].
/// Reconnection is a [`refresh`] away: the durable lists are the source
/// to resync from.
///
/// [`apply`]: FriendSession::apply
/// [`refresh`]: FriendSession::refresh
pub struct FriendSession {
    http: reqwest::Client,
    base_url: String,
    user: User,
    pub friends: Vec<UserId>,
    pub search_results: Vec<User>,
    pub notifications: Vec<Notification>,
    pub pending_requests: Vec<FriendRequest>,
}

impl FriendSession {
    pub fn new(base_url: impl Into<String>, user: User) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            user,
            friends: Vec::new(),
            search_results: Vec::new(),
            notifications: Vec::new(),
            pending_requests: Vec::new(),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Refetches the durable state, replacing the local view.
    pub async fn refresh(&mut self) -> Result<()> {
        self.notifications =
            client::notifications(&self.http, &self.base_url, &self.user.id).await?;
        self.pending_requests =
            client::pending_requests(&self.http, &self.base_url, &self.user.id).await?;
        self.friends = client::friend_list(&self.http, &self.base_url, &self.user.id).await?;
        Ok(())
    }

    pub async fn search(&mut self, name: &str) -> Result<&[User]> {
        self.search_results =
            client::search_users(&self.http, &self.base_url, &self.user.id, name).await?;
        Ok(&self.search_results)
    }

    pub async fn send_request(&mut self, receiver: &UserId) -> Result<FriendRequest> {
        client::send_friend_request(&self.http, &self.base_url, &self.user.id, receiver).await
    }

    /// Accepts on the server and mirrors the result locally: the entry
    /// for the request's sender leaves the notification list and the
    /// sender joins the friend list.
    pub async fn accept(&mut self, request: &RequestId) -> Result<()> {
        client::accept_friend_request(&self.http, &self.base_url, &self.user.id, request).await?;
        if let Some(accepted) = self.take_pending(request) {
            self.remove_entries_from(&accepted.sender_id);
            if !self.friends.contains(&accepted.sender_id) {
                self.friends.push(accepted.sender_id);
            }
        }
        Ok(())
    }

    pub async fn reject(&mut self, request: &RequestId) -> Result<()> {
        client::reject_friend_request(&self.http, &self.base_url, &self.user.id, request).await?;
        if let Some(rejected) = self.take_pending(request) {
            self.remove_entries_from(&rejected.sender_id);
        }
        Ok(())
    }

    fn take_pending(&mut self, request: &RequestId) -> Option<FriendRequest> {
        let index = self.pending_requests.iter().position(|r| r.id == *request)?;
        Some(self.pending_requests.remove(index))
    }

    fn remove_entries_from(&mut self, sender: &UserId) {
        self.notifications.retain(|n| n.sender_id != *sender);
    }

    /// Folds a pushed event into the local view. Friend-request events
    /// carry the request's original orientation, so `sender_id` names the
    /// requester on both sides of the exchange.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::FriendRequestReceived {
                sender_id,
                receiver_id,
            } => {
                if *receiver_id == self.user.id {
                    self.notifications.insert(
                        0,
                        Notification {
                            id: format!("local-{}", sender_id.0),
                            sender_id: sender_id.clone(),
                            sender_name: sender_id.0.clone(),
                            receiver_id: receiver_id.clone(),
                            message: String::from("you have a new friend request"),
                            kind: NotificationKind::FriendRequest,
                            read: false,
                            created_at: Utc::now(),
                        },
                    );
                }
            }
            ServerEvent::FriendRequestAccepted {
                sender_id,
                receiver_id,
            } => {
                if *sender_id == self.user.id && !self.friends.contains(receiver_id) {
                    self.friends.push(receiver_id.clone());
                }
                self.remove_entries_from(sender_id);
            }
            ServerEvent::FriendRequestRejected { sender_id, .. } => {
                self.remove_entries_from(sender_id);
            }
            ServerEvent::NewMessage { .. } | ServerEvent::OnlineUsers { .. } => {}
        }
    }
}
