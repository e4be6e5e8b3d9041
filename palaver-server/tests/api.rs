use futures::StreamExt;
use palaver_common::{ChatMessage, FriendRequest, Notification, NotificationKind, RequestStatus, ServerEvent, User, UserId};
use palaver_server::{router, State};
use reqwest::StatusCode;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn spawn_server() -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = State::open(dir.path()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, dir)
}

async fn add_user(client: &reqwest::Client, addr: SocketAddr, name: &str) -> User {
    let response = client
        .post(format!("http://{addr}/add-user"))
        .json(&serde_json::json!({ "displayName": name, "password": "hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    response.json().await.unwrap()
}

async fn connect_ws(addr: SocketAddr, user: &UserId) -> WsStream {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?userId={}", user.0))
        .await
        .unwrap();
    let mut socket = socket;
    // The registry broadcasts the online set right after registration, so
    // once this arrives the connection is addressable.
    match next_event(&mut socket).await {
        ServerEvent::OnlineUsers { .. } => {}
        other => panic!("expected online-users broadcast, got {other:?}"),
    }
    socket
}

async fn next_event(socket: &mut WsStream) -> ServerEvent {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_friend_event(socket: &mut WsStream) -> ServerEvent {
    loop {
        match next_event(socket).await {
            ServerEvent::OnlineUsers { .. } => continue,
            event => return event,
        }
    }
}

#[tokio::test]
async fn offline_request_accept_end_to_end() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice").await;
    let bob = add_user(&client, addr, "Bob").await;

    // Alice sends while Bob is offline.
    let response = client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let request: FriendRequest = response.json().await.unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.sender_id, alice.id);

    // Bob polls the durable record instead.
    let notifications: Vec<Notification> = client
        .get(format!("http://{addr}/notifications"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::FriendRequest);
    assert_eq!(notifications[0].sender_id, alice.id);

    let pending: Vec<FriendRequest> = client
        .get(format!("http://{addr}/friend/requests"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request.id);

    // Alice is connected when Bob accepts.
    let mut alice_ws = connect_ws(addr, &alice.id).await;
    let response = client
        .put(format!("http://{addr}/friend/accept-request/{}", request.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let event = next_friend_event(&mut alice_ws).await;
    assert_eq!(
        event,
        ServerEvent::FriendRequestAccepted {
            sender_id: alice.id.clone(),
            receiver_id: bob.id.clone(),
        }
    );

    // Symmetric friendship, and the prompt notification is gone.
    let alice_friends: Vec<UserId> = client
        .get(format!("http://{addr}/friend/list"))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bob_friends: Vec<UserId> = client
        .get(format!("http://{addr}/friend/list"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(alice_friends, vec![bob.id.clone()]);
    assert_eq!(bob_friends, vec![alice.id.clone()]);

    let notifications: Vec<Notification> = client
        .get(format!("http://{addr}/notifications"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(notifications.is_empty());

    // Terminal state: a second accept is a validation error.
    let response = client
        .put(format!("http://{addr}/friend/accept-request/{}", request.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_request_gets_bad_request() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice").await;
    let bob = add_user(&client, addr, "Bob").await;

    let first = client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    assert_eq!(second.text().await.unwrap(), "request already sent");

    let pending: Vec<FriendRequest> = client
        .get(format!("http://{addr}/friend/requests"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1, "no second record may be created");
}

#[tokio::test]
async fn online_receiver_gets_request_push() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice").await;
    let bob = add_user(&client, addr, "Bob").await;

    let mut bob_ws = connect_ws(addr, &bob.id).await;
    client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap();

    let event = next_friend_event(&mut bob_ws).await;
    assert_eq!(
        event,
        ServerEvent::FriendRequestReceived {
            sender_id: alice.id.clone(),
            receiver_id: bob.id.clone(),
        }
    );
}

#[tokio::test]
async fn rejection_reaches_the_sender_durably() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice").await;
    let bob = add_user(&client, addr, "Bob").await;

    let request: FriendRequest = client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = client
        .put(format!("http://{addr}/friend/reject-request/{}", request.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let notifications: Vec<Notification> = client
        .get(format!("http://{addr}/notifications"))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::FriendRequestRejected);

    let response = client
        .put(format!("http://{addr}/friend/reject-request/{}", request.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "invalid request");
}

#[tokio::test]
async fn search_is_case_insensitive_and_excludes_caller() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice Smith").await;
    add_user(&client, addr, "alicia keys").await;
    let bob = add_user(&client, addr, "Bob").await;

    let found: Vec<User> = client
        .get(format!("http://{addr}/friend/search/ALIC"))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let found: Vec<User> = client
        .get(format!("http://{addr}/friend/search/alic"))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].display_name, "alicia keys");
}

#[tokio::test]
async fn messages_flow_between_friends_only() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let alice = add_user(&client, addr, "Alice").await;
    let bob = add_user(&client, addr, "Bob").await;
    let mallory = add_user(&client, addr, "Mallory").await;

    let request: FriendRequest = client
        .post(format!("http://{addr}/friend/send-request/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    client
        .put(format!("http://{addr}/friend/accept-request/{}", request.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap();

    let mut bob_ws = connect_ws(addr, &bob.id).await;
    let response = client
        .post(format!("http://{addr}/messages/send/{}", bob.id.0))
        .header("x-user-id", &alice.id.0)
        .json(&serde_json::json!({ "text": "hi bob" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    match next_friend_event(&mut bob_ws).await {
        ServerEvent::NewMessage { message } => {
            assert_eq!(message.text, "hi bob");
            assert_eq!(message.sender_id, alice.id);
        }
        other => panic!("expected newMessage, got {other:?}"),
    }

    let history: Vec<ChatMessage> = client
        .get(format!("http://{addr}/messages/{}", alice.id.0))
        .header("x-user-id", &bob.id.0)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hi bob");

    let response = client
        .post(format!("http://{addr}/messages/send/{}", bob.id.0))
        .header("x-user-id", &mallory.id.0)
        .json(&serde_json::json!({ "text": "let me in" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let (addr, _dir) = spawn_server();
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/notifications"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
