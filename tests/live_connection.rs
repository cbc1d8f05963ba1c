use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{get, put},
};
use chatlink::{
    ChatContext, ConnectionManager, ConnectionState, ConversationController, LiveEvent,
    config::{ChatConfig, ReconnectPolicy},
    model::{ChatId, UserId},
    session::{Session, SessionStore},
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    sync::{broadcast, mpsc},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

/// Minimal backend: a live endpoint that records what clients send and
/// forwards pushed frames, plus the REST routes a conversation needs.
#[derive(Clone)]
struct Backend {
    auth: Arc<Mutex<Vec<String>>>,
    from_client: mpsc::UnboundedSender<Value>,
    to_client: broadcast::Sender<String>,
}

impl Backend {
    async fn spawn() -> (Backend, mpsc::UnboundedReceiver<Value>, ChatConfig) {
        let (from_client, inbox) = mpsc::unbounded_channel();
        let backend = Backend {
            auth: Arc::default(),
            from_client,
            to_client: broadcast::channel(16).0,
        };

        let app = Router::new()
            .route("/ws", get(upgrade))
            .route("/api/chat/{id}/messages", get(history).post(persist))
            .route("/api/chat/{id}/read", put(|| async { Json(json!({ "success": true })) }))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = ChatConfig {
            api_url: format!("http://{addr}/api"),
            socket_url: format!("ws://{addr}/ws"),
            reconnect: ReconnectPolicy::disabled(),
            ..ChatConfig::default()
        };
        (backend, inbox, config)
    }

    fn push(&self, frame: Value) {
        self.to_client.send(frame.to_string()).unwrap();
    }

    fn auth(&self) -> Vec<String> {
        self.auth.lock().unwrap().clone()
    }
}

async fn upgrade(State(backend): State<Backend>, headers: HeaderMap, ws: WebSocketUpgrade) -> impl IntoResponse {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    backend.auth.lock().unwrap().push(auth);
    ws.on_upgrade(move |socket| session(socket, backend))
}

async fn session(socket: WebSocket, backend: Backend) {
    let (mut sender, mut receiver) = socket.split();
    let mut pushed = backend.to_client.subscribe();

    let online = json!({ "event": "online_users", "data": [{ "userId": "b" }, { "userId": "c" }] });
    if sender.send(WsMessage::Text(online.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = pushed.recv() => {
                let Ok(frame) = frame else { return };
                if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = backend.from_client.send(serde_json::from_str(text.as_str()).unwrap());
                }
                Some(Ok(WsMessage::Close(_))) => {
                    let _ = backend.from_client.send(json!({ "event": "closed", "clean": true }));
                    return;
                }
                Some(Err(_)) | None => {
                    let _ = backend.from_client.send(json!({ "event": "closed", "clean": false }));
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn history(Path(_chat_id): Path<String>) -> Json<Value> {
    Json(json!({ "success": true, "data": { "messages": [] } }))
}

async fn persist(Path(_chat_id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "_id": "m1",
            "content": body["content"],
            "sender": "a",
            "createdAt": "2024-05-01T09:00:00Z"
        }
    }))
}

async fn next_frame(inbox: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, inbox.recv()).await.unwrap().unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn connected(manager: &ConnectionManager) {
    let mut state = manager.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    // The snapshot is the server's first frame, so the session is fully set up.
    eventually(|| manager.is_online(&UserId::from("b"))).await;
}

#[tokio::test]
async fn connection_follows_the_session() {
    let (backend, mut inbox, config) = Backend::spawn().await;
    let session = SessionStore::new();
    let ctx = ChatContext::new(config, session.clone());
    let manager = ConnectionManager::spawn(&ctx);

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.handle().is_none());

    session.login(Session::new("a", "tok-a"));
    connected(&manager).await;
    assert_eq!(backend.auth(), ["Bearer tok-a"]);
    assert_eq!(
        manager.presence().online_users(),
        [UserId::from("b"), UserId::from("c")]
    );

    backend.push(json!({ "event": "user_offline", "data": { "userId": "c" } }));
    eventually(|| !manager.is_online(&UserId::from("c"))).await;

    session.logout();
    let mut state = manager.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    assert!(manager.handle().is_none());
    assert!(manager.presence().is_empty());
    assert_eq!(next_frame(&mut inbox).await, json!({ "event": "closed", "clean": true }));
}

#[tokio::test]
async fn chat_subscriptions_join_and_filter() {
    let (backend, mut inbox, config) = Backend::spawn().await;
    let session = SessionStore::new();
    session.login(Session::new("a", "tok-a"));
    let manager = ConnectionManager::spawn(&ChatContext::new(config, session.clone()));
    connected(&manager).await;

    let handle = manager.handle().unwrap();
    let c1 = ChatId::from("c1");
    let mut subscription = handle.subscribe_chat(&c1);
    let second = handle.join(&c1);
    assert_eq!(
        next_frame(&mut inbox).await,
        json!({ "event": "join_chat", "data": { "chatId": "c1" } })
    );

    for (chat_id, content) in [("c2", "elsewhere"), ("c1", "hey")] {
        backend.push(json!({
            "event": "new_message",
            "data": {
                "chatId": chat_id,
                "content": content,
                "sender": { "_id": "b", "name": "Bob" },
                "messageType": "text",
                "timestamp": "2024-05-01T09:00:00Z"
            }
        }));
    }
    match timeout(WAIT, subscription.recv()).await.unwrap() {
        Some(LiveEvent::NewMessage(message)) => {
            assert_eq!(message.content, "hey");
            assert_eq!(message.sender.name.as_deref(), Some("Bob"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    drop(subscription);
    assert_eq!(handle.rooms().holders(&c1), 1);
    drop(second);
    assert_eq!(
        next_frame(&mut inbox).await,
        json!({ "event": "leave_chat", "data": { "chatId": "c1" } })
    );
}

#[tokio::test]
async fn conversation_round_trip() {
    let (backend, mut inbox, config) = Backend::spawn().await;
    let session = SessionStore::new();
    session.login(Session::new("a", "tok-a"));
    let ctx = ChatContext::new(config, session);
    let manager = ConnectionManager::spawn(&ctx);
    connected(&manager).await;

    let controller = ConversationController::spawn(&ctx, manager.watch_handle());
    let c1 = ChatId::from("c1");
    assert!(controller.open(&c1).await.unwrap());
    assert_eq!(
        next_frame(&mut inbox).await,
        json!({ "event": "join_chat", "data": { "chatId": "c1" } })
    );

    let sent = controller.send("hello").await.unwrap().unwrap();
    let frame = next_frame(&mut inbox).await;
    assert_eq!(frame["event"], "send_message");
    assert_eq!(frame["data"]["chatId"], "c1");
    assert_eq!(frame["data"]["content"], "hello");
    assert_eq!(frame["data"]["clientId"], sent.client_id.unwrap().to_string());

    backend.push(json!({
        "event": "new_message",
        "data": { "chatId": "c1", "content": "hi back", "sender": "b" }
    }));
    backend.push(json!({ "event": "user_typing", "data": { "chatId": "c1", "userId": "b" } }));
    eventually(|| controller.messages().len() == 2).await;
    eventually(|| controller.typing_users() == [UserId::from("b")]).await;
    assert_eq!(controller.messages()[1].content, "hi back");

    controller.close();
    assert_eq!(
        next_frame(&mut inbox).await,
        json!({ "event": "leave_chat", "data": { "chatId": "c1" } })
    );
}
