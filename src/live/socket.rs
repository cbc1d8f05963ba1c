use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, error, info, warn};

use super::{ClientEvent, ConnectionState, LiveEndpoint, LiveEvent, PresenceTracker};
use crate::{AppError, AppResult, config::ReconnectPolicy};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Exit {
    /// Server or network ended the connection.
    Closed,
    /// We were told to stop and sent a Close frame.
    Shutdown,
}

/// Owns the WebSocket for one session: connects, pumps frames both ways and
/// reconnects per the transport policy until `shutdown` turns true (or its
/// sender goes away).
pub(crate) struct SocketTask {
    pub(crate) url: String,
    pub(crate) token: String,
    pub(crate) endpoint: LiveEndpoint,
    pub(crate) presence: PresenceTracker,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl SocketTask {
    pub(crate) async fn run(mut self) {
        let mut attempt = 0;
        loop {
            self.endpoint.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                connected = connect(&self.url, &self.token) => connected,
                _ = stop_requested(&mut self.shutdown) => break,
            };
            match connected {
                Ok(socket) => {
                    info!(url = %self.url, "live connection established");
                    attempt = 0;

                    let exit = pump(socket, &mut self.endpoint, &self.presence, &mut self.shutdown).await;
                    self.endpoint.set_state(ConnectionState::Disconnected);
                    match exit {
                        Ok(Exit::Shutdown) => {
                            info!("live connection closed");
                            return;
                        }
                        Ok(Exit::Closed) => info!("live connection closed by server"),
                        Err(e) => warn!(error = %e, "live connection lost"),
                    }
                }
                Err(e) => {
                    error!(url = %self.url, error = %e, "live connection failed");
                    self.endpoint.set_state(ConnectionState::Error);
                }
            }

            if !self.reconnect.enabled {
                return;
            }
            let delay = self.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "reconnecting live connection");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut self.shutdown) => break,
            }
        }
        self.endpoint.set_state(ConnectionState::Disconnected);
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn connect(url: &str, token: &str) -> AppResult<Socket> {
    let mut request = url.into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| AppError::Config(format!("session token is not a valid header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

async fn pump(
    socket: Socket,
    endpoint: &mut LiveEndpoint,
    presence: &PresenceTracker,
    shutdown: &mut watch::Receiver<bool>,
) -> AppResult<Exit> {
    let (mut sender, mut receiver) = socket.split();

    // Leftovers from a previous connection; the replay below covers rooms.
    while endpoint.outbound.try_recv().is_ok() {}
    let replay = endpoint
        .rooms
        .snapshot_on_connect(|| endpoint.set_state(ConnectionState::Connected));
    for chat_id in replay {
        sender.send(Message::text(ClientEvent::join(&chat_id).encode()?)).await?;
    }

    loop {
        tokio::select! {
            _ = stop_requested(shutdown) => {
                while let Ok(event) = endpoint.outbound.try_recv() {
                    sender.send(Message::text(event.encode()?)).await?;
                }
                if let Err(e) = sender.close().await {
                    debug!(error = %e, "close frame not delivered");
                }
                return Ok(Exit::Shutdown);
            }
            Some(event) = endpoint.outbound.recv() => {
                debug!(event = event.name(), "live send");
                sender.send(Message::text(event.encode()?)).await?;
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch(text.as_str(), &endpoint.events, presence),
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

fn dispatch(text: &str, events: &broadcast::Sender<LiveEvent>, presence: &PresenceTracker) {
    let event = match LiveEvent::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "skipping undecodable live frame");
            return;
        }
    };

    match &event {
        LiveEvent::Presence(update) => presence.apply(update),
        LiveEvent::MessageSent(ack) => debug!(?ack, "message_sent"),
        _ => {}
    }
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{live::LiveHandle, model::ChatId};

    #[tokio::test]
    async fn dispatch_feeds_presence_and_subscribers() {
        let presence = PresenceTracker::new();
        let (events, mut rx) = broadcast::channel(8);

        dispatch(
            &json!({ "event": "user_online", "data": { "userId": "b" } }).to_string(),
            &events,
            &presence,
        );
        dispatch("{ garbage", &events, &presence);

        assert!(presence.is_online(&"b".into()));
        assert!(matches!(rx.recv().await, Ok(LiveEvent::Presence(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_connect_ends_in_error_without_retry() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (handle, endpoint) = LiveHandle::pair();
        let (_stop, shutdown) = watch::channel(false);

        let task = SocketTask {
            url: format!("ws://127.0.0.1:{port}/ws"),
            token: "tok-a".to_owned(),
            endpoint,
            presence: PresenceTracker::new(),
            reconnect: ReconnectPolicy::disabled(),
            shutdown,
        };
        task.run().await;

        assert_eq!(handle.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn shutdown_closes_the_socket_cleanly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut frames = Vec::new();
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(Message::Close(_)) => return (frames, true),
                    Ok(Message::Text(text)) => frames.push(text.as_str().to_owned()),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            (frames, false)
        });

        let (handle, endpoint) = LiveHandle::pair();
        let early = handle.join(&ChatId::from("c1"));
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(
            SocketTask {
                url,
                token: "tok-a".to_owned(),
                endpoint,
                presence: PresenceTracker::new(),
                reconnect: ReconnectPolicy::disabled(),
                shutdown,
            }
            .run(),
        );

        timeout(Duration::from_secs(5), async {
            while !handle.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let late = handle.join(&ChatId::from("c2"));

        stop.send_replace(true);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        let (frames, clean) = server.await.unwrap();

        assert!(clean, "server saw no Close frame");
        assert_eq!(frames.len(), 2, "each room joined exactly once: {frames:?}");
        assert!(frames[0].contains("\"chatId\":\"c1\""));
        assert!(frames[1].contains("\"chatId\":\"c2\""));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        drop((early, late));
    }
}
