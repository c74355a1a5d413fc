//! WebSocket transport for browser sessions.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use talkback_core::{Transport, TransportError, TransportReceiver, TransportSender};
use talkback_session::{AppSession, SessionManager};
use tracing::{debug, warn};

/// An upgraded WebSocket carrying one connection attempt.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    #[must_use]
    pub const fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WsTransport {
    fn split(self) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let (sink, stream) = self.socket.split();
        (Box::new(WsSender { sink }), Box::new(WsReceiver { stream }))
    }
}

struct WsSender {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl TransportSender for WsSender {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

struct WsReceiver {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportReceiver for WsReceiver {
    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

/// WebSocket handler state.
pub struct WsState<A: AppSession> {
    pub manager: Arc<SessionManager<A>>,
}

impl<A: AppSession> Clone for WsState<A> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<A: AppSession> WsState<A> {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(manager: Arc<SessionManager<A>>) -> Self {
        Self { manager }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<A: AppSession>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<A>>,
) -> impl IntoResponse {
    let limit = state.manager.config().max_frame_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<A: AppSession>(socket: WebSocket, state: WsState<A>) {
    match state.manager.accept(WsTransport::new(socket)).await {
        Ok(end) => debug!(?end, "WebSocket connection ended"),
        Err(e) => warn!("WebSocket connection rejected: {e}"),
    }
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(manager));
/// ```
#[must_use]
pub fn create_ws_router<A: AppSession>(manager: Arc<SessionManager<A>>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<A>))
        .with_state(WsState::new(manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use talkback_core::{
        Envelope, Payload, Result, TalkConfig, actions,
        envelope::{decode, encode, map_get},
    };
    use talkback_session::{HandlerMap, SessionCtx};
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Echo;

    #[async_trait]
    impl AppSession for Echo {
        fn register(handlers: &mut HandlerMap<Self>) {
            handlers.on("echo", |ctx, payload| async move { ctx.send("echoed", payload).await });
        }

        async fn show_main(&self, ctx: &SessionCtx<Self>, _token: Option<Payload>) -> Result<()> {
            ctx.send("main", "ready").await
        }
    }

    type WsStream =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn boot() -> (String, Arc<SessionManager<Echo>>) {
        let manager = Arc::new(SessionManager::new(TalkConfig::with_version("1"), || Echo));
        let router = create_ws_router(Arc::clone(&manager));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        (format!("ws://{addr}/ws"), manager)
    }

    async fn send(ws: &mut WsStream, envelope: &Envelope) {
        let frame = encode(envelope).unwrap();
        ws.send(WsMessage::Binary(frame)).await.unwrap();
    }

    async fn recv(ws: &mut WsStream) -> Envelope {
        loop {
            let msg = timeout(TIMEOUT, ws.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream closed")
                .expect("ws error");
            if let WsMessage::Binary(data) = msg {
                return decode(&data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_echo_over_websocket() {
        let (url, manager) = boot().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        let setup = Payload::Map(vec![(Payload::from("version"), Payload::from("1"))]);
        send(&mut ws, &Envelope::message(actions::SETUP, setup)).await;

        let Envelope::Message { action, payload } = recv(&mut ws).await else {
            panic!("expected setup ack");
        };
        assert_eq!(action, actions::SETUP);
        assert!(map_get(&payload, "uuid").is_some());
        assert_eq!(recv(&mut ws).await, Envelope::message("main", "ready"));

        send(&mut ws, &Envelope::message("echo", vec![1u8, 2, 3])).await;
        assert_eq!(
            recv(&mut ws).await,
            Envelope::message("echoed", vec![1u8, 2, 3])
        );
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_over_websocket() {
        let (url, _manager) = boot().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        let setup = Payload::Map(vec![(Payload::from("version"), Payload::from("0"))]);
        send(&mut ws, &Envelope::message(actions::SETUP, setup)).await;
        assert_eq!(
            recv(&mut ws).await,
            Envelope::message(actions::RELOAD, true)
        );
    }
}
