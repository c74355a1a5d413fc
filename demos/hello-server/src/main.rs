//! Demo server: a page that survives reloads and network drops.
//!
//! Run with: cargo run -p hello-server [config.json]
//!
//! Then open http://localhost:3000 in your browser. Kill the network or
//! restart the socket and the counters keep going; the button count is
//! restored from the ping token.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{Router, response::Html, routing::get};
use serde::Serialize;
use talkback_core::{Error, Payload, Result, TalkConfig};
use talkback_session::{AppSession, HandlerMap, Scope, SessionCtx, SessionManager};
use talkback_transport::create_ws_router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Serialize)]
struct SetContent<'a> {
    id: &'a str,
    content: String,
}

#[derive(Serialize)]
struct Info<'a> {
    level: &'a str,
    text: &'a str,
}

/// Per-session demo state.
#[derive(Default)]
struct Hello {
    clicks: AtomicU64,
    ticks: Arc<AtomicU64>,
    ticking: AtomicBool,
}

async fn set_content(ctx: &SessionCtx<Hello>, id: &str, content: impl ToString) -> Result<()> {
    let msg = SetContent {
        id,
        content: content.to_string(),
    };
    ctx.send_value("set", &msg).await
}

async fn button(ctx: SessionCtx<Hello>, name: Payload) -> Result<()> {
    if name.as_str() != Some("more") {
        return ctx.app().on_unknown_message(&ctx, "button".into(), name).await;
    }
    let clicks = ctx.app().clicks.fetch_add(1, Ordering::SeqCst) + 1;
    set_content(&ctx, "clicks", clicks).await?;
    ctx.ping(format!("c{clicks}")).await
}

fn start_ticker(ctx: &SessionCtx<Hello>) {
    let ticks = Arc::clone(&ctx.app().ticks);
    let task_ctx = ctx.clone();
    ctx.spawn(Scope::Persistent, "ticker", async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            match set_content(&task_ctx, "ticks", n).await {
                Ok(()) | Err(Error::NotConnected | Error::ConnectionLost) => {}
                Err(e) => return Err(e),
            }
        }
    });
}

#[async_trait]
impl AppSession for Hello {
    fn title(&self) -> &str {
        "Hello, talkback"
    }

    fn register(handlers: &mut HandlerMap<Self>) {
        handlers.on("button", button);
    }

    async fn show_main(&self, ctx: &SessionCtx<Self>, token: Option<Payload>) -> Result<()> {
        let clicks = self.clicks.load(Ordering::SeqCst);
        let expected = format!("c{clicks}");

        if token.as_ref().and_then(Payload::as_str) == Some(expected.as_str()) {
            tracing::debug!(session = %ctx.id(), "Client state is current");
        } else {
            set_content(ctx, "title", ctx.title()).await?;
            set_content(ctx, "clicks", clicks).await?;
            set_content(ctx, "ticks", self.ticks.load(Ordering::SeqCst)).await?;
            ctx.ping(expected).await?;
        }

        let info = Info {
            level: "info",
            text: "Ready!",
        };
        ctx.send_value("info", &info).await?;

        if !self.ticking.swap(true, Ordering::SeqCst) {
            start_ticker(ctx);
        }
        Ok(())
    }

    async fn on_connected(&self, ctx: &SessionCtx<Self>) -> Result<()> {
        tracing::info!(session = %ctx.id(), "Client connected");
        Ok(())
    }

    async fn on_disconnected(&self, ctx: &SessionCtx<Self>) {
        tracing::info!(session = %ctx.id(), "Client disconnected");
    }
}

fn load_config() -> anyhow::Result<TalkConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid config {path}"))
        }
        None => Ok(TalkConfig::with_version(env!("CARGO_PKG_VERSION"))
            .with_detach_grace(Duration::from_secs(300))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let page = INDEX_HTML.replace("{{VERSION}}", &config.version);
    let manager = Arc::new(SessionManager::new(config, Hello::default));

    // Build router
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let page = page.clone();
                async move { Html(page) }
            }),
        )
        .merge(create_ws_router(Arc::clone(&manager)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Hello, talkback</title>
    <script src="https://cdn.jsdelivr.net/npm/@msgpack/msgpack@2.8.0/dist.es5+umd/msgpack.min.js"></script>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        .error { color: #f66; }
    </style>
</head>
<body>
    <h1 id="title">Hello</h1>
    <div class="status" id="status">Connecting...</div>
    <p>Seconds ticked on the server: <b id="ticks">0</b></p>
    <p>Button presses: <b id="clicks">0</b> <button id="more">More!</button></p>
    <p id="info"></p>

    <script>
        const VERSION = '{{VERSION}}';
        const status = document.getElementById('status');
        let ws;
        let uuid = null;
        let token = null;
        let dead = false;

        const handlers = {
            setup: (m) => { uuid = m.uuid; },
            reload: () => { dead = true; window.location.reload(); },
            fatal: (m) => {
                dead = true;
                status.textContent = m;
                status.className = 'status error';
            },
            set: (m) => { document.getElementById(m.id).textContent = m.content; },
            info: (m) => { document.getElementById('info').textContent = m.text; },
            ping: (m) => { token = m; send('pong', m); },
        };

        const requests = {
            ping: (m) => { const old = token; token = m; return old; },
        };

        function send(action, data) {
            ws.send(MessagePack.encode([action, data]));
        }

        function onRequest([action, n, data]) {
            try {
                send('reply', [n, requests[action](data)]);
            } catch (e) {
                send('reply', [n, { _error: String(e), action, n }]);
            }
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);
            ws.binaryType = 'arraybuffer';

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
                send('setup', { version: VERSION, uuid, token });
            };

            ws.onclose = () => {
                if (dead) { return; }
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 1000);
            };

            ws.onmessage = (event) => {
                const [action, data] = MessagePack.decode(new Uint8Array(event.data));
                if (action === 'req') {
                    onRequest(data);
                } else if (handlers[action]) {
                    handlers[action](data);
                } else {
                    console.warn('Unhandled message', action, data);
                }
            };
        }

        document.getElementById('more').addEventListener('click', () => send('button', 'more'));

        connect();
    </script>
</body>
</html>
"#;
