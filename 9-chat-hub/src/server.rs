use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpListener, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    hub::Hub,
    registry::{ConnectionId, PeerLink},
};

pub const CHAT_PATH: &str = "/ws/chat";

/// Upper bound on flushing queued frames to a peer that is being closed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self {
            listener,
            hub: Hub::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Serves until `shutdown` resolves, then drains background work and
    /// closes every peer before returning.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, hub } = self;
        let app = app(Arc::clone(&hub));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                hub.shutdown().await;
            })
            .await
            .context("hub server failed")?;

        info!("hub server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn app(hub: Arc<Hub>) -> Router {
    Router::new()
        .route(CHAT_PATH, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    if hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "hub is shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let PeerLink { id, outbox, closed } = hub.connect();
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(run_writer(
        id,
        sink,
        outbox,
        closed.clone(),
        Arc::clone(&hub),
    ));
    run_reader(id, stream, &closed, &hub).await;

    hub.disconnect(id).await;
    if let Err(error) = writer.await {
        warn!(conn = %id, ?error, "writer task ended abnormally");
    }
}

/// Feeds every frame to the hub in arrival order, so a chunk's metadata is
/// always routed before its binary payload.
async fn run_reader(
    id: ConnectionId,
    mut stream: SplitStream<WebSocket>,
    closed: &CancellationToken,
    hub: &Hub,
) {
    loop {
        let frame = select! {
            biased;
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => hub.handle_text(id, &text).await,
            Some(Ok(Message::Binary(bytes))) => hub.handle_binary(id, &bytes).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(error)) => {
                debug!(conn = %id, ?error, "websocket read failed");
                break;
            }
        }
    }
}

async fn run_writer(
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
    hub: Arc<Hub>,
) {
    loop {
        let frame = select! {
            _ = closed.cancelled() => break,
            frame = outbox.recv() => frame,
        };
        let Some(frame) = frame else { break };

        if let Err(error) = sink.send(Message::Text(frame.to_string())).await {
            debug!(conn = %id, ?error, "failed to deliver frame");
            hub.disconnect(id).await;
            return;
        }
    }

    // Frames queued before the close still go out, best effort.
    let flush = async {
        while let Ok(frame) = outbox.try_recv() {
            sink.send(Message::Text(frame.to_string())).await?;
        }
        sink.send(Message::Close(None)).await?;
        Ok::<(), axum::Error>(())
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(conn = %id, ?error, "failed to close websocket cleanly"),
        Err(_) => debug!(conn = %id, "gave up flushing a closing peer"),
    }
}
