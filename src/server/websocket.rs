//! HTTP surface: the `/ws` subscriber socket and the `/state` snapshot.
//!
//! Every websocket connection registers with the [`BroadcastHub`] for its
//! lifetime.  A writer task forwards hub events (and control replies) to the
//! socket; the read loop forwards `command` messages into the integrator's
//! inbox.  When the hub drops a slow subscriber the writer closes the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::broadcast::{BroadcastEvent, BroadcastHub, InboundMessage};
use crate::model::{SnapshotReceiver, SystemState, VoiceCommand};

#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<BroadcastHub>,
    pub commands: mpsc::Sender<VoiceCommand>,
    pub snapshots: SnapshotReceiver,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(subscribe))
        .route("/state", get(current_state))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("server: listening on {addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    log::info!("server: stopped");
    Ok(())
}

async fn current_state(State(state): State<ServerState>) -> Json<SystemState> {
    let snapshot = Arc::clone(&state.snapshots.borrow());
    Json(SystemState::clone(&snapshot))
}

async fn subscribe(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let mut subscription = state.hub.register();
    let id = subscription.id();
    let (mut sender, mut receiver) = socket.split();
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<Message>();

    // Current state first, so a fresh client does not wait a full cycle.
    let initial = BroadcastEvent::state_update(&state.snapshots.borrow());
    let _ = ctl_tx.send(Message::Text(initial.to_text().into()));

    let writer = tokio::spawn(async move {
        loop {
            // Control frames first, so the initial state precedes any event.
            let msg = tokio::select! {
                biased;
                ctl = ctl_rx.recv() => match ctl {
                    Some(msg) => msg,
                    None => break,
                },
                event = subscription.recv() => match event {
                    Some(event) => Message::Text(event.to_text().into()),
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match InboundMessage::parse(&text) {
                Ok(InboundMessage::Ping) => {
                    let pong = serde_json::json!({ "type": "pong" }).to_string();
                    let _ = ctl_tx.send(Message::Text(pong.into()));
                }
                Ok(msg) => {
                    if let Some(command) = msg.into_command() {
                        if let Err(e) = state.commands.try_send(command) {
                            log::warn!("server: subscriber {id} command dropped: {e}");
                        }
                    }
                }
                Err(e) => log::debug!("server: subscriber {id} sent unparseable message: {e}"),
            },
            Ok(Message::Ping(data)) => {
                let _ = ctl_tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("server: subscriber {id} receive error: {e}");
                break;
            }
        }
        if writer.is_finished() {
            break;
        }
    }

    state.hub.unregister(id);
    writer.abort();
}
