use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tracing::{info, warn};

use crate::api::rest::order::OrderView;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Sends the current view on connect, then again after every store or
/// connectivity change.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut snapshots = state.controller.subscribe();
    let mut connectivity = state.controller.subscribe_connectivity();

    info!("websocket client connected");

    let send_task = tokio::spawn(async move {
        loop {
            snapshots.borrow_and_update();
            connectivity.borrow_and_update();

            let view = OrderView::capture(&state.controller).await;
            match serde_json::to_string(&view) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize order view for ws"),
            }

            let changed = tokio::select! {
                changed = snapshots.changed() => changed,
                changed = connectivity.changed() => changed,
            };
            if changed.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}
