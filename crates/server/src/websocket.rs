use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use flowrun_core::events::Event;
use flowrun_core::RunId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::config::AppState;

/// WebSocket message types for real-time updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client subscription confirmation
    Subscribed {
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    /// Engine event
    Event { event: Event },
    /// Events dropped because the client fell behind
    Lagged { skipped: u64 },
    /// Error message
    Error { message: String },
}

/// WebSocket subscription request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsRequest {
    /// Stream events of every run
    SubscribeAll,
    /// Stream events of one run only
    SubscribeRun { run_id: String },
    /// Close the stream
    Unsubscribe,
}

/// Which events a connection forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    All,
    Run(RunId),
}

impl Filter {
    fn accepts(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Run(run_id) => event.run_id == *run_id,
        }
    }
}

/// WebSocket handler for real-time updates
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, message: &WsMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize WS message: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.engine.subscribe();
    let mut filter = Filter::All;

    let confirm = WsMessage::Subscribed {
        subscription_id: uuid::Uuid::new_v4().to_string(),
        run_id: None,
    };
    if !send(&mut socket, &confirm).await {
        return;
    }

    loop {
        tokio::select! {
            received = events.recv() => {
                let outgoing = match received {
                    Ok(event) if filter.accepts(&event) => WsMessage::Event { event },
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("WebSocket client lagged, {} events skipped", skipped);
                        WsMessage::Lagged { skipped }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send(&mut socket, &outgoing).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(msg_result) = incoming else {
                    break;
                };
                match msg_result {
                    Ok(Message::Text(text)) => {
                        tracing::debug!("Received WS message: {}", text.as_str());
                        let reply = match handle_request(text.as_str(), &mut filter) {
                            Some(reply) => reply,
                            None => {
                                tracing::info!("Client unsubscribed");
                                break;
                            }
                        };
                        if !send(&mut socket, &reply).await {
                            break;
                        }
                    }
                    Ok(Message::Ping(_)) => {
                        let _ = socket.send(Message::Pong(Bytes::new())).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    tracing::info!("WebSocket connection terminated");
}

/// Apply a client request to the connection's filter.
/// Returns `None` when the client asked to close the stream.
fn handle_request(text: &str, filter: &mut Filter) -> Option<WsMessage> {
    let request = match serde_json::from_str::<WsRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            return Some(WsMessage::Error {
                message: format!("Invalid request: {}", e),
            })
        }
    };

    match request {
        WsRequest::SubscribeAll => {
            tracing::info!("Client subscribed to all runs");
            *filter = Filter::All;
            Some(WsMessage::Subscribed {
                subscription_id: "all_runs".to_string(),
                run_id: None,
            })
        }
        WsRequest::SubscribeRun { run_id } => match run_id.parse::<RunId>() {
            Ok(run_id) => {
                tracing::info!("Client subscribed to run: {}", run_id);
                *filter = Filter::Run(run_id);
                Some(WsMessage::Subscribed {
                    subscription_id: format!("run:{}", run_id),
                    run_id: Some(run_id),
                })
            }
            Err(_) => Some(WsMessage::Error {
                message: format!("Invalid run ID: {}", run_id),
            }),
        },
        WsRequest::Unsubscribe => None,
    }
}
