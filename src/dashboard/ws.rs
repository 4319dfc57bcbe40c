use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::models::{Operation, OperationStep, ProjectRecord};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Push event types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsEvent {
    ProjectUpdate {
        project: ProjectRecord,
    },
    ProjectRemoved {
        name: String,
    },
    CommandOutput {
        project: String,
        operation_id: Option<String>,
        stream: String,
        line: String,
    },
    OperationLog {
        operation_id: String,
        project: String,
        message: String,
    },
    OperationStep {
        operation_id: String,
        project: String,
        step: OperationStep,
    },
    OperationComplete {
        operation: Operation,
    },
}

/// Messages a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeLogs {
        #[serde(default)]
        project: Option<String>,
    },
}

/// Just enough of an outgoing event to apply a client's log filter.
#[derive(Deserialize)]
struct EventHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<EventProject>,
}

#[derive(Deserialize)]
struct EventProject {
    #[serde(default)]
    project: Option<String>,
}

/// `command_output` is restricted to the subscribed project; everything else passes.
fn passes_filter(raw: &str, filter: Option<&str>) -> bool {
    let Some(wanted) = filter else {
        return true;
    };
    match serde_json::from_str::<EventHeader>(raw) {
        Ok(header) if header.kind == "command_output" => header
            .data
            .and_then(|d| d.project)
            .is_some_and(|p| p == wanted),
        _ => true,
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let tx = state.ws_tx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;
    let mut log_filter: Option<String> = None;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket client missed pong; closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !passes_filter(&msg, log_filter.as_deref()) {
                            continue;
                        }
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagged; dropping events");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::SubscribeLogs { project }) => {
                                log_filter = project;
                            }
                            Err(e) => tracing::debug!(error = %e, "ignoring client message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to all connected clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &WsEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize push event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_command_output_serialization() {
        let event = WsEvent::CommandOutput {
            project: "demo".into(),
            operation_id: Some("op-1".into()),
            stream: "stdout".into(),
            line: "Container demo-app Started".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "command_output");
        assert_eq!(json["data"]["project"], "demo");
        assert_eq!(json["data"]["stream"], "stdout");
    }

    #[test]
    fn test_operation_step_serialization() {
        let event = WsEvent::OperationStep {
            operation_id: "op-1".into(),
            project: "demo".into(),
            step: OperationStep {
                name: "Starting containers".into(),
                started_at: Utc::now(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"operation_step\""));
        assert!(json.contains("Starting containers"));
    }

    #[test]
    fn test_project_removed_roundtrip() {
        let event = WsEvent::ProjectRemoved { name: "old".into() };
        let json = serde_json::to_string(&event).unwrap();
        match serde_json::from_str::<WsEvent>(&json).unwrap() {
            WsEvent::ProjectRemoved { name } => assert_eq!(name, "old"),
            _ => panic!("Expected ProjectRemoved"),
        }
    }

    #[test]
    fn test_subscribe_logs_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_logs","project":"demo"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeLogs {
                project: Some("demo".into())
            }
        );
        let clear: ClientMessage = serde_json::from_str(r#"{"type":"subscribe_logs"}"#).unwrap();
        assert_eq!(clear, ClientMessage::SubscribeLogs { project: None });
    }

    #[test]
    fn test_filter_only_restricts_command_output() {
        let for_demo = serde_json::to_string(&WsEvent::CommandOutput {
            project: "demo".into(),
            operation_id: None,
            stream: "stdout".into(),
            line: "x".into(),
        })
        .unwrap();
        let for_other = for_demo.replace("\"demo\"", "\"other\"");
        let removed = serde_json::to_string(&WsEvent::ProjectRemoved { name: "other".into() }).unwrap();

        assert!(passes_filter(&for_demo, None));
        assert!(passes_filter(&for_demo, Some("demo")));
        assert!(!passes_filter(&for_other, Some("demo")));
        assert!(passes_filter(&removed, Some("demo")));
    }

    #[tokio::test]
    async fn test_broadcast_channel_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel::<String>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        broadcast_event(&tx, &WsEvent::ProjectRemoved { name: "a".into() });

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.contains("project_removed"));
        assert_eq!(received1, received2);
    }

    #[tokio::test]
    async fn test_broadcast_no_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_event(&tx, &WsEvent::ProjectRemoved { name: "a".into() });
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
