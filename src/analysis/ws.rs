// WebSocket controller: the full-duplex streaming surface
//
// One socket handles many queries. A new query cancels the previous
// in-flight workflow; an explicit cancel aborts it and acknowledges with a
// `cancelled` terminal. Alert broadcasts ride the same socket via the
// subscriber registry.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::events::StreamEvent;
use super::stream::{self, QueryRequest};
use super::AnalysisApp;
use crate::errors::sanitize_message;
use crate::model::TimeRangeWire;

// ─────────────────────────────────────────────────────────────────────────────
// Subscriber registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of live streaming connections for alert broadcast.
///
/// Broadcast snapshots the sender list and iterates outside the lock, so a
/// slow or dying subscriber never blocks registration. Senders whose
/// receiver is gone are pruned after the fact.
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, UnboundedSender<StreamEvent>)>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (u64, UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push((id, tx));
        }
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|(sid, _)| *sid != id);
        }
    }

    /// Best-effort send to every subscriber; dead ones are removed
    pub fn broadcast(&self, event: &StreamEvent) {
        let snapshot: Vec<(u64, UnboundedSender<StreamEvent>)> = match self.senders.lock() {
            Ok(senders) => senders.clone(),
            Err(_) => return,
        };

        let mut dead = Vec::new();
        for (id, sender) in &snapshot {
            if sender.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            if let Ok(mut senders) = self.senders.lock() {
                senders.retain(|(id, _)| !dead.contains(id));
            }
            tracing::debug!("pruned {} dead subscribers", dead.len());
        }
        tracing::trace!(
            "alert broadcast: {} delivered, {} dead",
            snapshot.len() - dead.len(),
            dead.len()
        );
    }

    pub fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Client -> server messages
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientMessage {
    Query {
        question: String,
        #[serde(default = "default_max_results")]
        max_results: usize,
        #[serde(default = "default_conversation_id")]
        conversation_id: String,
        #[serde(default)]
        time_range_structured: Option<TimeRangeWire>,
    },
    Cancel,
}

fn default_max_results() -> usize {
    100
}

fn default_conversation_id() -> String {
    "default".to_string()
}

pub async fn ws_query(
    ws: WebSocketUpgrade,
    State(app): State<Arc<AnalysisApp>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: Arc<AnalysisApp>) {
    let (subscriber_id, mut alert_rx) = app.subscribers.subscribe();
    let (mut sink, mut incoming) = socket.split();

    // Workflow events funnel through one channel so ordering is preserved
    // even while the socket is also receiving client messages.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            message = incoming.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Query {
                                question,
                                max_results,
                                conversation_id,
                                time_range_structured,
                            }) => {
                                // A new query supersedes the previous one
                                abort_in_flight(&mut in_flight).await;

                                let time_range = time_range_structured.and_then(|wire| {
                                    wire.into_range().unwrap_or_else(|e| {
                                        tracing::warn!("ignoring invalid client time range: {e}");
                                        None
                                    })
                                });

                                let request = QueryRequest {
                                    question,
                                    max_results,
                                    conversation_id,
                                    time_range,
                                };
                                let task_app = app.clone();
                                let task_tx = event_tx.clone();
                                in_flight = Some(tokio::spawn(async move {
                                    stream::run_query(&task_app, request, |event| {
                                        let _ = task_tx.send(event);
                                    })
                                    .await;
                                }));
                            }
                            Ok(ClientMessage::Cancel) => {
                                if abort_in_flight(&mut in_flight).await {
                                    let _ = event_tx.send(StreamEvent::Cancelled {
                                        message: "Query cancelled by user".to_string(),
                                    });
                                }
                            }
                            Err(e) => {
                                let event = StreamEvent::error(crate::errors::ErrorEnvelope::new(
                                    crate::errors::ErrorCode::InvalidRequest,
                                    sanitize_message(&format!("invalid message: {e}")),
                                ));
                                if send_event(&mut sink, &event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: ignore
                    Some(Err(e)) => {
                        tracing::debug!("websocket receive error: {e}");
                        break;
                    }
                }
            }
            Some(event) = event_rx.recv() => {
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            Some(alert_event) = alert_rx.recv() => {
                if send_event(&mut sink, &alert_event).await.is_err() {
                    break;
                }
            }
        }
    }

    // Disconnect behaves as cancel
    abort_in_flight(&mut in_flight).await;
    app.subscribers.unsubscribe(subscriber_id);
    tracing::debug!("websocket connection closed");
}

/// Abort the running workflow, if any. Returns whether one was aborted.
async fn abort_in_flight(in_flight: &mut Option<JoinHandle<()>>) -> bool {
    if let Some(task) = in_flight.take() {
        if !task.is_finished() {
            task.abort();
            let _ = task.await;
            return true;
        }
    }
    false
}

async fn send_event(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    event: &StreamEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_parse_with_defaults() {
        let message: ClientMessage =
            serde_json::from_value(json!({"action": "query", "question": "최근 에러"})).unwrap();
        match message {
            ClientMessage::Query {
                question,
                max_results,
                conversation_id,
                time_range_structured,
            } => {
                assert_eq!(question, "최근 에러");
                assert_eq!(max_results, 100);
                assert_eq!(conversation_id, "default");
                assert!(time_range_structured.is_none());
            }
            ClientMessage::Cancel => panic!("expected query"),
        }

        let cancel: ClientMessage = serde_json::from_value(json!({"action": "cancel"})).unwrap();
        assert!(matches!(cancel, ClientMessage::Cancel));
    }

    #[test]
    fn query_accepts_structured_time_range() {
        let message: ClientMessage = serde_json::from_value(json!({
            "action": "query",
            "question": "에러",
            "conversation_id": "c-9",
            "time_range_structured": {
                "type": "relative",
                "relative": {"value": 6, "unit": "h"},
                "absolute": null
            }
        }))
        .unwrap();
        match message {
            ClientMessage::Query {
                time_range_structured,
                conversation_id,
                ..
            } => {
                assert_eq!(conversation_id, "c-9");
                let range = time_range_structured.unwrap().into_range().unwrap();
                assert!(range.is_some());
            }
            ClientMessage::Cancel => panic!("expected query"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_live_and_prunes_dead() {
        let subscribers = SubscriberSet::new();
        let (id_alive, mut rx_alive) = subscribers.subscribe();
        let (_id_dead, rx_dead) = subscribers.subscribe();
        assert_eq!(subscribers.len(), 2);

        drop(rx_dead);
        let event = StreamEvent::Cancelled {
            message: "test".to_string(),
        };
        subscribers.broadcast(&event);

        assert_eq!(rx_alive.recv().await.unwrap(), event);
        assert_eq!(subscribers.len(), 1, "dead subscriber pruned");

        subscribers.unsubscribe(id_alive);
        assert!(subscribers.is_empty());
    }
}
