//! Push channels: long-lived SSE connections that carry RPC responses for
//! messages posted to `/messages?connection_id=...`.
//!
//! Each channel is supervised by one task that owns its heartbeat and
//! lifetime timers. The task stops, and the channel is deregistered, when
//! the peer goes away, when the lifetime cap is hit, or when the server's
//! cancellation token fires. No timer outlives its channel.
//!
//! Responses wait for buffer space rather than being dropped; heartbeats
//! are skipped when the buffer is full.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::sse::Event;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub const MESSAGES_PATH: &str = "/messages";

const CHANNEL_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MaxLifetime,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::MaxLifetime => "max_lifetime",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    /// Where the client should POST its messages.
    Endpoint(String),
    Connected { connection_id: Uuid, tools: usize },
    Heartbeat,
    /// One JSON-RPC response envelope.
    Response(Value),
    Closed { reason: CloseReason },
}

impl PushMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            PushMessage::Endpoint(_) => "endpoint",
            PushMessage::Connected { .. } => "connection",
            PushMessage::Heartbeat => "ping",
            PushMessage::Response(_) => "message",
            PushMessage::Closed { .. } => "close",
        }
    }

    pub fn into_event(self) -> Event {
        let event = Event::default().event(self.event_name());
        match self {
            PushMessage::Endpoint(path) => event.data(path),
            PushMessage::Connected {
                connection_id,
                tools,
            } => event.data(
                json!({
                    "type": "connection",
                    "status": "connected",
                    "connectionId": connection_id,
                    "tools": tools
                })
                .to_string(),
            ),
            PushMessage::Heartbeat => event.data(json!({ "type": "ping" }).to_string()),
            PushMessage::Response(envelope) => event.data(envelope.to_string()),
            PushMessage::Closed { reason } => event.data(
                json!({ "type": "close", "reason": reason.as_str() }).to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PushTimings {
    pub heartbeat: Duration,
    pub max_lifetime: Duration,
}

#[derive(Clone)]
struct ChannelEntry {
    sender: mpsc::Sender<PushMessage>,
    session_id: Option<String>,
    /// Cancelled once the supervisor has exited.
    closed: CancellationToken,
}

/// A freshly opened channel; the receiver feeds the SSE response.
pub struct PushChannel {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<PushMessage>,
}

/// Registry of open push channels, keyed by connection id.
#[derive(Clone, Default)]
pub struct PushChannels {
    inner: Arc<Mutex<HashMap<Uuid, ChannelEntry>>>,
}

impl PushChannels {
    pub fn open(
        &self,
        session_id: Option<String>,
        tools: usize,
        timings: PushTimings,
        cancel: CancellationToken,
    ) -> PushChannel {
        let id = Uuid::now_v7();
        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER);

        // Queued before registration, so they always precede any response.
        let _ = sender.try_send(PushMessage::Endpoint(format!(
            "{MESSAGES_PATH}?connection_id={id}"
        )));
        let _ = sender.try_send(PushMessage::Connected {
            connection_id: id,
            tools,
        });

        let closed = cancel.child_token();
        self.lock().insert(
            id,
            ChannelEntry {
                sender: sender.clone(),
                session_id,
                closed: closed.clone(),
            },
        );

        let channels = self.clone();
        tokio::spawn(async move {
            let _release_pending = closed.clone().drop_guard();
            let outcome = supervise(&sender, timings, &closed).await;
            channels.remove(&id);
            debug!(
                event = "push_channel_closed",
                connection_id = %id,
                outcome,
                "push channel closed"
            );
        });

        PushChannel { id, receiver }
    }

    /// Session id captured when the channel was opened, if the channel is live.
    pub fn session_id(&self, id: &Uuid) -> Option<Option<String>> {
        self.lock().get(id).map(|entry| entry.session_id.clone())
    }

    /// Queues a message on a live channel, waiting for buffer space while
    /// the reader catches up. Returns false only once the channel is closed.
    pub async fn deliver(&self, id: &Uuid, message: PushMessage) -> bool {
        let (sender, closed) = match self.lock().get(id) {
            Some(entry) => (entry.sender.clone(), entry.closed.clone()),
            None => return false,
        };
        tokio::select! {
            biased;
            _ = closed.cancelled() => false,
            sent = sender.send(message) => sent.is_ok(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn remove(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ChannelEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn supervise(
    sender: &mpsc::Sender<PushMessage>,
    timings: PushTimings,
    cancel: &CancellationToken,
) -> &'static str {
    let deadline = tokio::time::sleep(timings.max_lifetime);
    tokio::pin!(deadline);
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + timings.heartbeat, timings.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sender.try_send(PushMessage::Closed { reason: CloseReason::Shutdown });
                return CloseReason::Shutdown.as_str();
            }
            _ = sender.closed() => return "peer_disconnected",
            _ = &mut deadline => {
                let _ = sender.try_send(PushMessage::Closed { reason: CloseReason::MaxLifetime });
                return CloseReason::MaxLifetime.as_str();
            }
            _ = heartbeat.tick() => {
                if let Err(mpsc::error::TrySendError::Closed(_)) = sender.try_send(PushMessage::Heartbeat) {
                    return "peer_disconnected";
                }
            }
        }
    }
}
