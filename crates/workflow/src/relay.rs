//! Forwards workflow events to live subscribers.
//!
//! The relay holds no history: events for a channel with no subscribers are
//! dropped, and a reconnecting client resynchronises through the status
//! projector.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use futures::{stream, Stream};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};

use crate::events::{RoutedEvent, WorkflowEvent};

/// Catch-all channel receiving a copy of every event.
pub const MONITORING_CHANNEL: &str = "monitoring";

pub fn workflow_channel(workflow_id: &str) -> String {
    format!("workflow-{workflow_id}")
}

/// What a subscriber receives. `channel` is the routing channel of the event,
/// also on copies delivered to the monitoring channel.
#[derive(Debug, Clone, Serialize)]
pub struct RelayMessage {
    pub channel: String,
    pub event: WorkflowEvent,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink buffer is full")]
    Full,
    #[error("Sink is closed")]
    Closed,
}

/// A connected client. Delivery must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, message: &RelayMessage) -> Result<(), SinkError>;
}

/// Sink backed by a bounded mpsc channel; the receiving half is drained by
/// an SSE or WebSocket connection.
pub struct ChannelSink {
    sender: mpsc::Sender<RelayMessage>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<RelayMessage>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, message: &RelayMessage) -> Result<(), SinkError> {
        self.sender
            .try_send(message.clone())
            .map_err(|err| match err {
                TrySendError::Full(_) => SinkError::Full,
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}

pub type SinkId = u64;

/// Dispatch table from channel key to connected sinks.
#[derive(Default)]
pub struct BroadcastRegistry {
    channels: DashMap<String, Vec<(SinkId, Arc<dyn EventSink>)>>,
    next_id: AtomicU64,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: &str, sink: Arc<dyn EventSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, sink));
        tracing::debug!("[RELAY] Registered sink {} on channel {}", id, channel);
        id
    }

    /// Remove one sink. Returns false when it was not registered.
    pub fn unregister(&self, channel: &str, id: SinkId) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut sinks) => {
                let before = sinks.len();
                sinks.retain(|(sink_id, _)| *sink_id != id);
                before != sinks.len()
            }
            None => false,
        };
        self.channels.remove_if(channel, |_, sinks| sinks.is_empty());
        if removed {
            tracing::debug!("[RELAY] Unregistered sink {} from channel {}", id, channel);
        }
        removed
    }

    /// Drop every sink on a channel, returning how many there were.
    pub fn unregister_channel(&self, channel: &str) -> usize {
        self.channels
            .remove(channel)
            .map(|(_, sinks)| sinks.len())
            .unwrap_or(0)
    }

    /// Deliver to every sink on `channel` in registration order. Closed sinks
    /// are removed; a full sink misses this message. Returns the number of
    /// successful deliveries.
    pub fn publish(&self, channel: &str, message: &RelayMessage) -> usize {
        let Some(mut sinks) = self.channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        sinks.retain(|(id, sink)| match sink.deliver(message) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(SinkError::Full) => {
                tracing::warn!(
                    "[RELAY] Sink {} on {} is lagging, dropped {}",
                    id,
                    channel,
                    message.event.name()
                );
                true
            }
            Err(SinkError::Closed) => {
                tracing::debug!("[RELAY] Sink {} on {} closed", id, channel);
                false
            }
        });
        let empty = sinks.is_empty();
        drop(sinks);

        if empty {
            self.channels.remove_if(channel, |_, sinks| sinks.is_empty());
        }
        delivered
    }

    /// Register a channel-backed sink and hand back its receiving half. The
    /// sink is unregistered when the subscription is dropped.
    pub fn subscribe(self: &Arc<Self>, channel: &str, buffer: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = self.register(channel, Arc::new(ChannelSink::new(sender)));
        Subscription {
            id,
            channel: channel.to_string(),
            receiver,
            registry: Arc::clone(self),
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

pub struct Subscription {
    id: SinkId,
    channel: String,
    receiver: mpsc::Receiver<RelayMessage>,
    registry: Arc<BroadcastRegistry>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = RelayMessage> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|message| (message, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(&self.channel, self.id);
    }
}

/// Routes bus events to their session or workflow channel and mirrors them
/// to the monitoring channel.
#[derive(Clone)]
pub struct StreamRelay {
    registry: Arc<BroadcastRegistry>,
}

impl StreamRelay {
    pub fn new(registry: Arc<BroadcastRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BroadcastRegistry> {
        &self.registry
    }

    pub fn relay(&self, routed: &RoutedEvent) {
        let message = RelayMessage {
            channel: routed.channel(),
            event: routed.event.clone(),
        };
        let delivered = self.registry.publish(&message.channel, &message);
        let mirrored = self.registry.publish(MONITORING_CHANNEL, &message);
        tracing::trace!(
            "[RELAY] {} -> {} ({} sinks, {} monitoring)",
            message.event.name(),
            message.channel,
            delivered,
            mirrored
        );
    }

    /// Drain the event bus until it closes.
    pub fn spawn(self, mut receiver: broadcast::Receiver<RoutedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(routed) => self.relay(&routed),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("[RELAY] Relay lagged behind, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("[RELAY] Event bus closed, relay stopping");
                        break;
                    }
                }
            }
        })
    }
}
