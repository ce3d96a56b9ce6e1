// src/realtime/handler.rs

//! The `TopicHandler` trait: what the manager calls for each inbound message.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::realtime::messages::RealtimeEvent;
use crate::realtime::types::Topic;

/// Receives validated messages for the topic it was registered under.
///
/// Handlers run on the connection's reader task, one message at a time, in
/// arrival order. They must not block; hand work off to a channel or a task
/// if it is slow.
pub trait TopicHandler: Send + Sync + 'static {
    fn handle(&self, topic: &str, event: RealtimeEvent);
}

impl<F> TopicHandler for F
where
    F: Fn(&str, RealtimeEvent) + Send + Sync + 'static,
{
    fn handle(&self, topic: &str, event: RealtimeEvent) {
        self(topic, event)
    }
}

/// Forwards every message into an unbounded channel.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<(Topic, RealtimeEvent)>,
}

impl TopicHandler for ChannelHandler {
    fn handle(&self, topic: &str, event: RealtimeEvent) {
        if self.tx.send((topic.to_string(), event)).is_err() {
            debug!(topic, "Channel handler receiver dropped; discarding message.");
        }
    }
}

impl fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A handler paired with the receiving end of its channel.
pub fn channel() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<(Topic, RealtimeEvent)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { tx }), rx)
}

/// Republishes per-session messages on the manager's broadcast channel.
pub(crate) struct SessionForwarder {
    pub(crate) events: broadcast::Sender<RealtimeEvent>,
}

impl TopicHandler for SessionForwarder {
    fn handle(&self, topic: &str, event: RealtimeEvent) {
        if self.events.receiver_count() == 0 {
            return;
        }
        if self.events.send(event).is_err() {
            warn!(topic, "Failed to republish session message.");
        }
    }
}
