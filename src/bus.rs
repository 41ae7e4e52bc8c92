//! In-process message bus.
//!
//! The inbound side is a strict single-consumer FIFO with waiter handoff:
//! each published message is delivered to exactly one consumer, messages
//! preserve enqueue order, and waiting consumers are served in FIFO order.
//!
//! The outbound side is synchronous pub/sub keyed by channel name.
//! Subscribers are invoked in registration order and must not block.
//! There is no buffering for late subscribers: a subscriber only sees
//! messages published after it registered.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

/// A message flowing into the agent (toward the dispatch loop).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: Uuid,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            received_at: Utc::now(),
        }
    }
}

/// A message flowing out of the agent (toward a channel's subscribers).
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }
}

/// An outbound subscriber callback.
pub type Subscriber = Box<dyn Fn(&OutboundMessage) + Send + Sync>;

struct Inbound {
    queue: VecDeque<BusMessage>,
    waiters: VecDeque<oneshot::Sender<BusMessage>>,
}

/// Single-consumer inbound queue plus fan-out outbound subscriptions.
pub struct MessageBus {
    inbound: Mutex<Inbound>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(Inbound {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a message to the inbound queue.
    ///
    /// If a consumer is waiting, the message is handed to the head waiter;
    /// otherwise it is enqueued. Exactly one consumer receives it.
    pub fn publish_inbound(&self, message: BusMessage) {
        let mut inbound = self.inbound.lock().expect("bus inbound lock poisoned");
        let mut message = message;
        while let Some(waiter) = inbound.waiters.pop_front() {
            // A waiter whose consumer went away just passes the message on.
            match waiter.send(message) {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
        inbound.queue.push_back(message);
    }

    /// Take the next inbound message, waiting if none is queued.
    ///
    /// Waiting consumers are resumed in the order they called this method.
    pub async fn consume_inbound(&self) -> BusMessage {
        loop {
            let receiver = {
                let mut inbound = self.inbound.lock().expect("bus inbound lock poisoned");
                if let Some(message) = inbound.queue.pop_front() {
                    return message;
                }
                let (tx, rx) = oneshot::channel();
                inbound.waiters.push_back(tx);
                rx
            };
            if let Ok(message) = receiver.await {
                return message;
            }
        }
    }

    /// Number of messages currently queued inbound.
    pub fn inbound_len(&self) -> usize {
        self.inbound
            .lock()
            .expect("bus inbound lock poisoned")
            .queue
            .len()
    }

    /// Deliver a message synchronously to every subscriber of its channel,
    /// in registration order. With no subscribers the message is dropped.
    pub fn publish_outbound(&self, message: &OutboundMessage) {
        let subscribers = self.subscribers.lock().expect("bus subscriber lock poisoned");
        match subscribers.get(&message.channel) {
            Some(list) => {
                for subscriber in list {
                    subscriber(message);
                }
            }
            None => {
                tracing::debug!(
                    channel = %message.channel,
                    "Dropping outbound message with no subscribers"
                );
            }
        }
    }

    /// Register an outbound subscriber for a channel.
    pub fn subscribe(&self, channel: impl Into<String>, subscriber: Subscriber) {
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .entry(channel.into())
            .or_default()
            .push(subscriber);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
