//! Message bus abstraction. The core never depends on NATS directly: every
//! publish/subscribe goes through the [`MessageBus`] trait so tests and
//! `--dev` mode can swap in [`InMemoryBus`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::errors::AppError;

/// A single message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
}

pub type MessageStream = std::pin::Pin<Box<dyn Stream<Item = Message> + Send>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), AppError>;
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, AppError>;
    async fn close(&self) -> Result<(), AppError>;
}

/// In-process transport backed by `tokio::sync::broadcast`, one channel per
/// subject. Used by unit/integration tests and `--dev` single-process mode,
/// where coordinator and agent share an address space.
pub struct InMemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Message>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, subject: &str) -> broadcast::Sender<Message> {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), AppError> {
        let sender = self.sender_for(subject);
        // No subscribers yet is not an error: publishes are fire-and-forget,
        // matching the at-least-once (best-effort) pub/sub semantics NATS gives us.
        let _ = sender.send(Message {
            subject: subject.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, AppError> {
        let sender = self.sender_for(subject);
        let stream = BroadcastStream::new(sender.subscribe()).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Production transport over NATS.
pub struct NatsBus {
    client: async_nats::Client,
}

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(2);

impl NatsBus {
    /// Connects with a 5s connect timeout, retrying up to 3 times with a 2s
    /// backoff between attempts. Once connected, async-nats itself handles
    /// reconnects transparently; this loop only covers the initial handshake
    /// the control loop needs before it can register.
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let mut last_err = None;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let connect = async_nats::ConnectOptions::new().connection_timeout(CONNECT_TIMEOUT);
            match tokio::time::timeout(CONNECT_TIMEOUT, connect.connect(url)).await {
                Ok(Ok(client)) => return Ok(NatsBus { client }),
                Ok(Err(e)) => last_err = Some(format!("failed to connect to message bus: {e}")),
                Err(_) => last_err = Some(format!("timed out connecting to message bus at {url}")),
            }
            if attempt < MAX_RECONNECT_ATTEMPTS {
                tracing::warn!(attempt, url, "message bus connect attempt failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
        Err(AppError::Bus(last_err.unwrap_or_else(|| "exhausted connect attempts".into())))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), AppError> {
        self.client
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| AppError::Bus(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<MessageStream, AppError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| AppError::Bus(e.to_string()))?;
        let stream = subscriber.map(|msg| Message {
            subject: msg.subject.to_string(),
            payload: msg.payload.to_vec(),
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), AppError> {
        self.client
            .flush()
            .await
            .map_err(|e| AppError::Bus(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_delivers_to_subscriber() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test.subject").await.unwrap();
        bus.publish("test.subject", b"hello").await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.subject, "test.subject");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = InMemoryBus::new();
        bus.publish("nobody.listening", b"x").await.unwrap();
    }

    #[tokio::test]
    async fn distinct_subjects_are_isolated() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("a").await.unwrap();
        let _b = bus.subscribe("b").await.unwrap();
        bus.publish("a", b"for-a").await.unwrap();
        let msg = a.next().await.unwrap();
        assert_eq!(msg.subject, "a");
    }
}
