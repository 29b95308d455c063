//! Message broker abstraction.
//!
//! Services talk to the broker through a connection, one session on that
//! connection, any number of consumers, and a single producer. Deliveries
//! are acknowledged explicitly; anything left unacknowledged is eventually
//! redelivered by the broker.

mod memory;

pub use memory::InMemoryBroker;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a broker implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("send to '{queue}' failed: {reason}")]
    Send { queue: String, reason: String },

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("{0} is closed")]
    Closed(&'static str),
}

/// A message body as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Returns the text body, or `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

/// Acknowledges one delivery back to the broker.
pub trait Acknowledger: Send + Sync {
    fn ack(&self) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, pending acknowledgement.
pub struct Delivery {
    message: Message,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            redelivered,
            acker,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// True if the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Removes the message from its queue.
    pub fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Entry point to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn Session>, BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Creates the queue if it does not exist yet.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn consumer(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError>;
    async fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery. Returns `None` once the consumer is closed.
    async fn recv(&mut self) -> Option<Delivery>;
    async fn close(&mut self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends a message, returning once the broker has accepted it.
    async fn send(&self, queue: &str, message: Message) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}
