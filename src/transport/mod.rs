// src/transport/mod.rs
// Broker transport abstraction: the session core only talks to the broker
// through these traits, so tests can substitute an in-memory double.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;
use tokio::sync::mpsc;

use crate::errors::TransportError;

pub mod amqp;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;

/// Broker acknowledgment outcome for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack)
    }
}

/// Reason attached to a connection or channel close notification.
#[derive(Debug, Clone)]
pub struct CloseReason {
    pub message: String,
}

impl CloseReason {
    pub fn new(message: impl Into<String>) -> Self {
        CloseReason { message: message.into() }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Stream of close notifications for one connection or channel handle.
pub type CloseNotifications = mpsc::UnboundedReceiver<CloseReason>;

/// Stream of publisher confirms for one channel, in publish order.
pub type ConfirmNotifications = mpsc::Receiver<Confirmation>;

/// Capability to dial a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// One network-level session with the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    /// Registers for the asynchronous close notification. May be called by
    /// several owners: a session and the sessions derived from it.
    fn subscribe_close(&self) -> CloseNotifications;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// One protocol channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Puts the channel into publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    /// Blocking declare of a non-durable, non-exclusive queue that is not
    /// auto-deleted.
    async fn declare_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Publishes `payload` on the default exchange. Returns once the
    /// publish call itself completes; the broker's confirm arrives later on
    /// the confirmation stream.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Starts server-push delivery for `queue` and returns the lazy,
    /// unbounded stream of deliveries.
    async fn consume(&self, queue: &str) -> Result<Deliveries, TransportError>;

    /// Registers for the asynchronous close notification.
    fn subscribe_close(&self) -> CloseNotifications;

    /// Hands over the channel's confirmation stream. Yields `None` after
    /// the first call; the stream belongs to whoever initialized the
    /// channel.
    fn take_confirmations(&self) -> Option<ConfirmNotifications>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Acknowledgment capability carried by a [`Delivery`].
#[async_trait]
pub trait Acknowledger: Send {
    async fn accept(self: Box<Self>) -> Result<(), TransportError>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), TransportError>;
}

/// One inbound message. Ownership transfers to the caller, which must call
/// [`accept`](Delivery::accept) or [`reject`](Delivery::reject);
/// unacknowledged deliveries accumulate on the broker.
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub(crate) acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub async fn accept(self) -> Result<(), TransportError> {
        self.acker.accept().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Lazy, unbounded, non-restartable stream of queue deliveries.
pub struct Deliveries {
    inner: BoxStream<'static, Delivery>,
}

impl Deliveries {
    pub(crate) fn new(inner: BoxStream<'static, Delivery>) -> Self {
        Deliveries { inner }
    }
}

impl Stream for Deliveries {
    type Item = Delivery;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
