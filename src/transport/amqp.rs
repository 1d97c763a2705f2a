// src/transport/amqp.rs

use std::sync::{Arc, Mutex};

use amq_protocol_types::FieldTable;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerTransport, CloseNotifications,
    CloseReason, ConfirmNotifications, Confirmation, Deliveries, Delivery,
};
use crate::config::SessionConfig;
use crate::errors::TransportError;

/// The broker keeps at least one confirm buffered for the publisher that is
/// currently waiting on it.
const CONFIRM_BUFFER: usize = 1;

type CloseSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<CloseReason>>>>;

fn notify_close(subscribers: &CloseSubscribers, reason: &str) {
    if let Ok(subs) = subscribers.lock() {
        for tx in subs.iter() {
            let _ = tx.send(CloseReason::new(reason));
        }
    }
}

fn subscribe(subscribers: &CloseSubscribers) -> CloseNotifications {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subs) = subscribers.lock() {
        subs.push(tx);
    }
    rx
}

/// Broker transport backed by lapin.
pub struct AmqpTransport {
    heartbeat: u16,
    locale: String,
}

impl AmqpTransport {
    pub fn new(config: &SessionConfig) -> Self {
        AmqpTransport {
            heartbeat: config.heartbeat_secs,
            locale: config.locale.clone(),
        }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let mut uri: AMQPUri = addr.parse().map_err(TransportError::Dial)?;
        uri.query.heartbeat = Some(self.heartbeat);

        let mut properties = ConnectionProperties::default();
        properties.locale = self.locale.clone();

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        // lapin reports connection failure through a callback; fan it out to
        // everyone who registered for the close notification.
        let close_subscribers: CloseSubscribers = Arc::new(Mutex::new(Vec::new()));
        let subscribers = close_subscribers.clone();
        connection.on_error(move |err| {
            warn!("Broker connection errored: {}", err);
            notify_close(&subscribers, &err.to_string());
        });

        Ok(Box::new(AmqpConnection {
            connection,
            close_subscribers,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    close_subscribers: CloseSubscribers,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Box::new(AmqpChannel::new(channel)))
    }

    fn subscribe_close(&self) -> CloseNotifications {
        let rx = subscribe(&self.close_subscribers);
        // A registration on an already-dead connection fires immediately,
        // so a close racing the registration is never lost.
        if self.is_closed() {
            notify_close(&self.close_subscribers, "connection already closed");
        }
        rx
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(0, "closing session")
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
    close_subscribers: CloseSubscribers,
    confirm_tx: mpsc::Sender<Confirmation>,
    confirm_rx: Mutex<Option<ConfirmNotifications>>,
}

impl AmqpChannel {
    fn new(channel: Channel) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_BUFFER);
        AmqpChannel {
            channel,
            close_subscribers: Arc::new(Mutex::new(Vec::new())),
            confirm_tx,
            confirm_rx: Mutex::new(Some(confirm_rx)),
        }
    }

    /// lapin surfaces channel death on use rather than through a callback;
    /// route the failure to the close stream so the session rebuilds the
    /// channel instead of retrying against a dead one.
    fn channel_error(&self, err: TransportError) -> TransportError {
        if !self.channel.status().connected() {
            notify_close(&self.close_subscribers, &err.to_string());
        }
        err
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| self.channel_error(TransportError::Declare(e.to_string())))?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| self.channel_error(TransportError::Publish(e.to_string())))?;

        // The pending confirm resolves whenever the broker acknowledges;
        // feed it to the channel's confirmation stream in publish order.
        let confirm_tx = self.confirm_tx.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(LapinConfirmation::Ack(_)) => {
                    let _ = confirm_tx.send(Confirmation::Ack).await;
                }
                Ok(LapinConfirmation::Nack(_)) => {
                    let _ = confirm_tx.send(Confirmation::Nack).await;
                }
                Ok(LapinConfirmation::NotRequested) => {}
                Err(err) => debug!("Publisher confirm failed: {}", err),
            }
        });

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    nowait: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.channel_error(TransportError::Consume(e.to_string())))?;

        let close_subscribers = self.close_subscribers.clone();
        let deliveries = consumer
            .filter_map(move |item| {
                let close_subscribers = close_subscribers.clone();
                async move {
                    match item {
                        Ok(mut delivery) => {
                            let routing_key = delivery.routing_key.as_str().to_string();
                            let payload = std::mem::take(&mut delivery.data);
                            Some(Delivery {
                                routing_key,
                                payload,
                                acker: Box::new(AmqpAcker { delivery }),
                            })
                        }
                        Err(err) => {
                            warn!("Consumer stream errored: {}", err);
                            notify_close(&close_subscribers, &err.to_string());
                            None
                        }
                    }
                }
            })
            .boxed();

        Ok(Deliveries::new(deliveries))
    }

    fn subscribe_close(&self) -> CloseNotifications {
        let rx = subscribe(&self.close_subscribers);
        if !self.channel.status().connected() {
            notify_close(&self.close_subscribers, "channel already closed");
        }
        rx
    }

    fn take_confirmations(&self) -> Option<ConfirmNotifications> {
        self.confirm_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(0, "closing session")
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn accept(self: Box<Self>) -> Result<(), TransportError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        self.delivery
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
