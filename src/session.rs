// src/session.rs
// Session lifecycle: automatic reconnection, channel recovery, confirmed
// publishing and streaming consumption against whatever channel is current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::SessionConfig;
use crate::errors::{SessionError, TransportError};
use crate::transport::{
    AmqpTransport, BrokerChannel, BrokerConnection, BrokerTransport, CloseNotifications,
    ConfirmNotifications, Confirmation, Deliveries,
};

/// What the channel initializer reports back to the connection manager.
enum Flow {
    Shutdown,
    ConnectionLost,
}

/// A resilient broker session for one named queue.
///
/// The session dials in the background and keeps itself connected across
/// broker restarts and channel exceptions; callers never manage reconnect
/// logic. Publishing and consuming fail fast with
/// [`SessionError::NotConnected`] while recovery is in progress.
///
/// Cloning is cheap and every clone drives the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    name: String,
    config: SessionConfig,
    transport: Arc<dyn BrokerTransport>,
    ready: AtomicBool,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    confirmations: AsyncMutex<Option<ConfirmNotifications>>,
    // Serializes confirmed publishes so that "next confirm on the stream"
    // always belongs to the publish that is waiting for it.
    publish_lock: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Creates a session named `name` (also the queue name) and immediately
    /// begins connecting to `addr` in the background. Returns at once;
    /// readiness becomes true asynchronously.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &str, addr: &str) -> Self {
        Self::with_config(name, addr, SessionConfig::default())
    }

    pub fn with_config(name: &str, addr: &str, config: SessionConfig) -> Self {
        let transport = Arc::new(AmqpTransport::new(&config));
        Self::with_transport(name, addr, config, transport)
    }

    /// Builds a session on top of a caller-supplied transport. This is the
    /// seam tests use to substitute an in-memory broker.
    pub fn with_transport(
        name: &str,
        addr: &str,
        config: SessionConfig,
        transport: Arc<dyn BrokerTransport>,
    ) -> Self {
        let inner = Arc::new(SessionInner::new(name, config, transport));

        let task_inner = inner.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            task_inner.run_reconnect(&addr).await;
        });

        Session { inner }
    }

    /// Creates a session that shares this session's connection, running its
    /// own channel against it for a separate queue.
    ///
    /// The derived session does not redial: when the shared connection is
    /// lost it stays not-ready until closed. Close derived sessions before
    /// closing the parent.
    pub fn derive(&self, name: &str) -> Result<Session, SessionError> {
        let connection = self
            .inner
            .current_connection()
            .ok_or(SessionError::NotConnected)?;

        let inner = Arc::new(SessionInner::new(
            name,
            self.inner.config.clone(),
            self.inner.transport.clone(),
        ));
        let conn_close = connection.subscribe_close();
        inner.store_connection(connection.clone());

        let task_inner = inner.clone();
        tokio::spawn(async move {
            if let Flow::ConnectionLost = task_inner.run_channel(connection, conn_close).await {
                info!(
                    "Shared connection lost; derived session {} will not redial",
                    task_inner.name
                );
            }
        });

        Ok(Session { inner })
    }

    /// Publishes `payload` and blocks until the broker confirms it.
    ///
    /// Failed publish calls and missing or negative confirms are retried
    /// until a positive confirm arrives, accepting duplicate delivery over
    /// a silently dropped message. The only caller-visible bound on the
    /// retrying is the shutdown signal.
    pub async fn push(&self, routing_key: &str, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotConnected);
        }
        let inner = &self.inner;
        let _publishing = inner.publish_lock.lock().await;

        loop {
            if let Err(err) = self.unsafe_push(routing_key, payload).await {
                warn!("Push failed. Retrying... {}", err);
                if inner.wait_or_shutdown(inner.config.resend_delay).await {
                    return Err(SessionError::ShuttingDown);
                }
                continue;
            }

            let mut confirmations = inner.confirmations.lock().await;
            let mut shutdown = inner.shutdown.subscribe();
            tokio::select! {
                _ = shutdown.wait_for(|fired| *fired) => {
                    return Err(SessionError::ShuttingDown);
                }
                confirm = recv_confirmation(&mut confirmations) => {
                    if matches!(confirm, Some(Confirmation::Ack)) {
                        info!("Push confirmed");
                        return Ok(());
                    }
                }
                _ = sleep(inner.config.resend_delay) => {}
            }
            drop(confirmations);
            info!("Push didn't confirm. Retrying...");
        }
    }

    /// Publishes without waiting for a confirm: one attempt, the
    /// transport's own outcome, no delivery guarantee.
    pub async fn unsafe_push(&self, routing_key: &str, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotConnected);
        }
        let channel = self
            .inner
            .current_channel()
            .ok_or(SessionError::NotConnected)?;
        channel.publish(routing_key, payload).await?;
        Ok(())
    }

    /// Returns the stream of deliveries for this session's queue.
    ///
    /// Every delivery must be explicitly accepted or rejected; ignoring
    /// this causes data to build up on the server. The stream ends when the
    /// current channel dies — obtain a fresh one once the session is ready
    /// again.
    pub async fn stream(&self) -> Result<Deliveries, SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotConnected);
        }
        let channel = self
            .inner
            .current_channel()
            .ok_or(SessionError::NotConnected)?;
        Ok(channel.consume(&self.inner.name).await?)
    }

    /// Non-blocking snapshot of the readiness flag: true only while a
    /// channel is fully initialized on a live connection and the session is
    /// not shutting down.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cleanly shuts down the channel and connection and stops the
    /// background loops. A second call returns
    /// [`SessionError::AlreadyClosed`]. Concurrent calls race on the
    /// readiness check; callers serialize.
    pub async fn close(&self) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::AlreadyClosed);
        }
        let inner = &self.inner;

        if let Some(channel) = inner.take_channel() {
            if let Err(err) = channel.close().await {
                warn!("Failed to close channel: {}", err);
            }
        }
        if let Some(connection) = inner.take_connection() {
            if !connection.is_closed() {
                if let Err(err) = connection.close().await {
                    warn!("Failed to close connection: {}", err);
                }
            }
        }

        // Fires exactly once; wakes every current and future waiter.
        let _ = inner.shutdown.send(true);
        inner.set_ready(false);
        Ok(())
    }
}

impl SessionInner {
    fn new(name: &str, config: SessionConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        SessionInner {
            name: name.to_string(),
            config,
            transport,
            ready: AtomicBool::new(false),
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            confirmations: AsyncMutex::new(None),
            publish_lock: AsyncMutex::new(()),
            shutdown,
        }
    }

    /// Connection-manager loop: dial until success, hand the connection to
    /// the channel initializer, and redial whenever it reports the
    /// connection lost. Exits only on shutdown.
    async fn run_reconnect(&self, addr: &str) {
        loop {
            if self.is_shutdown() {
                return;
            }
            self.set_ready(false);
            info!("Attempting to connect to {}", addr);

            let connection: Arc<dyn BrokerConnection> = match self.transport.dial(addr).await {
                Ok(connection) => Arc::from(connection),
                Err(err) => {
                    error!("Failed to connect. Retrying... {}", err);
                    if self.wait_or_shutdown(self.config.reconnect_delay).await {
                        return;
                    }
                    continue;
                }
            };

            let conn_close = connection.subscribe_close();
            self.store_connection(connection.clone());
            info!("Connected to {}", addr);

            if let Flow::Shutdown = self.run_channel(connection, conn_close).await {
                return;
            }
        }
    }

    /// Channel-initializer loop: (re)build the channel on the given
    /// connection until shutdown, or until the connection itself goes away.
    /// A channel-level failure recovers here without redialing.
    async fn run_channel(
        &self,
        connection: Arc<dyn BrokerConnection>,
        mut conn_close: CloseNotifications,
    ) -> Flow {
        loop {
            self.set_ready(false);

            let mut chan_close = match self.init_channel(connection.as_ref()).await {
                Ok(chan_close) => chan_close,
                Err(err) => {
                    error!("Failed to initialize channel. Retrying... {}", err);
                    if self.wait_or_shutdown(self.config.reinit_delay).await {
                        return Flow::Shutdown;
                    }
                    continue;
                }
            };

            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                _ = shutdown.wait_for(|fired| *fired) => {
                    return Flow::Shutdown;
                }
                reason = conn_close.recv() => {
                    self.set_ready(false);
                    match reason {
                        Some(reason) => info!("Connection closed: {}. Reconnecting...", reason),
                        None => info!("Connection closed. Reconnecting..."),
                    }
                    return Flow::ConnectionLost;
                }
                reason = chan_close.recv() => {
                    self.set_ready(false);
                    match reason {
                        Some(reason) => info!("Channel closed: {}. Re-running init...", reason),
                        None => info!("Channel closed. Re-running init..."),
                    }
                }
            }
        }
    }

    /// Opens a channel, enables confirms, declares the queue and installs
    /// the channel as current. Returns the channel's close notifications
    /// for the initializer to wait on.
    async fn init_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<CloseNotifications, TransportError> {
        let channel: Arc<dyn BrokerChannel> = Arc::from(connection.open_channel().await?);
        channel.enable_confirms().await?;
        channel.declare_queue(&self.name).await?;

        let chan_close = channel.subscribe_close();
        let confirmations = channel.take_confirmations();

        *self.confirmations.lock().await = confirmations;
        self.store_channel(channel);
        self.set_ready(true);
        info!("Queue {} declared; session ready", self.name);

        Ok(chan_close)
    }

    /// Sleeps for `delay` unless the shutdown signal fires first. Returns
    /// true when shutting down.
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|fired| *fired) => true,
            _ = sleep(delay) => false,
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn store_connection(&self, connection: Arc<dyn BrokerConnection>) {
        if let Ok(mut guard) = self.connection.lock() {
            *guard = Some(connection);
        }
    }

    fn store_channel(&self, channel: Arc<dyn BrokerChannel>) {
        if let Ok(mut guard) = self.channel.lock() {
            *guard = Some(channel);
        }
    }

    fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.lock().ok().and_then(|guard| guard.clone())
    }

    fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.lock().ok().and_then(|guard| guard.clone())
    }

    fn take_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.lock().ok().and_then(|mut guard| guard.take())
    }

    fn take_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Waits on the current confirmation stream; pends forever when no channel
/// has installed one, leaving the timeout to win the race.
async fn recv_confirmation(
    confirmations: &mut Option<ConfirmNotifications>,
) -> Option<Confirmation> {
    match confirmations {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
