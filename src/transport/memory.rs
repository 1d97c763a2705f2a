// src/transport/memory.rs
// In-memory broker double: scriptable dial/publish failures, scripted
// confirm outcomes, injectable close events and call counters. Backs the
// session property tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerTransport, CloseNotifications,
    CloseReason, ConfirmNotifications, Confirmation, Deliveries, Delivery,
};
use crate::errors::TransportError;

#[derive(Default)]
struct MemoryState {
    dial_failures: usize,
    channel_open_failures: usize,
    publish_failures: usize,
    dial_count: usize,
    channel_open_count: usize,
    publish_count: usize,
    confirm_script: VecDeque<Option<Confirmation>>,
    declared_queues: Vec<String>,
    buffered: HashMap<String, VecDeque<(String, Vec<u8>)>>,
    consumers: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    conn_close_subs: Vec<mpsc::UnboundedSender<CloseReason>>,
    chan_close_subs: Vec<mpsc::UnboundedSender<CloseReason>>,
    // Closed flags of the live connection and the live channels, so the
    // control surface can kill them out from under the session.
    live_connection: Option<Arc<AtomicBool>>,
    live_channels: Vec<Arc<AtomicBool>>,
    accepted: Vec<Vec<u8>>,
    rejected: Vec<Vec<u8>>,
}

fn make_delivery(
    state: &Arc<Mutex<MemoryState>>,
    routing_key: String,
    payload: Vec<u8>,
) -> Delivery {
    Delivery {
        routing_key,
        payload: payload.clone(),
        acker: Box::new(MemoryAcker {
            state: state.clone(),
            payload,
        }),
    }
}

fn deliver_locked(
    state_arc: &Arc<Mutex<MemoryState>>,
    state: &mut MemoryState,
    queue: &str,
    routing_key: &str,
    payload: Vec<u8>,
) {
    if let Some(senders) = state.consumers.get_mut(queue) {
        while let Some(tx) = senders.last() {
            let delivery = make_delivery(state_arc, routing_key.to_string(), payload.clone());
            if tx.send(delivery).is_ok() {
                return;
            }
            // Consumer stream was dropped; discard it and fall back.
            senders.pop();
        }
    }
    state
        .buffered
        .entry(queue.to_string())
        .or_default()
        .push_back((routing_key.to_string(), payload));
}

/// In-memory broker transport for tests.
#[derive(Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory transport state poisoned")
    }

    /// Makes the next `count` dial attempts fail.
    pub fn fail_dials(&self, count: usize) {
        self.state().dial_failures = count;
    }

    /// Makes the next `count` channel opens fail.
    pub fn fail_channel_opens(&self, count: usize) {
        self.state().channel_open_failures = count;
    }

    /// Makes the next `count` publish calls fail locally.
    pub fn fail_publishes(&self, count: usize) {
        self.state().publish_failures = count;
    }

    /// Scripts the confirm outcome for one future publish: `Some` sends the
    /// given confirm, `None` sends nothing (confirm lost). Publishes beyond
    /// the script acknowledge positively.
    pub fn script_confirm(&self, confirm: Option<Confirmation>) {
        self.state().confirm_script.push_back(confirm);
    }

    pub fn dial_count(&self) -> usize {
        self.state().dial_count
    }

    pub fn channel_open_count(&self) -> usize {
        self.state().channel_open_count
    }

    pub fn publish_count(&self) -> usize {
        self.state().publish_count
    }

    /// Every queue name passed to `declare_queue`, in call order.
    pub fn declared_queues(&self) -> Vec<String> {
        self.state().declared_queues.clone()
    }

    pub fn accepted(&self) -> Vec<Vec<u8>> {
        self.state().accepted.clone()
    }

    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.state().rejected.clone()
    }

    /// Places a message on `queue` as if the broker routed it there. The
    /// message is buffered until a consumer exists.
    pub fn deliver(&self, queue: &str, routing_key: &str, payload: &[u8]) {
        let state_arc = self.state.clone();
        let mut state = self.state();
        deliver_locked(&state_arc, &mut state, queue, routing_key, payload.to_vec());
    }

    /// Kills the live channels and fires their close notifications. The
    /// connection stays up.
    pub fn close_channel(&self, reason: &str) {
        let mut state = self.state();
        for closed in state.live_channels.drain(..) {
            closed.store(true, Ordering::SeqCst);
        }
        state.consumers.clear();
        for tx in state.chan_close_subs.drain(..) {
            let _ = tx.send(CloseReason::new(reason));
        }
    }

    /// Kills the current connection (and with it the live channels) and
    /// fires the connection close notification. Channel close subscribers
    /// are left pending: the connection-level notification is what drives
    /// recovery.
    pub fn close_connection(&self, reason: &str) {
        let mut state = self.state();
        if let Some(closed) = state.live_connection.take() {
            closed.store(true, Ordering::SeqCst);
        }
        for closed in state.live_channels.drain(..) {
            closed.store(true, Ordering::SeqCst);
        }
        state.consumers.clear();
        for tx in state.conn_close_subs.drain(..) {
            let _ = tx.send(CloseReason::new(reason));
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn dial(&self, _addr: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let mut state = self.state();
        state.dial_count += 1;
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(TransportError::Dial("simulated dial failure".into()));
        }
        let closed = Arc::new(AtomicBool::new(false));
        state.live_connection = Some(closed.clone());
        state.conn_close_subs.clear();
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            closed,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory transport state poisoned")
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.state();
        state.channel_open_count += 1;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("connection closed".into()));
        }
        if state.channel_open_failures > 0 {
            state.channel_open_failures -= 1;
            return Err(TransportError::Channel("simulated channel failure".into()));
        }
        let closed = Arc::new(AtomicBool::new(false));
        state.live_channels.push(closed.clone());
        let (confirm_tx, confirm_rx) = mpsc::channel(16);
        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            closed,
            conn_closed: self.closed.clone(),
            confirm_tx,
            confirm_rx: Mutex::new(Some(confirm_rx)),
        }))
    }

    fn subscribe_close(&self) -> CloseNotifications {
        let (tx, rx) = mpsc::unbounded_channel();
        // A registration on an already-dead connection fires immediately,
        // so a close racing the registration is never lost. Checked under
        // the state lock that close_connection also takes.
        let mut state = self.state();
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(CloseReason::new("connection already closed"));
        }
        state.conn_close_subs.push(tx);
        rx
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Local close: no notification, matching a broker client that only
        // raises close events for remote failures.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
    conn_closed: Arc<AtomicBool>,
    confirm_tx: mpsc::Sender<Confirmation>,
    confirm_rx: Mutex<Option<ConfirmNotifications>>,
}

impl MemoryChannel {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory transport state poisoned")
    }

    fn is_dead(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.conn_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn enable_confirms(&self) -> Result<(), TransportError> {
        if self.is_dead() {
            return Err(TransportError::Channel("channel closed".into()));
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        if self.is_dead() {
            return Err(TransportError::Declare("channel closed".into()));
        }
        let mut state = self.state();
        state.declared_queues.push(name.to_string());
        state.buffered.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let confirm = {
            let state_arc = self.state.clone();
            let mut state = self.state();
            state.publish_count += 1;
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(TransportError::Publish("simulated publish failure".into()));
            }
            if self.is_dead() {
                return Err(TransportError::Publish("channel closed".into()));
            }
            // Default exchange: route to the queue named by the routing key.
            if state.declared_queues.iter().any(|q| q == routing_key) {
                deliver_locked(&state_arc, &mut state, routing_key, routing_key, payload.to_vec());
            }
            state.confirm_script.pop_front().unwrap_or(Some(Confirmation::Ack))
        };

        if let Some(confirm) = confirm {
            let _ = self.confirm_tx.try_send(confirm);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries, TransportError> {
        if self.is_dead() {
            return Err(TransportError::Consume("channel closed".into()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        {
            let state_arc = self.state.clone();
            let mut state = self.state();
            // Hand over anything that arrived while no consumer existed,
            // preserving send order.
            if let Some(buffer) = state.buffered.get_mut(queue) {
                let pending: Vec<_> = buffer.drain(..).collect();
                for (routing_key, payload) in pending {
                    let _ = tx.send(make_delivery(&state_arc, routing_key, payload));
                }
            }
            state.consumers.entry(queue.to_string()).or_default().push(tx);
        }

        let deliveries = futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        Ok(Deliveries::new(deliveries))
    }

    fn subscribe_close(&self) -> CloseNotifications {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if self.is_dead() {
            let _ = tx.send(CloseReason::new("channel already closed"));
        }
        state.chan_close_subs.push(tx);
        rx
    }

    fn take_confirmations(&self) -> Option<ConfirmNotifications> {
        self.confirm_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<MemoryState>>,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn accept(self: Box<Self>) -> Result<(), TransportError> {
        if let Ok(mut state) = self.state.lock() {
            state.accepted.push(self.payload.clone());
        }
        Ok(())
    }

    async fn reject(self: Box<Self>, _requeue: bool) -> Result<(), TransportError> {
        if let Ok(mut state) = self.state.lock() {
            state.rejected.push(self.payload.clone());
        }
        Ok(())
    }
}
