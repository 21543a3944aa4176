// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker Transport
//!
//! An in-process broker double implementing the transport traits. It is meant
//! for unit and integration tests of code built on this crate, where a real
//! RabbitMQ is unavailable or where broker failures must be provoked on
//! demand.
//!
//! ## Behavior
//!
//! - Exchanges route direct, fanout and topic messages like RabbitMQ. Headers
//!   exchanges route to every bound queue.
//! - The default exchange (`""`) routes to the queue named by the routing key.
//! - Queues keep a backlog while nobody consumes and hand deliveries to their
//!   consumers round-robin.
//! - Every delivery is treated as acknowledged.
//!
//! ## Failure injection
//!
//! - [`InMemoryTransport::set_reachable`] makes connect attempts fail.
//! - [`InMemoryTransport::set_connect_delay`] slows connect attempts down.
//! - [`InMemoryTransport::close_all_connections`] force-closes every live
//!   connection, as a broker restart would.
//! - [`InMemoryTransport::deny`] refuses declarations of a resource name.

use super::{
    Delivery, PublishConfirmation, Subscription, Transport, TransportChannel, TransportConnection,
};
use crate::{
    config::ConnectionConfiguration,
    consumer::ConsumerOptions,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    publisher::PublisherOptions,
    queue::{BindingOptions, QueueOptions},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

const CONNECTION_FORCED: u16 = 320;
const ACCESS_REFUSED: u16 = 403;
const NOT_FOUND: u16 = 404;
const PRECONDITION_FAILED: u16 = 406;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    sender: DeliverySender,
}

#[derive(Default)]
struct MemoryQueue {
    backlog: VecDeque<Delivery>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl MemoryQueue {
    /// Hands the delivery to the next live consumer, or keeps it in the
    /// backlog when there is none.
    fn enqueue(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].sender.send(Ok(delivery)) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(returned) => {
                    self.consumers.remove(idx);
                    delivery = match returned.0 {
                        Ok(delivery) => delivery,
                        Err(_) => return,
                    };
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

struct MemoryBinding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct BrokerState {
    reachable: bool,
    connect_delay: Duration,
    denied: HashSet<String>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<MemoryBinding>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    next_connection_id: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            reachable: true,
            connect_delay: Duration::ZERO,
            denied: HashSet::default(),
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: vec![],
            connections: HashMap::default(),
            next_connection_id: 1,
        }
    }
}

struct Broker {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicUsize,
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    next_delivery_tag: AtomicU64,
}

/// In-process broker that hands out connections through the `Transport` trait.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        InMemoryTransport::new()
    }
}

impl InMemoryTransport {
    /// An empty, reachable broker.
    pub fn new() -> InMemoryTransport {
        InMemoryTransport {
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState::default()),
                connect_attempts: AtomicUsize::new(0),
                connections_opened: AtomicUsize::new(0),
                channels_opened: AtomicUsize::new(0),
                next_delivery_tag: AtomicU64::new(1),
            }),
        }
    }

    /// While unreachable, every connect attempt fails with `ConnectFailed`.
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.state.lock().reachable = reachable;
    }

    /// Delay applied to every connect attempt before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.broker.state.lock().connect_delay = delay;
    }

    /// Refuses declarations of exchanges or queues named `name` with ACCESS_REFUSED.
    pub fn deny(&self, name: &str) {
        self.broker.state.lock().denied.insert(name.to_owned());
    }

    /// Lifts a [`deny`](Self::deny).
    pub fn allow(&self, name: &str) {
        self.broker.state.lock().denied.remove(name);
    }

    /// Force-closes every live connection. Their consumers receive a final
    /// `ConnectionClosed` error and every later call on their channels fails.
    pub fn close_all_connections(&self) {
        let mut state = self.broker.state.lock();
        for (_, open) in state.connections.drain() {
            open.store(false, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            for consumer in queue.consumers.drain(..) {
                let _ = consumer.sender.send(Err(AmqpError::connection_closed(
                    Some(CONNECTION_FORCED),
                    "CONNECTION_FORCED - broker forced connection closure".to_owned(),
                )));
            }
        }
    }

    /// Number of connect calls, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.broker.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connects so far.
    pub fn connections_opened(&self) -> usize {
        self.broker.connections_opened.load(Ordering::SeqCst)
    }

    /// Channels opened so far, across all connections.
    pub fn channels_opened(&self) -> usize {
        self.broker.channels_opened.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.broker.state.lock().connections.len()
    }

    /// Messages waiting in the queue backlog, or `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.broker
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
    }

    /// Active subscriptions on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.broker
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Kind of a declared exchange, `None` when it does not exist.
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.broker.state.lock().exchanges.get(exchange).copied()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.broker.state.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(
        &self,
        url: &str,
        _configuration: &ConnectionConfiguration,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.broker.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
            return Err(AmqpError::ConnectFailed(format!("invalid url scheme: {}", url)));
        }

        let mut state = self.broker.state.lock();
        if !state.reachable {
            return Err(AmqpError::ConnectFailed("connection refused".to_owned()));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(id, open.clone());
        self.broker.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    broker: Arc<Broker>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(connection_gone());
        }
        self.broker.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            connection_id: self.id,
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.state.lock();
        state.connections.remove(&self.id);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.connection_id != self.id);
        }
        Ok(())
    }
}

struct MemoryChannel {
    connection_id: u64,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    broker: Arc<Broker>,
}

impl MemoryChannel {
    fn ensure_usable(&self) -> Result<(), AmqpError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(connection_gone());
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions) -> Result<(), AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();
        let refuse = |code: u16, text: &str| {
            AmqpError::DeclareExchangeError(name.to_owned(), format!("{} {}", code, text))
        };

        if state.denied.contains(name) {
            return Err(refuse(ACCESS_REFUSED, "ACCESS_REFUSED"));
        }
        match state.exchanges.get(name).copied() {
            Some(kind) if kind != options.kind => Err(refuse(
                PRECONDITION_FAILED,
                "PRECONDITION_FAILED - inequivalent arg 'type'",
            )),
            Some(_) => Ok(()),
            None if options.passive => Err(refuse(NOT_FOUND, "NOT_FOUND")),
            None => {
                state.exchanges.insert(name.to_owned(), options.kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();

        if state.denied.contains(name) {
            return Err(AmqpError::DeclareQueueError(
                name.to_owned(),
                format!("{} ACCESS_REFUSED", ACCESS_REFUSED),
            ));
        }
        if options.passive && !state.queues.contains_key(name) {
            return Err(AmqpError::DeclareQueueError(
                name.to_owned(),
                format!("{} NOT_FOUND", NOT_FOUND),
            ));
        }
        state.queues.entry(name.to_owned()).or_default();
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: &BindingOptions,
    ) -> Result<(), AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                reason: format!("{} NOT_FOUND", NOT_FOUND),
            });
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(MemoryBinding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<Subscription, AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();
        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(
                queue.to_owned(),
                format!("{} NOT_FOUND", NOT_FOUND),
            ));
        };

        let consumer_tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            options.consumer_tag.clone()
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        for delivery in memory_queue.backlog.drain(..) {
            let _ = sender.send(Ok(delivery));
        }
        memory_queue.consumers.push(ConsumerSlot {
            tag: consumer_tag.clone(),
            connection_id: self.connection_id,
            sender,
        });
        trace!(queue, consumer_tag, "in-memory consumer registered");

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublisherOptions,
    ) -> Result<PublishConfirmation, AmqpError> {
        self.ensure_usable()?;
        let mut state = self.broker.state.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            }
        } else {
            let Some(kind) = state.exchanges.get(exchange).copied() else {
                // A real broker closes the channel on this error.
                self.open.store(false, Ordering::SeqCst);
                return Err(AmqpError::PublishingError(format!(
                    "{} NOT_FOUND - no exchange '{}'",
                    NOT_FOUND, exchange
                )));
            };
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && routes(kind, &b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() && options.mandatory {
            return Ok(PublishConfirmation::Returned);
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                let tag = self.broker.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
                queue.enqueue(Delivery::new(
                    tag,
                    exchange,
                    routing_key,
                    options.properties.clone(),
                    payload.to_vec(),
                ));
            }
        }

        Ok(PublishConfirmation::NotRequested)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn connection_gone() -> AmqpError {
    AmqpError::connection_closed(
        Some(CONNECTION_FORCED),
        "CONNECTION_FORCED - broker forced connection closure".to_owned(),
    )
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}
