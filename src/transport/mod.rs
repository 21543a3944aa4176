// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport Seam
//!
//! The resilience layer never speaks the AMQP wire protocol itself. It drives a
//! transport through the three traits in this module: a `Transport` opens
//! connections, a `TransportConnection` opens channels, and a
//! `TransportChannel` performs the declare, bind, consume and publish round
//! trips.
//!
//! Two implementations ship with the crate:
//! - [`lapin::LapinTransport`] talks to a real broker through `lapin`.
//! - [`memory::InMemoryTransport`] is an in-process broker double with
//!   failure injection, used by tests.
//!
//! Every failure crossing this seam is an [`AmqpError`]. Implementations must
//! report a lost connection as [`AmqpError::ConnectionClosed`] so the retry
//! layer can tell it apart from operation failures.

pub mod lapin;
pub mod memory;

use crate::{
    config::ConnectionConfiguration,
    consumer::ConsumerOptions,
    errors::AmqpError,
    exchange::ExchangeOptions,
    publisher::PublisherOptions,
    queue::{BindingOptions, QueueOptions},
};
use ::lapin::BasicProperties;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries produced by a consume subscription.
///
/// The stream ends when the subscription is cancelled or the connection goes
/// away; a lost connection is reported as a final `Err` item when the
/// transport knows about it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new broker session. Fails with `ConnectFailed` on invalid URLs,
    /// authentication or TLS failures and unreachable hosts.
    async fn connect(
        &self,
        url: &str,
        configuration: &ConnectionConfiguration,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// A live broker session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A multiplexed sub-session used for topology, consume and publish calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions) -> Result<(), AmqpError>;

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: &BindingOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<Subscription, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublisherOptions,
    ) -> Result<PublishConfirmation, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles one delivery with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// An open consume subscription.
pub struct Subscription {
    /// Tag the broker knows this consumer by.
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// Broker answer to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// Publisher confirms are not enabled on the channel; the message was
    /// handed to the broker.
    NotRequested,
    Ack,
    Nack,
    /// A `mandatory` message could not be routed and came back.
    Returned,
}

/// A message received from a queue.
///
/// Acknowledgement is passed through to the broker untouched; with
/// `auto_ack` the calls below are not needed.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// A delivery without an acknowledger.
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        data: Vec<u8>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data,
            acker: None,
        }
    }

    /// Settles this delivery through `acker`.
    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub(crate) fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Remote trace context carried in the message headers.
    pub fn trace_context(&self) -> opentelemetry::Context {
        crate::otel::extract_context(&self.properties)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn data_as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Acknowledges this delivery. A no-op without an acknowledger.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Negatively acknowledges this delivery, requeueing it when `requeue` is set.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }

    /// Rejects this delivery, requeueing it when `requeue` is set.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> Delivery {
        Delivery::new(7, "orders", "orders.created", BasicProperties::default(), b"body".to_vec())
    }

    #[tokio::test]
    async fn settling_without_an_acknowledger_is_a_no_op() {
        let delivery = delivery();

        assert_eq!(delivery.ack().await, Ok(()));
        assert_eq!(delivery.nack(true).await, Ok(()));
        assert_eq!(delivery.reject(false).await, Ok(()));
    }

    #[tokio::test]
    async fn settling_is_passed_to_the_acknowledger() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));
        acker
            .expect_reject()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError("channel closed".to_owned())));
        let delivery = delivery().with_acker(Arc::new(acker));

        assert_eq!(delivery.ack().await, Ok(()));
        assert_eq!(delivery.nack(true).await, Ok(()));
        assert_eq!(
            delivery.reject(false).await,
            Err(AmqpError::AckMessageError("channel closed".to_owned()))
        );
    }
}
