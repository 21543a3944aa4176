// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production transport backed by the `lapin` AMQP 0.9.1 client. This module
//! owns the translation between the crate's option types and lapin's, and the
//! classification of lapin errors into connection-level and operation-level
//! failures.

use super::{
    Acknowledger, Delivery, PublishConfirmation, Subscription, Transport, TransportChannel,
    TransportConnection,
};
use crate::{
    config::{redact_url, ConnectionConfiguration},
    consumer::ConsumerOptions,
    errors::AmqpError,
    exchange::ExchangeOptions,
    publisher::PublisherOptions,
    queue::{BindingOptions, QueueOptions},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicRejectOptions, QueueBindOptions,
    },
    protocol::AMQPErrorKind,
    publisher_confirm::Confirmation,
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;

const REPLY_SUCCESS: u16 = 200;

/// Transport that opens real broker connections through `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> LapinTransport {
        LapinTransport
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        url: &str,
        configuration: &ConnectionConfiguration,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        debug!(url = redact_url(url), "creating amqp connection...");
        let options = ConnectionProperties::default().with_connection_name(LongString::from(
            configuration.effective_connection_name().to_owned(),
        ));

        let connect = async {
            match &configuration.tls {
                Some(tls) => Connection::connect_with_config(url, options, tls.to_lapin()).await,
                None => Connection::connect(url, options).await,
            }
        };

        let conn = match tokio::time::timeout(configuration.timeout, connect).await {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(err)) => {
                debug!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectFailed(err.to_string()))
            }
            Err(_) => {
                debug!(timeout = ?configuration.timeout, "timed out connecting");
                Err(AmqpError::ConnectFailed(format!(
                    "timed out after {:?}",
                    configuration.timeout
                )))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                debug!(error = err.to_string(), "error to create the channel");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| classify(err, AmqpError::InternalError))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                options.kind.into(),
                options.declare_options(),
                options.args.clone(),
            )
            .await
            .map_err(|err| {
                classify(err, |reason| {
                    AmqpError::DeclareExchangeError(name.to_owned(), reason)
                })
            })
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(name, options.declare_options(), options.args.clone())
            .await
            .map(|_| ())
            .map_err(|err| classify(err, |reason| AmqpError::DeclareQueueError(name.to_owned(), reason)))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: &BindingOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                options.args.clone(),
            )
            .await
            .map_err(|err| {
                classify(err, |reason| AmqpError::BindingExchangeToQueueError {
                    exchange: exchange.to_owned(),
                    queue: queue.to_owned(),
                    reason,
                })
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
    ) -> Result<Subscription, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                options.args.clone(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "error to create the consumer");
                classify(err, |reason| AmqpError::BindingConsumerError(queue.to_owned(), reason))
            })?;

        let consumer_tag = consumer.tag().to_string();
        let deliveries = consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.properties,
                    delivery.data,
                )
                .redelivered(delivery.redelivered)
                .with_acker(Arc::new(delivery.acker))),
                Err(err) => Err(classify(err, AmqpError::ConsumerError)),
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| classify(err, AmqpError::ConsumerError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublisherOptions,
    ) -> Result<PublishConfirmation, AmqpError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                payload,
                options.properties.clone(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "error publishing message");
                classify(err, AmqpError::PublishingError)
            })?;

        match confirm.await {
            Ok(Confirmation::NotRequested) => Ok(PublishConfirmation::NotRequested),
            Ok(Confirmation::Ack(None)) => Ok(PublishConfirmation::Ack),
            Ok(Confirmation::Ack(Some(_))) | Ok(Confirmation::Nack(Some(_))) => {
                Ok(PublishConfirmation::Returned)
            }
            Ok(Confirmation::Nack(None)) => Ok(PublishConfirmation::Nack),
            Err(err) => Err(classify(err, AmqpError::PublishingError)),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| classify(err, AmqpError::ChannelError))
    }
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(ack_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(ack_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::reject(self, BasicRejectOptions { requeue })
            .await
            .map_err(ack_error)
    }
}

fn ack_error(err: lapin::Error) -> AmqpError {
    AmqpError::AckMessageError(err.to_string())
}

/// Maps a lapin error either to `ConnectionClosed`, when the broker session is
/// gone, or to the operation-specific error built by `operation`.
pub(crate) fn classify<F>(err: lapin::Error, operation: F) -> AmqpError
where
    F: FnOnce(String) -> AmqpError,
{
    match &err {
        lapin::Error::InvalidConnectionState(state) => {
            AmqpError::connection_closed(None, format!("{:?}", state))
        }
        lapin::Error::IOError(io) => AmqpError::connection_closed(None, io.to_string()),
        lapin::Error::MissingHeartbeatError => {
            AmqpError::connection_closed(None, "missing heartbeat".to_owned())
        }
        lapin::Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Hard(_)) => {
            AmqpError::connection_closed(Some(amqp.get_id()), amqp.get_message().to_string())
        }
        _ => operation(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_errors_are_connection_errors() {
        let err = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));
        let classified = classify(err, AmqpError::PublishingError);
        assert!(classified.is_connection_error());
        assert_eq!(
            classified,
            AmqpError::connection_closed(None, "reset by peer".to_owned())
        );
    }

    #[test]
    fn acknowledgement_failures_keep_their_reason() {
        let err = ack_error(lapin::Error::ChannelsLimitReached);
        assert!(matches!(err, AmqpError::AckMessageError(reason) if !reason.is_empty()));
    }

    #[test]
    fn other_errors_keep_operation_context() {
        let classified = classify(lapin::Error::ChannelsLimitReached, |reason| {
            AmqpError::DeclareQueueError("orders".to_owned(), reason)
        });
        assert!(!classified.is_connection_error());
        assert!(matches!(classified, AmqpError::DeclareQueueError(name, _) if name == "orders"));
    }
}
