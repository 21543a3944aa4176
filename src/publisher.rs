// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! [`Publisher`] declares its exchange and publishes one message per call,
//! failing fast when the broker is unavailable. [`RetryingPublisher`] keeps
//! retrying the same publish until it goes through or shutdown is requested.
//!
//! Every message gets a UUID v4 `message_id` unless one was set, and carries
//! the current OpenTelemetry context in its headers.

use crate::{
    config::DEFAULT_RETRY_INTERVAL,
    connection::Connection,
    errors::AmqpError,
    exchange::ExchangeOptions,
    otel,
    retry::with_retrying_connection_body,
    topology::{AmqpTopology, Topology},
    transport::PublishConfirmation,
};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Options applied to every publish.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub(crate) mandatory: bool,
    pub(crate) immediate: bool,
    pub(crate) properties: BasicProperties,
    pub(crate) retry_interval: Duration,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        PublisherOptions {
            mandatory: false,
            immediate: false,
            properties: BasicProperties::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl PublisherOptions {
    /// Options with no publish flags set.
    pub fn new() -> PublisherOptions {
        PublisherOptions::default()
    }

    /// Asks the broker to return messages that cannot be routed to any queue.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets the `immediate` flag. RabbitMQ 3 and later refuse it.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Properties sent with every message.
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Marks messages as `application/json`.
    pub fn json(mut self) -> Self {
        self.properties = self
            .properties
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        self
    }

    /// Interval between attempts of a retrying publish.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// What a publisher publishes to.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfiguration {
    pub exchange_name: String,
    pub exchange_options: ExchangeOptions,
    pub publisher_options: PublisherOptions,
}

impl PublisherConfiguration {
    /// Publishes to `exchange_name`; an empty name targets the default exchange.
    pub fn new(exchange_name: &str) -> PublisherConfiguration {
        PublisherConfiguration {
            exchange_name: exchange_name.to_owned(),
            ..Default::default()
        }
    }

    /// Options for declaring the exchange.
    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange_options = options;
        self
    }

    /// Options for each publish and its retries.
    pub fn publisher_options(mut self, options: PublisherOptions) -> Self {
        self.publisher_options = options;
        self
    }
}

/// Publishes messages over a shared connection.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<dyn Connection>,
    configuration: PublisherConfiguration,
}

impl Publisher {
    /// A publisher over `connection`.
    pub fn new(connection: Arc<dyn Connection>, configuration: PublisherConfiguration) -> Publisher {
        Publisher {
            connection,
            configuration,
        }
    }

    pub fn configuration(&self) -> &PublisherConfiguration {
        &self.configuration
    }

    /// Declares the exchange, when named, and publishes `data` once.
    ///
    /// Fails with `NotConnected` when the connection is down and propagates
    /// every broker error.
    pub async fn publish(
        &self,
        data: impl AsRef<[u8]>,
        routing_key: &str,
    ) -> Result<PublishConfirmation, AmqpError> {
        let cfg = &self.configuration;
        let channel = self.connection.get_channel().await?;

        AmqpTopology::new(channel.clone())
            .exchange(&cfg.exchange_name, &cfg.exchange_options)
            .install()
            .await?;

        let mut options = cfg.publisher_options.clone();
        options.properties = prepare_properties(options.properties);

        trace!(
            exchange = cfg.exchange_name.as_str(),
            routing_key,
            "publishing message"
        );

        channel
            .basic_publish(&cfg.exchange_name, routing_key, data.as_ref(), &options)
            .await
            .inspect_err(|err| debug!(error = err.to_string(), "publish failed"))
    }

    /// Publishes `data`, retrying until it succeeds or `shutdown` fires.
    pub async fn retrying_publish(
        &self,
        data: impl AsRef<[u8]>,
        routing_key: &str,
        shutdown: &CancellationToken,
    ) -> Option<PublishConfirmation> {
        RetryingPublisher::new(self.clone())
            .publish(data, routing_key, shutdown)
            .await
    }
}

/// Retries a publish across connection loss and broker errors.
#[derive(Clone)]
pub struct RetryingPublisher {
    publisher: Publisher,
    retry_interval: Duration,
}

impl RetryingPublisher {
    /// Retries with the interval from the publisher options.
    pub fn new(publisher: Publisher) -> RetryingPublisher {
        let retry_interval = publisher.configuration.publisher_options.retry_interval;
        RetryingPublisher {
            publisher,
            retry_interval,
        }
    }

    /// Returns the broker confirmation once a publish succeeds, or `None` when
    /// `shutdown` fires first.
    pub async fn publish(
        &self,
        data: impl AsRef<[u8]>,
        routing_key: &str,
        shutdown: &CancellationToken,
    ) -> Option<PublishConfirmation> {
        let data = data.as_ref();
        let publisher = &self.publisher;
        let operation = format!("publishing to exchange `{}`", publisher.configuration.exchange_name);

        with_retrying_connection_body(
            publisher.connection.as_ref(),
            &operation,
            self.retry_interval,
            shutdown,
            || async move { publisher.publish(data, routing_key).await.map(Some) },
        )
        .await
    }
}

fn prepare_properties(properties: BasicProperties) -> BasicProperties {
    let properties = if properties.message_id().is_none() {
        properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()))
    } else {
        properties
    };
    otel::inject_context(&Context::current(), properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectionConfiguration,
        connection::BasicConnection,
        consumer::ConsumerOptions,
        queue::{BindingOptions, QueueOptions},
        transport::memory::InMemoryTransport,
    };
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::{layer::SubscriberExt, Layer};

    /// Counts error-level events.
    #[derive(Clone, Default)]
    struct ErrorEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn connected(transport: &InMemoryTransport) -> Arc<BasicConnection> {
        let connection = Arc::new(
            BasicConnection::new(
                Arc::new(transport.clone()),
                "amqp://localhost/%2F",
                ConnectionConfiguration::default(),
            )
            .with_polling_interval(Duration::from_millis(100)),
        );
        connection.connect().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn publish_declares_exchange_and_routes() {
        let transport = InMemoryTransport::new();
        let connection = connected(&transport).await;
        let channel = connection.get_channel().await.unwrap();
        channel.queue_declare("audit", &QueueOptions::new()).await.unwrap();

        let publisher = Publisher::new(
            connection.clone(),
            PublisherConfiguration::new("events").exchange_options(ExchangeOptions::new().fanout()),
        );
        // Nothing is bound yet.
        publisher.publish("lost", "").await.unwrap();
        assert_eq!(transport.queue_depth("audit"), Some(0));

        channel
            .queue_bind("audit", "events", "", &BindingOptions::new())
            .await
            .unwrap();
        let confirmation = publisher.publish("kept", "").await.unwrap();

        assert_eq!(confirmation, PublishConfirmation::NotRequested);
        assert_eq!(transport.exchange_kind("events"), Some(crate::exchange::ExchangeKind::Fanout));
        assert_eq!(transport.queue_depth("audit"), Some(1));
    }

    #[tokio::test]
    async fn json_messages_carry_content_type_and_message_id() {
        let transport = InMemoryTransport::new();
        let connection = connected(&transport).await;
        let channel = connection.get_channel().await.unwrap();
        channel.queue_declare("audit", &QueueOptions::new()).await.unwrap();
        let mut subscription = channel
            .basic_consume("audit", &ConsumerOptions::default())
            .await
            .unwrap();

        Publisher::new(
            connection,
            PublisherConfiguration::new("").publisher_options(PublisherOptions::new().json()),
        )
        .publish(r#"{"id":1}"#, "audit")
        .await
        .unwrap();

        let delivery = subscription.deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.data, br#"{"id":1}"#.to_vec());
        assert_eq!(
            delivery.properties.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(delivery.properties.message_id().is_some());
    }

    #[tokio::test]
    async fn publish_fails_fast_without_connection() {
        let transport = InMemoryTransport::new();
        let connection = Arc::new(BasicConnection::new(
            Arc::new(transport),
            "amqp://localhost/%2F",
            ConnectionConfiguration::default(),
        ));
        let publisher = Publisher::new(connection, PublisherConfiguration::new(""));

        let result = publisher.publish("hello", "jobs").await;

        assert_eq!(result, Err(AmqpError::NotConnected));
    }

    #[tokio::test]
    async fn mandatory_unroutable_message_is_returned() {
        let transport = InMemoryTransport::new();
        let connection = connected(&transport).await;
        let publisher = Publisher::new(
            connection,
            PublisherConfiguration::new("")
                .publisher_options(PublisherOptions::new().mandatory()),
        );

        let confirmation = publisher.publish("nobody home", "missing").await.unwrap();

        assert_eq!(confirmation, PublishConfirmation::Returned);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_publish_waits_out_a_denied_exchange() {
        let transport = InMemoryTransport::new();
        transport.deny("orders");
        let connection = connected(&transport).await;
        let publisher = Publisher::new(
            connection,
            PublisherConfiguration::new("orders").publisher_options(
                PublisherOptions::new().retry_interval(Duration::from_secs(5)),
            ),
        );
        {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                transport.allow("orders");
            });
        }

        let confirmation = publisher
            .retrying_publish("created", "orders.created", &CancellationToken::new())
            .await;

        assert_eq!(confirmation, Some(PublishConfirmation::NotRequested));
        assert_eq!(transport.exchange_kind("orders"), Some(Default::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_while_settling_are_not_logged_as_errors() {
        let errors = ErrorEvents::default();
        let _subscriber =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(errors.clone()));

        let transport = InMemoryTransport::new();
        transport.deny("orders");
        let connection = connected(&transport).await;
        let publisher = Publisher::new(
            connection,
            PublisherConfiguration::new("orders").publisher_options(
                PublisherOptions::new().retry_interval(Duration::from_secs(5)),
            ),
        );
        {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                transport.allow("orders");
            });
        }

        let confirmation = publisher
            .retrying_publish("created", "orders.created", &CancellationToken::new())
            .await;

        assert_eq!(confirmation, Some(PublishConfirmation::NotRequested));
        assert_eq!(errors.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_publish_gives_up_on_shutdown() {
        let transport = InMemoryTransport::new();
        let connection = Arc::new(BasicConnection::new(
            Arc::new(transport),
            "amqp://localhost/%2F",
            ConnectionConfiguration::default(),
        ));
        let publisher = RetryingPublisher::new(Publisher::new(connection, PublisherConfiguration::new("")));
        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(90)).await;
                shutdown.cancel();
            });
        }

        let confirmation = publisher.publish("never", "jobs", &shutdown).await;

        assert_eq!(confirmation, None);
    }

    #[test]
    fn stamps_message_id_once() {
        let stamped = prepare_properties(BasicProperties::default());
        let id = stamped.message_id().clone().unwrap();
        assert_eq!(Uuid::parse_str(id.as_str()).unwrap().get_version_num(), 4);

        let kept = prepare_properties(
            BasicProperties::default().with_message_id(ShortString::from("fixed")),
        );
        assert_eq!(kept.message_id().as_ref().map(|m| m.as_str()), Some("fixed"));
    }
}
