// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{perform_consume, ConsumerChannel, ConsumerConfiguration};
use crate::{
    connection::Connection,
    errors::AmqpError,
    retry::with_retrying_connection_body,
    transport::{Delivery, TransportChannel},
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Consumer that keeps re-subscribing until it is cancelled.
///
/// Each call to [`consume`](Self::consume) spawns a background task running
/// the subscription under the retry combinator and returns the
/// [`ConsumerChannel`] it feeds.
#[derive(Clone)]
pub struct RetryingConsumer {
    connection: Arc<dyn Connection>,
    configuration: ConsumerConfiguration,
    retry_interval: Duration,
}

impl RetryingConsumer {
    /// Retries with the interval from the configuration's consumer options.
    pub fn new(connection: Arc<dyn Connection>, configuration: ConsumerConfiguration) -> RetryingConsumer {
        let retry_interval = configuration.consumer_options.retry_interval;
        RetryingConsumer {
            connection,
            configuration,
            retry_interval,
        }
    }

    /// Starts consuming, converting each delivery with `map`.
    ///
    /// Returns once the first subscribe attempt has finished, successfully or
    /// not. The channel is cancelled by `shutdown`, by
    /// [`ConsumerChannel::cancel`] or by dropping it.
    pub async fn consume<T, M>(&self, shutdown: &CancellationToken, map: M) -> ConsumerChannel<T>
    where
        T: Send + 'static,
        M: Fn(Delivery) -> T + Send + Sync + 'static,
    {
        let cancel = shutdown.child_token();
        let capacity = self.configuration.consumer_options.channel_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (started, first_attempt) = oneshot::channel();

        let task = Arc::new(ConsumeTask {
            connection: self.connection.clone(),
            configuration: self.configuration.clone(),
            sender,
            map,
            cancel: cancel.clone(),
            started: Mutex::new(Some(started)),
        });
        tokio::spawn(task.run(self.retry_interval));

        // Errors only when the task stopped before its first attempt.
        let _ = first_attempt.await;
        ConsumerChannel::new(receiver, cancel)
    }
}

struct ConsumeTask<T, M> {
    connection: Arc<dyn Connection>,
    configuration: ConsumerConfiguration,
    sender: mpsc::Sender<T>,
    map: M,
    cancel: CancellationToken,
    started: Mutex<Option<oneshot::Sender<()>>>,
}

enum Next {
    Cancelled,
    Item(Option<Result<Delivery, AmqpError>>),
}

impl<T, M> ConsumeTask<T, M>
where
    T: Send + 'static,
    M: Fn(Delivery) -> T + Send + Sync + 'static,
{
    async fn run(self: Arc<Self>, retry_interval: Duration) {
        let queue = self.configuration.queue_name.clone();
        let operation = format!("consuming from queue `{}`", queue);

        with_retrying_connection_body(
            self.connection.as_ref(),
            &operation,
            retry_interval,
            &self.cancel,
            || {
                let task = self.clone();
                async move { task.consume_once().await }
            },
        )
        .await;

        debug!(queue = queue.as_str(), "retrying consumer stopped");
    }

    /// Subscribes once and forwards deliveries until the subscription ends,
    /// fails, or the consumer is cancelled.
    async fn consume_once(&self) -> Result<Option<()>, AmqpError> {
        let subscribed = perform_consume(self.connection.as_ref(), &self.configuration).await;
        self.signal_started();
        let (channel, mut subscription) = subscribed?;
        let queue = self.configuration.queue_name.as_str();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Next::Cancelled,
                item = subscription.deliveries.next() => Next::Item(item),
            };

            let delivery = match next {
                Next::Cancelled => {
                    self.unsubscribe(channel.as_ref(), &subscription.consumer_tag).await;
                    return Ok(None);
                }
                Next::Item(None) => {
                    debug!(queue, "subscription ended");
                    return Ok(None);
                }
                Next::Item(Some(Err(err))) => return Err(err),
                Next::Item(Some(Ok(delivery))) => delivery,
            };

            trace!(
                queue,
                delivery_tag = delivery.delivery_tag,
                "consumed message"
            );
            let item = (self.map)(delivery);

            let forwarded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = self.sender.send(item) => sent.is_ok(),
            };
            if !forwarded {
                // Either cancelled or the reader went away.
                self.cancel.cancel();
                self.unsubscribe(channel.as_ref(), &subscription.consumer_tag).await;
                return Ok(None);
            }
        }
    }

    async fn unsubscribe(&self, channel: &dyn TransportChannel, consumer_tag: &str) {
        if let Err(err) = channel.basic_cancel(consumer_tag).await {
            debug!(
                consumer_tag,
                error = err.to_string(),
                "ignoring error cancelling subscription"
            );
        }
    }

    fn signal_started(&self) {
        if let Some(started) = self.started.lock().take() {
            let _ = started.send(());
        }
    }
}
