// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchanges, queues and bindings a consumer or a
//! publisher needs before it can do its work. Declarations are collected
//! against one channel and installed in order: exchanges, then queues, then
//! queue-to-exchange bindings.
//!
//! Empty names mean "not part of this topology":
//! - an exchange with an empty name is not declared (the default exchange
//!   always exists);
//! - a queue with an empty name is not declared;
//! - a binding is skipped when either its queue or its exchange name is empty.

use crate::{
    errors::AmqpError,
    exchange::ExchangeOptions,
    queue::{BindingOptions, QueueOptions},
    transport::TransportChannel,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Interface for collecting and installing a topology.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange declaration.
    fn exchange(self, name: &'tp str, options: &'tp ExchangeOptions) -> Self;

    /// Adds a queue declaration.
    fn queue(self, name: &'tp str, options: &'tp QueueOptions) -> Self;

    /// Adds a binding of `queue` to `exchange` with `routing_key`.
    fn queue_binding(
        self,
        queue: &'tp str,
        exchange: &'tp str,
        routing_key: &'tp str,
        options: &'tp BindingOptions,
    ) -> Self;

    /// Declares everything collected so far, stopping at the first failure.
    async fn install(&self) -> Result<(), AmqpError>;
}

struct QueueBinding<'tp> {
    queue: &'tp str,
    exchange: &'tp str,
    routing_key: &'tp str,
    options: &'tp BindingOptions,
}

/// Topology installed through a transport channel.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn TransportChannel>,
    exchanges: Vec<(&'tp str, &'tp ExchangeOptions)>,
    queues: Vec<(&'tp str, &'tp QueueOptions)>,
    bindings: Vec<QueueBinding<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    /// An empty topology declared through `channel`.
    pub fn new(channel: Arc<dyn TransportChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            bindings: vec![],
        }
    }

    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for (name, options) in &self.exchanges {
            if name.is_empty() {
                debug!("skipping declaration of the default exchange");
                continue;
            }
            debug!(exchange = name, kind = options.kind.as_str(), "declaring exchange");

            self.channel
                .exchange_declare(name, options)
                .await
                .inspect_err(|err| {
                    debug!(error = err.to_string(), exchange = name, "error to declare the exchange")
                })?;
        }
        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for (name, options) in &self.queues {
            if name.is_empty() {
                debug!("skipping declaration of unnamed queue");
                continue;
            }
            debug!(queue = name, "declaring queue");

            self.channel
                .queue_declare(name, options)
                .await
                .inspect_err(|err| {
                    debug!(error = err.to_string(), queue = name, "error to declare the queue")
                })?;
        }
        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.bindings {
            if binding.queue.is_empty() || binding.exchange.is_empty() {
                continue;
            }
            debug!(
                queue = binding.queue,
                exchange = binding.exchange,
                routing_key = binding.routing_key,
                "binding queue to exchange"
            );

            self.channel
                .queue_bind(
                    binding.queue,
                    binding.exchange,
                    binding.routing_key,
                    binding.options,
                )
                .await
                .inspect_err(|err| {
                    debug!(error = err.to_string(), "error to bind queue to exchange")
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, name: &'tp str, options: &'tp ExchangeOptions) -> Self {
        self.exchanges.push((name, options));
        self
    }

    fn queue(mut self, name: &'tp str, options: &'tp QueueOptions) -> Self {
        self.queues.push((name, options));
        self
    }

    fn queue_binding(
        mut self,
        queue: &'tp str,
        exchange: &'tp str,
        routing_key: &'tp str,
        options: &'tp BindingOptions,
    ) -> Self {
        self.bindings.push(QueueBinding {
            queue,
            exchange,
            routing_key,
            options,
        });
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}
