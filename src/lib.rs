// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Resilience
//!
//! Connection management and retry orchestration on top of an AMQP client.
//!
//! - [`connection::BasicConnection`] owns one broker connection and reuses a
//!   single channel across callers.
//! - [`connection::RetryingConnection`] reconnects in the background.
//! - [`retry::with_retrying_connection_body`] retries any unit of AMQP work,
//!   waiting for the connection on connection loss.
//! - [`consumer::Consumer`] and [`publisher::Publisher`] declare their
//!   topology and consume or publish, once or until shutdown.
//!
//! Shutdown is signalled with a `tokio_util` [`CancellationToken`](tokio_util::sync::CancellationToken)
//! shared by the reconnection loop and every retrying operation.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;

pub use connection::{BasicConnection, Connection, RetryingConnection};
pub use consumer::{Consumer, ConsumerChannel, ConsumerConfiguration, ConsumerOptions};
pub use errors::AmqpError;
pub use publisher::{Publisher, PublisherConfiguration, PublisherOptions, RetryingPublisher};
