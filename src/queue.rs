// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Options for RabbitMQ
//!
//! This module provides the declaration options for queues and for the
//! bindings that link a queue to an exchange.

use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Options used when declaring a queue.
///
/// This struct implements the builder pattern. Defaults declare a transient,
/// shared queue that survives its last consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub(crate) passive: bool,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) args: FieldTable,
}

impl QueueOptions {
    /// Creates queue options with default settings.
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when the last consumer is gone.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue passive, the broker fails the declaration if the queue
    /// does not exist.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MESSAGE_TTL,
            AMQPValue::LongInt(LongInt::from(ttl)),
        )
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MAX_LENGTH,
            AMQPValue::LongInt(LongInt::from(max)),
        )
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Replaces the custom declaration arguments.
    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }

    /// Adds a single custom declaration argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn declare_options(&self) -> lapin::options::QueueDeclareOptions {
        lapin::options::QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

/// Options used when binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingOptions {
    pub(crate) args: FieldTable,
}

impl BindingOptions {
    /// A binding without arguments.
    pub fn new() -> BindingOptions {
        BindingOptions::default()
    }

    /// Replaces the custom binding arguments.
    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }

    /// Adds a single custom binding argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }
}
