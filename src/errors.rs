// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilience Layer
//!
//! This module provides the error taxonomy shared by connections, consumers,
//! publishers and the retry combinator. The important split is between
//! connection-level failures, which are recovered by waiting for the broker
//! connection to come back, and operation-level failures, which are retried on
//! a fixed interval.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The enum is `Clone` so that test transports can replay the same failure
/// more than once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectFailed(String),

    /// There is no live connection to the broker
    #[error("not connected to the broker")]
    NotConnected,

    /// The broker connection dropped while an operation was in flight
    #[error("connection closed (code: {code:?}, reason: {text:?})")]
    ConnectionClosed {
        code: Option<u16>,
        text: Option<String>,
    },

    /// Error creating or using a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{exchange}` to queue `{queue}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        reason: String,
    },

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error consuming a message
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// Error acknowledging, rejecting or negative-acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),
}

impl AmqpError {
    /// Builds a `ConnectionClosed` error from an optional reply code and text.
    pub fn connection_closed(code: Option<u16>, text: impl Into<Option<String>>) -> Self {
        AmqpError::ConnectionClosed {
            code,
            text: text.into(),
        }
    }

    /// Returns true when the failure is resolved by waiting for the broker
    /// connection rather than by retrying the operation after a delay.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionClosed { .. } | AmqpError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        assert!(AmqpError::NotConnected.is_connection_error());
        assert!(AmqpError::connection_closed(Some(320), "CONNECTION_FORCED".to_owned())
            .is_connection_error());

        assert!(!AmqpError::ConnectFailed("refused".to_owned()).is_connection_error());
        assert!(!AmqpError::DeclareQueueError("q".to_owned(), "403".to_owned())
            .is_connection_error());
        assert!(!AmqpError::ChannelError("closed".to_owned()).is_connection_error());
    }

    #[test]
    fn formats_connection_closed() {
        let err = AmqpError::connection_closed(Some(320), "CONNECTION_FORCED".to_owned());
        assert_eq!(
            err.to_string(),
            "connection closed (code: Some(320), reason: Some(\"CONNECTION_FORCED\"))"
        );
    }
}
