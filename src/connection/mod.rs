// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! [`Connection`] is the capability consumers and publishers depend on. It is
//! always injected (usually as `Arc<dyn Connection>`) so that a consumer can
//! share a connection that is not connected yet, and so tests can substitute
//! their own.
//!
//! - [`BasicConnection`] owns one physical connection and at most one channel.
//! - [`RetryingConnection`] wraps a `BasicConnection` with a reconnection loop.

pub mod basic;
pub mod retrying;

pub use basic::{with_basic_connection, BasicConnection};
pub use retrying::{RetryState, RetryingConnection};

use crate::{
    config::clamp_polling_interval, errors::AmqpError, retry::cancellable_sleep,
    transport::TransportChannel,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A broker connection that consumers and publishers can share.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Returns the shared channel, opening one if needed.
    ///
    /// Fails with [`AmqpError::NotConnected`] when there is no live connection.
    async fn get_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Whether a live broker connection exists right now.
    fn is_connected(&self) -> bool;

    /// The URL the next connect targets.
    fn configured_url(&self) -> String;

    /// How often waiters re-check [`is_connected`](Self::is_connected).
    fn connection_polling_interval(&self) -> Duration;

    /// Polls until connected, until `timeout` elapses or until `cancel` fires.
    ///
    /// The wait is advisory: it never fails and callers must re-check the
    /// connection state afterwards. A `timeout` too large to represent as a
    /// deadline waits without one.
    async fn wait_for_connection(&self, timeout: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if cancel.is_cancelled() || self.is_connected() {
                return;
            }
            let mut nap = clamp_polling_interval(self.connection_polling_interval());
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                nap = nap.min(deadline - now);
            }
            if !cancellable_sleep(nap, cancel).await {
                return;
            }
        }
    }
}
