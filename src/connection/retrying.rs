// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retrying Connection
//!
//! Keeps a [`BasicConnection`] connected without caller intervention. The
//! reconnection loop in [`RetryingConnection::run`] polls the connection state
//! and, after a failed attempt, waits a fixed `reconnection_interval` before
//! trying again.

use super::{BasicConnection, Connection};
use crate::{
    config::{redact_url, ConnectionConfiguration, RabbitMQConfigs, DEFAULT_RECONNECTION_INTERVAL},
    errors::AmqpError,
    transport::{Transport, TransportChannel},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reconnection bookkeeping, as observed by [`RetryingConnection::retry_state`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// When the last failed attempt happened; cleared by a successful connect.
    pub last_connection_attempt: Option<Instant>,
    /// Failed attempts since the last successful connect.
    pub connection_attempts: u64,
}

/// A [`BasicConnection`] kept alive by a background reconnection loop.
///
/// Nothing connects until [`run`](Self::run) is spawned.
pub struct RetryingConnection {
    basic: BasicConnection,
    reconnection_interval: Mutex<Duration>,
    retry_state: Mutex<RetryState>,
}

impl RetryingConnection {
    /// Wraps `basic` with the default reconnection interval.
    pub fn new(basic: BasicConnection) -> RetryingConnection {
        RetryingConnection {
            basic,
            reconnection_interval: Mutex::new(DEFAULT_RECONNECTION_INTERVAL),
            retry_state: Mutex::new(RetryState::default()),
        }
    }

    /// A retrying connection to a real broker through `lapin`.
    pub fn lapin(url: &str, configuration: ConnectionConfiguration) -> RetryingConnection {
        RetryingConnection::new(BasicConnection::lapin(url, configuration))
    }

    /// A retrying connection built from a settings block.
    pub fn from_configs(transport: Arc<dyn Transport>, cfgs: &RabbitMQConfigs) -> RetryingConnection {
        RetryingConnection::new(BasicConnection::from_configs(transport, cfgs))
            .with_reconnection_interval(cfgs.reconnection_interval())
    }

    /// Sets how long to wait after a failed attempt before the next one.
    pub fn with_reconnection_interval(self, interval: Duration) -> Self {
        *self.reconnection_interval.lock() = interval;
        self
    }

    /// The current wait between failed attempts.
    pub fn reconnection_interval(&self) -> Duration {
        *self.reconnection_interval.lock()
    }

    /// A snapshot of the reconnection bookkeeping.
    pub fn retry_state(&self) -> RetryState {
        *self.retry_state.lock()
    }

    /// Failed attempts since the last successful connect.
    pub fn connection_attempts(&self) -> u64 {
        self.retry_state.lock().connection_attempts
    }

    /// The wrapped connection.
    pub fn basic(&self) -> &BasicConnection {
        &self.basic
    }

    /// Runs the reconnection loop until `shutdown` fires, then closes the
    /// connection.
    ///
    /// Spawn it next to the consumers and publishers sharing this connection.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.basic.connection_polling_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            url = redact_url(&self.basic.configured_url()),
            "starting reconnection loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.basic.is_connected() {
                continue;
            }

            let backing_off = self.retry_state.lock().last_connection_attempt.is_some_and(|last| {
                last.elapsed() < *self.reconnection_interval.lock()
            });
            if backing_off {
                continue;
            }

            match self.basic.connect().await {
                Ok(()) => {
                    *self.retry_state.lock() = RetryState::default();
                }
                Err(err) => {
                    let attempts = {
                        let mut state = self.retry_state.lock();
                        state.last_connection_attempt = Some(Instant::now());
                        state.connection_attempts += 1;
                        state.connection_attempts
                    };
                    error!(
                        url = redact_url(&self.basic.configured_url()),
                        attempts,
                        error = err.to_string(),
                        "unable to connect to broker"
                    );
                }
            }
        }

        debug!("reconnection loop stopped");
        self.basic.close().await;
    }

    /// Points the connection at a new target and optionally swaps the
    /// reconnection interval. The new interval applies from the next backoff
    /// check; the running loop reconnects on its own.
    pub async fn reconfigure(
        &self,
        url: &str,
        configuration: ConnectionConfiguration,
        reconnection_interval: Option<Duration>,
    ) -> Result<(), AmqpError> {
        self.basic.reconfigure(url, configuration).await?;

        if let Some(interval) = reconnection_interval {
            let mut current = self.reconnection_interval.lock();
            if *current != interval {
                debug!(from = ?*current, to = ?interval, "changing reconnection interval");
                *current = interval;
            }
        }
        Ok(())
    }

    /// Closes the connection. A running loop reconnects on its next tick, so
    /// stop it through its shutdown token first.
    pub async fn close(&self) {
        self.basic.close().await;
    }
}

#[async_trait]
impl Connection for RetryingConnection {
    async fn get_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        self.basic.get_channel().await
    }

    fn is_connected(&self) -> bool {
        self.basic.is_connected()
    }

    fn configured_url(&self) -> String {
        self.basic.configured_url()
    }

    fn connection_polling_interval(&self) -> Duration {
        self.basic.connection_polling_interval()
    }

    async fn wait_for_connection(&self, timeout: Duration, cancel: &CancellationToken) {
        self.basic.wait_for_connection(timeout, cancel).await
    }
}
