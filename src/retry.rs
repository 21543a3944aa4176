// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Combinator
//!
//! [`with_retrying_connection_body`] turns one fallible unit of AMQP work into
//! an operation that keeps retrying until it yields a value or is cancelled.
//!
//! Failures are split in two:
//! - connection errors ([`AmqpError::is_connection_error`]) wait for the
//!   connection to come back and retry straight away;
//! - any other error sleeps `retry_interval` before the next attempt.
//!
//! Operation errors raised during the first `retry_interval` of a call are
//! treated as start-up noise: they are logged at debug level and retried after
//! the connection's polling interval. The window is measured per call.

use crate::{config::clamp_polling_interval, connection::Connection, errors::AmqpError};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `true` when the full duration elapsed.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs `body` against `connection` until it returns `Ok(Some(_))`.
///
/// `Ok(None)` means "no result, run again" and is retried like an operation
/// error without being logged. Returns `None` once `cancel` fires; the token
/// is only observed between attempts and during waits.
pub async fn with_retrying_connection_body<C, T, F, Fut>(
    connection: &C,
    operation_name: &str,
    retry_interval: Duration,
    cancel: &CancellationToken,
    mut body: F,
) -> Option<T>
where
    C: Connection + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, AmqpError>>,
{
    let mut first_attempt = true;
    let first_attempt_start = Instant::now();

    connection.wait_for_connection(retry_interval, cancel).await;

    while !cancel.is_cancelled() {
        trace!(operation = operation_name, "starting operation");
        match body().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(err) if err.is_connection_error() => {
                if !first_attempt {
                    error!(
                        operation = operation_name,
                        error = err.to_string(),
                        "connection lost"
                    );
                }
                connection.wait_for_connection(retry_interval, cancel).await;
                first_attempt = false;
                continue;
            }
            Err(err) => {
                if first_attempt && first_attempt_start.elapsed() < retry_interval {
                    debug!(
                        operation = operation_name,
                        error = err.to_string(),
                        "operation failed while settling"
                    );
                    cancellable_sleep(
                        clamp_polling_interval(connection.connection_polling_interval()),
                        cancel,
                    )
                    .await;
                    continue;
                }
                error!(
                    operation = operation_name,
                    error = err.to_string(),
                    "operation failed"
                );
                first_attempt = false;
            }
        }

        if !cancel.is_cancelled() {
            trace!(
                operation = operation_name,
                retry_in = ?retry_interval,
                "will retry operation"
            );
            cancellable_sleep(retry_interval, cancel).await;
        }
    }

    debug!(operation = operation_name, "operation cancelled");
    None
}
