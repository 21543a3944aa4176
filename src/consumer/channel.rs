// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::{Stream, StreamExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Handle over a background retrying consume loop.
///
/// Items are pushed by the loop and read with [`recv`](Self::recv) or through
/// the [`Stream`] implementation. Cancelling the handle, explicitly or by
/// dropping it, stops the loop; iteration then ends without yielding items
/// that were still buffered.
pub struct ConsumerChannel<T> {
    receiver: mpsc::Receiver<T>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> ConsumerChannel<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        ConsumerChannel {
            receiver,
            cancel,
            cancelled,
        }
    }

    /// Waits for the next item. Returns `None` once the channel is cancelled
    /// or the consume loop has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        self.next().await
    }

    /// Stops the consume loop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the channel, or the shutdown it derives from, was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Stream for ConsumerChannel<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.receiver.close();
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl<T> Drop for ConsumerChannel<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
