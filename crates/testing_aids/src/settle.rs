// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task;

/// How many times [`settle`] hands control back to the runtime.
///
/// Background work in the tests is a short chain of spawned tasks (a timer fires, a callback
/// spawns a refresh, the refresh calls a transport), so a few dozen turns are plenty.
pub const SETTLE_ROUNDS: usize = 64;

/// When polled, yields the current task once so that other tasks can make progress.
#[derive(Debug, Default)]
pub struct YieldFuture {
    yielded: bool,
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        if self.yielded {
            return task::Poll::Ready(());
        }

        self.yielded = true;
        cx.waker().wake_by_ref();
        task::Poll::Pending
    }
}

/// Lets every runnable task on the current runtime catch up.
///
/// Use this after advancing a frozen clock: timers woken by the advance only run once the
/// test task gives up the thread.
pub async fn settle() {
    for _ in 0..SETTLE_ROUNDS {
        YieldFuture::default().await;
    }
}
