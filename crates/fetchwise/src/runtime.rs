// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Background task plumbing shared by the timer facility and the revalidation registry.

use tick::Clock;
use tokio::task::{AbortHandle, JoinHandle};

/// The clock every component reads time from, plus the ability to run detached work.
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    clock: Clock,
}

impl Runtime {
    pub(crate) fn new(clock: Clock) -> Self {
        Self { clock }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Runs `work` in the background on the ambient Tokio runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<T>(&self, work: T) -> TaskHandle
    where
        T: Future<Output = ()> + Send + 'static,
    {
        TaskHandle(tokio::spawn(work).abort_handle())
    }

    /// Runs `work` to completion in the background and hands back its output.
    ///
    /// The work keeps running if the returned handle is dropped.
    pub(crate) fn run<T>(&self, work: impl Future<Output = T> + Send + 'static) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        tokio::spawn(work)
    }
}

/// Stops a task started by [`Runtime::spawn`]. Dropping the handle leaves the task running.
#[derive(Debug)]
pub(crate) struct TaskHandle(AbortHandle);

impl TaskHandle {
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}
