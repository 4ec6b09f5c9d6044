// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for driving a [`Client`](crate::Client) without a network.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{Either, select};
use parking_lot::Mutex;
use tick::Clock;

use crate::{CancellationToken, RawResponse, RequestDescriptor, Transport, TransportError};

type Reply = Result<RawResponse, TransportError>;
type Responder = Box<dyn Fn(&RequestDescriptor) -> Reply + Send + Sync>;

/// A scriptable [`Transport`].
///
/// Replies queued with [`enqueue`](Self::enqueue) are used first, in order. Once the queue is
/// empty, the [`respond_with`](Self::respond_with) function answers, and without one every call
/// succeeds with an empty `200 OK`. Each call takes [`latency`](Self::latency) on the given
/// clock and gives up early with a transport error if its token is cancelled.
///
/// Clones share the script and the call history.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    clock: Clock,
    latency: Mutex<Duration>,
    queue: Mutex<VecDeque<Reply>>,
    responder: Mutex<Option<Responder>>,
    requests: Mutex<Vec<RequestDescriptor>>,
    cancelled: Mutex<usize>,
}

impl MockTransport {
    /// Creates a transport that answers every call with an empty `200 OK`, timed by `clock`.
    #[must_use]
    pub fn new(clock: &Clock) -> Self {
        Self {
            inner: Arc::new(MockInner {
                clock: clock.clone(),
                latency: Mutex::new(Duration::ZERO),
                queue: Mutex::new(VecDeque::new()),
                responder: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                cancelled: Mutex::new(0),
            }),
        }
    }

    /// Makes every call take `latency` before replying.
    pub fn latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Queues a one-shot reply.
    pub fn enqueue(&self, reply: Result<RawResponse, TransportError>) {
        self.inner.queue.lock().push_back(reply);
    }

    /// Answers calls once the queue is exhausted.
    pub fn respond_with(&self, responder: impl Fn(&RequestDescriptor) -> Result<RawResponse, TransportError> + Send + Sync + 'static) {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.inner.requests.lock().clone()
    }

    /// How many calls were made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// How many calls gave up because their token was cancelled.
    #[must_use]
    pub fn cancelled_calls(&self) -> usize {
        *self.inner.cancelled.lock()
    }

    fn reply(&self, request: &RequestDescriptor) -> Reply {
        if let Some(reply) = self.inner.queue.lock().pop_front() {
            return reply;
        }

        match &*self.inner.responder.lock() {
            Some(responder) => responder(request),
            None => Ok(RawResponse::ok(bytes::Bytes::new())),
        }
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: RequestDescriptor, token: CancellationToken) -> Result<RawResponse, TransportError> {
        self.inner.requests.lock().push(request.clone());
        let reply = self.reply(&request);
        let latency = *self.inner.latency.lock();

        if latency.is_zero() {
            return reply;
        }

        match select(pin!(self.inner.clock.delay(latency)), pin!(token.cancelled())).await {
            Either::Left(((), _)) => reply,
            Either::Right((reason, _)) => {
                *self.inner.cancelled.lock() += 1;
                Err(TransportError::new(format!("call cancelled: {reason}")))
            }
        }
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("latency", &*self.inner.latency.lock())
            .field("queued", &self.inner.queue.lock().len())
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}
