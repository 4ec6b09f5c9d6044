// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Why a request was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AbortReason {
    /// Cancelled by a caller, optionally with a description.
    Explicit(Option<Cow<'static, str>>),
    /// Replaced by a newer request for the same key.
    Superseded,
    /// The overall deadline elapsed.
    Timeout(Duration),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(Some(message)) => write!(f, "{message}"),
            Self::Explicit(None) => f.write_str("cancelled by caller"),
            Self::Superseded => f.write_str("superseded by a newer request"),
            Self::Timeout(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

/// A cooperative cancellation signal shared between a request and whoever may abort it.
///
/// Clones observe the same state. The first call to [`cancel`](Self::cancel) wins; later
/// calls neither change the recorded reason nor wake anybody again.
#[derive(Clone, Default)]
pub struct CancellationToken {
    signal: tokio_util::sync::CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl CancellationToken {
    /// Creates a live token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token, returning `false` if it was already cancelled.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        {
            let mut current = self.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }

        // The reason is recorded before waking anyone, so `cancelled` always finds it.
        self.signal.cancel();
        true
    }

    /// Returns `true` once the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// The reason recorded by the winning [`cancel`](Self::cancel) call.
    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().clone()
    }

    /// Completes once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> AbortReason {
        self.signal.cancelled().await;
        self.reason().unwrap_or(AbortReason::Explicit(None))
    }

    /// Returns `true` if both handles refer to the same token.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reason, &other.reason)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken").field("reason", &self.reason()).finish()
    }
}
