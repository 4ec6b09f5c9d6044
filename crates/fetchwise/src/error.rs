// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

use crate::cancel::AbortReason;

/// A specialized [`Result`](std::result::Result) for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;

type BoxedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The terminal failure of a fetch.
///
/// Errors are cheap to clone so that one settled result can be handed to every caller
/// that joined the same in-flight request.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The transport could not complete the call.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The request did not settle before its deadline.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The request was cancelled explicitly or superseded by a newer identical request.
    #[error("request aborted: {reason}")]
    Aborted {
        /// Why the request was cancelled.
        reason: AbortReason,
    },

    /// The server answered with a non-success status.
    #[error("server responded with status {status}")]
    Status {
        /// The response status.
        status: StatusCode,
        /// The raw response body.
        body: Bytes,
    },

    /// A retry predicate kept rejecting an otherwise successful response until no attempts remained.
    #[error("response rejected by validation: {message}")]
    Validation {
        /// Describes the rejected response.
        message: Cow<'static, str>,
    },

    /// The response body could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl FetchError {
    /// Maps the reason a token was cancelled to the error surfaced to callers.
    #[must_use]
    pub fn from_abort(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Timeout(after) => Self::Timeout { after },
            reason => Self::Aborted { reason },
        }
    }

    /// Returns the HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for explicit and superseding cancellations.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns `true` when a deadline elapsed.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A network-level failure reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport failed: {message}")]
pub struct TransportError {
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxedSource>,
}

impl TransportError {
    /// Creates a transport error from a message.
    #[must_use]
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transport error that wraps the underlying cause.
    #[must_use]
    pub fn with_source(message: impl Into<Cow<'static, str>>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The response body could not be turned into the requested type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to decode response: {message}")]
pub struct DecodeError {
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxedSource>,
}

impl DecodeError {
    /// Creates a decode error from a message.
    #[must_use]
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a decode error that wraps the underlying cause.
    #[must_use]
    pub fn with_source(message: impl Into<Cow<'static, str>>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}
