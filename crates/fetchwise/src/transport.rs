// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{CancellationToken, RawResponse, RequestDescriptor, TransportError};

/// Performs the actual call for a request.
///
/// Implementations should stop work once `token` is cancelled; the client stops waiting for
/// the call regardless. Non-success statuses are ordinary responses, not transport errors.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` and resolves with the response.
    fn send(&self, request: RequestDescriptor, token: CancellationToken) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}
