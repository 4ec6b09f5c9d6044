// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;

use http::StatusCode;

use crate::{FetchError, RawResponse};

/// Where the data of a [`FetchResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    /// A transport call made for this fetch or one it joined.
    Network,
    /// A fresh cache entry.
    Cache,
    /// A cache entry past its stale time.
    StaleCache,
}

/// The settled outcome of a fetch as seen by callers and subscribers.
///
/// Successful responses carry decoded data. Under a soft error strategy failures are reported
/// through [`error`](Self::error), with the configured fallback as data.
#[derive(Debug, Clone)]
pub struct FetchResponse<T> {
    data: Option<T>,
    status: Option<StatusCode>,
    headers: BTreeMap<String, String>,
    error: Option<FetchError>,
    source: ResponseSource,
}

impl<T> FetchResponse<T> {
    pub(crate) fn from_network(raw: &RawResponse, data: T) -> Self {
        Self {
            data: Some(data),
            status: Some(raw.status()),
            headers: raw.headers().clone(),
            error: None,
            source: ResponseSource::Network,
        }
    }

    pub(crate) fn from_error(error: FetchError, fallback: Option<T>) -> Self {
        Self {
            data: fallback,
            status: error.status(),
            headers: BTreeMap::new(),
            error: Some(error),
            source: ResponseSource::Network,
        }
    }

    /// A successful response carrying `data`, as if it had been received with status `200 OK`.
    #[must_use]
    pub fn from_data(data: T) -> Self {
        Self {
            data: Some(data),
            status: Some(StatusCode::OK),
            headers: BTreeMap::new(),
            error: None,
            source: ResponseSource::Network,
        }
    }

    pub(crate) fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    pub(crate) fn set_data(&mut self, data: T) {
        self.data = Some(data);
    }

    /// The decoded data, or the fallback of a soft failure.
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Consumes the response, returning its data.
    #[must_use]
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// The HTTP status, if a response was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Response headers with lower-cased names.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The value of header `name`, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Why the fetch failed, if it did.
    #[must_use]
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    /// Where the response came from.
    #[must_use]
    pub fn source(&self) -> ResponseSource {
        self.source
    }

    /// Returns `true` if the fetch produced no error.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
