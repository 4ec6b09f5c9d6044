// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::{DecodeError, RawResponse};

/// Turns a successful raw response into the data a client hands out.
pub trait Decoder<T>: Send + Sync + 'static {
    /// Decodes the body of `response`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the body does not have the expected shape.
    fn decode(&self, response: &RawResponse) -> Result<T, DecodeError>;
}

/// Deserializes JSON bodies into any [`DeserializeOwned`] type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl<T: DeserializeOwned> Decoder<T> for JsonDecoder {
    fn decode(&self, response: &RawResponse) -> Result<T, DecodeError> {
        serde_json::from_slice(response.body()).map_err(|error| DecodeError::with_source("invalid JSON body", error))
    }
}

/// Reads bodies as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDecoder;

impl Decoder<String> for TextDecoder {
    fn decode(&self, response: &RawResponse) -> Result<String, DecodeError> {
        String::from_utf8(response.body().to_vec()).map_err(|error| DecodeError::with_source("body is not valid UTF-8", error))
    }
}

/// Hands out bodies untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl Decoder<Bytes> for BytesDecoder {
    fn decode(&self, response: &RawResponse) -> Result<Bytes, DecodeError> {
        Ok(response.body().clone())
    }
}
