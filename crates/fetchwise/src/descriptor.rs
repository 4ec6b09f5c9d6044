// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{Method, StatusCode};

/// Whether the transport should attach ambient credentials such as cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Credentials {
    /// Never send credentials.
    Omit,
    /// Send credentials only to the origin the client belongs to.
    #[default]
    SameOrigin,
    /// Always send credentials.
    Include,
}

impl Credentials {
    /// The canonical lower-case name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Omit => "omit",
            Self::SameOrigin => "same-origin",
            Self::Include => "include",
        }
    }
}

/// The payload of a request.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No payload.
    #[default]
    Empty,
    /// Plain text.
    Text(String),
    /// A JSON document.
    Json(serde_json::Value),
    /// URL-encoded form fields.
    Form(BTreeMap<String, String>),
    /// Opaque binary data.
    Bytes(Bytes),
    /// Binary data with a declared media type.
    Blob {
        /// The media type of the payload.
        content_type: String,
        /// The payload itself.
        data: Bytes,
    },
}

impl Body {
    /// Returns `true` for [`Body::Empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// A normalized, immutable description of a logical request.
///
/// Header names are lower-cased and kept in a sorted map, so two descriptors built with the same
/// headers in a different order are equal. Every `with_*` method consumes the descriptor and
/// returns the modified copy.
///
/// # Examples
///
/// ```
/// use fetchwise::{Body, RequestDescriptor};
///
/// let request = RequestDescriptor::post("https://api.example.com/items")
///     .with_header("Content-Type", "application/json")
///     .with_body(Body::Json(serde_json::json!({ "name": "kettle" })));
///
/// assert_eq!(request.header("content-type"), Some("application/json"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    body: Body,
    credentials: Credentials,
}

impl RequestDescriptor {
    /// Creates a descriptor with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Body::Empty,
            credentials: Credentials::default(),
        }
    }

    /// Creates a `GET` descriptor.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a `POST` descriptor.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Returns a copy with the header set, replacing any previous value under the same name.
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(normalize_header_name(name.as_ref()), value.into());
        self
    }

    /// Returns a copy without the named header.
    #[must_use]
    pub fn without_header(mut self, name: impl AsRef<str>) -> Self {
        self.headers.remove(&normalize_header_name(name.as_ref()));
        self
    }

    /// Returns a copy with the body replaced.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Returns a copy targeting another URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Returns a copy using another method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Returns a copy with another credentials mode.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// The HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The normalized headers, sorted by name.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Looks up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize_header_name(name)).map(String::as_str)
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Whether credentials go along with the request.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.credentials
    }
}

fn normalize_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// What a [`Transport`](crate::Transport) hands back: status, headers and the undecoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    status: StatusCode,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl RawResponse {
    /// Creates a response with `status` and `body`.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A `200 OK` response with the given body.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// Adds a header; the name is lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(normalize_header_name(name.as_ref()), value.into());
        self
    }

    /// Replaces the status.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
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
        self.headers.get(&normalize_header_name(name)).map(String::as_str)
    }

    /// The response body bytes.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
