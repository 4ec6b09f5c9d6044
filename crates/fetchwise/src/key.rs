// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deterministic fingerprints for requests.

use std::fmt;
use std::sync::Arc;

use http::Method;
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::{Body, RequestDescriptor};

/// Header and body signatures longer than this are replaced by their hash.
pub const HASH_THRESHOLD: usize = 64;

/// A sanitized fingerprint that identifies a logical request for caching and deduplication.
///
/// Keys only ever contain characters from the set `A-Z a-z 0-9 space _ - | / : @ . ? = & ~ % # , ; + ! *`;
/// anything else is dropped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from arbitrary text, dropping disallowed characters.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().chars().filter(|c| is_allowed(*c)).collect())
    }

    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            ' ' | '_' | '-' | '|' | '/' | ':' | '@' | '.' | '?' | '=' | '&' | '~' | '%' | '#' | ',' | ';' | '+' | '!' | '*'
        )
}

type DeriveKey = Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>;

/// Where the key of a request comes from.
#[derive(Clone, Default)]
pub enum CacheKeySource {
    /// Derive the key from the request with [`cache_key`].
    #[default]
    Generated,
    /// Use a fixed key.
    Explicit(String),
    /// Compute the key with a custom function.
    Derive(DeriveKey),
}

impl CacheKeySource {
    /// Uses a fixed key for every request.
    #[must_use]
    pub fn explicit(key: impl Into<String>) -> Self {
        Self::Explicit(key.into())
    }

    /// Computes the key with a custom function.
    #[must_use]
    pub fn derive(derive: impl Fn(&RequestDescriptor) -> String + Send + Sync + 'static) -> Self {
        Self::Derive(Arc::new(derive))
    }

    /// Produces the key for `request`. Explicit and derived keys are sanitized but never hashed.
    #[must_use]
    pub fn resolve(&self, request: &RequestDescriptor) -> CacheKey {
        match self {
            Self::Generated => cache_key(request),
            Self::Explicit(key) => CacheKey::new(key),
            Self::Derive(derive) => CacheKey::new(derive(request)),
        }
    }
}

impl fmt::Debug for CacheKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generated => f.write_str("Generated"),
            Self::Explicit(key) => f.debug_tuple("Explicit").field(key).finish(),
            Self::Derive(_) => f.write_str("Derive(..)"),
        }
    }
}

/// Computes the fingerprint of a request.
///
/// The signature is `method|url|credentials|headers`, where headers are rendered as `name:value;`
/// in name order. Requests with a method other than `GET` or `HEAD` also carry a body signature.
/// Binary bodies only contribute their size and media type, so two binary payloads of the same
/// size and type map to the same key.
///
/// # Examples
///
/// ```
/// use fetchwise::{RequestDescriptor, cache_key};
///
/// let a = RequestDescriptor::get("/users?page=2").with_header("Accept", "json").with_header("X-Tenant", "7");
/// let b = RequestDescriptor::get("/users?page=2").with_header("x-tenant", "7").with_header("accept", "json");
///
/// assert_eq!(cache_key(&a), cache_key(&b));
/// ```
#[must_use]
pub fn cache_key(request: &RequestDescriptor) -> CacheKey {
    let mut signature = format!(
        "{}|{}|{}|{}",
        request.method(),
        request.url(),
        request.credentials().as_str(),
        header_signature(request)
    );

    if !matches!(*request.method(), Method::GET | Method::HEAD) && !request.body().is_empty() {
        signature.push('|');
        signature.push_str(&body_signature(request.body()));
    }

    CacheKey::new(signature)
}

fn header_signature(request: &RequestDescriptor) -> String {
    let headers = request.headers().iter().map(|(name, value)| format!("{name}:{value};")).collect::<Vec<_>>();
    bound(headers.concat())
}

fn body_signature(body: &Body) -> String {
    match body {
        Body::Empty => String::new(),
        Body::Text(text) => bound(text.clone()),
        Body::Json(value) => {
            let mut canonical = String::new();
            write_canonical_json(value, &mut canonical);
            bound(canonical)
        }
        Body::Form(fields) => {
            let joined = fields.iter().map(|(name, value)| format!("{name}={value}")).collect::<Vec<_>>().join("&");
            bound(joined)
        }
        Body::Bytes(data) => format!("bytes:{}", data.len()),
        Body::Blob { content_type, data } => format!("blob:{content_type}:{}", data.len()),
    }
}

fn bound(signature: String) -> String {
    if signature.len() > HASH_THRESHOLD {
        format!("{:016x}", xxh3_64(signature.as_bytes()))
    } else {
        signature
    }
}

/// Serializes JSON with object keys sorted at every level.
///
/// `serde_json` keeps insertion order as soon as any crate in the build enables its
/// `preserve_order` feature, so the ordering cannot be left to `Value`'s own serializer.
fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (index, (name, nested)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical_json(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
