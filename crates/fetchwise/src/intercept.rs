// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use crate::{FetchError, RawResponse, RequestDescriptor};

type RequestInterceptor = Arc<dyn Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync>;
type ResponseInterceptor = Arc<dyn Fn(RawResponse) -> RawResponse + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Interceptors registered at one scope: the client, a group or a single call.
///
/// Scopes nest like brackets. Request interceptors run broadest scope first, response
/// interceptors and error observers run narrowest scope first. Within one scope, interceptors
/// always run in the order they were added.
///
/// # Examples
///
/// ```
/// use fetchwise::Interceptors;
///
/// let interceptors = Interceptors::new()
///     .on_request(|request| request.with_header("authorization", "Bearer token"))
///     .on_response(|response| response.with_header("x-seen", "1"));
/// # let _ = interceptors;
/// ```
#[derive(Clone, Default)]
pub struct Interceptors {
    request: Vec<RequestInterceptor>,
    response: Vec<ResponseInterceptor>,
    error: Vec<ErrorObserver>,
}

impl Interceptors {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request interceptor, run before the request reaches the transport.
    #[must_use]
    pub fn on_request(mut self, interceptor: impl Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync + 'static) -> Self {
        self.request.push(Arc::new(interceptor));
        self
    }

    /// Adds a response interceptor, run on every response before it is judged and decoded.
    #[must_use]
    pub fn on_response(mut self, interceptor: impl Fn(RawResponse) -> RawResponse + Send + Sync + 'static) -> Self {
        self.response.push(Arc::new(interceptor));
        self
    }

    /// Adds an observer of the final error of a failed fetch.
    #[must_use]
    pub fn on_error(mut self, observer: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.error.push(Arc::new(observer));
        self
    }

    /// Appends the interceptors of `other` after the ones already registered.
    #[must_use]
    pub fn merge(mut self, other: &Self) -> Self {
        self.request.extend(other.request.iter().cloned());
        self.response.extend(other.response.iter().cloned());
        self.error.extend(other.error.iter().cloned());
        self
    }

    /// Returns `true` if the scope registers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty() && self.error.is_empty()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("error", &self.error.len())
            .finish()
    }
}

/// The interceptor scopes applying to one fetch, ordered broadest first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pipeline {
    scopes: Vec<Interceptors>,
}

impl Pipeline {
    pub(crate) fn new(scopes: impl IntoIterator<Item = Interceptors>) -> Self {
        Self {
            scopes: scopes.into_iter().filter(|scope| !scope.is_empty()).collect(),
        }
    }

    pub(crate) fn request(&self, request: RequestDescriptor) -> RequestDescriptor {
        self.scopes
            .iter()
            .flat_map(|scope| scope.request.iter())
            .fold(request, |request, interceptor| interceptor(request))
    }

    pub(crate) fn response(&self, response: RawResponse) -> RawResponse {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.response.iter())
            .fold(response, |response, interceptor| interceptor(response))
    }

    pub(crate) fn error(&self, error: &FetchError) {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.error.iter())
            .for_each(|observer| observer(error));
    }
}

#[cfg(test)]
mod tests {
    use testing_aids::CallLog;

    use super::*;
    use crate::TransportError;

    fn scope(name: &'static str, log: &CallLog) -> Interceptors {
        let (request_log, response_log, error_log) = (log.clone(), log.clone(), log.clone());
        Interceptors::new()
            .on_request(move |request| {
                request_log.push(format!("request {name}"));
                request
            })
            .on_response(move |response| {
                response_log.push(format!("response {name}"));
                response
            })
            .on_error(move |_| error_log.push(format!("error {name}")))
    }

    #[test]
    fn scopes_run_as_brackets() {
        let log = CallLog::new();
        let pipeline = Pipeline::new([scope("global", &log), scope("group", &log), scope("call", &log)]);

        let _ = pipeline.request(RequestDescriptor::get("/a"));
        let _ = pipeline.response(RawResponse::ok("x"));

        assert_eq!(
            log.take(),
            [
                "request global",
                "request group",
                "request call",
                "response call",
                "response group",
                "response global",
            ]
        );

        pipeline.error(&FetchError::from(TransportError::new("down")));
        assert_eq!(log.take(), ["error call", "error group", "error global"]);
    }

    #[test]
    fn array_order_within_a_scope() {
        let log = CallLog::new();
        let pipeline = Pipeline::new([scope("first", &log).merge(&scope("second", &log))]);

        let _ = pipeline.request(RequestDescriptor::get("/a"));
        let _ = pipeline.response(RawResponse::ok("x"));

        assert_eq!(
            log.take(),
            ["request first", "request second", "response first", "response second"]
        );
    }

    #[test]
    fn interceptors_transform_values() {
        let pipeline = Pipeline::new([
            Interceptors::new()
                .on_request(|request| request.with_header("x-scope", "global"))
                .on_response(|response| {
                    let body = format!("{}!", String::from_utf8_lossy(response.body()));
                    response.with_body(body)
                }),
            Interceptors::new()
                .on_request(|request| request.with_header("x-scope", "call"))
                .on_response(|response| response.with_body("call")),
        ]);

        let request = pipeline.request(RequestDescriptor::get("/a"));
        assert_eq!(request.header("x-scope"), Some("call"));

        let response = pipeline.response(RawResponse::ok("raw"));
        assert_eq!(response.body().as_ref(), b"call!");
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let pipeline = Pipeline::new([Interceptors::new()]);
        let request = RequestDescriptor::get("/a").with_header("x", "1");

        assert_eq!(pipeline.request(request.clone()), request);
        assert!(Interceptors::new().is_empty());
    }
}
