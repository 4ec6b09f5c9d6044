// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;
use std::future::pending;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt as _;
use futures_util::future::BoxFuture;
use tick::Clock;

use crate::intercept::Pipeline;
use crate::retry::Attempts;
use crate::revalidate::Revalidator;
use crate::telemetry::{self, Telemetry};
use crate::{
    AbortReason, CacheKey, CallOptions, CancellationToken, Context, Decoder, ErrorStrategy, FetchError, FetchResponse, Interceptors,
    ManualSignals, PollingPolicy, RequestConfig, RequestDescriptor, ResponseSource, Result, RevalidateOptions, SignalSource,
    Subscription, Transport, Ttl, DEFAULT_SWEEP_INTERVAL,
};

/// Coordinates fetches of `T` over a transport `Tr`.
///
/// A fetch resolves its cache key, serves a live cache entry if there is one, and otherwise
/// joins or starts the in-flight request for the key. The request that actually runs passes
/// through the request interceptors, the retry executor and the response interceptors, and its
/// decoded result is cached, published to subscribers and remembered for later revalidation.
///
/// Cloning is cheap; clones share the same [`Context`].
///
/// # Examples
///
/// ```
/// use fetchwise::{CallOptions, Client, JsonDecoder, RawResponse, RequestDescriptor, TransportError};
/// use fetchwise::{CancellationToken, Transport};
/// use tick::Clock;
///
/// struct Echo;
///
/// impl Transport for Echo {
///     async fn send(&self, request: RequestDescriptor, _token: CancellationToken) -> Result<RawResponse, TransportError> {
///         Ok(RawResponse::ok(format!("\"{}\"", request.url())))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = Client::<String, _>::builder(Clock::new_tokio(), Echo, JsonDecoder).name("echo").build();
///
/// let response = client.fetch(RequestDescriptor::get("/hello"), CallOptions::new()).await.unwrap();
///
/// assert_eq!(response.data().map(String::as_str), Some("/hello"));
/// # }
/// ```
pub struct Client<T, Tr> {
    inner: Arc<ClientInner<T, Tr>>,
}

struct ClientInner<T, Tr> {
    context: Context<T>,
    transport: Tr,
    decoder: Arc<dyn Decoder<T>>,
    config: RequestConfig,
    interceptors: Interceptors,
    telemetry: Telemetry,
}

/// Everything needed to run one logical request.
#[derive(Debug, Clone)]
struct Plan {
    key: CacheKey,
    request: RequestDescriptor,
    config: RequestConfig,
    pipeline: Pipeline,
}

/// Why a request reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A caller asked for the data; the cache may answer.
    Caller,
    /// A polling iteration; always goes to the network.
    Poll,
    /// A refresh of already registered data.
    Revalidation,
}

impl Origin {
    fn reads_cache(self) -> bool {
        self == Self::Caller
    }

    fn registers_revalidator(self) -> bool {
        self != Self::Revalidation
    }
}

#[derive(Debug, Clone, Default)]
struct Scope {
    interceptors: Interceptors,
    config: Option<RequestConfig>,
}

impl<T, Tr> Client<T, Tr>
where
    T: Clone + Send + Sync + 'static,
    Tr: Transport,
{
    /// Starts building a client that reads time from `clock`, calls `transport` and decodes with `decoder`.
    pub fn builder(clock: Clock, transport: Tr, decoder: impl Decoder<T>) -> ClientBuilder<T, Tr> {
        ClientBuilder {
            clock,
            transport,
            decoder: Arc::new(decoder),
            config: RequestConfig::default(),
            interceptors: Interceptors::default(),
            signals: Arc::new(ManualSignals::new()),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            telemetry: Telemetry::new(Cow::Borrowed("default")),
        }
    }

    /// Fetches `request`.
    ///
    /// # Errors
    ///
    /// Under [`ErrorStrategy::Reject`] a failed fetch returns its error. Cancelled fetches resolve
    /// softly unless [`reject_cancelled`](RequestConfig::reject_cancelled) is set. Under
    /// [`ErrorStrategy::Silent`] a failed fetch never resolves.
    pub async fn fetch(&self, request: RequestDescriptor, options: CallOptions<T>) -> Result<FetchResponse<T>> {
        self.inner.fetch(request, options, None).await
    }

    /// Creates a group whose interceptors run between the client's and each call's.
    #[must_use]
    pub fn group(&self, interceptors: Interceptors) -> Group<T, Tr> {
        Group {
            client: self.clone(),
            scope: Scope {
                interceptors,
                config: None,
            },
        }
    }

    /// The cache key `request` would use with `options`.
    #[must_use]
    pub fn key_for(&self, request: &RequestDescriptor, options: &CallOptions<T>) -> CacheKey {
        self.inner.config_for(options, None).cache_key.resolve(request)
    }

    /// The cached result for `key`, without waiting for anything.
    #[must_use]
    pub fn snapshot(&self, key: &CacheKey) -> Option<FetchResponse<T>> {
        self.inner.context.cache().get(key).map(|cached| {
            let source = if cached.is_stale() {
                ResponseSource::StaleCache
            } else {
                ResponseSource::Cache
            };
            cached.into_value().with_source(source)
        })
    }

    /// Calls `listener` with every settled fetch, refresh and mutation of `key`.
    pub fn subscribe(&self, key: CacheKey, listener: impl Fn(&FetchResponse<T>) + Send + Sync + 'static) -> Subscription {
        self.inner.context.notifier().subscribe(key, listener)
    }

    /// Drops the cached result for `key`.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.context.cache().delete(key, false)
    }

    /// Replaces the cached data for `key`, keeping its expiry, and tells subscribers.
    ///
    /// Returns `false` if nothing is cached under `key`.
    pub fn mutate(&self, key: &CacheKey, data: T) -> bool {
        let cache = self.inner.context.cache();
        if !cache.mutate(key, |response| response.set_data(data)) {
            return false;
        }

        if let Some(cached) = cache.get(key) {
            self.inner.context.notifier().publish(key, cached.value());
        }
        true
    }

    /// Cancels the request running under `key`.
    pub fn abort(&self, key: &CacheKey) -> bool {
        self.inner.context.in_flight().abort(key, AbortReason::Explicit(None))
    }

    /// Refetches the data registered under `key` and waits for it.
    ///
    /// Returns `Ok(false)` if no fetch ever registered `key`.
    ///
    /// # Errors
    ///
    /// Returns the error of the refetch.
    pub async fn revalidate(&self, key: &CacheKey) -> Result<bool> {
        self.inner.context.revalidators().revalidate(key, false).await
    }

    /// The registries behind this client.
    #[must_use]
    pub fn context(&self) -> &Context<T> {
        &self.inner.context
    }
}

impl<T, Tr> ClientInner<T, Tr>
where
    T: Clone + Send + Sync + 'static,
    Tr: Transport,
{
    fn config_for(&self, options: &CallOptions<T>, scope: Option<&Scope>) -> RequestConfig {
        options
            .config
            .clone()
            .or_else(|| scope.and_then(|scope| scope.config.clone()))
            .unwrap_or_else(|| self.config.clone())
    }

    async fn fetch(self: &Arc<Self>, request: RequestDescriptor, options: CallOptions<T>, scope: Option<&Scope>) -> Result<FetchResponse<T>> {
        let config = self.config_for(&options, scope);
        let CallOptions {
            fallback,
            interceptors,
            polling,
            ..
        } = options;

        let mut scopes = vec![self.interceptors.clone()];
        if let Some(scope) = scope {
            scopes.push(scope.interceptors.clone());
        }
        scopes.push(interceptors);

        let plan = Plan {
            key: config.cache_key.resolve(&request),
            request,
            config,
            pipeline: Pipeline::new(scopes),
        };

        let response = match &polling {
            Some(polling) => self.poll(&plan, polling).await,
            None => self.fetch_once(&plan, Origin::Caller).await,
        };

        self.resolve(response, &plan.config, fallback).await
    }

    async fn fetch_once(self: &Arc<Self>, plan: &Plan, origin: Origin) -> FetchResponse<T> {
        if origin.reads_cache() && plan.config.ttl != Ttl::Disabled {
            match self.context.cache().get(&plan.key) {
                Some(cached) => {
                    let stale = cached.is_stale();
                    self.cache_hit(&plan.key, stale);
                    let source = if stale { ResponseSource::StaleCache } else { ResponseSource::Cache };
                    return cached.into_value().with_source(source);
                }
                None => self.telemetry.report(telemetry::CACHE_MISS),
            }
        }

        let (admission, result) = self
            .context
            .in_flight()
            .join_or_start(&plan.key, plan.config.in_flight_options(), |token| {
                self.start_leader(plan.clone(), token, origin)
            });

        if !admission.is_leader() {
            self.telemetry.report(telemetry::DEDUPLICATED);
        }

        result.await
    }

    /// Runs [`lead`](Self::lead) on its own task, so the request settles even when every caller
    /// stops waiting for it.
    fn start_leader(self: &Arc<Self>, plan: Plan, token: CancellationToken, origin: Origin) -> BoxFuture<'static, FetchResponse<T>> {
        let task = self.context.timers().runtime().run(Arc::clone(self).lead(plan, token, origin));

        async move {
            task.await.unwrap_or_else(|error| {
                let reason = AbortReason::Explicit(Some(format!("request task stopped: {error}").into()));
                FetchResponse::from_error(FetchError::from_abort(reason), None)
            })
        }
        .boxed()
    }

    /// Runs the request for everyone waiting on `plan.key` and records the outcome.
    async fn lead(self: Arc<Self>, plan: Plan, token: CancellationToken, origin: Origin) -> FetchResponse<T> {
        let request = plan.pipeline.request(plan.request.clone());
        let attempts = Attempts {
            policy: &plan.config.retry,
            clock: self.context.timers().clock(),
            token: &token,
            attempt_timeout: plan.config.attempt_timeout(),
            telemetry: &self.telemetry,
            key: &plan.key,
        };

        let (transport, pipeline, request, token_ref) = (&self.transport, &plan.pipeline, &request, &token);
        let outcome = attempts
            .run(move |_attempt| {
                let request = request.clone();
                let token = token_ref.clone();
                async move {
                    let raw = transport.send(request, token).await?;
                    Ok::<_, FetchError>(pipeline.response(raw))
                }
            })
            .await;

        let decoded = outcome.and_then(|raw| {
            let data = self.decoder.decode(&raw)?;
            Ok(FetchResponse::from_network(&raw, data))
        });

        // Once the token fired, whatever the transport made of it is reported as the abort itself.
        let response = match (decoded, token.reason()) {
            (_, Some(reason)) => FetchResponse::from_error(FetchError::from_abort(reason), None),
            (Ok(response), None) => {
                self.context
                    .cache()
                    .set(plan.key.clone(), response.clone(), plan.config.ttl, plan.config.stale_time);
                response
            }
            (Err(error), None) => FetchResponse::from_error(error, None),
        };

        if let Some(error) = response.error() {
            self.fetch_failed(&plan, error);
        }

        self.context.in_flight().settle(&plan.key, &token);
        self.context.notifier().publish(&plan.key, &response);

        if origin.registers_revalidator() {
            self.register_revalidator(&plan);
        }

        response
    }

    async fn poll(self: &Arc<Self>, plan: &Plan, polling: &PollingPolicy<T>) -> FetchResponse<T> {
        let clock = self.context.timers().clock();
        if !polling.delay.is_zero() {
            clock.delay(polling.delay).await;
        }

        let mut latest = self.fetch_once(plan, Origin::Caller).await;
        let mut completed = 1_u32;

        while latest.error().is_none() && polling.should_continue(&latest, completed) {
            clock.delay(polling.interval).await;
            latest = self.fetch_once(plan, Origin::Poll).await;
            completed = completed.saturating_add(1);
        }

        latest
    }

    fn register_revalidator(self: &Arc<Self>, plan: &Plan) {
        let client = Arc::downgrade(self);
        let refresh_plan = plan.clone();
        let refresh: Revalidator = Arc::new(move || {
            let client = Weak::clone(&client);
            let plan = refresh_plan.clone();
            async move {
                match client.upgrade() {
                    Some(client) => client.refresh(&plan).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });

        let options = RevalidateOptions::new(plan.config.idle_ttl())
            .stale_time(plan.config.stale_time)
            .background(Arc::clone(&refresh))
            .on_focus(plan.config.revalidate_on_focus)
            .on_reconnect(plan.config.revalidate_on_reconnect);

        self.context.revalidators().register(plan.key.clone(), refresh, options);
    }

    async fn refresh(self: &Arc<Self>, plan: &Plan) -> Result<()> {
        self.telemetry.report(telemetry::REVALIDATED);
        let response = self.fetch_once(plan, Origin::Revalidation).await;
        match response.error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn resolve(&self, mut response: FetchResponse<T>, config: &RequestConfig, fallback: Option<T>) -> Result<FetchResponse<T>> {
        let Some(error) = response.error().cloned() else {
            return Ok(response);
        };

        let strategy = if error.is_aborted() && !config.reject_cancelled {
            ErrorStrategy::Soft
        } else {
            config.strategy
        };

        match strategy {
            ErrorStrategy::Reject => Err(error),
            ErrorStrategy::Soft => {
                if let Some(fallback) = fallback
                    && response.data().is_none()
                {
                    response.set_data(fallback);
                }
                Ok(response)
            }
            ErrorStrategy::Silent => pending().await,
        }
    }

    #[cfg_attr(
        not(any(feature = "logs", test)),
        expect(unused_variables, reason = "the key is only used for logging")
    )]
    fn cache_hit(&self, key: &CacheKey, stale: bool) {
        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.cache",
            tracing::Level::DEBUG,
            client.name = %self.telemetry.client_name(),
            cache.key = %key,
            cache.stale = stale,
            "served from cache"
        );

        self.telemetry
            .report(if stale { telemetry::CACHE_STALE_HIT } else { telemetry::CACHE_HIT });
    }

    fn fetch_failed(&self, plan: &Plan, error: &FetchError) {
        #[cfg(any(feature = "logs", test))]
        tracing::event!(
            name: "fetchwise.fetch",
            tracing::Level::WARN,
            client.name = %self.telemetry.client_name(),
            cache.key = %plan.key,
            error = %error,
            "fetch failed"
        );

        plan.pipeline.error(error);
        self.telemetry.report(telemetry::FAILED);
    }
}

impl<T, Tr> Clone for Client<T, Tr> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, Tr> fmt::Debug for Client<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.telemetry.client_name())
            .field("config", &self.inner.config)
            .field("interceptors", &self.inner.interceptors)
            .field("context", &self.inner.context)
            .finish_non_exhaustive()
    }
}

/// A client view with an extra interceptor scope and, optionally, its own default configuration.
pub struct Group<T, Tr> {
    client: Client<T, Tr>,
    scope: Scope,
}

impl<T, Tr> Group<T, Tr>
where
    T: Clone + Send + Sync + 'static,
    Tr: Transport,
{
    /// Replaces the client's default configuration for fetches made through this group.
    #[must_use]
    pub fn config(mut self, config: RequestConfig) -> Self {
        self.scope.config = Some(config);
        self
    }

    /// Fetches `request` through this group. See [`Client::fetch`].
    ///
    /// # Errors
    ///
    /// Same as [`Client::fetch`].
    pub async fn fetch(&self, request: RequestDescriptor, options: CallOptions<T>) -> Result<FetchResponse<T>> {
        self.client.inner.fetch(request, options, Some(&self.scope)).await
    }

    /// The cache key `request` would use with `options` in this group.
    #[must_use]
    pub fn key_for(&self, request: &RequestDescriptor, options: &CallOptions<T>) -> CacheKey {
        self.client.inner.config_for(options, Some(&self.scope)).cache_key.resolve(request)
    }

    /// The client this group belongs to.
    #[must_use]
    pub fn client(&self) -> &Client<T, Tr> {
        &self.client
    }
}

impl<T, Tr> Clone for Group<T, Tr> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<T, Tr> fmt::Debug for Group<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("interceptors", &self.scope.interceptors)
            .field("config", &self.scope.config)
            .finish_non_exhaustive()
    }
}

/// Configures and creates a [`Client`].
pub struct ClientBuilder<T, Tr> {
    clock: Clock,
    transport: Tr,
    decoder: Arc<dyn Decoder<T>>,
    config: RequestConfig,
    interceptors: Interceptors,
    signals: Arc<dyn SignalSource>,
    sweep_interval: Duration,
    telemetry: Telemetry,
}

impl<T, Tr> ClientBuilder<T, Tr>
where
    T: Clone + Send + Sync + 'static,
    Tr: Transport,
{
    /// Names the client in logs and metrics.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.telemetry = self.telemetry.with_client_name(name.into());
        self
    }

    /// The configuration used when neither a group nor a call provides one.
    #[must_use]
    pub fn config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// The broadest interceptor scope, applied to every fetch.
    #[must_use]
    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Where focus and reconnect signals come from. Defaults to a [`ManualSignals`] nobody emits on.
    #[must_use]
    pub fn signals(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    /// How often idle revalidation registrations are swept.
    #[must_use]
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Reports `fetchwise.event` counters to `meter_provider`.
    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub fn meter_provider(mut self, meter_provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        self.telemetry = self.telemetry.with_meter_provider(meter_provider);
        self
    }

    /// Creates the client and its [`Context`].
    #[must_use]
    pub fn build(self) -> Client<T, Tr> {
        Client {
            inner: Arc::new(ClientInner {
                context: Context::new(self.clock, self.signals, self.sweep_interval),
                transport: self.transport,
                decoder: self.decoder,
                config: self.config,
                interceptors: self.interceptors,
                telemetry: self.telemetry,
            }),
        }
    }
}

impl<T, Tr> fmt::Debug for ClientBuilder<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}
