// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for time, signal and explicit revalidation through the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fetchwise::testing::MockTransport;
use fetchwise::{
    CacheKey, CallOptions, Client, ManualSignals, RawResponse, RequestConfig, RequestDescriptor, ResponseSource, Signal, TextDecoder,
    TransportError, Ttl,
};
use testing_aids::{CallLog, settle};
use tick::ClockControl;

struct Fixture {
    control: ClockControl,
    transport: MockTransport,
    signals: Arc<ManualSignals>,
    client: Client<String, MockTransport>,
    version: Arc<AtomicU32>,
}

impl Fixture {
    fn new(config: RequestConfig) -> Self {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let transport = MockTransport::new(&clock);
        let version = Arc::new(AtomicU32::new(0));
        transport.respond_with({
            let version = Arc::clone(&version);
            move |_| Ok(RawResponse::ok(format!("v{}", version.fetch_add(1, Ordering::Relaxed))))
        });
        let signals = Arc::new(ManualSignals::new());
        let client = Client::builder(clock, transport.clone(), TextDecoder)
            .config(config)
            .signals(Arc::clone(&signals) as Arc<dyn fetchwise::SignalSource>)
            .sweep_interval(Duration::from_secs(1))
            .build();

        Self {
            control,
            transport,
            signals,
            client,
            version,
        }
    }

    async fn fetch(&self, url: &str) -> CacheKey {
        let request = RequestDescriptor::get(url);
        let key = self.client.key_for(&request, &CallOptions::new());
        self.client.fetch(request, CallOptions::new()).await.unwrap();
        settle().await;
        key
    }

    async fn advance(&self, by: Duration) {
        self.control.advance(by);
        settle().await;
    }

    fn cached(&self, key: &CacheKey) -> Option<String> {
        self.client.snapshot(key).and_then(|response| response.into_data())
    }
}

#[tokio::test]
async fn stale_time_refreshes_in_background() {
    let fixture = Fixture::new(
        RequestConfig::default()
            .ttl(Ttl::Expires(Duration::from_secs(5)))
            .stale_time(Some(Duration::from_secs(2))),
    );
    let key = fixture.fetch("/profile").await;

    fixture.advance(Duration::from_secs(1)).await;
    assert_eq!(fixture.transport.calls(), 1);
    assert_eq!(fixture.client.snapshot(&key).unwrap().source(), ResponseSource::Cache);

    fixture.advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(fixture.transport.calls(), 2);
    assert_eq!(fixture.cached(&key).as_deref(), Some("v1"));

    // Background refreshes do not re-arm the stale timer.
    fixture.advance(Duration::from_secs(2)).await;
    assert_eq!(fixture.transport.calls(), 2);
}

#[tokio::test]
async fn focus_signal_refreshes_flagged_keys() {
    let fixture = Fixture::new(RequestConfig::default().revalidate_on_focus(true));
    let key = fixture.fetch("/inbox").await;
    assert!(fixture.signals.is_attached(Signal::Focus));
    assert!(!fixture.signals.is_attached(Signal::Reconnect));

    assert!(fixture.signals.emit(Signal::Focus));
    settle().await;

    assert_eq!(fixture.transport.calls(), 2);
    assert_eq!(fixture.cached(&key).as_deref(), Some("v1"));

    assert!(!fixture.signals.emit(Signal::Reconnect));
    settle().await;
    assert_eq!(fixture.transport.calls(), 2);
}

#[tokio::test]
async fn one_listener_per_signal_kind() {
    let fixture = Fixture::new(RequestConfig::default().revalidate_on_reconnect(true));
    let first = fixture.fetch("/a").await;
    let second = fixture.fetch("/b").await;

    assert_eq!(fixture.signals.attach_count(Signal::Reconnect), 1);

    fixture.signals.emit(Signal::Reconnect);
    settle().await;
    assert_eq!(fixture.transport.calls(), 4);

    let revalidators = fixture.client.context().revalidators();
    revalidators.unregister(&first);
    assert!(fixture.signals.is_attached(Signal::Reconnect));
    revalidators.unregister(&second);
    assert!(!fixture.signals.is_attached(Signal::Reconnect));
}

#[tokio::test]
async fn idle_registrations_are_swept() {
    let fixture = Fixture::new(RequestConfig::default().ttl(Ttl::Expires(Duration::from_secs(2))));
    let idle = fixture.fetch("/idle").await;

    let flagged_config = RequestConfig::default()
        .ttl(Ttl::Expires(Duration::from_secs(2)))
        .revalidate_on_focus(true);
    let flagged_request = RequestDescriptor::get("/flagged");
    let flagged = fixture.client.key_for(&flagged_request, &CallOptions::new());
    fixture
        .client
        .fetch(flagged_request, CallOptions::new().config(flagged_config))
        .await
        .unwrap();
    settle().await;

    fixture.advance(Duration::from_secs(1)).await;
    assert!(fixture.client.context().revalidators().contains(&idle));

    for _ in 0..3 {
        fixture.advance(Duration::from_secs(1)).await;
    }

    assert!(!fixture.client.context().revalidators().contains(&idle));
    assert!(fixture.client.context().revalidators().contains(&flagged));
}

#[tokio::test]
async fn explicit_revalidation_reports_errors() {
    let fixture = Fixture::new(RequestConfig::default());
    let key = fixture.fetch("/orders").await;

    fixture.transport.enqueue(Err(TransportError::new("offline")));
    let error = fixture.client.revalidate(&key).await.unwrap_err();
    assert_eq!(error.to_string(), "transport failed: offline");
    assert_eq!(fixture.cached(&key).as_deref(), Some("v0"));

    assert!(fixture.client.revalidate(&key).await.unwrap());
    assert_eq!(fixture.cached(&key).as_deref(), Some("v1"));
}

#[tokio::test]
async fn background_failures_are_swallowed() {
    let fixture = Fixture::new(RequestConfig::default().revalidate_on_focus(true));
    let key = fixture.fetch("/feed").await;
    let seen = CallLog::new();
    let _subscription = fixture.client.subscribe(key.clone(), {
        let seen = seen.clone();
        move |response| seen.push(if response.is_ok() { "ok" } else { "failed" })
    });

    fixture.transport.enqueue(Err(TransportError::new("offline")));
    fixture.signals.emit(Signal::Focus);
    settle().await;

    assert_eq!(seen.entries(), ["failed"]);
    assert_eq!(fixture.cached(&key).as_deref(), Some("v0"));
    assert_eq!(fixture.version.load(Ordering::Relaxed), 1);
}

#[cfg(feature = "logs")]
#[tokio::test(flavor = "current_thread")]
async fn background_failures_are_logged() {
    let capture = testing_aids::LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());
    let fixture = Fixture::new(RequestConfig::default().revalidate_on_focus(true));
    fixture.fetch("/feed").await;

    fixture.transport.enqueue(Err(TransportError::new("offline")));
    fixture.signals.emit(Signal::Focus);
    settle().await;

    capture.assert_contains("revalidation triggered by signal");
    capture.assert_contains("background revalidation failed");
    capture.assert_contains("transport failed: offline");
}
