// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for retries and backoff, driven by a controlled clock.

use std::time::Duration;

use fetchwise::testing::MockTransport;
use fetchwise::{
    AttemptOutcome, CallOptions, Client, FetchError, FetchResponse, RawResponse, RequestConfig, RequestDescriptor, RetryPolicy,
    TextDecoder, TransportError,
};
use http::StatusCode;
use testing_aids::{CallLog, settle};
use tick::ClockControl;
use tokio::task::JoinHandle;

struct Fixture {
    control: ClockControl,
    transport: MockTransport,
    client: Client<String, MockTransport>,
}

impl Fixture {
    fn new(retry: RetryPolicy) -> Self {
        Self::with_config(RequestConfig::default().retry(retry))
    }

    fn with_config(config: RequestConfig) -> Self {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let transport = MockTransport::new(&clock);
        transport.respond_with(|_| Ok(RawResponse::ok("recovered")));
        let client = Client::builder(clock, transport.clone(), TextDecoder).config(config).build();

        Self {
            control,
            transport,
            client,
        }
    }

    fn spawn_fetch(&self, url: &str) -> JoinHandle<fetchwise::Result<FetchResponse<String>>> {
        let client = self.client.clone();
        let request = RequestDescriptor::get(url);
        tokio::spawn(async move { client.fetch(request, CallOptions::new()).await })
    }

    async fn advance(&self, by: Duration) {
        self.control.advance(by);
        settle().await;
    }

    fn fail_with(&self, status: StatusCode) {
        self.transport.enqueue(Ok(RawResponse::new(status, "")));
    }
}

#[tokio::test]
async fn retries_follow_backoff_schedule() {
    let fixture = Fixture::new(
        RetryPolicy::default()
            .max_retry_attempts(2)
            .delay(Duration::from_secs(1))
            .backoff_factor(2.0),
    );
    fixture.fail_with(StatusCode::SERVICE_UNAVAILABLE);
    fixture.fail_with(StatusCode::SERVICE_UNAVAILABLE);

    let fetch = fixture.spawn_fetch("/flaky");
    settle().await;
    assert_eq!(fixture.transport.calls(), 1);

    fixture.advance(Duration::from_millis(999)).await;
    assert_eq!(fixture.transport.calls(), 1);
    fixture.advance(Duration::from_millis(1)).await;
    assert_eq!(fixture.transport.calls(), 2);

    fixture.advance(Duration::from_millis(1999)).await;
    assert_eq!(fixture.transport.calls(), 2);
    fixture.advance(Duration::from_millis(1)).await;
    assert_eq!(fixture.transport.calls(), 3);

    let response = fetch.await.unwrap().unwrap();
    assert_eq!(response.data().map(String::as_str), Some("recovered"));
}

#[tokio::test]
async fn retry_after_header_sets_delay() {
    let fixture = Fixture::new(RetryPolicy::default().max_retry_attempts(1).delay(Duration::from_millis(100)));
    fixture
        .transport
        .enqueue(Ok(RawResponse::new(StatusCode::TOO_MANY_REQUESTS, "").with_header("Retry-After", "3")));

    let fetch = fixture.spawn_fetch("/limited");
    settle().await;

    fixture.advance(Duration::from_secs(2)).await;
    assert_eq!(fixture.transport.calls(), 1);
    fixture.advance(Duration::from_secs(1)).await;
    assert_eq!(fixture.transport.calls(), 2);

    assert!(fetch.await.unwrap().is_ok());
}

#[tokio::test]
async fn ineligible_status_is_not_retried() {
    let fixture = Fixture::new(RetryPolicy::default().max_retry_attempts(3));
    fixture.fail_with(StatusCode::NOT_FOUND);

    let error = fixture.spawn_fetch("/missing").await.unwrap().unwrap_err();

    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(fixture.transport.calls(), 1);
}

#[tokio::test]
async fn transport_failures_are_retried() {
    let fixture = Fixture::new(RetryPolicy::default().max_retry_attempts(1).delay(Duration::from_millis(10)));
    fixture.transport.enqueue(Err(TransportError::new("connection reset")));

    let fetch = fixture.spawn_fetch("/net");
    settle().await;
    fixture.advance(Duration::from_millis(10)).await;

    assert!(fetch.await.unwrap().is_ok());
    assert_eq!(fixture.transport.calls(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_last_error() {
    let fixture = Fixture::new(RetryPolicy::default().max_retry_attempts(1).delay(Duration::from_millis(10)));
    fixture.fail_with(StatusCode::BAD_GATEWAY);
    fixture.fail_with(StatusCode::GATEWAY_TIMEOUT);

    let fetch = fixture.spawn_fetch("/down");
    settle().await;
    fixture.advance(Duration::from_millis(10)).await;

    let error = fetch.await.unwrap().unwrap_err();
    assert_eq!(error.status(), Some(StatusCode::GATEWAY_TIMEOUT));
}

#[tokio::test]
async fn on_retry_observes_each_retry() {
    let events = CallLog::new();
    let fixture = Fixture::new(
        RetryPolicy::default()
            .max_retry_attempts(2)
            .delay(Duration::from_millis(100))
            .on_retry({
                let events = events.clone();
                move |event| {
                    events.push(format!(
                        "retry {} after {:?} ({:?})",
                        event.attempt().index(),
                        event.delay(),
                        event.status().map(|status| status.as_u16())
                    ));
                }
            }),
    );
    fixture.fail_with(StatusCode::SERVICE_UNAVAILABLE);
    fixture.transport.enqueue(Err(TransportError::new("reset")));

    let fetch = fixture.spawn_fetch("/observed");
    for _ in 0..3 {
        settle().await;
        fixture.advance(Duration::from_millis(150)).await;
    }

    assert!(fetch.await.unwrap().is_ok());
    assert_eq!(
        events.entries(),
        ["retry 0 after 100ms (Some(503))", "retry 1 after 150ms (None)"]
    );
}

#[tokio::test]
async fn unsatisfying_success_becomes_validation_error() {
    let fixture = Fixture::new(
        RetryPolicy::default()
            .max_retry_attempts(1)
            .delay(Duration::from_millis(10))
            .should_retry(|outcome, _| matches!(outcome, AttemptOutcome::Response(response) if response.body().as_ref() == b"recovered")),
    );

    let fetch = fixture.spawn_fetch("/never-good");
    settle().await;
    fixture.advance(Duration::from_millis(10)).await;

    let error = fetch.await.unwrap().unwrap_err();
    assert!(matches!(error, FetchError::Validation { .. }));
    assert_eq!(fixture.transport.calls(), 2);
}

#[tokio::test]
async fn per_attempt_timeout_allows_retry() {
    let fixture = Fixture::with_config(
        RequestConfig::default()
            .timeout(Some(Duration::from_secs(1)))
            .retry(
                RetryPolicy::default()
                    .max_retry_attempts(1)
                    .delay(Duration::from_millis(100))
                    .reset_timeout(true),
            ),
    );
    fixture.transport.latency(Duration::from_secs(5));

    let fetch = fixture.spawn_fetch("/sluggish");
    settle().await;
    fixture.transport.latency(Duration::ZERO);

    fixture.advance(Duration::from_secs(1)).await;
    fixture.advance(Duration::from_millis(100)).await;

    let response = fetch.await.unwrap().unwrap();
    assert_eq!(response.data().map(String::as_str), Some("recovered"));
    assert_eq!(fixture.transport.calls(), 2);
}

#[tokio::test]
async fn overall_timeout_spans_all_attempts() {
    let fixture = Fixture::with_config(
        RequestConfig::default()
            .timeout(Some(Duration::from_secs(1)))
            .retry(
                RetryPolicy::default()
                    .max_retry_attempts(5)
                    .delay(Duration::from_millis(400))
                    .backoff_factor(1.0),
            ),
    );
    for _ in 0..6 {
        fixture.fail_with(StatusCode::SERVICE_UNAVAILABLE);
    }

    // Attempts start at 0, 400 and 800 ms; the deadline at 1 s lands inside the third backoff.
    let fetch = fixture.spawn_fetch("/deadline");
    settle().await;
    for _ in 0..6 {
        fixture.advance(Duration::from_millis(200)).await;
    }

    let error = fetch.await.unwrap().unwrap_err();
    assert!(error.is_timeout());
    assert_eq!(fixture.transport.calls(), 3);
}

#[tokio::test]
async fn abort_during_backoff_skips_remaining_retries() {
    let fixture = Fixture::new(RetryPolicy::default().max_retry_attempts(3).delay(Duration::from_secs(10)));
    fixture.fail_with(StatusCode::SERVICE_UNAVAILABLE);
    let request = RequestDescriptor::get("/slow-retry");
    let key = fixture.client.key_for(&request, &CallOptions::new());

    let fetch = fixture.spawn_fetch("/slow-retry");
    settle().await;
    assert!(fixture.client.abort(&key));

    let response = fetch.await.unwrap().unwrap();
    assert!(response.error().is_some_and(FetchError::is_aborted));
    assert_eq!(fixture.transport.calls(), 1);
}
