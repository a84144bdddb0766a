//! Integration tests for the conversion-event and evaluation-telemetry
//! collectors talking to a real (mocked) HTTP boundary.

// std
use std::time::Duration;
// crates.io
use chrono::Utc;
use rollgate_client::{ConversionEvent, EventsConfig, FlagsClient, RetryConfig, TelemetryConfig, cancel};
use serde_json::json;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

fn no_retry() -> RetryConfig {
	RetryConfig { max_retries: 0, ..Default::default() }
}

async fn ready_client(
	server: &MockServer,
	events: EventsConfig,
	telemetry: TelemetryConfig,
) -> std::sync::Arc<FlagsClient> {
	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "flags": { "checkout-v2": true } })))
		.mount(server)
		.await;

	let base_url = Url::parse(&server.uri()).expect("mock server url");
	let client = FlagsClient::builder("test-key", base_url)
		.expect("builder")
		.streaming(false)
		.retry(no_retry())
		.events(events)
		.telemetry(telemetry)
		.build()
		.expect("build");

	let (_handle, token) = cancel::pair();
	client.init(token).await.expect("init");
	client
}

fn event(user_id: &str) -> ConversionEvent {
	ConversionEvent {
		flag_key: "checkout-v2".into(),
		event_name: "purchase".into(),
		user_id: user_id.into(),
		variation_id: None,
		value: Some(42.0),
		metadata: None,
		timestamp: Utc::now(),
	}
}

#[tokio::test]
async fn failed_event_flush_keeps_events_buffered_instead_of_dropping_them() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	let client = ready_client(
		&server,
		EventsConfig { max_buffer: 100, flush_interval: Duration::from_secs(3600), enabled: true },
		TelemetryConfig::default(),
	)
	.await;

	Mock::given(method("POST"))
		.and(path("/api/v1/sdk/events"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	client.track(event("user-1")).await;
	client.track(event("user-2")).await;
	client.flush_events().await;

	assert_eq!(client.get_metrics().events_buffered, 2, "failed flush must not lose buffered events");
}

#[tokio::test]
async fn successful_event_flush_drains_the_buffer() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	let client =
		ready_client(&server, EventsConfig::default(), TelemetryConfig::default()).await;

	Mock::given(method("POST")).and(path("/api/v1/sdk/events")).respond_with(ResponseTemplate::new(202)).mount(&server).await;

	client.track(event("user-1")).await;
	client.flush_events().await;

	assert_eq!(client.get_metrics().events_buffered, 0);
}

#[tokio::test]
async fn failed_telemetry_flush_merges_counts_back_instead_of_dropping() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	let client = ready_client(&server, EventsConfig::default(), TelemetryConfig::default()).await;

	Mock::given(method("POST")).and(path("/api/v1/sdk/telemetry")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

	client.is_enabled("checkout-v2", false);
	client.is_enabled("checkout-v2", false);
	client.flush_telemetry().await;

	let stats = client.get_telemetry_stats();
	let counts = stats.get("checkout-v2").expect("counts survive a failed flush");
	assert_eq!(counts.total, 2);
}
