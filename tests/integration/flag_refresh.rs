//! Integration tests for flag refresh, ETag revalidation, and circuit behaviour.

// std
use std::time::Duration;
// crates.io
use rollgate_client::{CircuitConfig, CircuitState, FlagsClient, RetryConfig, cancel};
use serde_json::json;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};

fn no_retry() -> RetryConfig {
	RetryConfig { max_retries: 0, ..Default::default() }
}

async fn init_client(server: &MockServer) -> (std::sync::Arc<FlagsClient>, cancel::CancelHandle) {
	let base_url = Url::parse(&server.uri()).expect("mock server url");
	let client = FlagsClient::builder("test-key", base_url)
		.expect("builder")
		.streaming(false)
		.retry(no_retry())
		.build()
		.expect("build");

	let (handle, token) = cancel::pair();
	client.init(token).await.expect("init");
	(client, handle)
}

#[tokio::test]
async fn fetches_and_serves_flags_after_init() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "flags": { "checkout-v2": true, "dark-mode": false } }))
				.insert_header("etag", "\"rev-1\""),
		)
		.expect(1)
		.mount(&server)
		.await;

	let (client, handle) = init_client(&server).await;

	assert!(client.is_enabled("checkout-v2", false));
	assert!(!client.is_enabled("dark-mode", true));
	assert!(!client.is_enabled("unknown-flag", false));

	handle.cancel();
	client.close().await;
	server.verify().await;
}

#[tokio::test]
async fn conditional_refresh_sends_if_none_match_and_leaves_snapshot_untouched_on_304() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "flags": { "checkout-v2": true } }))
				.insert_header("etag", "\"rev-1\""),
		)
		.expect(1)
		.mount(&server)
		.await;

	let (client, handle) = init_client(&server).await;
	assert!(client.is_enabled("checkout-v2", false));

	server.reset().await;
	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.and(header("if-none-match", "\"rev-1\""))
		.respond_with(ResponseTemplate::new(304))
		.expect(1)
		.mount(&server)
		.await;

	client.refresh(cancel::pair().1).await.expect("conditional refresh");
	assert!(client.is_enabled("checkout-v2", false));

	handle.cancel();
	client.close().await;
	server.verify().await;
}

#[tokio::test]
async fn circuit_opens_after_repeated_failures_and_cache_keeps_serving() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "flags": { "checkout-v2": true } }))
				.insert_header("etag", "\"rev-1\""),
		)
		.up_to_n_times(1)
		.mount(&server)
		.await;

	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
		.mount(&server)
		.await;

	let base_url = Url::parse(&server.uri()).expect("mock server url");
	let client = FlagsClient::builder("test-key", base_url)
		.expect("builder")
		.streaming(false)
		.retry(no_retry())
		.circuit(CircuitConfig { failure_threshold: 2, ..Default::default() })
		.build()
		.expect("build");

	let (handle, token) = cancel::pair();
	client.init(token).await.expect("init serves initial snapshot");
	assert!(client.is_enabled("checkout-v2", false));

	for _ in 0..2 {
		let _ = client.refresh(cancel::pair().1).await;
	}

	assert_eq!(client.get_circuit_state(), CircuitState::Open);
	assert!(client.is_enabled("checkout-v2", false), "cached value keeps serving once the circuit opens");

	handle.cancel();
	client.close().await;
}

#[tokio::test]
async fn init_propagates_failure_when_there_is_no_cache_to_fall_back_to() {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/v1/sdk/flags"))
		.respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
		.mount(&server)
		.await;

	let base_url = Url::parse(&server.uri()).expect("mock server url");
	let client = FlagsClient::builder("test-key", base_url)
		.expect("builder")
		.streaming(false)
		.retry(no_retry())
		.build()
		.expect("build");

	let (handle, token) = cancel::pair();
	let result = client.init(token).await;
	assert!(result.is_err(), "init must propagate failure when no cache entry exists yet");

	handle.cancel();
}
