//! Conditional HTTP refresh protocol plus identify/events/telemetry posts.
//!
//! Grounded directly on the teacher's `fetch_jwks` (request building, header
//! propagation, ETag extraction, 304 short-circuit, non-2xx mapping).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::events::ConversionEvent;
use crate::rules::EvaluationReason;
use crate::user::UserContext;

pub(crate) const SDK_NAME: &str = "rollgate-client-rust";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const AUX_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct FlagsResponseBody {
	flags: HashMap<String, bool>,
	#[serde(default)]
	reasons: HashMap<String, EvaluationReason>,
}

/// A freshly parsed flag snapshot from a `200` response.
#[derive(Clone, Debug)]
pub struct FlagSnapshot {
	/// Flag key to boolean value.
	pub flags: HashMap<String, bool>,
	/// Flag key to evaluation reason, when the server included them.
	pub reasons: HashMap<String, EvaluationReason>,
	/// `ETag` response header, if present.
	pub etag: Option<String>,
}

/// Outcome of a single refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
	/// `304`: the cached snapshot remains authoritative.
	NotModified,
	/// `200`: a new snapshot was parsed.
	Updated(FlagSnapshot),
}

/// Transport for the management-service SDK endpoints.
pub struct HttpTransport {
	client: Client,
	base_url: Url,
	api_key: String,
	timeout: Duration,
	last_etag: Mutex<Option<String>>,
}

impl HttpTransport {
	/// Construct a transport bound to `base_url`, authenticating with `api_key`.
	pub fn new(client: Client, base_url: Url, api_key: String, timeout: Duration) -> Self {
		Self { client, base_url, api_key, timeout, last_etag: Mutex::new(None) }
	}

	/// Base URL requests are resolved against.
	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// The `ETag` remembered from the last `200` response, if any.
	pub fn remembered_etag(&self) -> Option<String> {
		self.last_etag.lock().expect("etag lock poisoned").clone()
	}

	/// Forget the remembered `ETag`, forcing the next refresh to omit `If-None-Match`.
	pub fn reset_etag(&self) {
		*self.last_etag.lock().expect("etag lock poisoned") = None;
	}

	/// `GET /api/v1/sdk/flags` with conditional `If-None-Match` when an ETag is remembered.
	pub async fn fetch_flags(&self, user_id: &str) -> Result<RefreshOutcome> {
		let mut url = self.base_url.join("/api/v1/sdk/flags")?;
		{
			let mut pairs = url.query_pairs_mut();
			if !user_id.is_empty() {
				pairs.append_pair("user_id", user_id);
			}
			pairs.append_pair("withReasons", "true");
		}

		let mut request = self
			.client
			.get(url.clone())
			.timeout(self.timeout)
			.bearer_auth(&self.api_key)
			.header("content-type", "application/json")
			.header("x-sdk-name", SDK_NAME)
			.header("x-sdk-version", SDK_VERSION);

		if let Some(etag) = self.remembered_etag() {
			request = request.header("if-none-match", etag);
		}

		let response = request.send().await.map_err(|err| Error::from_transport(&err))?;
		let status = response.status();

		if status == StatusCode::NOT_MODIFIED {
			tracing::debug!(url = %url, "flags not modified");
			return Ok(RefreshOutcome::NotModified);
		}

		let etag_header =
			response.headers().get("etag").and_then(|value| value.to_str().ok()).map(str::to_owned);

		if !status.is_success() {
			return Err(Self::status_error(status, response).await);
		}

		let body: FlagsResponseBody = response.json().await.map_err(|err| Error::from_transport(&err))?;

		if let Some(etag) = etag_header.clone() {
			*self.last_etag.lock().expect("etag lock poisoned") = Some(etag);
		}

		tracing::debug!(url = %url, flags = body.flags.len(), "flags refreshed");
		Ok(RefreshOutcome::Updated(FlagSnapshot { flags: body.flags, reasons: body.reasons, etag: etag_header }))
	}

	/// `POST /api/v1/sdk/identify`. Failure is never fatal to the caller.
	pub async fn identify(&self, user: &UserContext) -> Result<()> {
		let url = self.base_url.join("/api/v1/sdk/identify")?;
		let body = serde_json::json!({ "user": user });

		let response = self
			.client
			.post(url)
			.timeout(self.timeout)
			.bearer_auth(&self.api_key)
			.json(&body)
			.send()
			.await
			.map_err(|err| Error::from_transport(&err))?;

		if !response.status().is_success() {
			return Err(Self::status_error(response.status(), response).await);
		}
		Ok(())
	}

	/// `POST /api/v1/sdk/events` with `{"events": [...]}`.
	pub async fn post_events(&self, events: &[ConversionEvent]) -> Result<()> {
		let url = self.base_url.join("/api/v1/sdk/events")?;
		let body = serde_json::json!({ "events": events });

		let response = self
			.client
			.post(url)
			.timeout(AUX_REQUEST_TIMEOUT)
			.bearer_auth(&self.api_key)
			.json(&body)
			.send()
			.await
			.map_err(|err| Error::from_transport(&err))?;

		if !response.status().is_success() {
			return Err(Self::status_error(response.status(), response).await);
		}
		Ok(())
	}

	/// `POST /api/v1/sdk/telemetry` with an arbitrary serializable payload.
	pub async fn post_telemetry<T: Serialize>(&self, payload: &T) -> Result<()> {
		let url = self.base_url.join("/api/v1/sdk/telemetry")?;

		let response = self
			.client
			.post(url)
			.timeout(AUX_REQUEST_TIMEOUT)
			.bearer_auth(&self.api_key)
			.json(payload)
			.send()
			.await
			.map_err(|err| Error::from_transport(&err))?;

		if !response.status().is_success() {
			return Err(Self::status_error(response.status(), response).await);
		}
		Ok(())
	}

	async fn status_error(status: StatusCode, response: reqwest::Response) -> Error {
		let retry_after =
			response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok());
		let body = response.text().await.unwrap_or_default();
		Error::from_status(status.as_u16(), body, retry_after)
	}
}
