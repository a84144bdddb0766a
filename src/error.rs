//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used to decide retryability and to let callers
/// match on failure modes without parsing message strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
	/// Transport-level failure (connection refused/reset, timeout, DNS, TLS).
	Network,
	/// 401/403 from the management service.
	Auth,
	/// 429 from the management service.
	RateLimit,
	/// 400 or a malformed request body.
	Validation,
	/// 5xx from the management service.
	Server,
	/// Everything else, including responses with an unrecognised status.
	Unknown,
}

/// Unified error type for the Rollgate client crate.
///
/// Every variant owns its data so the error can be shared across concurrent
/// single-flight waiters without re-running the failed operation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	/// Configuration was rejected before any network activity occurred.
	#[error("Validation failed for {field}: {reason}")]
	Validation {
		/// Field under validation.
		field: &'static str,
		/// Human-readable explanation.
		reason: String,
	},

	/// HTTP boundary failure, already classified by [`ErrorCategory`].
	#[error("{category:?} error ({status:?}): {message}")]
	Http {
		/// Classification used for retry and caller dispatch.
		category: ErrorCategory,
		/// Human-readable message, derived from the response body or transport error.
		message: String,
		/// HTTP status code, when the failure occurred after a response was received.
		status: Option<u16>,
		/// Whether the retryer should attempt this request again.
		retryable: bool,
		/// `Retry-After` seconds advertised by a 429 response.
		retry_after: Option<u64>,
	},

	/// The circuit breaker rejected the call without invoking the wrapped function.
	#[error("circuit is open")]
	CircuitOpen,

	/// Every retry attempt was cancelled before completion.
	#[error("operation cancelled")]
	Cancelled,

	/// The client has no cached data and the initial fetch failed.
	#[error("client not ready: no cached flags and initial fetch failed")]
	NotReady,
}

impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		Error::from_transport(&err)
	}
}
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Http {
			category: ErrorCategory::Validation,
			message: err.to_string(),
			status: None,
			retryable: false,
			retry_after: None,
		}
	}
}
impl From<url::ParseError> for Error {
	fn from(err: url::ParseError) -> Self {
		Error::Validation { field: "url", reason: err.to_string() }
	}
}

impl Error {
	/// Construct an HTTP-boundary error from a status code, following the
	/// mapping in the error taxonomy: 401/403 → auth (not retryable), 429 →
	/// rate-limit (retryable), 400 → validation (not retryable), 5xx →
	/// server (retryable), otherwise → unknown (not retryable).
	pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<u64>) -> Self {
		let (category, retryable) = match status {
			401 | 403 => (ErrorCategory::Auth, false),
			429 => (ErrorCategory::RateLimit, true),
			400 => (ErrorCategory::Validation, false),
			500..=599 => (ErrorCategory::Server, true),
			_ => (ErrorCategory::Unknown, false),
		};

		Self::Http {
			category,
			message: message.into(),
			status: Some(status),
			retryable,
			retry_after: if status == 429 { Some(retry_after.unwrap_or(60)) } else { None },
		}
	}

	/// Classify a transport-level (non-HTTP-status) failure by substring search
	/// over a closed list of known-transient message fragments.
	pub fn from_transport(err: &reqwest::Error) -> Self {
		let message = err.to_string();
		let lower = message.to_ascii_lowercase();
		const NETWORK_MARKERS: &[&str] = &[
			"connection refused",
			"connection reset",
			"timed out",
			"timeout",
			"dns",
			"no such host",
			"unreachable",
			"eof",
			"tls handshake",
			"certificate",
		];
		let retryable = NETWORK_MARKERS.iter().any(|marker| lower.contains(marker));
		let category = if retryable { ErrorCategory::Network } else { ErrorCategory::Unknown };

		Self::Http { category, message, status: None, retryable, retry_after: None }
	}

	/// Whether the retryer should attempt this error again.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Http { retryable, .. } => *retryable,
			_ => false,
		}
	}

	/// `Retry-After` seconds, when present.
	pub fn retry_after(&self) -> Option<u64> {
		match self {
			Self::Http { retry_after, .. } => *retry_after,
			_ => None,
		}
	}

	/// Error category, when this is an HTTP-boundary error.
	pub fn category(&self) -> Option<ErrorCategory> {
		match self {
			Self::Http { category, .. } => Some(*category),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping_matches_taxonomy() {
		assert_eq!(Error::from_status(401, "nope", None).category(), Some(ErrorCategory::Auth));
		assert_eq!(Error::from_status(403, "nope", None).category(), Some(ErrorCategory::Auth));
		assert!(!Error::from_status(401, "nope", None).is_retryable());

		let rate_limited = Error::from_status(429, "slow down", None);
		assert_eq!(rate_limited.category(), Some(ErrorCategory::RateLimit));
		assert!(rate_limited.is_retryable());
		assert_eq!(rate_limited.retry_after(), Some(60));

		let rate_limited_explicit = Error::from_status(429, "slow down", Some(5));
		assert_eq!(rate_limited_explicit.retry_after(), Some(5));

		assert_eq!(Error::from_status(400, "bad", None).category(), Some(ErrorCategory::Validation));
		assert!(!Error::from_status(400, "bad", None).is_retryable());

		assert!(Error::from_status(503, "down", None).is_retryable());
		assert_eq!(Error::from_status(503, "down", None).category(), Some(ErrorCategory::Server));

		assert_eq!(Error::from_status(418, "teapot", None).category(), Some(ErrorCategory::Unknown));
		assert!(!Error::from_status(418, "teapot", None).is_retryable());
	}

	#[test]
	fn circuit_open_is_not_retryable() {
		assert!(!Error::CircuitOpen.is_retryable());
	}
}
