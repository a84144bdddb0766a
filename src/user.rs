//! User context used as evaluation input.

use std::collections::HashMap;

/// A single user attribute value, as accepted from application code or the wire.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
	/// UTF-8 string value.
	String(String),
	/// Signed integer value.
	Integer(i64),
	/// Floating-point value.
	Float(f64),
	/// Boolean value.
	Bool(bool),
	/// Explicit absence of a value, distinct from the key being unset.
	Null,
}

impl AttributeValue {
	/// Render the value as a string the way the rule evaluator compares it.
	pub fn as_display_string(&self) -> Option<String> {
		match self {
			Self::String(value) => Some(value.clone()),
			Self::Integer(value) => Some(value.to_string()),
			Self::Float(value) => Some(value.to_string()),
			Self::Bool(value) => Some(value.to_string()),
			Self::Null => None,
		}
	}
}

impl From<&str> for AttributeValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_owned())
	}
}
impl From<String> for AttributeValue {
	fn from(value: String) -> Self {
		Self::String(value)
	}
}
impl From<i64> for AttributeValue {
	fn from(value: i64) -> Self {
		Self::Integer(value)
	}
}
impl From<f64> for AttributeValue {
	fn from(value: f64) -> Self {
		Self::Float(value)
	}
}
impl From<bool> for AttributeValue {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

/// Identity and targeting attributes for a single end user.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UserContext {
	/// Stable user identifier. Empty denotes an anonymous user.
	#[serde(default)]
	pub id: String,
	/// Optional email address, usable by targeting conditions.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	/// Arbitrary targeting attributes.
	#[serde(default)]
	pub attributes: HashMap<String, AttributeValue>,
}

impl UserContext {
	/// An anonymous user with no stable identifier.
	pub fn anonymous() -> Self {
		Self::default()
	}

	/// A user identified by a stable id.
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into(), ..Default::default() }
	}

	/// Attach an email address.
	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}

	/// Attach a single targeting attribute.
	pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	/// Resolve a condition's attribute name to its string form, honoring the
	/// `id`/`email` top-level fields before falling back to `attributes`.
	pub(crate) fn resolve(&self, attribute: &str) -> Option<String> {
		match attribute {
			"id" => (!self.id.is_empty()).then(|| self.id.clone()),
			"email" => self.email.clone(),
			other => self.attributes.get(other).and_then(AttributeValue::as_display_string),
		}
	}
}
