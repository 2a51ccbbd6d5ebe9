//! Dialect detection and element-reference normalization.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Legacy element reference key.
pub const MJSONWP_ELEMENT_KEY: &str = "ELEMENT";
/// W3C element reference key.
pub const W3C_ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Wire dialect negotiated by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
	#[serde(rename = "MJSONWP")]
	Mjsonwp,
	#[serde(rename = "W3C")]
	W3c,
}

impl Protocol {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Mjsonwp => "MJSONWP",
			Self::W3c => "W3C",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Body of a wire response: JSON, or plain text for legacy 4xx replies.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
	Json(Value),
	Text(String),
}

/// Recursively mirrors `first` onto `second` and back in every object.
///
/// Applying it twice yields the same value as applying it once.
pub fn duplicate_keys(input: Value, first: &str, second: &str) -> Value {
	match input {
		Value::Array(items) => Value::Array(
			items
				.into_iter()
				.map(|item| duplicate_keys(item, first, second))
				.collect(),
		),
		Value::Object(obj) => {
			let mut out = Map::with_capacity(obj.len());
			for (key, value) in obj {
				let recursed = duplicate_keys(value, first, second);
				if key == first {
					out.insert(second.to_string(), recursed.clone());
				} else if key == second {
					out.insert(first.to_string(), recursed.clone());
				}
				out.insert(key, recursed);
			}
			Value::Object(out)
		}
		other => other,
	}
}

/// Ensures every element reference carries both dialects' keys.
pub fn format_response_value(value: Value) -> Value {
	duplicate_keys(value, MJSONWP_ELEMENT_KEY, W3C_ELEMENT_KEY)
}

/// Whether `caps` has the W3C `{alwaysMatch?, firstMatch?}` shape.
pub fn is_w3c_caps(caps: &Value) -> bool {
	let Some(obj) = caps.as_object() else {
		return false;
	};
	if obj.is_empty() {
		return false;
	}

	let always_match_valid = || matches!(obj.get("alwaysMatch"), Some(Value::Object(_)));
	let first_match_valid = || match obj.get("firstMatch") {
		Some(Value::Array(items)) => !items.is_empty() && items.iter().all(Value::is_object),
		_ => false,
	};

	match (obj.contains_key("alwaysMatch"), obj.contains_key("firstMatch")) {
		(true, true) => first_match_valid() && always_match_valid(),
		(true, false) => always_match_valid(),
		(false, true) => first_match_valid(),
		(false, false) => false,
	}
}

/// Picks the dialect implied by `createSession` arguments.
pub fn determine_protocol(args: &[Value]) -> Protocol {
	if args.iter().any(is_w3c_caps) {
		Protocol::W3c
	} else {
		Protocol::Mjsonwp
	}
}

/// Longest request or response body written to debug logs.
pub const MAX_LOG_BODY_LENGTH: usize = 1024;

/// Shortens `text` to [`MAX_LOG_BODY_LENGTH`] characters, ending in `...` when cut.
pub fn truncate_for_log(text: &str) -> String {
	if text.chars().count() <= MAX_LOG_BODY_LENGTH {
		return text.to_string();
	}
	let mut out: String = text.chars().take(MAX_LOG_BODY_LENGTH - 3).collect();
	out.push_str("...");
	out
}

/// Adjusts the `status` field of a proxied body for the client's dialect.
///
/// MJSONWP clients (and clients of unknown dialect, when `status` is missing)
/// get `0`, or `13` for failures. W3C clients never see `status`.
pub fn format_status(body: &mut Value, http_status: u16, protocol: Option<Protocol>) {
	let Some(obj) = body.as_object_mut() else {
		return;
	};
	let is_error = http_status >= 400
		|| obj
			.get("value")
			.and_then(Value::as_object)
			.is_some_and(|value| value.contains_key("error"));
	let needs_status = match protocol {
		Some(Protocol::Mjsonwp) => !obj.get("status").is_some_and(|s| s.is_i64() || s.is_u64()),
		None => !obj.contains_key("status"),
		Some(Protocol::W3c) => false,
	};
	if needs_status {
		obj.insert("status".to_string(), Value::from(if is_error { 13 } else { 0 }));
	} else if protocol == Some(Protocol::W3c) {
		obj.shift_remove("status");
	}
}
