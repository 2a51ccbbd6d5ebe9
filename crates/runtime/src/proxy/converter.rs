//! Request adaptation between client and downstream dialects.
//!
//! Two kinds of mismatch are handled: commands whose body shape differs
//! between dialects, and commands whose URL differs.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use wd_protocol::{HttpMethod, MJSONWP_ELEMENT_KEY, Protocol, Result, W3C_ELEMENT_KEY, duplicate_keys};

use super::JwpProxy;

static TIMEOUT_MS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(?:[.,]\d*?)?$").unwrap());
static EXECUTE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/execute.*").unwrap());
static ELEMENT_SCREENSHOT_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"/element/([^/]+)/screenshot$").unwrap());
static SCREENSHOT_ELEMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/screenshot/([^/]+)").unwrap());
static WINDOW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/window$").unwrap());
static WINDOW_HANDLE_W3C_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/window/handle(s?)$").unwrap());
static WINDOW_HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/window_handle$").unwrap());
static WINDOW_HANDLES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/window_handles$").unwrap());
static PROPERTY_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"/element/([^/]+)/property/([^/]+)").unwrap());

/// Forwards `command` through `proxy`, adapting body or URL to the downstream dialect.
///
/// Until the downstream dialect is known the request is forwarded untouched.
pub async fn convert_and_proxy(
	proxy: &JwpProxy,
	command: &str,
	url: &str,
	method: HttpMethod,
	body: Option<Value>,
) -> Result<(u16, Value)> {
	let Some(downstream) = proxy.downstream_protocol() else {
		return proxy.proxy(url, method, body).await;
	};

	match command {
		"timeouts" => return proxy_set_timeouts(proxy, downstream, url, method, body).await,
		"setWindow" => return proxy.proxy(url, method, set_window_body(body, downstream)).await,
		"setValue" => return proxy.proxy(url, method, set_value_body(body)).await,
		"performActions" => {
			let body = match parse_body(body) {
				Some(Value::Object(obj)) => Some(element_keys(Value::Object(obj))),
				other => other,
			};
			return proxy.proxy(url, method, body).await;
		}
		"releaseActions" => return proxy.proxy(url, method, None).await,
		"setFrame" => return proxy.proxy(url, method, set_frame_body(body)).await,
		_ => {}
	}

	if let Some(rewritten) = rewrite_url(command, url, downstream) {
		info!(
			target = "wd.proxy",
			protocol = downstream.as_str(),
			"Rewrote the original URL '{url}' to '{rewritten}'"
		);
		return proxy.proxy(&rewritten, method, body).await;
	}

	proxy.proxy(url, method, body).await
}

/// Splits or joins timeout bodies for the downstream dialect.
///
/// An MJSONWP `{type, ms}` body becomes `{<type>: ms}` for W3C. A W3C body
/// becomes one `{type, ms}` body per numeric entry for MJSONWP.
pub fn timeout_request_bodies(body: &Value, downstream: Protocol) -> Vec<Value> {
	let has_type_and_ms = body.get("ms").is_some() && body.get("type").is_some();

	match downstream {
		Protocol::W3c if has_type_and_ms => {
			let kind = match body["type"].as_str() {
				Some("page load") => "pageLoad".to_string(),
				Some(other) => other.to_string(),
				None => body["type"].to_string(),
			};
			let mut out = Map::new();
			out.insert(kind, body["ms"].clone());
			vec![Value::Object(out)]
		}
		Protocol::Mjsonwp if !has_type_and_ms => {
			let Some(obj) = body.as_object() else {
				return Vec::new();
			};
			obj.iter()
				.filter(|(_, ms)| TIMEOUT_MS_RE.is_match(&plain_string(ms)))
				.map(|(kind, ms)| {
					let kind = if kind == "pageLoad" { "page load" } else { kind.as_str() };
					json!({"type": kind, "ms": ms})
				})
				.collect()
		}
		_ => vec![body.clone()],
	}
}

async fn proxy_set_timeouts(
	proxy: &JwpProxy,
	downstream: Protocol,
	url: &str,
	method: HttpMethod,
	body: Option<Value>,
) -> Result<(u16, Value)> {
	let body = parse_body(body).unwrap_or(Value::Null);
	let requests = timeout_request_bodies(&body, downstream);
	let shown = serde_json::to_string(&requests).unwrap_or_default();
	debug!(
		target = "wd.proxy",
		"Will send the following request bodies to /timeouts: {shown}"
	);

	let mut last = None;
	for request in requests {
		let (status, reply) = proxy.proxy(url, method, Some(request)).await?;
		if downstream != Protocol::Mjsonwp || status >= 400 {
			return Ok((status, reply));
		}
		last = Some((status, reply));
	}
	match last {
		Some(response) => Ok(response),
		None => proxy.proxy(url, method, Some(body)).await,
	}
}

/// Copies `name` to `handle` for W3C, or `handle` to `name` for MJSONWP.
pub fn set_window_body(body: Option<Value>, downstream: Protocol) -> Option<Value> {
	let parsed = parse_body(body.clone());
	let Some(Value::Object(mut obj)) = parsed else {
		return body;
	};
	let (from, to) = match downstream {
		Protocol::W3c => ("name", "handle"),
		Protocol::Mjsonwp => ("handle", "name"),
	};
	if obj.contains_key(to) {
		return body;
	}
	let Some(value) = obj.get(from).cloned() else {
		return body;
	};
	debug!(target = "wd.proxy", "Copied '{from}' value {value} to '{to}'");
	obj.insert(to.to_string(), value);
	Some(Value::Object(obj))
}

/// Fills whichever of `text` (a string) and `value` (a list of characters) is missing.
pub fn set_value_body(body: Option<Value>) -> Option<Value> {
	let parsed = parse_body(body.clone());
	let Some(Value::Object(mut obj)) = parsed else {
		return body;
	};
	let text = obj.get("text").filter(|v| !v.is_null()).cloned();
	let value = obj.get("value").filter(|v| !v.is_null()).cloned();

	let (text, value) = match (text, value) {
		(None, None) => return body,
		(Some(text), None) => {
			let value = match &text {
				Value::String(s) => Value::Array(s.chars().map(|c| Value::String(c.to_string())).collect()),
				Value::Array(items) => Value::Array(items.clone()),
				_ => Value::Array(Vec::new()),
			};
			debug!(target = "wd.proxy", "Added 'value' property {value} to 'setValue' request body");
			(text, value)
		}
		(None, Some(value)) => {
			let text = match &value {
				Value::Array(items) => Value::String(items.iter().map(plain_string).collect()),
				Value::String(s) => Value::String(s.clone()),
				_ => Value::String(String::new()),
			};
			debug!(target = "wd.proxy", "Added 'text' property {text} to 'setValue' request body");
			(text, value)
		}
		(Some(text), Some(value)) => (text, value),
	};
	obj.insert("text".to_string(), text);
	obj.insert("value".to_string(), value);
	Some(Value::Object(obj))
}

/// Makes a frame element reference readable in both dialects.
pub fn set_frame_body(body: Option<Value>) -> Option<Value> {
	let parsed = parse_body(body.clone());
	let Some(Value::Object(mut obj)) = parsed else {
		return body;
	};
	match obj.get_mut("id") {
		Some(id) if id.is_object() => {
			*id = element_keys(id.take());
			Some(Value::Object(obj))
		}
		_ => body,
	}
}

/// Rewrites `url` for commands whose endpoint differs between dialects.
///
/// Returns `None` when the command has no dialect-specific URL or the URL is
/// already in the downstream form.
pub fn rewrite_url(command: &str, url: &str, downstream: Protocol) -> Option<String> {
	let rewritten = match (command, downstream) {
		("execute" | "executeAsync", Protocol::Mjsonwp) => {
			let target = if url.contains("async") { "/execute_async" } else { "/execute" };
			EXECUTE_RE.replace(url, target).into_owned()
		}
		("execute" | "executeAsync", Protocol::W3c) => {
			let target = if url.contains("async") { "/execute/async" } else { "/execute/sync" };
			EXECUTE_RE.replace(url, target).into_owned()
		}
		("getElementScreenshot", Protocol::Mjsonwp) => {
			ELEMENT_SCREENSHOT_RE.replace(url, "/screenshot/${1}").into_owned()
		}
		("getElementScreenshot", Protocol::W3c) => {
			SCREENSHOT_ELEMENT_RE.replace(url, "/element/${1}/screenshot").into_owned()
		}
		("getWindowHandle" | "getWindowHandles", Protocol::Mjsonwp) => {
			if url.ends_with("/window") {
				WINDOW_RE.replace(url, "/window_handle").into_owned()
			} else {
				WINDOW_HANDLE_W3C_RE.replace(url, "/window_handle${1}").into_owned()
			}
		}
		("getWindowHandle" | "getWindowHandles", Protocol::W3c) => {
			if url.ends_with("/window_handle") {
				WINDOW_HANDLE_RE.replace(url, "/window").into_owned()
			} else {
				WINDOW_HANDLES_RE.replace(url, "/window/handles").into_owned()
			}
		}
		// W3C servers accept both /attribute and /property
		("getProperty", Protocol::Mjsonwp) => PROPERTY_RE.replace(url, "/element/${1}/attribute/${2}").into_owned(),
		_ => return None,
	};

	if rewritten == url {
		debug!(
			target = "wd.proxy",
			protocol = downstream.as_str(),
			"Did not know how to rewrite the original URL '{url}'"
		);
		return None;
	}
	Some(rewritten)
}

fn element_keys(value: Value) -> Value {
	duplicate_keys(value, MJSONWP_ELEMENT_KEY, W3C_ELEMENT_KEY)
}

fn parse_body(body: Option<Value>) -> Option<Value> {
	match body {
		Some(Value::String(raw)) => serde_json::from_str(&raw).ok().or(Some(Value::String(raw))),
		other => other,
	}
}

fn plain_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		Value::Null => String::new(),
		other => other.to_string(),
	}
}
