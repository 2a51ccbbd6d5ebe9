//! HTTP proxy to a downstream WebDriver server.
//!
//! [`JwpProxy`] rewrites route-relative URLs onto the downstream base URL and
//! session, learns the downstream dialect from its first successful response
//! (session creation always overrides it), and smooths over dialect
//! differences through [`converter`].

pub mod converter;

#[cfg(test)]
mod tests;

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use wd_protocol::error::status_code;
use wd_protocol::routes::{DEFAULT_BASE_PATH, route_to_command_name};
use wd_protocol::{
	Error, HttpMethod, Protocol, ProxyRequestError, Result, format_response_value, format_status,
	truncate_for_log,
};

use crate::sessions::sessions;

/// Default downstream request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(240_000);

const USER_AGENT_VALUE: &str = concat!("wd/", env!("CARGO_PKG_VERSION"));
const NON_SESSION_ENDPOINTS: &[&str] = &["/session", "/sessions", "/status"];
const COMPACT_ERROR_PATTERNS: &[&str] = &["ECONNREFUSED", "Connection refused", "socket hang up"];

static ABSOLUTE_URL_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(https?://.+)(/(session|status))").unwrap());
static STRIP_PREFIX_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^.*?(/(session|status).*)$").unwrap());
static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(/(session|status))").unwrap());
static SESSION_BASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^/session/([^/]+)").unwrap());
static SESSION_IN_URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/session/([^/]+)").unwrap());

/// Where and how to reach the downstream server.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
	pub scheme: String,
	pub server: String,
	pub port: u16,
	/// Base path of the downstream server.
	pub base: String,
	/// Base path of the requests being proxied, used to name commands.
	pub req_base_path: String,
	/// Downstream session id, when already known.
	pub session_id: Option<String>,
	pub timeout: Duration,
}

impl Default for ProxyOptions {
	fn default() -> Self {
		Self {
			scheme: "http".to_string(),
			server: "localhost".to_string(),
			port: 4444,
			base: DEFAULT_BASE_PATH.to_string(),
			req_base_path: DEFAULT_BASE_PATH.to_string(),
			session_id: None,
			timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

/// Forwards WebDriver requests to a downstream server.
#[derive(Debug)]
pub struct JwpProxy {
	scheme: String,
	server: String,
	port: u16,
	base: String,
	req_base_path: String,
	client: reqwest::Client,
	session_id: RwLock<Option<String>>,
	downstream_protocol: RwLock<Option<Protocol>>,
	active: DashMap<u64, AbortHandle>,
	next_request_id: AtomicU64,
}

impl JwpProxy {
	pub fn new(opts: ProxyOptions) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(opts.timeout)
			.build()
			.map_err(Error::from_other)?;
		Ok(Self {
			scheme: opts.scheme.to_lowercase(),
			server: opts.server,
			port: opts.port,
			base: opts.base,
			req_base_path: opts.req_base_path,
			client,
			session_id: RwLock::new(opts.session_id),
			downstream_protocol: RwLock::new(None),
			active: DashMap::new(),
			next_request_id: AtomicU64::new(0),
		})
	}

	pub fn session_id(&self) -> Option<String> {
		self.session_id.read().clone()
	}

	pub fn set_session_id(&self, id: Option<String>) {
		*self.session_id.write() = id;
	}

	/// Dialect of the downstream server, once a successful response revealed it.
	pub fn downstream_protocol(&self) -> Option<Protocol> {
		*self.downstream_protocol.read()
	}

	pub fn set_downstream_protocol(&self, protocol: Option<Protocol>) {
		*self.downstream_protocol.write() = protocol;
	}

	pub fn active_requests_count(&self) -> usize {
		self.active.len()
	}

	/// Aborts every in-flight downstream request; their callers get an error.
	pub fn cancel_active_requests(&self) -> usize {
		let ids: Vec<u64> = self.active.iter().map(|entry| *entry.key()).collect();
		let mut cancelled = 0;
		for id in ids {
			if let Some((_, handle)) = self.active.remove(&id) {
				handle.abort();
				cancelled += 1;
			}
		}
		if cancelled > 0 {
			info!(target = "wd.proxy", cancelled, "cancelled active downstream requests");
		}
		cancelled
	}

	/// Maps a route-relative or absolute URL onto the downstream server.
	pub fn url_for_proxy(&self, url: &str) -> Result<String> {
		let url = if url.is_empty() { "/" } else { url };
		let proxy_base = format!("{}://{}:{}{}", self.scheme, self.server, self.port, self.base);

		let mut remaining = if url.starts_with("http") {
			let Some(caps) = ABSOLUTE_URL_RE.captures(url) else {
				return Err(Error::unknown("Got a complete url but could not extract JWP endpoint"));
			};
			url.replacen(&caps[1], "", 1)
		} else if url.starts_with('/') {
			url.to_string()
		} else {
			return Err(Error::unknown(format!("Did not know what to do with url '{url}'")));
		};

		if let Some(caps) = STRIP_PREFIX_RE.captures(&remaining) {
			remaining = caps[1].to_string();
		}

		let session_id = self.session_id();
		if !ENDPOINT_RE.is_match(&remaining) {
			let id = session_id.as_deref().unwrap_or("null");
			remaining = format!("/session/{id}{remaining}");
		}

		let requires_session_id = !NON_SESSION_ENDPOINTS.contains(&remaining.as_str());
		if requires_session_id && session_id.is_none() {
			return Err(Error::unknown("Trying to proxy a session command without session id"));
		}

		let session_end = SESSION_BASE_RE.captures(&remaining).map(|caps| caps[0].len());
		match (session_end, session_id) {
			(Some(end), Some(id)) => remaining = format!("/session/{id}{}", &remaining[end..]),
			(Some(_), None) => {}
			(None, _) if requires_session_id => {
				return Err(Error::unknown(format!(
					"Could not find :session section for url: {remaining}"
				)));
			}
			(None, _) => {}
		}
		if remaining.ends_with('/') {
			remaining.pop();
		}

		Ok(format!("{proxy_base}{remaining}"))
	}

	/// Sends one request downstream and returns `(http status, body object)`.
	///
	/// Non-2xx responses, non-object bodies and non-zero MJSONWP statuses are
	/// returned as [`ProxyRequestError`]s holding the downstream body.
	pub async fn proxy(&self, url: &str, method: HttpMethod, body: Option<Value>) -> Result<(u16, Value)> {
		let new_url = self.url_for_proxy(url)?;
		let body = match body {
			Some(Value::Null) | None => None,
			Some(_) if method == HttpMethod::Get => None,
			Some(Value::String(raw)) => Some(serde_json::from_str::<Value>(&raw).map_err(|_| {
				Error::unknown(format!(
					"Cannot interpret the request body as valid JSON: {}",
					truncate_for_log(&raw)
				))
			})?),
			Some(other) => Some(other),
		};

		let shown_url = if url.is_empty() { "/" } else { url };
		match &body {
			Some(b) => debug!(
				target = "wd.proxy",
				"Proxying [{} {shown_url}] to [{} {new_url}] with body: {}",
				method.as_str(),
				method.as_str(),
				truncate_for_log(&b.to_string())
			),
			None => debug!(
				target = "wd.proxy",
				"Proxying [{} {shown_url}] to [{} {new_url}] with no body",
				method.as_str(),
				method.as_str()
			),
		}

		let mut request = self
			.client
			.request(reqwest_method(method), &new_url)
			.header(CONTENT_TYPE, "application/json; charset=utf-8")
			.header(USER_AGENT, USER_AGENT_VALUE)
			.header(ACCEPT, "application/json, */*");
		if let Some(b) = &body {
			request = request.body(b.to_string());
		}

		let (status, text) = self.send(request).await.map_err(|message| {
			if COMPACT_ERROR_PATTERNS.iter().any(|p| message.contains(p)) {
				info!(target = "wd.proxy", "{message}");
			} else {
				info!(target = "wd.proxy", error = %message, "downstream request failed");
			}
			Error::from(ProxyRequestError::new(
				Some(format!(
					"Could not proxy command to the remote server. Original error: {message}"
				)),
				None,
				None,
			))
		})?;

		let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
		debug!(
			target = "wd.proxy",
			"Got response with status {status}: {}",
			truncate_for_log(&data.to_string())
		);

		if !(200..300).contains(&status) {
			return Err(ProxyRequestError::new(
				Some(format!("Request failed with status code {status}")),
				Some(&data),
				Some(status),
			)
			.into());
		}
		if !data.is_object() {
			return Err(failed_request(url, &data));
		}

		if method == HttpMethod::Post && url.ends_with("/session") {
			if status == 200 {
				let id = data
					.get("sessionId")
					.and_then(Value::as_str)
					.or_else(|| data.pointer("/value/sessionId").and_then(Value::as_str))
					.map(str::to_string);
				self.set_session_id(id);
			}
			let protocol = protocol_from_body(&data);
			self.set_downstream_protocol(protocol);
			info!(
				target = "wd.proxy",
				protocol = protocol.map_or("unknown", Protocol::as_str),
				"determined the downstream protocol"
			);
		}

		if let Some(s) = data.get("status") {
			if status_code(s) != Some(0) {
				return Err(failed_request(url, &data));
			}
		}

		if self.downstream_protocol().is_none() {
			if let Some(protocol) = protocol_from_body(&data) {
				self.set_downstream_protocol(Some(protocol));
				info!(
					target = "wd.proxy",
					protocol = protocol.as_str(),
					"inferred the downstream protocol from a response"
				);
			}
		}

		Ok((status, data))
	}

	/// Names the command behind `url`, trying it as base-relative, then session-relative.
	pub fn request_to_command_name(&self, url: &str, method: HttpMethod) -> Option<&'static str> {
		let base = &self.req_base_path;
		let method = method.as_str();
		let extract = |pattern: String| {
			let re = Regex::new(&pattern).ok()?;
			let caps = re.captures(url)?;
			route_to_command_name(&caps[1], method, base)
		};

		route_to_command_name(url, method, base)
			.or_else(|| {
				url.contains(&format!("{base}/session/"))
					.then(|| extract(format!("{}/session/[^/]+(.+)", regex::escape(base))))
					.flatten()
			})
			.or_else(|| {
				url.contains(base.as_str())
					.then(|| extract(format!("{}(/.+)", regex::escape(base))))
					.flatten()
			})
	}

	/// Forwards a request, adapting it to the downstream dialect when the command is known.
	pub async fn proxy_command(&self, url: &str, method: HttpMethod, body: Option<Value>) -> Result<(u16, Value)> {
		match self.request_to_command_name(url, method) {
			Some(command) => {
				debug!(target = "wd.proxy", command, "matched '{url}' to command name");
				converter::convert_and_proxy(self, command, url, method, body).await
			}
			None => self.proxy(url, method, body).await,
		}
	}

	/// Forwards a request and returns the unwrapped `value`, or the typed error it carries.
	pub async fn command(&self, url: &str, method: HttpMethod, body: Option<Value>) -> Result<Value> {
		let (status, body) = match self.proxy_command(url, method, body).await {
			Ok(response) => response,
			Err(Error::ProxyRequest(err)) => return Err(err.actual_error()),
			Err(err) => return Err(err),
		};

		match protocol_from_body(&body) {
			Some(Protocol::Mjsonwp) => {
				let code = body.get("status").and_then(status_code).unwrap_or_default();
				if status == 200 && code == 0 {
					return Ok(take_value(body));
				}
				if code != 0 {
					let value = body.get("value").cloned().unwrap_or(Value::Null);
					return Err(Error::from_jsonwp_code(code, &value));
				}
			}
			Some(Protocol::W3c) => {
				if status < 300 {
					return Ok(take_value(body));
				}
				if let Some(Value::Object(value)) = body.get("value") {
					if let Some(code) = value.get("error").and_then(Value::as_str) {
						let message = value.get("message").and_then(Value::as_str);
						let stacktrace = value.get("stacktrace").and_then(Value::as_str).map(str::to_string);
						return Err(Error::from_w3c_code(code, message, stacktrace));
					}
				}
			}
			None if status == 200 => return Ok(body),
			None => {}
		}

		let shown: String = body.to_string().chars().take(300).collect();
		Err(Error::unknown(format!(
			"Did not know what to do with response code '{status}' and response body '{shown}'"
		)))
	}

	/// Forwards a client request verbatim and shapes the reply for that client.
	///
	/// The downstream session id in the reply is replaced with the client's, element
	/// references are normalized, and `status` is formatted for the client's dialect.
	pub async fn proxy_req_res(&self, method: HttpMethod, url: &str, body: Option<Value>) -> Result<(u16, Value)> {
		let (status, mut data) = self.proxy_command(url, method, body).await?;

		let req_session_id = session_id_from_url(url);
		if let Some(obj) = data.as_object_mut() {
			if obj.contains_key("sessionId") {
				let replacement = req_session_id.clone().or_else(|| self.session_id());
				if let Some(id) = replacement {
					debug!(target = "wd.proxy", "Replacing sessionId {} with {id}", obj["sessionId"]);
					obj.insert("sessionId".to_string(), Value::String(id));
				}
			}
			if let Some(value) = obj.get_mut("value") {
				*value = format_response_value(value.take());
			}
		}

		let upstream = req_session_id.as_deref().and_then(|id| sessions().get_protocol(id));
		format_status(&mut data, status, upstream);
		Ok((status, data))
	}

	async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<(u16, String), String> {
		let task = tokio::spawn(async move {
			let response = request.send().await?;
			let status = response.status().as_u16();
			let text = response.text().await?;
			Ok::<_, reqwest::Error>((status, text))
		});

		let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
		self.active.insert(id, task.abort_handle());
		let _guard = ActiveRequest { id, active: &self.active };

		match task.await {
			Ok(Ok(response)) => Ok(response),
			Ok(Err(err)) => Err(describe_reqwest_error(&err)),
			Err(err) if err.is_cancelled() => Err("The request was cancelled".to_string()),
			Err(err) => Err(err.to_string()),
		}
	}
}

/// Removes a request from the active set when it settles.
struct ActiveRequest<'a> {
	id: u64,
	active: &'a DashMap<u64, AbortHandle>,
}

impl Drop for ActiveRequest<'_> {
	fn drop(&mut self) {
		self.active.remove(&self.id);
	}
}

/// Dialect implied by a response body: integer `status` means MJSONWP, a `value` means W3C.
pub fn protocol_from_body(body: &Value) -> Option<Protocol> {
	let status = body.get("status");
	if status.is_some_and(|s| s.is_i64() || s.is_u64()) {
		Some(Protocol::Mjsonwp)
	} else if body.get("value").is_some() {
		Some(Protocol::W3c)
	} else {
		None
	}
}

pub fn session_id_from_url(url: &str) -> Option<String> {
	SESSION_IN_URL_RE.captures(url).map(|caps| caps[1].to_string())
}

fn failed_request(url: &str, data: &Value) -> Error {
	ProxyRequestError::new(Some(format!("The request to {url} has failed")), Some(data), Some(500)).into()
}

fn take_value(mut body: Value) -> Value {
	body.get_mut("value").map(Value::take).unwrap_or(Value::Null)
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
	match method {
		HttpMethod::Get => reqwest::Method::GET,
		HttpMethod::Post => reqwest::Method::POST,
		HttpMethod::Delete => reqwest::Method::DELETE,
	}
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
	use std::error::Error as _;

	let mut message = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		message.push_str(": ");
		message.push_str(&cause.to_string());
		source = cause.source();
	}
	message
}
