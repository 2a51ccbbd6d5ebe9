//! Protocol error taxonomy.
//!
//! Every failure that reaches a client is expressed as one of a closed set of
//! [`ErrorKind`]s. A kind carries its MJSONWP status code, its W3C error string,
//! the HTTP status used in W3C mode, and a default message. [`render_for_w3c`] and
//! [`render_for_mjsonwp`] turn an [`Error`] into the wire shape of either dialect.


use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::protocol::ResponseBody;

pub type Result<T> = std::result::Result<T, Error>;

const UNKNOWN_ERROR_CODE: i64 = 13;

macro_rules! error_kinds {
	(
		$(
			$kind:ident => ($code:literal, $w3c:literal, $status:literal, $message:literal)
		),+ $(,)?
	) => {
		/// Closed set of protocol error kinds.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum ErrorKind { $($kind),+ }

		impl ErrorKind {
			/// Every kind, in declaration order.
			pub const ALL: &'static [ErrorKind] = &[$(ErrorKind::$kind),+];

			/// MJSONWP numeric status code.
			pub const fn jsonwp_code(self) -> i64 {
				match self { $(ErrorKind::$kind => $code),+ }
			}

			/// W3C error string (lowercase, space separated).
			pub const fn w3c_error(self) -> &'static str {
				match self { $(ErrorKind::$kind => $w3c),+ }
			}

			/// HTTP status used when rendering for W3C clients.
			pub const fn w3c_status(self) -> u16 {
				match self { $(ErrorKind::$kind => $status),+ }
			}

			/// Message used when no custom message was supplied.
			pub const fn default_message(self) -> &'static str {
				match self { $(ErrorKind::$kind => $message),+ }
			}
		}
	};
}

error_kinds! {
	NoSuchDriver => (6, "invalid session id", 404, "A session is either terminated or not started"),
	NoSuchElement => (7, "no such element", 404, "An element could not be located on the page using the given search parameters."),
	NoSuchFrame => (8, "no such frame", 404, "A request to switch to a frame could not be satisfied because the frame could not be found."),
	UnknownCommand => (9, "unknown command", 404, "The requested resource could not be found, or a request was received using an HTTP method that is not supported by the mapped resource."),
	StaleElementReference => (10, "stale element reference", 404, "An element command failed because the referenced element is no longer attached to the DOM."),
	ElementNotVisible => (11, "element not visible", 400, "An element command could not be completed because the element is not visible on the page."),
	InvalidElementState => (12, "invalid element state", 400, "An element command could not be completed because the element is in an invalid state (e.g. attempting to click a disabled element)."),
	UnknownError => (13, "unknown error", 500, "An unknown server-side error occurred while processing the command."),
	UnknownMethod => (405, "unknown method", 405, "The requested command matched a known URL but did not match an method for that URL"),
	UnsupportedOperation => (405, "unsupported operation", 500, "A server-side error occurred. Command cannot be supported."),
	ElementIsNotSelectable => (15, "element not selectable", 400, "An attempt was made to select an element that cannot be selected."),
	ElementClickIntercepted => (64, "element click intercepted", 400, "The Element Click command could not be completed because the element receiving the events is obscuring the element that was requested clicked"),
	ElementNotInteractable => (60, "element not interactable", 400, "A command could not be completed because the element is not pointer- or keyboard interactable"),
	InsecureCertificate => (15, "insecure certificate", 400, "Navigation caused the user agent to hit a certificate warning, which is usually the result of an expired or invalid TLS certificate"),
	JavaScript => (17, "javascript error", 500, "An error occurred while executing user supplied JavaScript."),
	XPathLookup => (19, "invalid selector", 400, "An error occurred while searching for an element by XPath."),
	Timeout => (21, "timeout", 408, "An operation did not complete before its timeout expired."),
	NoSuchWindow => (23, "no such window", 404, "A request to switch to a different window could not be satisfied because the window could not be found."),
	InvalidArgument => (61, "invalid argument", 400, "The arguments passed to the command are either invalid or malformed"),
	InvalidCookieDomain => (24, "invalid cookie domain", 400, "An illegal attempt was made to set a cookie under a different domain than the current page."),
	NoSuchCookie => (62, "no such cookie", 404, "No cookie matching the given path name was found amongst the associated cookies of the current browsing context's active document"),
	UnableToSetCookie => (25, "unable to set cookie", 500, "A request to set a cookie's value could not be satisfied."),
	UnexpectedAlertOpen => (26, "unexpected alert open", 500, "A modal dialog was open, blocking this operation"),
	NoSuchAlert => (27, "no such alert", 404, "An attempt was made to operate on a modal dialog when one was not open."),
	ScriptTimeout => (28, "script timeout", 408, "A script did not complete before its timeout expired."),
	InvalidCoordinates => (29, "invalid coordinates", 400, "The coordinates provided to an interactions operation are invalid."),
	ImeNotAvailable => (30, "unsupported operation", 500, "IME was not available."),
	ImeEngineActivationFailed => (31, "unsupported operation", 500, "An IME engine could not be started."),
	InvalidSelector => (32, "invalid selector", 400, "Argument was an invalid selector (e.g. XPath/CSS)."),
	SessionNotCreated => (33, "session not created", 500, "A new session could not be created."),
	MoveTargetOutOfBounds => (34, "move target out of bounds", 500, "Target provided for a move action is out of bounds."),
	NoSuchContext => (35, "unknown error", 400, "No such context found."),
	InvalidContext => (36, "unknown error", 400, "That command could not be executed in the current context."),
	NotYetImplemented => (405, "unknown method", 405, "Method has not yet been implemented"),
	NotImplemented => (405, "unknown method", 405, "Method is not implemented"),
	UnableToCaptureScreen => (63, "unable to capture screen", 500, "A screen capture was made impossible"),
}

impl ErrorKind {
	/// Resolves a bare MJSONWP status code to its canonical kind.
	///
	/// Codes shared by several kinds resolve to the kind registered last for that
	/// code. `0` (success) and `13` (generic unknown) have no dedicated kind.
	pub fn from_jsonwp_code(code: i64) -> Option<Self> {
		use ErrorKind::*;
		let kind = match code {
			6 => NoSuchDriver,
			7 => NoSuchElement,
			8 => NoSuchFrame,
			9 => UnknownCommand,
			10 => StaleElementReference,
			11 => ElementNotVisible,
			12 => InvalidElementState,
			15 => ElementIsNotSelectable,
			17 => JavaScript,
			19 => XPathLookup,
			21 => Timeout,
			23 => NoSuchWindow,
			24 => InvalidCookieDomain,
			25 => UnableToSetCookie,
			26 => UnexpectedAlertOpen,
			27 => NoSuchAlert,
			28 => ScriptTimeout,
			29 => InvalidCoordinates,
			30 => ImeNotAvailable,
			31 => ImeEngineActivationFailed,
			32 => InvalidSelector,
			33 => SessionNotCreated,
			34 => MoveTargetOutOfBounds,
			35 => NoSuchContext,
			36 => InvalidContext,
			60 => ElementNotInteractable,
			61 => InvalidArgument,
			62 => NoSuchCookie,
			63 => UnableToCaptureScreen,
			64 => ElementClickIntercepted,
			405 => UnsupportedOperation,
			_ => return None,
		};
		Some(kind)
	}

	/// Resolves a W3C error string (case-insensitive) to its canonical kind.
	pub fn from_w3c_error(error: &str) -> Option<Self> {
		use ErrorKind::*;
		let kind = match error.to_lowercase().as_str() {
			"invalid session id" => NoSuchDriver,
			"no such element" => NoSuchElement,
			"no such frame" => NoSuchFrame,
			"unknown command" => UnknownCommand,
			"stale element reference" => StaleElementReference,
			"element not visible" => ElementNotVisible,
			"invalid element state" => InvalidElementState,
			"unknown error" => UnknownError,
			"unknown method" => UnknownMethod,
			"unsupported operation" => UnsupportedOperation,
			"element not selectable" => ElementIsNotSelectable,
			"element click intercepted" => ElementClickIntercepted,
			"element not interactable" => ElementNotInteractable,
			"insecure certificate" => InsecureCertificate,
			"javascript error" => JavaScript,
			"invalid selector" => InvalidSelector,
			"timeout" => Timeout,
			"no such window" => NoSuchWindow,
			"invalid argument" => InvalidArgument,
			"invalid cookie domain" => InvalidCookieDomain,
			"no such cookie" => NoSuchCookie,
			"unable to set cookie" => UnableToSetCookie,
			"unexpected alert open" => UnexpectedAlertOpen,
			"no such alert" => NoSuchAlert,
			"script timeout" => ScriptTimeout,
			"invalid coordinates" => InvalidCoordinates,
			"session not created" => SessionNotCreated,
			"move target out of bounds" => MoveTargetOutOfBounds,
			"unable to capture screen" => UnableToCaptureScreen,
			_ => return None,
		};
		Some(kind)
	}

	/// HTTP status used when rendering this kind for MJSONWP clients.
	pub const fn jsonwp_http_status(self) -> u16 {
		match self {
			ErrorKind::NotYetImplemented | ErrorKind::NotImplemented => 501,
			ErrorKind::NoSuchDriver => 404,
			_ => 500,
		}
	}
}

/// A protocol-level failure.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// A typed error from the closed taxonomy.
	#[error("{message}")]
	Protocol {
		kind: ErrorKind,
		message: String,
		stacktrace: Option<String>,
	},

	/// Request payload did not match the route's parameter spec.
	///
	/// Renders as `invalid argument` for W3C and as a plain-text 400 for MJSONWP.
	#[error("{0}")]
	BadParameters(String),

	/// A downstream server answered with an error body.
	#[error(transparent)]
	ProxyRequest(#[from] ProxyRequestError),
}

impl Error {
	/// Creates an error of `kind` with its default message.
	pub fn new(kind: ErrorKind) -> Self {
		Self::Protocol {
			kind,
			message: kind.default_message().to_string(),
			stacktrace: None,
		}
	}

	/// Creates an error of `kind`; an empty message falls back to the default.
	pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
		let message = message.into();
		match kind {
			ErrorKind::UnknownError => Self::unknown(message),
			ErrorKind::SessionNotCreated => Self::session_not_created(message),
			_ if message.is_empty() => Self::new(kind),
			_ => Self::Protocol {
				kind,
				message,
				stacktrace: None,
			},
		}
	}

	/// Wraps an arbitrary cause as `UnknownError`.
	pub fn unknown(cause: impl std::fmt::Display) -> Self {
		let cause = cause.to_string();
		let mut message = ErrorKind::UnknownError.default_message().to_string();
		if !cause.is_empty() {
			message.push_str(" Original error: ");
			message.push_str(&cause);
		}
		Self::Protocol {
			kind: ErrorKind::UnknownError,
			message,
			stacktrace: None,
		}
	}

	/// `SessionNotCreated` with optional details appended to the default message.
	pub fn session_not_created(details: impl std::fmt::Display) -> Self {
		let details = details.to_string();
		let mut message = ErrorKind::SessionNotCreated.default_message().to_string();
		if !details.is_empty() {
			message.push_str(" Details: ");
			message.push_str(&details);
		}
		Self::Protocol {
			kind: ErrorKind::SessionNotCreated,
			message,
			stacktrace: None,
		}
	}

	pub fn invalid_argument(message: impl Into<String>) -> Self {
		Self::with_message(ErrorKind::InvalidArgument, message)
	}

	pub fn no_such_driver(message: impl Into<String>) -> Self {
		Self::with_message(ErrorKind::NoSuchDriver, message)
	}

	/// Bad-parameters error listing what was missing, what is known, and what was sent.
	pub fn bad_parameters(required: &[&str], optional: &[&str], received: &[String]) -> Self {
		let missing: Vec<&str> = required
			.iter()
			.copied()
			.filter(|name| !received.iter().any(|r| r == name))
			.collect();

		let mut lines = Vec::with_capacity(4);
		if missing.is_empty() {
			lines.push("Some of the provided parameters are not known".to_string());
		} else {
			let noun = if missing.len() == 1 {
				"parameter is"
			} else {
				"parameters are"
			};
			lines.push(format!(
				"The following required {noun} missing: {}",
				to_json_list(&missing)
			));
		}
		if !required.is_empty() {
			lines.push(format!(
				"Known required parameters are: {}",
				to_json_list(required)
			));
		}
		let optional: Vec<&str> = optional
			.iter()
			.copied()
			.filter(|name| *name != "sessionId" && *name != "id")
			.collect();
		if !optional.is_empty() {
			lines.push(format!(
				"Known optional parameters are: {}",
				to_json_list(&optional)
			));
		}
		if received.is_empty() {
			lines.push("You have provided none".to_string());
		} else {
			lines.push(format!("You have provided: {}", to_json_list(received)));
		}
		Self::BadParameters(lines.join("\n"))
	}

	/// Bad-parameters error produced by a route's custom validator.
	pub fn bad_parameters_message(sent: &Value, message: &str) -> Self {
		Self::BadParameters(format!(
			"Parameters were incorrect. You sent {sent}, {message}"
		))
	}

	/// Rebuilds a typed error from an MJSONWP status code and response value.
	///
	/// Unknown codes (and the generic code 13) become `UnknownError`.
	pub fn from_jsonwp_code(code: i64, value: &Value) -> Self {
		let message = match value {
			Value::Object(obj) => obj
				.get("message")
				.and_then(Value::as_str)
				.map(str::to_string)
				.unwrap_or_else(|| value.to_string()),
			Value::String(s) => s.clone(),
			Value::Null => String::new(),
			other => other.to_string(),
		};
		match ErrorKind::from_jsonwp_code(code) {
			Some(kind) if code != UNKNOWN_ERROR_CODE => {
				debug!(target = "wd.errors", code, ?kind, "matched MJSONWP error code");
				Self::with_message(kind, message)
			}
			_ => {
				debug!(target = "wd.errors", code, "matched MJSONWP error code to UnknownError");
				Self::unknown(message)
			}
		}
	}

	/// Rebuilds a typed error from a W3C error string.
	///
	/// Unknown strings become `UnknownError`.
	pub fn from_w3c_code(code: &str, message: Option<&str>, stacktrace: Option<String>) -> Self {
		let message = message.unwrap_or_default();
		let err = match ErrorKind::from_w3c_error(code) {
			Some(kind) => {
				debug!(target = "wd.errors", code, ?kind, "matched W3C error code");
				Self::with_message(kind, message)
			}
			None => {
				debug!(target = "wd.errors", code, "matched W3C error code to UnknownError");
				Self::unknown(message)
			}
		};
		err.with_stacktrace(stacktrace)
	}

	/// Coerces any foreign error into the taxonomy as `UnknownError`.
	pub fn from_other<E: std::error::Error>(err: E) -> Self {
		Self::unknown(err)
	}

	pub fn with_stacktrace(self, stacktrace: Option<String>) -> Self {
		match self {
			Self::Protocol { kind, message, .. } => Self::Protocol {
				kind,
				message,
				stacktrace,
			},
			other => other,
		}
	}

	/// Kind used for rendering. Proxy errors report the kind they resolve to.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Protocol { kind, .. } => *kind,
			Self::BadParameters(_) => ErrorKind::InvalidArgument,
			Self::ProxyRequest(err) => err.actual_error().kind(),
		}
	}

	pub fn is_kind(&self, kind: ErrorKind) -> bool {
		matches!(self, Self::Protocol { kind: k, .. } if *k == kind)
	}

	pub fn message(&self) -> &str {
		match self {
			Self::Protocol { message, .. } => message,
			Self::BadParameters(message) => message,
			Self::ProxyRequest(err) => err.message(),
		}
	}

	/// Message without the `UnknownError` preamble, when one was added.
	pub fn cause(&self) -> &str {
		let message = self.message();
		match self {
			Self::Protocol {
				kind: ErrorKind::UnknownError,
				..
			} => message
				.split_once(" Original error: ")
				.map_or(message, |(_, cause)| cause),
			_ => message,
		}
	}

	pub fn stacktrace(&self) -> Option<&str> {
		match self {
			Self::Protocol { stacktrace, .. } => stacktrace.as_deref(),
			_ => None,
		}
	}

	pub fn jsonwp_code(&self) -> i64 {
		self.kind().jsonwp_code()
	}

	pub fn w3c_error(&self) -> &'static str {
		self.kind().w3c_error()
	}

	pub fn w3c_status(&self) -> u16 {
		match self {
			Self::BadParameters(_) => 400,
			_ => self.kind().w3c_status(),
		}
	}

	/// Resolves proxy errors to the typed error they carry.
	pub fn into_actual(self) -> Self {
		match self {
			Self::ProxyRequest(err) => err.actual_error(),
			other => other,
		}
	}
}

/// Shape of the body captured from a failed downstream call.
#[derive(Debug, Clone, PartialEq)]
enum DownstreamBody {
	Jsonwp(Map<String, Value>),
	W3c(Map<String, Value>),
}

/// Error wrapping a downstream server's failure response.
///
/// Holds the raw body so the typed error can be derived later, in the caller's
/// protocol, with [`ProxyRequestError::actual_error`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProxyRequestError {
	message: String,
	http_status: u16,
	body: DownstreamBody,
}

impl ProxyRequestError {
	/// Builds from an optional explicit message, the raw response and its HTTP status.
	///
	/// `response` may be a JSON object or a string holding JSON.
	pub fn new(message: Option<String>, response: Option<&Value>, http_status: Option<u16>) -> Self {
		let parsed = match response {
			Some(Value::Object(obj)) => obj.clone(),
			Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
				Ok(Value::Object(obj)) => obj,
				_ => Map::new(),
			},
			_ => Map::new(),
		};

		let mut orig_message = match response {
			Some(Value::String(raw)) => raw.clone(),
			_ => String::new(),
		};
		match parsed.get("value") {
			Some(Value::String(s)) => orig_message = s.clone(),
			Some(Value::Object(value)) => {
				if let Some(msg) = value.get("message").and_then(Value::as_str) {
					orig_message = msg.to_string();
				}
			}
			_ => {}
		}

		let message = match message {
			Some(m) if !m.is_empty() => m,
			_ => format!("Proxy request unsuccessful. {orig_message}"),
		};

		let is_w3c = matches!(parsed.get("value"), Some(Value::Object(v)) if v.contains_key("error"));
		let (body, http_status) = if is_w3c {
			(DownstreamBody::W3c(parsed), http_status.unwrap_or(400))
		} else {
			(DownstreamBody::Jsonwp(parsed), 400)
		};

		Self {
			message,
			http_status,
			body,
		}
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn http_status(&self) -> u16 {
		self.http_status
	}

	/// Whether the captured body actually describes a failure.
	pub fn is_failure(&self) -> bool {
		match &self.body {
			DownstreamBody::Jsonwp(body) => body
				.get("status")
				.is_some_and(|status| !status.is_null() && status.as_i64() != Some(0)),
			DownstreamBody::W3c(_) => self.http_status >= 300,
		}
	}

	/// Derives the typed error described by the downstream body.
	pub fn actual_error(&self) -> Error {
		match &self.body {
			DownstreamBody::Jsonwp(body) => {
				let status = body.get("status").and_then(status_code);
				let value = body.get("value").filter(|v| !v.is_null());
				if let (Some(status), Some(value)) = (status, value) {
					return Error::from_jsonwp_code(status, value);
				}
			}
			DownstreamBody::W3c(body) if self.http_status >= 300 => {
				if let Some(Value::Object(value)) = body.get("value") {
					let code = value.get("error").and_then(Value::as_str).unwrap_or_default();
					let message = value
						.get("message")
						.and_then(Value::as_str)
						.filter(|m| !m.is_empty())
						.unwrap_or(&self.message);
					let stacktrace = value
						.get("stacktrace")
						.and_then(Value::as_str)
						.map(str::to_string);
					return Error::from_w3c_code(code, Some(message), stacktrace);
				}
			}
			DownstreamBody::W3c(_) => {}
		}
		Error::unknown(&self.message)
	}
}

/// Reads an MJSONWP status that may arrive as a number or a numeric string.
pub fn status_code(value: &Value) -> Option<i64> {
	match value {
		Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

/// Renders an error as a W3C response: `(http status, {value: {error, message, stacktrace}})`.
pub fn render_for_w3c(err: &Error) -> (u16, Value) {
	let actual;
	let err = match err {
		Error::ProxyRequest(proxy) => {
			actual = proxy.actual_error();
			&actual
		}
		other => other,
	};
	if let Error::BadParameters(message) = err {
		debug!(target = "wd.errors", "bad parameters: {message}");
	}
	let body = json!({
		"value": {
			"error": err.w3c_error(),
			"message": err.message(),
			"stacktrace": err.stacktrace().unwrap_or_default(),
		}
	});
	(err.w3c_status(), body)
}

/// Renders an error as an MJSONWP response: `(http status, {status, value: {message}})`.
///
/// Bad parameters become a plain-text 400 body.
pub fn render_for_mjsonwp(err: &Error) -> (u16, ResponseBody) {
	let actual;
	let err = match err {
		Error::ProxyRequest(proxy) => {
			actual = proxy.actual_error();
			&actual
		}
		other => other,
	};
	match err {
		Error::BadParameters(message) => {
			debug!(target = "wd.errors", "bad parameters: {message}");
			(400, ResponseBody::Text(message.clone()))
		}
		_ => {
			let kind = err.kind();
			let body = json!({
				"status": kind.jsonwp_code(),
				"value": { "message": err.message() },
			});
			(kind.jsonwp_http_status(), ResponseBody::Json(body))
		}
	}
}

fn to_json_list<S: AsRef<str>>(items: &[S]) -> String {
	let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
	serde_json::to_string(&items).unwrap_or_default()
}
