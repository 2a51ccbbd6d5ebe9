//! Wire envelopes for successes and failures.

use serde_json::{Map, Value, json};
use wd_protocol::{Error, ErrorKind, Protocol, ResponseBody, render_for_mjsonwp, render_for_w3c};
use wd_runtime::proxy::session_id_from_url;

use crate::http::HttpResponse;

/// `{status, value}` for MJSONWP and unknown dialects, `{value}` for W3C.
///
/// The legacy `status` is taken from the value itself when it carries one.
pub fn success_body(value: Value, protocol: Option<Protocol>) -> Value {
	let mut body = Map::new();
	if protocol != Some(Protocol::W3c) {
		let status = value
			.get("status")
			.filter(|s| !s.is_null())
			.cloned()
			.unwrap_or(json!(0));
		body.insert("status".to_string(), status);
	}
	body.insert("value".to_string(), value);
	Value::Object(body)
}

/// Renders `err` in the client's dialect.
///
/// With no known dialect both shapes are merged into one body, under the
/// MJSONWP HTTP status.
pub fn error_response(err: &Error, protocol: Option<Protocol>) -> HttpResponse {
	match protocol {
		Some(Protocol::W3c) => {
			let (status, body) = render_for_w3c(err);
			HttpResponse::json(status, body)
		}
		Some(Protocol::Mjsonwp) => {
			let (status, body) = render_for_mjsonwp(err);
			HttpResponse { status, body }
		}
		None => {
			let (status, legacy) = render_for_mjsonwp(err);
			let (_, w3c) = render_for_w3c(err);
			let mut merged = match legacy {
				ResponseBody::Json(Value::Object(obj)) => obj,
				_ => {
					let mut obj = Map::new();
					obj.insert("status".to_string(), json!(err.jsonwp_code()));
					obj
				}
			};
			if let Value::Object(w3c) = w3c {
				merged.extend(w3c);
			}
			HttpResponse::json(status, Value::Object(merged))
		}
	}
}

/// Sets `sessionId` on a JSON body.
///
/// A freshly created session id goes into `value` for W3C and the top level
/// otherwise; any other body carries the URL's session id (or null). W3C
/// bodies never keep a top-level `sessionId`.
pub fn attach_session_id(
	response: &mut HttpResponse,
	protocol: Option<Protocol>,
	url_session_id: Option<&str>,
	new_session_id: Option<&str>,
) {
	let ResponseBody::Json(Value::Object(body)) = &mut response.body else {
		return;
	};
	let w3c = protocol == Some(Protocol::W3c);
	match new_session_id {
		Some(id) if w3c => {
			if let Some(Value::Object(value)) = body.get_mut("value") {
				value.insert("sessionId".to_string(), json!(id));
			}
		}
		Some(id) => {
			body.insert("sessionId".to_string(), json!(id));
		}
		None => {
			body.insert("sessionId".to_string(), json!(url_session_id));
		}
	}
	if w3c {
		body.shift_remove("sessionId");
	}
}

/// 404 body for requests matching no route.
pub fn unknown_command(path: &str) -> HttpResponse {
	let kind = ErrorKind::UnknownCommand;
	HttpResponse::json(
		kind.w3c_status(),
		json!({
			"status": kind.jsonwp_code(),
			"value": {
				"error": kind.w3c_error(),
				"message": "The requested resource could not be found, or a request was received using an \
				            HTTP method that is not supported by the mapped resource",
				"stacktrace": "",
			},
			"sessionId": session_id_from_url(path),
		}),
	)
}
