//! Transport-neutral request and response types.

use serde_json::{Map, Value};
use wd_protocol::{HttpMethod, ResponseBody};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// An incoming request. `path` includes the base path and may carry a query.
#[derive(Debug, Clone)]
pub struct HttpRequest {
	pub method: HttpMethod,
	pub path: String,
	pub body: Value,
}

impl HttpRequest {
	/// Request with an empty JSON object body.
	pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
		Self::with_body(method, path, Value::Object(Map::new()))
	}

	pub fn with_body(method: HttpMethod, path: impl Into<String>, body: Value) -> Self {
		Self {
			method,
			path: path.into(),
			body,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
	pub status: u16,
	pub body: ResponseBody,
}

impl HttpResponse {
	pub fn json(status: u16, body: Value) -> Self {
		Self {
			status,
			body: ResponseBody::Json(body),
		}
	}

	pub fn text(status: u16, body: impl Into<String>) -> Self {
		Self {
			status,
			body: ResponseBody::Text(body.into()),
		}
	}

	pub fn content_type(&self) -> &'static str {
		match self.body {
			ResponseBody::Json(_) => JSON_CONTENT_TYPE,
			ResponseBody::Text(_) => TEXT_CONTENT_TYPE,
		}
	}

	/// JSON body, if this is not a text response.
	pub fn json_body(&self) -> Option<&Value> {
		match &self.body {
			ResponseBody::Json(value) => Some(value),
			ResponseBody::Text(_) => None,
		}
	}

	/// Serialized body as sent on the wire.
	pub fn body_string(&self) -> String {
		match &self.body {
			ResponseBody::Json(value) => value.to_string(),
			ResponseBody::Text(text) => text.clone(),
		}
	}
}
