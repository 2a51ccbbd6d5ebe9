//! Request pipeline from an HTTP route to a command and back.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Instrument, debug, error, info, warn};
use wd_protocol::error::status_code;
use wd_protocol::routes::{find_route, is_session_command};
use wd_protocol::{
	Error, ErrorKind, HttpMethod, Protocol, Result, RouteMatch, determine_protocol, format_response_value,
	truncate_for_log,
};
use wd_runtime::sessions;

use crate::http::{HttpRequest, HttpResponse};
use crate::params::{check_params, make_args, unwrap_params, wrap_params};
use crate::response::{attach_session_id, error_response, success_body, unknown_command};
use crate::target::CommandTarget;
use crate::validators::validate_command;

const CREATE_SESSION: &str = "createSession";
const DELETE_SESSION: &str = "deleteSession";

/// What a request resolved to before rendering.
enum Outcome {
	/// A command result, still to be wrapped.
	Value(Value),
	/// A downstream response, passed through as is.
	Proxied(u16, Value),
}

/// Per-request state that survives failures.
#[derive(Default)]
struct Exchange {
	protocol: Option<Protocol>,
	new_session_id: Option<String>,
}

/// Turns HTTP requests into commands on a [`CommandTarget`].
pub struct Dispatcher<T> {
	target: Arc<T>,
	base_path: String,
	deprecated_logged: Mutex<HashSet<&'static str>>,
}

impl<T: CommandTarget> Dispatcher<T> {
	/// Dispatcher serving routes at the root.
	pub fn new(target: Arc<T>) -> Self {
		Self {
			target,
			base_path: String::new(),
			deprecated_logged: Mutex::new(HashSet::new()),
		}
	}

	/// Serves every route under `base_path` (e.g. `/wd/hub`).
	pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
		self.base_path = base_path.into().trim_end_matches('/').to_string();
		self
	}

	pub fn target(&self) -> &Arc<T> {
		&self.target
	}

	pub fn base_path(&self) -> &str {
		&self.base_path
	}

	/// Handles one request. Never fails: every error becomes a response.
	pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
		let path = request.path.split('?').next().unwrap_or_default().to_string();
		let Some(route) = self
			.strip_base_path(&path)
			.and_then(|relative| find_route(relative, request.method))
		else {
			debug!(target = "wd.dispatch", method = request.method.as_str(), path = %path, "no route matched");
			return unknown_command(&path);
		};

		let session_id = route.session_id();
		let span = sessions().get_logger(session_id, self.target.protocol_for(session_id));
		self.handle_route(&request, &route, &path).instrument(span).await
	}

	async fn handle_route(&self, request: &HttpRequest, route: &RouteMatch, path: &str) -> HttpResponse {
		let session_id = route.session_id();
		let mut exchange = Exchange {
			protocol: self.resolve_protocol(session_id),
			new_session_id: None,
		};
		debug!(
			target = "wd.dispatch",
			"Calling {} {} with body: {}",
			request.method.as_str(),
			path,
			truncate_for_log(&request.body.to_string())
		);

		let mut response = match self.run(request, route, path, &mut exchange).await {
			Ok(Outcome::Proxied(status, body)) => return HttpResponse::json(status, body),
			Ok(Outcome::Value(value)) => HttpResponse::json(200, success_body(value, exchange.protocol)),
			Err(err) => {
				exchange.protocol = exchange.protocol.or_else(|| self.resolve_protocol(session_id));
				log_failure(&err);
				error_response(&err, exchange.protocol)
			}
		};
		attach_session_id(
			&mut response,
			exchange.protocol,
			session_id,
			exchange.new_session_id.as_deref(),
		);
		debug!(
			target = "wd.dispatch",
			status = response.status,
			protocol = exchange.protocol.map(Protocol::as_str),
			"Responding to client with: {}",
			truncate_for_log(&response.body_string())
		);
		response
	}

	async fn run(
		&self,
		request: &HttpRequest,
		route: &RouteMatch,
		path: &str,
		exchange: &mut Exchange,
	) -> Result<Outcome> {
		let spec = route.spec;
		let session_id = route.session_id();
		if spec.deprecated {
			if let Some(command) = spec.command {
				self.warn_deprecated(command, request, route);
			}
		}

		if is_session_command(spec.command) && !self.target.session_exists(session_id) {
			return Err(Error::new(ErrorKind::NoSuchDriver));
		}

		if self.should_proxy(request, route, path) {
			let body = (request.method != HttpMethod::Get).then(|| request.body.clone());
			let (status, body) = self
				.target
				.proxy_req_res(session_id, request.method, &request.path, body)
				.await
				.map_err(|err| match err {
					Error::ProxyRequest(_) => err,
					other => Error::unknown(format!("Could not proxy. Proxy error: {}", other.cause())),
				})?;
			return Ok(Outcome::Proxied(status, body));
		}

		let Some(command) = spec.command else {
			return Err(Error::new(ErrorKind::NotImplemented));
		};

		let params = spec.params();
		let body = unwrap_params(&params, wrap_params(&params, request.body.clone()));
		if command == CREATE_SESSION {
			exchange.protocol = Some(determine_protocol(&make_args(&route.params, &body, &params, None)));
		}
		let body = check_params(&params, &body, exchange.protocol)?;
		let args = make_args(&route.params, &body, &params, exchange.protocol);
		validate_command(command, &args)?;

		let reply = self.target.execute(command, args, session_id).await;
		exchange.protocol = reply
			.protocol
			.or_else(|| self.target.protocol_for(session_id))
			.or(exchange.protocol);
		let mut value = reply.result?;

		if command == CREATE_SESSION {
			value = self.created_session(value, exchange);
		}
		let value = if command == DELETE_SESSION {
			Value::Null
		} else {
			format_response_value(value)
		};
		check_embedded_error(&value)?;
		Ok(Outcome::Value(value))
	}

	/// Records the new session and shapes `[id, caps]` for the client.
	fn created_session(&self, value: Value, exchange: &mut Exchange) -> Value {
		let Value::Array(mut created) = value else {
			return value;
		};
		let caps = if created.len() > 1 { created.swap_remove(1) } else { Value::Null };
		let id = created.first().and_then(Value::as_str).map(str::to_string);
		if let Some(id) = &id {
			let protocol = exchange.protocol.unwrap_or(Protocol::Mjsonwp);
			sessions().put(id, protocol);
			exchange.protocol = Some(protocol);
			info!(target = "wd.dispatch", session = id.as_str(), protocol = protocol.as_str(), "session created");
		}
		exchange.new_session_id = id;
		match exchange.protocol {
			Some(Protocol::W3c) => serde_json::json!({ "capabilities": caps }),
			_ => caps,
		}
	}

	fn should_proxy(&self, request: &HttpRequest, route: &RouteMatch, path: &str) -> bool {
		let session_id = route.session_id();
		if !self.target.proxy_active(session_id) || route.spec.command == Some(DELETE_SESSION) {
			return false;
		}
		let relative = self.strip_base_path(path).unwrap_or(path);
		!self
			.target
			.proxy_route_is_avoided(session_id, request.method, relative, Some(&request.body))
	}

	fn warn_deprecated(&self, command: &'static str, request: &HttpRequest, route: &RouteMatch) {
		if !self.deprecated_logged.lock().insert(command) {
			return;
		}
		warn!(
			target = "wd.dispatch",
			command,
			"Command '{command}' has been deprecated and will be removed in a future version. This \
			 endpoint ({} {}) is only available in the legacy protocol.",
			request.method.as_str(),
			route.route.path
		);
	}

	fn resolve_protocol(&self, session_id: Option<&str>) -> Option<Protocol> {
		self.target
			.protocol_for(session_id)
			.or_else(|| session_id.and_then(|id| sessions().get_protocol(id)))
	}

	fn strip_base_path<'p>(&self, path: &'p str) -> Option<&'p str> {
		if self.base_path.is_empty() {
			return Some(path);
		}
		let rest = path.strip_prefix(&self.base_path)?;
		rest.starts_with('/').then_some(rest)
	}
}

/// Fails when a command result is itself an error envelope.
fn check_embedded_error(value: &Value) -> Result<()> {
	if value.is_null() {
		return Ok(());
	}
	if let Some(code) = value.get("status").and_then(status_code) {
		if code != 0 {
			return Err(Error::from_jsonwp_code(code, value.get("value").unwrap_or(&Value::Null)));
		}
	}
	if let Some(inner) = value.get("value").and_then(Value::as_object) {
		if let Some(code) = inner.get("error").and_then(Value::as_str) {
			let message = inner.get("message").and_then(Value::as_str);
			let stacktrace = inner.get("stacktrace").and_then(Value::as_str).map(str::to_string);
			return Err(Error::from_w3c_code(code, message, stacktrace));
		}
	}
	Ok(())
}

fn log_failure(err: &Error) {
	match err {
		Error::ProxyRequest(_) => debug!(target = "wd.dispatch", error = %err, "proxied request failed"),
		Error::BadParameters(_) => debug!(target = "wd.dispatch", error = %err, "rejected request parameters"),
		_ if err.is_kind(ErrorKind::UnknownError) => {
			error!(target = "wd.dispatch", error = %err, "Encountered internal error running command")
		}
		_ => info!(target = "wd.dispatch", kind = ?err.kind(), error = %err, "command failed"),
	}
}

#[cfg(test)]
mod tests;
