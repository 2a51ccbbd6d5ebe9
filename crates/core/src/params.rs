//! Payload shape checks and positional argument construction.

use serde_json::{Map, Value};
use tracing::info;
use wd_protocol::{Error, PayloadParams, Protocol, Required, Result};

/// Accepted on every route; some clients echo them in the body.
const IMPLICIT_OPTIONAL: [&str; 2] = ["sessionId", "id"];

/// Boxes a bare array or primitive body under the route's `wrap` key.
pub fn wrap_params(params: &PayloadParams, body: Value) -> Value {
	match params.wrap {
		Some(key) if !body.is_object() => {
			let mut wrapped = Map::new();
			wrapped.insert(key.to_string(), body);
			Value::Object(wrapped)
		}
		_ => body,
	}
}

/// Unboxes a `{key: {...}}` envelope when the route declares `unwrap`.
pub fn unwrap_params(params: &PayloadParams, body: Value) -> Value {
	let Some(key) = params.unwrap else {
		return body;
	};
	match body {
		Value::Object(mut obj) if obj.get(key).is_some_and(truthy) => obj.shift_remove(key).unwrap_or(Value::Null),
		other => other,
	}
}

/// Checks `body` against the route's parameter rules and drops unknown keys.
///
/// A custom validator runs first. Without required sets, only unknown keys are
/// dropped. Otherwise the first required set fully present in `body` wins.
pub fn check_params(params: &PayloadParams, body: &Value, protocol: Option<Protocol>) -> Result<Value> {
	if let Some(validate) = params.validate {
		if let Some(message) = validate(body, protocol) {
			return Err(Error::bad_parameters_message(body, &message));
		}
	}

	let received: Vec<String> = body
		.as_object()
		.map(|obj| obj.keys().cloned().collect())
		.unwrap_or_default();
	let mut optional: Vec<&str> = params.optional.to_vec();
	for name in IMPLICIT_OPTIONAL {
		if !optional.contains(&name) {
			optional.push(name);
		}
	}

	let sets = params.required.sets();
	if sets.is_empty() {
		return Ok(pick_known(body, |name| optional.contains(&name)));
	}

	let mut reported: &[&str] = &[];
	for set in sets {
		if set.iter().all(|name| received.iter().any(|r| r == name)) {
			return Ok(pick_known(body, |name| set.contains(&name) || optional.contains(&name)));
		}
		if !set.is_empty() && reported.is_empty() {
			reported = set;
		}
	}
	Err(Error::bad_parameters(reported, &optional, &received))
}

/// Builds the positional argument list for a command.
///
/// Required then optional body values (or the route's own builder), followed by
/// URL params in reverse template order so `sessionId` always comes last.
pub fn make_args(
	url_params: &[(&str, String)],
	body: &Value,
	params: &PayloadParams,
	protocol: Option<Protocol>,
) -> Vec<Value> {
	let mut args = match params.make_args {
		Some(build) => build(body, protocol),
		None => {
			let required: &[&str] = match params.required {
				Required::None => &[],
				Required::All(names) => names,
				Required::AnyOf(sets) => sets
					.iter()
					.copied()
					.find(|set| set.iter().all(|name| body.get(*name).is_some()))
					.unwrap_or(&[]),
			};
			required
				.iter()
				.chain(params.optional)
				.map(|name| body.get(*name).cloned().unwrap_or(Value::Null))
				.collect()
		}
	};
	args.extend(url_params.iter().rev().map(|(_, value)| Value::String(value.clone())));
	args
}

/// Validates the arguments of an `execute`-style method call.
///
/// `params` must be a list of zero or one plain objects. The object is checked
/// against `spec` (unknown keys dropped) and turned into positional arguments.
pub fn validate_execute_method_params(params: &Value, spec: Option<&PayloadParams>) -> Result<Vec<Value>> {
	let items = match params {
		Value::Array(items) if items.len() <= 1 => items,
		_ => {
			return Err(Error::invalid_argument(format!(
				"Did not get correct format of arguments for execute method. Expected zero or one \
				 arguments to execute script and instead received: {params}"
			)));
		}
	};
	let args = match items.first() {
		None | Some(Value::Null) => Value::Object(Map::new()),
		Some(obj @ Value::Object(_)) => obj.clone(),
		Some(_) => {
			return Err(Error::invalid_argument(
				"Did not receive an appropriate execute method parameters object. It needs to be \
				 deserializable as a plain JS object",
			));
		}
	};

	let spec = spec.copied().unwrap_or(PayloadParams::EMPTY);
	let filtered = check_params(&spec, &args, None)?;
	Ok(make_args(&[], &filtered, &spec, None))
}

fn pick_known(body: &Value, is_known: impl Fn(&str) -> bool) -> Value {
	let Some(obj) = body.as_object() else {
		return body.clone();
	};
	let unknown: Vec<&str> = obj.keys().map(String::as_str).filter(|k| !is_known(*k)).collect();
	if unknown.is_empty() {
		return body.clone();
	}
	info!(
		target = "wd.dispatch",
		"The following arguments are not known and will be ignored: {}",
		unknown.join(",")
	);
	let kept: Map<String, Value> = obj
		.iter()
		.filter(|(k, _)| is_known(k.as_str()))
		.map(|(k, v)| (k.clone(), v.clone()))
		.collect();
	Value::Object(kept)
}

fn truthy(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
		Value::String(s) => !s.is_empty(),
		_ => true,
	}
}
