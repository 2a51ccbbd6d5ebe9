//! W3C capability processing.
//!
//! A capabilities request `{alwaysMatch, firstMatch}` is validated against a
//! [`Constraints`] schema and merged into a single matched set. See
//! [`process_capabilities`] for the full algorithm.


use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub type Caps = Map<String, Value>;

/// Extension prefix stripped from capability names.
pub const VENDOR_PREFIX: &str = "appium:";
/// Capability whose object value is promoted to the top level.
pub const OPTIONS_CAP: &str = "options";

/// Standard, non-prefixed capability names.
pub const STANDARD_CAPS: &[&str] = &[
	"browserName",
	"browserVersion",
	"platformName",
	"acceptInsecureCerts",
	"pageLoadStrategy",
	"proxy",
	"setWindowRect",
	"timeouts",
	"unhandledPromptBehavior",
];

/// Case-insensitive membership in [`STANDARD_CAPS`].
pub fn is_standard_cap(name: &str) -> bool {
	STANDARD_CAPS.iter().any(|cap| cap.eq_ignore_ascii_case(name))
}

/// Validation rules for a single capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraint {
	/// Value must be present and non-empty.
	pub presence: bool,
	pub is_string: bool,
	pub is_number: bool,
	pub is_boolean: bool,
	pub is_object: bool,
	pub is_array: bool,
	pub inclusion: Option<Vec<Value>>,
	pub inclusion_case_insensitive: Option<Vec<String>>,
}

impl Constraint {
	pub fn string() -> Self {
		Self {
			is_string: true,
			..Self::default()
		}
	}

	pub fn number() -> Self {
		Self {
			is_number: true,
			..Self::default()
		}
	}

	pub fn boolean() -> Self {
		Self {
			is_boolean: true,
			..Self::default()
		}
	}

	pub fn object() -> Self {
		Self {
			is_object: true,
			..Self::default()
		}
	}

	pub fn array() -> Self {
		Self {
			is_array: true,
			..Self::default()
		}
	}

	pub fn one_of<I, V>(values: I) -> Self
	where
		I: IntoIterator<Item = V>,
		V: Into<Value>,
	{
		Self {
			inclusion: Some(values.into_iter().map(Into::into).collect()),
			..Self::default()
		}
	}

	pub fn one_of_case_insensitive<I, S>(values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			inclusion_case_insensitive: Some(values.into_iter().map(Into::into).collect()),
			..Self::default()
		}
	}

	pub fn required(mut self) -> Self {
		self.presence = true;
		self
	}

	/// Checks `value` (absent when `None`) and appends failure reasons to `out`.
	fn check(&self, name: &str, value: Option<&Value>, skip_presence: bool, out: &mut Vec<String>) {
		if self.presence && !skip_presence && value.is_none_or(is_empty) {
			out.push(format!("'{name}' can't be blank"));
		}
		let Some(value) = value else {
			return;
		};

		if self.is_string && !value.is_string() {
			out.push(format!("'{name}' must be of type string"));
		}
		if self.is_number {
			match value {
				Value::Number(_) => {}
				Value::String(s) if is_numeric_string(s) => {
					warn!(target = "wd.caps", cap = name, "number capability passed in as string, functionality may be compromised");
				}
				_ => out.push(format!("'{name}' must be of type number")),
			}
		}
		if self.is_boolean {
			match value {
				Value::Bool(_) => {}
				Value::String(s) if matches!(s.as_str(), "true" | "false" | "") => {
					warn!(target = "wd.caps", cap = name, "boolean capability passed in as string, functionality may be compromised");
				}
				_ => out.push(format!("'{name}' must be of type boolean")),
			}
		}
		if self.is_object && !value.is_object() {
			out.push(format!("'{name}' must be of type object"));
		}
		if self.is_array && !value.is_array() {
			out.push(format!("'{name}' must be of type array"));
		}
		if let Some(allowed) = &self.inclusion {
			if !allowed.contains(value) {
				out.push(format!("'{name}' {} is not included in the list", display(value)));
			}
		}
		if let Some(allowed) = &self.inclusion_case_insensitive {
			match value {
				Value::String(s) => {
					if !allowed.iter().any(|a| a.eq_ignore_ascii_case(s)) {
						out.push(format!("'{name}' {s} not part of {}", allowed.join(",")));
					}
				}
				_ => out.push(format!("'{name}' unrecognised")),
			}
		}
	}
}

/// Ordered capability schema.
///
/// Keys can be added but an existing key's rules are never replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
	entries: Vec<(String, Constraint)>,
}

impl Constraints {
	pub fn new() -> Self {
		Self::default()
	}

	/// Constraints every driver starts from.
	pub fn base() -> Self {
		let mut c = Self::new();
		c.add("platformName", Constraint::string().required());
		for name in [
			"deviceName",
			"platformVersion",
			"automationName",
			"udid",
			"language",
			"locale",
		] {
			c.add(name, Constraint::string());
		}
		c.add("newCommandTimeout", Constraint::number());
		for name in [
			"autoLaunch",
			"autoWebview",
			"noReset",
			"fullReset",
			"eventTimings",
			"printPageSourceOnFindFailure",
		] {
			c.add(name, Constraint::boolean());
		}
		c.add("orientation", Constraint::one_of(["LANDSCAPE", "PORTRAIT"]));
		c
	}

	/// Adds `name` unless already constrained. Returns whether it was added.
	pub fn add(&mut self, name: impl Into<String>, constraint: Constraint) -> bool {
		let name = name.into();
		if self.contains(&name) {
			debug!(target = "wd.caps", cap = %name, "keeping inherited constraint");
			return false;
		}
		self.entries.push((name, constraint));
		true
	}

	/// Builder form of [`Constraints::add`].
	pub fn with(mut self, name: impl Into<String>, constraint: Constraint) -> Self {
		self.add(name, constraint);
		self
	}

	/// Adds every key of `other` not already present.
	pub fn extend(&mut self, other: Constraints) {
		for (name, constraint) in other.entries {
			self.add(name, constraint);
		}
	}

	pub fn get(&self, name: &str) -> Option<&Constraint> {
		self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Constraint)> {
		self.entries.iter().map(|(n, c)| (n.as_str(), c))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Copy without the keys present in `caps`.
	fn without_keys_of(&self, caps: &Caps) -> Self {
		Self {
			entries: self
				.entries
				.iter()
				.filter(|(name, _)| !caps.contains_key(name))
				.cloned()
				.collect(),
		}
	}
}

/// Validates `caps` against `constraints` and returns them unchanged.
///
/// Null-valued capabilities are treated as absent.
pub fn validate_caps(caps: &Value, constraints: &Constraints, skip_presence: bool) -> Result<Caps> {
	let Some(obj) = caps.as_object() else {
		return Err(Error::invalid_argument("must be a JSON object"));
	};

	let mut reasons = Vec::new();
	for (name, constraint) in constraints.iter() {
		let value = obj.get(name).filter(|v| !v.is_null());
		constraint.check(name, value, skip_presence, &mut reasons);
	}
	if reasons.is_empty() {
		Ok(obj.clone())
	} else {
		Err(Error::invalid_argument(reasons.join("; ")))
	}
}

/// Merges `secondary` into `primary`; a key present in both is an error.
pub fn merge_caps(primary: &Caps, secondary: &Caps) -> Result<Caps> {
	let mut result = primary.clone();
	for (name, value) in secondary {
		if primary.contains_key(name) {
			return Err(Error::invalid_argument(format!(
				"property '{name}' should not exist on both primary ({}) and secondary ({}) object",
				Value::Object(primary.clone()),
				Value::Object(secondary.clone()),
			)));
		}
		result.insert(name.clone(), value.clone());
	}
	Ok(result)
}

/// Strips [`VENDOR_PREFIX`] from every key.
///
/// A standard capability sent with the prefix is rejected.
pub fn strip_vendor_prefixes(caps: &Caps) -> Result<Caps> {
	let mut stripped = Caps::new();
	let mut bad_prefixed = Vec::new();
	for (name, value) in caps {
		match name.strip_prefix(VENDOR_PREFIX) {
			Some(bare) => {
				if is_standard_cap(bare) {
					bad_prefixed.push(bare.to_string());
				}
				stripped.insert(bare.to_string(), value.clone());
			}
			None => {
				stripped.insert(name.clone(), value.clone());
			}
		}
	}
	if !bad_prefixed.is_empty() {
		return Err(Error::invalid_argument(format!(
			"The capabilities {} are standard capabilities and should not have the \"{VENDOR_PREFIX}\" prefix",
			Value::from(bad_prefixed),
		)));
	}
	Ok(stripped)
}

/// Unprefixed names in `alwaysMatch` and every `firstMatch` entry that are not standard.
pub fn find_non_prefixed_caps(always_match: &Caps, first_match: &[Value]) -> Vec<String> {
	let mut found: Vec<String> = Vec::new();
	let entries = std::iter::once(always_match).chain(first_match.iter().filter_map(Value::as_object));
	for caps in entries {
		for name in caps.keys() {
			if !name.contains(':') && !is_standard_cap(name) && !found.contains(name) {
				found.push(name.clone());
			}
		}
	}
	found
}

/// Intermediate results of [`parse_caps`].
#[derive(Debug, Clone, Default)]
pub struct ParsedCaps {
	pub required_caps: Caps,
	pub all_first_match_caps: Vec<Value>,
	pub validated_first_match_caps: Vec<Caps>,
	pub matched_caps: Option<Caps>,
	pub validation_errors: Vec<String>,
}

/// Runs the W3C processing steps and keeps every intermediate result.
pub fn parse_caps(caps: &Value, constraints: &Constraints, should_validate: bool) -> Result<ParsedCaps> {
	let Some(request) = caps.as_object() else {
		return Err(Error::invalid_argument(
			"The capabilities argument was not valid for the following reason(s): \"capabilities\" must be a JSON object.",
		));
	};

	let required_caps = match request.get("alwaysMatch") {
		None | Some(Value::Null) => Caps::new(),
		Some(Value::Object(obj)) => obj.clone(),
		Some(_) => {
			return Err(Error::invalid_argument(
				"The capabilities.alwaysMatch argument was not valid for the following reason(s): \"capabilities.alwaysMatch\" must be a JSON object or undefined",
			));
		}
	};
	let mut all_first_match_caps = match request.get("firstMatch") {
		None | Some(Value::Null) => vec![Value::Object(Caps::new())],
		Some(Value::Array(items)) => items.clone(),
		Some(_) => {
			return Err(Error::invalid_argument(
				"The capabilities.firstMatch argument was not valid for the following reason(s): \"capabilities.firstMatch\" must be a JSON array or undefined",
			));
		}
	};
	if all_first_match_caps.is_empty() {
		warn!(
			target = "wd.caps",
			"the firstMatch array in the given capabilities has no entries, adding an empty one"
		);
		all_first_match_caps.push(Value::Object(Caps::new()));
	}

	let non_prefixed = find_non_prefixed_caps(&required_caps, &all_first_match_caps);
	if !non_prefixed.is_empty() {
		warn!(
			target = "wd.caps",
			caps = ?non_prefixed,
			"non-standard capabilities should have a vendor prefix"
		);
	}

	let mut stripped_required = strip_vendor_prefixes(&required_caps)?;
	let mut stripped_first_match = Vec::with_capacity(all_first_match_caps.len());
	for entry in &all_first_match_caps {
		stripped_first_match.push(match entry.as_object() {
			Some(obj) => Some(strip_vendor_prefixes(obj)?),
			None => None,
		});
	}

	if should_validate {
		stripped_required = validate_caps(&Value::Object(stripped_required), constraints, true)?;
	}
	let filtered = constraints.without_keys_of(&stripped_required);

	let mut validation_errors = Vec::new();
	let mut validated_first_match_caps = Vec::new();
	for entry in stripped_first_match {
		let Some(entry) = entry else {
			validation_errors.push("must be a JSON object".to_string());
			continue;
		};
		if !should_validate {
			validated_first_match_caps.push(entry);
			continue;
		}
		match validate_caps(&Value::Object(entry), &filtered, false) {
			Ok(valid) => validated_first_match_caps.push(valid),
			Err(err) => validation_errors.push(err.message().to_string()),
		}
	}

	let mut matched_caps = None;
	for entry in &validated_first_match_caps {
		match merge_caps(&stripped_required, entry) {
			Ok(merged) => {
				matched_caps = Some(merged);
				break;
			}
			Err(err) => {
				warn!(target = "wd.caps", "{}", err.message());
				validation_errors.push(err.message().to_string());
			}
		}
	}

	Ok(ParsedCaps {
		required_caps,
		all_first_match_caps,
		validated_first_match_caps,
		matched_caps,
		validation_errors,
	})
}

/// Validates a W3C capabilities request and returns the first successful match.
pub fn process_capabilities(caps: &Value, constraints: &Constraints, should_validate: bool) -> Result<Caps> {
	let parsed = parse_caps(caps, constraints, should_validate)?;
	if let Some(matched) = parsed.matched_caps {
		return Ok(matched);
	}

	let first_match_len = caps
		.get("firstMatch")
		.and_then(Value::as_array)
		.map_or(0, Vec::len);
	let message = if first_match_len > 1 {
		format!(
			"Could not find matching capabilities from {caps}:\n {}",
			parsed.validation_errors.join("\n")
		)
	} else {
		parsed.validation_errors.into_iter().next().unwrap_or_default()
	};
	Err(Error::invalid_argument(message))
}

/// Converts legacy string-encoded booleans and numbers for constrained caps.
pub fn fix_caps(mut caps: Caps, constraints: &Constraints) -> Caps {
	for (name, constraint) in constraints.iter() {
		let Some(Value::String(raw)) = caps.get(name) else {
			continue;
		};
		if constraint.is_boolean {
			let lowered = raw.to_lowercase();
			if lowered == "true" || lowered == "false" {
				warn!(target = "wd.caps", cap = name, "capability changed from string to boolean, this may cause unexpected behavior");
				caps.insert(name.to_string(), Value::Bool(lowered == "true"));
			}
		} else if constraint.is_number {
			let trimmed = raw.trim().to_string();
			let converted = match trimmed.parse::<i64>() {
				Ok(int) => Some(Value::from(int)),
				Err(_) => trimmed
					.parse::<f64>()
					.ok()
					.and_then(Number::from_f64)
					.map(Value::Number),
			};
			if let Some(value) = converted {
				warn!(target = "wd.caps", cap = name, from = %trimmed, to = %value, "capability changed from string to number, this may cause unexpected behavior");
				caps.insert(name.to_string(), value);
			}
		}
	}
	caps
}

/// Lifts the keys of an `options` object capability to the top level.
///
/// Prefixes inside `options` are stripped. Existing top-level keys are overwritten.
pub fn promote_options(caps: Caps) -> Result<Caps> {
	let options = match caps.get(OPTIONS_CAP) {
		None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(caps),
		Some(Value::String(s)) if s.is_empty() => return Ok(caps),
		Some(Value::Object(options)) => options.clone(),
		Some(_) => {
			return Err(Error::session_not_created(format!(
				"The {OPTIONS_CAP} capability must be an object"
			)));
		}
	};

	let options = strip_vendor_prefixes(&options)?;
	let overwritten: Vec<&String> = options.keys().filter(|k| caps.contains_key(*k)).collect();
	if !overwritten.is_empty() {
		warn!(
			target = "wd.caps",
			keys = ?overwritten,
			"capabilities inside {VENDOR_PREFIX}{OPTIONS_CAP} will overwrite top-level capabilities"
		);
	}

	let mut promoted = caps;
	for (name, value) in options {
		promoted.insert(name, value);
	}
	promoted.shift_remove(OPTIONS_CAP);
	Ok(promoted)
}

/// Capability names in `caps` that no constraint covers.
pub fn extra_caps(caps: &Caps, constraints: &Constraints) -> Vec<String> {
	caps.keys()
		.filter(|name| !constraints.contains(name))
		.cloned()
		.collect()
}

fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::String(s) => s.trim().is_empty(),
		Value::Array(items) => items.is_empty(),
		Value::Object(obj) => obj.is_empty(),
		_ => false,
	}
}

fn is_numeric_string(s: &str) -> bool {
	let trimmed = s.trim();
	trimmed.is_empty() || trimmed.parse::<f64>().is_ok_and(|f| !f.is_nan())
}

fn display(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}
