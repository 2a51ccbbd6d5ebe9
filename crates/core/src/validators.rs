//! Command-specific argument checks run after the payload shape is accepted.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use wd_protocol::{Error, Result};

static URL_SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_+.-]+:").unwrap());

const TIMEOUT_TYPES: [&str; 4] = ["script", "implicit", "page load", "command"];
const NETWORK_TYPES: [i64; 5] = [0, 1, 2, 4, 6];

/// Checks the positional `args` of `command`. Commands without rules pass.
pub fn validate_command(command: &str, args: &[Value]) -> Result<()> {
	let arg = |i: usize| args.get(i).filter(|v| !v.is_null());
	match command {
		"setUrl" => set_url(arg(0)),
		"implicitWait" | "asyncScriptTimeout" => wait_ms(arg(0)),
		"timeouts" => timeouts(arg(0), arg(1), [arg(2), arg(3), arg(4)]),
		"clickCurrent" => click_button(arg(0)),
		"setNetworkConnection" => network_type(arg(0)),
		_ => Ok(()),
	}
}

fn set_url(url: Option<&Value>) -> Result<()> {
	match url.and_then(Value::as_str) {
		Some(url) if URL_SCHEME_RE.is_match(url) => Ok(()),
		_ => Err(bad("Url or Uri must start with <scheme>://")),
	}
}

fn wait_ms(ms: Option<&Value>) -> Result<()> {
	match ms.and_then(number) {
		Some(ms) if ms >= 0.0 => Ok(()),
		_ => Err(bad("Wait ms must be a number equal to 0 or greater")),
	}
}

fn timeouts(kind: Option<&Value>, ms: Option<&Value>, w3c: [Option<&Value>; 3]) -> Result<()> {
	if let (Some(kind), Some(_)) = (kind, ms) {
		wait_ms(ms)?;
		return match kind.as_str() {
			Some(kind) if TIMEOUT_TYPES.contains(&kind) => Ok(()),
			_ => Err(bad(&format!(
				"'type' must be one of {}",
				TIMEOUT_TYPES.map(|t| format!("'{t}'")).join(", ")
			))),
		};
	}
	for value in w3c.into_iter().flatten() {
		wait_ms(Some(value))?;
	}
	Ok(())
}

fn click_button(button: Option<&Value>) -> Result<()> {
	let Some(button) = button else {
		return Ok(());
	};
	match number(button) {
		Some(b) if (0.0..=2.0).contains(&b) => Ok(()),
		_ => Err(bad("Click button must be 0, 1, or 2")),
	}
}

fn network_type(kind: Option<&Value>) -> Result<()> {
	match kind.and_then(Value::as_i64) {
		Some(kind) if NETWORK_TYPES.contains(&kind) => Ok(()),
		_ => Err(bad("Network type must be one of 0, 1, 2, 4, 6")),
	}
}

/// Numbers, or strings holding one.
fn number(value: &Value) -> Option<f64> {
	match value {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

fn bad(message: &str) -> Error {
	Error::BadParameters(message.to_string())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_set_url() {
		assert!(validate_command("setUrl", &[json!("https://example.com"), json!("s")]).is_ok());
		assert!(validate_command("setUrl", &[json!("about:blank")]).is_ok());
		assert!(validate_command("setUrl", &[json!("example.com/no-scheme")]).is_err());
		assert!(validate_command("setUrl", &[json!("")]).is_err());
	}

	#[test]
	fn test_wait_ms() {
		assert!(validate_command("implicitWait", &[json!(0)]).is_ok());
		assert!(validate_command("asyncScriptTimeout", &[json!("250")]).is_ok());
		let err = validate_command("implicitWait", &[json!(-1)]).unwrap_err();
		assert!(matches!(err, Error::BadParameters(_)));
	}

	#[test]
	fn test_timeouts() {
		assert!(validate_command("timeouts", &[json!("page load"), json!(10)]).is_ok());
		assert!(validate_command("timeouts", &[json!("bogus"), json!(10)]).is_err());
		assert!(validate_command("timeouts", &[json!("script"), json!(-5)]).is_err());

		let w3c = [Value::Null, Value::Null, json!(100), Value::Null, json!(0)];
		assert!(validate_command("timeouts", &w3c).is_ok());
		let w3c = [Value::Null, Value::Null, json!(-100)];
		assert!(validate_command("timeouts", &w3c).is_err());
	}

	#[test]
	fn test_click_and_network() {
		assert!(validate_command("clickCurrent", &[Value::Null, json!("s")]).is_ok());
		assert!(validate_command("clickCurrent", &[json!(2)]).is_ok());
		assert!(validate_command("clickCurrent", &[json!(3)]).is_err());
		assert!(validate_command("setNetworkConnection", &[json!(6)]).is_ok());
		assert!(validate_command("setNetworkConnection", &[json!(3)]).is_err());
	}

	#[test]
	fn test_unlisted_commands_pass() {
		assert!(validate_command("getUrl", &[]).is_ok());
	}
}
