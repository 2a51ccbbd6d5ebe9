//! Server settings from flags, an optional JSON file and defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use wd_protocol::HttpMethod;
use wd_runtime::AvoidRule;
use wd_runtime::proxy::DEFAULT_REQUEST_TIMEOUT;
use wd_runtime::sessions::DEFAULT_CAPACITY;

use crate::cli::ServeArgs;
use crate::error::{CliError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4723;
pub const DEFAULT_NEW_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub base_path: Option<String>,
	pub downstream: Option<String>,
	pub downstream_timeout_ms: Option<u64>,
	pub new_command_timeout: Option<u64>,
	pub session_cache_size: Option<usize>,
	pub proxy_avoid: Vec<AvoidEntry>,
}

/// A route served locally while relaying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvoidEntry {
	pub method: String,
	pub path_regex: String,
}

impl AvoidEntry {
	fn compile(&self) -> Result<AvoidRule> {
		let method = HttpMethod::parse(&self.method).ok_or_else(|| CliError::InvalidMethod(self.method.clone()))?;
		let path = Regex::new(&self.path_regex).map_err(|source| CliError::InvalidPattern {
			pattern: self.path_regex.clone(),
			source,
		})?;
		Ok(AvoidRule::new(method, path))
	}
}

/// `<config dir>/wd/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("wd").join("config.json"))
}

/// Reads the config file.
///
/// An explicit path must exist. Without one, the default location is used
/// when present.
pub fn load_file(explicit: Option<&Path>) -> Result<FileConfig> {
	let path = match explicit {
		Some(path) => path.to_path_buf(),
		None => match default_config_path().filter(|p| p.is_file()) {
			Some(path) => path,
			None => return Ok(FileConfig::default()),
		},
	};
	debug!(target = "wd.server", path = %path.display(), "loading config");
	let text = std::fs::read_to_string(&path).map_err(|source| CliError::ReadConfig {
		path: path.clone(),
		source,
	})?;
	serde_json::from_str(&text).map_err(|source| CliError::ParseConfig { path, source })
}

/// Fully resolved settings for `wd serve`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub host: String,
	pub port: u16,
	pub base_path: String,
	pub downstream: Option<Url>,
	pub downstream_timeout: Duration,
	pub new_command_timeout: Duration,
	pub session_cache_size: usize,
	pub proxy_avoid: Vec<AvoidRule>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			host: DEFAULT_HOST.to_string(),
			port: DEFAULT_PORT,
			base_path: String::new(),
			downstream: None,
			downstream_timeout: DEFAULT_REQUEST_TIMEOUT,
			new_command_timeout: Duration::from_secs(DEFAULT_NEW_COMMAND_TIMEOUT_SECS),
			session_cache_size: DEFAULT_CAPACITY,
			proxy_avoid: Vec::new(),
		}
	}
}

impl ServerConfig {
	/// Layers `args` over `file` over defaults.
	pub fn resolve(args: &ServeArgs, file: FileConfig) -> Result<Self> {
		let defaults = Self::default();
		let downstream = match args.downstream.clone().or(file.downstream) {
			Some(raw) => Some(parse_downstream(&raw)?),
			None => None,
		};
		let proxy_avoid = file
			.proxy_avoid
			.iter()
			.map(AvoidEntry::compile)
			.collect::<Result<Vec<_>>>()?;

		Ok(Self {
			host: args.host.clone().or(file.host).unwrap_or(defaults.host),
			port: args.port.or(file.port).unwrap_or(defaults.port),
			base_path: normalize_base_path(args.base_path.clone().or(file.base_path).unwrap_or_default()),
			downstream,
			downstream_timeout: args
				.downstream_timeout_ms
				.or(file.downstream_timeout_ms)
				.map_or(defaults.downstream_timeout, Duration::from_millis),
			new_command_timeout: args
				.new_command_timeout
				.or(file.new_command_timeout)
				.map_or(defaults.new_command_timeout, Duration::from_secs),
			session_cache_size: args
				.session_cache_size
				.or(file.session_cache_size)
				.unwrap_or(defaults.session_cache_size),
			proxy_avoid,
		})
	}

	pub fn addr(&self) -> Result<SocketAddr> {
		let raw = format!("{}:{}", self.host, self.port);
		raw.parse().map_err(|_| CliError::InvalidAddress(raw))
	}
}

/// `"/wd/hub/"` and `"wd/hub"` both become `"/wd/hub"`; `"/"` becomes empty.
fn normalize_base_path(raw: String) -> String {
	let trimmed = raw.trim().trim_matches('/');
	if trimmed.is_empty() {
		String::new()
	} else {
		format!("/{trimmed}")
	}
}

fn parse_downstream(raw: &str) -> Result<Url> {
	let invalid = |reason: String| CliError::InvalidDownstream {
		url: raw.to_string(),
		reason,
	};
	let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
	if !matches!(url.scheme(), "http" | "https") {
		return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
	}
	if url.host_str().is_none() {
		return Err(invalid("missing host".to_string()));
	}
	Ok(url)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = ServerConfig::resolve(&ServeArgs::default(), FileConfig::default()).unwrap();
		assert_eq!(config.host, "127.0.0.1");
		assert_eq!(config.port, 4723);
		assert_eq!(config.base_path, "");
		assert!(config.downstream.is_none());
		assert_eq!(config.downstream_timeout, Duration::from_millis(240_000));
		assert_eq!(config.new_command_timeout, Duration::from_secs(60));
		assert_eq!(config.session_cache_size, 100);
		assert_eq!(config.addr().unwrap().to_string(), "127.0.0.1:4723");
	}

	#[test]
	fn test_flags_override_file() {
		let file: FileConfig = serde_json::from_str(
			r#"{
				"port": 5000,
				"basePath": "wd/hub/",
				"downstream": "http://127.0.0.1:9515",
				"newCommandTimeout": 5,
				"proxyAvoid": [{"method": "get", "pathRegex": "^/session/[^/]+/log$"}]
			}"#,
		)
		.unwrap();
		let args = ServeArgs {
			port: Some(6000),
			..ServeArgs::default()
		};
		let config = ServerConfig::resolve(&args, file).unwrap();
		assert_eq!(config.port, 6000);
		assert_eq!(config.base_path, "/wd/hub");
		assert_eq!(config.new_command_timeout, Duration::from_secs(5));
		assert_eq!(config.downstream.unwrap().port(), Some(9515));
		assert_eq!(config.proxy_avoid.len(), 1);
		assert!(config.proxy_avoid[0].matches(HttpMethod::Get, "/session/abc/log"));
		assert!(!config.proxy_avoid[0].matches(HttpMethod::Post, "/session/abc/log"));
	}

	#[test]
	fn test_invalid_entries() {
		let file = FileConfig {
			proxy_avoid: vec![AvoidEntry {
				method: "PUT".to_string(),
				path_regex: ".*".to_string(),
			}],
			..FileConfig::default()
		};
		let err = ServerConfig::resolve(&ServeArgs::default(), file).unwrap_err();
		assert!(matches!(err, CliError::InvalidMethod(_)));

		let file = FileConfig {
			proxy_avoid: vec![AvoidEntry {
				method: "GET".to_string(),
				path_regex: "(".to_string(),
			}],
			..FileConfig::default()
		};
		let err = ServerConfig::resolve(&ServeArgs::default(), file).unwrap_err();
		assert!(matches!(err, CliError::InvalidPattern { .. }));

		let args = ServeArgs {
			downstream: Some("ftp://example.com".to_string()),
			..ServeArgs::default()
		};
		let err = ServerConfig::resolve(&args, FileConfig::default()).unwrap_err();
		assert!(matches!(err, CliError::InvalidDownstream { .. }));
	}

	#[test]
	fn test_load_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(&path, r#"{"host": "0.0.0.0", "sessionCacheSize": 7}"#).unwrap();
		let file = load_file(Some(&path)).unwrap();
		assert_eq!(file.host.as_deref(), Some("0.0.0.0"));
		assert_eq!(file.session_cache_size, Some(7));

		let missing = dir.path().join("missing.json");
		assert!(matches!(load_file(Some(&missing)), Err(CliError::ReadConfig { .. })));

		std::fs::write(&path, "{not json").unwrap();
		assert!(matches!(load_file(Some(&path)), Err(CliError::ParseConfig { .. })));
	}

	#[test]
	fn test_normalize_base_path() {
		assert_eq!(normalize_base_path("/".to_string()), "");
		assert_eq!(normalize_base_path("/wd/hub".to_string()), "/wd/hub");
		assert_eq!(normalize_base_path("wd/hub/".to_string()), "/wd/hub");
	}
}
