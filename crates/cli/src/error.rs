use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("failed to read config {path}")]
	ReadConfig {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid config {path}")]
	ParseConfig {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("proxyAvoid: unsupported method '{0}' (expected GET, POST or DELETE)")]
	InvalidMethod(String),

	#[error("proxyAvoid: invalid path pattern '{pattern}'")]
	InvalidPattern {
		pattern: String,
		#[source]
		source: regex::Error,
	},

	#[error("invalid downstream url '{url}': {reason}")]
	InvalidDownstream { url: String, reason: String },

	#[error("no downstream WebDriver server configured (use --downstream or 'downstream' in the config file)")]
	MissingDownstream,

	#[error("invalid listen address {0}")]
	InvalidAddress(String),

	#[error(transparent)]
	Driver(#[from] wd_protocol::Error),
}
