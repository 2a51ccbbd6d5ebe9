use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wd")]
#[command(about = "WebDriver server relaying MJSONWP and W3C clients to a downstream driver")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Start the WebDriver server
	Serve(ServeArgs),
	/// Print the route table
	Routes,
}

/// Flags override the config file, which overrides built-in defaults.
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
	/// Address to bind [default: 127.0.0.1]
	#[arg(long)]
	pub host: Option<String>,

	/// Port to bind [default: 4723]
	#[arg(short, long)]
	pub port: Option<u16>,

	/// Prefix for every route, e.g. /wd/hub [default: none]
	#[arg(long, value_name = "PATH")]
	pub base_path: Option<String>,

	/// JSON config file [default: <config dir>/wd/config.json when present]
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Downstream WebDriver server every session is relayed to
	#[arg(long, value_name = "URL")]
	pub downstream: Option<String>,

	/// Timeout for downstream requests in milliseconds [default: 240000]
	#[arg(long, value_name = "MS")]
	pub downstream_timeout_ms: Option<u64>,

	/// Seconds of inactivity before a session is deleted, 0 disables [default: 60]
	#[arg(long, value_name = "SECS")]
	pub new_command_timeout: Option<u64>,

	/// Number of ended sessions whose dialect is remembered [default: 100]
	#[arg(long, value_name = "N")]
	pub session_cache_size: Option<usize>,
}
