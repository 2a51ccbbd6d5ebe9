use anyhow::Result;
use wd_protocol::METHOD_MAP;

use crate::cli::{Cli, Commands, ServeArgs};
use crate::config::{ServerConfig, load_file};
use crate::server;

pub async fn run(cli: Cli) -> Result<()> {
	match cli.command {
		Commands::Serve(args) => serve(&args).await,
		Commands::Routes => {
			print!("{}", route_table());
			Ok(())
		}
	}
}

async fn serve(args: &ServeArgs) -> Result<()> {
	let file = load_file(args.config.as_deref())?;
	let config = ServerConfig::resolve(args, file)?;
	server::serve(config).await
}

/// One line per route and method: method, path, command, deprecation marker.
pub fn route_table() -> String {
	let mut out = String::new();
	for route in METHOD_MAP {
		for (method, spec) in route.methods {
			let command = spec.command.unwrap_or("(not implemented)");
			let deprecated = if spec.deprecated { "  deprecated" } else { "" };
			out.push_str(&format!("{:<7}{:<64}{command}{deprecated}\n", method.as_str(), route.path));
		}
	}
	out
}
