//! Per-driver event history.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value, json};
use wd_protocol::{Error, Result};

/// Maximum number of command records kept; older ones are dropped.
pub const MAX_COMMAND_HISTORY: usize = 10_000;

const COMMANDS_KEY: &str = "commands";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
	pub cmd: String,
	pub start_time: u64,
	pub end_time: u64,
}

/// Command timings plus named event timestamps (milliseconds since the epoch).
#[derive(Debug, Default)]
pub struct EventHistory {
	commands: VecDeque<CommandRecord>,
	events: IndexMap<String, Vec<u64>>,
}

impl EventHistory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_command(&mut self, cmd: &str, start_time: u64, end_time: u64) {
		if self.commands.len() >= MAX_COMMAND_HISTORY {
			self.commands.pop_front();
		}
		self.commands.push_back(CommandRecord {
			cmd: cmd.to_string(),
			start_time,
			end_time,
		});
	}

	/// Appends a timestamp to the named event. `commands` is reserved.
	pub fn log_event(&mut self, name: &str) -> Result<()> {
		if name == COMMANDS_KEY {
			return Err(Error::invalid_argument("Cannot log event called 'commands'"));
		}
		self.events.entry(name.to_string()).or_default().push(now_ms());
		Ok(())
	}

	pub fn commands(&self) -> Vec<CommandRecord> {
		self.commands.iter().cloned().collect()
	}

	pub fn event(&self, name: &str) -> Vec<u64> {
		self.events.get(name).cloned().unwrap_or_default()
	}

	/// Full history as `{commands: [...], <event>: [...]}`.
	pub fn snapshot(&self) -> Value {
		let mut out = Map::new();
		out.insert(COMMANDS_KEY.to_string(), json!(self.commands));
		for (name, times) in &self.events {
			out.insert(name.clone(), json!(times));
		}
		Value::Object(out)
	}

	/// History filtered to the event names in `filter` (a string or a list of strings).
	pub fn filtered(&self, filter: Option<&Value>) -> Value {
		let names: Vec<&str> = match filter {
			Some(Value::String(name)) if !name.is_empty() => vec![name.as_str()],
			Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
			_ => return self.snapshot(),
		};
		let snapshot = self.snapshot();
		let mut out = Map::new();
		if let Value::Object(all) = snapshot {
			for (name, times) in all {
				if names.contains(&name.as_str()) {
					out.insert(name, times);
				}
			}
		}
		Value::Object(out)
	}
}

pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or_default()
}
