//! Multi-session host.
//!
//! [`SessionMux`] owns one [`CommandExecutor`] per live session. Each
//! `createSession` builds a fresh driver from a [`DriverFactory`], so sessions
//! run concurrently while commands within a session stay serialized.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use wd_protocol::{Error, HttpMethod, Protocol, Result};

use crate::driver::Driver;
use crate::executor::{CREATE_SESSION, CommandExecutor, DELETE_SESSION, ExecutorOptions};
use crate::sessions::sessions;

/// Builds a driver for each new session.
pub trait DriverFactory: Send + Sync + 'static {
	type Driver: Driver;

	fn create(&self) -> Result<Self::Driver>;
}

impl<F, D> DriverFactory for F
where
	F: Fn() -> Result<D> + Send + Sync + 'static,
	D: Driver,
{
	type Driver = D;

	fn create(&self) -> Result<D> {
		self()
	}
}

/// Command result tagged with the dialect of the session that produced it.
#[derive(Debug)]
pub struct Reply {
	pub protocol: Option<Protocol>,
	pub result: Result<Value>,
}

impl Reply {
	pub fn new(protocol: Option<Protocol>, result: Result<Value>) -> Self {
		Self { protocol, result }
	}
}

/// Routes commands to per-session executors.
pub struct SessionMux<F: DriverFactory> {
	factory: F,
	options: ExecutorOptions,
	executors: DashMap<String, CommandExecutor<F::Driver>>,
}

impl<F: DriverFactory> SessionMux<F> {
	pub fn new(factory: F, options: ExecutorOptions) -> Self {
		Self {
			factory,
			options,
			executors: DashMap::new(),
		}
	}

	/// Executor for a live session. Executors whose session ended on their own are evicted.
	pub fn executor(&self, session_id: &str) -> Option<CommandExecutor<F::Driver>> {
		let executor = self.executors.get(session_id).map(|e| e.value().clone())?;
		if executor.session_exists(Some(session_id)) {
			return Some(executor);
		}
		debug!(target = "wd.umbrella", session = session_id, "evicting ended session");
		self.executors.remove(session_id);
		None
	}

	pub fn session_exists(&self, session_id: Option<&str>) -> bool {
		session_id.is_some_and(|id| self.executor(id).is_some())
	}

	pub fn protocol_for(&self, session_id: Option<&str>) -> Option<Protocol> {
		let id = session_id?;
		match self.executor(id) {
			Some(executor) => executor.protocol(),
			None => sessions().get_protocol(id),
		}
	}

	/// Drops executors whose session ended on its own (idle timeout, unexpected shutdown).
	pub fn evict_ended(&self) -> usize {
		let before = self.executors.len();
		self.executors.retain(|id, executor| executor.session_exists(Some(id.as_str())));
		let evicted = before.saturating_sub(self.executors.len());
		if evicted > 0 {
			debug!(target = "wd.umbrella", evicted, "evicted ended sessions");
		}
		evicted
	}

	/// Ids of live sessions, sorted.
	pub fn session_ids(&self) -> Vec<String> {
		self.evict_ended();
		let mut ids: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
		ids.sort_unstable();
		ids
	}

	pub fn len(&self) -> usize {
		self.evict_ended();
		self.executors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn proxy_active(&self, session_id: Option<&str>) -> bool {
		session_id
			.and_then(|id| self.executor(id))
			.is_some_and(|executor| executor.proxy_active(session_id))
	}

	pub fn proxy_route_is_avoided(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		path: &str,
		body: Option<&Value>,
	) -> bool {
		match session_id.and_then(|id| self.executor(id)) {
			Some(executor) => executor.proxy_route_is_avoided(session_id, method, path, body),
			None => true,
		}
	}

	pub async fn proxy_req_res(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		url: &str,
		body: Option<Value>,
	) -> Result<(u16, Value)> {
		let executor = self.require(session_id)?;
		executor.proxy_req_res(method, url, body).await
	}

	/// Runs `name`, creating or tearing down executors for session lifecycle commands.
	pub async fn execute(&self, name: &str, args: Vec<Value>, session_id: Option<&str>) -> Reply {
		match name {
			"getStatus" => Reply::new(None, Ok(status())),
			"getSessions" => Reply::new(None, Ok(self.all_sessions())),
			CREATE_SESSION => self.create_session(args).await,
			DELETE_SESSION => self.delete_session(args, session_id).await,
			_ => match self.require(session_id) {
				Ok(executor) => {
					let result = executor.execute(name, args).await;
					Reply::new(executor.protocol(), result)
				}
				Err(err) => Reply::new(self.protocol_for(session_id), Err(err)),
			},
		}
	}

	/// Deletes every live session.
	pub async fn delete_all(&self) {
		let executors: Vec<_> = self.executors.iter().map(|e| e.value().clone()).collect();
		self.executors.clear();
		for executor in executors {
			if let Err(err) = executor.delete_session().await {
				warn!(target = "wd.umbrella", error = %err, "failed to delete session");
			}
		}
	}

	async fn create_session(&self, args: Vec<Value>) -> Reply {
		self.evict_ended();
		let driver = match self.factory.create() {
			Ok(driver) => driver,
			Err(err) => return Reply::new(None, Err(err)),
		};
		let executor = CommandExecutor::with_options(Arc::new(driver), self.options);
		let result = executor.execute(CREATE_SESSION, args).await;
		let protocol = executor.protocol();

		if let Ok(created) = &result {
			if let Some(id) = created.get(0).and_then(Value::as_str) {
				info!(target = "wd.umbrella", session = id, "hosting new session");
				self.executors.insert(id.to_string(), executor);
			}
		}
		Reply::new(protocol, result)
	}

	async fn delete_session(&self, args: Vec<Value>, session_id: Option<&str>) -> Reply {
		let executor = match self.require(session_id) {
			Ok(executor) => executor,
			Err(err) => return Reply::new(self.protocol_for(session_id), Err(err)),
		};
		let protocol = executor.protocol();
		let result = executor.execute(DELETE_SESSION, args).await;
		if let Some(id) = session_id {
			self.executors.remove(id);
			info!(target = "wd.umbrella", session = id, remaining = self.executors.len(), "session removed");
		}
		Reply::new(protocol, result)
	}

	fn all_sessions(&self) -> Value {
		self.evict_ended();
		let listed: Vec<Value> = self
			.executors
			.iter()
			.filter_map(|entry| {
				let executor = entry.value();
				executor
					.session_id()
					.map(|id| json!({"id": id, "capabilities": Value::Object(executor.caps())}))
			})
			.collect();
		Value::Array(listed)
	}

	fn require(&self, session_id: Option<&str>) -> Result<CommandExecutor<F::Driver>> {
		session_id
			.and_then(|id| self.executor(id))
			.ok_or_else(|| Error::no_such_driver("A session is either terminated or not started"))
	}
}

fn status() -> Value {
	json!({
		"build": {
			"version": env!("CARGO_PKG_VERSION"),
		},
	})
}
