//! The driver seam: what an automation backend plugs into the executor.
//!
//! A backend implements [`Driver`] for its session lifecycle and fills a
//! [`CommandRegistry`] with handlers for the commands it supports. Handlers are
//! looked up by command name at request time; a miss fails closed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::{Value, json};
use wd_protocol::{Caps, Constraints, Error, ErrorKind, HttpMethod, Result};

use crate::proxy::JwpProxy;

/// Boxed future returned by command handlers.
pub type CommandFuture = BoxFuture<'static, Result<Value>>;

/// A registered command handler.
pub type Handler<D> = Arc<dyn Fn(Arc<D>, Args) -> CommandFuture + Send + Sync>;

/// A route the driver handles itself even while proxying.
#[derive(Debug, Clone)]
pub struct AvoidRule {
	pub method: HttpMethod,
	pub path: Regex,
}

impl AvoidRule {
	pub fn new(method: HttpMethod, path: Regex) -> Self {
		Self { method, path }
	}

	/// Whether this rule covers `method` on `path` (base path already removed).
	pub fn matches(&self, method: HttpMethod, path: &str) -> bool {
		self.method == method && self.path.is_match(path)
	}
}

/// An automation backend hosted by a command executor.
///
/// Every hook has a default so a backend only overrides what it supports.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
	/// Capability rules for new sessions. Extend [`Constraints::base`], don't replace it.
	fn constraints(&self) -> Constraints {
		Constraints::base()
	}

	/// Registers the commands this backend serves.
	fn register_commands(_registry: &mut CommandRegistry<Self>)
	where
		Self: Sized,
	{
	}

	/// Called once capabilities are negotiated and an id is allocated.
	async fn start_session(&self, _session_id: &str, _caps: &Caps) -> Result<()> {
		Ok(())
	}

	/// Called when a session ends, explicitly or after an unexpected shutdown.
	async fn stop_session(&self, _session_id: &str) -> Result<()> {
		Ok(())
	}

	/// Whether `command` takes the per-driver command lock.
	///
	/// Commands that re-enter the executor (e.g. user scripts issuing nested
	/// commands) must opt out or they deadlock.
	fn should_serialize(&self, _command: &str) -> bool {
		true
	}

	/// Body returned by `getStatus`.
	fn status(&self) -> Value {
		json!({})
	}

	/// Downstream proxy, for backends that forward to another server.
	fn proxy(&self) -> Option<Arc<JwpProxy>> {
		None
	}

	/// Whether requests for `session_id` should be forwarded downstream.
	fn proxy_active(&self, _session_id: Option<&str>) -> bool {
		self.proxy().is_some()
	}

	/// Routes handled locally even while proxying.
	fn proxy_avoid_list(&self, _session_id: Option<&str>) -> Vec<AvoidRule> {
		Vec::new()
	}

	async fn page_load_timeout(&self, _ms: u64) -> Result<()> {
		Err(Error::with_message(ErrorKind::NotImplemented, "Not implemented yet for pageLoad."))
	}

	async fn script_timeout(&self, _ms: u64) -> Result<()> {
		Err(Error::with_message(ErrorKind::NotImplemented, "Not implemented yet for script."))
	}
}

/// Command name to handler map, built once per executor.
pub struct CommandRegistry<D> {
	handlers: HashMap<&'static str, Handler<D>>,
}

impl<D: Send + Sync + 'static> CommandRegistry<D> {
	pub fn new() -> Self {
		Self {
			handlers: HashMap::new(),
		}
	}

	/// Registers `handler` under `name`, replacing any earlier one.
	pub fn register<F, Fut>(&mut self, name: &'static str, handler: F)
	where
		F: Fn(Arc<D>, Args) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		let handler: Handler<D> = Arc::new(move |driver, args| Box::pin(handler(driver, args)));
		self.handlers.insert(name, handler);
	}

	pub fn get(&self, name: &str) -> Option<Handler<D>> {
		self.handlers.get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.handlers.contains_key(name)
	}

	/// Registered names, sorted.
	pub fn names(&self) -> Vec<&'static str> {
		let mut names: Vec<_> = self.handlers.keys().copied().collect();
		names.sort_unstable();
		names
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

impl<D: Send + Sync + 'static> Default for CommandRegistry<D> {
	fn default() -> Self {
		Self::new()
	}
}

/// Positional command arguments: body parameters first, then URL parameters in reverse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
	pub fn new(values: Vec<Value>) -> Self {
		Self(values)
	}

	/// Argument `index`, or `null` when absent.
	pub fn get(&self, index: usize) -> &Value {
		self.0.get(index).unwrap_or(&Value::Null)
	}

	pub fn opt(&self, index: usize) -> Option<&Value> {
		self.0.get(index).filter(|v| !v.is_null())
	}

	/// Argument `index` as a string, or an `invalid argument` error naming `name`.
	pub fn string(&self, index: usize, name: &str) -> Result<String> {
		match self.get(index) {
			Value::String(s) => Ok(s.clone()),
			other => Err(Error::invalid_argument(format!(
				"'{name}' must be a string, got {other}"
			))),
		}
	}

	pub fn opt_string(&self, index: usize) -> Option<String> {
		self.get(index).as_str().map(str::to_string)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_slice(&self) -> &[Value] {
		&self.0
	}

	pub fn into_inner(self) -> Vec<Value> {
		self.0
	}
}

impl From<Vec<Value>> for Args {
	fn from(values: Vec<Value>) -> Self {
		Self(values)
	}
}
