//! Per-driver command execution.
//!
//! A [`CommandExecutor`] hosts one [`Driver`] and at most one session. Every
//! command goes through [`CommandExecutor::execute`], which:
//!
//! - serializes commands on a per-driver lock (unless the driver opts out),
//! - races the handler against the unexpected-shutdown signal,
//! - re-arms the new-command (idle) timer afterwards,
//! - records the command in the event history.
//!
//! Session lifecycle commands (`createSession`, `deleteSession`, timeouts,
//! event log) are served by the executor itself.

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;
use wd_protocol::capabilities::{extra_caps, fix_caps, promote_options};
use wd_protocol::{
	Caps, Constraints, Error, ErrorKind, HttpMethod, Protocol, Result, determine_protocol, process_capabilities,
};

use crate::driver::{Args, CommandRegistry, Driver};
use crate::history::{CommandRecord, EventHistory, now_ms};
use crate::sessions::sessions;

pub const CREATE_SESSION: &str = "createSession";
pub const DELETE_SESSION: &str = "deleteSession";
pub const PROXY_REQ_RES: &str = "proxyReqRes";

/// Default idle time before a session is torn down.
pub const DEFAULT_NEW_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Id prefix of elements the driver caches locally; never proxied.
pub const IMAGE_ELEMENT_PREFIX: &str = "appium-image-element-";

pub const EVENT_SESSION_INIT: &str = "newSessionRequested";
pub const EVENT_SESSION_START: &str = "newSessionStarted";
pub const EVENT_SESSION_QUIT_START: &str = "quitSessionRequested";
pub const EVENT_SESSION_QUIT_DONE: &str = "quitSessionFinished";

const UNEXPECTED_SHUTDOWN_MESSAGE: &str = "The driver was unexpectedly shut down!";

const BUILTIN_COMMANDS: &[&str] = &[
	CREATE_SESSION,
	DELETE_SESSION,
	"getSession",
	"getSessions",
	"getStatus",
	"getTimeouts",
	"timeouts",
	"implicitWait",
	"getLogEvents",
	"logCustomEvent",
];

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
	/// Idle time before the session is deleted; zero disables the timer.
	pub new_command_timeout: Duration,
}

impl Default for ExecutorOptions {
	fn default() -> Self {
		Self {
			new_command_timeout: DEFAULT_NEW_COMMAND_TIMEOUT,
		}
	}
}

#[derive(Debug, Default)]
struct SessionState {
	id: Option<String>,
	protocol: Option<Protocol>,
	caps: Caps,
	shut_down_unexpectedly: bool,
}

struct Inner<D> {
	driver: Arc<D>,
	registry: CommandRegistry<D>,
	options: ExecutorOptions,
	state: Mutex<SessionState>,
	new_command_timeout: Mutex<Duration>,
	implicit_wait_ms: AtomicU64,
	command_lock: tokio::sync::Mutex<()>,
	shutdown: Mutex<watch::Sender<Option<Error>>>,
	idle_timer: Mutex<Option<(u64, AbortHandle)>>,
	timer_generation: AtomicU64,
	history: Mutex<EventHistory>,
}

/// Runs commands against one driver instance. Cheap to clone.
pub struct CommandExecutor<D> {
	inner: Arc<Inner<D>>,
}

impl<D> Clone for CommandExecutor<D> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<D: Driver> CommandExecutor<D> {
	pub fn new(driver: D) -> Self {
		Self::with_options(Arc::new(driver), ExecutorOptions::default())
	}

	pub fn with_options(driver: Arc<D>, options: ExecutorOptions) -> Self {
		let mut registry = CommandRegistry::new();
		D::register_commands(&mut registry);
		debug!(target = "wd.executor", commands = registry.len(), "registered driver commands");

		Self {
			inner: Arc::new(Inner {
				driver,
				registry,
				options,
				state: Mutex::new(SessionState::default()),
				new_command_timeout: Mutex::new(options.new_command_timeout),
				implicit_wait_ms: AtomicU64::new(0),
				command_lock: tokio::sync::Mutex::new(()),
				shutdown: Mutex::new(watch::channel(None).0),
				idle_timer: Mutex::new(None),
				timer_generation: AtomicU64::new(0),
				history: Mutex::new(EventHistory::new()),
			}),
		}
	}

	pub fn driver(&self) -> &Arc<D> {
		&self.inner.driver
	}

	pub fn session_id(&self) -> Option<String> {
		self.inner.state.lock().id.clone()
	}

	/// Dialect of the current (or last attempted) session.
	pub fn protocol(&self) -> Option<Protocol> {
		self.inner.state.lock().protocol
	}

	pub fn caps(&self) -> Caps {
		self.inner.state.lock().caps.clone()
	}

	/// Whether `id` names the active session.
	pub fn session_exists(&self, id: Option<&str>) -> bool {
		match id {
			Some(id) => self.inner.state.lock().id.as_deref() == Some(id),
			None => false,
		}
	}

	pub fn new_command_timeout(&self) -> Duration {
		*self.inner.new_command_timeout.lock()
	}

	pub fn set_new_command_timeout(&self, timeout: Duration) {
		debug!(target = "wd.executor", ms = timeout.as_millis() as u64, "set new command timeout");
		*self.inner.new_command_timeout.lock() = timeout;
	}

	pub fn implicit_wait_ms(&self) -> u64 {
		self.inner.implicit_wait_ms.load(Ordering::Relaxed)
	}

	pub fn set_implicit_wait(&self, ms: u64) {
		debug!(target = "wd.executor", ms, "set implicit wait");
		self.inner.implicit_wait_ms.store(ms, Ordering::Relaxed);
	}

	/// Whether `name` is served by the executor or the driver's registry.
	pub fn has_command(&self, name: &str) -> bool {
		BUILTIN_COMMANDS.contains(&name) || self.inner.registry.contains(name)
	}

	/// Appends a timestamp to the named event. `commands` is reserved.
	pub fn log_event(&self, name: &str) -> Result<()> {
		self.inner.history.lock().log_event(name)?;
		debug!(target = "wd.executor", event = name, "event logged");
		Ok(())
	}

	/// Copy of the recorded command timings.
	pub fn command_history(&self) -> Vec<CommandRecord> {
		self.inner.history.lock().commands()
	}

	/// Copy of the full event history.
	pub fn event_history(&self) -> Value {
		self.inner.history.lock().snapshot()
	}

	pub fn idle_timer_armed(&self) -> bool {
		self.inner.idle_timer.lock().is_some()
	}

	/// Runs `name` with positional `args`.
	pub async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
		let start = now_ms();
		if name == CREATE_SESSION {
			self.inner.state.lock().protocol = Some(determine_protocol(&args));
			self.record_event(EVENT_SESSION_INIT);
		} else if name == DELETE_SESSION {
			self.record_event(EVENT_SESSION_QUIT_START);
		}

		let supported = self.has_command(name);
		let this = self.clone();
		let command = name.to_string();
		let handler = async move { this.dispatch(command, Args::new(args)).await };
		self.run(name, start, supported, handler).await
	}

	/// Forwards a client request to the driver's downstream server.
	///
	/// Goes through the same serialization and idle-timer handling as other commands.
	pub async fn proxy_req_res(&self, method: HttpMethod, url: &str, body: Option<Value>) -> Result<(u16, Value)> {
		let start = now_ms();
		let proxy = self.inner.driver.proxy();
		let url = url.to_string();
		let forward = async move {
			match proxy {
				Some(proxy) => proxy.proxy_req_res(method, &url, body).await,
				None => Err(Error::unknown("Trying to proxy to a server but the driver is unable to proxy")),
			}
		};
		self.run(PROXY_REQ_RES, start, true, forward).await
	}

	pub fn proxy_active(&self, session_id: Option<&str>) -> bool {
		self.inner.driver.proxy_active(session_id)
	}

	/// Whether a proxied request must be handled locally instead.
	///
	/// `path` has the base path removed. Requests referencing locally cached
	/// image elements are always avoided.
	pub fn proxy_route_is_avoided(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		path: &str,
		body: Option<&Value>,
	) -> bool {
		if path.contains(IMAGE_ELEMENT_PREFIX) {
			return true;
		}
		if body.is_some_and(|b| b.to_string().contains(IMAGE_ELEMENT_PREFIX)) {
			return true;
		}
		self.inner
			.driver
			.proxy_avoid_list(session_id)
			.iter()
			.any(|rule| rule.matches(method, path))
	}

	/// Aborts any in-flight command with `err` and deletes the session.
	///
	/// The shutdown signal is re-armed straight away for the next session.
	pub async fn start_unexpected_shutdown(&self, err: Option<Error>) {
		let err = err.unwrap_or_else(|| Error::no_such_driver(UNEXPECTED_SHUTDOWN_MESSAGE));
		warn!(target = "wd.executor", error = %err, "driver shutting down unexpectedly");

		let fired = std::mem::replace(&mut *self.inner.shutdown.lock(), watch::channel(None).0);
		fired.send_replace(Some(err));

		self.inner.state.lock().shut_down_unexpectedly = true;
		if let Err(err) = self.delete_session().await {
			warn!(target = "wd.executor", error = %err, "failed to delete session after shutdown");
		}
		self.inner.state.lock().shut_down_unexpectedly = false;
	}

	/// Ends the active session, if any. Bypasses the command lock.
	pub async fn delete_session(&self) -> Result<()> {
		self.clear_idle_timer();
		let id = self.session_id();
		let stopped = match &id {
			Some(id) => self.inner.driver.stop_session(id).await,
			None => Ok(()),
		};

		{
			let mut state = self.inner.state.lock();
			state.id = None;
			state.caps = Caps::new();
		}
		*self.inner.new_command_timeout.lock() = self.inner.options.new_command_timeout;
		self.inner.implicit_wait_ms.store(0, Ordering::Relaxed);
		if let Some(proxy) = self.inner.driver.proxy() {
			proxy.cancel_active_requests();
		}
		if let Some(id) = &id {
			sessions().reset_logger(id);
			info!(target = "wd.executor", session = %id, "session deleted");
		}
		self.clear_idle_timer();
		stopped
	}

	async fn run<T, Fut>(&self, name: &str, start: u64, supported: bool, handler: Fut) -> Result<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		self.clear_idle_timer();
		debug!(target = "wd.executor", command = name, "executing command");

		let result = self.run_guarded(name, supported, handler).await;

		if name != DELETE_SESSION {
			self.start_idle_timer();
		}
		let end = now_ms();
		self.inner.history.lock().record_command(name, start, end);
		match &result {
			Ok(_) if name == CREATE_SESSION => self.record_event(EVENT_SESSION_START),
			Ok(_) if name == DELETE_SESSION => self.record_event(EVENT_SESSION_QUIT_DONE),
			Ok(_) => {}
			Err(err) => debug!(target = "wd.executor", command = name, error = %err, "command failed"),
		}
		debug!(target = "wd.executor", command = name, elapsed_ms = end.saturating_sub(start), "command finished");
		result
	}

	async fn run_guarded<T, Fut>(&self, name: &str, supported: bool, handler: Fut) -> Result<T>
	where
		T: Send + 'static,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		if self.inner.state.lock().shut_down_unexpectedly {
			return Err(Error::no_such_driver(UNEXPECTED_SHUTDOWN_MESSAGE));
		}
		if !supported {
			return Err(Error::new(ErrorKind::NotYetImplemented));
		}

		let _guard = if self.inner.driver.should_serialize(name) {
			Some(self.inner.command_lock.lock().await)
		} else {
			None
		};
		let mut shutdown = self.inner.shutdown.lock().subscribe();

		// The handler keeps running if the shutdown signal wins; only its result is dropped.
		let task = tokio::spawn(handler.in_current_span());
		tokio::select! {
			joined = task => joined.unwrap_or_else(|err| Err(Error::unknown(format!("Command '{name}' did not complete: {err}")))),
			err = wait_for_shutdown(&mut shutdown) => {
				info!(target = "wd.executor", command = name, "abandoning command after unexpected shutdown");
				Err(err)
			}
		}
	}

	async fn dispatch(self, name: String, args: Args) -> Result<Value> {
		match name.as_str() {
			CREATE_SESSION => self.create_session(&args).await,
			DELETE_SESSION => self.delete_session().await.map(|()| Value::Null),
			"getSession" => Ok(self.session_caps()),
			"getSessions" => Ok(self.sessions_list()),
			"getStatus" => Ok(self.inner.driver.status()),
			"getTimeouts" => Ok(json!({
				"command": self.new_command_timeout().as_millis() as u64,
				"implicit": self.implicit_wait_ms(),
			})),
			"timeouts" => self.timeouts(&args).await.map(|()| Value::Null),
			"implicitWait" => {
				let ms = parse_timeout(args.get(0))?;
				self.set_implicit_wait(ms);
				Ok(Value::Null)
			}
			"getLogEvents" => {
				let events = self.inner.history.lock().filtered(args.opt(0));
				Ok(events)
			}
			"logCustomEvent" => {
				let vendor = args.string(0, "vendor")?;
				let event = args.string(1, "event")?;
				self.log_event(&format!("{vendor}:{event}"))?;
				Ok(Value::Null)
			}
			other => match self.inner.registry.get(other) {
				Some(handler) => handler(Arc::clone(&self.inner.driver), args).await,
				None => Err(Error::new(ErrorKind::NotYetImplemented)),
			},
		}
	}

	async fn create_session(&self, args: &Args) -> Result<Value> {
		if self.inner.state.lock().id.is_some() {
			return Err(Error::session_not_created("Cannot create a new session while one is in progress"));
		}

		let constraints = self.inner.driver.constraints();
		let (protocol, caps) = negotiate(args.get(0), args.get(1), args.get(2), &constraints)?;
		self.inner.state.lock().protocol = Some(protocol);

		if truthy(caps.get("noReset")) && truthy(caps.get("fullReset")) {
			return Err(Error::session_not_created(
				"The 'noReset' and 'fullReset' capabilities are mutually exclusive and should not both be set to true. \
				 You probably meant to just use 'fullReset' on its own",
			));
		}

		let caps = promote_options(fix_caps(caps, &constraints))?;
		if let Some(secs) = caps.get("newCommandTimeout").and_then(Value::as_f64) {
			if secs > 0.0 {
				self.set_new_command_timeout(Duration::from_secs_f64(secs));
			}
		}

		let extra = extra_caps(&caps, &constraints);
		if !extra.is_empty() {
			info!(
				target = "wd.caps",
				"The following capabilities were provided, but are not recognized by this driver \
				 and will be ignored: {}",
				extra.join(", ")
			);
		}

		let id = Uuid::new_v4().to_string();
		self.inner.driver.start_session(&id, &caps).await?;

		{
			let mut state = self.inner.state.lock();
			state.id = Some(id.clone());
			state.protocol = Some(protocol);
			state.caps = caps.clone();
		}
		sessions().put(&id, protocol);
		info!(target = "wd.executor", session = %id, protocol = protocol.as_str(), "session created");
		Ok(json!([id, Value::Object(caps)]))
	}

	fn session_caps(&self) -> Value {
		let caps = self.caps();
		if truthy(caps.get("eventTimings")) {
			let mut out = caps;
			out.insert("events".to_string(), self.event_history());
			return Value::Object(out);
		}
		Value::Object(caps)
	}

	fn sessions_list(&self) -> Value {
		let state = self.inner.state.lock();
		match &state.id {
			Some(id) => json!([{"id": id, "capabilities": Value::Object(state.caps.clone())}]),
			None => json!([]),
		}
	}

	/// MJSONWP `{type, ms}` or W3C `{script, pageLoad, implicit}`, in that argument order.
	async fn timeouts(&self, args: &Args) -> Result<()> {
		if let (Some(kind), Some(ms)) = (args.opt(0), args.opt(1)) {
			let ms = parse_timeout(ms)?;
			debug!(target = "wd.executor", kind = %kind, ms, "MJSONWP timeout arguments");
			return match kind.as_str() {
				Some("command") => {
					self.set_new_command_timeout(Duration::from_millis(ms));
					Ok(())
				}
				Some("implicit") => {
					self.set_implicit_wait(ms);
					Ok(())
				}
				Some("page load") => self.inner.driver.page_load_timeout(ms).await,
				Some("script") => self.inner.driver.script_timeout(ms).await,
				_ => Err(Error::unknown(format!(
					"'{}' type is not supported for MJSONWP timeout",
					plain(kind)
				))),
			};
		}

		debug!(target = "wd.executor", "W3C timeout arguments");
		if let Some(ms) = args.opt(2) {
			self.inner.driver.script_timeout(parse_timeout(ms)?).await?;
		}
		if let Some(ms) = args.opt(3) {
			self.inner.driver.page_load_timeout(parse_timeout(ms)?).await?;
		}
		if let Some(ms) = args.opt(4) {
			self.set_implicit_wait(parse_timeout(ms)?);
		}
		Ok(())
	}

	fn record_event(&self, name: &str) {
		if let Err(err) = self.log_event(name) {
			debug!(target = "wd.executor", event = name, error = %err, "event not logged");
		}
	}

	fn clear_idle_timer(&self) {
		if let Some((_, handle)) = self.inner.idle_timer.lock().take() {
			handle.abort();
		}
	}

	fn start_idle_timer(&self) {
		self.clear_idle_timer();
		let timeout = self.new_command_timeout();
		if timeout.is_zero() || self.session_id().is_none() {
			return;
		}

		let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
		let weak = Arc::downgrade(&self.inner);
		let task = tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			let Some(inner) = weak.upgrade() else {
				return;
			};
			let executor = CommandExecutor { inner };
			{
				let mut slot = executor.inner.idle_timer.lock();
				let current = matches!(slot.as_ref(), Some((armed, _)) if *armed == generation);
				if !current {
					return;
				}
				*slot = None;
			}

			let secs = timeout.as_secs_f64();
			warn!(target = "wd.executor", "Shutting down because we waited {secs} seconds for a command");
			let message = format!(
				"New Command Timeout of {secs} seconds expired. \
				 Try customizing the timeout using the 'newCommandTimeout' desired capability"
			);
			executor.start_unexpected_shutdown(Some(Error::no_such_driver(message))).await;
		});
		*self.inner.idle_timer.lock() = Some((generation, task.abort_handle()));
	}
}

/// Resolves once the shutdown signal carries an error.
async fn wait_for_shutdown(rx: &mut watch::Receiver<Option<Error>>) -> Error {
	loop {
		let closed = rx.changed().await.is_err();
		let current = rx.borrow_and_update().clone();
		if let Some(err) = current {
			return err;
		}
		if closed {
			return std::future::pending().await;
		}
	}
}

/// Negotiates W3C capabilities, falling back to (or starting from) legacy ones.
///
/// Legacy desired and required capabilities are folded into `alwaysMatch`.
fn negotiate(desired: &Value, required: &Value, w3c: &Value, constraints: &Constraints) -> Result<(Protocol, Caps)> {
	let has_w3c = w3c
		.as_object()
		.is_some_and(|obj| obj.contains_key("alwaysMatch") || obj.contains_key("firstMatch"));
	let has_legacy = desired.is_object();
	if !has_w3c && !has_legacy {
		return Err(Error::session_not_created("Either JSONWP or W3C capabilities should be provided"));
	}

	if has_w3c {
		match process_capabilities(w3c, constraints, true) {
			Ok(caps) => return Ok((Protocol::W3c, caps)),
			Err(err) if has_legacy => warn!(
				target = "wd.caps",
				"Could not parse W3C capabilities: {}. Falling back to JSONWP protocol.",
				err.message()
			),
			Err(err) => return Err(Error::session_not_created(err.message())),
		}
	}

	let mut always_match: Map<String, Value> = desired.as_object().cloned().unwrap_or_default();
	if let Some(required) = required.as_object() {
		for (name, value) in required {
			always_match.insert(name.clone(), value.clone());
		}
	}
	let folded = json!({ "alwaysMatch": always_match });
	process_capabilities(&folded, constraints, true)
		.map(|caps| (Protocol::Mjsonwp, caps))
		.map_err(|err| Error::session_not_created(err.message()))
}

/// Parses a non-negative timeout in milliseconds from a number or numeric string.
fn parse_timeout(value: &Value) -> Result<u64> {
	let parsed = match value {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse::<f64>().ok(),
		_ => None,
	};
	match parsed {
		Some(ms) if ms >= 0.0 && ms.is_finite() => Ok(ms as u64),
		_ => Err(Error::unknown(format!("Invalid timeout value '{}'", plain(value)))),
	}
}

fn truthy(value: Option<&Value>) -> bool {
	match value {
		None | Some(Value::Null) => false,
		Some(Value::Bool(b)) => *b,
		Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
		Some(Value::String(s)) => !s.is_empty(),
		Some(_) => true,
	}
}

fn plain(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}
