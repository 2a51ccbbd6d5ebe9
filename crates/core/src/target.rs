//! What the dispatcher drives: a single executor or a multi-session host.

use async_trait::async_trait;
use serde_json::Value;
use wd_protocol::{Error, HttpMethod, Protocol, Result};
use wd_runtime::{CommandExecutor, Driver, DriverFactory, SessionMux};

pub use wd_runtime::Reply;

#[async_trait]
pub trait CommandTarget: Send + Sync + 'static {
	/// Dialect of the session, if the target still knows it.
	fn protocol_for(&self, session_id: Option<&str>) -> Option<Protocol>;

	fn session_exists(&self, session_id: Option<&str>) -> bool;

	/// Whether requests for `session_id` are forwarded downstream wholesale.
	fn proxy_active(&self, _session_id: Option<&str>) -> bool {
		false
	}

	/// Whether a proxied request must still be served locally.
	///
	/// `path` has the base path removed.
	fn proxy_route_is_avoided(
		&self,
		_session_id: Option<&str>,
		_method: HttpMethod,
		_path: &str,
		_body: Option<&Value>,
	) -> bool {
		false
	}

	async fn proxy_req_res(
		&self,
		_session_id: Option<&str>,
		_method: HttpMethod,
		_url: &str,
		_body: Option<Value>,
	) -> Result<(u16, Value)> {
		Err(Error::unknown("Trying to proxy to a server but the driver is unable to proxy"))
	}

	async fn execute(&self, command: &str, args: Vec<Value>, session_id: Option<&str>) -> Reply;
}

#[async_trait]
impl<D: Driver> CommandTarget for CommandExecutor<D> {
	fn protocol_for(&self, _session_id: Option<&str>) -> Option<Protocol> {
		self.protocol()
	}

	fn session_exists(&self, session_id: Option<&str>) -> bool {
		CommandExecutor::session_exists(self, session_id)
	}

	fn proxy_active(&self, session_id: Option<&str>) -> bool {
		CommandExecutor::proxy_active(self, session_id)
	}

	fn proxy_route_is_avoided(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		path: &str,
		body: Option<&Value>,
	) -> bool {
		CommandExecutor::proxy_route_is_avoided(self, session_id, method, path, body)
	}

	async fn proxy_req_res(
		&self,
		_session_id: Option<&str>,
		method: HttpMethod,
		url: &str,
		body: Option<Value>,
	) -> Result<(u16, Value)> {
		CommandExecutor::proxy_req_res(self, method, url, body).await
	}

	async fn execute(&self, command: &str, args: Vec<Value>, _session_id: Option<&str>) -> Reply {
		let result = CommandExecutor::execute(self, command, args).await;
		Reply::new(self.protocol(), result)
	}
}

#[async_trait]
impl<F: DriverFactory> CommandTarget for SessionMux<F> {
	fn protocol_for(&self, session_id: Option<&str>) -> Option<Protocol> {
		SessionMux::protocol_for(self, session_id)
	}

	fn session_exists(&self, session_id: Option<&str>) -> bool {
		SessionMux::session_exists(self, session_id)
	}

	fn proxy_active(&self, session_id: Option<&str>) -> bool {
		SessionMux::proxy_active(self, session_id)
	}

	fn proxy_route_is_avoided(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		path: &str,
		body: Option<&Value>,
	) -> bool {
		SessionMux::proxy_route_is_avoided(self, session_id, method, path, body)
	}

	async fn proxy_req_res(
		&self,
		session_id: Option<&str>,
		method: HttpMethod,
		url: &str,
		body: Option<Value>,
	) -> Result<(u16, Value)> {
		SessionMux::proxy_req_res(self, session_id, method, url, body).await
	}

	async fn execute(&self, command: &str, args: Vec<Value>, session_id: Option<&str>) -> Reply {
		SessionMux::execute(self, command, args, session_id).await
	}
}
