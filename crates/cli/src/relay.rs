//! A driver that hands every session to a downstream WebDriver server.
//!
//! The local executor negotiates capabilities and owns the session id; the
//! downstream server gets its own session, and once that exists every request
//! is forwarded wholesale. Routes on the avoid list are served by the
//! navigation commands below, which still talk to the downstream server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;
use wd_protocol::{Caps, Error, HttpMethod, Result};
use wd_runtime::{
	AvoidRule, CommandRegistry, Driver, DriverFactory, JwpProxy, NavigationCommands, ProxyOptions, register_navigation,
};

use crate::config::ServerConfig;
use crate::error::CliError;

/// Settings shared by every relay session.
#[derive(Debug, Clone)]
pub struct RelayOptions {
	pub proxy: ProxyOptions,
	pub avoid: Vec<AvoidRule>,
}

impl RelayOptions {
	pub fn from_url(downstream: &Url, timeout: Duration, req_base_path: &str, avoid: Vec<AvoidRule>) -> Self {
		let base = downstream.path().trim_end_matches('/').to_string();
		Self {
			proxy: ProxyOptions {
				scheme: downstream.scheme().to_string(),
				server: downstream.host_str().unwrap_or("localhost").to_string(),
				port: downstream.port_or_known_default().unwrap_or(4444),
				base,
				req_base_path: req_base_path.to_string(),
				session_id: None,
				timeout,
			},
			avoid,
		}
	}

	pub fn from_config(config: &ServerConfig) -> std::result::Result<Self, CliError> {
		let downstream = config.downstream.as_ref().ok_or(CliError::MissingDownstream)?;
		Ok(Self::from_url(
			downstream,
			config.downstream_timeout,
			&config.base_path,
			config.proxy_avoid.clone(),
		))
	}

	fn downstream_url(&self) -> String {
		format!(
			"{}://{}:{}{}",
			self.proxy.scheme, self.proxy.server, self.proxy.port, self.proxy.base
		)
	}
}

/// Builds one [`RelayDriver`] per session.
#[derive(Debug, Clone)]
pub struct RelayFactory {
	options: RelayOptions,
}

impl RelayFactory {
	pub fn new(options: RelayOptions) -> Self {
		Self { options }
	}
}

impl DriverFactory for RelayFactory {
	type Driver = RelayDriver;

	fn create(&self) -> Result<RelayDriver> {
		RelayDriver::new(&self.options)
	}
}

pub struct RelayDriver {
	proxy: Arc<JwpProxy>,
	avoid: Vec<AvoidRule>,
	downstream: String,
}

impl RelayDriver {
	pub fn new(options: &RelayOptions) -> Result<Self> {
		Ok(Self {
			proxy: Arc::new(JwpProxy::new(options.proxy.clone())?),
			avoid: options.avoid.clone(),
			downstream: options.downstream_url(),
		})
	}

	async fn send(&self, method: HttpMethod, path: &str, body: Option<Value>) -> Result<Value> {
		self.proxy.command(path, method, body).await
	}
}

#[async_trait]
impl Driver for RelayDriver {
	fn register_commands(registry: &mut CommandRegistry<Self>) {
		register_navigation(registry);
	}

	async fn start_session(&self, session_id: &str, caps: &Caps) -> Result<()> {
		let caps = Value::Object(caps.clone());
		let body = json!({
			"capabilities": {"alwaysMatch": caps, "firstMatch": [{}]},
			"desiredCapabilities": caps,
		});
		self.send(HttpMethod::Post, "/session", Some(body))
			.await
			.map_err(|err| Error::session_not_created(err.message()))?;
		let downstream_id = self
			.proxy
			.session_id()
			.ok_or_else(|| Error::session_not_created("downstream server did not return a session id"))?;
		info!(
			target = "wd.relay",
			session = session_id,
			downstream_session = downstream_id.as_str(),
			downstream = self.downstream.as_str(),
			"relaying session"
		);
		Ok(())
	}

	async fn stop_session(&self, session_id: &str) -> Result<()> {
		let Some(downstream_id) = self.proxy.session_id() else {
			return Ok(());
		};
		debug!(
			target = "wd.relay",
			session = session_id,
			downstream_session = downstream_id.as_str(),
			"ending downstream session"
		);
		let result = self
			.send(HttpMethod::Delete, &format!("/session/{downstream_id}"), None)
			.await;
		self.proxy.set_session_id(None);
		result.map(|_| ())
	}

	fn status(&self) -> Value {
		json!({
			"ready": true,
			"message": format!("relaying to {}", self.downstream),
		})
	}

	fn proxy(&self) -> Option<Arc<JwpProxy>> {
		Some(Arc::clone(&self.proxy))
	}

	fn proxy_active(&self, session_id: Option<&str>) -> bool {
		session_id.is_some() && self.proxy.session_id().is_some()
	}

	fn proxy_avoid_list(&self, _session_id: Option<&str>) -> Vec<AvoidRule> {
		self.avoid.clone()
	}

	async fn page_load_timeout(&self, ms: u64) -> Result<()> {
		self.send(HttpMethod::Post, "/timeouts", Some(json!({"pageLoad": ms})))
			.await
			.map(|_| ())
	}

	async fn script_timeout(&self, ms: u64) -> Result<()> {
		self.send(HttpMethod::Post, "/timeouts", Some(json!({"script": ms})))
			.await
			.map(|_| ())
	}
}

#[async_trait]
impl NavigationCommands for RelayDriver {
	async fn get_url(&self) -> Result<String> {
		let url = self.send(HttpMethod::Get, "/url", None).await?;
		Ok(url.as_str().unwrap_or_default().to_string())
	}

	async fn set_url(&self, url: &str) -> Result<()> {
		self.send(HttpMethod::Post, "/url", Some(json!({"url": url})))
			.await
			.map(|_| ())
	}

	async fn back(&self) -> Result<()> {
		self.send(HttpMethod::Post, "/back", Some(json!({}))).await.map(|_| ())
	}

	async fn forward(&self) -> Result<()> {
		self.send(HttpMethod::Post, "/forward", Some(json!({}))).await.map(|_| ())
	}

	async fn refresh(&self) -> Result<()> {
		self.send(HttpMethod::Post, "/refresh", Some(json!({}))).await.map(|_| ())
	}

	async fn title(&self) -> Result<String> {
		let title = self.send(HttpMethod::Get, "/title", None).await?;
		Ok(title.as_str().unwrap_or_default().to_string())
	}
}
