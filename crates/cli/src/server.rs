//! axum adapter feeding every request into the dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};
use wd::response::unknown_command;
use wd::{CommandTarget, Dispatcher, HttpMethod, HttpRequest, HttpResponse};
use wd_runtime::{ExecutorOptions, SessionMux, init_sessions};

use crate::config::ServerConfig;
use crate::error::CliError;
use crate::relay::{RelayFactory, RelayOptions};

/// Multi-session host relaying to the configured downstream server.
pub type RelayMux = SessionMux<RelayFactory>;

/// Router with a single fallback handler; the dispatcher does all routing.
pub fn router<T: CommandTarget>(dispatcher: Arc<Dispatcher<T>>) -> Router {
	Router::new().fallback(handle::<T>).with_state(dispatcher)
}

/// Builds the session host and its router from `config`.
pub fn app(config: &ServerConfig) -> std::result::Result<(Router, Arc<RelayMux>), CliError> {
	let relay = RelayOptions::from_config(config)?;
	let mux = Arc::new(SessionMux::new(
		RelayFactory::new(relay),
		ExecutorOptions {
			new_command_timeout: config.new_command_timeout,
		},
	));
	let dispatcher = Dispatcher::new(Arc::clone(&mux)).with_base_path(config.base_path.as_str());
	Ok((router(Arc::new(dispatcher)), mux))
}

/// Serves until Ctrl-C, then deletes every live session.
pub async fn serve(config: ServerConfig) -> Result<()> {
	init_sessions(config.session_cache_size);
	let (router, mux) = app(&config)?;
	let addr = config.addr()?;
	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("Failed to bind WebDriver server to {addr}"))?;

	info!(
		target = "wd.server",
		%addr,
		base_path = config.base_path.as_str(),
		downstream = config.downstream.as_ref().map(|u| u.as_str()),
		"WebDriver server listening"
	);

	axum::serve(listener, router.into_make_service())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("WebDriver server error")?;

	info!(target = "wd.server", sessions = mux.len(), "shutting down");
	mux.delete_all().await;
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(target = "wd.server", error = %err, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
}

async fn handle<T: CommandTarget>(
	State(dispatcher): State<Arc<Dispatcher<T>>>,
	method: Method,
	uri: Uri,
	body: Bytes,
) -> Response {
	let Some(method) = HttpMethod::parse(method.as_str()) else {
		return into_response(unknown_command(uri.path()));
	};
	let body = match parse_body(&body) {
		Ok(body) => body,
		Err(err) => return into_response(HttpResponse::text(400, format!("Invalid JSON body: {err}"))),
	};
	let path = uri
		.path_and_query()
		.map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
	into_response(dispatcher.handle(HttpRequest::with_body(method, path, body)).await)
}

/// Empty bodies become `{}`.
fn parse_body(bytes: &[u8]) -> serde_json::Result<Value> {
	if bytes.iter().all(u8::is_ascii_whitespace) {
		return Ok(Value::Object(Map::new()));
	}
	serde_json::from_slice(bytes)
}

fn into_response(response: HttpResponse) -> Response {
	let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(
		status,
		[(header::CONTENT_TYPE, response.content_type())],
		response.body_string(),
	)
		.into_response()
}
