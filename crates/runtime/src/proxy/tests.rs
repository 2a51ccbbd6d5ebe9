use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use wd_protocol::{ErrorKind, W3C_ELEMENT_KEY};

use super::*;

#[derive(Debug, Clone)]
struct Recorded {
	method: String,
	path: String,
	body: Value,
}

#[derive(Clone)]
struct Downstream {
	w3c: bool,
	seen: Arc<Mutex<Vec<Recorded>>>,
}

async fn handle(State(state): State<Downstream>, method: Method, uri: Uri, body: Bytes) -> Response {
	let path = uri.path().to_string();
	let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
	state.seen.lock().push(Recorded {
		method: method.to_string(),
		path: path.clone(),
		body,
	});

	if path.ends_with("/slow") {
		tokio::time::sleep(Duration::from_secs(10)).await;
	}

	let reply = |value: Value| {
		if state.w3c {
			json!({"value": value})
		} else {
			json!({"status": 0, "sessionId": "down-1", "value": value})
		}
	};

	if method == Method::POST && path == "/wd/hub/session" {
		let body = if state.w3c {
			json!({"value": {"sessionId": "down-1", "capabilities": {"browserName": "x"}}})
		} else {
			json!({"status": 0, "sessionId": "down-1", "value": {"browserName": "x"}})
		};
		return (StatusCode::OK, Json(body)).into_response();
	}
	if path.ends_with("/element/missing/click") {
		return if state.w3c {
			let body = json!({"value": {"error": "no such element", "message": "gone", "stacktrace": "at x"}});
			(StatusCode::NOT_FOUND, Json(body)).into_response()
		} else {
			(StatusCode::OK, Json(json!({"status": 7, "value": {"message": "gone"}}))).into_response()
		};
	}
	if path.ends_with("/plain") {
		return (StatusCode::OK, "not json").into_response();
	}
	if path.ends_with("/element") {
		return (StatusCode::OK, Json(reply(json!({"ELEMENT": "e1"})))).into_response();
	}
	(StatusCode::OK, Json(reply(Value::Null))).into_response()
}

async fn spawn_downstream(w3c: bool) -> (SocketAddr, Arc<Mutex<Vec<Recorded>>>) {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let state = Downstream {
		w3c,
		seen: Arc::clone(&seen),
	};
	let app = Router::new().fallback(handle).with_state(state);
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app.into_make_service()).await.unwrap();
	});
	(addr, seen)
}

fn proxy_for(addr: SocketAddr) -> JwpProxy {
	JwpProxy::new(ProxyOptions {
		server: addr.ip().to_string(),
		port: addr.port(),
		..ProxyOptions::default()
	})
	.unwrap()
}

async fn proxy_with_session(w3c: bool) -> (JwpProxy, Arc<Mutex<Vec<Recorded>>>) {
	let (addr, seen) = spawn_downstream(w3c).await;
	let proxy = proxy_for(addr);
	proxy
		.proxy("/session", HttpMethod::Post, Some(json!({"capabilities": {}})))
		.await
		.unwrap();
	seen.lock().clear();
	(proxy, seen)
}

#[test]
fn test_url_for_proxy_rewrites_onto_downstream_session() {
	let proxy = JwpProxy::new(ProxyOptions {
		session_id: Some("abc".to_string()),
		..ProxyOptions::default()
	})
	.unwrap();
	let base = "http://localhost:4444/wd/hub";

	assert_eq!(proxy.url_for_proxy("/session/xyz/url").unwrap(), format!("{base}/session/abc/url"));
	assert_eq!(proxy.url_for_proxy("/url").unwrap(), format!("{base}/session/abc/url"));
	assert_eq!(proxy.url_for_proxy("/wd/hub/session/xyz/url").unwrap(), format!("{base}/session/abc/url"));
	assert_eq!(
		proxy.url_for_proxy("http://other:1/wd/hub/session/xyz/element/").unwrap(),
		format!("{base}/session/abc/element")
	);
	assert_eq!(proxy.url_for_proxy("/status").unwrap(), format!("{base}/status"));
	assert_eq!(proxy.url_for_proxy("").unwrap(), format!("{base}/session/abc"));
}

#[test]
fn test_url_for_proxy_errors() {
	let proxy = JwpProxy::new(ProxyOptions::default()).unwrap();
	let err = proxy.url_for_proxy("/url").unwrap_err();
	assert!(err.message().contains("Trying to proxy a session command without session id"));
	assert_eq!(proxy.url_for_proxy("/session").unwrap(), "http://localhost:4444/wd/hub/session");

	let err = proxy.url_for_proxy("url").unwrap_err();
	assert!(err.message().contains("Did not know what to do with url 'url'"));

	let err = proxy.url_for_proxy("http://host/nothing").unwrap_err();
	assert!(err.message().contains("could not extract JWP endpoint"));
}

#[test]
fn test_request_to_command_name() {
	let proxy = JwpProxy::new(ProxyOptions::default()).unwrap();
	assert_eq!(proxy.request_to_command_name("/wd/hub/session/1/url", HttpMethod::Get), Some("getUrl"));
	assert_eq!(proxy.request_to_command_name("/session/1/timeouts", HttpMethod::Post), Some("timeouts"));
	assert_eq!(proxy.request_to_command_name("/status", HttpMethod::Get), Some("getStatus"));
	assert_eq!(proxy.request_to_command_name("/wd/hub/nothing/here", HttpMethod::Get), None);
}

#[test]
fn test_protocol_from_body() {
	assert_eq!(protocol_from_body(&json!({"status": 0, "value": 1})), Some(Protocol::Mjsonwp));
	assert_eq!(protocol_from_body(&json!({"value": null})), Some(Protocol::W3c));
	assert_eq!(protocol_from_body(&json!({"status": "0"})), None);
}

#[tokio::test]
async fn test_session_creation_teaches_id_and_protocol() {
	let (addr, seen) = spawn_downstream(true).await;
	let proxy = proxy_for(addr);
	assert_eq!(proxy.downstream_protocol(), None);

	let (status, body) = proxy
		.proxy("/session", HttpMethod::Post, Some(json!({"capabilities": {}})))
		.await
		.unwrap();
	assert_eq!(status, 200);
	assert_eq!(body["value"]["sessionId"], "down-1");
	assert_eq!(proxy.session_id().as_deref(), Some("down-1"));
	assert_eq!(proxy.downstream_protocol(), Some(Protocol::W3c));
	assert_eq!(seen.lock()[0].path, "/wd/hub/session");
}

#[tokio::test]
async fn test_preset_session_learns_protocol_from_first_reply() {
	let (addr, seen) = spawn_downstream(false).await;
	let proxy = JwpProxy::new(ProxyOptions {
		server: addr.ip().to_string(),
		port: addr.port(),
		session_id: Some("down-1".to_string()),
		..ProxyOptions::default()
	})
	.unwrap();

	proxy.proxy("/url", HttpMethod::Get, None).await.unwrap();
	assert_eq!(proxy.downstream_protocol(), Some(Protocol::Mjsonwp));

	proxy
		.proxy_command("/wd/hub/session/up/timeouts", HttpMethod::Post, Some(json!({"script": 100})))
		.await
		.unwrap();
	let seen = seen.lock();
	assert_eq!(seen[1].path, "/wd/hub/session/down-1/timeouts");
	assert_eq!(seen[1].body, json!({"type": "script", "ms": 100}));
}

#[tokio::test]
async fn test_failed_reply_does_not_teach_protocol() {
	let (addr, _seen) = spawn_downstream(false).await;
	let proxy = JwpProxy::new(ProxyOptions {
		server: addr.ip().to_string(),
		port: addr.port(),
		session_id: Some("down-1".to_string()),
		..ProxyOptions::default()
	})
	.unwrap();

	assert!(proxy.proxy("/element/missing/click", HttpMethod::Post, None).await.is_err());
	assert_eq!(proxy.downstream_protocol(), None);
}

#[tokio::test]
async fn test_get_requests_carry_no_body() {
	let (proxy, seen) = proxy_with_session(true).await;
	proxy
		.proxy("/session/up/url", HttpMethod::Get, Some(json!({"ignored": true})))
		.await
		.unwrap();
	let seen = seen.lock();
	assert_eq!(seen[0].method, "GET");
	assert_eq!(seen[0].path, "/wd/hub/session/down-1/url");
	assert_eq!(seen[0].body, Value::Null);
}

#[tokio::test]
async fn test_w3c_timeouts_fan_out_to_mjsonwp_downstream() {
	let (proxy, seen) = proxy_with_session(false).await;
	proxy
		.proxy_command(
			"/wd/hub/session/up/timeouts",
			HttpMethod::Post,
			Some(json!({"script": 100, "implicit": 200})),
		)
		.await
		.unwrap();

	let bodies: Vec<Value> = seen.lock().iter().map(|r| r.body.clone()).collect();
	assert_eq!(
		bodies,
		vec![json!({"type": "script", "ms": 100}), json!({"type": "implicit", "ms": 200})]
	);
}

#[tokio::test]
async fn test_mjsonwp_timeouts_join_for_w3c_downstream() {
	let (proxy, seen) = proxy_with_session(true).await;
	proxy
		.proxy_command(
			"/wd/hub/session/up/timeouts",
			HttpMethod::Post,
			Some(json!({"type": "implicit", "ms": 300})),
		)
		.await
		.unwrap();
	assert_eq!(seen.lock()[0].body, json!({"implicit": 300}));
}

#[tokio::test]
async fn test_execute_url_is_rewritten_for_mjsonwp_downstream() {
	let (proxy, seen) = proxy_with_session(false).await;
	proxy
		.proxy_command(
			"/wd/hub/session/up/execute/sync",
			HttpMethod::Post,
			Some(json!({"script": "return 1", "args": []})),
		)
		.await
		.unwrap();
	assert_eq!(seen.lock()[0].path, "/wd/hub/session/down-1/execute");
}

#[tokio::test]
async fn test_command_unwraps_value_and_types_errors() {
	let (proxy, _) = proxy_with_session(true).await;
	let value = proxy.command("/element", HttpMethod::Post, Some(json!({}))).await.unwrap();
	assert_eq!(value, json!({"ELEMENT": "e1"}));

	let err = proxy
		.command("/element/missing/click", HttpMethod::Post, Some(json!({})))
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::NoSuchElement));
	assert_eq!(err.message(), "gone");
	assert_eq!(err.stacktrace(), Some("at x"));
}

#[tokio::test]
async fn test_non_zero_status_is_a_proxy_error() {
	let (proxy, _) = proxy_with_session(false).await;
	let err = proxy
		.proxy("/element/missing/click", HttpMethod::Post, Some(json!({})))
		.await
		.unwrap_err();
	let Error::ProxyRequest(proxy_err) = &err else {
		panic!("expected a proxy error, got {err:?}");
	};
	assert!(proxy_err.message().ends_with("has failed"));
	assert!(proxy_err.actual_error().is_kind(ErrorKind::NoSuchElement));

	let err = proxy
		.command("/element/missing/click", HttpMethod::Post, Some(json!({})))
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::NoSuchElement));
}

#[tokio::test]
async fn test_non_object_bodies_are_rejected() {
	let (proxy, _) = proxy_with_session(true).await;
	let err = proxy.proxy("/plain", HttpMethod::Get, None).await.unwrap_err();
	assert!(matches!(err, Error::ProxyRequest(_)));
}

#[tokio::test]
async fn test_proxy_req_res_rewrites_session_and_element_keys() {
	let (proxy, _) = proxy_with_session(false).await;
	sessions().put("upstream-legacy", Protocol::Mjsonwp);

	let (status, body) = proxy
		.proxy_req_res(HttpMethod::Post, "/wd/hub/session/upstream-legacy/element", Some(json!({})))
		.await
		.unwrap();
	assert_eq!(status, 200);
	assert_eq!(body["sessionId"], "upstream-legacy");
	assert_eq!(body["value"][W3C_ELEMENT_KEY], "e1");
	assert_eq!(body["status"], 0);
}

#[tokio::test]
async fn test_proxy_req_res_drops_status_for_w3c_clients() {
	let (proxy, _) = proxy_with_session(false).await;
	sessions().put("upstream-w3c", Protocol::W3c);

	let (_, body) = proxy
		.proxy_req_res(HttpMethod::Get, "/wd/hub/session/upstream-w3c/url", None)
		.await
		.unwrap();
	assert!(body.get("status").is_none());
	assert_eq!(body["sessionId"], "upstream-w3c");
}

#[tokio::test]
async fn test_transport_failure_message() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);

	let proxy = proxy_for(addr);
	let err = proxy.proxy("/status", HttpMethod::Get, None).await.unwrap_err();
	assert!(
		err.message()
			.starts_with("Could not proxy command to the remote server. Original error:")
	);
	assert_eq!(proxy.active_requests_count(), 0);
}

#[tokio::test]
async fn test_cancel_active_requests() {
	let (proxy, _) = proxy_with_session(true).await;
	let proxy = Arc::new(proxy);

	let pending = tokio::spawn({
		let proxy = Arc::clone(&proxy);
		async move { proxy.proxy("/slow", HttpMethod::Get, None).await }
	});

	for _ in 0..100 {
		if proxy.active_requests_count() == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(proxy.cancel_active_requests(), 1);

	let err = pending.await.unwrap().unwrap_err();
	assert!(err.message().contains("cancelled"));
	assert_eq!(proxy.active_requests_count(), 0);
}
