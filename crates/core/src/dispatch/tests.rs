use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wd_protocol::{Caps, ResponseBody, W3C_ELEMENT_KEY};
use wd_runtime::{
	CommandExecutor, CommandRegistry, Driver, ExecutorOptions, NavigationCommands, Reply, register_navigation,
};

use super::*;
use crate::http::TEXT_CONTENT_TYPE;

#[derive(Default)]
struct Browser {
	url: Mutex<String>,
}

#[async_trait]
impl NavigationCommands for Browser {
	async fn get_url(&self) -> Result<String> {
		Ok(self.url.lock().clone())
	}

	async fn set_url(&self, url: &str) -> Result<()> {
		*self.url.lock() = url.to_string();
		Ok(())
	}

	async fn back(&self) -> Result<()> {
		Ok(())
	}

	async fn forward(&self) -> Result<()> {
		Ok(())
	}

	async fn refresh(&self) -> Result<()> {
		Ok(())
	}

	async fn title(&self) -> Result<String> {
		Ok("Fake".to_string())
	}
}

#[async_trait]
impl Driver for Browser {
	fn register_commands(registry: &mut CommandRegistry<Self>) {
		register_navigation(registry);
		registry.register("findElement", |_, _| async { Ok(json!({"ELEMENT": "e-1"})) });
		registry.register("getPageSource", |_, _| async {
			Ok(json!({"value": {"error": "no such alert", "message": "nothing open"}}))
		});
	}

	async fn start_session(&self, _session_id: &str, _caps: &Caps) -> Result<()> {
		Ok(())
	}

	fn status(&self) -> Value {
		json!({"ready": true})
	}
}

fn dispatcher() -> Dispatcher<CommandExecutor<Browser>> {
	Dispatcher::new(Arc::new(CommandExecutor::new(Browser::default())))
}

fn post(path: &str, body: Value) -> HttpRequest {
	HttpRequest::with_body(HttpMethod::Post, path, body)
}

fn get(path: &str) -> HttpRequest {
	HttpRequest::new(HttpMethod::Get, path)
}

fn body(response: &HttpResponse) -> &Value {
	response.json_body().expect("json body")
}

async fn w3c_session<T: CommandTarget>(dispatcher: &Dispatcher<T>) -> String {
	let response = dispatcher
		.handle(post(
			"/session",
			json!({"capabilities": {"alwaysMatch": {"platformName": "Fake"}}}),
		))
		.await;
	assert_eq!(response.status, 200, "{:?}", response.body);
	body(&response)["value"]["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_status_before_any_session() {
	let response = dispatcher().handle(get("/status")).await;
	assert_eq!(response.status, 200);
	assert_eq!(
		body(&response),
		&json!({"status": 0, "value": {"ready": true}, "sessionId": null})
	);
}

#[tokio::test]
async fn test_w3c_create_session_shape() {
	let dispatcher = dispatcher();
	let response = dispatcher
		.handle(post(
			"/session",
			json!({"capabilities": {"alwaysMatch": {"platformName": "Fake"}}}),
		))
		.await;
	assert_eq!(response.status, 200);
	let body = body(&response);
	assert!(body.get("status").is_none());
	assert!(body.get("sessionId").is_none());
	assert_eq!(body["value"]["capabilities"]["platformName"], "Fake");

	let id = body["value"]["sessionId"].as_str().unwrap();
	assert_eq!(sessions().get_protocol(id), Some(Protocol::W3c));
}

#[tokio::test]
async fn test_mjsonwp_create_session_shape() {
	let dispatcher = dispatcher();
	let response = dispatcher
		.handle(post("/session", json!({"desiredCapabilities": {"platformName": "Fake"}})))
		.await;
	assert_eq!(response.status, 200);
	let body = body(&response);
	assert_eq!(body["status"], 0);
	assert_eq!(body["value"]["platformName"], "Fake");
	let id = body["sessionId"].as_str().unwrap();
	assert_eq!(sessions().get_protocol(id), Some(Protocol::Mjsonwp));
}

#[tokio::test]
async fn test_create_session_bad_parameters_is_legacy_text() {
	let response = dispatcher().handle(post("/session", json!({}))).await;
	assert_eq!(response.status, 400);
	assert_eq!(response.content_type(), TEXT_CONTENT_TYPE);
	let ResponseBody::Text(text) = &response.body else {
		panic!("expected text body");
	};
	assert!(text.starts_with("Parameters were incorrect"));
}

#[tokio::test]
async fn test_missing_session_before_protocol_is_known() {
	let response = dispatcher().handle(get("/session/nope/url")).await;
	assert_eq!(response.status, ErrorKind::NoSuchDriver.jsonwp_http_status());
	let body = body(&response);
	assert_eq!(body["status"], 6);
	assert_eq!(body["value"]["error"], "invalid session id");
	assert_eq!(body["sessionId"], "nope");
}

#[tokio::test]
async fn test_navigation_round_trip() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;

	let response = dispatcher
		.handle(post(&format!("/session/{id}/url"), json!({"url": "https://example.com"})))
		.await;
	assert_eq!(response.status, 200);
	assert_eq!(body(&response), &json!({"value": null}));

	let response = dispatcher.handle(get(&format!("/session/{id}/url"))).await;
	assert_eq!(body(&response), &json!({"value": "https://example.com"}));
}

#[tokio::test]
async fn test_shape_and_semantic_validation_in_w3c() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;

	let response = dispatcher.handle(post(&format!("/session/{id}/url"), json!({}))).await;
	assert_eq!(response.status, 400);
	assert_eq!(body(&response)["value"]["error"], "invalid argument");

	let response = dispatcher
		.handle(post(&format!("/session/{id}/url"), json!({"url": "example.com"})))
		.await;
	assert_eq!(response.status, 400);
	assert!(
		body(&response)["value"]["message"]
			.as_str()
			.unwrap()
			.contains("must start with")
	);
}

#[tokio::test]
async fn test_element_keys_are_duplicated() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;
	let response = dispatcher
		.handle(post(
			&format!("/session/{id}/element"),
			json!({"using": "id", "value": "x"}),
		))
		.await;
	assert_eq!(response.status, 200);
	let value = &body(&response)["value"];
	assert_eq!(value["ELEMENT"], "e-1");
	assert_eq!(value[W3C_ELEMENT_KEY], "e-1");
}

#[tokio::test]
async fn test_embedded_error_is_raised() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;
	let response = dispatcher.handle(get(&format!("/session/{id}/source"))).await;
	assert_eq!(response.status, 404);
	assert_eq!(body(&response)["value"]["error"], "no such alert");
	assert_eq!(body(&response)["value"]["message"], "nothing open");
}

#[tokio::test]
async fn test_unimplemented_route() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;
	let response = dispatcher
		.handle(get(&format!("/session/{id}/window/current/position")))
		.await;
	assert_eq!(response.status, ErrorKind::NotImplemented.w3c_status());
	assert_eq!(body(&response)["value"]["error"], "unknown method");
}

#[tokio::test]
async fn test_deprecated_route_logged_once() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;
	for _ in 0..2 {
		dispatcher
			.handle(post(&format!("/session/{id}/timeouts/implicit_wait"), json!({"ms": 10})))
			.await;
	}
	let logged = dispatcher.deprecated_logged.lock();
	assert_eq!(logged.len(), 1);
	assert!(logged.contains("implicitWait"));
}

#[tokio::test]
async fn test_delete_session() {
	let dispatcher = dispatcher();
	let id = w3c_session(&dispatcher).await;

	let response = dispatcher
		.handle(HttpRequest::new(HttpMethod::Delete, format!("/session/{id}")))
		.await;
	assert_eq!(response.status, 200);
	assert_eq!(body(&response), &json!({"value": null}));

	let response = dispatcher.handle(get(&format!("/session/{id}/url"))).await;
	assert_eq!(response.status, 404);
	assert_eq!(body(&response)["value"]["error"], "invalid session id");
	assert!(body(&response).get("status").is_none());
}

async fn idle_timeout_reply(create: Value) -> HttpResponse {
	let executor = CommandExecutor::with_options(
		Arc::new(Browser::default()),
		ExecutorOptions {
			new_command_timeout: Duration::from_millis(100),
		},
	);
	let dispatcher = Dispatcher::new(Arc::new(executor));
	let response = dispatcher.handle(post("/session", create)).await;
	assert_eq!(response.status, 200);
	let body = body(&response);
	let id = body["sessionId"]
		.as_str()
		.or_else(|| body["value"]["sessionId"].as_str())
		.unwrap()
		.to_string();

	tokio::time::sleep(Duration::from_millis(400)).await;
	dispatcher.handle(get(&format!("/session/{id}/url"))).await
}

#[tokio::test]
async fn test_idle_timeout_reports_no_such_driver_in_w3c() {
	let response = idle_timeout_reply(json!({"capabilities": {"alwaysMatch": {"platformName": "Fake"}}})).await;
	assert_eq!(response.status, 404);
	let body = body(&response);
	assert!(body.get("status").is_none());
	assert_eq!(body["value"]["error"], "invalid session id");
}

#[tokio::test]
async fn test_idle_timeout_reports_no_such_driver_in_mjsonwp() {
	let response = idle_timeout_reply(json!({"desiredCapabilities": {"platformName": "Fake"}})).await;
	assert_eq!(response.status, 404);
	let body = body(&response);
	assert_eq!(body["status"], 6);
	assert!(body["value"]["message"].is_string());
}

#[tokio::test]
async fn test_unknown_route() {
	let response = dispatcher().handle(get("/session/s-9/bogus")).await;
	assert_eq!(response.status, 404);
	let body = body(&response);
	assert_eq!(body["value"]["error"], "unknown command");
	assert_eq!(body["sessionId"], "s-9");
}

#[tokio::test]
async fn test_base_path() {
	let dispatcher = dispatcher().with_base_path("/wd/hub/");
	assert_eq!(dispatcher.base_path(), "/wd/hub");
	assert_eq!(dispatcher.handle(get("/wd/hub/status")).await.status, 200);
	assert_eq!(dispatcher.handle(get("/wd/hub/status?x=1")).await.status, 200);
	assert_eq!(dispatcher.handle(get("/status")).await.status, 404);
	assert_eq!(dispatcher.handle(get("/wd/hubstatus")).await.status, 404);
}

#[test]
fn test_check_embedded_error() {
	assert!(check_embedded_error(&Value::Null).is_ok());
	assert!(check_embedded_error(&json!({"status": 0, "value": 1})).is_ok());
	let err = check_embedded_error(&json!({"status": 7, "value": {"message": "gone"}})).unwrap_err();
	assert!(err.is_kind(ErrorKind::NoSuchElement));
	let err = check_embedded_error(&json!({"status": "13"})).unwrap_err();
	assert!(err.is_kind(ErrorKind::UnknownError));
}

/// Forwards everything except `GET .../title`.
#[derive(Default)]
struct Relay {
	forwarded: Mutex<Vec<String>>,
	local: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandTarget for Relay {
	fn protocol_for(&self, _session_id: Option<&str>) -> Option<Protocol> {
		Some(Protocol::W3c)
	}

	fn session_exists(&self, session_id: Option<&str>) -> bool {
		session_id.is_some()
	}

	fn proxy_active(&self, session_id: Option<&str>) -> bool {
		session_id.is_some()
	}

	fn proxy_route_is_avoided(
		&self,
		_session_id: Option<&str>,
		method: HttpMethod,
		path: &str,
		_body: Option<&Value>,
	) -> bool {
		method == HttpMethod::Get && path.ends_with("/title")
	}

	async fn proxy_req_res(
		&self,
		_session_id: Option<&str>,
		method: HttpMethod,
		url: &str,
		body: Option<Value>,
	) -> Result<(u16, Value)> {
		if url.contains("/session/down/") {
			return Err(Error::unknown("connection refused"));
		}
		self.forwarded.lock().push(format!("{} {url}", method.as_str()));
		Ok((202, json!({"value": {"echo": body}})))
	}

	async fn execute(&self, command: &str, _args: Vec<Value>, _session_id: Option<&str>) -> Reply {
		self.local.lock().push(command.to_string());
		Reply::new(Some(Protocol::W3c), Ok(json!("local")))
	}
}

#[tokio::test]
async fn test_proxied_requests_pass_through() {
	let dispatcher = Dispatcher::new(Arc::new(Relay::default())).with_base_path("/wd/hub");
	let response = dispatcher
		.handle(post("/wd/hub/session/s1/url", json!({"url": "https://a.b"})))
		.await;
	assert_eq!(response.status, 202);
	assert_eq!(body(&response), &json!({"value": {"echo": {"url": "https://a.b"}}}));

	let response = dispatcher.handle(get("/wd/hub/session/s1/url")).await;
	assert_eq!(body(&response), &json!({"value": {"echo": null}}));

	let relay = dispatcher.target();
	assert_eq!(
		*relay.forwarded.lock(),
		["POST /wd/hub/session/s1/url", "GET /wd/hub/session/s1/url"]
	);
	assert!(relay.local.lock().is_empty());
}

#[tokio::test]
async fn test_avoided_and_delete_routes_stay_local() {
	let dispatcher = Dispatcher::new(Arc::new(Relay::default()));
	let response = dispatcher.handle(get("/session/s1/title")).await;
	assert_eq!(body(&response), &json!({"value": "local"}));

	let response = dispatcher
		.handle(HttpRequest::new(HttpMethod::Delete, "/session/s1"))
		.await;
	assert_eq!(body(&response), &json!({"value": null}));

	let relay = dispatcher.target();
	assert!(relay.forwarded.lock().is_empty());
	assert_eq!(*relay.local.lock(), ["title", "deleteSession"]);
}

#[tokio::test]
async fn test_proxy_transport_failure() {
	let dispatcher = Dispatcher::new(Arc::new(Relay::default()));
	let response = dispatcher.handle(get("/session/down/url")).await;
	assert_eq!(response.status, 500);
	let message = body(&response)["value"]["message"].as_str().unwrap();
	assert!(message.contains("Could not proxy. Proxy error: connection refused"));
}
