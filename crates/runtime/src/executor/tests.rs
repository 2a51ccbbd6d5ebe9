use std::sync::atomic::AtomicUsize;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::commands::{NavigationCommands, register_navigation};

#[derive(Default)]
struct Counters {
	running: AtomicUsize,
	peak: AtomicUsize,
}

impl Counters {
	fn enter(&self) {
		let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(now, Ordering::SeqCst);
	}

	fn leave(&self) {
		self.running.fetch_sub(1, Ordering::SeqCst);
	}

	fn peak(&self) -> usize {
		self.peak.load(Ordering::SeqCst)
	}
}

#[derive(Default)]
struct Fake {
	counters: Arc<Counters>,
	url: Mutex<String>,
	started: Mutex<Vec<String>>,
	stopped: Mutex<Vec<String>>,
	script_ms: Mutex<Option<u64>>,
}

impl Fake {
	fn sharing(counters: Arc<Counters>) -> Self {
		Self {
			counters,
			..Self::default()
		}
	}
}

async fn busy(driver: Arc<Fake>, ms: u64) -> Result<Value> {
	driver.counters.enter();
	tokio::time::sleep(Duration::from_millis(ms)).await;
	driver.counters.leave();
	Ok(Value::Null)
}

#[async_trait]
impl Driver for Fake {
	fn register_commands(registry: &mut CommandRegistry<Self>) {
		register_navigation(registry);
		registry.register("sleep", |d, args| busy(d, args.get(0).as_u64().unwrap_or(50)));
		registry.register("sleepUnlocked", |d, args| busy(d, args.get(0).as_u64().unwrap_or(50)));
		registry.register("fail", |_, _| async { Err(Error::new(ErrorKind::NoSuchElement)) });
	}

	async fn start_session(&self, session_id: &str, _caps: &Caps) -> Result<()> {
		self.started.lock().push(session_id.to_string());
		Ok(())
	}

	async fn stop_session(&self, session_id: &str) -> Result<()> {
		self.stopped.lock().push(session_id.to_string());
		Ok(())
	}

	fn should_serialize(&self, command: &str) -> bool {
		command != "sleepUnlocked"
	}

	fn status(&self) -> Value {
		json!({"ready": true})
	}

	async fn script_timeout(&self, ms: u64) -> Result<()> {
		*self.script_ms.lock() = Some(ms);
		Ok(())
	}
}

#[async_trait]
impl NavigationCommands for Fake {
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
		Ok("fake".to_string())
	}
}

fn w3c_caps(always_match: Value) -> Vec<Value> {
	vec![Value::Null, Value::Null, json!({"alwaysMatch": always_match})]
}

async fn started(executor: &CommandExecutor<Fake>) -> String {
	let created = executor
		.execute(CREATE_SESSION, w3c_caps(json!({"platformName": "Fake"})))
		.await
		.unwrap();
	created[0].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_create_session_w3c() {
	let executor = CommandExecutor::new(Fake::default());
	let created = executor
		.execute(
			CREATE_SESSION,
			w3c_caps(json!({"platformName": "Fake", "appium:deviceName": "phone"})),
		)
		.await
		.unwrap();

	let id = created[0].as_str().unwrap();
	assert_eq!(created[1], json!({"platformName": "Fake", "deviceName": "phone"}));
	assert!(executor.session_exists(Some(id)));
	assert!(!executor.session_exists(Some("other")));
	assert_eq!(executor.protocol(), Some(Protocol::W3c));
	assert_eq!(sessions().get_protocol(id), Some(Protocol::W3c));
	assert_eq!(*executor.driver().started.lock(), [id.to_string()]);
	assert!(executor.idle_timer_armed());
}

#[tokio::test]
async fn test_create_session_falls_back_to_legacy_caps() {
	let executor = CommandExecutor::new(Fake::default());
	let args = vec![
		json!({"platformName": "Fake", "deviceName": "phone"}),
		json!({"deviceName": "tablet"}),
		json!({"alwaysMatch": {"platformName": 5}}),
	];
	let created = executor.execute(CREATE_SESSION, args).await.unwrap();
	assert_eq!(created[1]["deviceName"], "tablet");
	assert_eq!(executor.protocol(), Some(Protocol::Mjsonwp));
}

#[tokio::test]
async fn test_create_session_rejects_invalid_w3c_caps_without_fallback() {
	let executor = CommandExecutor::new(Fake::default());
	let err = executor
		.execute(CREATE_SESSION, w3c_caps(json!({"platformName": 5})))
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::SessionNotCreated));
	assert!(executor.session_id().is_none());
}

#[tokio::test]
async fn test_create_session_requires_caps() {
	let executor = CommandExecutor::new(Fake::default());
	let err = executor
		.execute(CREATE_SESSION, vec![Value::Null, Value::Null, Value::Null])
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::SessionNotCreated));
	assert!(err.message().contains("Either JSONWP or W3C capabilities should be provided"));
}

#[tokio::test]
async fn test_create_session_refuses_second_session() {
	let executor = CommandExecutor::new(Fake::default());
	started(&executor).await;
	let err = executor
		.execute(CREATE_SESSION, w3c_caps(json!({"platformName": "Fake"})))
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::SessionNotCreated));
	assert!(err.message().contains("while one is in progress"));
}

#[tokio::test]
async fn test_no_reset_and_full_reset_conflict() {
	let executor = CommandExecutor::new(Fake::default());
	let err = executor
		.execute(
			CREATE_SESSION,
			w3c_caps(json!({"platformName": "Fake", "appium:noReset": true, "appium:fullReset": true})),
		)
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::SessionNotCreated));
	assert!(err.message().contains("mutually exclusive"));
}

#[tokio::test]
async fn test_new_command_timeout_cap_and_options_promotion() {
	let executor = CommandExecutor::new(Fake::default());
	let created = executor
		.execute(
			CREATE_SESSION,
			w3c_caps(json!({
				"platformName": "Fake",
				"appium:newCommandTimeout": 5,
				"appium:options": {"appium:udid": "abc"},
			})),
		)
		.await
		.unwrap();
	assert_eq!(created[1]["udid"], "abc");
	assert!(created[1].get("options").is_none());
	assert_eq!(executor.new_command_timeout(), Duration::from_secs(5));
}

#[tokio::test]
async fn test_registered_commands_dispatch() {
	let executor = CommandExecutor::new(Fake::default());
	started(&executor).await;
	executor.execute("setUrl", vec![json!("https://example.com")]).await.unwrap();
	let url = executor.execute("getUrl", vec![]).await.unwrap();
	assert_eq!(url, "https://example.com");

	let err = executor.execute("fail", vec![]).await.unwrap_err();
	assert!(err.is_kind(ErrorKind::NoSuchElement));
}

#[tokio::test]
async fn test_unknown_command_is_not_yet_implemented() {
	let executor = CommandExecutor::new(Fake::default());
	assert!(!executor.has_command("flyToTheMoon"));
	let err = executor.execute("flyToTheMoon", vec![]).await.unwrap_err();
	assert!(err.is_kind(ErrorKind::NotYetImplemented));
	assert_eq!(executor.command_history().last().unwrap().cmd, "flyToTheMoon");
}

#[tokio::test]
async fn test_commands_on_one_driver_do_not_overlap() {
	let executor = CommandExecutor::new(Fake::default());
	let (a, b) = tokio::join!(
		executor.execute("sleep", vec![json!(80)]),
		executor.execute("sleep", vec![json!(80)]),
	);
	a.unwrap();
	b.unwrap();
	assert_eq!(executor.driver().counters.peak(), 1);
}

#[tokio::test]
async fn test_unserialized_commands_may_overlap() {
	let executor = CommandExecutor::new(Fake::default());
	let (a, b) = tokio::join!(
		executor.execute("sleepUnlocked", vec![json!(150)]),
		executor.execute("sleepUnlocked", vec![json!(150)]),
	);
	a.unwrap();
	b.unwrap();
	assert_eq!(executor.driver().counters.peak(), 2);
}

#[tokio::test]
async fn test_separate_drivers_run_concurrently() {
	let counters = Arc::new(Counters::default());
	let first = CommandExecutor::new(Fake::sharing(Arc::clone(&counters)));
	let second = CommandExecutor::new(Fake::sharing(Arc::clone(&counters)));
	let (a, b) = tokio::join!(
		first.execute("sleep", vec![json!(150)]),
		second.execute("sleep", vec![json!(150)]),
	);
	a.unwrap();
	b.unwrap();
	assert_eq!(counters.peak(), 2);
}

#[tokio::test]
async fn test_idle_timeout_deletes_session() {
	let options = ExecutorOptions {
		new_command_timeout: Duration::from_millis(250),
	};
	let executor = CommandExecutor::with_options(Arc::new(Fake::default()), options);
	let id = started(&executor).await;
	assert!(executor.idle_timer_armed());

	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(executor.session_id().is_none());
	assert!(!executor.idle_timer_armed());
	assert_eq!(*executor.driver().stopped.lock(), [id]);
}

#[tokio::test]
async fn test_commands_keep_session_alive() {
	let options = ExecutorOptions {
		new_command_timeout: Duration::from_millis(300),
	};
	let executor = CommandExecutor::with_options(Arc::new(Fake::default()), options);
	let id = started(&executor).await;
	for _ in 0..4 {
		tokio::time::sleep(Duration::from_millis(150)).await;
		executor.execute("title", vec![]).await.unwrap();
	}
	assert!(executor.session_exists(Some(&id)));
	executor.execute(DELETE_SESSION, vec![json!(id)]).await.unwrap();
	assert!(!executor.idle_timer_armed());
}

#[tokio::test]
async fn test_unexpected_shutdown_fails_in_flight_command() {
	let executor = CommandExecutor::new(Fake::default());
	let id = started(&executor).await;

	let pending = {
		let executor = executor.clone();
		tokio::spawn(async move { executor.execute("sleep", vec![json!(10_000)]).await })
	};
	tokio::time::sleep(Duration::from_millis(50)).await;

	let began = Instant::now();
	executor.start_unexpected_shutdown(None).await;
	let err = tokio::time::timeout(Duration::from_secs(2), pending)
		.await
		.unwrap()
		.unwrap()
		.unwrap_err();
	assert!(began.elapsed() < Duration::from_secs(2));
	assert!(err.is_kind(ErrorKind::NoSuchDriver));
	assert_eq!(err.message(), "The driver was unexpectedly shut down!");
	assert!(executor.session_id().is_none());
	assert_eq!(*executor.driver().stopped.lock(), [id]);

	// the signal is re-armed for the next session
	started(&executor).await;
	executor.execute("sleep", vec![json!(10)]).await.unwrap();
}

#[tokio::test]
async fn test_timeouts_mjsonwp() {
	let executor = CommandExecutor::new(Fake::default());
	executor.execute("timeouts", vec![json!("command"), json!(5000)]).await.unwrap();
	executor.execute("timeouts", vec![json!("implicit"), json!("300")]).await.unwrap();
	executor.execute("timeouts", vec![json!("script"), json!(10)]).await.unwrap();
	assert_eq!(*executor.driver().script_ms.lock(), Some(10));

	let timeouts = executor.execute("getTimeouts", vec![]).await.unwrap();
	assert_eq!(timeouts, json!({"command": 5000, "implicit": 300}));

	let err = executor
		.execute("timeouts", vec![json!("page load"), json!(10)])
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::NotImplemented));

	let err = executor
		.execute("timeouts", vec![json!("bogus"), json!(10)])
		.await
		.unwrap_err();
	assert_eq!(err.cause(), "'bogus' type is not supported for MJSONWP timeout");
}

#[tokio::test]
async fn test_timeouts_w3c() {
	let executor = CommandExecutor::new(Fake::default());
	let args = vec![Value::Null, Value::Null, json!(100), Value::Null, json!(200)];
	executor.execute("timeouts", args).await.unwrap();
	assert_eq!(*executor.driver().script_ms.lock(), Some(100));
	assert_eq!(executor.implicit_wait_ms(), 200);

	executor.execute("implicitWait", vec![json!(50)]).await.unwrap();
	assert_eq!(executor.implicit_wait_ms(), 50);
}

#[tokio::test]
async fn test_invalid_timeout_value() {
	let executor = CommandExecutor::new(Fake::default());
	let err = executor
		.execute("timeouts", vec![json!("command"), json!(-1)])
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::UnknownError));
	assert_eq!(err.cause(), "Invalid timeout value '-1'");
}

#[tokio::test]
async fn test_session_queries() {
	let executor = CommandExecutor::new(Fake::default());
	assert_eq!(executor.execute("getSessions", vec![]).await.unwrap(), json!([]));
	assert_eq!(executor.execute("getStatus", vec![]).await.unwrap(), json!({"ready": true}));

	let id = started(&executor).await;
	let listed = executor.execute("getSessions", vec![]).await.unwrap();
	assert_eq!(listed, json!([{"id": id, "capabilities": {"platformName": "Fake"}}]));
	let caps = executor.execute("getSession", vec![json!(id)]).await.unwrap();
	assert_eq!(caps, json!({"platformName": "Fake"}));
}

#[tokio::test]
async fn test_event_timings_included_in_session() {
	let executor = CommandExecutor::new(Fake::default());
	executor
		.execute(
			CREATE_SESSION,
			w3c_caps(json!({"platformName": "Fake", "appium:eventTimings": true})),
		)
		.await
		.unwrap();
	let caps = executor.execute("getSession", vec![]).await.unwrap();
	assert!(caps["events"][EVENT_SESSION_INIT].is_array());
	assert!(caps["events"][EVENT_SESSION_START].is_array());
}

#[tokio::test]
async fn test_custom_events_and_filtering() {
	let executor = CommandExecutor::new(Fake::default());
	executor
		.execute("logCustomEvent", vec![json!("acme"), json!("launched")])
		.await
		.unwrap();

	let events = executor
		.execute("getLogEvents", vec![json!("acme:launched")])
		.await
		.unwrap();
	let keys: Vec<&String> = events.as_object().unwrap().keys().collect();
	assert_eq!(keys, ["acme:launched"]);

	let all = executor.execute("getLogEvents", vec![]).await.unwrap();
	assert!(all["commands"].as_array().unwrap().iter().any(|c| c["cmd"] == "logCustomEvent"));
}

#[tokio::test]
async fn test_delete_session_records_lifecycle_events() {
	let executor = CommandExecutor::new(Fake::default());
	let id = started(&executor).await;
	executor.execute(DELETE_SESSION, vec![json!(id)]).await.unwrap();

	let history = executor.event_history();
	assert!(history[EVENT_SESSION_QUIT_START].is_array());
	assert!(history[EVENT_SESSION_QUIT_DONE].is_array());
	assert!(executor.session_id().is_none());
	assert_eq!(executor.new_command_timeout(), DEFAULT_NEW_COMMAND_TIMEOUT);
}

#[tokio::test]
async fn test_proxy_without_downstream_fails() {
	let executor = CommandExecutor::new(Fake::default());
	assert!(!executor.proxy_active(None));
	let err = executor
		.proxy_req_res(HttpMethod::Get, "/session/abc/url", None)
		.await
		.unwrap_err();
	assert!(err.is_kind(ErrorKind::UnknownError));
	assert_eq!(executor.command_history().last().unwrap().cmd, PROXY_REQ_RES);
}

#[test]
fn test_image_elements_are_never_proxied() {
	let executor = CommandExecutor::new(Fake::default());
	let path = format!("/session/abc/element/{IMAGE_ELEMENT_PREFIX}1/click");
	assert!(executor.proxy_route_is_avoided(Some("abc"), HttpMethod::Post, &path, None));
	let body = json!({"id": format!("{IMAGE_ELEMENT_PREFIX}2")});
	assert!(executor.proxy_route_is_avoided(Some("abc"), HttpMethod::Post, "/session/abc/touch/click", Some(&body)));
	assert!(!executor.proxy_route_is_avoided(Some("abc"), HttpMethod::Get, "/session/abc/url", None));
}

#[test]
fn test_parse_timeout() {
	assert_eq!(parse_timeout(&json!(10)).unwrap(), 10);
	assert_eq!(parse_timeout(&json!("25")).unwrap(), 25);
	assert!(parse_timeout(&json!("soon")).is_err());
	assert!(parse_timeout(&Value::Null).is_err());
}
