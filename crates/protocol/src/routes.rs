//! Route table: path template and HTTP method to command name and payload rules.
//!
//! Templates use `:name` segments for ids. Matching is segment-wise; a parameter
//! segment matches any single segment, including an empty one. The table is
//! ordered and the first matching template wins.


use std::fmt;

use serde_json::Value;

use crate::protocol::Protocol;

/// HTTP methods the route table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
	Get,
	Post,
	Delete,
}

impl HttpMethod {
	/// Case-insensitive parse.
	pub fn parse(method: &str) -> Option<Self> {
		match method.to_ascii_uppercase().as_str() {
			"GET" => Some(Self::Get),
			"POST" => Some(Self::Post),
			"DELETE" => Some(Self::Delete),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Get => "GET",
			Self::Post => "POST",
			Self::Delete => "DELETE",
		}
	}
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Required parameter sets for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Required {
	None,
	All(&'static [&'static str]),
	/// Alternative sets; the payload must match exactly one of them.
	AnyOf(&'static [&'static [&'static str]]),
}

impl Required {
	pub fn sets(&self) -> Vec<&'static [&'static str]> {
		match self {
			Self::None => Vec::new(),
			Self::All(names) => vec![*names],
			Self::AnyOf(sets) => sets.to_vec(),
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			Self::None => true,
			Self::All(names) => names.is_empty(),
			Self::AnyOf(sets) => sets.is_empty(),
		}
	}
}

/// Custom shape check; returns an error message when the payload is rejected.
pub type Validator = fn(&Value, Option<Protocol>) -> Option<String>;
/// Custom argument construction from the payload.
pub type ArgsBuilder = fn(&Value, Option<Protocol>) -> Vec<Value>;

/// Payload rules of a single route method.
#[derive(Clone, Copy)]
pub struct PayloadParams {
	pub required: Required,
	pub optional: &'static [&'static str],
	/// Box a bare array or primitive body under this key before validation.
	pub wrap: Option<&'static str>,
	/// Unbox a `{key: {...}}` envelope before validation.
	pub unwrap: Option<&'static str>,
	pub validate: Option<Validator>,
	pub make_args: Option<ArgsBuilder>,
}

impl PayloadParams {
	pub const EMPTY: Self = Self {
		required: Required::None,
		optional: &[],
		wrap: None,
		unwrap: None,
		validate: None,
		make_args: None,
	};
}

impl fmt::Debug for PayloadParams {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PayloadParams")
			.field("required", &self.required)
			.field("optional", &self.optional)
			.field("wrap", &self.wrap)
			.field("unwrap", &self.unwrap)
			.field("validate", &self.validate.is_some())
			.field("make_args", &self.make_args.is_some())
			.finish()
	}
}

/// What a route does for one HTTP method.
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
	/// `None` marks an endpoint that is recognized but never implemented.
	pub command: Option<&'static str>,
	pub payload: Option<PayloadParams>,
	pub deprecated: bool,
	pub never_proxy: bool,
}

impl MethodSpec {
	pub const fn command(name: &'static str) -> Self {
		Self {
			command: Some(name),
			payload: None,
			deprecated: false,
			never_proxy: false,
		}
	}

	pub const fn unimplemented() -> Self {
		Self {
			command: None,
			payload: None,
			deprecated: false,
			never_proxy: false,
		}
	}

	pub const fn deprecated(mut self) -> Self {
		self.deprecated = true;
		self
	}

	pub const fn never_proxy(mut self) -> Self {
		self.never_proxy = true;
		self
	}

	pub const fn required(mut self, names: &'static [&'static str]) -> Self {
		let mut params = self.params();
		params.required = Required::All(names);
		self.payload = Some(params);
		self
	}

	pub const fn required_any(mut self, sets: &'static [&'static [&'static str]]) -> Self {
		let mut params = self.params();
		params.required = Required::AnyOf(sets);
		self.payload = Some(params);
		self
	}

	pub const fn optional(mut self, names: &'static [&'static str]) -> Self {
		let mut params = self.params();
		params.optional = names;
		self.payload = Some(params);
		self
	}

	pub const fn wrap(mut self, key: &'static str) -> Self {
		let mut params = self.params();
		params.wrap = Some(key);
		self.payload = Some(params);
		self
	}

	pub const fn unwrap(mut self, key: &'static str) -> Self {
		let mut params = self.params();
		params.unwrap = Some(key);
		self.payload = Some(params);
		self
	}

	pub const fn validate(mut self, validator: Validator) -> Self {
		let mut params = self.params();
		params.validate = Some(validator);
		self.payload = Some(params);
		self
	}

	pub const fn make_args(mut self, builder: ArgsBuilder) -> Self {
		let mut params = self.params();
		params.make_args = Some(builder);
		self.payload = Some(params);
		self
	}

	/// Payload rules, or the empty set when the route declares none.
	pub const fn params(&self) -> PayloadParams {
		match self.payload {
			Some(params) => params,
			None => PayloadParams::EMPTY,
		}
	}
}

/// One path template and the methods it serves.
#[derive(Debug)]
pub struct RouteDef {
	pub path: &'static str,
	pub methods: &'static [(HttpMethod, MethodSpec)],
}

impl RouteDef {
	pub fn method(&self, method: HttpMethod) -> Option<&MethodSpec> {
		self.methods
			.iter()
			.find(|(m, _)| *m == method)
			.map(|(_, spec)| spec)
	}

	/// Matches `path` against this template, returning URL params in template order.
	pub fn match_path(&self, path: &str) -> Option<Vec<(&'static str, String)>> {
		match_template(self.path, path)
	}
}

/// A route resolved for a concrete request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
	pub route: &'static RouteDef,
	pub method: HttpMethod,
	pub spec: &'static MethodSpec,
	/// URL params in template order.
	pub params: Vec<(&'static str, String)>,
}

impl RouteMatch {
	pub fn param(&self, name: &str) -> Option<&str> {
		self.params
			.iter()
			.find(|(n, _)| *n == name)
			.map(|(_, v)| v.as_str())
	}

	pub fn session_id(&self) -> Option<&str> {
		self.param("sessionId")
	}
}

macro_rules! routes {
	(
		$(
			$path:literal => { $($method:ident => $spec:expr),+ $(,)? }
		),+ $(,)?
	) => {
		/// Every known route, in match priority order.
		pub static METHOD_MAP: &[RouteDef] = &[
			$(
				RouteDef {
					path: $path,
					methods: &[$((HttpMethod::$method, $spec)),+],
				}
			),+
		];
	};
}

use MethodSpec as M;

routes! {
	"/status" => { Get => M::command("getStatus") },
	"/session" => {
		Post => M::command("createSession")
			.optional(&["desiredCapabilities", "requiredCapabilities", "capabilities"])
			.validate(validate_create_session),
	},
	"/sessions" => { Get => M::command("getSessions") },
	"/session/:sessionId" => {
		Get => M::command("getSession"),
		Delete => M::command("deleteSession"),
	},
	"/session/:sessionId/timeouts" => {
		Get => M::command("getTimeouts"),
		Post => M::command("timeouts")
			.optional(&["type", "ms", "script", "pageLoad", "implicit"])
			.validate(validate_timeouts),
	},
	"/session/:sessionId/timeouts/async_script" => {
		Post => M::command("asyncScriptTimeout").required(&["ms"]).deprecated(),
	},
	"/session/:sessionId/timeouts/implicit_wait" => {
		Post => M::command("implicitWait").required(&["ms"]).deprecated(),
	},
	"/session/:sessionId/window_handle" => { Get => M::command("getWindowHandle") },
	"/session/:sessionId/window/handle" => { Get => M::command("getWindowHandle") },
	"/session/:sessionId/window_handles" => { Get => M::command("getWindowHandles") },
	"/session/:sessionId/window/handles" => { Get => M::command("getWindowHandles") },
	"/session/:sessionId/url" => {
		Get => M::command("getUrl"),
		Post => M::command("setUrl").required(&["url"]),
	},
	"/session/:sessionId/forward" => { Post => M::command("forward") },
	"/session/:sessionId/back" => { Post => M::command("back") },
	"/session/:sessionId/refresh" => { Post => M::command("refresh") },
	"/session/:sessionId/execute" => {
		Post => M::command("execute").required(&["script", "args"]),
	},
	"/session/:sessionId/execute_async" => {
		Post => M::command("executeAsync").required(&["script", "args"]),
	},
	"/session/:sessionId/screenshot" => { Get => M::command("getScreenshot") },
	"/session/:sessionId/ime/available_engines" => {
		Get => M::command("availableIMEEngines").deprecated(),
	},
	"/session/:sessionId/ime/active_engine" => {
		Get => M::command("getActiveIMEEngine").deprecated(),
	},
	"/session/:sessionId/ime/activated" => { Get => M::command("isIMEActivated").deprecated() },
	"/session/:sessionId/ime/deactivate" => {
		Post => M::command("deactivateIMEEngine").deprecated(),
	},
	"/session/:sessionId/ime/activate" => {
		Post => M::command("activateIMEEngine").required(&["engine"]).deprecated(),
	},
	"/session/:sessionId/frame" => { Post => M::command("setFrame").required(&["id"]) },
	"/session/:sessionId/frame/parent" => { Post => M::command("switchToParentFrame") },
	"/session/:sessionId/window" => {
		Get => M::command("getWindowHandle"),
		Post => M::command("setWindow")
			.optional(&["name", "handle"])
			.make_args(set_window_args)
			.validate(validate_set_window),
		Delete => M::command("closeWindow"),
	},
	"/session/:sessionId/window/:windowhandle/size" => {
		Get => M::command("getWindowSize").deprecated(),
	},
	"/session/:sessionId/window/:windowhandle/position" => {
		Post => M::unimplemented().deprecated(),
		Get => M::unimplemented().deprecated(),
	},
	"/session/:sessionId/window/:windowhandle/maximize" => {
		Post => M::command("maximizeWindow"),
	},
	"/session/:sessionId/cookie" => {
		Get => M::command("getCookies"),
		Post => M::command("setCookie").required(&["cookie"]),
		Delete => M::command("deleteCookies"),
	},
	"/session/:sessionId/cookie/:name" => {
		Get => M::command("getCookie"),
		Delete => M::command("deleteCookie"),
	},
	"/session/:sessionId/source" => { Get => M::command("getPageSource") },
	"/session/:sessionId/title" => { Get => M::command("title") },
	"/session/:sessionId/element" => {
		Post => M::command("findElement").required(&["using", "value"]),
	},
	"/session/:sessionId/elements" => {
		Post => M::command("findElements").required(&["using", "value"]),
	},
	"/session/:sessionId/element/active" => {
		Get => M::command("active"),
		Post => M::command("active"),
	},
	"/session/:sessionId/element/:elementId" => { Get => M::unimplemented() },
	"/session/:sessionId/element/:elementId/element" => {
		Post => M::command("findElementFromElement").required(&["using", "value"]),
	},
	"/session/:sessionId/element/:elementId/elements" => {
		Post => M::command("findElementsFromElement").required(&["using", "value"]),
	},
	"/session/:sessionId/element/:elementId/click" => { Post => M::command("click") },
	"/session/:sessionId/element/:elementId/submit" => {
		Post => M::command("submit").deprecated(),
	},
	"/session/:sessionId/element/:elementId/text" => { Get => M::command("getText") },
	"/session/:sessionId/element/:elementId/value" => {
		Post => M::command("setValue")
			.optional(&["value", "text"])
			.validate(validate_set_value)
			.make_args(value_or_text_args),
	},
	"/session/:sessionId/keys" => {
		Post => M::command("keys").required(&["value"]).deprecated(),
	},
	"/session/:sessionId/element/:elementId/name" => { Get => M::command("getName") },
	"/session/:sessionId/element/:elementId/clear" => { Post => M::command("clear") },
	"/session/:sessionId/element/:elementId/selected" => {
		Get => M::command("elementSelected"),
	},
	"/session/:sessionId/element/:elementId/enabled" => { Get => M::command("elementEnabled") },
	"/session/:sessionId/element/:elementId/attribute/:name" => {
		Get => M::command("getAttribute"),
	},
	"/session/:sessionId/element/:elementId/equals/:otherId" => {
		Get => M::command("equalsElement").deprecated(),
	},
	"/session/:sessionId/element/:elementId/displayed" => {
		Get => M::command("elementDisplayed"),
	},
	"/session/:sessionId/element/:elementId/location" => {
		Get => M::command("getLocation").deprecated(),
	},
	"/session/:sessionId/element/:elementId/location_in_view" => {
		Get => M::command("getLocationInView").deprecated(),
	},
	"/session/:sessionId/element/:elementId/size" => {
		Get => M::command("getSize").deprecated(),
	},
	"/session/:sessionId/element/:elementId/shadow" => {
		Get => M::command("elementShadowRoot"),
	},
	"/session/:sessionId/shadow/:shadowId/element" => {
		Post => M::command("findElementFromShadowRoot").required(&["using", "value"]),
	},
	"/session/:sessionId/shadow/:shadowId/elements" => {
		Post => M::command("findElementsFromShadowRoot").required(&["using", "value"]),
	},
	"/session/:sessionId/element/:elementId/css/:propertyName" => {
		Get => M::command("getCssProperty"),
	},
	"/session/:sessionId/orientation" => {
		Get => M::command("getOrientation"),
		Post => M::command("setOrientation").required(&["orientation"]),
	},
	"/session/:sessionId/element/:elementId/computedrole" => {
		Get => M::command("getComputedRole"),
	},
	"/session/:sessionId/element/:elementId/computedlabel" => {
		Get => M::command("getComputedLabel"),
	},
	"/session/:sessionId/rotation" => {
		Get => M::command("getRotation"),
		Post => M::command("setRotation").required(&["x", "y", "z"]),
	},
	"/session/:sessionId/moveto" => {
		Post => M::command("moveTo").optional(&["element", "xoffset", "yoffset"]).deprecated(),
	},
	"/session/:sessionId/click" => {
		Post => M::command("clickCurrent").optional(&["button"]).deprecated(),
	},
	"/session/:sessionId/buttondown" => {
		Post => M::command("buttonDown").optional(&["button"]).deprecated(),
	},
	"/session/:sessionId/buttonup" => {
		Post => M::command("buttonUp").optional(&["button"]).deprecated(),
	},
	"/session/:sessionId/doubleclick" => { Post => M::command("doubleClick").deprecated() },
	"/session/:sessionId/touch/click" => {
		Post => M::command("click").required(&["element"]).deprecated(),
	},
	"/session/:sessionId/touch/down" => {
		Post => M::command("touchDown").required(&["x", "y"]).deprecated(),
	},
	"/session/:sessionId/touch/up" => {
		Post => M::command("touchUp").required(&["x", "y"]).deprecated(),
	},
	"/session/:sessionId/touch/move" => {
		Post => M::command("touchMove").required(&["x", "y"]).deprecated(),
	},
	"/session/:sessionId/touch/scroll" => { Post => M::unimplemented().deprecated() },
	"/session/:sessionId/touch/doubleclick" => { Post => M::unimplemented() },
	"/session/:sessionId/actions" => {
		Post => M::command("performActions").required(&["actions"]),
		Delete => M::command("releaseActions"),
	},
	"/session/:sessionId/touch/longclick" => {
		Post => M::command("touchLongClick").required(&["elements"]).deprecated(),
	},
	"/session/:sessionId/touch/flick" => {
		Post => M::command("flick")
			.optional(&["element", "xspeed", "yspeed", "xoffset", "yoffset", "speed"])
			.deprecated(),
	},
	"/session/:sessionId/location" => {
		Get => M::command("getGeoLocation"),
		Post => M::command("setGeoLocation").required(&["location"]),
	},
	"/session/:sessionId/local_storage" => {
		Get => M::unimplemented().deprecated(),
		Post => M::unimplemented().deprecated(),
		Delete => M::unimplemented().deprecated(),
	},
	"/session/:sessionId/local_storage/key/:key" => {
		Get => M::unimplemented().deprecated(),
		Delete => M::unimplemented().deprecated(),
	},
	"/session/:sessionId/local_storage/size" => { Get => M::unimplemented().deprecated() },
	"/session/:sessionId/session_storage" => {
		Get => M::unimplemented().deprecated(),
		Post => M::unimplemented().deprecated(),
		Delete => M::unimplemented().deprecated(),
	},
	"/session/:sessionId/session_storage/key/:key" => {
		Get => M::unimplemented().deprecated(),
		Delete => M::unimplemented().deprecated(),
	},
	"/session/:sessionId/session_storage/size" => { Get => M::unimplemented().deprecated() },
	"/session/:sessionId/se/log" => { Post => M::command("getLog").required(&["type"]) },
	"/session/:sessionId/se/log/types" => { Get => M::command("getLogTypes") },
	"/session/:sessionId/log" => { Post => M::command("getLog").required(&["type"]) },
	"/session/:sessionId/log/types" => { Get => M::command("getLogTypes") },
	"/session/:sessionId/application_cache/status" => { Get => M::unimplemented() },
	"/session/:sessionId/context" => {
		Get => M::command("getCurrentContext"),
		Post => M::command("setContext").required(&["name"]),
	},
	"/session/:sessionId/contexts" => { Get => M::command("getContexts") },
	"/session/:sessionId/element/:elementId/pageIndex" => {
		Get => M::command("getPageIndex").deprecated(),
	},
	"/session/:sessionId/network_connection" => {
		Get => M::command("getNetworkConnection"),
		Post => M::command("setNetworkConnection").unwrap("parameters").required(&["type"]),
	},
	"/session/:sessionId/touch/perform" => {
		Post => M::command("performTouch").wrap("actions").required(&["actions"]).deprecated(),
	},
	"/session/:sessionId/touch/multi/perform" => {
		Post => M::command("performMultiAction")
			.required(&["actions"])
			.optional(&["elementId"])
			.deprecated(),
	},
	"/session/:sessionId/receive_async_response" => {
		Post => M::command("receiveAsyncResponse").required(&["status", "value"]),
	},
	"/session/:sessionId/appium/device/shake" => {
		Post => M::command("mobileShake").deprecated(),
	},
	"/session/:sessionId/appium/device/system_time" => {
		Get => M::command("getDeviceTime").optional(&["format"]),
		Post => M::command("getDeviceTime").optional(&["format"]),
	},
	"/session/:sessionId/appium/device/lock" => {
		Post => M::command("lock").optional(&["seconds"]).deprecated(),
	},
	"/session/:sessionId/appium/device/unlock" => { Post => M::command("unlock").deprecated() },
	"/session/:sessionId/appium/device/is_locked" => {
		Post => M::command("isLocked").deprecated(),
	},
	"/session/:sessionId/appium/start_recording_screen" => {
		Post => M::command("startRecordingScreen").optional(&["options"]).deprecated(),
	},
	"/session/:sessionId/appium/stop_recording_screen" => {
		Post => M::command("stopRecordingScreen").optional(&["options"]).deprecated(),
	},
	"/session/:sessionId/appium/performanceData/types" => {
		Post => M::command("getPerformanceDataTypes").deprecated(),
	},
	"/session/:sessionId/appium/getPerformanceData" => {
		Post => M::command("getPerformanceData")
			.required(&["packageName", "dataType"])
			.optional(&["dataReadTimeout"])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/press_keycode" => {
		Post => M::command("pressKeyCode")
			.required(&["keycode"])
			.optional(&["metastate", "flags"])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/long_press_keycode" => {
		Post => M::command("longPressKeyCode")
			.required(&["keycode"])
			.optional(&["metastate", "flags"])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/finger_print" => {
		Post => M::command("fingerprint").required(&["fingerprintId"]).deprecated(),
	},
	"/session/:sessionId/appium/device/send_sms" => {
		Post => M::command("sendSMS").required(&["phoneNumber", "message"]).deprecated(),
	},
	"/session/:sessionId/appium/device/gsm_call" => {
		Post => M::command("gsmCall").required(&["phoneNumber", "action"]).deprecated(),
	},
	"/session/:sessionId/appium/device/gsm_signal" => {
		Post => M::command("gsmSignal").required(&["signalStrength"]).deprecated(),
	},
	"/session/:sessionId/appium/device/gsm_voice" => {
		Post => M::command("gsmVoice").required(&["state"]).deprecated(),
	},
	"/session/:sessionId/appium/device/power_capacity" => {
		Post => M::command("powerCapacity").required(&["percent"]).deprecated(),
	},
	"/session/:sessionId/appium/device/power_ac" => {
		Post => M::command("powerAC").required(&["state"]).deprecated(),
	},
	"/session/:sessionId/appium/device/network_speed" => {
		Post => M::command("networkSpeed").required(&["netspeed"]).deprecated(),
	},
	"/session/:sessionId/appium/device/keyevent" => {
		Post => M::command("keyevent")
			.required(&["keycode"])
			.optional(&["metastate"])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/current_activity" => {
		Get => M::command("getCurrentActivity").deprecated(),
	},
	"/session/:sessionId/appium/device/current_package" => {
		Get => M::command("getCurrentPackage").deprecated(),
	},
	"/session/:sessionId/appium/device/install_app" => {
		Post => M::command("installApp").required(&["appPath"]).optional(&["options"]),
	},
	"/session/:sessionId/appium/device/activate_app" => {
		Post => M::command("activateApp")
			.required_any(&[&["appId"], &["bundleId"]])
			.optional(&["options"]),
	},
	"/session/:sessionId/appium/device/remove_app" => {
		Post => M::command("removeApp")
			.required_any(&[&["appId"], &["bundleId"]])
			.optional(&["options"]),
	},
	"/session/:sessionId/appium/device/terminate_app" => {
		Post => M::command("terminateApp")
			.required_any(&[&["appId"], &["bundleId"]])
			.optional(&["options"]),
	},
	"/session/:sessionId/appium/device/app_installed" => {
		Post => M::command("isAppInstalled").required_any(&[&["appId"], &["bundleId"]]),
	},
	"/session/:sessionId/appium/device/app_state" => {
		Get => M::command("queryAppState").required_any(&[&["appId"], &["bundleId"]]),
		Post => M::command("queryAppState")
			.required_any(&[&["appId"], &["bundleId"]])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/hide_keyboard" => {
		Post => M::command("hideKeyboard").optional(&["strategy", "key", "keyCode", "keyName"]),
	},
	"/session/:sessionId/appium/device/is_keyboard_shown" => {
		Get => M::command("isKeyboardShown"),
	},
	"/session/:sessionId/appium/device/push_file" => {
		Post => M::command("pushFile").required(&["path", "data"]),
	},
	"/session/:sessionId/appium/device/pull_file" => {
		Post => M::command("pullFile").required(&["path"]),
	},
	"/session/:sessionId/appium/device/pull_folder" => {
		Post => M::command("pullFolder").required(&["path"]),
	},
	"/session/:sessionId/appium/device/toggle_airplane_mode" => {
		Post => M::command("toggleFlightMode").deprecated(),
	},
	"/session/:sessionId/appium/device/toggle_data" => {
		Post => M::command("toggleData").deprecated(),
	},
	"/session/:sessionId/appium/device/toggle_wifi" => {
		Post => M::command("toggleWiFi").deprecated(),
	},
	"/session/:sessionId/appium/device/toggle_location_services" => {
		Post => M::command("toggleLocationServices").deprecated(),
	},
	"/session/:sessionId/appium/device/open_notifications" => {
		Post => M::command("openNotifications").deprecated(),
	},
	"/session/:sessionId/appium/device/start_activity" => {
		Post => M::command("startActivity")
			.required(&["appPackage", "appActivity"])
			.optional(&[
				"appWaitPackage",
				"appWaitActivity",
				"intentAction",
				"intentCategory",
				"intentFlags",
				"optionalIntentArguments",
				"dontStopAppOnReset",
			])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/system_bars" => {
		Get => M::command("getSystemBars").deprecated(),
	},
	"/session/:sessionId/appium/device/display_density" => {
		Get => M::command("getDisplayDensity").deprecated(),
	},
	"/session/:sessionId/appium/simulator/touch_id" => {
		Post => M::command("touchId").required(&["match"]).deprecated(),
	},
	"/session/:sessionId/appium/simulator/toggle_touch_id_enrollment" => {
		Post => M::command("toggleEnrollTouchId").optional(&["enabled"]).deprecated(),
	},
	"/session/:sessionId/appium/app/launch" => { Post => M::command("launchApp").deprecated() },
	"/session/:sessionId/appium/app/close" => { Post => M::command("closeApp").deprecated() },
	"/session/:sessionId/appium/app/reset" => { Post => M::command("reset").deprecated() },
	"/session/:sessionId/appium/app/background" => {
		Post => M::command("background").required(&["seconds"]).deprecated(),
	},
	"/session/:sessionId/appium/app/end_test_coverage" => {
		Post => M::command("endCoverage").required(&["intent", "path"]).deprecated(),
	},
	"/session/:sessionId/appium/app/strings" => {
		Post => M::command("getStrings").optional(&["language", "stringFile"]).deprecated(),
	},
	"/session/:sessionId/appium/element/:elementId/value" => {
		Post => M::command("setValueImmediate").required(&["text"]).deprecated(),
	},
	"/session/:sessionId/appium/element/:elementId/replace_value" => {
		Post => M::command("replaceValue").required(&["text"]).deprecated(),
	},
	"/session/:sessionId/appium/settings" => {
		Post => M::command("updateSettings").required(&["settings"]),
		Get => M::command("getSettings"),
	},
	"/session/:sessionId/appium/receive_async_response" => {
		Post => M::command("receiveAsyncResponse").required(&["response"]).deprecated(),
	},
	"/session/:sessionId/appium/events" => {
		Post => M::command("getLogEvents").optional(&["type"]),
	},
	"/session/:sessionId/appium/log_event" => {
		Post => M::command("logCustomEvent").required(&["vendor", "event"]),
	},
	"/session/:sessionId/alert_text" => {
		Get => M::command("getAlertText"),
		Post => M::command("setAlertText")
			.optional(&["value", "text"])
			.validate(validate_alert_text)
			.make_args(value_or_text_args),
	},
	"/session/:sessionId/accept_alert" => { Post => M::command("postAcceptAlert") },
	"/session/:sessionId/dismiss_alert" => { Post => M::command("postDismissAlert") },
	"/session/:sessionId/alert/text" => {
		Get => M::command("getAlertText"),
		Post => M::command("setAlertText")
			.optional(&["value", "text"])
			.validate(validate_alert_text)
			.make_args(value_or_text_args),
	},
	"/session/:sessionId/alert/accept" => { Post => M::command("postAcceptAlert") },
	"/session/:sessionId/alert/dismiss" => { Post => M::command("postDismissAlert") },
	"/session/:sessionId/element/:elementId/rect" => { Get => M::command("getElementRect") },
	"/session/:sessionId/execute/sync" => {
		Post => M::command("execute").required(&["script", "args"]),
	},
	"/session/:sessionId/execute/async" => {
		Post => M::command("executeAsync").required(&["script", "args"]),
	},
	"/session/:sessionId/screenshot/:elementId" => { Get => M::command("getElementScreenshot") },
	"/session/:sessionId/element/:elementId/screenshot" => {
		Get => M::command("getElementScreenshot"),
	},
	"/session/:sessionId/window/rect" => {
		Get => M::command("getWindowRect"),
		Post => M::command("setWindowRect").required(&["x", "y", "width", "height"]),
	},
	"/session/:sessionId/window/maximize" => { Post => M::command("maximizeWindow") },
	"/session/:sessionId/window/minimize" => { Post => M::command("minimizeWindow") },
	"/session/:sessionId/window/fullscreen" => { Post => M::command("fullScreenWindow") },
	"/session/:sessionId/window/new" => {
		Post => M::command("createNewWindow").optional(&["type"]),
	},
	"/session/:sessionId/element/:elementId/property/:name" => {
		Get => M::command("getProperty"),
	},
	"/session/:sessionId/appium/device/set_clipboard" => {
		Post => M::command("setClipboard")
			.required(&["content"])
			.optional(&["contentType", "label"])
			.deprecated(),
	},
	"/session/:sessionId/appium/device/get_clipboard" => {
		Post => M::command("getClipboard").optional(&["contentType"]).deprecated(),
	},
	"/session/:sessionId/:vendor/cdp/execute" => {
		Post => M::command("executeCdp").required(&["cmd", "params"]),
	},
	"/session/:sessionId/webauthn/authenticator" => {
		Post => M::command("addVirtualAuthenticator")
			.required(&["protocol", "transport"])
			.optional(&["hasResidentKey", "hasUserVerification", "isUserConsenting", "isUserVerified"]),
	},
	"/session/:sessionId/webauthn/authenticator/:authenticatorId" => {
		Delete => M::command("removeVirtualAuthenticator"),
	},
	"/session/:sessionId/webauthn/authenticator/:authenticatorId/credential" => {
		Post => M::command("addAuthCredential")
			.required(&["credentialId", "isResidentCredential", "rpId", "privateKey"])
			.optional(&["userHandle", "signCount"]),
	},
	"/session/:sessionId/webauthn/authenticator/:authenticatorId/credentials" => {
		Get => M::command("getAuthCredential"),
		Delete => M::command("removeAllAuthCredentials"),
	},
	"/session/:sessionId/webauthn/authenticator/:authenticatorId/credentials/:credentialId" => {
		Delete => M::command("removeAuthCredential"),
	},
	"/session/:sessionId/webauthn/authenticator/:authenticatorId/uv" => {
		Post => M::command("setUserAuthVerified").required(&["isUserVerified"]),
	},
}

/// Commands that do not need an existing session.
pub const NO_SESSION_ID_COMMANDS: &[&str] = &["createSession", "getStatus", "getSessions"];

/// Base path used by legacy clients.
pub const DEFAULT_BASE_PATH: &str = "/wd/hub";

/// Whether `command` needs an existing session.
pub fn is_session_command(command: Option<&str>) -> bool {
	command.is_none_or(|name| !NO_SESSION_ID_COMMANDS.contains(&name))
}

/// Every command name in the table, without duplicates, in table order.
pub fn all_commands() -> Vec<&'static str> {
	let mut out: Vec<&'static str> = Vec::new();
	for route in METHOD_MAP {
		for (_, spec) in route.methods {
			match spec.command {
				Some(name) if !out.contains(&name) => out.push(name),
				_ => {}
			}
		}
	}
	out
}

/// Resolves a URL (relative to a session, to `base_path`, or absolute) to a command name.
///
/// Any query string is ignored. Returns `None` when no route or method matches.
pub fn route_to_command_name(endpoint: &str, method: &str, base_path: &str) -> Option<&'static str> {
	let endpoint = endpoint.split('?').next().unwrap_or_default();
	let actual = if endpoint == "/" {
		String::new()
	} else if endpoint.starts_with('/') {
		endpoint.to_string()
	} else {
		format!("/{endpoint}")
	};
	let candidates = [
		format!("{base_path}/session/ignored-session-id{actual}"),
		format!("{base_path}{actual}"),
		actual,
	];

	let route = METHOD_MAP.iter().find(|route| {
		let template = format!("{base_path}{}", route.path);
		candidates
			.iter()
			.any(|candidate| match_template(&template, candidate).is_some())
	})?;
	let method = HttpMethod::parse(method)?;
	route.method(method).and_then(|spec| spec.command)
}

/// Finds the first route whose template matches `path` and which serves `method`.
///
/// `path` must already have the base path removed. A single trailing slash is tolerated.
pub fn find_route(path: &str, method: HttpMethod) -> Option<RouteMatch> {
	let path = match path.strip_suffix('/') {
		Some(trimmed) if !trimmed.is_empty() => trimmed,
		_ => path,
	};
	METHOD_MAP.iter().find_map(|route| {
		let spec = route.method(method)?;
		let params = route.match_path(path)?;
		Some(RouteMatch {
			route,
			method,
			spec,
			params,
		})
	})
}

fn match_template<'t>(template: &'t str, path: &str) -> Option<Vec<(&'t str, String)>> {
	let mut template_segments = template.split('/');
	let mut path_segments = path.split('/');
	let mut params = Vec::new();
	loop {
		match (template_segments.next(), path_segments.next()) {
			(None, None) => return Some(params),
			(Some(expected), Some(actual)) => {
				if let Some(name) = expected.strip_prefix(':') {
					params.push((name, actual.to_string()));
				} else if !expected.eq_ignore_ascii_case(actual) {
					return None;
				}
			}
			_ => return None,
		}
	}
}

/// JS-style truthiness of an optional JSON value.
fn truthy(value: Option<&Value>) -> bool {
	match value {
		None | Some(Value::Null) => false,
		Some(Value::Bool(b)) => *b,
		Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
		Some(Value::String(s)) => !s.is_empty(),
		Some(_) => true,
	}
}

fn has_value(body: &Value, key: &str) -> bool {
	body.get(key).is_some_and(|v| !v.is_null())
}

fn validate_create_session(body: &Value, _: Option<Protocol>) -> Option<String> {
	(!truthy(body.get("capabilities")) && !truthy(body.get("desiredCapabilities")))
		.then(|| "we require one of \"desiredCapabilities\" or \"capabilities\" object".to_string())
}

fn validate_timeouts(body: &Value, protocol: Option<Protocol>) -> Option<String> {
	if protocol == Some(Protocol::W3c) {
		if !has_value(body, "script") && !has_value(body, "pageLoad") && !has_value(body, "implicit") {
			return Some("W3C protocol expects any of script, pageLoad or implicit to be set".into());
		}
	} else if !has_value(body, "type") || !has_value(body, "ms") {
		return Some("MJSONWP protocol requires type and ms".into());
	}
	None
}

fn validate_set_window(body: &Value, _: Option<Protocol>) -> Option<String> {
	(!has_value(body, "name") && !has_value(body, "handle"))
		.then(|| "we require one of \"name\" or \"handle\" to be set".to_string())
}

/// Passes both `name` and `handle` so either dialect's handler finds its value.
fn set_window_args(body: &Value, _: Option<Protocol>) -> Vec<Value> {
	let name = body.get("name").cloned().unwrap_or(Value::Null);
	let handle = body.get("handle").cloned().unwrap_or(Value::Null);
	match (has_value(body, "name"), has_value(body, "handle")) {
		(false, true) => vec![handle.clone(), handle],
		(true, false) => vec![name.clone(), name],
		_ => vec![name, handle],
	}
}

fn validate_set_value(body: &Value, _: Option<Protocol>) -> Option<String> {
	(!has_value(body, "value") && !has_value(body, "text"))
		.then(|| "we require one of \"text\" or \"value\" params".to_string())
}

fn validate_alert_text(body: &Value, _: Option<Protocol>) -> Option<String> {
	(!has_value(body, "value") && !has_value(body, "text"))
		.then(|| "either \"text\" or \"value\" must be set".to_string())
}

/// Prefers `value` over `text`.
fn value_or_text_args(body: &Value, _: Option<Protocol>) -> Vec<Value> {
	let picked = if truthy(body.get("value")) {
		body.get("value")
	} else {
		body.get("text")
	};
	vec![picked.cloned().unwrap_or(Value::Null)]
}
