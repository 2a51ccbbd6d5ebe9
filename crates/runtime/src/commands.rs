//! Command groups a backend can implement.
//!
//! Each group is a trait over [`Driver`] plus a `register_*` function that wires
//! its methods into a [`CommandRegistry`] under the WebDriver command names.
//! A backend implements the groups it supports and calls their `register_*`
//! functions from [`Driver::register_commands`].

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use wd_protocol::{Result, W3C_ELEMENT_KEY};

use crate::driver::{CommandRegistry, Driver};

/// Element reference as returned to clients; the dispatcher adds the legacy key.
pub fn element_ref(id: impl Into<String>) -> Value {
	let mut obj = Map::new();
	obj.insert(W3C_ELEMENT_KEY.to_string(), Value::String(id.into()));
	Value::Object(obj)
}

/// Window geometry in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
	pub x: f64,
	pub y: f64,
	pub width: f64,
	pub height: f64,
}

impl Rect {
	fn to_value(self) -> Value {
		json!({"x": self.x, "y": self.y, "width": self.width, "height": self.height})
	}
}

#[async_trait]
pub trait NavigationCommands: Driver {
	async fn get_url(&self) -> Result<String>;
	async fn set_url(&self, url: &str) -> Result<()>;
	async fn back(&self) -> Result<()>;
	async fn forward(&self) -> Result<()>;
	async fn refresh(&self) -> Result<()>;
	async fn title(&self) -> Result<String>;
}

pub fn register_navigation<D: NavigationCommands>(registry: &mut CommandRegistry<D>) {
	registry.register("getUrl", |d, _| async move { d.get_url().await.map(Value::from) });
	registry.register("setUrl", |d, args| async move {
		let url = args.string(0, "url")?;
		d.set_url(&url).await.map(|()| Value::Null)
	});
	registry.register("back", |d, _| async move { d.back().await.map(|()| Value::Null) });
	registry.register("forward", |d, _| async move { d.forward().await.map(|()| Value::Null) });
	registry.register("refresh", |d, _| async move { d.refresh().await.map(|()| Value::Null) });
	registry.register("title", |d, _| async move { d.title().await.map(Value::from) });
}

/// Element lookup and interaction. Element ids are opaque strings.
#[async_trait]
pub trait ElementCommands: Driver {
	async fn find_element(&self, using: &str, value: &str, parent: Option<&str>) -> Result<String>;
	async fn find_elements(&self, using: &str, value: &str, parent: Option<&str>) -> Result<Vec<String>>;
	async fn click(&self, element: &str) -> Result<()>;
	async fn clear(&self, element: &str) -> Result<()>;
	async fn get_text(&self, element: &str) -> Result<String>;
	async fn get_name(&self, element: &str) -> Result<String>;
	/// `keys` holds either a string or a list of strings, as sent by the client.
	async fn set_value(&self, element: &str, keys: &Value) -> Result<()>;
	async fn get_attribute(&self, element: &str, name: &str) -> Result<Value>;

	async fn get_property(&self, element: &str, name: &str) -> Result<Value> {
		self.get_attribute(element, name).await
	}

	async fn is_displayed(&self, element: &str) -> Result<bool>;
	async fn is_enabled(&self, element: &str) -> Result<bool>;
	async fn is_selected(&self, element: &str) -> Result<bool>;
}

pub fn register_elements<D: ElementCommands>(registry: &mut CommandRegistry<D>) {
	registry.register("findElement", |d, args| async move {
		let (using, value) = (args.string(0, "using")?, args.string(1, "value")?);
		d.find_element(&using, &value, None).await.map(element_ref)
	});
	registry.register("findElements", |d, args| async move {
		let (using, value) = (args.string(0, "using")?, args.string(1, "value")?);
		let found = d.find_elements(&using, &value, None).await?;
		Ok(Value::Array(found.into_iter().map(element_ref).collect()))
	});
	registry.register("findElementFromElement", |d, args| async move {
		let (using, value) = (args.string(0, "using")?, args.string(1, "value")?);
		let parent = args.string(2, "elementId")?;
		d.find_element(&using, &value, Some(&parent)).await.map(element_ref)
	});
	registry.register("findElementsFromElement", |d, args| async move {
		let (using, value) = (args.string(0, "using")?, args.string(1, "value")?);
		let parent = args.string(2, "elementId")?;
		let found = d.find_elements(&using, &value, Some(&parent)).await?;
		Ok(Value::Array(found.into_iter().map(element_ref).collect()))
	});
	registry.register("click", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.click(&element).await.map(|()| Value::Null)
	});
	registry.register("clear", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.clear(&element).await.map(|()| Value::Null)
	});
	registry.register("getText", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.get_text(&element).await.map(Value::from)
	});
	registry.register("getName", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.get_name(&element).await.map(Value::from)
	});
	registry.register("setValue", |d, args| async move {
		let element = args.string(1, "elementId")?;
		d.set_value(&element, args.get(0)).await.map(|()| Value::Null)
	});
	registry.register("getAttribute", |d, args| async move {
		let (name, element) = (args.string(0, "name")?, args.string(1, "elementId")?);
		d.get_attribute(&element, &name).await
	});
	registry.register("getProperty", |d, args| async move {
		let (name, element) = (args.string(0, "name")?, args.string(1, "elementId")?);
		d.get_property(&element, &name).await
	});
	registry.register("elementDisplayed", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.is_displayed(&element).await.map(Value::from)
	});
	registry.register("elementEnabled", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.is_enabled(&element).await.map(Value::from)
	});
	registry.register("elementSelected", |d, args| async move {
		let element = args.string(0, "elementId")?;
		d.is_selected(&element).await.map(Value::from)
	});
}

#[async_trait]
pub trait WindowCommands: Driver {
	async fn window_handle(&self) -> Result<String>;
	async fn window_handles(&self) -> Result<Vec<String>>;
	async fn switch_to_window(&self, handle: &str) -> Result<()>;
	/// Closes the current window and returns the remaining handles.
	async fn close_window(&self) -> Result<Vec<String>>;
	async fn window_rect(&self) -> Result<Rect>;
	async fn set_window_rect(&self, rect: Rect) -> Result<Rect>;
	async fn maximize_window(&self) -> Result<Rect>;
}

pub fn register_windows<D: WindowCommands>(registry: &mut CommandRegistry<D>) {
	registry.register("getWindowHandle", |d, _| async move { d.window_handle().await.map(Value::from) });
	registry.register("getWindowHandles", |d, _| async move { d.window_handles().await.map(Value::from) });
	registry.register("setWindow", |d, args| async move {
		// name for MJSONWP clients, handle for W3C
		let handle = args.opt_string(1).or_else(|| args.opt_string(0)).unwrap_or_default();
		d.switch_to_window(&handle).await.map(|()| Value::Null)
	});
	registry.register("closeWindow", |d, _| async move { d.close_window().await.map(Value::from) });
	registry.register("getWindowRect", |d, _| async move { d.window_rect().await.map(Rect::to_value) });
	registry.register("setWindowRect", |d, args| async move {
		let number = |i: usize| args.get(i).as_f64().unwrap_or_default();
		let rect = Rect {
			x: number(0),
			y: number(1),
			width: number(2),
			height: number(3),
		};
		d.set_window_rect(rect).await.map(Rect::to_value)
	});
	registry.register("maximizeWindow", |d, _| async move { d.maximize_window().await.map(Rect::to_value) });
}

/// Script execution in the application under test.
#[async_trait]
pub trait ScriptCommands: Driver {
	async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value>;

	async fn execute_async(&self, script: &str, args: Vec<Value>) -> Result<Value> {
		self.execute(script, args).await
	}
}

pub fn register_scripts<D: ScriptCommands>(registry: &mut CommandRegistry<D>) {
	registry.register("execute", |d, args| async move {
		let script = args.string(0, "script")?;
		d.execute(&script, script_args(args.get(1))).await
	});
	registry.register("executeAsync", |d, args| async move {
		let script = args.string(0, "script")?;
		d.execute_async(&script, script_args(args.get(1))).await
	});
}

fn script_args(value: &Value) -> Vec<Value> {
	match value {
		Value::Array(items) => items.clone(),
		Value::Null => Vec::new(),
		other => vec![other.clone()],
	}
}
