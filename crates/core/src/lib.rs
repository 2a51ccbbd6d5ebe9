//! WebDriver route dispatch.
//!
//! [`Dispatcher`] takes transport-neutral [`HttpRequest`]s, matches them against
//! the route table, validates and converts payloads into positional command
//! arguments, runs them on a [`CommandTarget`] and renders the result in the
//! client's dialect (MJSONWP or W3C).
//!
//! ```ignore
//! let executor = CommandExecutor::new(MyDriver::default());
//! let dispatcher = Dispatcher::new(Arc::new(executor)).with_base_path("/wd/hub");
//! let response = dispatcher.handle(HttpRequest::new(HttpMethod::Get, "/wd/hub/status")).await;
//! ```

mod dispatch;
pub mod http;
pub mod params;
pub mod response;
pub mod target;
pub mod validators;

pub use dispatch::Dispatcher;
pub use http::{HttpRequest, HttpResponse};
pub use params::{check_params, make_args, validate_execute_method_params};
pub use target::{CommandTarget, Reply};
pub use validators::validate_command;
pub use wd_protocol::{Error, HttpMethod, Protocol, ResponseBody, Result};
