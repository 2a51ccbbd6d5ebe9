//! WebDriver runtime: sessions, command execution and downstream proxying.
//!
//! - **Session registry**: session id to dialect, plus per-session log spans
//! - **Command executor**: serialized per-driver execution, idle timeout, event history
//! - **Session mux**: one executor per session for multi-session hosts
//! - **Proxy**: forwarding to a downstream WebDriver server with dialect conversion
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   wd-core    │  Route dispatch (HTTP <-> commands)
//! └──────┬───────┘
//!        │ CommandTarget
//! ┌──────▼───────┐
//! │  wd-runtime  │  This crate
//! │  ┌────────┐  │
//! │  │  Mux   │  │  session id -> executor
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │  Exec  │  │  lock, idle timer, shutdown race
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Proxy  │  │  downstream HTTP + converter
//! │  └────────┘  │
//! └──────────────┘
//! ```
//!
//! # Decoupling via Driver
//!
//! Backends implement [`Driver`] and register their command handlers in a
//! [`CommandRegistry`]. The executor only ever sees command names and
//! positional arguments.

pub mod commands;
pub mod driver;
pub mod executor;
pub mod history;
pub mod proxy;
pub mod sessions;
pub mod umbrella;

pub use commands::{
	ElementCommands, NavigationCommands, Rect, ScriptCommands, WindowCommands, element_ref, register_elements,
	register_navigation, register_scripts, register_windows,
};
pub use driver::{Args, AvoidRule, CommandFuture, CommandRegistry, Driver, Handler};
pub use executor::{CommandExecutor, DEFAULT_NEW_COMMAND_TIMEOUT, ExecutorOptions};
pub use history::{CommandRecord, EventHistory};
pub use proxy::{JwpProxy, ProxyOptions};
pub use sessions::{SessionRegistry, init_sessions, sessions};
pub use umbrella::{DriverFactory, Reply, SessionMux};
pub use wd_protocol::{Error, Result};
