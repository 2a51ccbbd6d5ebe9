//! `wd`: a WebDriver server relaying MJSONWP and W3C clients to a downstream
//! WebDriver server.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod server;
