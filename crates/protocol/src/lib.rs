//! Wire-level building blocks shared by every WebDriver dialect.
//!
//! Nothing here performs I/O. The crate holds the error taxonomy, dialect
//! detection and element-key normalization, the route table, and the capability
//! negotiation algorithm.

pub mod capabilities;
pub mod error;
pub mod protocol;
pub mod routes;

pub use capabilities::{Caps, Constraint, Constraints, process_capabilities};
pub use error::{Error, ErrorKind, ProxyRequestError, Result, render_for_mjsonwp, render_for_w3c};
pub use protocol::{
	MAX_LOG_BODY_LENGTH, MJSONWP_ELEMENT_KEY, Protocol, ResponseBody, W3C_ELEMENT_KEY, determine_protocol,
	duplicate_keys, format_response_value, format_status, is_w3c_caps, truncate_for_log,
};
pub use routes::{HttpMethod, METHOD_MAP, MethodSpec, PayloadParams, Required, RouteDef, RouteMatch};
