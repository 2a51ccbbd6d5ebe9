//! Bounded, process-wide memory of which dialect each session negotiated.
//!
//! Requests can reference a session its owning driver has already forgotten.
//! The registry keeps enough state to format errors for those requests in the
//! client's dialect. Entries are evicted least-recently-used first.

use std::sync::OnceLock;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{Span, info_span};
use wd_protocol::Protocol;

/// Default number of sessions remembered.
pub const DEFAULT_CAPACITY: usize = 100;

const GENERIC_LOGGER: &str = "GENERIC";
const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Default)]
struct Entry {
	protocol: Option<Protocol>,
	logger: Option<Span>,
}

/// LRU map from session id to protocol and logger span.
#[derive(Debug)]
pub struct SessionRegistry {
	capacity: usize,
	entries: Mutex<IndexMap<String, Entry>>,
}

impl SessionRegistry {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			entries: Mutex::new(IndexMap::new()),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Records (or refreshes) the protocol of `id`.
	pub fn put(&self, id: &str, protocol: Protocol) {
		let mut entries = self.entries.lock();
		let mut entry = entries.shift_remove(id).unwrap_or_default();
		if entry.protocol != Some(protocol) {
			entry.logger = None;
		}
		entry.protocol = Some(protocol);
		entries.insert(id.to_string(), entry);
		while entries.len() > self.capacity {
			entries.shift_remove_index(0);
		}
	}

	pub fn get_protocol(&self, id: &str) -> Option<Protocol> {
		let mut entries = self.entries.lock();
		touch(&mut entries, id)?.protocol
	}

	/// Span for logging on behalf of `id`.
	///
	/// Known ids get a cached session span. Unknown ids, or no id, get a span named
	/// after `hint` (or `GENERIC`).
	pub fn get_logger(&self, id: Option<&str>, hint: Option<Protocol>) -> Span {
		let mut entries = self.entries.lock();
		if let Some(id) = id {
			if let Some(entry) = touch(&mut entries, id) {
				if let Some(span) = &entry.logger {
					return span.clone();
				}
				let protocol = entry.protocol.or(hint);
				let span = session_span(id, protocol);
				entry.logger = Some(span.clone());
				return span;
			}
		}
		generic_span(hint)
	}

	/// Drops the cached logger of `id`; the protocol record stays.
	pub fn reset_logger(&self, id: &str) {
		if let Some(entry) = self.entries.lock().get_mut(id) {
			entry.logger = None;
		}
	}

	pub fn remove(&self, id: &str) -> Option<Protocol> {
		self.entries.lock().shift_remove(id).and_then(|e| e.protocol)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.entries.lock().contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

impl Default for SessionRegistry {
	fn default() -> Self {
		Self::new(DEFAULT_CAPACITY)
	}
}

static SESSIONS: OnceLock<SessionRegistry> = OnceLock::new();

/// Process-wide registry.
pub fn sessions() -> &'static SessionRegistry {
	SESSIONS.get_or_init(SessionRegistry::default)
}

/// Sizes the process-wide registry. Has no effect once it was first used.
pub fn init_sessions(capacity: usize) -> &'static SessionRegistry {
	SESSIONS.get_or_init(|| SessionRegistry::new(capacity))
}

fn touch<'a>(entries: &'a mut IndexMap<String, Entry>, id: &str) -> Option<&'a mut Entry> {
	let index = entries.get_index_of(id)?;
	let last = entries.len() - 1;
	entries.move_index(index, last);
	entries.get_index_mut(last).map(|(_, entry)| entry)
}

fn session_span(id: &str, protocol: Option<Protocol>) -> Span {
	let short: String = id.chars().take(SHORT_ID_LEN).collect();
	let protocol = protocol.map_or(GENERIC_LOGGER, Protocol::as_str);
	info_span!(target: "wd.session", "session", id = %short, protocol)
}

fn generic_span(protocol: Option<Protocol>) -> Span {
	let protocol = protocol.map_or(GENERIC_LOGGER, Protocol::as_str);
	info_span!(target: "wd.session", "protocol", name = protocol)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_and_get_protocol() {
		let registry = SessionRegistry::new(4);
		registry.put("a", Protocol::W3c);
		registry.put("b", Protocol::Mjsonwp);
		assert_eq!(registry.get_protocol("a"), Some(Protocol::W3c));
		assert_eq!(registry.get_protocol("b"), Some(Protocol::Mjsonwp));
		assert_eq!(registry.get_protocol("c"), None);
	}

	#[test]
	fn evicts_least_recently_used() {
		let registry = SessionRegistry::new(2);
		registry.put("a", Protocol::W3c);
		registry.put("b", Protocol::W3c);
		// reading "a" makes "b" the oldest
		assert!(registry.get_protocol("a").is_some());
		registry.put("c", Protocol::W3c);
		assert_eq!(registry.len(), 2);
		assert!(registry.contains("a"));
		assert!(!registry.contains("b"));
		assert!(registry.contains("c"));
	}

	#[test]
	fn reset_logger_keeps_protocol() {
		let registry = SessionRegistry::new(2);
		registry.put("abc", Protocol::Mjsonwp);
		let _ = registry.get_logger(Some("abc"), None);
		registry.reset_logger("abc");
		assert_eq!(registry.get_protocol("abc"), Some(Protocol::Mjsonwp));
	}

	#[test]
	fn unknown_ids_get_a_generic_logger() {
		let registry = SessionRegistry::new(2);
		let _ = registry.get_logger(Some("missing"), Some(Protocol::W3c));
		let _ = registry.get_logger(None, None);
		assert!(registry.is_empty());
	}

	#[test]
	fn remove_forgets_session() {
		let registry = SessionRegistry::new(2);
		registry.put("a", Protocol::W3c);
		assert_eq!(registry.remove("a"), Some(Protocol::W3c));
		assert_eq!(registry.remove("a"), None);
	}
}
