//! The resource table: handlers keyed by path and method.

use dashmap::DashMap;
use std::sync::Arc;

use kelpie_core::{Code, Message};

/// What a resource handler returns: a response code plus payload.
#[derive(Debug, Clone)]
pub struct ResourceResult {
    /// Response code.
    pub code: Code,
    /// Response payload.
    pub payload: Vec<u8>,
}

impl ResourceResult {
    /// A `2.05 Content` response.
    #[must_use]
    pub fn content(payload: Vec<u8>) -> Self {
        Self {
            code: Code::CONTENT,
            payload,
        }
    }

    /// A `2.04 Changed` response.
    #[must_use]
    pub fn changed(payload: Vec<u8>) -> Self {
        Self {
            code: Code::CHANGED,
            payload,
        }
    }

    /// A `2.01 Created` response.
    #[must_use]
    pub fn created(payload: Vec<u8>) -> Self {
        Self {
            code: Code::CREATED,
            payload,
        }
    }

    /// An arbitrary code with payload.
    #[must_use]
    pub fn with_code(code: Code, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// A `4.00 Bad Request` response.
    #[must_use]
    pub fn bad_request(payload: Vec<u8>) -> Self {
        Self {
            code: Code::BAD_REQUEST,
            payload,
        }
    }
}

/// A resource handler: request message in, result out.
pub type ResourceHandler = Arc<dyn Fn(&Message) -> ResourceResult + Send + Sync>;

/// Handlers keyed by trimmed path plus method code. The `"*"` path is a
/// per-method catch-all consulted first.
pub(crate) struct ResourceTable {
    map: DashMap<String, ResourceHandler>,
}

impl ResourceTable {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    fn key(path: &str, method: Code) -> String {
        format!("{}|{}", path.trim_matches(|c| c == '/' || c == ' '), method.0)
    }

    pub(crate) fn register(&self, method: Code, path: &str, handler: ResourceHandler) {
        self.map.insert(Self::key(path, method), handler);
    }

    pub(crate) fn lookup(&self, path: &str, method: Code) -> Option<ResourceHandler> {
        if let Some(handler) = self.map.get(&Self::key("*", method)) {
            return Some(handler.clone());
        }
        self.map.get(&Self::key(path, method)).map(|h| h.clone())
    }
}
