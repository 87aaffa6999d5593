//! Scripted transport for testing and development.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

use crate::error::{PveError, Result};
use crate::transport::{map_status, ApiRequest, Method, Transport};

/// Canned reply for one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// 2xx with this `data` payload
    Data(Value),
    /// Non-2xx status with a message, translated through the request's
    /// status map like a real response
    Status(u16, String),
}

/// A request the engine issued.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    /// Full path, including any query string
    pub path: String,
    pub body: Option<Value>,
}

/// Mock transport.
///
/// Replies are scripted per `(method, path)` where the path excludes the
/// query string. Each route holds a queue: replies are consumed in order
/// and the last one repeats forever. Requests without a script fail with
/// HTTP 501 so a missing route shows up clearly in test output.
pub struct MockTransport {
    routes: RwLock<HashMap<(Method, String), VecDeque<MockReply>>>,
    calls: RwLock<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
        }
    }

    /// Queue a successful reply.
    pub fn on(&self, method: Method, path: &str, data: Value) -> &Self {
        self.push(method, path, MockReply::Data(data))
    }

    /// Queue an error reply.
    pub fn on_status(&self, method: Method, path: &str, status: u16, message: &str) -> &Self {
        self.push(method, path, MockReply::Status(status, message.to_string()))
    }

    /// Drop any queued replies for a route and install `data` instead.
    pub fn replace(&self, method: Method, path: &str, data: Value) -> &Self {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&(method, path.to_string()));
        }
        self.on(method, path, data)
    }

    fn push(&self, method: Method, path: &str, reply: MockReply) -> &Self {
        if let Ok(mut routes) = self.routes.write() {
            routes
                .entry((method, path.to_string()))
                .or_default()
                .push_back(reply);
        }
        self
    }

    /// Every call issued so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls matching a method and a route (path without query string).
    pub fn calls_to(&self, method: Method, route: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path.split('?').next() == Some(route))
            .collect()
    }

    pub fn call_count(&self, method: Method, route: &str) -> usize {
        self.calls_to(method, route).len()
    }

    fn next_reply(&self, method: Method, route: &str) -> Option<MockReply> {
        let mut routes = self.routes.write().ok()?;
        let queue = routes.get_mut(&(method, route.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        debug!(method = %request.method, path = %request.path, "Mock API request");

        self.calls
            .write()
            .map_err(|_| PveError::UnexpectedResponse("Lock poisoned".to_string()))?
            .push(RecordedCall {
                method: request.method,
                path: request.path.clone(),
                body: request.body.clone(),
            });

        match self.next_reply(request.method, request.route()) {
            Some(MockReply::Data(data)) => Ok(data),
            Some(MockReply::Status(status, message)) => {
                Err(map_status(status, &message, request.status_map))
            }
            None => Err(PveError::Api {
                status: 501,
                message: format!("no mock reply for {} {}", request.method, request.route()),
            }),
        }
    }
}
