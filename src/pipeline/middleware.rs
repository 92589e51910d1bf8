// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::http::{Request, Response};
use crate::routing::normalize_route_path;
use crate::AppResult;

/// Whether a pipeline stage lets the request continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// What one middleware step sees of the request in flight.
pub struct MiddlewareContext<'a> {
    request: &'a mut Request,
    response: &'a mut Response,
    stopped: bool,
}

impl<'a> MiddlewareContext<'a> {
    pub fn new(request: &'a mut Request, response: &'a mut Response) -> Self {
        MiddlewareContext {
            request,
            response,
            stopped: false,
        }
    }

    pub fn request(&self) -> &Request {
        &*self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut *self.request
    }

    pub fn response(&self) -> &Response {
        &*self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut *self.response
    }

    /// Continue with the next step. This is what happens when a step returns without
    /// calling [`stop`](Self::stop).
    pub fn next(&mut self) {
        self.stopped = false;
    }

    /// End the chain after this step; neither later steps nor the router run.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_response_sent(&self) -> bool {
        self.response.is_sent()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.request.set_attribute(key, value);
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.request.attribute(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.request.has_attribute(key)
    }

    pub fn remove_attribute(&mut self, key: &str) -> bool {
        self.request.remove_attribute(key)
    }
}

pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: &mut MiddlewareContext<'_>) -> AppResult<()>;
}

impl<F> Middleware for F
where
    F: Fn(&mut MiddlewareContext<'_>) -> AppResult<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut MiddlewareContext<'_>) -> AppResult<()> {
        self(ctx)
    }
}

struct Entry {
    name: String,
    /// Only requests for this path or below it pass through the step.
    scope: Option<String>,
    middleware: Arc<dyn Middleware>,
}

impl Entry {
    fn applies_to(&self, path: &str) -> bool {
        match &self.scope {
            None => true,
            Some(scope) if scope == "/" => true,
            Some(scope) => {
                path == scope
                    || path
                        .strip_prefix(scope.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// Ordered steps that run before routing.
#[derive(Default)]
pub struct MiddlewareChain {
    entries: RwLock<Vec<Arc<Entry>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware>(&self, name: &str, middleware: M) {
        self.entries.write().push(Arc::new(Entry {
            name: name.to_string(),
            scope: None,
            middleware: Arc::new(middleware),
        }));
    }

    pub fn add_first<M: Middleware>(&self, name: &str, middleware: M) {
        self.entries.write().insert(
            0,
            Arc::new(Entry {
                name: name.to_string(),
                scope: None,
                middleware: Arc::new(middleware),
            }),
        );
    }

    pub fn add_for_path<M: Middleware>(&self, path: &str, name: &str, middleware: M) {
        self.entries.write().push(Arc::new(Entry {
            name: name.to_string(),
            scope: Some(normalize_route_path(path)),
            middleware: Arc::new(middleware),
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// One line per step, in execution order.
    pub fn describe(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .map(|(i, e)| match &e.scope {
                Some(scope) => format!("{}. {} [{}]", i + 1, e.name, scope),
                None => format!("{}. {}", i + 1, e.name),
            })
            .collect()
    }

    /// Run the applicable steps in order. The first step that stops or sends a response
    /// ends the chain with [`Flow::Stop`]; an error ends it and is returned as is.
    pub fn execute(&self, request: &mut Request, response: &mut Response) -> AppResult<Flow> {
        let entries: Vec<Arc<Entry>> = self.entries.read().clone();
        let mut ctx = MiddlewareContext::new(request, response);
        for entry in entries {
            if !entry.applies_to(ctx.request().path()) {
                continue;
            }
            trace!("middleware {} on {}", entry.name, ctx.request().path());
            entry.middleware.handle(&mut ctx)?;
            if ctx.is_stopped() || ctx.is_response_sent() {
                trace!("middleware {} ended the chain", entry.name);
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}
