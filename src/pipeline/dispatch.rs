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

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error};

use super::middleware::Flow;
use super::plugin::PluginRegistry;
use crate::http::{Request, Response};
use crate::service::panic_message;

/// Runs one decoded request through the started plugins.
///
/// This is the single error boundary of the http path: whatever a plugin, middleware step
/// or route handler returns or panics with ends up as a response here.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Dispatcher { registry }
    }

    pub fn dispatch(&self, request: &mut Request, response: &mut Response) {
        let plugins = self.registry.started_plugins();
        for plugin in plugins.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| plugin.on_request(request, response)));
            match outcome {
                Ok(Ok(Flow::Continue)) if !response.is_sent() => continue,
                Ok(Ok(_)) => {
                    debug!(
                        method = request.method(),
                        path = request.path(),
                        plugin = plugin.id(),
                        status = response.status_code(),
                        "request handled"
                    );
                    return;
                }
                Ok(Err(e)) => {
                    error!(
                        method = request.method(),
                        path = request.path(),
                        plugin = plugin.id(),
                        "request failed: {}",
                        e
                    );
                    Self::internal_error(response);
                    return;
                }
                Err(payload) => {
                    error!(
                        method = request.method(),
                        path = request.path(),
                        plugin = plugin.id(),
                        "request handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    Self::internal_error(response);
                    return;
                }
            }
        }

        if !response.is_sent() {
            debug!(method = request.method(), path = request.path(), "no handler");
            let body = json!({"error": "Not found", "path": request.path()}).to_string();
            *response = Response::new();
            let _ = response.status(404);
            let _ = response.json(body);
        }
    }

    fn internal_error(response: &mut Response) {
        if response.is_sent() {
            return;
        }
        // drop whatever headers or cookies the failed handler had staged
        *response = Response::new();
        let _ = response.status(500);
        let _ = response.json(json!({"error": "Internal server error"}).to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request_from;
    use crate::pipeline::{MiddlewareContext, MiddlewareExtension, Plugin, PluginContext, RoutingExtension};
    use crate::service::ServerConfig;
    use crate::{AppError, AppResult};

    fn started(routing: RoutingExtension, middleware: MiddlewareExtension) -> Dispatcher {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(Arc::new(routing)).unwrap();
        registry.register(Arc::new(middleware)).unwrap();
        let ctx = PluginContext::new(Arc::new(ServerConfig::default()), None, &registry);
        registry.initialize_all(&ctx).unwrap();
        registry.start_all().unwrap();
        Dispatcher::new(registry)
    }

    fn run(dispatcher: &Dispatcher, raw: &str) -> Response {
        let mut req = request_from(raw);
        let mut res = Response::new();
        dispatcher.dispatch(&mut req, &mut res);
        res
    }

    #[test]
    fn unmatched_requests_get_json_404() {
        let dispatcher = started(RoutingExtension::new(), MiddlewareExtension::new());
        let res = run(&dispatcher, "GET /missing\"x HTTP/1.1\r\n\r\n");
        assert_eq!(res.status_code(), 404);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!({"error": "Not found", "path": "/missing\"x"}));
        assert_eq!(res.headers().get("content-type"), Some("application/json"));
    }

    #[test]
    fn errors_and_panics_become_500() {
        let routing = RoutingExtension::new();
        routing
            .router()
            .get("/fail", |_: &mut Request, res: &mut Response| -> AppResult<()> {
                res.header("X-Partial", "yes")?;
                Err(AppError::HandlerError("nope".into()))
            })
            .unwrap();
        routing
            .router()
            .get("/panic", |_: &mut Request, _: &mut Response| -> AppResult<()> {
                panic!("handler bug")
            })
            .unwrap();
        let dispatcher = started(routing, MiddlewareExtension::new());

        for path in ["/fail", "/panic"] {
            let res = run(&dispatcher, &format!("GET {} HTTP/1.1\r\n\r\n", path));
            assert_eq!(res.status_code(), 500);
            let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
            assert_eq!(body, json!({"error": "Internal server error"}));
            assert!(res.headers().get("x-partial").is_none());
        }
    }

    #[test]
    fn middleware_stop_skips_routing() {
        let routing = RoutingExtension::new();
        routing
            .router()
            .get("/secret", |_: &mut Request, res: &mut Response| -> AppResult<()> {
                res.text("secret")
            })
            .unwrap();
        let middleware = MiddlewareExtension::new();
        middleware
            .chain()
            .add("deny", |ctx: &mut MiddlewareContext<'_>| -> AppResult<()> {
                ctx.response_mut().status(403)?;
                ctx.response_mut().text("denied")?;
                ctx.stop();
                Ok(())
            });
        middleware
            .chain()
            .add("never", |_: &mut MiddlewareContext<'_>| -> AppResult<()> {
                panic!("must not run")
            });
        let dispatcher = started(routing, middleware);
        assert_eq!(
            dispatcher.registry.started_plugins()[0].id(),
            crate::pipeline::MIDDLEWARE_EXTENSION
        );

        let res = run(&dispatcher, "GET /secret HTTP/1.1\r\n\r\n");
        assert_eq!(res.status_code(), 403);
        assert_eq!(&res.body()[..], b"denied");
    }
}
