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

//! The plugins every server starts with. Routing and middleware take part in the request
//! lifecycle; websocket and protocol detection hold tables the connection handler reads.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use super::middleware::{Flow, MiddlewareChain};
use super::plugin::{Plugin, PluginContext, PluginPriority};
use crate::http::{Request, Response};
use crate::network::ProtocolRegistry;
use crate::routing::{PathSpec, Router};
use crate::websocket::{WebSocketEndpoint, WebSocketHandler};
use crate::AppResult;

pub const ROUTING_EXTENSION: &str = "routing";
pub const MIDDLEWARE_EXTENSION: &str = "middleware";
pub const WEBSOCKET_EXTENSION: &str = "websocket";
pub const PROTOCOL_DETECTION_EXTENSION: &str = "protocol-detection";

#[derive(Default)]
pub struct RoutingExtension {
    router: Arc<Router>,
}

impl RoutingExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

impl Plugin for RoutingExtension {
    fn id(&self) -> &str {
        ROUTING_EXTENSION
    }

    fn description(&self) -> &str {
        "method and path routing"
    }

    fn priority(&self) -> PluginPriority {
        PluginPriority::BelowNormal
    }

    fn initialize(&self, ctx: &PluginContext) -> AppResult<()> {
        ctx.log(&format!("{} routes registered", self.router.route_count()));
        Ok(())
    }

    /// A matched route always ends the lifecycle; a handler that wrote nothing yields an
    /// empty response with whatever status it set.
    fn on_request(&self, request: &mut Request, response: &mut Response) -> AppResult<Flow> {
        let Some(found) = self.router.find_route(request.method(), request.path()) else {
            return Ok(Flow::Continue);
        };
        trace!("{} {} matched {}", request.method(), request.path(), found.route);
        request.set_params(found.params);
        found.handler.handle(request, response)?;
        if !response.is_sent() {
            response.send(Bytes::new())?;
        }
        Ok(Flow::Stop)
    }
}

#[derive(Default)]
pub struct MiddlewareExtension {
    chain: Arc<MiddlewareChain>,
}

impl MiddlewareExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(&self) -> &Arc<MiddlewareChain> {
        &self.chain
    }
}

impl Plugin for MiddlewareExtension {
    fn id(&self) -> &str {
        MIDDLEWARE_EXTENSION
    }

    fn description(&self) -> &str {
        "ordered request middleware"
    }

    fn on_request(&self, request: &mut Request, response: &mut Response) -> AppResult<Flow> {
        self.chain.execute(request, response)
    }
}

/// Websocket endpoints by path. Paths use the router's syntax, so `/chat/:room` works.
#[derive(Default)]
pub struct WebSocketExtension {
    endpoints: RwLock<Vec<(PathSpec, Arc<WebSocketEndpoint>)>>,
}

impl WebSocketExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for upgrades on `path`, replacing an earlier one for the same path.
    pub fn register<H: WebSocketHandler>(&self, path: &str, handler: H) -> AppResult<Arc<WebSocketEndpoint>> {
        let spec = PathSpec::parse(path)?;
        let endpoint = Arc::new(WebSocketEndpoint::new(handler));
        let mut endpoints = self.endpoints.write();
        endpoints.retain(|(s, _)| s.as_str() != spec.as_str());
        endpoints.push((spec, endpoint.clone()));
        endpoints.sort_by_key(|(s, _)| std::cmp::Reverse(s.specificity()));
        Ok(endpoint)
    }

    pub fn endpoint_for(&self, path: &str) -> Option<(Arc<WebSocketEndpoint>, HashMap<String, String>)> {
        self.endpoints
            .read()
            .iter()
            .find_map(|(spec, endpoint)| spec.matches(path).map(|params| (endpoint.clone(), params)))
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Open sessions across all endpoints.
    pub fn connection_count(&self) -> usize {
        self.endpoints
            .read()
            .iter()
            .map(|(_, endpoint)| endpoint.connection_count())
            .sum()
    }
}

impl Plugin for WebSocketExtension {
    fn id(&self) -> &str {
        WEBSOCKET_EXTENSION
    }

    fn description(&self) -> &str {
        "websocket upgrade endpoints"
    }

    fn priority(&self) -> PluginPriority {
        PluginPriority::High
    }
}

pub struct ProtocolDetectionExtension {
    registry: Arc<ProtocolRegistry>,
}

impl ProtocolDetectionExtension {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        ProtocolDetectionExtension { registry }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }
}

impl Plugin for ProtocolDetectionExtension {
    fn id(&self) -> &str {
        PROTOCOL_DETECTION_EXTENSION
    }

    fn description(&self) -> &str {
        "custom protocol signatures"
    }

    fn priority(&self) -> PluginPriority {
        PluginPriority::VeryHigh
    }

    fn initialize(&self, ctx: &PluginContext) -> AppResult<()> {
        if !self.registry.is_empty() {
            ctx.log(&format!(
                "custom protocols: {:?}",
                self.registry.signature_names()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request_from;
    use crate::websocket::WsSession;

    #[test]
    fn routing_fills_params_and_commits() {
        let routing = RoutingExtension::new();
        routing
            .router()
            .get("/users/:id", |req: &mut Request, res: &mut Response| -> AppResult<()> {
                let id = req.param("id").unwrap_or_default().to_string();
                res.status(202)?;
                res.header("X-User", &id)?;
                Ok(())
            })
            .unwrap();

        let mut req = request_from("GET /users/42 HTTP/1.1\r\n\r\n");
        let mut res = Response::new();
        assert_eq!(routing.on_request(&mut req, &mut res).unwrap(), Flow::Stop);
        assert_eq!(req.param("id"), Some("42"));
        assert!(res.is_sent());
        assert_eq!(res.status_code(), 202);
        assert_eq!(res.headers().get("x-user"), Some("42"));

        let mut req = request_from("POST /users/42 HTTP/1.1\r\n\r\n");
        let mut res = Response::new();
        assert_eq!(routing.on_request(&mut req, &mut res).unwrap(), Flow::Continue);
        assert!(!res.is_sent());
    }

    struct Quiet;
    impl WebSocketHandler for Quiet {}

    #[test]
    fn websocket_endpoints_match_patterns() {
        let ws = WebSocketExtension::new();
        ws.register("/chat/:room", Quiet).unwrap();
        let lobby = ws.register("/chat/lobby", Quiet).unwrap();
        assert_eq!(ws.endpoint_count(), 2);

        let (endpoint, params) = ws.endpoint_for("/chat/lobby").unwrap();
        assert!(Arc::ptr_eq(&endpoint, &lobby));
        assert!(params.is_empty());

        let (_, params) = ws.endpoint_for("/chat/rust").unwrap();
        assert_eq!(params["room"], "rust");
        assert!(ws.endpoint_for("/other").is_none());

        let (session, _rx) = WsSession::new(1, "127.0.0.1:9".parse().unwrap(), "/chat/lobby", params);
        lobby.sessions().insert(session);
        assert_eq!(ws.connection_count(), 1);
    }
}
