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

pub use dispatch::Dispatcher;
pub use extensions::{
    MiddlewareExtension, ProtocolDetectionExtension, RoutingExtension, WebSocketExtension,
    MIDDLEWARE_EXTENSION, PROTOCOL_DETECTION_EXTENSION, ROUTING_EXTENSION, WEBSOCKET_EXTENSION,
};
pub use middleware::{Flow, Middleware, MiddlewareChain, MiddlewareContext};
pub use plugin::{Plugin, PluginContext, PluginPriority, PluginRegistry, PluginState};

mod dispatch;
mod extensions;
mod middleware;
mod plugin;
