pub mod http;
pub mod network;
pub mod pipeline;
pub mod routing;
pub mod service;
pub mod websocket;

pub use http::{Request, Response};
pub use pipeline::{Flow, MiddlewareContext, Plugin, PluginContext, PluginPriority};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, NovaServer, ServerConfig,
    ShutdownHandle,
};
pub use websocket::{WebSocketHandler, WsSession};
