pub use app_error::{AppError, AppResult};
pub use config::{
    HttpConfig, NetworkConfig, ServerConfig, WebSocketConfig, WorkerPoolConfig,
    MAX_WEBSOCKET_PAYLOAD,
};
pub use server::{NovaServer, SecureChannel, SecureFuture};
pub use shutdown::{Shutdown, ShutdownHandle};
pub use task_pool::{Task, TaskPool};
pub(crate) use task_pool::panic_message;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod server;
mod shutdown;
mod task_pool;
mod tracing_config;
