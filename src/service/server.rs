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

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::config::ServerConfig;
use super::shutdown::{Shutdown, ShutdownHandle};
use super::task_pool::TaskPool;
use crate::http::{HttpLimits, Request, Response};
use crate::network::{
    BoxedStream, Connection, ConnectionPool, PoolPermit, Protocol, ProtocolDetector,
    ProtocolRegistry, Rewind,
};
use crate::pipeline::{
    Dispatcher, MiddlewareChain, MiddlewareExtension, Plugin, PluginContext, PluginRegistry,
    ProtocolDetectionExtension, RoutingExtension, WebSocketExtension,
};
use crate::routing::Router;
use crate::websocket::{accept_response, run_session, validate_upgrade, WebSocketEndpoint};
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type SecureFuture = Pin<Box<dyn Future<Output = AppResult<BoxedStream>> + Send + 'static>>;

/// Wraps an accepted socket before anything is read from it, e.g. a TLS acceptor.
pub trait SecureChannel: Send + Sync + 'static {
    fn wrap(&self, stream: TcpStream) -> SecureFuture;
}

impl<F> SecureChannel for F
where
    F: Fn(TcpStream) -> SecureFuture + Send + Sync + 'static,
{
    fn wrap(&self, stream: TcpStream) -> SecureFuture {
        self(stream)
    }
}

/// Everything a connection handler reads, shared by all of them.
struct Shared {
    config: Arc<ServerConfig>,
    limits: HttpLimits,
    detector: ProtocolDetector,
    dispatcher: Dispatcher,
    websocket: Arc<WebSocketExtension>,
    secure: Option<Arc<dyn SecureChannel>>,
}

/// The multi-protocol server: admission, protocol detection, then http dispatch,
/// websocket sessions or a custom protocol handler per connection.
pub struct NovaServer {
    config: Arc<ServerConfig>,
    plugins: Arc<PluginRegistry>,
    routing: Arc<RoutingExtension>,
    middleware: Arc<MiddlewareExtension>,
    websocket: Arc<WebSocketExtension>,
    protocols: Arc<ProtocolRegistry>,
    pool: Arc<ConnectionPool>,
    tasks: TaskPool,
    secure: RwLock<Option<Arc<dyn SecureChannel>>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl NovaServer {
    /// Build a server with the default extensions registered and initialized. Must be
    /// called inside a tokio runtime, the task pool starts right away.
    pub fn new(config: ServerConfig) -> AppResult<NovaServer> {
        config.validate()?;
        let config = Arc::new(config);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let tasks = TaskPool::new(
            &config.worker_pool,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        let protocols = Arc::new(ProtocolRegistry::new());
        let routing = Arc::new(RoutingExtension::new());
        let middleware = Arc::new(MiddlewareExtension::new());
        let websocket = Arc::new(WebSocketExtension::new());

        let plugins = Arc::new(PluginRegistry::new());
        plugins.register(Arc::new(ProtocolDetectionExtension::new(protocols.clone())))?;
        plugins.register(websocket.clone())?;
        plugins.register(middleware.clone())?;
        plugins.register(routing.clone())?;
        let context = PluginContext::new(config.clone(), Some(tasks.clone()), &plugins);
        plugins.initialize_all(&context)?;

        Ok(NovaServer {
            pool: Arc::new(ConnectionPool::new(config.network.max_connection)),
            config,
            plugins,
            routing,
            middleware,
            websocket,
            protocols,
            tasks,
            secure: RwLock::new(None),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(Some(shutdown_complete_rx)),
        })
    }

    /// Register and initialize an extra plugin. Rejected once the server runs.
    pub fn use_plugin<P: Plugin>(&self, plugin: Arc<P>) -> AppResult<()> {
        self.plugins.register(plugin)
    }

    pub fn set_secure_channel<S: SecureChannel>(&self, secure: S) {
        *self.secure.write() = Some(Arc::new(secure));
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        self.routing.router()
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        self.middleware.chain()
    }

    pub fn websocket(&self) -> &WebSocketExtension {
        &self.websocket
    }

    /// Shortcut for `websocket().register(path, handler)`.
    pub fn ws<H: crate::websocket::WebSocketHandler>(
        &self,
        path: &str,
        handler: H,
    ) -> AppResult<Arc<WebSocketEndpoint>> {
        self.websocket.register(path, handler)
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.notify_shutdown.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn start(&self) -> AppResult<()> {
        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("bind {} error: {}", address, e)))?;
        self.run_with_listener(listener).await
    }

    // Graceful shutdown:
    // 1. the accept loop returns once the broadcast fires,
    // 2. plugins stop in reverse initialization order,
    // 3. the admission pool is drained so late permit drops are no-ops,
    // 4. the server drops its own completion sender and waits, bounded by
    //    `shutdown_timeout_secs`, for every connection task and pool worker to drop theirs.
    /// Serve connections from `listener` until shutdown is signalled.
    pub async fn run_with_listener(&self, listener: TcpListener) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        self.plugins.start_all()?;
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            limits: HttpLimits::from(&self.config.http),
            detector: ProtocolDetector::new(self.protocols.clone()),
            dispatcher: Dispatcher::new(self.plugins.clone()),
            websocket: self.websocket.clone(),
            secure: self.secure.read().clone(),
        });
        info!(
            "nova listening on {}, max {} connections",
            listener.local_addr()?,
            self.pool.capacity()
        );

        let result = self.accept_loop(&listener, shared, &mut shutdown).await;
        if let Err(e) = &result {
            error!("accept loop failed: {}", e);
        }
        drop(listener);
        self.finish().await;
        result
    }

    #[tracing::instrument(skip_all)]
    async fn accept_loop(
        &self,
        listener: &TcpListener,
        shared: Arc<Shared>,
        shutdown: &mut Shutdown,
    ) -> AppResult<()> {
        let complete_tx = self
            .shutdown_complete_tx
            .lock()
            .clone()
            .ok_or_else(|| AppError::IllegalStateError("server already shut down".to_string()))?;
        loop {
            let (socket, peer) = tokio::select! {
                res = Self::accept(listener) => res?,
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    return Ok(());
                }
            };
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

            let Some(permit) = PoolPermit::try_acquire(&self.pool) else {
                warn!(connection_id, %peer, "connection pool full, rejecting");
                reject(socket, peer);
                continue;
            };
            debug!(connection_id, %peer, active = self.pool.active_count(), "accepted");

            let mut handler = ConnectionHandler {
                connection_id,
                peer,
                shared: shared.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete_tx: complete_tx.clone(),
            };
            tokio::spawn(async move {
                match handler.run(socket).await {
                    Ok(()) => {}
                    Err(e) if e.is_expected_io() => {
                        debug!(connection_id, %peer, "connection ended: {}", e)
                    }
                    Err(e) => error!(connection_id, %peer, "connection error: {}", e),
                }
                // released on every exit path
                drop(permit);
            });
        }
    }

    async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;
        loop {
            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept error, retrying in {}s: {}", backoff, err);
                }
            }
            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    async fn finish(&self) {
        // covers the accept-error path, where nobody signalled yet
        let _ = self.notify_shutdown.send(());
        self.plugins.stop_all();
        self.pool.shutdown();

        drop(self.shutdown_complete_tx.lock().take());
        let complete_rx = self.shutdown_complete_rx.lock().take();
        if let Some(mut complete_rx) = complete_rx {
            match time::timeout(self.config.shutdown_timeout(), complete_rx.recv()).await {
                Ok(_) => info!("all connections closed, server stopped"),
                Err(_) => warn!(
                    "server stopped with connections still open after {:?}",
                    self.config.shutdown_timeout()
                ),
            }
        }
    }
}

impl Drop for NovaServer {
    fn drop(&mut self) {
        debug!("nova server dropped");
    }
}

const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Answer 503 from a detached task so the accept loop never waits on the peer.
fn reject(mut socket: TcpStream, peer: SocketAddr) {
    tokio::spawn(async move {
        let response = Response::error(503, "Too many connections").encode();
        match time::timeout(REJECT_WRITE_TIMEOUT, socket.write_all(&response)).await {
            Ok(Ok(())) => {
                let _ = socket.shutdown().await;
            }
            Ok(Err(e)) => debug!(%peer, "could not send 503: {}", e),
            Err(_) => debug!(%peer, "timed out sending 503"),
        }
    });
}

struct ConnectionHandler {
    connection_id: u64,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl ConnectionHandler {
    async fn run(&mut self, socket: TcpStream) -> AppResult<()> {
        let _ = socket.set_nodelay(true);
        let read_timeout = self.shared.config.read_timeout();

        let mut stream: BoxedStream = match &self.shared.secure {
            Some(secure) => with_timeout(read_timeout, secure.wrap(socket)).await?,
            None => Box::new(socket),
        };
        let detection = self.shared.detector.detect(&mut stream);
        let (protocol, prefix) = tokio::select! {
            res = with_timeout(read_timeout, detection) => res?,
            _ = self.shutdown.recv() => return Ok(()),
        };
        if prefix.is_empty() {
            debug!(connection_id = self.connection_id, "closed before sending anything");
            return Ok(());
        }
        let stream = Rewind::new_buffered(stream, prefix.clone());

        match protocol {
            Protocol::Http => self.serve_http(stream).await,
            other => self.serve_custom(other, stream, prefix).await,
        }
    }

    async fn serve_http(&mut self, stream: Rewind<BoxedStream>) -> AppResult<()> {
        let mut conn = Connection::new(
            self.connection_id,
            self.peer,
            stream,
            self.shared.config.read_timeout(),
        );
        let read = tokio::select! {
            res = conn.read_request(&self.shared.limits) => res,
            _ = self.shutdown.recv() => return Ok(()),
        };
        let mut request = match read {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) if e.is_expected_io() => return Err(e),
            Err(e) => {
                let status = e.status_code();
                if status < 500 {
                    let _ = conn
                        .write_all(&Response::error(status, &e.to_string()).encode())
                        .await;
                    let _ = conn.shutdown().await;
                }
                return Err(e);
            }
        };
        debug!(
            connection_id = self.connection_id,
            method = request.method(),
            path = request.path(),
            "request"
        );

        if request.is_websocket_upgrade() {
            if let Some((endpoint, params)) = self.shared.websocket.endpoint_for(request.path()) {
                return self.upgrade(conn, request, endpoint, params).await;
            }
        }

        let mut response = Response::new();
        self.shared.dispatcher.dispatch(&mut request, &mut response);
        conn.write_all(&response.encode()).await?;
        let _ = conn.shutdown().await;
        Ok(())
    }

    async fn upgrade(
        &mut self,
        mut conn: Connection,
        request: Request,
        endpoint: Arc<WebSocketEndpoint>,
        params: HashMap<String, String>,
    ) -> AppResult<()> {
        let key = match validate_upgrade(&request) {
            Ok(key) => key,
            Err(e) => {
                let _ = conn
                    .write_all(&Response::error(400, &e.to_string()).encode())
                    .await;
                return Err(e);
            }
        };
        conn.write_all(&accept_response(&key)).await?;
        // the session lives until either side closes it
        conn.set_read_timeout(None);
        run_session(
            &mut conn,
            endpoint,
            request.path(),
            params,
            self.shared.config.websocket.max_payload_size,
            &mut self.shutdown,
        )
        .await
    }

    async fn serve_custom(
        &mut self,
        protocol: Protocol,
        stream: Rewind<BoxedStream>,
        prefix: Bytes,
    ) -> AppResult<()> {
        let Some(handler) = self.shared.detector.registry().handler_for(&protocol) else {
            debug!(
                connection_id = self.connection_id,
                "unrecognized protocol, closing without response"
            );
            return Ok(());
        };
        debug!(connection_id = self.connection_id, ?protocol, "custom protocol");
        tokio::select! {
            res = handler.handle(stream, self.peer, prefix) => res,
            _ = self.shutdown.recv() => Ok(()),
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!(connection_id = self.connection_id, "connection handler dropped");
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match limit {
        Some(limit) => time::timeout(limit, fut)
            .await
            .map_err(|_| AppError::Timeout(format!("no progress within {:?}", limit)))?,
        None => fut.await,
    }
}
