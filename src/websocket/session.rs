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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::frame::{close_code, Frame, Opcode, Role};
use crate::network::Connection;
use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// Application callbacks for one websocket endpoint. All of them run on the session's own
/// task; replies go out through the [`WsSession`] handle.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_connect(&self, _session: &WsSession) {}

    fn on_message(&self, _session: &WsSession, _text: &str) {}

    fn on_binary(&self, _session: &WsSession, _data: &Bytes) {}

    fn on_close(&self, _session: &WsSession, _code: u16, _reason: &str) {}

    fn on_error(&self, session: &WsSession, error: &AppError) {
        debug!("websocket session {} error: {}", session.id(), error);
    }
}

/// Handle to a live session. Frames queued here are written by the task that owns the
/// connection.
#[derive(Debug, Clone)]
pub struct WsSession {
    id: u64,
    peer: SocketAddr,
    path: Arc<str>,
    params: Arc<HashMap<String, String>>,
    tx: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
}

impl WsSession {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        path: &str,
        params: HashMap<String, String>,
    ) -> (WsSession, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = WsSession {
            id,
            peer,
            path: Arc::from(path),
            params: Arc::new(params),
            tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn queue(&self, frame: Frame) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| AppError::ConnectionClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> AppResult<()> {
        self.queue(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> AppResult<()> {
        self.queue(Frame::binary(data))
    }

    pub fn ping(&self, data: impl Into<Bytes>) -> AppResult<()> {
        let data = data.into();
        if data.len() > super::frame::MAX_CONTROL_PAYLOAD {
            return Err(AppError::WebSocketProtocol(format!(
                "ping payload of {} bytes",
                data.len()
            )));
        }
        self.queue(Frame::ping(data))
    }

    /// Queue a close frame; nothing can be sent afterwards.
    pub fn close(&self, code: u16, reason: &str) -> AppResult<()> {
        if !close_code::is_valid(code) {
            return Err(AppError::InvalidValue(format!("close code {}", code)));
        }
        self.queue(Frame::close(code, reason))?;
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

/// Live sessions of one endpoint.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, WsSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: WsSession) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: u64) -> Option<WsSession> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn get(&self, id: u64) -> Option<WsSession> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send `text` to every open session, returns how many it was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        self.broadcast_filtered(text, None)
    }

    pub fn broadcast_except(&self, text: &str, except: u64) -> usize {
        self.broadcast_filtered(text, Some(except))
    }

    fn broadcast_filtered(&self, text: &str, except: Option<u64>) -> usize {
        let mut sent = 0;
        for entry in self.sessions.iter() {
            if Some(*entry.key()) == except {
                continue;
            }
            if entry.value().send_text(text).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

/// A handler plus the sessions connected through it.
pub struct WebSocketEndpoint {
    handler: Arc<dyn WebSocketHandler>,
    sessions: SessionRegistry,
}

impl std::fmt::Debug for WebSocketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketEndpoint")
            .field("sessions", &self.sessions.connection_count())
            .finish()
    }
}

impl WebSocketEndpoint {
    pub fn new<H: WebSocketHandler>(handler: H) -> Self {
        WebSocketEndpoint {
            handler: Arc::new(handler),
            sessions: SessionRegistry::new(),
        }
    }

    pub fn handler(&self) -> &Arc<dyn WebSocketHandler> {
        &self.handler
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.connection_count()
    }

    pub fn broadcast(&self, text: &str) -> usize {
        self.sessions.broadcast(text)
    }

    pub fn broadcast_except(&self, text: &str, except: u64) -> usize {
        self.sessions.broadcast_except(text, except)
    }
}

/// What happens to the loop after one inbound frame.
enum Next {
    Continue,
    Reply(Frame),
    Close(Frame),
    Done,
}

/// Drive an upgraded connection until either side closes, the stream ends, a protocol
/// error occurs or the server shuts down. The session is registered with the endpoint for
/// exactly the lifetime of this call.
pub async fn run_session(
    conn: &mut Connection,
    endpoint: Arc<WebSocketEndpoint>,
    path: &str,
    params: HashMap<String, String>,
    max_payload: usize,
    shutdown: &mut Shutdown,
) -> AppResult<()> {
    let (session, mut outbound) = WsSession::new(conn.id(), conn.peer(), path, params);
    endpoint.sessions.insert(session.clone());
    let handler = endpoint.handler.clone();
    debug!(connection_id = conn.id(), peer = %conn.peer(), path, "websocket session opened");
    handler.on_connect(&session);

    let result = session_loop(
        conn,
        &session,
        handler.as_ref(),
        &mut outbound,
        max_payload,
        shutdown,
    )
    .await;

    session.open.store(false, Ordering::Release);
    endpoint.sessions.remove(session.id());
    debug!(connection_id = conn.id(), "websocket session closed");
    result
}

async fn session_loop(
    conn: &mut Connection,
    session: &WsSession,
    handler: &dyn WebSocketHandler,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    max_payload: usize,
    shutdown: &mut Shutdown,
) -> AppResult<()> {
    loop {
        let next = tokio::select! {
            read = conn.read_frame(max_payload) => match read {
                Ok(Some(frame)) => on_frame(session, handler, frame),
                Ok(None) => {
                    handler.on_close(session, close_code::ABNORMAL, "");
                    Next::Done
                }
                Err(e) if e.is_expected_io() => {
                    handler.on_close(session, close_code::ABNORMAL, "");
                    return Err(e);
                }
                Err(e) => {
                    handler.on_error(session, &e);
                    let code = match e {
                        AppError::PayloadTooLarge(_) => close_code::MESSAGE_TOO_BIG,
                        _ => close_code::PROTOCOL_ERROR,
                    };
                    let _ = conn.write_frame(&Frame::close(code, ""), Role::Server).await;
                    return Err(e);
                }
            },
            Some(frame) = outbound.recv() => {
                let closing = frame.opcode == Opcode::Close;
                conn.write_frame(&frame, Role::Server).await?;
                if closing {
                    trace!("session {} closed by the server side", session.id());
                    return Ok(());
                }
                Next::Continue
            }
            _ = shutdown.recv() => {
                handler.on_close(session, close_code::GOING_AWAY, "server shutting down");
                Next::Close(Frame::close(close_code::GOING_AWAY, "server shutting down"))
            }
        };

        match next {
            Next::Continue => {}
            Next::Reply(frame) => conn.write_frame(&frame, Role::Server).await?,
            Next::Close(frame) => {
                conn.write_frame(&frame, Role::Server).await?;
                return Ok(());
            }
            Next::Done => return Ok(()),
        }
    }
}

fn on_frame(session: &WsSession, handler: &dyn WebSocketHandler, frame: Frame) -> Next {
    match frame.opcode {
        Opcode::Text if frame.fin => match std::str::from_utf8(&frame.payload) {
            Ok(text) => {
                handler.on_message(session, text);
                Next::Continue
            }
            Err(_) => {
                let error = AppError::WebSocketProtocol("text frame is not utf-8".to_string());
                handler.on_error(session, &error);
                Next::Close(Frame::close(close_code::INVALID_PAYLOAD, "invalid utf-8"))
            }
        },
        Opcode::Binary if frame.fin => {
            handler.on_binary(session, &frame.payload);
            Next::Continue
        }
        Opcode::Ping => Next::Reply(Frame::pong(frame.payload)),
        Opcode::Pong => Next::Continue,
        Opcode::Close => {
            let (code, reason) = match frame.close_payload() {
                Ok(Some(pair)) => pair,
                Ok(None) => (close_code::NO_STATUS, String::new()),
                Err(e) => {
                    handler.on_error(session, &e);
                    (close_code::PROTOCOL_ERROR, String::new())
                }
            };
            if code != close_code::NO_STATUS && !close_code::is_valid(code) {
                warn!("session {} closed with invalid code {}", session.id(), code);
            }
            handler.on_close(session, code, &reason);
            let echo = if close_code::is_valid(code) {
                code
            } else {
                close_code::NORMAL
            };
            Next::Close(Frame::close(echo, ""))
        }
        _ => {
            let error = AppError::UnsupportedFrame(
                "fragmented messages are not supported".to_string(),
            );
            handler.on_error(session, &error);
            Next::Close(Frame::close(close_code::UNSUPPORTED_DATA, "fragmentation unsupported"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BoxedStream, Rewind};
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Echo {
        closed: Mutex<Vec<u16>>,
        errors: Mutex<Vec<String>>,
    }

    impl WebSocketHandler for Arc<Echo> {
        fn on_message(&self, session: &WsSession, text: &str) {
            let _ = session.send_text(format!("echo: {}", text));
        }

        fn on_binary(&self, session: &WsSession, data: &Bytes) {
            let _ = session.send_binary(data.clone());
        }

        fn on_close(&self, _session: &WsSession, code: u16, _reason: &str) {
            self.closed.lock().push(code);
        }

        fn on_error(&self, _session: &WsSession, error: &AppError) {
            self.errors.lock().push(error.to_string());
        }
    }

    struct Peer {
        stream: DuplexStream,
        buffer: BytesMut,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            self.stream
                .write_all(&frame.to_bytes(Role::Client))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            loop {
                if let Some(frame) = Frame::parse(&mut self.buffer, 1 << 20).unwrap() {
                    return frame;
                }
                let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
                assert!(n > 0, "stream ended before a frame arrived");
            }
        }
    }

    fn setup() -> (
        Connection,
        Peer,
        Arc<WebSocketEndpoint>,
        Arc<Echo>,
        broadcast::Sender<()>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let stream: BoxedStream = Box::new(server);
        let conn = Connection::new(
            7,
            "127.0.0.1:4000".parse().unwrap(),
            Rewind::new(stream),
            None,
        );
        let echo = Arc::new(Echo::default());
        let endpoint = Arc::new(WebSocketEndpoint::new(echo.clone()));
        let (notify, _) = broadcast::channel(1);
        let peer = Peer {
            stream: client,
            buffer: BytesMut::new(),
        };
        (conn, peer, endpoint, echo, notify)
    }

    #[tokio::test]
    async fn echoes_pings_and_closes() {
        let (mut conn, mut peer, endpoint, echo, notify) = setup();
        let mut shutdown = Shutdown::new(notify.subscribe());
        let ep = endpoint.clone();
        let task = tokio::spawn(async move {
            run_session(&mut conn, ep, "/echo", HashMap::new(), 1 << 20, &mut shutdown).await
        });

        peer.send(Frame::text("hi")).await;
        let reply = peer.recv().await;
        assert_eq!(reply.opcode, Opcode::Text);
        assert_eq!(&reply.payload[..], b"echo: hi");
        assert!(reply.mask.is_none());
        assert_eq!(endpoint.connection_count(), 1);

        peer.send(Frame::ping("are you there")).await;
        let pong = peer.recv().await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"are you there");

        peer.send(Frame::close(close_code::GOING_AWAY, "bye")).await;
        let close = peer.recv().await;
        assert_eq!(close.close_payload().unwrap().unwrap().0, close_code::GOING_AWAY);

        task.await.unwrap().unwrap();
        assert_eq!(*echo.closed.lock(), vec![close_code::GOING_AWAY]);
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[tokio::test]
    async fn continuation_frames_are_refused() {
        let (mut conn, mut peer, endpoint, echo, notify) = setup();
        let mut shutdown = Shutdown::new(notify.subscribe());
        let task = tokio::spawn(async move {
            run_session(&mut conn, endpoint, "/echo", HashMap::new(), 1 << 20, &mut shutdown).await
        });

        let mut first = Frame::text("part");
        first.fin = false;
        peer.send(first).await;
        let close = peer.recv().await;
        assert_eq!(
            close.close_payload().unwrap().unwrap().0,
            close_code::UNSUPPORTED_DATA
        );
        task.await.unwrap().unwrap();
        assert_eq!(echo.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let (mut conn, mut peer, endpoint, _echo, notify) = setup();
        let mut shutdown = Shutdown::new(notify.subscribe());
        let task = tokio::spawn(async move {
            run_session(&mut conn, endpoint, "/echo", HashMap::new(), 1 << 20, &mut shutdown).await
        });
        // let the session register before signalling
        tokio::task::yield_now().await;
        notify.send(()).unwrap();
        let close = peer.recv().await;
        assert_eq!(close.close_payload().unwrap().unwrap().0, close_code::GOING_AWAY);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let registry = SessionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (a, mut rx_a) = WsSession::new(1, addr, "/chat", HashMap::new());
        let (b, mut rx_b) = WsSession::new(2, addr, "/chat", HashMap::new());
        registry.insert(a.clone());
        registry.insert(b);
        assert_eq!(registry.broadcast_except("hello", 1), 1);
        assert_eq!(&rx_b.recv().await.unwrap().payload[..], b"hello");
        assert!(rx_a.try_recv().is_err());

        a.close(close_code::NORMAL, "").unwrap();
        assert!(!a.is_open());
        assert!(a.send_text("late").is_err());
        assert_eq!(registry.broadcast("all"), 1);
        assert!(a.close(close_code::ABNORMAL, "").is_err());
    }
}
