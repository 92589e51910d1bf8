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

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::trace;

use super::rewind::{BoxedStream, Rewind};
use crate::http::{parse_head, HttpLimits, Request};
use crate::websocket::{Frame, Role};
use crate::{AppError, AppResult};

/// One accepted client.
///
/// Wraps the (rewound) stream in a `BufWriter` for writes and keeps a read buffer that
/// decoders parse from. The optional read timeout bounds every single read; it is lifted
/// once the connection becomes a long-lived websocket.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    writer: BufWriter<Rewind<BoxedStream>>,
    buffer: BytesMut,
    read_timeout: Option<Duration>,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: Rewind<BoxedStream>,
        read_timeout: Option<Duration>,
    ) -> Connection {
        Connection {
            id,
            peer,
            writer: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(4 * 1024),
            read_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    async fn read_more(&mut self) -> AppResult<usize> {
        let read = self.writer.read_buf(&mut self.buffer);
        let n = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| AppError::Timeout(format!("no data from {} within {:?}", self.peer, limit)))??,
            None => read.await?,
        };
        trace!("connection {} read {} bytes", self.id, n);
        Ok(n)
    }

    /// Decode one http request.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly before sending anything. A body
    /// larger than `limits.max_body_size` fails with [`AppError::PayloadTooLarge`] before
    /// any of it is waited for.
    pub async fn read_request(&mut self, limits: &HttpLimits) -> AppResult<Option<Request>> {
        let head = loop {
            if let Some(head) = parse_head(&mut self.buffer, limits)? {
                break head;
            }
            if 0 == self.read_more().await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        ErrorKind::ConnectionReset,
                        "connection reset while sending request head",
                    )
                    .into())
                };
            }
        };

        if head.headers.contains("Transfer-Encoding") {
            return Err(AppError::MalformedRequest(
                "transfer-encoding is not supported".to_string(),
            ));
        }
        let length = head.content_length()?;
        if length > limits.max_body_size {
            return Err(AppError::PayloadTooLarge(format!(
                "body of {} bytes exceeds {}",
                length, limits.max_body_size
            )));
        }
        while self.buffer.len() < length {
            self.buffer.reserve(length - self.buffer.len());
            if 0 == self.read_more().await? {
                return Err(AppError::MalformedRequest(format!(
                    "body truncated at {} of {} bytes",
                    self.buffer.len(),
                    length
                )));
            }
        }
        let body = self.buffer.split_to(length).freeze();
        Ok(Some(Request::from_head(head, body, self.peer)))
    }

    /// Read one websocket frame. `Ok(None)` means the peer closed between frames.
    pub async fn read_frame(&mut self, max_payload: usize) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer, max_payload)? {
                return Ok(Some(frame));
            }
            if 0 == self.read_more().await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        ErrorKind::ConnectionReset,
                        "connection reset while sending a frame",
                    )
                    .into())
                };
            }
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_frame(&mut self, frame: &Frame, role: Role) -> AppResult<()> {
        let mut out = BytesMut::new();
        frame.encode(role, &mut out);
        self.write_all(&out).await
    }

    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("connection {} from {} dropped", self.id, self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn connection(server: DuplexStream, read_timeout: Option<Duration>) -> Connection {
        let stream: BoxedStream = Box::new(server);
        Connection::new(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            Rewind::new(stream),
            read_timeout,
        )
    }

    async fn write_in_chunks(mut client: DuplexStream, data: Vec<u8>, chunk: usize) {
        for piece in data.chunks(chunk) {
            client.write_all(piece).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn reads_request_across_fragmented_writes() {
        let (client, server) = tokio::io::duplex(16);
        let raw = b"POST /upload HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world".to_vec();
        tokio::spawn(write_in_chunks(client, raw, 3));
        let mut conn = connection(server, None);
        let request = conn
            .read_request(&HttpLimits::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.path(), "/upload");
        assert_eq!(request.body_text(), "hello world");
        assert_eq!(request.client_addr().port(), 5000);
    }

    #[tokio::test]
    async fn oversized_body_is_refused_up_front() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        let mut conn = connection(server, None);
        let limits = HttpLimits {
            max_body_size: 10,
            ..HttpLimits::default()
        };
        // no body bytes were sent; the error comes from the header alone
        let err = conn.read_request(&limits).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));
        drop(client);
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(client);
        let mut conn = connection(server, None);
        let err = conn.read_request(&HttpLimits::default()).await.unwrap_err();
        assert!(matches!(err, AppError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut conn = connection(server, None);
        assert!(conn
            .read_request(&HttpLimits::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn read_timeout_surfaces_as_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = connection(server, Some(Duration::from_millis(20)));
        let err = conn.read_request(&HttpLimits::default()).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(err.is_expected_io());
    }

    #[tokio::test]
    async fn reads_frames_after_prefix() {
        let (client, server) = tokio::io::duplex(64);
        let wire = Frame::text("hi there").to_bytes(Role::Client).to_vec();
        tokio::spawn(write_in_chunks(client, wire, 2));
        let mut conn = connection(server, None);
        let frame = conn.read_frame(1024).await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hi there");
        assert!(conn.read_frame(1024).await.unwrap().is_none());
    }
}
