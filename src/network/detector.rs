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

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::rewind::{BoxedStream, Rewind};
use crate::{AppError, AppResult};

/// Bytes inspected before a connection is classified. Covers the longest method token
/// plus its trailing space.
pub const PEEK_SIZE: usize = 16;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"PATCH ",
    b"HEAD ",
    b"OPTIONS ",
    b"TRACE ",
    b"CONNECT ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Http,
    /// Matched the registered signature at this index.
    Custom(usize),
    Unknown,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'static>>;

/// Takes over a connection whose first bytes matched a registered signature (or no
/// signature at all, for the default handler). The stream replays `prefix` first.
pub trait CustomProtocolHandler: Send + Sync + 'static {
    fn handle(&self, stream: Rewind<BoxedStream>, peer: SocketAddr, prefix: Bytes)
        -> HandlerFuture;
}

impl<F, Fut> CustomProtocolHandler for F
where
    F: Fn(Rewind<BoxedStream>, SocketAddr, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    fn handle(
        &self,
        stream: Rewind<BoxedStream>,
        peer: SocketAddr,
        prefix: Bytes,
    ) -> HandlerFuture {
        Box::pin(self(stream, peer, prefix))
    }
}

struct Signature {
    name: String,
    magic: Bytes,
    handler: Arc<dyn CustomProtocolHandler>,
}

/// Magic-byte signatures for non-http protocols plus an optional catch-all handler.
#[derive(Default)]
pub struct ProtocolRegistry {
    signatures: RwLock<Vec<Signature>>,
    default_handler: RwLock<Option<Arc<dyn CustomProtocolHandler>>>,
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("signatures", &self.signature_names())
            .field("has_default", &self.has_default_handler())
            .finish()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, name: &str, magic: impl Into<Bytes>, handler: H) -> AppResult<()>
    where
        H: CustomProtocolHandler,
    {
        let magic = magic.into();
        if magic.is_empty() || magic.len() > PEEK_SIZE {
            return Err(AppError::InvalidValue(format!(
                "protocol signature for {} must be 1..={} bytes, got {}",
                name,
                PEEK_SIZE,
                magic.len()
            )));
        }
        let mut signatures = self.signatures.write();
        if signatures.iter().any(|s| s.magic == magic) {
            return Err(AppError::InvalidValue(format!(
                "protocol signature {:?} already registered",
                magic
            )));
        }
        debug!("registered protocol {} with signature {:?}", name, magic);
        signatures.push(Signature {
            name: name.to_string(),
            magic,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn set_default_handler<H: CustomProtocolHandler>(&self, handler: H) {
        *self.default_handler.write() = Some(Arc::new(handler));
    }

    pub fn has_default_handler(&self) -> bool {
        self.default_handler.read().is_some()
    }

    pub fn signature_names(&self) -> Vec<String> {
        self.signatures.read().iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.signatures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first signature fully contained in `prefix`.
    pub fn match_signature(&self, prefix: &[u8]) -> Option<usize> {
        self.signatures
            .read()
            .iter()
            .position(|s| prefix.len() >= s.magic.len() && prefix.starts_with(&s.magic))
    }

    /// The handler for a detected protocol. `Unknown` falls back to the default handler.
    pub fn handler_for(&self, protocol: &Protocol) -> Option<Arc<dyn CustomProtocolHandler>> {
        match protocol {
            Protocol::Custom(index) => self
                .signatures
                .read()
                .get(*index)
                .map(|s| s.handler.clone()),
            Protocol::Unknown => self.default_handler.read().clone(),
            Protocol::Http => None,
        }
    }
}

/// Classifies fresh connections by their leading bytes.
#[derive(Debug, Clone)]
pub struct ProtocolDetector {
    registry: Arc<ProtocolRegistry>,
}

impl ProtocolDetector {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        ProtocolDetector { registry }
    }

    /// Read up to [`PEEK_SIZE`] bytes, retrying short reads until the buffer is full or
    /// the peer stops sending, then classify. The bytes read are returned so the caller
    /// can put them back in front of the stream.
    pub async fn detect<S>(&self, stream: &mut S) -> AppResult<(Protocol, Bytes)>
    where
        S: AsyncRead + Unpin,
    {
        let mut prefix = BytesMut::with_capacity(PEEK_SIZE);
        while prefix.len() < PEEK_SIZE {
            let mut limited = (&mut *stream).take((PEEK_SIZE - prefix.len()) as u64);
            if limited.read_buf(&mut prefix).await? == 0 {
                break;
            }
        }
        let prefix = prefix.freeze();
        let protocol = self.classify(&prefix);
        trace!("detected {:?} from {} byte prefix", protocol, prefix.len());
        Ok((protocol, prefix))
    }

    pub fn classify(&self, prefix: &[u8]) -> Protocol {
        if is_http_prefix(prefix) {
            return Protocol::Http;
        }
        match self.registry.match_signature(prefix) {
            Some(index) => Protocol::Custom(index),
            None => Protocol::Unknown,
        }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }
}

pub fn is_http_prefix(prefix: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| prefix.starts_with(method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn detector_with(signatures: &[&'static [u8]]) -> ProtocolDetector {
        let registry = Arc::new(ProtocolRegistry::new());
        for (i, magic) in signatures.iter().enumerate() {
            registry
                .register(
                    &format!("proto-{}", i),
                    Bytes::from_static(magic),
                    |_stream: Rewind<BoxedStream>, _peer: SocketAddr, _prefix: Bytes| async {
                        Ok::<(), AppError>(())
                    },
                )
                .unwrap();
        }
        ProtocolDetector::new(registry)
    }

    #[rstest]
    #[case(b"GET / HTTP/1.1\r\n", Protocol::Http)]
    #[case(b"OPTIONS * HTTP/1", Protocol::Http)]
    #[case(b"NOVA\x00\x01", Protocol::Custom(0))]
    #[case(b"GETX / HTTP/1.1", Protocol::Unknown)]
    #[case(b"get / HTTP/1.1", Protocol::Unknown)]
    #[case(b"NOV", Protocol::Unknown)]
    #[case(b"", Protocol::Unknown)]
    fn classifies_prefixes(#[case] prefix: &[u8], #[case] expected: Protocol) {
        let detector = detector_with(&[b"NOVA"]);
        assert_eq!(detector.classify(prefix), expected);
    }

    #[tokio::test]
    async fn waits_for_fragmented_prefix() {
        let detector = detector_with(&[b"NOVA"]);
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for chunk in [&b"GE"[..], b"T /ind", b"ex HTTP/1.1\r\n"] {
                client.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // keep the pipe open so detection cannot stop on eof
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let (protocol, prefix) = detector.detect(&mut server).await.unwrap();
        assert_eq!(protocol, Protocol::Http);
        assert_eq!(prefix.len(), PEEK_SIZE);
        assert_eq!(&prefix[..], b"GET /index HTTP/");
    }

    #[tokio::test]
    async fn short_stream_is_classified_at_eof() {
        let detector = detector_with(&[b"NOVA"]);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"NOVA").await.unwrap();
        drop(client);
        let (protocol, prefix) = detector.detect(&mut server).await.unwrap();
        assert_eq!(protocol, Protocol::Custom(0));
        assert_eq!(&prefix[..], b"NOVA");
    }

    #[tokio::test]
    async fn prefix_is_not_lost() {
        let detector = detector_with(&[]);
        let (mut client, mut server) = tokio::io::duplex(128);
        client
            .write_all(b"POST /submit HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        drop(client);
        let (protocol, prefix) = detector.detect(&mut server).await.unwrap();
        assert_eq!(protocol, Protocol::Http);
        let mut rewound = Rewind::new_buffered(server, prefix);
        let mut all = String::new();
        rewound.read_to_string(&mut all).await.unwrap();
        assert_eq!(all, "POST /submit HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[test]
    fn signature_length_is_bounded() {
        let registry = ProtocolRegistry::new();
        let handler =
            |_s: Rewind<BoxedStream>, _p: SocketAddr, _b: Bytes| async { Ok::<(), AppError>(()) };
        assert!(registry.register("empty", Bytes::new(), handler).is_err());
        assert!(registry
            .register("long", Bytes::from(vec![1u8; PEEK_SIZE + 1]), handler)
            .is_err());
        assert!(registry.register("ok", Bytes::from_static(b"\xCA\xFE"), handler).is_ok());
        assert!(registry.register("dup", Bytes::from_static(b"\xCA\xFE"), handler).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_uses_default_handler() {
        let registry = ProtocolRegistry::new();
        assert!(registry.handler_for(&Protocol::Unknown).is_none());
        registry.set_default_handler(|_s: Rewind<BoxedStream>, _p: SocketAddr, _b: Bytes| async {
            Ok::<(), AppError>(())
        });
        assert!(registry.handler_for(&Protocol::Unknown).is_some());
        assert!(registry.handler_for(&Protocol::Http).is_none());
    }
}
