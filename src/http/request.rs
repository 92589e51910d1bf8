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
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use super::decoder::{parse_head, HttpLimits, RequestHead};
use super::headers::HeaderMap;
use crate::{AppError, AppResult};

/// A decoded http request.
///
/// Everything read off the wire is fixed once decoding finishes. Path parameters are
/// filled in by the router, and the attribute map is where pipeline stages hand data
/// forward to later stages.
pub struct Request {
    method: String,
    target: String,
    path: String,
    raw_query: Option<String>,
    query: HashMap<String, String>,
    version: String,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    params: HashMap<String, String>,
    body: Bytes,
    client_addr: SocketAddr,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("raw_query", &self.raw_query)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .field("body", &self.body.len())
            .field("client_addr", &self.client_addr)
            .finish()
    }
}

impl Request {
    pub(crate) fn from_head(head: RequestHead, body: Bytes, client_addr: SocketAddr) -> Request {
        Request {
            method: head.method,
            target: head.target,
            path: head.path,
            raw_query: head.raw_query,
            query: head.query,
            version: head.version,
            headers: head.headers,
            cookies: head.cookies,
            params: HashMap::new(),
            body,
            client_addr,
            attributes: HashMap::new(),
        }
    }

    /// Decode a complete request held in memory, e.g. to drive handlers without a socket.
    pub fn from_bytes(raw: &[u8], client_addr: SocketAddr) -> AppResult<Request> {
        let mut buf = BytesMut::from(raw);
        let head = parse_head(&mut buf, &HttpLimits::default())?
            .ok_or_else(|| AppError::MalformedRequest("incomplete request head".to_string()))?;
        let length = head.content_length()?;
        if buf.len() < length {
            return Err(AppError::MalformedRequest(format!(
                "body truncated at {} of {} bytes",
                buf.len(),
                length
            )));
        }
        let body = buf.split_to(length).freeze();
        Ok(Request::from_head(head, body, client_addr))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target exactly as sent.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Decoded, normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self
                .headers
                .get("Upgrade")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
            && self.headers.contains_token("Connection", "upgrade")
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Box::new(value));
    }

    /// The attribute under `key`, if present and of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_attribute(&mut self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }
}
