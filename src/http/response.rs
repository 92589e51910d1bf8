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

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use super::headers::HeaderMap;
use crate::{AppError, AppResult};

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => match status / 100 {
            1 => "Informational",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            _ => "Server Error",
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub max_age: Option<i64>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

/// An http response being assembled by the pipeline.
///
/// Nothing touches the socket until the connection writes [`Response::encode`] in one go.
/// Once a body has been sent the response is committed and any further change fails
/// with [`AppError::ResponseAlreadySent`].
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    cookies: Vec<String>,
    body: Bytes,
    sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: 200,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            sent: false,
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.sent {
            Err(AppError::ResponseAlreadySent)
        } else {
            Ok(())
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn status(&mut self, status: u16) -> AppResult<&mut Self> {
        self.ensure_open()?;
        if !(100..=599).contains(&status) {
            return Err(AppError::InvalidValue(format!("status code {}", status)));
        }
        self.status = status;
        Ok(self)
    }

    pub fn header(&mut self, name: &str, value: &str) -> AppResult<&mut Self> {
        self.ensure_open()?;
        if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(AppError::InvalidValue(format!("header {:?}", name)));
        }
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn cookie(
        &mut self,
        name: &str,
        value: &str,
        options: &CookieOptions,
    ) -> AppResult<&mut Self> {
        self.ensure_open()?;
        if name.is_empty() || name.contains([';', '=', '\r', '\n', ' ']) {
            return Err(AppError::InvalidValue(format!("cookie name {:?}", name)));
        }
        let mut cookie = format!(
            "{}={}",
            name,
            percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC)
        );
        if let Some(max_age) = options.max_age {
            let _ = write!(cookie, "; Max-Age={}", max_age);
        }
        if let Some(path) = &options.path {
            let _ = write!(cookie, "; Path={}", path);
        }
        if let Some(domain) = &options.domain {
            let _ = write!(cookie, "; Domain={}", domain);
        }
        if options.secure {
            cookie.push_str("; Secure");
        }
        if options.http_only {
            cookie.push_str("; HttpOnly");
        }
        if let Some(same_site) = options.same_site {
            let _ = write!(cookie, "; SameSite={}", same_site.as_str());
        }
        self.cookies.push(cookie);
        Ok(self)
    }

    /// Commit the response with `body`.
    pub fn send(&mut self, body: impl Into<Bytes>) -> AppResult<()> {
        self.ensure_open()?;
        self.body = body.into();
        self.sent = true;
        Ok(())
    }

    pub fn text(&mut self, body: impl Into<String>) -> AppResult<()> {
        self.content_type("text/plain; charset=utf-8")?;
        self.send(body.into())
    }

    pub fn html(&mut self, body: impl Into<String>) -> AppResult<()> {
        self.content_type("text/html; charset=utf-8")?;
        self.send(body.into())
    }

    /// Send an already serialized json document.
    pub fn json(&mut self, body: impl Into<String>) -> AppResult<()> {
        self.content_type("application/json")?;
        self.send(body.into())
    }

    pub fn redirect(&mut self, location: &str, status: u16) -> AppResult<()> {
        if !(300..=399).contains(&status) {
            return Err(AppError::InvalidValue(format!("redirect status {}", status)));
        }
        self.status(status)?.header("Location", location)?;
        self.send(Bytes::new())
    }

    pub fn no_content(&mut self) -> AppResult<()> {
        self.status(204)?;
        self.send(Bytes::new())
    }

    fn content_type(&mut self, value: &str) -> AppResult<()> {
        if !self.headers.contains("Content-Type") {
            self.header("Content-Type", value)?;
        }
        Ok(())
    }

    /// Status line, headers and body as one buffer. `Content-Length`, `Date` and
    /// `Connection: close` are always set here.
    pub fn encode(&self) -> Bytes {
        let mut head = String::with_capacity(128);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Date")
                || name.eq_ignore_ascii_case("Connection")
            {
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        for cookie in &self.cookies {
            let _ = write!(head, "Set-Cookie: {}\r\n", cookie);
        }
        let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        let _ = write!(head, "Date: {}\r\n", http_date());
        head.push_str("Connection: close\r\n\r\n");

        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }

    /// A standalone response for errors raised before the pipeline runs.
    pub fn error(status: u16, message: &str) -> Response {
        let mut response = Response::new();
        response.status = status;
        response
            .headers
            .insert("Content-Type", "text/plain; charset=utf-8");
        response.body = Bytes::copy_from_slice(message.as_bytes());
        response.sent = true;
        response
    }
}

pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
