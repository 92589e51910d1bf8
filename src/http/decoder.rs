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

//! HTTP/1.1 request head decoding.
//!
//! Decoding works on the connection's read buffer in two passes, like the other codecs in
//! this crate: [`check_head`] scans the buffered bytes and either reports the length of a
//! complete head, asks for more bytes with [`AppError::Incomplete`], or fails as soon as a
//! limit is crossed. Only then does [`parse_head`] split the head off the buffer and build
//! a [`RequestHead`]. The body is read by the connection once the head is known.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use percent_encoding::percent_decode_str;

use super::headers::{is_token, HeaderMap};
use crate::service::HttpConfig;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const MAX_METHOD_LENGTH: usize = 20;
pub const MAX_DECODE_ITERATIONS: usize = 10;
const HTTP_VERSION_PREFIX: &str = "HTTP/";
/// Room for the method, version and separators around the target in a request line.
const REQUEST_LINE_SLACK: usize = MAX_METHOD_LENGTH + 16;
/// Stray CR/LF bytes tolerated before the request line.
const MAX_LEADING_LINE_BREAKS: usize = 8;

#[derive(Debug, Clone)]
pub struct HttpLimits {
    pub max_header_size: usize,
    pub max_total_header_size: usize,
    pub max_header_count: usize,
    pub max_uri_length: usize,
    pub max_body_size: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        HttpLimits::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpLimits {
    fn from(config: &HttpConfig) -> Self {
        HttpLimits {
            max_header_size: config.max_header_size,
            max_total_header_size: config.max_total_header_size,
            max_header_count: config.max_header_count,
            max_uri_length: config.max_uri_length,
            max_body_size: config.max_body_size,
        }
    }
}

/// Request line and headers of a request whose body has not been read yet.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub path: String,
    pub raw_query: Option<String>,
    pub query: HashMap<String, String>,
    pub version: String,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
}

impl RequestHead {
    /// Declared body length. A missing header means no body.
    pub fn content_length(&self) -> AppResult<usize> {
        let mut declared: Option<u64> = None;
        for value in self.headers.get_all("Content-Length") {
            let value = value.trim();
            if value.starts_with('-') {
                return Err(AppError::MalformedRequest(format!(
                    "negative content-length {}",
                    value
                )));
            }
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(AppError::MalformedRequest(format!(
                    "invalid content-length {:?}",
                    value
                )));
            }
            let length: u64 = value.parse().map_err(|_| {
                AppError::MalformedRequest(format!("invalid content-length {:?}", value))
            })?;
            match declared {
                Some(previous) if previous != length => {
                    return Err(AppError::MalformedRequest(
                        "conflicting content-length headers".to_string(),
                    ))
                }
                _ => declared = Some(length),
            }
        }
        let length = declared.unwrap_or(0);
        usize::try_from(length)
            .map_err(|_| AppError::PayloadTooLarge(format!("content-length {}", length)))
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Length of the complete head at the front of `buf`, including the blank line.
pub fn check_head(buf: &[u8], limits: &HttpLimits) -> AppResult<usize> {
    let mut pos = 0;
    // tolerate stray line breaks left before the request line
    while pos < buf.len() && (buf[pos] == b'\r' || buf[pos] == b'\n') {
        pos += 1;
        if pos > MAX_LEADING_LINE_BREAKS {
            return Err(AppError::MalformedRequest(format!(
                "more than {} line breaks before the request line",
                MAX_LEADING_LINE_BREAKS
            )));
        }
    }

    let max_request_line = limits.max_uri_length + REQUEST_LINE_SLACK;
    match find_newline(&buf[pos..]) {
        None => {
            if buf.len() - pos > max_request_line {
                return Err(AppError::UriTooLong(format!(
                    "request line exceeds {} bytes",
                    max_request_line
                )));
            }
            return Err(Incomplete);
        }
        Some(end) => {
            if end > max_request_line {
                return Err(AppError::UriTooLong(format!(
                    "request line of {} bytes",
                    end
                )));
            }
            pos += end + 1;
        }
    }

    let mut total = 0;
    let mut count = 0;
    loop {
        match find_newline(&buf[pos..]) {
            None => {
                let partial = buf.len() - pos;
                if partial > limits.max_header_size {
                    return Err(AppError::HeaderTooLarge(format!(
                        "header line exceeds {} bytes",
                        limits.max_header_size
                    )));
                }
                if total + partial > limits.max_total_header_size {
                    return Err(AppError::HeaderTooLarge(format!(
                        "headers exceed {} bytes",
                        limits.max_total_header_size
                    )));
                }
                return Err(Incomplete);
            }
            Some(end) => {
                let line = trim_cr(&buf[pos..pos + end]);
                pos += end + 1;
                if line.is_empty() {
                    return Ok(pos);
                }
                if line.len() > limits.max_header_size {
                    return Err(AppError::HeaderTooLarge(format!(
                        "header line of {} bytes",
                        line.len()
                    )));
                }
                total += line.len();
                if total > limits.max_total_header_size {
                    return Err(AppError::HeaderTooLarge(format!(
                        "headers exceed {} bytes",
                        limits.max_total_header_size
                    )));
                }
                count += 1;
                if count > limits.max_header_count {
                    return Err(AppError::HeaderTooLarge(format!(
                        "more than {} headers",
                        limits.max_header_count
                    )));
                }
            }
        }
    }
}

/// Split a complete head off the front of `buf`. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &mut BytesMut, limits: &HttpLimits) -> AppResult<Option<RequestHead>> {
    let head_len = match check_head(buf, limits) {
        Ok(len) => len,
        Err(Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };
    let head = buf.split_to(head_len);
    let mut lines = head
        .chunk()
        .split(|b| *b == b'\n')
        .map(trim_cr)
        .skip_while(|line| line.is_empty());

    let request_line = lines
        .next()
        .ok_or_else(|| AppError::MalformedRequest("missing request line".to_string()))?;
    let request_line = std::str::from_utf8(request_line)
        .map_err(|_| AppError::MalformedRequest("request line is not utf-8".to_string()))?;
    let (method, target, version) = parse_request_line(request_line, limits)?;

    let mut headers = HeaderMap::with_capacity(16);
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(line)?;
        headers.append(name, value);
    }

    let (raw_path, raw_query) = split_target(&target)?;
    let path = if raw_path == "*" {
        raw_path
    } else {
        normalize_path(&raw_path)?
    };
    let query = raw_query.as_deref().map(parse_query).unwrap_or_default();
    let cookies = headers
        .get_all("Cookie")
        .map(parse_cookies)
        .fold(HashMap::new(), |mut all, c| {
            all.extend(c);
            all
        });

    Ok(Some(RequestHead {
        method,
        target,
        path,
        raw_query,
        query,
        version,
        headers,
        cookies,
    }))
}

fn parse_request_line(line: &str, limits: &HttpLimits) -> AppResult<(String, String, String)> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 {
        return Err(AppError::MalformedRequest(format!(
            "request line must have 3 parts: {:?}",
            line
        )));
    }
    let (method, target, version) = (parts[0], parts[1], parts[2]);
    if method.is_empty()
        || method.len() > MAX_METHOD_LENGTH
        || !method.bytes().all(|b| b.is_ascii_uppercase())
    {
        return Err(AppError::MalformedRequest(format!("invalid method {:?}", method)));
    }
    if !version.starts_with(HTTP_VERSION_PREFIX) {
        return Err(AppError::MalformedRequest(format!(
            "invalid version {:?}",
            version
        )));
    }
    if target.is_empty() {
        return Err(AppError::MalformedRequest("empty request target".to_string()));
    }
    if target.len() > limits.max_uri_length {
        return Err(AppError::UriTooLong(format!(
            "target of {} bytes exceeds {}",
            target.len(),
            limits.max_uri_length
        )));
    }
    Ok((method.to_string(), target.to_string(), version.to_string()))
}

fn parse_header_line(line: &[u8]) -> AppResult<(String, String)> {
    if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
        return Err(AppError::MalformedRequest(
            "folded header lines are not supported".to_string(),
        ));
    }
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| AppError::MalformedRequest("header line without ':'".to_string()))?;
    let name = std::str::from_utf8(&line[..colon])
        .map_err(|_| AppError::MalformedRequest("header name is not ascii".to_string()))?;
    if !is_token(name) {
        return Err(AppError::MalformedRequest(format!(
            "invalid header name {:?}",
            name
        )));
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    Ok((name.to_string(), value.trim().to_string()))
}

/// Split a request target into raw path and raw query. Absolute-form targets are reduced
/// to their path.
fn split_target(target: &str) -> AppResult<(String, Option<String>)> {
    let target = target.split('#').next().unwrap_or_default();
    let origin = if target.starts_with('/') || target == "*" {
        target
    } else if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => match rest.find('?') {
                Some(q) => &rest[q..],
                None => "/",
            },
        }
    } else {
        return Err(AppError::MalformedRequest(format!(
            "unsupported request target {:?}",
            target
        )));
    };
    let (path, query) = match origin.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (origin, None),
    };
    let path = if path.is_empty() { "/" } else { path };
    Ok((path.to_string(), query))
}

/// Percent-decode until the value stops changing. Input still changing after
/// [`MAX_DECODE_ITERATIONS`] rounds is rejected.
pub fn decode_iteratively(raw: &str) -> AppResult<String> {
    let mut current = raw.to_string();
    for _ in 0..MAX_DECODE_ITERATIONS {
        let decoded = percent_decode_str(&current)
            .decode_utf8()
            .map_err(|_| AppError::MalformedRequest("path is not valid utf-8".to_string()))?
            .into_owned();
        if decoded == current {
            return Ok(current);
        }
        current = decoded;
    }
    Err(AppError::MalformedRequest(
        "path encoding nested too deeply".to_string(),
    ))
}

/// Decode a raw path and collapse it into a canonical absolute path that cannot climb
/// above `/`.
pub fn normalize_path(raw: &str) -> AppResult<String> {
    let decoded = decode_iteratively(raw)?;
    if decoded.contains('\0') {
        return Err(AppError::MalformedRequest("null byte in path".to_string()));
    }
    if decoded.contains('\\') {
        return Err(AppError::MalformedRequest("backslash in path".to_string()));
    }
    if decoded.split('/').any(|segment| segment == "..") {
        return Err(AppError::MalformedRequest(format!(
            "path traversal in {:?}",
            raw
        )));
    }
    if decoded.chars().any(|c| c.is_control()) {
        return Err(AppError::MalformedRequest(
            "control character in path".to_string(),
        ));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// `a=1&b=two%20words`, later keys win.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw.as_bytes())
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// `name=value; other=value2`, values percent-decoded.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = percent_decode_str(value.trim())
                .decode_utf8_lossy()
                .into_owned();
            Some((name.to_string(), value))
        })
        .collect()
}
