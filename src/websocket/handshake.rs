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

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::http::Request;
use crate::{AppError, AppResult};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SUPPORTED_VERSION: &str = "13";

/// `base64(sha1(key ++ GUID))`
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Check the upgrade headers and return the client's `Sec-WebSocket-Key`.
pub fn validate_upgrade(request: &Request) -> AppResult<String> {
    if request.method() != "GET" {
        return Err(AppError::HandshakeFailed(format!(
            "upgrade requires GET, got {}",
            request.method()
        )));
    }
    let upgrade = request.header("Upgrade").unwrap_or_default();
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(AppError::HandshakeFailed(
            "missing Upgrade: websocket".to_string(),
        ));
    }
    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::HandshakeFailed("missing Sec-WebSocket-Key".to_string()))?;
    // a conforming key is 16 random bytes in base64
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => {
            return Err(AppError::HandshakeFailed(format!(
                "malformed Sec-WebSocket-Key {:?}",
                key
            )))
        }
    }
    if let Some(version) = request.header("Sec-WebSocket-Version") {
        if version.trim() != SUPPORTED_VERSION {
            return Err(AppError::HandshakeFailed(format!(
                "unsupported websocket version {}",
                version
            )));
        }
    }
    Ok(key.to_string())
}

/// The `101 Switching Protocols` answer for a validated key.
pub fn accept_response(key: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}
