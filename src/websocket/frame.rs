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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Close payload minus the 2 byte status code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> AppResult<Opcode> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(AppError::WebSocketProtocol(format!(
                "reserved opcode {:#x}",
                other
            ))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        self.as_u8() >= 0x8
    }
}

/// Which end of the connection is encoding. Clients mask every frame, servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reported locally only, never sent.
    pub const NO_STATUS: u16 = 1005;
    /// Reported locally only, never sent.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Codes an endpoint may put on the wire.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Key the frame arrived masked with, or the key to mask with on encode.
    pub mask: Option<[u8; 4]>,
    /// Always unmasked.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Frame {
        Frame {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Frame {
        Frame::new(Opcode::Text, text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Frame {
        Frame::new(Opcode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Frame {
        Frame::new(Opcode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Frame {
        Frame::new(Opcode::Pong, data)
    }

    /// A close frame whose reason is cut to fit the control frame limit without
    /// splitting a character.
    pub fn close(code: u16, reason: &str) -> Frame {
        let reason = truncate_utf8(reason, MAX_CLOSE_REASON);
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Frame::new(Opcode::Close, payload.freeze())
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Status code and reason of a close frame. An empty payload carries neither.
    pub fn close_payload(&self) -> AppResult<Option<(u16, String)>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(AppError::WebSocketProtocol(
                "close payload of 1 byte".to_string(),
            )),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                let reason = std::str::from_utf8(&self.payload[2..]).map_err(|_| {
                    AppError::WebSocketProtocol("close reason is not utf-8".to_string())
                })?;
                Ok(Some((code, reason.to_string())))
            }
        }
    }

    /// Validate the frame at the front of `buffer` and return its total length on the
    /// wire. Every length field is checked against the limits before anything is
    /// reserved for the payload.
    pub fn check(buffer: &mut BytesMut, max_payload: usize) -> AppResult<usize> {
        if buffer.len() < 2 {
            return Err(Incomplete);
        }
        let b0 = buffer[0];
        let b1 = buffer[1];
        let fin = b0 & FIN_BIT != 0;
        if b0 & RSV_BITS != 0 {
            return Err(AppError::WebSocketProtocol(
                "reserved bits must be zero".to_string(),
            ));
        }
        let opcode = Opcode::from_u8(b0 & OPCODE_BITS)?;
        let masked = b1 & MASK_BIT != 0;
        let len7 = b1 & LEN_BITS;

        if opcode.is_control() {
            if !fin {
                return Err(AppError::WebSocketProtocol(
                    "fragmented control frame".to_string(),
                ));
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(AppError::WebSocketProtocol(format!(
                    "control frame payload over {} bytes",
                    MAX_CONTROL_PAYLOAD
                )));
            }
        }

        let (payload_len, mut header_len) = match len7 {
            LEN_16 => {
                if buffer.len() < 4 {
                    return Err(Incomplete);
                }
                let len = u16::from_be_bytes([buffer[2], buffer[3]]) as u64;
                if len < LEN_16 as u64 {
                    return Err(AppError::WebSocketProtocol(format!(
                        "length {} should have used the 7-bit form",
                        len
                    )));
                }
                (len, 4)
            }
            LEN_64 => {
                if buffer.len() < 10 {
                    return Err(Incomplete);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buffer[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(AppError::WebSocketProtocol(
                        "64-bit length has the high bit set".to_string(),
                    ));
                }
                if len <= u16::MAX as u64 {
                    return Err(AppError::WebSocketProtocol(format!(
                        "length {} should have used the 16-bit form",
                        len
                    )));
                }
                (len, 10)
            }
            len => (len as u64, 2),
        };

        if payload_len > max_payload as u64 {
            return Err(AppError::PayloadTooLarge(format!(
                "frame payload of {} bytes exceeds {}",
                payload_len, max_payload
            )));
        }
        if masked {
            header_len += 4;
        }
        let total = header_len + payload_len as usize;
        if buffer.len() < total {
            buffer.reserve(total - buffer.len());
            return Err(Incomplete);
        }
        Ok(total)
    }

    /// Take one complete frame off `buffer`, or `Ok(None)` if more bytes are needed.
    pub fn parse(buffer: &mut BytesMut, max_payload: usize) -> AppResult<Option<Frame>> {
        let total = match Frame::check(buffer, max_payload) {
            Ok(total) => total,
            Err(Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut raw = buffer.split_to(total);
        let b0 = raw.get_u8();
        let b1 = raw.get_u8();
        let fin = b0 & FIN_BIT != 0;
        let opcode = Opcode::from_u8(b0 & OPCODE_BITS)?;
        match b1 & LEN_BITS {
            LEN_16 => raw.advance(2),
            LEN_64 => raw.advance(8),
            _ => {}
        }
        let mask = if b1 & MASK_BIT != 0 {
            let mut key = [0u8; 4];
            raw.copy_to_slice(&mut key);
            apply_mask(&mut raw, key);
            Some(key)
        } else {
            None
        };
        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: raw.freeze(),
        }))
    }

    /// Append the wire form of this frame, using the shortest length encoding.
    pub fn encode(&self, role: Role, dst: &mut BytesMut) {
        let mask = match role {
            Role::Server => None,
            Role::Client => Some(self.mask.unwrap_or_else(rand::random)),
        };
        let len = self.payload.len();
        dst.reserve(14 + len);

        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= FIN_BIT;
        }
        dst.put_u8(b0);
        let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
        if len < LEN_16 as usize {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | LEN_16);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | LEN_64);
            dst.put_u64(len as u64);
        }
        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }
    }

    pub fn to_bytes(&self, role: Role) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(role, &mut dst);
        dst.freeze()
    }
}

/// XOR with the key cycled over four bytes. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
