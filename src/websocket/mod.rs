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

pub use frame::{
    apply_mask, close_code, truncate_utf8, Frame, Opcode, Role, MAX_CLOSE_REASON,
    MAX_CONTROL_PAYLOAD,
};
pub use handshake::{accept_key, accept_response, validate_upgrade, WEBSOCKET_GUID};
pub use session::{run_session, SessionRegistry, WebSocketEndpoint, WebSocketHandler, WsSession};

mod frame;
mod handshake;
mod session;
