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

pub use decoder::{
    check_head, decode_iteratively, normalize_path, parse_cookies, parse_head, parse_query,
    HttpLimits, RequestHead, MAX_DECODE_ITERATIONS,
};
pub use headers::HeaderMap;
pub use request::Request;
pub use response::{http_date, reason_phrase, CookieOptions, Response, SameSite};

#[cfg(test)]
pub(crate) use request::tests::request_from;

mod decoder;
mod headers;
mod request;
mod response;
