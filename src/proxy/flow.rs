/* Refract Proxy (AGPL-3.0)

Copyright (C) 2026 - Refract Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::net::SocketAddr;

use bytes::BytesMut;
use http::{HeaderMap, Method, Uri, Version};
use uuid::Uuid;

use crate::resolve::Origin;

/// Flow tracks everything known about one client request/response pair as
/// it moves through the proxy pipeline. Each accepted request gets its own
/// Flow so stages can mutate headers, bodies, and metadata without touching
/// other traffic.
///
/// A Flow is created right after the request is parsed, run through the
/// request stages, handed to the dispatcher (which fills `response`), run
/// through the response stages, and finally serialized back to the client.
/// Flows are owned by a single task, so mutating them with `&mut` is safe
/// without extra synchronization.
#[derive(Debug)]
pub struct Flow {
    /// Unique identifier for this request/response pair (UUID v7 =
    /// timestamp-sortable). Used for tracing and correlating telemetry.
    pub id: Uuid,

    /// Parsed HTTP request from the client (method, URI, headers, body).
    pub request: RequestParts,

    /// Parsed HTTP response from the winning upstream candidate. None until
    /// dispatch completes (or if every candidate fails).
    pub response: Option<ResponseParts>,

    /// Cross-stage metadata (client address, chosen origin, attempt counts).
    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn new(request: RequestParts) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            response: None,
            metadata: FlowMetadata::default(),
        }
    }
}

/// Parsed HTTP request components.
///
/// An owned, mutable representation of the client's request that pipeline
/// stages can inspect and modify without juggling lifetimes or async
/// readers. The parser fills these fields with the real method, URI,
/// headers, and buffered body.
#[derive(Debug)]
pub struct RequestParts {
    pub method: Method,

    /// Request target as received from the client (origin-form path).
    pub uri: Uri,

    pub version: Version,

    /// Request headers (mutable so stages can add/remove/modify).
    pub headers: HeaderMap,

    /// Buffered request body (empty for GET/HEAD). The dispatcher re-sends
    /// this buffer to each candidate in turn, which is what makes fallback
    /// after a consumed body possible.
    pub body: BodyBuffer,
}

impl Default for RequestParts {
    /// Placeholder request used by tests.
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodyBuffer::default(),
        }
    }
}

/// Parsed HTTP response components.
///
/// Stages mutate this struct directly after the upstream responds, so the
/// cookie/CSP/rewrite stages can reshape headers and payloads before the
/// downstream write.
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub status: http::StatusCode,

    pub version: Version,

    /// Response headers (mutable so stages can add/remove/modify).
    pub headers: HeaderMap,

    /// Buffered response body.
    pub body: BodyBuffer,
}

/// Growable byte buffer for HTTP request/response bodies.
///
/// Bodies are fully buffered in memory via `BytesMut`, which keeps stage
/// logic simple (no streaming state machines) at the cost of higher memory
/// usage on very large payloads.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    data: BytesMut,
}

impl BodyBuffer {
    /// Appends a byte slice to the buffer. BytesMut handles growth
    /// internally so most appends are a memcpy against existing capacity.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Read-only view of the buffered data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Replaces the buffer with new contents.
    pub fn replace(&mut self, chunk: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Typed scratchpad for stages, the dispatcher, and telemetry. Replaces the
/// ad-hoc fields a dynamic implementation would hang off the request object.
#[derive(Debug, Default)]
pub struct FlowMetadata {
    /// Peer address of the client socket, used in the rate-limit
    /// fingerprint.
    pub client_addr: Option<SocketAddr>,

    /// Client's User-Agent value, second half of the fingerprint.
    pub user_agent: Option<String>,

    /// Path (plus query) actually sent upstream after origin decoding.
    pub upstream_target: Option<String>,

    /// Origin that produced the response being returned.
    pub chosen_origin: Option<Origin>,

    /// Cookie-list index of the chosen origin; `None` when it came from the
    /// request path or the configured fallback.
    pub chosen_list_index: Option<usize>,

    /// Number of candidates actually dialed.
    pub attempts: usize,
}
