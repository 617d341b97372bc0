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

use http::StatusCode;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The composed upstream URL does not satisfy the URL grammar.
    #[error("invalid upstream URL: {0}")]
    InvalidUpstreamUrl(String),

    /// The resolver produced zero candidate origins.
    #[error("no candidate origins for request")]
    NoCandidates,

    /// The request fingerprint exceeded the sliding-window limit.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Every candidate failed at the transport layer (TCP/TLS/DNS).
    #[error("all upstream candidates failed: {0}")]
    UpstreamTransport(String),

    /// A single Set-Cookie header did not parse. The caller drops the header
    /// and continues.
    #[error("malformed cookie: {0}")]
    CookieParse(String),

    /// The response body could not be relayed after headers were sent.
    #[error("response body relay failed: {0}")]
    BodyPipe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// Status reported to the client when this error terminates a flow.
    /// Upstream HTTP statuses >= 400 are not errors and never reach here;
    /// they are forwarded as responses.
    pub fn client_status(&self) -> StatusCode {
        match self {
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
