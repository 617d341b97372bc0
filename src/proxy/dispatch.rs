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

//! Upstream dispatch: drives one outbound HTTP request per candidate origin
//! until one succeeds or the list is exhausted.
//!
//! Candidates are attempted strictly sequentially. The first response seen
//! becomes the provisional best; the first response below 400 is final. The
//! buffered request body is re-sent verbatim to every candidate, so a
//! failed first attempt never consumes the upload.

use anyhow::{Context, Result};
use http::{HeaderMap, HeaderValue, Method};
use tokio::io::{AsyncWriteExt, BufReader};

use crate::{
    limiter::{RateLimiter, RequestFingerprint},
    proxy::{
        client::UpstreamClient,
        connection::parse_http_response,
        flow::{Flow, ResponseParts},
    },
    resolve::{Candidate, Origin, Resolution},
    rewrite::validate_upstream_url,
    telemetry::TelemetrySink,
    utils::{ProxyError, ProxyResult},
};

/// Methods that never carry a request body upstream.
const BODYLESS_METHODS: &[Method] = &[Method::GET, Method::HEAD, Method::TRACE];

/// Result of a completed dispatch: the response to relay and the candidate
/// that produced it.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: ResponseParts,
    pub winner: Candidate,
}

#[derive(Clone)]
pub struct UpstreamDispatcher {
    limiter: RateLimiter,
    telemetry: TelemetrySink,
}

impl UpstreamDispatcher {
    pub fn new(limiter: RateLimiter, telemetry: TelemetrySink) -> Self {
        Self { limiter, telemetry }
    }

    /// Attempts every candidate in order. Per candidate: rate-limit gate,
    /// URL grammar validation, dial, send, parse. A rate-limit hit aborts
    /// the whole request; transport failures move on to the next candidate.
    pub async fn dispatch(
        &self,
        flow: &mut Flow,
        resolution: &Resolution,
    ) -> ProxyResult<DispatchOutcome> {
        if resolution.candidates.is_empty() {
            return Err(ProxyError::NoCandidates);
        }

        let target = &resolution.upstream_target;
        let mut provisional: Option<DispatchOutcome> = None;
        let mut last_transport_error: Option<anyhow::Error> = None;

        for candidate in &resolution.candidates {
            let fingerprint = RequestFingerprint::new(
                flow.metadata.client_addr.map(|addr| addr.ip()),
                flow.metadata.user_agent.as_deref(),
                candidate.origin.as_str(),
                target,
            );
            if !self.limiter.check(&fingerprint) {
                self.telemetry
                    .rate_limited(flow.id, candidate.origin.as_str(), &fingerprint.path);
                return Err(ProxyError::RateLimited);
            }

            let url = format!("{}{}", candidate.origin.as_str(), target);
            validate_upstream_url(&url)?;

            flow.metadata.attempts += 1;
            match self.attempt(flow, candidate, target).await {
                Ok(response) => {
                    let good = response.status.as_u16() < 400;
                    tracing::debug!(
                        origin = %candidate.origin,
                        status = %response.status,
                        "upstream candidate responded"
                    );
                    if provisional.is_none() || good {
                        provisional = Some(DispatchOutcome {
                            response,
                            winner: candidate.clone(),
                        });
                    }
                    if good {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(origin = %candidate.origin, error = %err, "upstream candidate failed");
                    last_transport_error = Some(err);
                }
            }
        }

        provisional.ok_or_else(|| {
            ProxyError::UpstreamTransport(
                last_transport_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no candidates attempted".to_string()),
            )
        })
    }

    /// One full request/response exchange with a single origin.
    async fn attempt(
        &self,
        flow: &Flow,
        candidate: &Candidate,
        target: &str,
    ) -> Result<ResponseParts> {
        let request = &flow.request;
        let body_allowed = !BODYLESS_METHODS.contains(&request.method);

        let mut headers = request.headers.clone();
        apply_target_headers(&mut headers, &candidate.origin)?;
        if body_allowed {
            let len = HeaderValue::from_str(&request.body.len().to_string())
                .context("invalid computed content-length")?;
            headers.insert(http::header::CONTENT_LENGTH, len);
        }

        let mut stream = UpstreamClient::connect(&candidate.origin).await?;

        // Request line + headers + buffered body, HTTP/1.1 wire format.
        let request_line = format!("{} {} HTTP/1.1\r\n", request.method, target);
        stream.write_all(request_line.as_bytes()).await?;

        for (name, value) in &headers {
            stream.write_all(name.as_str().as_bytes()).await?;
            stream.write_all(b": ").await?;
            stream.write_all(value.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
        }
        stream.write_all(b"\r\n").await?;

        if body_allowed && !request.body.is_empty() {
            stream.write_all(request.body.as_bytes()).await?;
        }
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        parse_http_response(&mut reader, &request.method).await
    }
}

/// Points the outbound request at one origin: `Host` always carries the
/// origin's authority, and an existing `Origin` header is replaced with the
/// origin itself.
fn apply_target_headers(headers: &mut HeaderMap, origin: &Origin) -> Result<()> {
    let host = HeaderValue::from_str(origin.host_header())
        .with_context(|| format!("origin {origin} has an invalid authority"))?;
    headers.insert(http::header::HOST, host);

    if headers.contains_key(http::header::ORIGIN) {
        let value = HeaderValue::from_str(origin.as_str())
            .with_context(|| format!("origin {origin} is not a valid header value"))?;
        headers.insert(http::header::ORIGIN, value);
    }

    Ok(())
}
