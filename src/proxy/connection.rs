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

use anyhow::{Context, Result};
use cookie::Cookie;
use http::{header::HeaderValue, HeaderMap, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::{
    cookies::SetCookie,
    proxy::{
        dispatch::UpstreamDispatcher,
        flow::{BodyBuffer, Flow, RequestParts, ResponseParts},
        stages::StagePipeline,
    },
    resolve::{OriginList, OriginResolver, STATE_COOKIE},
    telemetry::TelemetrySink,
    utils::{ProxyError, ProxyResult},
};

/// Path of the debug sink accepting CSP violation reports.
const CSP_REPORT_PATH: &str = "/debug/csp";

/// Everything a connection task needs, bundled once at boot and cloned per
/// accepted socket (all members are cheap handles).
#[derive(Clone)]
pub struct ConnectionContext {
    pub pipeline: StagePipeline,
    pub dispatcher: UpstreamDispatcher,
    pub resolver: OriginResolver,
    pub telemetry: TelemetrySink,
    /// Secure attribute for the outgoing state cookie.
    pub state_cookie_secure: bool,
}

/// Handles a single client connection: parse the request, route it (debug
/// sink or proxy pipeline), and serialize exactly one response.
///
/// Flow lifecycle:
/// 1. Parse the HTTP/1.1 request off the socket (body fully buffered).
/// 2. `POST /debug/csp` short-circuits into the report sink.
/// 3. Otherwise resolve candidate origins, run request stages, dispatch,
///    run response stages, commit the remembered-origin list, reply.
///
/// Pipeline errors surface as status responses (429 for rate limiting, 500
/// with the error text otherwise); they never tear down the server.
pub async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
) -> Result<()> {
    let request = parse_http_request(&mut socket).await?;
    tracing::debug!(%peer, method = %request.method, uri = %request.uri, "parsed request");

    let mut flow = Flow::new(request);
    flow.metadata.client_addr = Some(peer);
    flow.metadata.user_agent = flow
        .request
        .headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if is_csp_report(&flow) {
        return handle_csp_report(&mut socket, &flow, &ctx).await;
    }

    match run_proxy_flow(&mut flow, &ctx).await {
        Ok(()) => {
            let response = flow
                .response
                .as_ref()
                .context("response missing after pipeline execution")?;
            if let Err(err) = send_response(&mut socket, response).await {
                // Headers may already be on the wire; log and move on.
                let err = ProxyError::BodyPipe(err.to_string());
                tracing::warn!(%peer, %err, "response relay aborted");
            }
            tracing::debug!(%peer, "response delivered to client");
            Ok(())
        }
        Err(err) => {
            let status = err.client_status();
            tracing::warn!(%peer, %status, error = %err, "flow failed");
            let body = match &err {
                ProxyError::RateLimited => String::new(),
                other => other.to_string(),
            };
            write_status_response(&mut socket, status, &body).await
        }
    }
}

/// Resolution, dispatch, translation, and state-cookie bookkeeping for one
/// proxied request.
async fn run_proxy_flow(flow: &mut Flow, ctx: &ConnectionContext) -> ProxyResult<()> {
    let list = extract_origin_list(&flow.request.headers);
    let path_and_query = flow
        .request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let resolution = ctx.resolver.resolve(&path_and_query, &list);
    flow.metadata.upstream_target = Some(resolution.upstream_target.clone());

    ctx.pipeline.process_request(flow).await?;

    let outcome = ctx.dispatcher.dispatch(flow, &resolution).await?;

    let status = outcome.response.status;
    let response_is_html = outcome
        .response
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("html"))
        .unwrap_or(false);
    let method = flow.request.method.clone();

    flow.metadata.chosen_origin = Some(outcome.winner.origin.clone());
    flow.metadata.chosen_list_index = outcome.winner.list_index;
    flow.response = Some(outcome.response);

    ctx.pipeline.process_response_headers(flow).await?;
    ctx.pipeline.process_response_body(flow).await?;

    // The state cookie is appended after the scope stage ran, so the
    // proxy's own cookie is never underscore-prefixed.
    if let Some(mutated) = ctx
        .resolver
        .commit(&list, &outcome.winner, status, &method, response_is_html)
    {
        append_state_cookie(flow, &mutated, ctx.state_cookie_secure)?;
    }

    if let Some(response) = flow.response.as_mut() {
        enforce_content_length(response)?;
    }

    emit_flow_telemetry(&ctx.telemetry, flow, status);
    Ok(())
}

/// Reads the remembered-origin list out of the request's cookies. Absent or
/// malformed values resolve to the empty list.
fn extract_origin_list(headers: &HeaderMap) -> OriginList {
    for value in headers.get_all(http::header::COOKIE).iter() {
        let Ok(raw) = value.to_str() else { continue };
        for parsed in Cookie::split_parse(raw) {
            let Ok(c) = parsed else { continue };
            if c.name() != STATE_COOKIE {
                continue;
            }
            match OriginList::from_cookie_value(c.value()) {
                Ok(list) => return list,
                Err(err) => {
                    tracing::warn!(%err, "ignoring malformed {STATE_COOKIE} cookie");
                    return OriginList::default();
                }
            }
        }
    }
    OriginList::default()
}

/// Appends the outgoing `proxyTargets` Set-Cookie carrying the mutated
/// list. HttpOnly always; Secure per configuration.
fn append_state_cookie(flow: &mut Flow, list: &OriginList, secure: bool) -> ProxyResult<()> {
    let Some(response) = flow.response.as_mut() else {
        return Ok(());
    };

    let mut cookie = SetCookie::new(STATE_COOKIE, list.to_cookie_value());
    cookie.options.path = Some("/".to_string());
    cookie.options.http_only = true;
    cookie.options.secure = secure;

    let value = HeaderValue::from_str(&cookie.to_header_value())
        .map_err(|e| ProxyError::CookieParse(format!("state cookie not header-safe: {e}")))?;
    response.headers.append(http::header::SET_COOKIE, value);
    Ok(())
}

fn is_csp_report(flow: &Flow) -> bool {
    flow.request.method == http::Method::POST
        && flow.request.uri.path() == CSP_REPORT_PATH
        && flow
            .request
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.to_ascii_lowercase().contains("/csp-report"))
            .unwrap_or(false)
}

/// Debug sink: log the violation report, reply 200. Reports that fail to
/// parse as JSON are logged raw; the sink never rejects.
async fn handle_csp_report(
    socket: &mut TcpStream,
    flow: &Flow,
    ctx: &ConnectionContext,
) -> Result<()> {
    let report = match serde_json::from_slice::<serde_json::Value>(flow.request.body.as_bytes()) {
        Ok(json) => json,
        Err(_) => serde_json::json!({
            "unparsed": String::from_utf8_lossy(flow.request.body.as_bytes()),
        }),
    };
    ctx.telemetry.csp_report(flow.id, report);

    write_status_response(socket, StatusCode::OK, "").await
}

fn emit_flow_telemetry(telemetry: &TelemetrySink, flow: &Flow, status: StatusCode) {
    let meta = &flow.metadata;
    telemetry.emit(
        "flow_complete",
        flow.id,
        serde_json::json!({
            "method": flow.request.method.as_str(),
            "target": meta.upstream_target,
            "origin": meta.chosen_origin.as_ref().map(|o| o.as_str()),
            "list_index": meta.chosen_list_index,
            "attempts": meta.attempts,
            "status": status.as_u16(),
            "body_bytes": flow.response.as_ref().map(|r| r.body.len()).unwrap_or(0),
        }),
    );
}

/// Parses a single HTTP/1.1 request from the client socket.
///
/// Captures method, URI, version, headers, and (when `Content-Length` is
/// present) the entire body. Reading stops exactly after the declared body
/// bytes. Chunked request bodies are not supported; browsers do not emit
/// them in practice.
pub async fn parse_http_request<S>(stream: &mut S) -> Result<RequestParts>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    // Request line: "GET /path HTTP/1.1"
    let read = reader
        .read_line(&mut line)
        .await
        .context("failed to read request line")?;
    if read == 0 {
        anyhow::bail!("client closed connection before sending a request");
    }
    let parts: Vec<&str> = line.trim().split_whitespace().collect();
    if parts.len() != 3 {
        anyhow::bail!("malformed HTTP request line");
    }

    let method = parts[0].parse::<http::Method>()?;
    let uri = parts[1].parse::<http::Uri>()?;
    let version = match parts[2] {
        "HTTP/1.0" => http::Version::HTTP_10,
        "HTTP/1.1" => http::Version::HTTP_11,
        _ => http::Version::HTTP_11,
    };

    let mut headers = http::HeaderMap::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }

        if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim();
            let value = line[colon_pos + 1..].trim();
            if let (Ok(header_name), Ok(header_value)) = (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(value),
            ) {
                headers.append(header_name, header_value);
            }
        }
    }

    let mut body = BodyBuffer::default();
    if let Some(content_length) = headers.get(http::header::CONTENT_LENGTH) {
        if let Ok(len) = content_length
            .to_str()
            .unwrap_or_default()
            .parse::<usize>()
        {
            read_fixed_body(&mut reader, len, &mut body).await?;
        }
    }

    Ok(RequestParts {
        method,
        uri,
        version,
        headers,
        body,
    })
}

/// Parses the entire HTTP/1.x response from an upstream origin.
///
/// Validates the status line, canonicalizes body semantics (1xx/204/205/304
/// and HEAD carry none, chunked bodies are decoded), and buffers the full
/// payload. Chunked responses leave with a computed `Content-Length`.
pub async fn parse_http_response<R>(
    reader: &mut BufReader<R>,
    request_method: &http::Method,
) -> Result<ResponseParts>
where
    R: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let read = reader
        .read_line(&mut status_line)
        .await
        .context("failed to read response status line")?;
    if read == 0 {
        anyhow::bail!("upstream closed connection before sending status line");
    }

    let status_line = trim_crlf(&status_line);
    let mut parts = status_line.splitn(3, ' ');
    let version_str = parts.next().context("response line missing HTTP version")?;
    let status_str = parts.next().context("response line missing status code")?;

    let version = match version_str {
        "HTTP/1.0" => http::Version::HTTP_10,
        "HTTP/1.1" => http::Version::HTTP_11,
        _ => http::Version::HTTP_11,
    };

    let status_code: u16 = status_str
        .parse()
        .with_context(|| format!("invalid status code: {status_str}"))?;
    let status = StatusCode::from_u16(status_code)
        .with_context(|| format!("unsupported status code: {status_code}"))?;

    let mut headers = http::HeaderMap::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .context("failed to read response header line")?;
        if read == 0 {
            anyhow::bail!("unexpected EOF while reading response headers");
        }
        let trimmed = trim_crlf(&line);
        if trimmed.is_empty() {
            break;
        }
        if let Some(colon_pos) = trimmed.find(':') {
            let (name, value) = trimmed.split_at(colon_pos);
            let header_name = name.trim();
            let header_value = value[1..].trim();
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(header_name.as_bytes()),
                http::header::HeaderValue::from_str(header_value),
            ) {
                headers.append(name, value);
            }
        }
    }

    let mut response = ResponseParts {
        status,
        version,
        headers,
        body: BodyBuffer::default(),
    };

    match response_body_encoding(&response.headers, &response.status, request_method) {
        BodyEncoding::None => {}
        BodyEncoding::ContentLength(len) => {
            read_fixed_body(reader, len, &mut response.body).await?;
        }
        BodyEncoding::Chunked => {
            read_chunked_body(reader, &mut response.body).await?;
            normalize_content_length(&mut response.headers, response.body.len())?;
        }
    }

    Ok(response)
}

/// Reads an exact number of bytes into the body buffer. Zero-length bodies
/// short-circuit.
async fn read_fixed_body<R>(
    reader: &mut BufReader<R>,
    len: usize,
    body: &mut BodyBuffer,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| format!("expected {len} body bytes, hit EOF"))?;
    body.push_bytes(&buf);
    Ok(())
}

/// Streams a chunked transfer-encoding body into memory while validating
/// every boundary: hexadecimal sizes, stripped chunk extensions, CRLF
/// terminators, and the optional trailer section.
async fn read_chunked_body<R>(reader: &mut BufReader<R>, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .await
            .context("failed to read chunk size line")?;
        if read == 0 {
            anyhow::bail!("unexpected EOF while reading chunk size");
        }

        let size_str = trim_crlf(&size_line);
        let size_token = size_str.split(';').next().unwrap_or(size_str);
        let size = usize::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size: {size_token}"))?;

        if size == 0 {
            consume_trailer_section(reader).await?;
            break;
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .await
            .with_context(|| format!("expected {size} chunk bytes, hit EOF"))?;
        body.push_bytes(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .context("failed to read chunk terminator")?;
        if crlf != [b'\r', b'\n'] {
            anyhow::bail!("chunk missing CRLF terminator");
        }
    }
    Ok(())
}

async fn consume_trailer_section<R>(reader: &mut BufReader<R>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}

fn trim_crlf(input: &str) -> &str {
    input.trim_end_matches(|c| c == '\r' || c == '\n')
}

enum BodyEncoding {
    None,
    ContentLength(usize),
    Chunked,
}

fn response_body_encoding(
    headers: &http::HeaderMap,
    status: &StatusCode,
    method: &http::Method,
) -> BodyEncoding {
    if method == http::Method::HEAD {
        return BodyEncoding::None;
    }

    if status.is_informational() {
        return BodyEncoding::None;
    }

    match status.as_u16() {
        204 | 205 | 304 => {
            return BodyEncoding::None;
        }
        _ => {}
    }

    if has_chunked_encoding(headers) {
        return BodyEncoding::Chunked;
    }
    if let Some(value) = headers.get(http::header::CONTENT_LENGTH) {
        if let Ok(len_str) = value.to_str() {
            if let Ok(len) = len_str.parse::<usize>() {
                return BodyEncoding::ContentLength(len);
            }
        }
    }
    BodyEncoding::None
}

fn has_chunked_encoding(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked")
        })
        .unwrap_or(false)
}

fn normalize_content_length(headers: &mut http::HeaderMap, len: usize) -> Result<()> {
    headers.remove(http::header::TRANSFER_ENCODING);
    let value = HeaderValue::from_str(&len.to_string()).context("invalid content-length value")?;
    headers.insert(http::header::CONTENT_LENGTH, value);
    Ok(())
}

/// The writer computes the final length itself; whatever the stages did to
/// the body, the emitted `Content-Length` matches it.
pub fn enforce_content_length(response: &mut ResponseParts) -> Result<()> {
    normalize_content_length(&mut response.headers, response.body.len())
}

/// Serializes the staged HTTP/1.x response back to the client: status line,
/// headers, blank line, full body buffer, flushed before returning.
pub async fn send_response<W>(client: &mut W, response: &ResponseParts) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = response.status.canonical_reason().unwrap_or("");
    let status_line = format!(
        "{} {} {}\r\n",
        match response.version {
            http::Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        },
        response.status.as_u16(),
        reason
    );
    client.write_all(status_line.as_bytes()).await?;

    for (name, value) in response.headers.iter() {
        client.write_all(name.as_str().as_bytes()).await?;
        client.write_all(b": ").await?;
        client.write_all(value.as_bytes()).await?;
        client.write_all(b"\r\n").await?;
    }

    client.write_all(b"\r\n").await?;

    if !response.body.is_empty() {
        client.write_all(response.body.as_bytes()).await?;
    }

    client.flush().await?;
    Ok(())
}

/// Emits a minimal status response (error surfaces and the report sink).
async fn write_status_response<W>(client: &mut W, status: StatusCode, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = ResponseParts {
        status,
        version: http::Version::HTTP_11,
        headers: http::HeaderMap::new(),
        body: BodyBuffer::default(),
    };
    if !body.is_empty() {
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body.push_bytes(body.as_bytes());
    }
    normalize_content_length(&mut response.headers, response.body.len())?;

    send_response(client, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_list_extraction_handles_absence_and_garbage() {
        let mut headers = HeaderMap::new();
        assert!(extract_origin_list(&headers).is_empty());

        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("proxyTargets=not-json"),
        );
        assert!(extract_origin_list(&headers).is_empty());

        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_str(r#"sid=1; proxyTargets=["https://a.example"]"#).unwrap(),
        );
        let list = extract_origin_list(&headers);
        assert_eq!(list.to_cookie_value(), r#"["https://a.example"]"#);
    }

    #[test]
    fn csp_report_route_requires_method_path_and_type() {
        let mut flow = Flow::new(RequestParts::default());
        assert!(!is_csp_report(&flow));

        flow.request.method = http::Method::POST;
        flow.request.uri = "/debug/csp".parse().unwrap();
        assert!(!is_csp_report(&flow));

        flow.request.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/csp-report"),
        );
        assert!(is_csp_report(&flow));

        flow.request.uri = "/debug/other".parse().unwrap();
        assert!(!is_csp_report(&flow));
    }

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: proxy.test\r\nContent-Length: 11\r\n\r\nhello world";
        let mut reader: &[u8] = raw;
        let request = parse_http_request(&mut reader).await.expect("parse");
        assert_eq!(request.method, http::Method::POST);
        assert_eq!(request.uri.path(), "/submit");
        assert_eq!(request.body.as_bytes(), b"hello world");
    }

    #[tokio::test]
    async fn parses_chunked_response_and_normalizes_length() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let response = parse_http_response(&mut reader, &http::Method::GET)
            .await
            .expect("parse");
        assert_eq!(response.body.as_bytes(), b"hello world");
        assert_eq!(
            response
                .headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some("11")
        );
        assert!(response
            .headers
            .get(http::header::TRANSFER_ENCODING)
            .is_none());
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let response = parse_http_response(&mut reader, &http::Method::HEAD)
            .await
            .expect("parse");
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn serializes_response_with_computed_length() {
        let mut response = ResponseParts::default();
        response.status = StatusCode::OK;
        response.body.push_bytes(b"0123456789");
        enforce_content_length(&mut response).unwrap();

        let mut out = Vec::new();
        send_response(&mut out, &response).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\n0123456789"));
    }
}
