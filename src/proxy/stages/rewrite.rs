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

use anyhow::{Context, Result};
use async_trait::async_trait;
use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use std::io::{Cursor, Read};

use crate::{
    proxy::flow::{Flow, ResponseParts},
    rewrite::{is_textual_content_type, UrlRewriter},
};

use super::FlowStage;

/// Body handler: decodes compressed upstream payloads in place and runs the
/// URL rewriter over textual ones. Binary payloads and payloads with an
/// unknown encoding pass through byte-exact.
#[derive(Clone)]
pub struct RewriteStage {
    rewriter: UrlRewriter,
}

impl RewriteStage {
    pub fn new(rewriter: UrlRewriter) -> Self {
        Self { rewriter }
    }

    /// Decodes any recognized Content-Encoding chain so the forwarded body
    /// matches the headers the translator emits. Returns false when the body
    /// could not be decoded and must pass through untouched.
    fn ensure_plain_body(response: &mut ResponseParts) -> Result<bool> {
        let Some(raw) = response.headers.get(CONTENT_ENCODING) else {
            return Ok(true);
        };
        let encodings: Vec<String> = raw
            .to_str()
            .unwrap_or_default()
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty() && token != "identity")
            .collect();

        if encodings.is_empty() {
            response.headers.remove(CONTENT_ENCODING);
            return Ok(true);
        }

        let mut decoded = response.body.as_bytes().to_vec();
        for encoding in encodings.into_iter().rev() {
            decoded = match encoding.as_str() {
                "gzip" | "x-gzip" => Self::decode_gzip(&decoded)?,
                "deflate" => Self::decode_deflate(&decoded)?,
                "br" => Self::decode_brotli(&decoded)?,
                other => {
                    tracing::debug!(encoding = %other, "unsupported content-encoding, passing body through");
                    return Ok(false);
                }
            };
        }

        response.body.replace(&decoded);
        response.headers.remove(CONTENT_ENCODING);
        response.headers.remove(TRANSFER_ENCODING);
        let len_value = HeaderValue::from_str(&response.body.len().to_string())
            .context("invalid content-length after body decode")?;
        response.headers.insert(CONTENT_LENGTH, len_value);
        Ok(true)
    }

    fn decode_gzip(data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn decode_deflate(data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn decode_brotli(data: &[u8]) -> Result<Vec<u8>> {
        let cursor = Cursor::new(data);
        let mut decoder = Decompressor::new(cursor, 4096);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[async_trait]
impl FlowStage for RewriteStage {
    async fn on_response_body(&self, flow: &mut Flow) -> Result<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };

        if !Self::ensure_plain_body(response)? {
            return Ok(());
        }

        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !is_textual_content_type(content_type) {
            return Ok(());
        }

        if response.body.is_empty() {
            return Ok(());
        }

        // Rewriting is lexical over UTF-8; payloads that fail the check are
        // left alone rather than corrupted.
        let Ok(body_str) = std::str::from_utf8(response.body.as_bytes()) else {
            tracing::debug!(%content_type, "textual body is not valid UTF-8, skipping rewrite");
            return Ok(());
        };

        let rewritten = self.rewriter.rewrite(body_str);
        if let std::borrow::Cow::Owned(text) = rewritten {
            response.body.replace(text.as_bytes());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::flow::{Flow, RequestParts};
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn stage() -> RewriteStage {
        RewriteStage::new(UrlRewriter::new("localhost:3000"))
    }

    fn flow_with_body(content_type: &str, body: &[u8]) -> Flow {
        let mut response = ResponseParts::default();
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        response.body.push_bytes(body);
        let mut flow = Flow::new(RequestParts::default());
        flow.response = Some(response);
        flow
    }

    #[tokio::test]
    async fn html_bodies_are_rewritten() {
        let mut flow = flow_with_body(
            "text/html; charset=utf-8",
            br#"<a href="https://www.example.com/x">"#,
        );
        stage().on_response_body(&mut flow).await.unwrap();
        let body = flow.response.as_ref().unwrap().body.as_bytes().to_vec();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"<a href="http://localhost:3000/https.www.example.com/x">"#
        );
    }

    #[tokio::test]
    async fn binary_bodies_pass_through_byte_exact() {
        let payload = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x01];
        let mut flow = flow_with_body("image/png", &payload);
        stage().on_response_body(&mut flow).await.unwrap();
        assert_eq!(flow.response.as_ref().unwrap().body.as_bytes(), payload);
    }

    #[tokio::test]
    async fn gzip_html_is_decoded_then_rewritten() {
        let html = br#"<script src="https://cdn.example.com/a.js"></script>"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(html).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut flow = flow_with_body("text/html", &compressed);
        flow.response
            .as_mut()
            .unwrap()
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        stage().on_response_body(&mut flow).await.unwrap();

        let response = flow.response.as_ref().unwrap();
        assert!(response.headers.get(CONTENT_ENCODING).is_none());
        let body = std::str::from_utf8(response.body.as_bytes()).unwrap();
        assert!(body.contains("http://localhost:3000/https.cdn.example.com/a.js"));
    }

    #[tokio::test]
    async fn unknown_encoding_passes_through_with_header() {
        let payload = b"zstd-compressed-bytes";
        let mut flow = flow_with_body("text/html", payload);
        flow.response
            .as_mut()
            .unwrap()
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));

        stage().on_response_body(&mut flow).await.unwrap();

        let response = flow.response.as_ref().unwrap();
        assert_eq!(response.body.as_bytes(), payload);
        assert!(response.headers.get(CONTENT_ENCODING).is_some());
    }
}
