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

//! Lexical URL rewriting for textual payloads.
//!
//! Every absolute URL found by the scanner is folded behind the proxy: the
//! original authority moves into the first path segment in its encoded wire
//! form (`https.host[:port]`), and the proxy's own authority takes its
//! place. Escaped delimiters keep their escaping, so JSON-embedded and
//! string-literal URLs keep working after substitution.

pub mod scanner;

use std::borrow::Cow;

use crate::utils::{ProxyError, ProxyResult};

pub use scanner::{HostKind, SlashForm, UrlToken};

/// Content-Type fragments that mark a payload as rewritable text. Matching
/// is substring-based so parameterized types (`text/html; charset=utf-8`)
/// and vendor types (`application/ld+json`) are covered.
const TEXTUAL_TYPES: &[&str] = &["html", "css", "scss", "svg", "javascript", "json", "text"];

/// Returns true when a `Content-Type` value names a payload the rewriter
/// should process. Everything else passes through byte-exact.
pub fn is_textual_content_type(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    TEXTUAL_TYPES.iter().any(|t| lowered.contains(t))
}

/// Validates a composed upstream URL (`origin + path`) against the URL
/// grammar before it is dialed.
pub fn validate_upstream_url(url: &str) -> ProxyResult<()> {
    if scanner::is_absolute_url(url) {
        Ok(())
    } else {
        Err(ProxyError::InvalidUpstreamUrl(url.to_string()))
    }
}

/// Rewrites absolute URLs in a text payload so they route back through the
/// proxy.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    proxy_host: String,
}

impl UrlRewriter {
    pub fn new(proxy_host: impl Into<String>) -> Self {
        Self {
            proxy_host: proxy_host.into(),
        }
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    /// Rewrites every matched URL whose authority is not already the proxy.
    /// Returns the input untouched when nothing matched, which also makes
    /// the operation idempotent: a second pass only sees proxy-host URLs and
    /// leaves them alone.
    pub fn rewrite<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let tokens = scanner::scan(input);
        if tokens.is_empty() {
            return Cow::Borrowed(input);
        }

        let mut out = String::with_capacity(input.len() + tokens.len() * 16);
        let mut cursor = 0;

        for token in &tokens {
            out.push_str(&input[cursor..token.start]);
            cursor = token.end;

            if token.host_port() == self.proxy_host {
                out.push_str(&input[token.start..token.end]);
                continue;
            }

            self.emit_rewritten(&mut out, input, token);
        }
        out.push_str(&input[cursor..]);

        Cow::Owned(out)
    }

    /// Emits the proxied form of one match:
    ///
    /// ```text
    /// [http:] <delim> <delim> <proxy-host> <sep> <proto-wire> "." <authority> <rest>
    /// ```
    ///
    /// `<sep>` takes the form of the path's leading delimiter when a path is
    /// present, otherwise the authority delimiter form. A source without a
    /// scheme stays scheme-less and its wire protocol defaults to `http`.
    fn emit_rewritten(&self, out: &mut String, input: &str, token: &UrlToken<'_>) {
        if token.protocol.is_some() {
            out.push_str("http:");
        }
        out.push_str(token.delimiter.as_str());
        out.push_str(token.delimiter.as_str());
        out.push_str(&self.proxy_host);

        let sep = token.path_delim.unwrap_or(token.delimiter);
        out.push_str(sep.as_str());

        match token.protocol {
            Some(proto) => out.push_str(&proto.to_ascii_lowercase()),
            None => out.push_str("http"),
        }
        out.push('.');
        out.push_str(token.authority);
        out.push_str(&input[token.rest_start..token.end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> UrlRewriter {
        UrlRewriter::new("localhost:3000")
    }

    #[test]
    fn rewrites_absolute_https_url() {
        let input = r#"<a href="https://www.example.com/x">"#;
        let out = rewriter().rewrite(input);
        assert_eq!(
            out,
            r#"<a href="http://localhost:3000/https.www.example.com/x">"#
        );
    }

    #[test]
    fn rewrites_http_url_with_port_and_query() {
        let out = rewriter().rewrite("fetch('http://api.example.com:8080/v2?x=1&y=2')");
        assert_eq!(
            out,
            "fetch('http://localhost:3000/http.api.example.com:8080/v2?x=1&y=2')"
        );
    }

    #[test]
    fn protocol_relative_defaults_to_http_and_stays_schemeless() {
        let out = rewriter().rewrite(r#"src="//cdn.example.com/lib.js""#);
        assert_eq!(out, r#"src="//localhost:3000/http.cdn.example.com/lib.js""#);
    }

    #[test]
    fn untouched_when_no_match() {
        let input = "plain text without links";
        assert!(matches!(rewriter().rewrite(input), Cow::Borrowed(_)));
    }

    #[test]
    fn preserves_url_without_path() {
        let out = rewriter().rewrite(r#"<a href="https://example.com">go</a>"#);
        assert_eq!(
            out,
            r#"<a href="http://localhost:3000/https.example.com">go</a>"#
        );
    }

    #[test]
    fn rewrites_ipv6_authority() {
        let out = rewriter().rewrite(r#"GET "http://[2001:db8::1]:8443/app""#);
        assert_eq!(
            out,
            r#"GET "http://localhost:3000/http.[2001:db8::1]:8443/app""#
        );
    }

    #[test]
    fn keeps_userinfo_in_encoded_origin() {
        let out = rewriter().rewrite("http://user:pw@host.test/secret");
        assert_eq!(out, "http://localhost:3000/http.user:pw@host.test/secret");
    }

    #[test]
    fn already_proxied_urls_are_untouched() {
        let input = r#"<a href="http://localhost:3000/https.www.example.com/x">"#;
        assert_eq!(rewriter().rewrite(input), input);
    }

    #[test]
    fn idempotent_over_mixed_content() {
        let input = r#"<a href="https://a.example/p"> and <img src="//b.example/i.png">"#;
        let once = rewriter().rewrite(input).into_owned();
        let twice = rewriter().rewrite(&once).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn xmlns_attribute_survives_untouched() {
        let input = r#"<svg xmlns="http://www.w3.org/2000/svg"><a href="https://example.com/x"/></svg>"#;
        let out = rewriter().rewrite(input);
        assert!(out.contains(r#"xmlns="http://www.w3.org/2000/svg""#));
        assert!(out.contains("localhost:3000/https.example.com"));
    }

    #[test]
    fn backslash_escaped_url_is_untouched() {
        let input = r#"regex: \https://example.com/x"#;
        assert_eq!(rewriter().rewrite(input), input);
    }

    #[test]
    fn preserves_backslash_and_unicode_escaped_delimiters() {
        let input = r#"src="\/\/cdn.example.com\u002fa.js""#;
        let out = rewriter().rewrite(input);
        assert_eq!(
            out,
            r#"src="\/\/localhost:3000\u002fhttp.cdn.example.com\u002fa.js""#
        );
    }

    #[test]
    fn escaped_json_url_keeps_escaping() {
        let input = r#"{"u":"https:\u002f\u002fwww.example.com\u002fpath"}"#;
        let out = rewriter().rewrite(input);
        assert_eq!(
            out,
            r#"{"u":"http:\u002f\u002flocalhost:3000\u002fhttps.www.example.com\u002fpath"}"#
        );
    }

    #[test]
    fn textual_type_detection() {
        assert!(is_textual_content_type("text/html; charset=utf-8"));
        assert!(is_textual_content_type("application/javascript"));
        assert!(is_textual_content_type("application/json"));
        assert!(is_textual_content_type("image/svg+xml"));
        assert!(is_textual_content_type("text/css"));
        assert!(!is_textual_content_type("image/png"));
        assert!(!is_textual_content_type("application/octet-stream"));
        assert!(!is_textual_content_type("audio/mpeg"));
    }

    #[test]
    fn upstream_url_validation() {
        assert!(validate_upstream_url("https://www.example.com/").is_ok());
        assert!(validate_upstream_url("http://[::1]:8080/x?q=1").is_ok());
        assert!(validate_upstream_url("https:///nohost").is_err());
        assert!(validate_upstream_url("nonsense").is_err());
    }
}
