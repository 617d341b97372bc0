/* Refract Proxy (AGPL-3.0)

Cookie and header scoping for both directions:
- Requests: drop the proxy's own proxyTargets state cookie before anything
  reaches an origin, and peel one underscore off escaped `_...proxyTargets`
  cookies so the origin sees the name it originally set. Body-framing
  headers are dropped too; the dispatcher recomputes them per candidate.
- Responses: rewrite Set-Cookie Domain attributes to the proxy host so
  upstream cookies scope to the proxy, and prefix one underscore onto any
  cookie whose name would collide with proxyTargets. Unparsable Set-Cookie
  headers are dropped. No server-side storage.
*/

use anyhow::{Context, Result};
use async_trait::async_trait;
use cookie::Cookie;
use http::header::{
    HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, SET_COOKIE, TRANSFER_ENCODING,
};

use crate::{cookies::SetCookie, proxy::flow::Flow, resolve::STATE_COOKIE};

use super::FlowStage;

#[derive(Clone)]
pub struct CookieScopeStage {
    /// Hostname (no port) the proxy is reachable as; cookie Domain
    /// attributes never carry ports.
    proxy_domain: String,
}

impl CookieScopeStage {
    pub fn new(proxy_domain: impl Into<String>) -> Self {
        Self {
            proxy_domain: proxy_domain.into(),
        }
    }

    fn on_request_inner(&self, flow: &mut Flow) -> Result<()> {
        let headers = &mut flow.request.headers;

        // The upstream dispatcher reframes the buffered body itself.
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_ENCODING);
        headers.remove(TRANSFER_ENCODING);

        let mut collected = String::new();
        let mut first = true;

        for value in headers.get_all(COOKIE).iter() {
            let Ok(raw) = value.to_str() else { continue };
            for parsed in Cookie::split_parse(raw) {
                let Ok(c) = parsed else { continue };
                let name = match translate_outbound_name(c.name()) {
                    Some(name) => name,
                    None => continue,
                };
                if !first {
                    collected.push_str("; ");
                }
                first = false;
                collected.push_str(name);
                collected.push('=');
                collected.push_str(c.value());
            }
        }

        headers.remove(COOKIE);
        if !collected.is_empty() {
            let val =
                HeaderValue::from_str(&collected).context("invalid Cookie after filtering")?;
            headers.insert(COOKIE, val);
        }

        Ok(())
    }

    fn on_response_headers_inner(&self, flow: &mut Flow) -> Result<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };

        let set_cookies: Vec<String> = response
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();

        response.headers.remove(SET_COOKIE);

        for raw in set_cookies {
            let mut parsed = match SetCookie::parse(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(%err, "dropping unparsable Set-Cookie");
                    continue;
                }
            };

            if parsed.options.domain.is_some() {
                parsed.options.domain = Some(self.proxy_domain.clone());
            }

            if is_state_cookie_name(&parsed.name) {
                parsed.name.insert(0, '_');
            }

            let val = HeaderValue::from_str(&parsed.to_header_value())
                .context("invalid Set-Cookie after scoping")?;
            response.headers.append(SET_COOKIE, val);
        }

        Ok(())
    }
}

#[async_trait]
impl FlowStage for CookieScopeStage {
    async fn on_request(&self, flow: &mut Flow) -> Result<()> {
        self.on_request_inner(flow)
    }

    async fn on_response_headers(&self, flow: &mut Flow) -> Result<()> {
        self.on_response_headers_inner(flow)
    }
}

/// Maps a client cookie name onto what the upstream should see. The state
/// cookie itself vanishes; escaped variants lose one underscore.
fn translate_outbound_name(name: &str) -> Option<&str> {
    if name == STATE_COOKIE {
        return None;
    }
    if let Some(stripped) = name.strip_prefix('_') {
        if is_state_cookie_name(stripped) {
            return Some(stripped);
        }
    }
    Some(name)
}

/// True for `proxyTargets` and any `_`-prefixed variant of it.
fn is_state_cookie_name(name: &str) -> bool {
    name.trim_start_matches('_') == STATE_COOKIE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::flow::{Flow, RequestParts, ResponseParts};

    fn stage() -> CookieScopeStage {
        CookieScopeStage::new("localhost")
    }

    fn flow_with_cookie(raw: &str) -> Flow {
        let mut request = RequestParts::default();
        request
            .headers
            .insert(COOKIE, HeaderValue::from_str(raw).unwrap());
        Flow::new(request)
    }

    #[tokio::test]
    async fn state_cookie_is_stripped_from_requests() {
        let mut flow = flow_with_cookie(r#"proxyTargets=["https://a.example"]; sid=abc"#);
        stage().on_request(&mut flow).await.unwrap();
        let forwarded = flow
            .request
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(forwarded, "sid=abc");
    }

    #[tokio::test]
    async fn escaped_state_cookies_lose_one_underscore() {
        let mut flow = flow_with_cookie("_proxyTargets=upstream; __proxyTargets=deeper");
        stage().on_request(&mut flow).await.unwrap();
        let forwarded = flow
            .request
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(forwarded, "proxyTargets=upstream; _proxyTargets=deeper");
    }

    #[tokio::test]
    async fn cookie_header_removed_when_nothing_survives() {
        let mut flow = flow_with_cookie(r#"proxyTargets=["https://a.example"]"#);
        stage().on_request(&mut flow).await.unwrap();
        assert!(flow.request.headers.get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn body_framing_headers_are_dropped() {
        let mut request = RequestParts::default();
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        request
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        request
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut flow = Flow::new(request);

        stage().on_request(&mut flow).await.unwrap();
        assert!(flow.request.headers.get(CONTENT_LENGTH).is_none());
        assert!(flow.request.headers.get(CONTENT_ENCODING).is_none());
        assert!(flow.request.headers.get(TRANSFER_ENCODING).is_none());
    }

    fn flow_with_set_cookies(values: &[&str]) -> Flow {
        let mut response = ResponseParts::default();
        for v in values {
            response
                .headers
                .append(SET_COOKIE, HeaderValue::from_str(v).unwrap());
        }
        let mut flow = Flow::new(RequestParts::default());
        flow.response = Some(response);
        flow
    }

    fn set_cookie_values(flow: &Flow) -> Vec<String> {
        flow.response
            .as_ref()
            .unwrap()
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn response_domain_is_rescoped_to_proxy() {
        let mut flow =
            flow_with_set_cookies(&["sid=1; Domain=.upstream.example; Path=/; Secure"]);
        stage().on_response_headers(&mut flow).await.unwrap();
        assert_eq!(
            set_cookie_values(&flow),
            vec!["sid=1; Domain=localhost; Path=/; Secure"]
        );
    }

    #[tokio::test]
    async fn host_only_cookies_stay_host_only() {
        let mut flow = flow_with_set_cookies(&["sid=1; Path=/"]);
        stage().on_response_headers(&mut flow).await.unwrap();
        assert_eq!(set_cookie_values(&flow), vec!["sid=1; Path=/"]);
    }

    #[tokio::test]
    async fn colliding_names_gain_an_underscore() {
        let mut flow = flow_with_set_cookies(&["proxyTargets=theirs", "_proxyTargets=nested"]);
        stage().on_response_headers(&mut flow).await.unwrap();
        assert_eq!(
            set_cookie_values(&flow),
            vec!["_proxyTargets=theirs", "__proxyTargets=nested"]
        );
    }

    #[tokio::test]
    async fn unparsable_set_cookie_is_dropped() {
        let mut flow = flow_with_set_cookies(&["garbage-without-equals", "ok=1"]);
        stage().on_response_headers(&mut flow).await.unwrap();
        assert_eq!(set_cookie_values(&flow), vec!["ok=1"]);
    }
}
