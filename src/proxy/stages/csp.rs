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

use anyhow::Result;
use async_trait::async_trait;
use http::header::{
    HeaderValue, CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY,
};

use crate::proxy::flow::Flow;

use super::FlowStage;

/// Origin CSP headers would block everything the rewriter redirects through
/// the proxy host, so any policy an origin sends is replaced wholesale with
/// one permissive policy whose report-uri points at the proxy's debug sink.
#[derive(Clone)]
pub struct CspStage {
    policy: HeaderValue,
}

/// Replacement policy template; `{proxy_host}` is substituted at boot.
const POLICY_TEMPLATE: &str = "default-src 'self' data: 'unsafe-inline' 'unsafe-eval' https:; \
    script-src 'self' data: 'unsafe-inline' 'unsafe-eval' https: blob:; \
    style-src 'self' data: 'unsafe-inline' https:; \
    img-src 'self' data: https: blob:; \
    font-src 'self' data: https:; \
    connect-src 'self' data: https: wss: blob:; \
    media-src 'self' data: https: blob:; \
    object-src 'self' https:; \
    child-src 'self' https: data: blob:; \
    form-action 'self' https:; \
    report-uri http://{proxy_host}/debug/csp";

impl CspStage {
    pub fn new(proxy_host: &str) -> Self {
        let policy = POLICY_TEMPLATE.replace("{proxy_host}", proxy_host);
        Self {
            policy: HeaderValue::from_str(&policy).expect("policy template is ASCII"),
        }
    }

    pub fn policy(&self) -> &str {
        self.policy.to_str().unwrap_or_default()
    }
}

#[async_trait]
impl FlowStage for CspStage {
    async fn on_response_headers(&self, flow: &mut Flow) -> Result<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };

        for header in [CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY] {
            if response.headers.contains_key(&header) {
                response.headers.remove(&header);
                response.headers.insert(header, self.policy.clone());
            }
        }

        Ok(())
    }
}
