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
use http::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN};

use crate::proxy::flow::Flow;

use super::FlowStage;

/// Response header hygiene: connection-scoped headers never survive the hop
/// to the client, and every proxied response opens itself to cross-origin
/// reads since the browser sees a single proxy origin anyway.
#[derive(Clone, Default)]
pub struct HygieneStage;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "upgrade",
    "te",
];

#[async_trait]
impl FlowStage for HygieneStage {
    async fn on_response_headers(&self, flow: &mut Flow) -> Result<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };

        for name in HOP_BY_HOP_HEADERS {
            response.headers.remove(*name);
        }

        response
            .headers
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::flow::{Flow, RequestParts, ResponseParts};
    use http::header::CONNECTION;

    #[tokio::test]
    async fn hop_by_hop_headers_are_stripped_and_cors_opened() {
        let mut response = ResponseParts::default();
        response
            .headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        response
            .headers
            .insert("keep-alive", HeaderValue::from_static("timeout=5"));
        response
            .headers
            .insert("x-upstream", HeaderValue::from_static("kept"));
        let mut flow = Flow::new(RequestParts::default());
        flow.response = Some(response);

        HygieneStage.on_response_headers(&mut flow).await.unwrap();

        let headers = &flow.response.as_ref().unwrap().headers;
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(
            headers.get("x-upstream").and_then(|v| v.to_str().ok()),
            Some("kept")
        );
        assert_eq!(
            headers
                .get(ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
