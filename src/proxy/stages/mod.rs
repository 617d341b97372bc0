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

/// Header/body translation runs as an ordered chain of stages so each
/// concern (cookie scoping, CSP relaxation, response hygiene, URL
/// rewriting) stays in its own unit and the glue code drives them
/// uniformly per flow.

mod csp;
mod hygiene;
mod rewrite;
mod scope;

pub use csp::CspStage;
pub use hygiene::HygieneStage;
pub use rewrite::RewriteStage;
pub use scope::CookieScopeStage;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{proxy::flow::Flow, rewrite::UrlRewriter};

#[derive(Clone)]
/// Ordered pipeline of translation stages run for every proxied flow.
///
/// Each stage is built once during boot and kept behind an `Arc` so the
/// pipeline stays `Clone`/`Send` across connection tasks. Request hooks run
/// before dispatch; response hooks run after the winning candidate
/// responded, headers before bodies.
pub struct StagePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    stages: Vec<Arc<dyn FlowStage>>, // order is fixed at build time
}

impl StagePipeline {
    /// Builds the pipeline. Cookie scoping runs first on both directions so
    /// later stages see translated cookies; the rewriter runs last because
    /// it only touches bodies.
    pub fn build(proxy_host: &str) -> Result<Self> {
        let host_only = proxy_host
            .split_once(':')
            .map(|(h, _)| h)
            .unwrap_or(proxy_host);

        let mut stages: Vec<Arc<dyn FlowStage>> = Vec::new();
        stages.push(Arc::new(CookieScopeStage::new(host_only)));
        stages.push(Arc::new(CspStage::new(proxy_host)));
        stages.push(Arc::new(HygieneStage::default()));
        stages.push(Arc::new(RewriteStage::new(UrlRewriter::new(proxy_host))));

        Ok(Self {
            inner: Arc::new(PipelineInner { stages }),
        })
    }

    /// Runs the per-request hooks in pipeline order, before dispatch.
    pub async fn process_request(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_request(flow).await?;
        }
        Ok(())
    }

    /// Runs the response header hooks once the winning upstream response is
    /// buffered.
    pub async fn process_response_headers(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_response_headers(flow).await?;
        }
        Ok(())
    }

    /// Runs response-body hooks (content decoding, URL rewriting).
    pub async fn process_response_body(&self, flow: &mut Flow) -> Result<()> {
        for stage in &self.inner.stages {
            stage.on_response_body(flow).await?;
        }
        Ok(())
    }
}

#[async_trait]
/// Trait implemented by each translation stage. The default implementations
/// are no-ops.
pub trait FlowStage: Send + Sync {
    async fn on_request(&self, _flow: &mut Flow) -> Result<()> {
        // default no-op; stages override what they need.
        Ok(())
    }

    async fn on_response_headers(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }

    async fn on_response_body(&self, _flow: &mut Flow) -> Result<()> {
        Ok(())
    }
}
