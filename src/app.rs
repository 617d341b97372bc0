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

use crate::{
    config::RefractConfig,
    limiter::RateLimiter,
    proxy::{
        connection::ConnectionContext, dispatch::UpstreamDispatcher, stages::StagePipeline,
        ProxyServer,
    },
    resolve::{Origin, OriginResolver},
    telemetry::TelemetrySink,
};

/// RefractApp wires together configuration, the translation pipeline, the
/// rate limiter, and the proxy server.
pub struct RefractApp {
    server: ProxyServer,
}

impl RefractApp {
    /// Constructs a new RefractApp from the given configuration.
    pub fn new(config: RefractConfig) -> Result<Self> {
        let telemetry = TelemetrySink::new(config.telemetry.clone());

        let pipeline = StagePipeline::build(&config.listener.public_host)?;

        let limiter = RateLimiter::new(&config.limiter);
        let dispatcher = UpstreamDispatcher::new(limiter, telemetry.clone());

        let resolver = OriginResolver::new(Origin::new(config.upstream.fallback_origin.clone()));

        let ctx = ConnectionContext {
            pipeline,
            dispatcher,
            resolver,
            telemetry,
            state_cookie_secure: config.state.secure,
        };

        let server = ProxyServer::new(config.listener.clone(), ctx);

        Ok(Self { server })
    }

    /// Runs the application (binds the listener, accepts connections until
    /// the process exits).
    pub async fn run(self) -> Result<()> {
        self.server.run().await
    }
}
