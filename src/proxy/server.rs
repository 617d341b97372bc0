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

use anyhow::Result;
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

use super::connection::{handle_connection, ConnectionContext};

/// ProxyServer manages the TCP listener and spawns per-connection handler
/// tasks.
///
/// - Owns the listening socket (bound to the configured address:port)
/// - Accepts incoming connections in a loop
/// - Spawns a tokio task for each connection (concurrent handling)
/// - Hands every task a cloned [`ConnectionContext`] (all members are cheap
///   Arc-backed handles)
///
/// One client error never stops the accept loop; handler errors are logged
/// inside their task.
pub struct ProxyServer {
    listener_cfg: ListenerConfig,
    ctx: ConnectionContext,
}

impl ProxyServer {
    pub fn new(listener_cfg: ListenerConfig, ctx: ConnectionContext) -> Self {
        Self { listener_cfg, ctx }
    }

    /// Binds the listener and runs the accept loop until the process is
    /// terminated.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.listener_cfg.bind_address.parse()?,
            self.listener_cfg.bind_port,
        );

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, public_host = %self.listener_cfg.public_host, "refract listener online");

        loop {
            let (socket, peer) = listener.accept().await?;
            let ctx = self.ctx.clone();

            tracing::debug!(%peer, "accepted client");

            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, ctx).await {
                    tracing::warn!(%peer, "client session ended with error: {err:?}");
                }
            });
        }
    }
}
