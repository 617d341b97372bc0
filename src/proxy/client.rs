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

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{lookup_host, TcpStream},
    task,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;

use crate::resolve::Origin;

/// Byte stream toward one upstream origin, plain TCP or TLS depending on
/// the origin's scheme.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

pub type UpstreamStream = Box<dyn UpstreamIo>;

/// Upstream connector for establishing connections to origin servers.
pub struct UpstreamClient;

const DNS_CACHE_TTL_SECS: u64 = 60;
const DNS_MAX_ATTEMPTS: usize = 3;
const DNS_RETRY_BACKOFF_MS: u64 = 50;
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static DNS_CACHE: Lazy<DashMap<String, CachedDnsEntry>> = Lazy::new(DashMap::new);

#[derive(Clone)]
struct CachedDnsEntry {
    expires_at: Instant,
    addrs: Vec<SocketAddr>,
}

impl UpstreamClient {
    /// Connects to the origin, performing the TLS handshake when its scheme
    /// is https.
    pub async fn connect(origin: &Origin) -> Result<UpstreamStream> {
        let (host, port) = origin.dial_target();
        let stream = dial_tcp(&host, port).await?;

        if !origin.is_https() {
            return Ok(Box::new(stream));
        }

        let config = {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut cfg = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
            cfg
        };

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.clone())
            .with_context(|| format!("invalid hostname: {host}"))?;

        let tls_future = connector.connect(server_name, stream);
        let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, tls_future).await {
            Ok(result) => {
                result.with_context(|| format!("TLS handshake failed with {host}:{port}"))?
            }
            Err(_) => {
                return Err(anyhow!(
                    "TLS handshake with {host}:{port} timed out after {:?}",
                    TLS_HANDSHAKE_TIMEOUT
                ))
            }
        };

        tracing::debug!(%host, port, "upstream TLS handshake complete");
        Ok(Box::new(tls_stream))
    }
}

/// Resolves and dials the first reachable address, trying each resolved
/// address in order with a per-attempt timeout.
async fn dial_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addr_label = format!("{host}:{port}");
    tracing::debug!(%addr_label, "dialing upstream");

    let addrs = resolve_upstream_addrs(host, port)
        .await
        .with_context(|| format!("failed to resolve {addr_label}"))?;

    let mut last_err: Option<anyhow::Error> = None;
    for addr in addrs.iter().copied() {
        match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tracing::debug!(%addr, "upstream TCP connected");
                return Ok(stream);
            }
            Ok(Err(err)) => {
                tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                last_err = Some(err.into());
            }
            Err(_) => {
                tracing::warn!(%addr, "upstream TCP connect timed out after {:?}", TCP_CONNECT_TIMEOUT);
                last_err = Some(anyhow!(
                    "TCP connect to {addr} timed out after {:?}",
                    TCP_CONNECT_TIMEOUT
                ));
            }
        }
    }

    let err = last_err
        .unwrap_or_else(|| anyhow!("DNS resolution for {addr_label} returned no addresses"));
    Err(anyhow!(
        "failed to connect to {addr_label} via any resolved address: {err}"
    ))
}

async fn resolve_upstream_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let key = format!("{host}:{port}");
    let now = Instant::now();
    let mut expired = false;

    if let Some(entry) = DNS_CACHE.get(&key) {
        if entry.expires_at > now && !entry.addrs.is_empty() {
            tracing::trace!(target: "dns", %host, port, "dns cache hit");
            return Ok(entry.addrs.clone());
        }
        expired = entry.expires_at <= now;
    }

    if expired {
        DNS_CACHE.remove(&key);
    }

    let addrs = resolve_with_backoff(host, port).await?;
    if !addrs.is_empty() {
        DNS_CACHE.insert(
            key,
            CachedDnsEntry {
                expires_at: Instant::now() + Duration::from_secs(DNS_CACHE_TTL_SECS),
                addrs: addrs.clone(),
            },
        );
    }

    Ok(addrs)
}

async fn resolve_with_backoff(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=DNS_MAX_ATTEMPTS {
        match lookup_host((host, port)).await {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                if !addrs.is_empty() {
                    tracing::trace!(target: "dns", %host, port, attempt, "tokio resolver success");
                    return Ok(addrs);
                }
                last_err = Some(anyhow!("resolver returned no addresses for {host}:{port}"));
            }
            Err(err) => {
                tracing::warn!(target: "dns", %host, port, attempt, error = %err, "tokio resolver error");
                last_err = Some(err.into());
            }
        }

        if attempt < DNS_MAX_ATTEMPTS {
            let delay = Duration::from_millis(DNS_RETRY_BACKOFF_MS * attempt as u64);
            sleep(delay).await;
        }
    }

    tracing::warn!(target: "dns", %host, port, "tokio resolver exhausted retries; falling back to system resolver");
    match resolve_with_system(host, port).await {
        Ok(addrs) => Ok(addrs),
        Err(fallback_err) => Err(last_err.unwrap_or(fallback_err)),
    }
}

async fn resolve_with_system(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let host_owned = host.to_string();
    task::spawn_blocking(move || {
        (&host_owned[..], port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>())
            .map_err(|err| anyhow!(err))
    })
    .await
    .context("system resolver task failed")?
}
