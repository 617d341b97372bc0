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

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration loaders and structures for the Refract proxy.
///
/// These types mirror `refract.toml`, apply sane defaults for every field,
/// and tolerate a missing file entirely so the proxy is usable with zero
/// configuration.
#[derive(Debug, Clone, Default, Deserialize)]
/// Top-level configuration parsed from the Refract TOML file.
///
/// Each nested struct captures one subsystem (listener, upstream dispatch,
/// rate limiter, state cookie, telemetry) so changes stay localized.
pub struct RefractConfig {
    /// Listener configuration (bind address, port, public host).
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Upstream configuration (fallback origin, dial timeouts).
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Sliding-window rate limiter configuration.
    #[serde(default)]
    pub limiter: LimiterConfig,
    /// Attributes of the `proxyTargets` state cookie.
    #[serde(default)]
    pub state: StateCookieConfig,
    /// Telemetry configuration (stdout vs structured log output).
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RefractConfig {
    /// Reads the config file and deserializes TOML. A file that does not
    /// exist yields the built-in defaults; a file that exists but fails to
    /// parse is an error (silent fallback would mask operator typos).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: RefractConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid Refract config: {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Bind address for the listener (defaults to loopback for local testing).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port used for inbound client connections.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Authority clients use to reach the proxy. Rewritten URLs and the CSP
    /// report-uri are built from this value, so it must match what the
    /// browser has in its address bar.
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            public_host: default_public_host(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_bind_port() -> u16 {
    3000
}

fn default_public_host() -> String {
    "localhost:3000".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Origin dialed when a request carries neither an encoded origin in its
    /// path nor a usable `proxyTargets` cookie.
    #[serde(default = "default_fallback_origin")]
    pub fallback_origin: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            fallback_origin: default_fallback_origin(),
        }
    }
}

fn default_fallback_origin() -> String {
    "https://www.example.com".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Width of the sliding window in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Maximum attempts per fingerprint inside one window, the current
    /// attempt included.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            limit: default_limit(),
        }
    }
}

fn default_window_ms() -> u64 {
    3000
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateCookieConfig {
    /// Whether the `proxyTargets` cookie is emitted with the `Secure`
    /// attribute. Off by default so plain-HTTP listeners keep working.
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = RefractConfig::load("/nonexistent/refract.toml").expect("defaults");
        assert_eq!(cfg.listener.bind_port, 3000);
        assert_eq!(cfg.listener.public_host, "localhost:3000");
        assert_eq!(cfg.limiter.window_ms, 3000);
        assert_eq!(cfg.limiter.limit, 10);
        assert!(!cfg.state.secure);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("refract.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        write!(
            file,
            "[listener]\nbind_port = 8080\npublic_host = \"proxy.test:8080\"\n\n[upstream]\nfallback_origin = \"https://fallback.test\"\n"
        )
        .expect("write");

        let cfg = RefractConfig::load(&path).expect("parse");
        assert_eq!(cfg.listener.bind_port, 8080);
        assert_eq!(cfg.listener.public_host, "proxy.test:8080");
        assert_eq!(cfg.upstream.fallback_origin, "https://fallback.test");
        assert_eq!(cfg.limiter.limit, 10);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("refract.toml");
        std::fs::write(&path, "[listener\nbind_port = nope").expect("write");
        assert!(RefractConfig::load(&path).is_err());
    }
}
