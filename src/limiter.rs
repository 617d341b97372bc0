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

//! Per-fingerprint sliding-window rate limiting.
//!
//! One process-wide FIFO of (fingerprint, timestamp) entries. Every
//! attempt appends itself, evicts entries older than the window, then
//! counts its own fingerprint; the current attempt is part of the count.
//! The append-evict-count sequence holds the lock once so it is atomic
//! across connection tasks.

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::config::LimiterConfig;

/// Identity of one upstream attempt for limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub client_ip: IpAddr,
    pub user_agent: String,
    pub origin: String,
    /// Upstream path without its query string.
    pub path: String,
}

impl RequestFingerprint {
    pub fn new(
        client_ip: Option<IpAddr>,
        user_agent: Option<&str>,
        origin: &str,
        target: &str,
    ) -> Self {
        let path = target.split('?').next().unwrap_or(target);
        Self {
            client_ip: client_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            user_agent: user_agent.unwrap_or_default().to_string(),
            origin: origin.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug)]
struct RecentRequest {
    fingerprint: RequestFingerprint,
    at: Instant,
}

/// Sliding-window limiter shared by every connection task.
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    recent: Arc<Mutex<VecDeque<RecentRequest>>>,
}

impl RateLimiter {
    pub fn new(cfg: &LimiterConfig) -> Self {
        Self::with_window(Duration::from_millis(cfg.window_ms), cfg.limit)
    }

    pub fn with_window(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit,
            recent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Records the attempt and reports whether it may proceed. Returns
    /// false once more than `limit` attempts (this one included) share the
    /// fingerprint inside the window.
    pub fn check(&self, fingerprint: &RequestFingerprint) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock();

        recent.push_back(RecentRequest {
            fingerprint: fingerprint.clone(),
            at: now,
        });

        while recent
            .front()
            .map_or(false, |entry| now.duration_since(entry.at) > self.window)
        {
            recent.pop_front();
        }

        let count = recent
            .iter()
            .filter(|entry| &entry.fingerprint == fingerprint)
            .count();

        count <= self.limit
    }
}
