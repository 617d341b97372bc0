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

//! Origin resolution: deciding which upstream origins to try for a request,
//! in which order, and how the client's remembered-origin list evolves
//! afterwards.
//!
//! The remembered list lives entirely in the `proxyTargets` cookie (a JSON
//! array of origin strings), so the server holds no per-client state. Index
//! zero is the most recently successful origin.

use http::{Method, StatusCode};

use crate::utils::{ProxyError, ProxyResult};

/// Name of the state cookie holding the remembered-origin list.
pub const STATE_COOKIE: &str = "proxyTargets";

/// A scheme+authority pair (`https://host[:port]`). Equality is
/// string-exact; no normalization is applied anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin(String);

impl Origin {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map(|(s, _)| s).unwrap_or("")
    }

    pub fn is_https(&self) -> bool {
        self.scheme().eq_ignore_ascii_case("https")
    }

    /// `[userinfo@]host[:port]` part of the origin.
    pub fn authority(&self) -> &str {
        self.0.split_once("://").map(|(_, a)| a).unwrap_or("")
    }

    /// Authority without userinfo; this is what the upstream `Host` header
    /// carries.
    pub fn host_header(&self) -> &str {
        let authority = self.authority();
        authority
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(authority)
    }

    /// Hostname (brackets stripped for IPv6 literals) and port for dialing.
    /// Missing ports default by scheme (80/443).
    pub fn dial_target(&self) -> (String, u16) {
        let host_port = self.host_header();
        let default_port = if self.is_https() { 443 } else { 80 };

        if let Some(rest) = host_port.strip_prefix('[') {
            // Bracketed IPv6 literal, optional ":port" after the bracket.
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return (host.to_string(), port);
            }
        }

        match host_port.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().unwrap_or(default_port),
            ),
            None => (host_port.to_string(), default_port),
        }
    }

    /// Decodes the wire form used in proxy paths (`https.host[:port]`): the
    /// single `.` after the scheme stands for `://`.
    pub fn from_encoded_segment(segment: &str) -> Option<Self> {
        let (scheme, host) = segment.split_once('.')?;
        if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
            return None;
        }
        Some(Self(format!("{scheme}://{host}")))
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered sequence of origins remembered for one client, most recently
/// successful first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginList(Vec<Origin>);

impl OriginList {
    pub fn new(origins: Vec<Origin>) -> Self {
        Self(origins)
    }

    /// Decodes the cookie value (a JSON array of strings). Leading empty
    /// entries are discarded on read so the head invariant holds.
    pub fn from_cookie_value(raw: &str) -> ProxyResult<Self> {
        let entries: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| ProxyError::CookieParse(format!("bad {STATE_COOKIE} value: {e}")))?;
        let origins = entries
            .into_iter()
            .skip_while(|entry| entry.is_empty())
            .map(Origin::new)
            .collect();
        Ok(Self(origins))
    }

    pub fn to_cookie_value(&self) -> String {
        let entries: Vec<&str> = self.0.iter().map(Origin::as_str).collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn head(&self) -> Option<&Origin> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Origin> {
        self.0.iter()
    }

    fn truncate_front(&mut self, count: usize) {
        self.0.drain(..count.min(self.0.len()));
    }

    fn prepend(&mut self, origin: Origin) {
        self.0.insert(0, origin);
    }
}

/// One (origin, list-index) pair considered during fallback. `list_index`
/// is `None` for origins not drawn from the cookie list (encoded-path and
/// fallback origins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub origin: Origin,
    pub list_index: Option<usize>,
}

/// Output of resolution: the ordered candidates and the path (with query)
/// that is sent upstream.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub candidates: Vec<Candidate>,
    pub upstream_target: String,
}

/// Resolves request URLs and cookies into candidate origins and mutates the
/// remembered list after dispatch.
#[derive(Debug, Clone)]
pub struct OriginResolver {
    fallback: Origin,
}

impl OriginResolver {
    pub fn new(fallback: Origin) -> Self {
        Self { fallback }
    }

    /// Resolution policy, in priority order: encoded origin in the first
    /// path segment, then the cookie list, then the configured fallback.
    pub fn resolve(&self, path_and_query: &str, list: &OriginList) -> Resolution {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };

        if path.starts_with("/http.") || path.starts_with("/https.") {
            let segment = path[1..].split('/').next().unwrap_or_default();
            let origin = Origin::from_encoded_segment(segment)
                // Grammar validation in the dispatcher rejects the leftovers.
                .unwrap_or_else(|| Origin::new(segment.replacen('.', "://", 1)));

            let remainder = &path[1 + segment.len()..];
            let mut target = if remainder.is_empty() {
                "/".to_string()
            } else {
                remainder.to_string()
            };
            if let Some(q) = query {
                target.push('?');
                target.push_str(q);
            }

            return Resolution {
                candidates: vec![Candidate {
                    origin,
                    list_index: None,
                }],
                upstream_target: target,
            };
        }

        if !list.is_empty() {
            // Duplicates are tolerated in the cookie but dialed only once,
            // keeping the first occurrence and its index.
            let mut seen: Vec<&str> = Vec::new();
            let mut candidates = Vec::with_capacity(list.len());
            for (index, origin) in list.iter().enumerate() {
                if seen.contains(&origin.as_str()) {
                    continue;
                }
                seen.push(origin.as_str());
                candidates.push(Candidate {
                    origin: origin.clone(),
                    list_index: Some(index),
                });
            }
            return Resolution {
                candidates,
                upstream_target: path_and_query.to_string(),
            };
        }

        Resolution {
            candidates: vec![Candidate {
                origin: self.fallback.clone(),
                list_index: None,
            }],
            upstream_target: "/".to_string(),
        }
    }

    /// List mutation after dispatch:
    /// - a 2xx served from list index k > 0 discards the k stale entries in
    ///   front of it;
    /// - a 2xx HTML response to a GET from an off-list origin is promoted to
    ///   the head (unless it already is the head).
    ///
    /// Returns the list to emit as the outgoing `proxyTargets` cookie, or
    /// `None` when the list is empty and nothing was learned.
    pub fn commit(
        &self,
        list: &OriginList,
        winner: &Candidate,
        status: StatusCode,
        method: &Method,
        response_is_html: bool,
    ) -> Option<OriginList> {
        let mut mutated = list.clone();

        if status.is_success() {
            match winner.list_index {
                Some(k) if k > 0 => mutated.truncate_front(k),
                Some(_) => {}
                None => {
                    if *method == Method::GET
                        && response_is_html
                        && mutated.head() != Some(&winner.origin)
                    {
                        mutated.prepend(winner.origin.clone());
                    }
                }
            }
        }

        if mutated.is_empty() {
            None
        } else {
            Some(mutated)
        }
    }
}
