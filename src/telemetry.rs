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

use serde_json::Value;
use uuid::Uuid;

use crate::config::{TelemetryConfig, TelemetryMode};

/// Structured event sink shared by every connection task.
///
/// Flow-completion events, rate-limit rejections, and CSP violation reports
/// all funnel through here so operators get one stream regardless of which
/// part of the pipeline produced the event.
#[derive(Clone)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, event: &str, flow_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(%flow_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = serde_json::json!({
                    "event": event,
                    "flow_id": flow_id,
                    "payload": payload,
                });
                println!("{}", data);
            }
        }
    }

    /// Logs a CSP violation report received on the debug sink. The report
    /// body arrives pre-parsed; unparseable bodies are reported as raw text
    /// so nothing is silently discarded.
    pub fn csp_report(&self, flow_id: Uuid, report: Value) {
        self.emit("csp_report", flow_id, report);
    }

    pub fn rate_limited(&self, flow_id: Uuid, origin: &str, path: &str) {
        self.emit(
            "rate_limited",
            flow_id,
            serde_json::json!({ "origin": origin, "path": path }),
        );
    }
}
