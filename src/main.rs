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

use std::path::PathBuf;

use clap::Parser;
use refract_proxy::{app::RefractApp, config::RefractConfig, utils::init_tracing};

/// Command-line interface definition using clap's derive API.
///
/// Minimal surface area: only the configuration file path and the logging
/// format are exposed. All behavioral config (bind address, fallback origin,
/// rate-limit window, state-cookie flags) lives in TOML, and every field has
/// a default so the proxy starts with no file at all.
#[derive(Debug, Parser)]
#[command(
    name = "refract",
    about = "Refract: URL-rewriting reverse proxy for arbitrary origins"
)]
struct Cli {
    /// Path to the Refract configuration file (TOML format).
    ///
    /// When the file does not exist at the default location the built-in
    /// defaults are used (listen on port 3000, public host localhost:3000).
    #[arg(short, long, default_value = "config/refract.toml")]
    config: PathBuf,

    /// Enable JSON-formatted logs (default: human-readable stdout).
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

/// Application entry point: parse CLI, initialize logging, load config, run server.
///
/// Startup sequence:
/// 1. Parse command-line arguments (clap validates types and required fields)
/// 2. Initialize the tracing subscriber (stdout or JSON, based on --json-logs)
/// 3. Load the TOML configuration file, falling back to defaults when absent
/// 4. Create the RefractApp (stage pipeline, rate limiter, telemetry sink)
/// 5. Run the app (binds the listener, enters the accept loop)
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    let config = RefractConfig::load(&cli.config)?;

    let app = RefractApp::new(config)?;

    app.run().await
}
