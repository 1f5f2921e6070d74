//! Top-level CLI surface: config path, bind address, and the
//! print-auth-token startup flag (§6).

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HOST: &str = "127.0.0.1";

/// mcp-funnel - an MCP aggregating proxy with a built-in OAuth authorization
/// server.
#[derive(Parser, Debug)]
#[command(name = "mcp-funnel", version, about = "MCP aggregating proxy")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Port to bind the inbound HTTP surface to. Overrides `PORT`.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Host/address to bind to. Overrides `HOST`.
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Print the generated inbound auth token (if one is generated) and
    /// continue starting up.
    #[arg(long)]
    pub print_auth_token: bool,

    /// Enable verbose logging (-v, -vv, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    /// Resolves the bind port: `--port`, else `PORT`, else the default.
    pub fn resolved_port(&self) -> u16 {
        self.port
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PORT)
    }

    /// Resolves the bind host: `--host`, else `HOST`, else the default.
    pub fn resolved_host(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HOST").ok())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    /// Initializes the global tracing subscriber based on verbosity.
    pub fn init_tracing(&self) {
        let level = if self.quiet {
            Level::ERROR
        } else {
            match self.verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .init();
    }
}
