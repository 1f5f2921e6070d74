//! The aggregating MCP proxy: config, tool registry and overrides,
//! session bookkeeping, and the kernel that wires upstream transports to
//! one inbound JSON-RPC surface.

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod kernel;
pub mod overrides;
pub mod session;

pub use config::FunnelConfig;
pub use error::{ProxyError, ProxyErrorExt, ProxyResult};
pub use http::{build_inbound_auth, build_router, MCP_ENDPOINT};
pub use kernel::ProxyKernel;
pub use overrides::ToolOverrideManager;
pub use session::{Session, SessionRegistry, TerminatedSessionCache};
