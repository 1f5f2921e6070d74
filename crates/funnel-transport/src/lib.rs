//! Reconnectable MCP transport clients: shared lifecycle, correlation, and
//! backoff (§4.4–4.8), plus four wire-protocol implementations (§4.7).

pub mod base;
pub mod config;
pub mod correlator;
pub mod factory;
pub mod reconnect;
pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod websocket;

pub use base::{AuthHeaderProvider, BaseClientTransport, ClientTransportOps, TransportEvent};
pub use config::{AuthConfig, AuthHeaders, ConnectionState, ReconnectionPolicy, TransportConfig};
pub use correlator::{CorrelatedResult, MessageCorrelator};
pub use factory::{Transport, TransportFactory};
pub use reconnect::{ReconnectionManager, StateChangeEvent};
