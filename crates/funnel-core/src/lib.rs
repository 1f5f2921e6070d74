//! Environment resolution, input validation, and layered secret providers
//! shared by the rest of the `mcp-funnel` workspace.

pub mod env;
pub mod error;
pub mod secret;
pub mod validation;

pub use env::{EnvResolver, ResolveMode};
pub use error::{CoreError, CoreResult};
pub use secret::{DotEnvProvider, InlineProvider, ProcessEnvProvider, SecretManager, SecretProvider};
pub use validation::{sanitize_server_id, validate_audience, validate_required, validate_url};
