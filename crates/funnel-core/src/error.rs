//! Errors shared by environment resolution, validation, and secret providers.

use thiserror::Error;

/// A specialized `Result` type for `funnel-core` operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised while resolving `${VAR}` patterns, validating inputs, or
/// composing secret providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// A `${...}` pattern did not match the accepted variable-name grammar.
    #[error("invalid variable pattern: {0}")]
    InvalidPattern(String),

    /// A variable name reappeared on its own expansion path.
    #[error("circular reference: {0}")]
    CircularReference(String),

    /// Expansion recursed past the configured `maxDepth`.
    #[error("max expansion depth exceeded")]
    MaxDepthExceeded,

    /// Strict-mode resolution found no value and no default for a variable.
    #[error("missing variable: {0}")]
    MissingVariable(String),

    /// A required field was absent or empty.
    #[error("{context}: missing required field '{field}'")]
    MissingField {
        /// Caller-supplied context prefix.
        context: String,
        /// The field name that was required.
        field: String,
    },

    /// A URL failed to parse.
    #[error("{context}: invalid URL: {source}")]
    InvalidUrl {
        /// Caller-supplied context prefix.
        context: String,
        /// The underlying parse error.
        source: url::ParseError,
    },

    /// A server identifier contained characters outside `[A-Za-z0-9._-]`.
    #[error("invalid server id '{0}': must match [A-Za-z0-9._-]+")]
    InvalidServerId(String),

    /// An RFC 8707 resource indicator did not match this server's resource.
    #[error("requested resource '{requested}' does not match server resource '{server}'")]
    AudienceMismatch {
        /// The resource indicator presented by the client.
        requested: String,
        /// This server's own configured resource URI.
        server: String,
    },
}
