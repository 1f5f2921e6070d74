//! On-disk hierarchical configuration (§6): upstream servers, tool
//! filtering, overrides, inbound auth, OAuth, and secret providers.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use funnel_auth::oauth::OAuthProviderConfig;
use funnel_core::secret::{DotEnvProvider, InlineProvider, ProcessEnvProvider, SecretManager, SecretProvider};

use crate::error::{ProxyError, ProxyErrorExt, ProxyResult};
use crate::overrides::ToolOverride;

/// One entry under `servers`: a name plus whatever raw JSON
/// `TransportFactory::create` understands (the `transport` tag or the
/// legacy bare `{command, args, env}` shape).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(flatten)]
    pub transport_raw: serde_json::Map<String, Value>,
}

impl ServerEntry {
    /// The raw transport config as a `Value`, ready for
    /// `TransportFactory::create`.
    pub fn transport_config(&self) -> Value {
        Value::Object(self.transport_raw.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundAuthType {
    #[default]
    None,
    Bearer,
}

/// `inboundAuth: {type: none|bearer, tokens?}`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboundAuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: InboundAuthType,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// `oauth: {issuer, baseUrl, supportedScopes, defaultCodeExpiry,
/// defaultTokenExpiry, issueRefreshTokens, requirePkce}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfigSection {
    pub issuer: String,
    pub base_url: String,
    #[serde(default)]
    pub supported_scopes: Vec<String>,
    #[serde(default = "default_code_expiry")]
    pub default_code_expiry: i64,
    #[serde(default = "default_token_expiry")]
    pub default_token_expiry: i64,
    #[serde(default)]
    pub issue_refresh_tokens: bool,
    #[serde(default)]
    pub require_pkce: bool,
    /// The RFC 9728 `resource` this proxy's protected-resource document
    /// advertises. Defaults to `base_url` when unset.
    #[serde(default)]
    pub resource: Option<String>,
}

fn default_code_expiry() -> i64 {
    60
}

fn default_token_expiry() -> i64 {
    3600
}

impl From<&OAuthConfigSection> for OAuthProviderConfig {
    fn from(section: &OAuthConfigSection) -> Self {
        Self {
            issuer: section.issuer.clone(),
            base_url: section.base_url.clone(),
            supported_scopes: section.supported_scopes.clone(),
            default_code_expiry_secs: section.default_code_expiry,
            default_token_expiry_secs: section.default_token_expiry,
            issue_refresh_tokens: section.issue_refresh_tokens,
            require_pkce: section.require_pkce,
        }
    }
}

/// `secrets: [{provider: process|dotenv|inline, ...}]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SecretProviderConfig {
    Process {
        #[serde(default = "default_process_provider_name")]
        name: String,
        #[serde(default)]
        allowlist: Option<Vec<String>>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        blocklist: Vec<String>,
    },
    Dotenv {
        #[serde(default = "default_dotenv_provider_name")]
        name: String,
        path: String,
    },
    Inline {
        #[serde(default = "default_inline_provider_name")]
        name: String,
        #[serde(default)]
        values: HashMap<String, String>,
    },
}

fn default_process_provider_name() -> String {
    "process".to_string()
}
fn default_dotenv_provider_name() -> String {
    "dotenv".to_string()
}
fn default_inline_provider_name() -> String {
    "inline".to_string()
}

impl SecretProviderConfig {
    fn build(&self) -> std::sync::Arc<dyn SecretProvider> {
        match self {
            Self::Process {
                name,
                allowlist,
                prefix,
                blocklist,
            } => {
                let mut provider = ProcessEnvProvider::new(name.clone());
                if let Some(allowlist) = allowlist {
                    provider = provider.with_allowlist(allowlist.clone());
                }
                if let Some(prefix) = prefix {
                    provider = provider.with_prefix(prefix.clone());
                }
                if !blocklist.is_empty() {
                    provider = provider.with_blocklist(blocklist.clone());
                }
                std::sync::Arc::new(provider)
            }
            Self::Dotenv { name, path } => std::sync::Arc::new(DotEnvProvider::new(name.clone(), path.clone())),
            Self::Inline { name, values } => std::sync::Arc::new(InlineProvider::new(name.clone(), values.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawFunnelConfig {
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default)]
    hide_tools: Vec<String>,
    #[serde(default)]
    expose_tools: Vec<String>,
    #[serde(default)]
    expose_core_tools: Vec<String>,
    #[serde(default)]
    inbound_auth: InboundAuthConfig,
    #[serde(default)]
    oauth: Option<OAuthConfigSection>,
    #[serde(default)]
    secrets: Vec<SecretProviderConfig>,
}

/// The fully parsed config file.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    pub servers: Vec<ServerEntry>,
    pub hide_tools: Vec<String>,
    pub expose_tools: Vec<String>,
    pub expose_core_tools: Vec<String>,
    pub inbound_auth: InboundAuthConfig,
    pub oauth: Option<OAuthConfigSection>,
    pub secrets: Vec<SecretProviderConfig>,
    /// Config order is significant for wildcard precedence (§4.12), so
    /// this stays a `Vec` rather than a `HashMap`.
    pub overrides: Vec<(String, ToolOverride)>,
}

impl FunnelConfig {
    /// Reads and parses a config file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Configuration`] if the file cannot be read or
    /// does not parse as JSON matching the expected shape.
    pub async fn load(path: &Path) -> ProxyResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .config_context(path.display().to_string())?;
        Self::parse(&contents)
    }

    /// Parses config from an already-read JSON string. Split out from
    /// [`Self::load`] so tests can exercise parsing without touching the
    /// filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Configuration`] if `contents` is not valid
    /// JSON or does not match the expected shape.
    pub fn parse(contents: &str) -> ProxyResult<Self> {
        let value: Value = serde_json::from_str(contents).config_context("<config root>")?;
        let raw: RawFunnelConfig = serde_json::from_value(value.clone()).config_context("<config root>")?;

        let overrides = match value.get("overrides") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, raw_override)| {
                    let override_: ToolOverride =
                        serde_json::from_value(raw_override.clone()).config_context(format!("overrides.{key}"))?;
                    Ok((key.clone(), override_))
                })
                .collect::<ProxyResult<Vec<_>>>()?,
            Some(_) => {
                return Err(ProxyError::configuration_with_key(
                    "'overrides' must be a JSON object",
                    "overrides",
                ))
            }
            None => Vec::new(),
        };

        Ok(Self {
            servers: raw.servers,
            hide_tools: raw.hide_tools,
            expose_tools: raw.expose_tools,
            expose_core_tools: raw.expose_core_tools,
            inbound_auth: raw.inbound_auth,
            oauth: raw.oauth,
            secrets: raw.secrets,
            overrides,
        })
    }

    /// Builds a `SecretManager` from the configured `secrets` list, in
    /// config order (later providers override earlier ones per
    /// `SecretManager::resolve_secrets`).
    pub fn build_secret_manager(&self) -> SecretManager {
        let mut manager = SecretManager::new();
        for provider_config in &self.secrets {
            manager.add_provider(provider_config.build());
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{"servers": [{"name": "github", "transport": "stdio", "command": "github-mcp"}]}"#;
        let config = FunnelConfig::parse(json).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "github");
        assert_eq!(config.servers[0].transport_config()["command"], "github-mcp");
    }

    #[test]
    fn preserves_override_config_order() {
        let json = r#"{
            "overrides": {
                "github__*": {"description": "first"},
                "github__create_issue": {"description": "second"}
            }
        }"#;
        let config = FunnelConfig::parse(json).unwrap();
        assert_eq!(config.overrides.len(), 2);
        assert_eq!(config.overrides[0].0, "github__*");
        assert_eq!(config.overrides[1].0, "github__create_issue");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = FunnelConfig::parse("not json").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration { .. }));
    }

    #[test]
    fn secret_provider_precedence_resolves_last_wins() {
        std::env::set_var("FUNNEL_CONFIG_TEST_KEY", "from-process");
        let json = r#"{
            "secrets": [
                {"provider": "process", "name": "process", "allowlist": ["FUNNEL_CONFIG_TEST_KEY"]},
                {"provider": "inline", "name": "inline", "values": {"FUNNEL_CONFIG_TEST_KEY": "from-inline"}}
            ]
        }"#;
        let config = FunnelConfig::parse(json).unwrap();
        let manager = config.build_secret_manager();
        let resolved = tokio_test::block_on(manager.resolve_secrets());
        assert_eq!(resolved.get("FUNNEL_CONFIG_TEST_KEY").unwrap(), "from-inline");
        std::env::remove_var("FUNNEL_CONFIG_TEST_KEY");
    }

    #[test]
    fn oauth_section_converts_to_provider_config() {
        let json = r#"{
            "oauth": {"issuer": "https://auth.example", "baseUrl": "https://auth.example", "requirePkce": true}
        }"#;
        let config = FunnelConfig::parse(json).unwrap();
        let section = config.oauth.expect("oauth section present");
        let provider_config: OAuthProviderConfig = (&section).into();
        assert!(provider_config.require_pkce);
        assert_eq!(provider_config.default_code_expiry_secs, 60);
    }
}
