//! The aggregating proxy kernel (§4.14): owns one `Transport` per
//! upstream server, maintains the merged tool registry, and routes
//! inbound JSON-RPC calls to the server that owns each tool.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};

use funnel_transport::{AuthHeaderProvider, Transport, TransportFactory};

use crate::config::FunnelConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::overrides::ToolOverrideManager;

const TOOL_NAME_DELIMITER: &str = "__";
const TOOLS_LIST_CHANGED_METHOD: &str = "notifications/tools/list_changed";

/// One tool known to the registry: its upstream identity, its raw
/// definition (as returned by the owning server's `tools/list`), and
/// whether it is currently enabled.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub original_name: String,
    pub server: String,
    pub definition: Value,
    pub enabled: bool,
}

/// Merges upstream `tools/list` results behind `<server>__<tool>` full
/// names.
#[derive(Default)]
pub struct ToolRegistry {
    entries: DashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace_server_tools(&self, server: &str, tools: Vec<Value>) {
        self.entries.retain(|_, entry| entry.server != server);
        for tool in tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                warn!(server, "upstream tool definition missing 'name', skipping");
                continue;
            };
            let full_name = format!("{server}{TOOL_NAME_DELIMITER}{name}");
            self.entries.insert(
                full_name,
                ToolEntry {
                    original_name: name.to_string(),
                    server: server.to_string(),
                    definition: tool,
                    enabled: true,
                },
            );
        }
    }

    pub fn get(&self, full_name: &str) -> Option<ToolEntry> {
        self.entries.get(full_name).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<(String, ToolEntry)> {
        self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Splits a full tool name at the first `__` delimiter into
/// `(server, original_name)`.
fn split_full_name(full_name: &str) -> Option<(&str, &str)> {
    full_name.split_once(TOOL_NAME_DELIMITER)
}

/// Compiles a glob pattern (`*` meaning "anything") to an anchored regex,
/// escaping every other regex metacharacter. Shares the same approach as
/// `overrides::compile_wildcard` but lives here since tool-visibility
/// globbing is a kernel concern, not an override-manager one.
fn compile_glob(pattern: &str) -> Regex {
    let escaped_segments: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let anchored = format!("^{}$", escaped_segments.join(".*"));
    Regex::new(&anchored).expect("escaped glob pattern is always valid")
}

fn matches_any(globs: &[Regex], name: &str) -> bool {
    globs.iter().any(|g| g.is_match(name))
}

/// Compiled `exposeTools`/`hideTools`/`exposeCoreTools` filters (§6, §4.14).
///
/// This proxy implements no built-in "core" tools of its own — every tool
/// in the registry comes from an upstream server — so `exposeCoreTools` is
/// accepted and compiled for config-shape compatibility but currently has
/// no entries to match against.
pub struct ToolFilter {
    expose: Vec<Regex>,
    hide: Vec<Regex>,
    #[allow(dead_code)]
    expose_core: Vec<Regex>,
}

impl ToolFilter {
    pub fn new(expose_tools: &[String], hide_tools: &[String], expose_core_tools: &[String]) -> Self {
        Self {
            expose: expose_tools.iter().map(|p| compile_glob(p)).collect(),
            hide: hide_tools.iter().map(|p| compile_glob(p)).collect(),
            expose_core: expose_core_tools.iter().map(|p| compile_glob(p)).collect(),
        }
    }

    /// Whether `full_name` should be visible on an outbound `tools/list`.
    /// An empty `exposeTools` list means "expose everything not hidden";
    /// hiding always wins over exposing.
    pub fn is_visible(&self, full_name: &str) -> bool {
        if matches_any(&self.hide, full_name) {
            return false;
        }
        self.expose.is_empty() || matches_any(&self.expose, full_name)
    }
}

/// Owns every upstream transport, the merged tool registry, and the
/// override manager; routes inbound `tools/list`/`tools/call` against
/// them.
pub struct ProxyKernel {
    transports: HashMap<String, Arc<dyn Transport>>,
    registry: ToolRegistry,
    overrides: ToolOverrideManager,
    filter: ToolFilter,
}

impl ProxyKernel {
    /// Builds transports for every configured server via `factory`, but
    /// does not start them yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Configuration`] if a server's transport
    /// config fails to parse or build.
    pub fn build(
        config: &FunnelConfig,
        factory: &TransportFactory,
        auth: Option<Arc<dyn AuthHeaderProvider>>,
    ) -> ProxyResult<Self> {
        let mut transports = HashMap::with_capacity(config.servers.len());
        for server in &config.servers {
            let transport = factory
                .create(&server.transport_config(), auth.clone())
                .map_err(|err| ProxyError::configuration_with_key(err.to_string(), format!("servers.{}", server.name)))?;
            transports.insert(server.name.clone(), transport);
        }

        Ok(Self::from_transports(transports, config))
    }

    /// Builds a kernel directly from already-constructed transports,
    /// bypassing `TransportFactory`. Used by integration tests that
    /// substitute fake transports for real upstream servers.
    pub fn from_transports(transports: HashMap<String, Arc<dyn Transport>>, config: &FunnelConfig) -> Self {
        let overrides = ToolOverrideManager::new(config.overrides.clone());
        let filter = ToolFilter::new(&config.expose_tools, &config.hide_tools, &config.expose_core_tools);
        Self {
            transports,
            registry: ToolRegistry::new(),
            overrides,
            filter,
        }
    }

    /// Starts every upstream transport, populates the tool registry from
    /// each server's `tools/list`, and spawns a background listener per
    /// server that re-refreshes on `notifications/tools/list_changed`.
    ///
    /// # Errors
    ///
    /// Returns the first transport's startup error encountered. Servers
    /// are started sequentially so a single bad config produces an
    /// unambiguous error; once running, refresh fan-out is independent
    /// per transport.
    pub async fn start(self: &Arc<Self>) -> ProxyResult<()> {
        for (name, transport) in &self.transports {
            transport.start().await.map_err(|err| {
                ProxyError::configuration_with_key(err.to_string(), format!("servers.{name}"))
            })?;
            self.refresh_server(name).await?;
            self.spawn_refresh_listener(name.clone());
        }
        Ok(())
    }

    fn spawn_refresh_listener(self: &Arc<Self>, server: String) {
        let Some(transport) = self.transports.get(&server).cloned() else {
            return;
        };
        let kernel = Arc::clone(self);
        let mut events = transport.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let funnel_transport::TransportEvent::Notification(method, _) = event {
                    if method == TOOLS_LIST_CHANGED_METHOD {
                        if let Err(err) = kernel.refresh_server(&server).await {
                            error!(server, error = %err, "failed to refresh tools after list_changed");
                        }
                    }
                }
            }
        });
    }

    /// Re-fetches `tools/list` from one server and replaces its entries in
    /// the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownServer`] if `server` isn't configured,
    /// or the transport error from `tools/list` otherwise.
    pub async fn refresh_server(&self, server: &str) -> ProxyResult<()> {
        let transport = self
            .transports
            .get(server)
            .ok_or_else(|| ProxyError::UnknownServer(server.to_string()))?;
        let result = transport.send_request("tools/list".to_string(), None).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(server, count = tools.len(), "refreshed tool list");
        self.registry.replace_server_tools(server, tools);
        Ok(())
    }

    /// Builds the outbound `tools/list` response: filtered by
    /// `exposeTools`/`hideTools`, with overrides applied.
    pub fn list_tools(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.registry.len());
        for (full_name, entry) in self.registry.all() {
            if !entry.enabled || !self.filter.is_visible(&full_name) {
                continue;
            }
            let mut definition = entry.definition.clone();
            if let Value::Object(map) = &mut definition {
                map.insert("name".to_string(), Value::String(full_name.clone()));
            }
            self.overrides.apply(&full_name, &entry.original_name, &mut definition);
            out.push(definition);
        }
        out
    }

    /// Routes an inbound `tools/call` to the owning upstream server.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownTool`] if `full_name` has no `__`
    /// delimiter, names a server/tool this kernel hasn't registered, or
    /// names a disabled tool hidden by `hideTools`.
    pub async fn call_tool(&self, full_name: &str, arguments: Option<Value>) -> ProxyResult<Value> {
        if !self.filter.is_visible(full_name) {
            return Err(ProxyError::UnknownTool(full_name.to_string()));
        }
        let entry = self
            .registry
            .get(full_name)
            .filter(|e| e.enabled)
            .ok_or_else(|| ProxyError::UnknownTool(full_name.to_string()))?;
        let Some((server, _)) = split_full_name(full_name) else {
            return Err(ProxyError::UnknownTool(full_name.to_string()));
        };
        let transport = self
            .transports
            .get(server)
            .ok_or_else(|| ProxyError::UnknownServer(server.to_string()))?;

        let params = serde_json::json!({ "name": entry.original_name, "arguments": arguments });
        let result = transport.send_request("tools/call".to_string(), Some(params)).await?;
        Ok(result)
    }

    /// Closes every upstream transport. Idempotent per transport.
    pub async fn shutdown(&self) {
        for (name, transport) in &self.transports {
            debug!(server = name, "closing upstream transport");
            transport.close().await;
        }
    }

    pub fn server_count(&self) -> usize {
        self.transports.len()
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_full_name_splits_on_first_delimiter() {
        assert_eq!(split_full_name("github__create_issue"), Some(("github", "create_issue")));
        assert_eq!(split_full_name("no-delimiter"), None);
    }

    #[test]
    fn split_full_name_only_splits_first_occurrence() {
        assert_eq!(
            split_full_name("github__create__issue"),
            Some(("github", "create__issue"))
        );
    }

    #[test]
    fn filter_hide_beats_expose_on_conflict() {
        let filter = ToolFilter::new(
            &["github__*".to_string()],
            &["github__dangerous_tool".to_string()],
            &[],
        );
        assert!(filter.is_visible("github__create_issue"));
        assert!(!filter.is_visible("github__dangerous_tool"));
    }

    #[test]
    fn filter_empty_expose_list_exposes_everything_not_hidden() {
        let filter = ToolFilter::new(&[], &["github__secret_tool".to_string()], &[]);
        assert!(filter.is_visible("github__create_issue"));
        assert!(!filter.is_visible("github__secret_tool"));
    }

    #[test]
    fn filter_nonempty_expose_list_is_allow_list() {
        let filter = ToolFilter::new(&["github__create_*".to_string()], &[], &[]);
        assert!(filter.is_visible("github__create_issue"));
        assert!(!filter.is_visible("github__delete_issue"));
    }

    #[test]
    fn registry_replace_server_tools_drops_stale_entries() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("github", vec![serde_json::json!({"name": "create_issue"})]);
        assert_eq!(registry.len(), 1);
        registry.replace_server_tools("github", vec![serde_json::json!({"name": "list_issues"})]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("github__list_issues").is_some());
        assert!(registry.get("github__create_issue").is_none());
    }

    #[test]
    fn registry_skips_tool_definitions_missing_name() {
        let registry = ToolRegistry::new();
        registry.replace_server_tools("github", vec![serde_json::json!({"description": "no name"})]);
        assert!(registry.is_empty());
    }
}
