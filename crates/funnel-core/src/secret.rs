//! Layered secret resolution: an ordered list of providers merged with
//! later providers overriding earlier ones.
//!
//! Provider failures are isolated — a failing provider contributes nothing
//! and logs a warning, it never aborts resolution for the providers around
//! it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// A named source of secrets.
#[async_trait]
pub trait SecretProvider: Send + Sync + std::fmt::Debug {
    /// The provider's name, used for `addProvider`/`removeProvider` lookups
    /// and deduplication against a registry.
    fn name(&self) -> &str;

    /// Resolves this provider's secrets. Implementations should not panic;
    /// any internal failure should be represented as `Ok` with a partial (or
    /// empty) map plus a `tracing::warn!`, since `SecretManager` treats a
    /// provider `Err` the same way (logged and dropped).
    async fn resolve_secrets(&self) -> HashMap<String, String>;
}

/// Filters process-environment variables by allowlist, prefix, or blocklist.
///
/// Precedence when more than one filter is set: allowlist beats prefix
/// (prefix stripping only applies to keys selected by the prefix filter),
/// blocklist is applied last and can remove anything the other two admitted.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvProvider {
    name: String,
    allowlist: Option<Vec<String>>,
    prefix: Option<String>,
    blocklist: Vec<String>,
}

impl ProcessEnvProvider {
    /// Creates a provider that exposes the entire process environment,
    /// minus anything later added to the blocklist.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Restricts exposed keys to exactly this list.
    pub fn with_allowlist(mut self, keys: Vec<String>) -> Self {
        self.allowlist = Some(keys);
        self
    }

    /// Restricts exposed keys to those starting with `prefix`, stripping the
    /// prefix from the resulting key name.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Removes these keys (post-allowlist/prefix) unconditionally.
    pub fn with_blocklist(mut self, keys: Vec<String>) -> Self {
        self.blocklist = keys;
        self
    }
}

#[async_trait]
impl SecretProvider for ProcessEnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_secrets(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for (key, value) in std::env::vars() {
            if let Some(allow) = &self.allowlist {
                if allow.iter().any(|k| k == &key) {
                    out.insert(key, value);
                }
                continue;
            }
            if let Some(prefix) = &self.prefix {
                if let Some(stripped) = key.strip_prefix(prefix.as_str()) {
                    out.insert(stripped.to_string(), value);
                }
                continue;
            }
            out.insert(key, value);
        }
        for blocked in &self.blocklist {
            out.remove(blocked);
        }
        out
    }
}

/// Parses a `.env`-style file: `export` prefix, quoted values (including
/// embedded newlines), and `$VAR` / `${VAR}` interpolation against
/// already-parsed keys in the same file.
#[derive(Debug, Clone)]
pub struct DotEnvProvider {
    name: String,
    path: std::path::PathBuf,
}

impl DotEnvProvider {
    /// Creates a provider reading from `path` at resolution time.
    pub fn new(name: impl Into<String>, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    fn parse(contents: &str) -> HashMap<String, String> {
        let mut out: HashMap<String, String> = HashMap::new();
        let mut lines = contents.lines().peekable();
        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let Some((key, rest)) = trimmed.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let mut value = rest.trim().to_string();

            if let Some(quote) = value.chars().next().filter(|c| *c == '"' || *c == '\'') {
                // Collect lines until the closing quote is found, preserving
                // embedded newlines.
                let mut buf = value[1..].to_string();
                while !buf.ends_with(quote) {
                    match lines.next() {
                        Some(next) => {
                            buf.push('\n');
                            buf.push_str(next);
                        }
                        None => break,
                    }
                }
                if buf.ends_with(quote) {
                    buf.pop();
                }
                value = buf;
            }

            let resolved = interpolate(&value, &out);
            out.insert(key.to_string(), resolved);
        }
        out
    }
}

fn interpolate(value: &str, known: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let rest = &value[i + 1..];
        if let Some(stripped) = rest.strip_prefix('{') {
            if let Some(end) = stripped.find('}') {
                let name = &stripped[..end];
                out.push_str(known.get(name).map(String::as_str).unwrap_or(""));
                for _ in 0..=end + 1 {
                    chars.next();
                }
                continue;
            }
        }
        let ident_len = rest
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
            .count();
        if ident_len > 0 {
            let name = &rest[..ident_len];
            out.push_str(known.get(name).map(String::as_str).unwrap_or(""));
            for _ in 0..ident_len {
                chars.next();
            }
        } else {
            out.push('$');
        }
    }
    out
}

#[async_trait]
impl SecretProvider for DotEnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_secrets(&self) -> HashMap<String, String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Self::parse(&contents),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "dotenv provider failed to read file");
                HashMap::new()
            }
        }
    }
}

/// A literal, config-supplied mapping.
#[derive(Debug, Clone)]
pub struct InlineProvider {
    name: String,
    values: HashMap<String, String>,
}

impl InlineProvider {
    /// Wraps a literal map as a provider.
    pub fn new(name: impl Into<String>, values: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[async_trait]
impl SecretProvider for InlineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_secrets(&self) -> HashMap<String, String> {
        self.values.clone()
    }
}

struct CachedSnapshot {
    values: HashMap<String, String>,
    expires_at: Instant,
}

/// Composes an ordered list of [`SecretProvider`]s, merging their output so
/// later providers override earlier ones on key collision.
#[derive(Default)]
pub struct SecretManager {
    providers: Vec<Arc<dyn SecretProvider>>,
    ttl: Option<Duration>,
    cache: RwLock<Option<CachedSnapshot>>,
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SecretManager {
    /// Creates an empty manager with no TTL cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a TTL cache: `resolveSecrets` returns the cached snapshot
    /// until it expires.
    pub fn with_ttl_cache(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Appends a provider. If a provider with the same name is already
    /// registered, it is counted once — the existing entry wins and the
    /// new one is not added again.
    pub fn add_provider(&mut self, provider: Arc<dyn SecretProvider>) {
        if self.providers.iter().any(|p| p.name() == provider.name()) {
            return;
        }
        self.providers.push(provider);
    }

    /// Removes the provider with the given name, if present.
    pub fn remove_provider(&mut self, name: &str) {
        self.providers.retain(|p| p.name() != name);
    }

    /// Drops any cached snapshot, forcing the next `resolve_secrets` call to
    /// re-query every provider.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    /// Resolves all providers in order and merges the results, later
    /// providers overriding earlier ones. Individual provider failures never
    /// propagate — see [`SecretProvider::resolve_secrets`].
    pub async fn resolve_secrets(&self) -> HashMap<String, String> {
        if let Some(snapshot) = self.cached_if_fresh().await {
            return snapshot;
        }

        let mut merged = HashMap::new();
        for provider in &self.providers {
            let contribution = provider.resolve_secrets().await;
            merged.extend(contribution);
        }

        if let Some(ttl) = self.ttl {
            let mut cache = self.cache.write().await;
            *cache = Some(CachedSnapshot {
                values: merged.clone(),
                expires_at: Instant::now() + ttl,
            });
        }

        merged
    }

    async fn cached_if_fresh(&self) -> Option<HashMap<String, String>> {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(snapshot) if Instant::now() < snapshot.expires_at => {
                Some(snapshot.values.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn later_providers_override_earlier_ones() {
        let mut env_values = HashMap::new();
        env_values.insert("API_KEY".to_string(), "from-env".to_string());
        let mut file_values = HashMap::new();
        file_values.insert("API_KEY".to_string(), "from-file".to_string());
        let mut inline_values = HashMap::new();
        inline_values.insert("API_KEY".to_string(), "from-inline".to_string());

        let mut manager = SecretManager::new();
        manager.add_provider(Arc::new(InlineProvider::new("process", env_values)));
        manager.add_provider(Arc::new(InlineProvider::new("dotenv", file_values)));
        manager.add_provider(Arc::new(InlineProvider::new("inline", inline_values)));

        let resolved = manager.resolve_secrets().await;
        assert_eq!(resolved.get("API_KEY").unwrap(), "from-inline");
    }

    #[tokio::test]
    async fn duplicate_provider_name_counted_once() {
        let mut manager = SecretManager::new();
        let provider = Arc::new(InlineProvider::new("dup", HashMap::new()));
        manager.add_provider(provider.clone());
        manager.add_provider(provider);
        assert_eq!(manager.providers.len(), 1);
    }

    #[test]
    fn dotenv_parses_quotes_and_interpolation() {
        let contents = "export FOO=\"bar\"\nBAZ=${FOO}-suffix\nMULTI=\"line one\nline two\"\n";
        let parsed = DotEnvProvider::parse(contents);
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
        assert_eq!(parsed.get("BAZ").unwrap(), "bar-suffix");
        assert_eq!(parsed.get("MULTI").unwrap(), "line one\nline two");
    }

    #[tokio::test]
    async fn ttl_cache_serves_stale_snapshot_until_expiry() {
        let mut manager = SecretManager::new().with_ttl_cache(Duration::from_secs(60));
        let mut values = HashMap::new();
        values.insert("K".to_string(), "v1".to_string());
        manager.add_provider(Arc::new(InlineProvider::new("p", values)));

        let first = manager.resolve_secrets().await;
        assert_eq!(first.get("K").unwrap(), "v1");

        manager.remove_provider("p");
        let mut values2 = HashMap::new();
        values2.insert("K".to_string(), "v2".to_string());
        manager.add_provider(Arc::new(InlineProvider::new("p2", values2)));

        // Still cached: stale value served.
        let second = manager.resolve_secrets().await;
        assert_eq!(second.get("K").unwrap(), "v1");

        manager.clear_cache().await;
        let third = manager.resolve_secrets().await;
        assert_eq!(third.get("K").unwrap(), "v2");
    }
}
