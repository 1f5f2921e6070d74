//! Resolution of `${NAME}` / `${NAME:default}` patterns with cycle and depth
//! protection.
//!
//! The grammar intentionally matches the subset of shell-style parameter
//! expansion used by process-manager configs: `NAME` is
//! `[A-Z_][A-Z0-9_]*`, matched case-insensitively but always looked up in
//! its canonical uppercase form.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CoreError, CoreResult};

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}")
            .expect("static pattern is valid")
    })
}

/// Whether resolution should fail on unset variables with no default
/// (`Strict`, the default) or leave the pattern untouched (`Lenient`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Missing variables with no default raise [`CoreError::MissingVariable`].
    #[default]
    Strict,
    /// Missing variables with no default are left as the literal pattern.
    Lenient,
}

/// Resolves `${VAR[:default]}` patterns against a source of variable values.
#[derive(Debug, Clone)]
pub struct EnvResolver {
    max_depth: usize,
    mode: ResolveMode,
}

impl Default for EnvResolver {
    fn default() -> Self {
        Self {
            max_depth: 10,
            mode: ResolveMode::Strict,
        }
    }
}

impl EnvResolver {
    /// Creates a resolver with the default depth (10) and strict mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the maximum expansion depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Overrides strict/lenient resolution.
    pub fn with_mode(mut self, mode: ResolveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fast pre-check for whether `s` contains any `${...}` pattern at all.
    pub fn contains_pattern(s: &str) -> bool {
        s.contains("${")
    }

    /// Resolves every `${VAR[:default]}` occurrence in `s` against `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPattern`], [`CoreError::CircularReference`],
    /// [`CoreError::MaxDepthExceeded`], or (in strict mode)
    /// [`CoreError::MissingVariable`].
    pub fn resolve(&self, s: &str, vars: &HashMap<String, String>) -> CoreResult<String> {
        let mut visited = HashSet::new();
        self.resolve_inner(s, vars, &mut visited, 0)
    }

    fn resolve_inner(
        &self,
        s: &str,
        vars: &HashMap<String, String>,
        visited: &mut HashSet<String>,
        depth: usize,
    ) -> CoreResult<String> {
        if depth > self.max_depth {
            return Err(CoreError::MaxDepthExceeded);
        }
        if !Self::contains_pattern(s) {
            return Ok(s.to_string());
        }

        // Anything that looks like `${...}` but doesn't match the grammar is
        // rejected rather than passed through, per the grammar contract.
        reject_malformed(s)?;

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in pattern().captures_iter(s) {
            let whole = caps.get(0).expect("group 0 always present");
            out.push_str(&s[last..whole.start()]);
            last = whole.end();

            let name = caps.get(1).expect("name group required").as_str();
            let canonical = name.to_uppercase();
            let default = caps.get(2).map(|m| m.as_str());

            if visited.contains(&canonical) {
                return Err(CoreError::CircularReference(canonical));
            }

            let raw = match vars.get(&canonical) {
                Some(v) => v.clone(),
                None => match default {
                    Some(d) => d.to_string(),
                    None => match self.mode {
                        ResolveMode::Strict => return Err(CoreError::MissingVariable(canonical)),
                        ResolveMode::Lenient => {
                            out.push_str(whole.as_str());
                            continue;
                        }
                    },
                },
            };

            visited.insert(canonical.clone());
            let resolved = self.resolve_inner(&raw, vars, visited, depth + 1)?;
            visited.remove(&canonical);
            out.push_str(&resolved);
        }
        out.push_str(&s[last..]);
        Ok(out)
    }
}

/// Rejects any `${...}` span whose inner name does not match the grammar.
fn reject_malformed(s: &str) -> CoreResult<()> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while let Some(start) = s[i..].find("${") {
        let abs_start = i + start;
        let Some(end_rel) = s[abs_start..].find('}') else {
            return Err(CoreError::InvalidPattern(s[abs_start..].to_string()));
        };
        let end = abs_start + end_rel;
        let inner = &s[abs_start + 2..end];
        let name = inner.split(':').next().unwrap_or("");
        if name.is_empty() || !valid_name(name) {
            return Err(CoreError::InvalidPattern(s[abs_start..=end].to_string()));
        }
        i = end + 1;
        if i >= bytes.len() {
            break;
        }
    }
    Ok(())
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
