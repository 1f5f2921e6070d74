//! Tool definition overrides (§4.12): wildcard key matching, schema merge
//! strategies, and a cache keyed by the tool's identity and a description
//! prefix so unrelated fields changing upstream doesn't invalidate it.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

const DEEP_MERGE_DEPTH_GUARD: usize = 1;
const CACHE_KEY_DESCRIPTION_PREFIX: usize = 50;

/// How an override's `inputSchema` combines with the tool's original one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaMergeStrategy {
    /// The override's schema entirely replaces the original.
    Replace,
    /// Shallow spread: override's top-level `properties` entries win on
    /// collision, everything else from the original survives.
    #[default]
    Merge,
    /// Like `Merge`, but when both sides have an object-typed property with
    /// the same name, that property's own fields are merged one level deep
    /// rather than the override simply replacing it wholesale.
    DeepMerge,
}

/// A single named-property post-processing override, applied after the
/// schema merge without touching any other property.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PropertyOverride {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
}

/// One entry in the `overrides` config map.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Shallow-merged onto the tool's `_meta.annotations`.
    #[serde(default)]
    pub annotations: Option<Value>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub input_schema_strategy: SchemaMergeStrategy,
    #[serde(default)]
    pub property_overrides: std::collections::HashMap<String, PropertyOverride>,
}

struct CompiledOverride {
    key: String,
    pattern: Option<Regex>,
    override_: ToolOverride,
}

/// Compiles wildcard override keys into anchored regexes and applies the
/// highest-precedence match to a tool definition.
pub struct ToolOverrideManager {
    entries: Vec<CompiledOverride>,
    cache: DashMap<String, Arc<Value>>,
}

impl ToolOverrideManager {
    /// Builds a manager from the config-order list of `(key, override)`
    /// pairs. Keys containing `*` are compiled to an anchored regex with
    /// every other regex metacharacter escaped; keys with no `*` are
    /// matched by exact string equality.
    pub fn new(overrides: Vec<(String, ToolOverride)>) -> Self {
        let entries = overrides
            .into_iter()
            .map(|(key, override_)| {
                let pattern = if key.contains('*') {
                    Some(compile_wildcard(&key))
                } else {
                    None
                };
                CompiledOverride {
                    key,
                    pattern,
                    override_,
                }
            })
            .collect();
        Self {
            entries,
            cache: DashMap::new(),
        }
    }

    /// Applies the highest-precedence matching override to `tool_def`
    /// in place. `full_tool_name` is the `<server>__<tool>` form used for
    /// matching; `tool_name` is the bare upstream name used in the cache
    /// key alongside it.
    pub fn apply(&self, full_tool_name: &str, tool_name: &str, tool_def: &mut Value) {
        let Some(matched) = self.find_match(full_tool_name) else {
            return;
        };

        let description_prefix: String = tool_def
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .chars()
            .take(CACHE_KEY_DESCRIPTION_PREFIX)
            .collect();
        let cache_key = format!("{full_tool_name}::{tool_name}::{description_prefix}");

        if let Some(cached) = self.cache.get(&cache_key) {
            *tool_def = (**cached).clone();
            return;
        }

        apply_override(tool_def, matched);
        self.cache.insert(cache_key, Arc::new(tool_def.clone()));
    }

    /// Drops every cached merge result, forcing the next `apply` call for
    /// each tool to recompute.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Exact matches win over wildcard matches; among wildcards, the first
    /// one in config order that matches wins.
    fn find_match(&self, full_tool_name: &str) -> Option<&ToolOverride> {
        if let Some(exact) = self
            .entries
            .iter()
            .find(|e| e.pattern.is_none() && e.key == full_tool_name)
        {
            return Some(&exact.override_);
        }
        self.entries
            .iter()
            .find(|e| e.pattern.as_ref().is_some_and(|re| re.is_match(full_tool_name)))
            .map(|e| &e.override_)
    }
}

fn compile_wildcard(key: &str) -> Regex {
    let escaped_segments: Vec<String> = key.split('*').map(regex::escape).collect();
    let pattern = format!("^{}$", escaped_segments.join(".*"));
    Regex::new(&pattern).expect("escaped wildcard pattern is always valid")
}

fn apply_override(tool_def: &mut Value, override_: &ToolOverride) {
    let Some(obj) = tool_def.as_object_mut() else {
        return;
    };

    if let Some(name) = &override_.name {
        obj.insert("name".to_string(), Value::String(name.clone()));
    }
    if let Some(title) = &override_.title {
        obj.insert("title".to_string(), Value::String(title.clone()));
    }
    if let Some(description) = &override_.description {
        obj.insert("description".to_string(), Value::String(description.clone()));
    }
    if let Some(annotations) = &override_.annotations {
        merge_annotations(obj, annotations);
    }
    if let Some(schema_override) = &override_.input_schema {
        let existing = obj.remove("inputSchema").unwrap_or(Value::Object(Default::default()));
        let merged = merge_schema(existing, schema_override.clone(), override_.input_schema_strategy);
        obj.insert("inputSchema".to_string(), merged);
    }
    if !override_.property_overrides.is_empty() {
        apply_property_overrides(obj, &override_.property_overrides);
    }
}

fn merge_annotations(obj: &mut serde_json::Map<String, Value>, annotations: &Value) {
    let meta = obj
        .entry("_meta".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(meta_obj) = meta.as_object_mut() else {
        return;
    };
    let existing = meta_obj
        .entry("annotations".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let (Some(existing_obj), Some(new_obj)) = (existing.as_object_mut(), annotations.as_object()) {
        for (k, v) in new_obj {
            existing_obj.insert(k.clone(), v.clone());
        }
    } else {
        *existing = annotations.clone();
    }
}

fn merge_schema(base: Value, incoming: Value, strategy: SchemaMergeStrategy) -> Value {
    match strategy {
        SchemaMergeStrategy::Replace => incoming,
        SchemaMergeStrategy::Merge => shallow_merge_properties(base, incoming),
        SchemaMergeStrategy::DeepMerge => deep_merge_properties(base, incoming, DEEP_MERGE_DEPTH_GUARD),
    }
}

fn shallow_merge_properties(base: Value, incoming: Value) -> Value {
    let Value::Object(mut base_obj) = base else {
        return incoming;
    };
    let Value::Object(incoming_obj) = incoming else {
        return Value::Object(base_obj);
    };

    let base_props = base_obj
        .entry("properties".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let (Some(base_props), Some(incoming_props)) = (
        base_props.as_object_mut(),
        incoming_obj.get("properties").and_then(Value::as_object),
    ) {
        for (name, schema) in incoming_props {
            base_props.insert(name.clone(), schema.clone());
        }
    }
    for (key, value) in incoming_obj {
        if key != "properties" {
            base_obj.insert(key, value);
        }
    }
    Value::Object(base_obj)
}

/// One-level-deep merge: when a property exists as an object on both
/// sides, its own fields are merged instead of replaced wholesale.
/// `depth_remaining` guards against unexpectedly deep structures; once
/// exhausted the remaining levels fall back to a plain replace.
fn deep_merge_properties(base: Value, incoming: Value, depth_remaining: usize) -> Value {
    let Value::Object(mut base_obj) = base else {
        return incoming;
    };
    let Value::Object(incoming_obj) = incoming else {
        return Value::Object(base_obj);
    };

    let base_props = base_obj
        .entry("properties".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let (Some(base_props), Some(incoming_props)) = (
        base_props.as_object_mut(),
        incoming_obj.get("properties").and_then(Value::as_object),
    ) {
        for (name, incoming_schema) in incoming_props {
            match base_props.get(name) {
                Some(existing) if existing.is_object() && incoming_schema.is_object() && depth_remaining > 0 => {
                    let merged = merge_object_one_level(existing.clone(), incoming_schema.clone());
                    base_props.insert(name.clone(), merged);
                }
                _ => {
                    base_props.insert(name.clone(), incoming_schema.clone());
                }
            }
        }
    }
    for (key, value) in incoming_obj {
        if key != "properties" {
            base_obj.insert(key, value);
        }
    }
    Value::Object(base_obj)
}

/// Callers only reach this with two object values already confirmed.
fn merge_object_one_level(base: Value, incoming: Value) -> Value {
    let (Value::Object(mut base_obj), Value::Object(incoming_obj)) = (base, incoming) else {
        unreachable!("merge_object_one_level called with non-object arguments");
    };
    for (k, v) in incoming_obj {
        base_obj.insert(k, v);
    }
    Value::Object(base_obj)
}

fn apply_property_overrides(
    obj: &mut serde_json::Map<String, Value>,
    property_overrides: &std::collections::HashMap<String, PropertyOverride>,
) {
    let Some(properties) = obj
        .get_mut("inputSchema")
        .and_then(Value::as_object_mut)
        .and_then(|schema| schema.get_mut("properties"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for (name, prop_override) in property_overrides {
        let Some(prop) = properties.get_mut(name).and_then(Value::as_object_mut) else {
            continue;
        };
        if let Some(description) = &prop_override.description {
            prop.insert("description".to_string(), Value::String(description.clone()));
        }
        if let Some(default) = &prop_override.default {
            prop.insert("default".to_string(), default.clone());
        }
        if let Some(enum_values) = &prop_override.enum_values {
            prop.insert("enum".to_string(), Value::Array(enum_values.clone()));
        }
        if let Some(type_name) = &prop_override.type_name {
            prop.insert("type".to_string(), Value::String(type_name.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Value {
        json!({
            "name": name,
            "description": "original description",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "a path"}
                }
            }
        })
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let overrides = vec![
            (
                "github__*".to_string(),
                ToolOverride {
                    description: Some("wildcard description".to_string()),
                    ..Default::default()
                },
            ),
            (
                "github__create_issue".to_string(),
                ToolOverride {
                    description: Some("exact description".to_string()),
                    ..Default::default()
                },
            ),
        ];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        assert_eq!(def["description"], "exact description");
    }

    #[test]
    fn first_wildcard_in_config_order_wins() {
        let overrides = vec![
            (
                "github__*".to_string(),
                ToolOverride {
                    description: Some("first".to_string()),
                    ..Default::default()
                },
            ),
            (
                "github__create_*".to_string(),
                ToolOverride {
                    description: Some("second".to_string()),
                    ..Default::default()
                },
            ),
        ];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        assert_eq!(def["description"], "first");
    }

    #[test]
    fn no_match_leaves_definition_untouched() {
        let manager = ToolOverrideManager::new(vec![]);
        let mut def = tool("create_issue");
        let before = def.clone();
        manager.apply("github__create_issue", "create_issue", &mut def);
        assert_eq!(def, before);
    }

    #[test]
    fn shallow_merge_adds_new_property_without_losing_existing() {
        let overrides = vec![(
            "github__*".to_string(),
            ToolOverride {
                input_schema: Some(json!({"properties": {"repo": {"type": "string"}}})),
                input_schema_strategy: SchemaMergeStrategy::Merge,
                ..Default::default()
            },
        )];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        let props = &def["inputSchema"]["properties"];
        assert!(props.get("path").is_some());
        assert!(props.get("repo").is_some());
    }

    #[test]
    fn deep_merge_preserves_sibling_fields_on_shared_property() {
        let overrides = vec![(
            "github__*".to_string(),
            ToolOverride {
                input_schema: Some(json!({"properties": {"path": {"default": "."}}})),
                input_schema_strategy: SchemaMergeStrategy::DeepMerge,
                ..Default::default()
            },
        )];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        let path_prop = &def["inputSchema"]["properties"]["path"];
        assert_eq!(path_prop["type"], "string");
        assert_eq!(path_prop["description"], "a path");
        assert_eq!(path_prop["default"], ".");
    }

    #[test]
    fn property_overrides_touch_only_named_property() {
        let mut property_overrides = std::collections::HashMap::new();
        property_overrides.insert(
            "path".to_string(),
            PropertyOverride {
                description: Some("overridden description".to_string()),
                ..Default::default()
            },
        );
        let overrides = vec![(
            "github__*".to_string(),
            ToolOverride {
                property_overrides,
                ..Default::default()
            },
        )];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        assert_eq!(def["inputSchema"]["properties"]["path"]["description"], "overridden description");
        assert_eq!(def["inputSchema"]["properties"]["path"]["type"], "string");
    }

    #[test]
    fn clear_cache_forces_recompute() {
        let overrides = vec![(
            "github__*".to_string(),
            ToolOverride {
                description: Some("cached description".to_string()),
                ..Default::default()
            },
        )];
        let manager = ToolOverrideManager::new(overrides);
        let mut def = tool("create_issue");
        manager.apply("github__create_issue", "create_issue", &mut def);
        assert_eq!(manager.cache.len(), 1);
        manager.clear_cache();
        assert_eq!(manager.cache.len(), 0);
    }
}
