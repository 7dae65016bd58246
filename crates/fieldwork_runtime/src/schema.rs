//! JSON configuration of field resolvers.
//!
//! A configuration maps `"Type.field"` keys to resolver specs:
//!
//! ```json
//! {
//!   "caching": true,
//!   "resolvers": {
//!     "Query.node": {
//!       "produce": "entity_load",
//!       "map": {"type": {"value": "node"}, "id": {"argument": "id"}},
//!       "cached": true
//!     },
//!     "Node.label": {"produce": "entity_label", "map": {"entity": "parent"}}
//!   }
//! }
//! ```
//!
//! Spec forms: `"parent"`, `{"value": v}`, `{"parent": null}`,
//! `{"parent_property": "a.b"}`, `{"argument": name}`, `{"context": name}`,
//! `{"produce": id, "map": {..}, "config": v, "cached": bool}` and
//! `{"compose": [spec, ..]}`.

use crate::executor::ExecutorConfig;
use crate::producer::ProducerRegistry;
use crate::proxy::DataProducerProxy;
use crate::resolver::{Resolver, ResolverMap};
use fieldwork_core::diagnostics::codes;
use fieldwork_core::{ConfigError, DiagnosticBag};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

/// A resolver configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    /// Serve cacheable producers through the cache.
    #[serde(default = "default_caching")]
    pub caching: bool,
    /// Maximum selection depth; the executor default when absent.
    #[serde(default)]
    pub max_depth: Option<usize>,
    /// Resolver specs by `"Type.field"`.
    #[serde(default)]
    pub resolvers: IndexMap<String, Value>,
}

fn default_caching() -> bool {
    true
}

impl SchemaConfig {
    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The executor configuration described by this file.
    pub fn executor_config(&self) -> ExecutorConfig {
        let defaults = ExecutorConfig::default();
        ExecutorConfig {
            caching: self.caching,
            max_depth: self.max_depth.unwrap_or(defaults.max_depth),
        }
    }

    /// Builds the resolver map, validating every resolver against `registry`.
    ///
    /// Fields with malformed keys or specs are left out of the map. Fields
    /// that fail registry validation are kept; the diagnostics say why they
    /// will fail.
    pub fn build(&self, registry: &ProducerRegistry) -> (ResolverMap, DiagnosticBag) {
        let mut resolvers = ResolverMap::new();
        let mut diagnostics = DiagnosticBag::new();

        for (key, spec) in &self.resolvers {
            let Some((type_name, field_name)) = split_field_key(key) else {
                diagnostics.error(
                    codes::INVALID_FIELD_KEY,
                    "invalid field key",
                    key.as_str(),
                    format!("'{}' is not of the form Type.field", key),
                );
                continue;
            };

            let resolver = match parse_resolver(spec) {
                Ok(resolver) => resolver,
                Err(error) => {
                    diagnostics.error(codes::INVALID_RESOLVER, "invalid resolver", key.as_str(), error.to_string());
                    continue;
                }
            };

            registry.check(&resolver, key, &mut diagnostics);
            resolvers.register(type_name, field_name, resolver);
        }

        (resolvers, diagnostics)
    }
}

fn split_field_key(key: &str) -> Option<(&str, &str)> {
    let (type_name, field_name) = key.split_once('.')?;
    let valid = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_');
    (valid(type_name) && valid(field_name)).then_some((type_name, field_name))
}

/// Parses a resolver spec.
pub fn parse_resolver(spec: &Value) -> Result<Resolver, ConfigError> {
    parse_at(spec, "$")
}

fn parse_at(spec: &Value, at: &str) -> Result<Resolver, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidMapping {
        slot: at.to_string(),
        message,
    };

    let object = match spec {
        Value::String(s) if s == "parent" => return Ok(Resolver::Parent),
        Value::Object(object) => object,
        other => return Err(invalid(format!("expected a resolver object, got {}", other))),
    };

    if let Some(id) = object.get("produce") {
        return parse_produce(id, object, at);
    }

    let mut entries = object.iter();
    let (kind, argument) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(invalid(
                "a resolver object must have exactly one key".to_string(),
            ))
        }
    };

    let name = |what: &str| {
        argument
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("'{}' expects {}, got {}", kind, what, argument)))
    };

    match kind.as_str() {
        "value" => Ok(Resolver::Value(argument.clone())),
        "parent" if argument.is_null() => Ok(Resolver::Parent),
        "parent" => Err(invalid(format!("'parent' takes no argument, got {}", argument))),
        "parent_property" => Ok(Resolver::parent_property(&name("a property path")?)),
        "argument" => Ok(Resolver::argument(name("an argument name")?)),
        "context" => Ok(Resolver::context(name("a context key")?)),
        "compose" => {
            let Value::Array(steps) = argument else {
                return Err(invalid(format!("'compose' expects a list, got {}", argument)));
            };
            let steps = steps
                .iter()
                .enumerate()
                .map(|(i, step)| parse_at(step, &format!("{}.compose[{}]", at, i)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Resolver::compose(steps))
        }
        other => Err(invalid(format!("unknown resolver kind '{}'", other))),
    }
}

fn parse_produce(id: &Value, object: &Map<String, Value>, at: &str) -> Result<Resolver, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidMapping {
        slot: at.to_string(),
        message,
    };

    let id = id
        .as_str()
        .ok_or_else(|| invalid(format!("'produce' expects a producer id, got {}", id)))?;
    let mut proxy = DataProducerProxy::new(id);

    for (key, value) in object {
        match key.as_str() {
            "produce" => {}
            "map" => {
                let Value::Object(mapping) = value else {
                    return Err(invalid(format!("'map' expects an object, got {}", value)));
                };
                for (slot, spec) in mapping {
                    proxy = proxy.map(slot.as_str(), parse_at(spec, &format!("{}.{}", at, slot))?);
                }
            }
            "config" => proxy = proxy.config(value.clone()),
            "cached" => match value {
                Value::Bool(true) => proxy = proxy.cached(),
                Value::Bool(false) => {}
                other => return Err(invalid(format!("'cached' expects a boolean, got {}", other))),
            },
            other => return Err(invalid(format!("unknown key '{}' in producer resolver", other))),
        }
    }

    Ok(proxy.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStorage;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProducerRegistry {
        ProducerRegistry::with_builtins(Arc::new(MemoryEntityStorage::new()))
    }

    #[test]
    fn test_parse_simple_forms() {
        assert!(matches!(parse_resolver(&json!("parent")), Ok(Resolver::Parent)));
        assert!(matches!(parse_resolver(&json!({"parent": null})), Ok(Resolver::Parent)));
        assert!(matches!(parse_resolver(&json!({"value": [1, 2]})), Ok(Resolver::Value(v)) if v == json!([1, 2])));
        assert!(matches!(parse_resolver(&json!({"argument": "id"})), Ok(Resolver::Argument(name)) if name == "id"));
        assert!(matches!(parse_resolver(&json!({"context": "user"})), Ok(Resolver::Context(name)) if name == "user"));
        assert!(matches!(
            parse_resolver(&json!({"parent_property": "author.name"})),
            Ok(Resolver::ParentProperty(path)) if path == ["author", "name"]
        ));
        assert!(matches!(
            parse_resolver(&json!({"compose": ["parent", {"value": 1}]})),
            Ok(Resolver::Compose(steps)) if steps.len() == 2
        ));
    }

    #[test]
    fn test_parse_produce() {
        let resolver = parse_resolver(&json!({
            "produce": "entity_load",
            "map": {"type": {"value": "node"}, "id": {"argument": "id"}},
            "cached": true
        }))
        .unwrap();

        let Resolver::Produce(proxy) = resolver else {
            panic!("expected a producer resolver");
        };
        assert_eq!(proxy.id(), "entity_load");
        assert!(proxy.is_cached());
        assert_eq!(proxy.mapping().keys().collect::<Vec<_>>(), vec!["type", "id"]);
    }

    #[test]
    fn test_parse_errors() {
        let error = parse_resolver(&json!({"produce": "uppercase", "map": {"string": {"argument": 3}}})).unwrap_err();
        insta::assert_snapshot!(
            error.to_string(),
            @"invalid input mapper for slot '$.string': 'argument' expects an argument name, got 3"
        );

        let error = parse_resolver(&json!({"value": 1, "argument": "id"})).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidMapping { .. }));

        let error = parse_resolver(&json!({"produce": "uppercase", "ttl": 1})).unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid input mapper for slot '$': unknown key 'ttl' in producer resolver"
        );
        assert!(parse_resolver(&json!(42)).is_err());
    }

    #[test]
    fn test_build_reports_diagnostics() {
        let config = SchemaConfig::from_json(
            r#"{
                "caching": false,
                "max_depth": 4,
                "resolvers": {
                    "Query.greeting": {"produce": "uppercase", "map": {"string": {"value": "hi"}}},
                    "Query.broken": {"produce": "missing"},
                    "nodot": {"value": 1},
                    "Query.bad": {"nope": 1}
                }
            }"#,
        )
        .unwrap();

        let executor = config.executor_config();
        assert!(!executor.caching);
        assert_eq!(executor.max_depth, 4);

        let (resolvers, diagnostics) = config.build(&registry());
        let codes: Vec<&str> = diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["F0010", "F0001", "F0002"]);
        assert!(resolvers.get("Query", "greeting").is_some());
        assert!(resolvers.get("Query", "broken").is_some());
        assert!(resolvers.get("Query", "bad").is_none());
    }

    #[test]
    fn test_field_keys() {
        assert_eq!(split_field_key("Query.node"), Some(("Query", "node")));
        assert_eq!(split_field_key("Query."), None);
        assert_eq!(split_field_key("Query.node.id"), None);
    }
}
