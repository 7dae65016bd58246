use super::{no_config, parse_config};
use crate::context::ResolveContext;
use crate::producer::{DataProducer, ProducerDefinition, ProducerInputs, ProducerRegistry, SlotDefinition, SlotKind};
use async_trait::async_trait;
use fieldwork_core::{CacheableMetadata, ConfigError, MaxAge, ResolveResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub(super) fn register(registry: &mut ProducerRegistry) {
    registry.insert(
        ProducerDefinition::new("value", "Value")
            .with_description("Passes its input through, optionally limiting max-age and adding tags.")
            .consumes("value", SlotDefinition::optional(SlotKind::Any)),
        Arc::new(|config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            let config: ValueConfig = parse_config("value", config)?;
            Ok(Box::new(ValueProducer { config }) as Box<dyn DataProducer>)
        }),
    );

    registry.insert(
        ProducerDefinition::new("uppercase", "Uppercase")
            .consumes("string", SlotDefinition::required(SlotKind::String))
            .cacheable(),
        Arc::new(|config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            no_config("uppercase", config)?;
            Ok(Box::new(Uppercase) as Box<dyn DataProducer>)
        }),
    );

    registry.insert(
        ProducerDefinition::new("property_path", "Property path")
            .with_description("Reads a dot-separated path from a value.")
            .consumes("path", SlotDefinition::required(SlotKind::String))
            .consumes("value", SlotDefinition::optional(SlotKind::Any))
            .cacheable(),
        Arc::new(|config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            let config: PropertyPathConfig = parse_config("property_path", config)?;
            Ok(Box::new(PropertyPath { config }) as Box<dyn DataProducer>)
        }),
    );
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValueConfig {
    #[serde(default)]
    max_age: Option<u64>,
    #[serde(default)]
    tags: Vec<String>,
}

/// `value`: returns its input.
#[derive(Debug)]
pub struct ValueProducer {
    config: ValueConfig,
}

#[async_trait]
impl DataProducer for ValueProducer {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        _ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        if let Some(secs) = self.config.max_age {
            metadata.merge_max_age(MaxAge::Seconds(secs));
        }
        metadata.add_tags(self.config.tags.iter().cloned());
        Ok(inputs.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// `uppercase`: upper-cases a string.
#[derive(Debug)]
pub struct Uppercase;

#[async_trait]
impl DataProducer for Uppercase {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        _ctx: &ResolveContext,
        _metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        Ok(Value::from(inputs.require_str("uppercase", "string")?.to_uppercase()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PropertyPathConfig {
    /// Returned when the path does not exist.
    #[serde(default)]
    default: Value,
}

/// `property_path`: reads `path` from `value`.
#[derive(Debug)]
pub struct PropertyPath {
    config: PropertyPathConfig,
}

#[async_trait]
impl DataProducer for PropertyPath {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        _ctx: &ResolveContext,
        _metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        let path = inputs.require_str("property_path", "path")?;
        let Some(root) = inputs.get("value") else {
            return Ok(self.config.default.clone());
        };

        let found = path.split('.').try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        });
        Ok(found.cloned().unwrap_or_else(|| self.config.default.clone()))
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{Context, ResolveContext, Services};
    use crate::entity::MemoryEntityStorage;
    use crate::producer::ProducerRegistry;
    use crate::proxy::DataProducerProxy;
    use crate::resolver::{Resolver, ResolverArgs};
    use fieldwork_core::{ConfigError, MaxAge};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn ctx() -> ResolveContext {
        let registry = ProducerRegistry::with_builtins(Arc::new(MemoryEntityStorage::new()));
        ResolveContext::new(Context::new(), Services::new(registry))
    }

    async fn resolve(proxy: DataProducerProxy) -> crate::resolver::Resolved {
        proxy
            .resolve(&Value::Null, &ResolverArgs::new(), &ctx())
            .unwrap()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_value_applies_config() {
        let resolved = resolve(
            DataProducerProxy::new("value")
                .map("value", Resolver::value(3))
                .config(json!({"max_age": 60, "tags": ["config:site"]})),
        )
        .await;

        assert_eq!(resolved.value, json!(3));
        assert_eq!(resolved.metadata.max_age, MaxAge::Seconds(60));
        assert!(resolved.metadata.tags.contains("config:site"));
    }

    #[test]
    fn test_invalid_config() {
        let registry = ctx().services().producers().create_instance("value", &json!({"ttl": 1}));
        assert!(matches!(registry, Err(ConfigError::InvalidConfig { .. })));

        let uppercase = ctx().services().producers().create_instance("uppercase", &json!(true));
        assert!(matches!(uppercase, Err(ConfigError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_uppercase() {
        let resolved = resolve(DataProducerProxy::new("uppercase").map("string", Resolver::value("abc"))).await;
        assert_eq!(resolved.value, json!("ABC"));
    }

    #[tokio::test]
    async fn test_property_path() {
        let found = resolve(
            DataProducerProxy::new("property_path")
                .map("path", Resolver::value("a.b.1"))
                .map("value", Resolver::value(json!({"a": {"b": [10, 20]}}))),
        )
        .await;
        assert_eq!(found.value, json!(20));

        let missing = resolve(
            DataProducerProxy::new("property_path")
                .map("path", Resolver::value("a.c"))
                .map("value", Resolver::value(json!({"a": {}})))
                .config(json!({"default": "none"})),
        )
        .await;
        assert_eq!(missing.value, json!("none"));
    }
}
