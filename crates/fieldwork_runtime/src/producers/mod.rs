//! Built-in data producers.
//!
//! - `value`, `uppercase`, `property_path`: generic value plumbing
//! - `entity_load`, `entity_load_multiple`: buffered entity loads
//! - `entity_id`, `entity_label`: entity accessors

mod entity;
mod generic;

pub use entity::{EntityIdProducer, EntityLabel, EntityLoadMultipleProducer, EntityLoadProducer};
pub use generic::{PropertyPath, Uppercase, ValueProducer};

use crate::entity::EntityStorage;
use crate::producer::ProducerRegistry;
use fieldwork_core::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

impl ProducerRegistry {
    /// Creates a registry holding every built-in producer.
    ///
    /// Entity producers load from `storage` through the buffer of the
    /// request they run in.
    pub fn with_builtins(storage: Arc<dyn EntityStorage>) -> Self {
        let mut registry = Self::new();
        generic::register(&mut registry);
        entity::register(&mut registry, storage);
        registry
    }
}

/// Reads a producer configuration; `null` means the default configuration.
pub(crate) fn parse_config<T>(producer: &str, config: &Value) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| ConfigError::InvalidConfig {
        producer: producer.to_string(),
        message: e.to_string(),
    })
}

/// Rejects any configuration other than `null` or `{}`.
pub(crate) fn no_config(producer: &str, config: &Value) -> Result<(), ConfigError> {
    match config {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() => Ok(()),
        other => Err(ConfigError::InvalidConfig {
            producer: producer.to_string(),
            message: format!("takes no configuration, got {}", other),
        }),
    }
}
