use super::no_config;
use crate::context::ResolveContext;
use crate::entity::{EntityBuffer, EntityIds, EntityLoad, EntityStorage};
use crate::producer::{DataProducer, ProducerDefinition, ProducerInputs, ProducerRegistry, SlotDefinition, SlotKind};
use async_trait::async_trait;
use fieldwork_core::{CacheableMetadata, ConfigError, ResolveError, ResolveResult};
use serde_json::Value;
use std::sync::Arc;

/// Name of the request's entity buffer.
const ENTITY_BUFFER: &str = "entity";

pub(super) fn register(registry: &mut ProducerRegistry, storage: Arc<dyn EntityStorage>) {
    let single = Arc::clone(&storage);
    registry.insert(
        ProducerDefinition::new("entity_load", "Load entity")
            .consumes("type", SlotDefinition::required(SlotKind::String))
            .consumes("id", SlotDefinition::required(SlotKind::Id))
            .consumes("language", SlotDefinition::optional(SlotKind::String))
            .cacheable(),
        Arc::new(move |config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            no_config("entity_load", config)?;
            Ok(Box::new(EntityLoadProducer {
                storage: Arc::clone(&single),
            }))
        }),
    );

    registry.insert(
        ProducerDefinition::new("entity_load_multiple", "Load multiple entities")
            .consumes("type", SlotDefinition::required(SlotKind::String))
            .consumes("ids", SlotDefinition::required(SlotKind::Id).multiple())
            .consumes("language", SlotDefinition::optional(SlotKind::String))
            .cacheable(),
        Arc::new(move |config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            no_config("entity_load_multiple", config)?;
            Ok(Box::new(EntityLoadMultipleProducer {
                storage: Arc::clone(&storage),
            }))
        }),
    );

    registry.insert(
        ProducerDefinition::new("entity_id", "Entity identifier")
            .consumes("entity", SlotDefinition::required(SlotKind::Object)),
        Arc::new(|config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            no_config("entity_id", config)?;
            Ok(Box::new(EntityIdProducer))
        }),
    );

    registry.insert(
        ProducerDefinition::new("entity_label", "Entity label")
            .consumes("entity", SlotDefinition::required(SlotKind::Object)),
        Arc::new(|config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
            no_config("entity_label", config)?;
            Ok(Box::new(EntityLabel))
        }),
    );
}

fn ids(producer: &str, inputs: &ProducerInputs, slot: &str) -> ResolveResult<EntityIds> {
    let value = inputs.require(producer, slot)?;
    EntityIds::from_value(value).ok_or_else(|| {
        ResolveError::producer(producer, format!("input '{}' is not an entity id: {}", slot, value))
    })
}

/// The entity buffer of the current request.
fn entity_buffer(ctx: &ResolveContext, storage: &Arc<dyn EntityStorage>) -> Arc<EntityBuffer> {
    ctx.buffer(ENTITY_BUFFER, || EntityBuffer::from_storage(Arc::clone(storage)))
}

/// Tags for what was loaded. A missing entity is tagged with the type's
/// list tag so creating it invalidates the result.
fn add_entity_tags(metadata: &mut CacheableMetadata, entity_type: &str, load: &EntityLoad, requested: usize) {
    metadata.add_tags(load.entities().map(|entity| entity.cache_tag()));
    if load.entities().len() < requested {
        metadata.add_tags([format!("{}_list", entity_type)]);
    }
}

/// `entity_load`: one entity by type and id, or `null`.
pub struct EntityLoadProducer {
    storage: Arc<dyn EntityStorage>,
}

#[async_trait]
impl DataProducer for EntityLoadProducer {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        let entity_type = inputs.require_str("entity_load", "type")?;
        let ids = match ids("entity_load", inputs, "id")? {
            EntityIds::One(id) => EntityIds::One(id),
            EntityIds::Many(_) => {
                return Err(ResolveError::producer("entity_load", "input 'id' must be a single id"))
            }
        };
        let language = inputs.get_str("language").map(str::to_string);

        let load = entity_buffer(ctx, &self.storage).add_entities(entity_type, ids, language).await?;
        add_entity_tags(metadata, entity_type, &load, 1);
        Ok(load.to_value())
    }
}

/// `entity_load_multiple`: entities by type and ids, in requested order.
pub struct EntityLoadMultipleProducer {
    storage: Arc<dyn EntityStorage>,
}

#[async_trait]
impl DataProducer for EntityLoadMultipleProducer {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        let entity_type = inputs.require_str("entity_load_multiple", "type")?;
        let ids = match ids("entity_load_multiple", inputs, "ids")? {
            EntityIds::One(id) => EntityIds::Many(vec![id]),
            many => many,
        };
        let requested = ids.iter().count();
        let language = inputs.get_str("language").map(str::to_string);

        let load = entity_buffer(ctx, &self.storage).add_entities(entity_type, ids, language).await?;
        add_entity_tags(metadata, entity_type, &load, requested);
        Ok(load.to_value())
    }
}

fn entity_property(producer: &str, inputs: &ProducerInputs, property: &str, metadata: &mut CacheableMetadata) -> ResolveResult<Value> {
    let entity = inputs.require(producer, "entity")?;
    if let (Some(entity_type), Some(id)) = (entity.get("type").and_then(Value::as_str), entity.get("id")) {
        let id = id.as_str().map_or_else(|| id.to_string(), str::to_string);
        metadata.add_tags([format!("{}:{}", entity_type, id)]);
    }
    Ok(entity.get(property).cloned().unwrap_or(Value::Null))
}

/// `entity_id`: the id of an entity value.
pub struct EntityIdProducer;

#[async_trait]
impl DataProducer for EntityIdProducer {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        _ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        entity_property("entity_id", inputs, "id", metadata)
    }
}

/// `entity_label`: the label of an entity value.
pub struct EntityLabel;

#[async_trait]
impl DataProducer for EntityLabel {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        _ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        entity_property("entity_label", inputs, "label", metadata)
    }
}
