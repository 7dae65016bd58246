//! Entities, entity storage and the entity buffer.

use crate::buffer::{BatchLoader, Buffer};
use async_trait::async_trait;
use fieldwork_core::{BufferError, Deferred};
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::RwLock;

/// An entity id: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    String(String),
}

impl EntityId {
    /// Reads an id from a JSON integer or string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Int),
            Value::String(s) => Some(EntityId::String(s.clone())),
            _ => None,
        }
    }

    /// The id as JSON.
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(i) => Value::from(*i),
            EntityId::String(s) => Value::from(s.as_str()),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        EntityId::Int(i64::from(id))
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::String(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::String(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{}", i),
            EntityId::String(s) => f.write_str(s),
        }
    }
}

/// Language-specific overrides of an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub values: Map<String, Value>,
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: EntityId,
    #[serde(default)]
    pub language: Option<String>,
    pub label: String,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub translations: BTreeMap<String, Translation>,
}

impl Entity {
    /// Creates an entity without values.
    pub fn new(entity_type: impl Into<String>, id: impl Into<EntityId>, label: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            language: None,
            label: label.into(),
            values: Map::new(),
            translations: BTreeMap::new(),
        }
    }

    /// Sets the original language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets a field value.
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Adds a translation.
    #[must_use]
    pub fn with_translation(mut self, language: impl Into<String>, translation: Translation) -> Self {
        self.translations.insert(language.into(), translation);
        self
    }

    /// Returns true if the entity has a translation in `language`.
    pub fn has_translation(&self, language: &str) -> bool {
        self.language.as_deref() == Some(language) || self.translations.contains_key(language)
    }

    /// Returns the entity in `language`, or `None` if there is no such
    /// translation.
    pub fn translation(&self, language: &str) -> Option<Entity> {
        if self.language.as_deref() == Some(language) {
            return Some(self.clone());
        }
        let translation = self.translations.get(language)?;
        let mut translated = self.clone();
        translated.language = Some(language.to_string());
        if let Some(label) = &translation.label {
            translated.label = label.clone();
        }
        for (name, value) in &translation.values {
            translated.values.insert(name.clone(), value.clone());
        }
        Some(translated)
    }

    /// The invalidation tag of this entity.
    pub fn cache_tag(&self) -> String {
        format!("{}:{}", self.entity_type, self.id)
    }

    /// The entity as a GraphQL object value.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".into(), Value::from(self.entity_type.as_str()));
        object.insert("id".into(), self.id.to_value());
        object.insert(
            "language".into(),
            self.language.as_deref().map_or(Value::Null, Value::from),
        );
        object.insert("label".into(), Value::from(self.label.as_str()));
        for (name, value) in &self.values {
            object.entry(name.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(object)
    }
}

/// One id or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityIds {
    One(EntityId),
    Many(Vec<EntityId>),
}

impl EntityIds {
    /// Reads ids from a JSON id or array of ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(EntityId::from_value)
                .collect::<Option<Vec<_>>>()
                .map(EntityIds::Many),
            single => EntityId::from_value(single).map(EntityIds::One),
        }
    }

    /// Iterates over the ids.
    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        match self {
            EntityIds::One(id) => std::slice::from_ref(id).iter(),
            EntityIds::Many(ids) => ids.iter(),
        }
    }
}

impl From<EntityId> for EntityIds {
    fn from(id: EntityId) -> Self {
        EntityIds::One(id)
    }
}

impl From<i64> for EntityIds {
    fn from(id: i64) -> Self {
        EntityIds::One(EntityId::Int(id))
    }
}

impl From<i32> for EntityIds {
    fn from(id: i32) -> Self {
        EntityIds::One(EntityId::from(id))
    }
}

impl From<Vec<i64>> for EntityIds {
    fn from(ids: Vec<i64>) -> Self {
        EntityIds::Many(ids.into_iter().map(EntityId::Int).collect())
    }
}

impl From<Vec<i32>> for EntityIds {
    fn from(ids: Vec<i32>) -> Self {
        EntityIds::Many(ids.into_iter().map(EntityId::from).collect())
    }
}

impl From<Vec<EntityId>> for EntityIds {
    fn from(ids: Vec<EntityId>) -> Self {
        EntityIds::Many(ids)
    }
}

/// The result of one buffered entity request.
#[derive(Debug, Clone)]
pub enum EntityLoad {
    /// A single id; `None` if it does not exist.
    One(Option<Arc<Entity>>),
    /// A list of ids; missing ids are skipped.
    Many(Vec<Arc<Entity>>),
}

impl EntityLoad {
    /// Iterates over the loaded entities.
    pub fn entities(&self) -> std::slice::Iter<'_, Arc<Entity>> {
        match self {
            EntityLoad::One(entity) => entity.as_slice().iter(),
            EntityLoad::Many(entities) => entities.iter(),
        }
    }

    /// The result as JSON: an object, `null`, or a list.
    pub fn to_value(&self) -> Value {
        match self {
            EntityLoad::One(Some(entity)) => entity.to_value(),
            EntityLoad::One(None) => Value::Null,
            EntityLoad::Many(entities) => {
                Value::Array(entities.iter().map(|e| e.to_value()).collect())
            }
        }
    }
}

/// One queued request: ids plus an optional language.
#[derive(Debug, Clone)]
pub struct EntityRequest {
    pub ids: EntityIds,
    pub language: Option<String>,
}

/// Entity storage failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("entity storage for '{0}' is unavailable")]
    Unavailable(String),
}

/// Loads entities of one type by id.
#[async_trait]
pub trait EntityStorage: Send + Sync {
    /// Returns the entities that exist, in any order.
    async fn load_multiple(
        &self,
        entity_type: &str,
        ids: &[EntityId],
    ) -> Result<Vec<Entity>, StorageError>;
}

/// In-process entity storage that records every load.
#[derive(Debug, Default)]
pub struct MemoryEntityStorage {
    entities: RwLock<FxHashMap<(String, EntityId), Entity>>,
    failing: FxHashSet<String>,
    calls: Mutex<Vec<(String, Vec<EntityId>)>>,
}

impl MemoryEntityStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage holding the given entities.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        entities
            .into_iter()
            .fold(Self::new(), |storage, entity| storage.with_entity(entity))
    }

    /// Adds an entity.
    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities
            .get_mut()
            .insert((entity.entity_type.clone(), entity.id.clone()), entity);
        self
    }

    /// Makes every load of `entity_type` fail.
    #[must_use]
    pub fn with_failure(mut self, entity_type: impl Into<String>) -> Self {
        self.failing.insert(entity_type.into());
        self
    }

    /// Adds or replaces an entity.
    pub async fn save(&self, entity: Entity) {
        self.entities
            .write()
            .await
            .insert((entity.entity_type.clone(), entity.id.clone()), entity);
    }

    /// Every load so far: entity type and requested ids.
    pub fn load_calls(&self) -> Vec<(String, Vec<EntityId>)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EntityStorage for MemoryEntityStorage {
    async fn load_multiple(
        &self,
        entity_type: &str,
        ids: &[EntityId],
    ) -> Result<Vec<Entity>, StorageError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((entity_type.to_string(), ids.to_vec()));

        if self.failing.contains(entity_type) {
            return Err(StorageError::Unavailable(entity_type.to_string()));
        }

        let entities = self.entities.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| entities.get(&(entity_type.to_string(), id.clone())).cloned())
            .collect())
    }
}

/// Bulk loader behind [`EntityBuffer`]; groups by entity type.
pub struct EntityLoader {
    storage: Arc<dyn EntityStorage>,
}

impl EntityLoader {
    pub fn new(storage: Arc<dyn EntityStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BatchLoader for EntityLoader {
    type Group = String;
    type Item = EntityRequest;
    type Output = EntityLoad;

    async fn load(
        &self,
        entity_type: &String,
        requests: Vec<EntityRequest>,
    ) -> Result<Vec<EntityLoad>, BufferError> {
        let ids: IndexSet<EntityId> = requests
            .iter()
            .flat_map(|request| request.ids.iter().cloned())
            .collect();
        let ids: Vec<EntityId> = ids.into_iter().collect();

        let loaded = self
            .storage
            .load_multiple(entity_type, &ids)
            .await
            .map_err(|e| BufferError::Load {
                group: entity_type.clone(),
                message: e.to_string(),
            })?;
        let loaded: FxHashMap<EntityId, Entity> =
            loaded.into_iter().map(|e| (e.id.clone(), e)).collect();

        let mut shared: FxHashMap<(EntityId, Option<String>), Arc<Entity>> = FxHashMap::default();
        let mut lookup = |id: &EntityId, language: Option<&str>| -> Option<Arc<Entity>> {
            let key = (id.clone(), language.map(str::to_string));
            if let Some(entity) = shared.get(&key) {
                return Some(Arc::clone(entity));
            }
            let entity = loaded.get(id)?;
            let entity = match language {
                Some(language) => entity.translation(language).unwrap_or_else(|| entity.clone()),
                None => entity.clone(),
            };
            let entity = Arc::new(entity);
            shared.insert(key, Arc::clone(&entity));
            Some(entity)
        };

        Ok(requests
            .iter()
            .map(|request| {
                let language = request.language.as_deref();
                match &request.ids {
                    EntityIds::One(id) => EntityLoad::One(lookup(id, language)),
                    EntityIds::Many(ids) => {
                        EntityLoad::Many(ids.iter().filter_map(|id| lookup(id, language)).collect())
                    }
                }
            })
            .collect())
    }
}

/// Buffer of entity loads, one bulk load per entity type.
pub type EntityBuffer = Buffer<EntityLoader>;

impl Buffer<EntityLoader> {
    /// Creates an entity buffer over a storage.
    pub fn from_storage(storage: Arc<dyn EntityStorage>) -> Self {
        Buffer::new(EntityLoader::new(storage))
    }

    /// Queues entity ids of one type.
    pub fn add_entities(
        &self,
        entity_type: impl Into<String>,
        ids: impl Into<EntityIds>,
        language: Option<String>,
    ) -> Deferred<EntityLoad> {
        self.add(
            entity_type.into(),
            EntityRequest {
                ids: ids.into(),
                language,
            },
        )
    }
}
