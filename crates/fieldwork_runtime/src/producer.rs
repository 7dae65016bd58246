//! Data producers and their registry.
//!
//! A data producer is a named unit of field computation. It declares typed
//! input slots, whether its results may be cached, and which cache contexts
//! those results vary by. The registry maps producer ids to definitions and
//! factories; it is built once at startup and every configured resolver is
//! validated against it before serving traffic.

use crate::context::ResolveContext;
use crate::resolver::Resolver;
use async_trait::async_trait;
use fieldwork_core::diagnostics::codes;
use fieldwork_core::{CacheableMetadata, ConfigError, DiagnosticBag, ResolveError, ResolveResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// The type of value a slot accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    #[default]
    Any,
    String,
    Integer,
    Boolean,
    /// A string or an integer that fits in `i64`.
    Id,
    Object,
}

impl SlotKind {
    /// Returns true if a single (non-list) value is of this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            SlotKind::Any => true,
            SlotKind::String => value.is_string(),
            SlotKind::Integer => value.is_i64(),
            SlotKind::Boolean => value.is_boolean(),
            SlotKind::Id => value.is_string() || value.is_i64(),
            SlotKind::Object => value.is_object(),
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotKind::Any => "any",
            SlotKind::String => "string",
            SlotKind::Integer => "integer",
            SlotKind::Boolean => "boolean",
            SlotKind::Id => "id",
            SlotKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Declaration of one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDefinition {
    pub kind: SlotKind,
    pub required: bool,
    /// The slot takes a list of `kind` values.
    pub multiple: bool,
}

impl SlotDefinition {
    /// A required single-valued slot.
    pub fn required(kind: SlotKind) -> Self {
        Self {
            kind,
            required: true,
            multiple: false,
        }
    }

    /// An optional single-valued slot.
    pub fn optional(kind: SlotKind) -> Self {
        Self {
            kind,
            required: false,
            multiple: false,
        }
    }

    /// Turns the slot into a list slot.
    #[must_use]
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Checks a resolved value against the declaration.
    ///
    /// `null` is accepted for optional slots. A list slot also accepts a
    /// single value of its kind.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return if self.required {
                Err("a value is required".to_string())
            } else {
                Ok(())
            };
        }

        let valid = match value {
            Value::Array(items) if self.multiple => items.iter().all(|v| self.kind.accepts(v)),
            single => self.kind.accepts(single),
        };

        if valid {
            Ok(())
        } else if self.multiple {
            Err(format!("expected a list of {}, got {}", self.kind, value))
        } else {
            Err(format!("expected {}, got {}", self.kind, value))
        }
    }
}

/// Static description of a producer.
#[derive(Debug, Clone)]
pub struct ProducerDefinition {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    /// Input slots, in declaration order.
    pub consumes: IndexMap<String, SlotDefinition>,
    /// Whether results may be cached.
    pub cacheable: bool,
}

impl ProducerDefinition {
    /// Creates a definition without slots.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            consumes: IndexMap::new(),
            cacheable: false,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares an input slot.
    #[must_use]
    pub fn consumes(mut self, slot: impl Into<String>, definition: SlotDefinition) -> Self {
        self.consumes.insert(slot.into(), definition);
        self
    }

    /// Marks results as cacheable.
    #[must_use]
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Returns a slot declaration.
    pub fn slot(&self, name: &str) -> Option<&SlotDefinition> {
        self.consumes.get(name)
    }
}

/// Resolved slot values handed to a producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerInputs {
    values: IndexMap<String, Value>,
}

impl ProducerInputs {
    /// Creates an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a slot value.
    pub fn insert(&mut self, slot: impl Into<String>, value: Value) {
        self.values.insert(slot.into(), value);
    }

    /// Returns a slot value; `null` values read as absent.
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.values.get(slot).filter(|v| !v.is_null())
    }

    /// Returns a slot value as a string.
    pub fn get_str(&self, slot: &str) -> Option<&str> {
        self.get(slot).and_then(Value::as_str)
    }

    /// Returns a slot value or a producer error naming the slot.
    pub fn require(&self, producer: &str, slot: &str) -> ResolveResult<&Value> {
        self.get(slot).ok_or_else(|| {
            ResolveError::producer(producer, format!("input '{}' has no value", slot))
        })
    }

    /// Returns a string slot value or a producer error naming the slot.
    pub fn require_str(&self, producer: &str, slot: &str) -> ResolveResult<&str> {
        self.require(producer, slot)?.as_str().ok_or_else(|| {
            ResolveError::producer(producer, format!("input '{}' is not a string", slot))
        })
    }

    /// Iterates over slots in mapping order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// The inputs as a JSON object with keys in sorted order.
    pub fn to_canonical_value(&self) -> Value {
        let mut sorted: Vec<(&String, &Value)> = self.values.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        Value::Object(
            sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }
}

impl FromIterator<(String, Value)> for ProducerInputs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A producer instance.
#[async_trait]
pub trait DataProducer: Send + Sync {
    /// Computes the value. Anything the result depends on beyond its inputs
    /// is recorded in `metadata`.
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value>;

    /// Cache context tokens the result varies by.
    fn cache_contexts(&self) -> Vec<String> {
        Vec::new()
    }

    /// The values that identify a result in the cache.
    fn edge_cache_vectors(&self, inputs: &ProducerInputs) -> ResolveResult<Value> {
        Ok(inputs.to_canonical_value())
    }
}

/// Builds a producer instance from its configuration.
pub type ProducerFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn DataProducer>, ConfigError> + Send + Sync>;

struct Registration {
    definition: Arc<ProducerDefinition>,
    factory: ProducerFactory,
}

/// Producer ids mapped to definitions and factories.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: IndexMap<String, Registration>,
}

impl ProducerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a producer.
    pub fn register<F>(&mut self, definition: ProducerDefinition, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&Value) -> Result<Box<dyn DataProducer>, ConfigError> + Send + Sync + 'static,
    {
        if self.producers.contains_key(&definition.id) {
            return Err(ConfigError::DuplicateProducer(definition.id));
        }
        self.insert(definition, Arc::new(factory));
        Ok(())
    }

    /// Adds or replaces a registration without the duplicate check.
    pub(crate) fn insert(&mut self, definition: ProducerDefinition, factory: ProducerFactory) {
        self.producers.insert(
            definition.id.clone(),
            Registration {
                definition: Arc::new(definition),
                factory,
            },
        );
    }

    /// Returns a producer definition.
    pub fn definition(&self, id: &str) -> Option<&Arc<ProducerDefinition>> {
        self.producers.get(id).map(|r| &r.definition)
    }

    /// Returns true if a producer is registered under the id.
    pub fn contains(&self, id: &str) -> bool {
        self.producers.contains_key(id)
    }

    /// Instantiates a producer.
    pub fn create_instance(&self, id: &str, config: &Value) -> Result<Box<dyn DataProducer>, ConfigError> {
        let registration = self
            .producers
            .get(id)
            .ok_or_else(|| ConfigError::UnknownProducer(id.to_string()))?;
        (registration.factory)(config)
    }

    /// Iterates over definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &ProducerDefinition> {
        self.producers.values().map(|r| r.definition.as_ref())
    }

    /// Number of registered producers.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Validates a resolver tree, returning the first configuration error.
    pub fn validate(&self, resolver: &Resolver) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        self.walk(resolver, &mut problems);
        problems
            .into_iter()
            .find_map(|problem| match problem {
                Problem::Error(error) => Some(error),
                Problem::NotCacheable(_) => None,
            })
            .map_or(Ok(()), Err)
    }

    /// Validates a resolver tree, reporting every problem at `location`.
    pub fn check(&self, resolver: &Resolver, location: &str, diagnostics: &mut DiagnosticBag) {
        let mut problems = Vec::new();
        self.walk(resolver, &mut problems);

        for problem in problems {
            match problem {
                Problem::NotCacheable(id) => diagnostics.warning(
                    codes::CACHE_NOT_SUPPORTED,
                    "cached resolution of an uncacheable producer",
                    location,
                    format!("data producer '{}' does not support caching; results are never stored", id),
                ),
                Problem::Error(error) => {
                    let (code, title) = match &error {
                        ConfigError::UnknownProducer(_) | ConfigError::DuplicateProducer(_) => {
                            (codes::UNKNOWN_PRODUCER, "unknown data producer")
                        }
                        ConfigError::UndeclaredSlot { .. } => {
                            (codes::UNDECLARED_SLOT, "mapping of an undeclared input")
                        }
                        ConfigError::MissingSlot { .. } => {
                            (codes::MISSING_SLOT, "required input is not mapped")
                        }
                        ConfigError::InvalidMapping { .. } => {
                            (codes::INVALID_RESOLVER, "invalid resolver")
                        }
                        ConfigError::InvalidConfig { .. } => {
                            (codes::INVALID_PRODUCER_CONFIG, "invalid producer configuration")
                        }
                    };
                    diagnostics.error(code, title, location, error.to_string());
                }
            }
        }
    }

    fn walk(&self, resolver: &Resolver, problems: &mut Vec<Problem>) {
        match resolver {
            Resolver::Produce(proxy) => {
                let Some(definition) = self.definition(proxy.id()) else {
                    problems.push(Problem::Error(ConfigError::UnknownProducer(
                        proxy.id().to_string(),
                    )));
                    return;
                };

                for slot in proxy.mapping().keys() {
                    if definition.slot(slot).is_none() {
                        problems.push(Problem::Error(ConfigError::UndeclaredSlot {
                            producer: definition.id.clone(),
                            slot: slot.clone(),
                        }));
                    }
                }
                for (slot, declaration) in &definition.consumes {
                    if declaration.required && !proxy.mapping().contains_key(slot) {
                        problems.push(Problem::Error(ConfigError::MissingSlot {
                            producer: definition.id.clone(),
                            slot: slot.clone(),
                        }));
                    }
                }
                if let Err(error) = self.create_instance(proxy.id(), proxy.producer_config()) {
                    problems.push(Problem::Error(error));
                }
                if proxy.is_cached() && !definition.cacheable {
                    problems.push(Problem::NotCacheable(definition.id.clone()));
                }

                for nested in proxy.mapping().values() {
                    self.walk(nested, problems);
                }
            }
            Resolver::Compose(steps) => {
                for step in steps {
                    self.walk(step, problems);
                }
            }
            Resolver::Value(_)
            | Resolver::Parent
            | Resolver::ParentProperty(_)
            | Resolver::Argument(_)
            | Resolver::Context(_) => {}
        }
    }
}

enum Problem {
    Error(ConfigError),
    NotCacheable(String),
}

impl fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("producers", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DataProducerProxy;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl DataProducer for Echo {
        async fn resolve(
            &self,
            inputs: &ProducerInputs,
            _ctx: &ResolveContext,
            _metadata: &mut CacheableMetadata,
        ) -> ResolveResult<Value> {
            Ok(inputs.get("value").cloned().unwrap_or(Value::Null))
        }
    }

    fn registry() -> ProducerRegistry {
        let mut registry = ProducerRegistry::new();
        registry
            .register(
                ProducerDefinition::new("echo", "Echo")
                    .consumes("value", SlotDefinition::required(SlotKind::Any))
                    .consumes("label", SlotDefinition::optional(SlotKind::String)),
                |_| Ok(Box::new(Echo)),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_slot_check() {
        let id = SlotDefinition::required(SlotKind::Id);
        assert!(id.check(&json!(1)).is_ok());
        assert!(id.check(&json!("a")).is_ok());
        assert!(id.check(&json!(true)).is_err());
        assert_eq!(id.check(&Value::Null).unwrap_err(), "a value is required");

        let ids = SlotDefinition::optional(SlotKind::Id).multiple();
        assert!(ids.check(&json!([1, "2"])).is_ok());
        assert!(ids.check(&json!(3)).is_ok());
        assert!(ids.check(&Value::Null).is_ok());
        assert_eq!(
            ids.check(&json!([1, false])).unwrap_err(),
            "expected a list of id, got [1,false]"
        );
    }

    #[test]
    fn test_integers_must_fit_i64() {
        let id = SlotDefinition::required(SlotKind::Id);
        let integer = SlotDefinition::required(SlotKind::Integer);

        assert!(id.check(&json!(i64::MAX)).is_ok());
        assert!(integer.check(&json!(-1)).is_ok());
        assert!(id.check(&json!(u64::MAX)).is_err());
        assert!(integer.check(&json!(u64::MAX)).is_err());
        assert!(integer.check(&json!(1.5)).is_err());
    }

    #[test]
    fn test_canonical_inputs_are_sorted() {
        let inputs: ProducerInputs = vec![
            ("type".to_string(), json!("node")),
            ("id".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();

        let canonical = inputs.to_canonical_value();
        let keys: Vec<&String> = canonical.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["id", "type"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let err = registry
            .register(ProducerDefinition::new("echo", "Again"), |_| Ok(Box::new(Echo)))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateProducer("echo".into()));
    }

    #[test]
    fn test_validate() {
        let registry = registry();

        let ok = Resolver::from(DataProducerProxy::new("echo").map("value", Resolver::Parent));
        assert!(registry.validate(&ok).is_ok());

        let unknown = Resolver::from(DataProducerProxy::new("nope"));
        assert_eq!(
            registry.validate(&unknown).unwrap_err(),
            ConfigError::UnknownProducer("nope".into())
        );

        let missing = Resolver::from(DataProducerProxy::new("echo"));
        assert_eq!(
            registry.validate(&missing).unwrap_err(),
            ConfigError::MissingSlot {
                producer: "echo".into(),
                slot: "value".into()
            }
        );

        let nested = Resolver::Compose(vec![
            Resolver::Parent,
            Resolver::from(
                DataProducerProxy::new("echo")
                    .map("value", Resolver::from(DataProducerProxy::new("echo").map("bogus", Resolver::Parent))),
            ),
        ]);
        assert!(matches!(
            registry.validate(&nested).unwrap_err(),
            ConfigError::UndeclaredSlot { .. }
        ));
    }

    #[test]
    fn test_check_reports_every_problem() {
        let registry = registry();
        let resolver = Resolver::from(
            DataProducerProxy::new("echo")
                .map("bogus", Resolver::Parent)
                .cached(),
        );

        let mut diagnostics = DiagnosticBag::new();
        registry.check(&resolver, "Query.echo", &mut diagnostics);

        let codes: Vec<&str> = diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["F0011", "F0012", "F0020"]);
        assert_eq!(diagnostics.error_count(), 2);
    }
}
