//! The data producer proxy: resolves a producer's inputs, runs it, and
//! optionally serves and stores its result through the cache.

use crate::cache::{CacheRecord, Expire};
use crate::cache_key::{context_key, prefix_key, result_key};
use crate::context::ResolveContext;
use crate::producer::{DataProducer, ProducerDefinition, ProducerInputs};
use crate::resolver::{Resolved, Resolver, ResolverArgs};
use fieldwork_core::{CacheableMetadata, ConfigError, Deferred, ResolveError, ResolveResult};
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// A field resolver backed by a data producer.
///
/// The input mapping and configuration are shared by every resolution of
/// the field.
#[derive(Debug, Clone)]
pub struct DataProducerProxy {
    id: String,
    mapping: Arc<IndexMap<String, Resolver>>,
    config: Arc<Value>,
    cached: bool,
}

/// What the result record stores.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResult {
    value: Value,
    metadata: CacheableMetadata,
}

impl DataProducerProxy {
    /// Creates a proxy for the producer `id` with no inputs mapped.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mapping: Arc::new(IndexMap::new()),
            config: Arc::new(Value::Null),
            cached: false,
        }
    }

    /// Maps an input slot to a resolver.
    #[must_use]
    pub fn map(mut self, slot: impl Into<String>, resolver: impl Into<Resolver>) -> Self {
        Arc::make_mut(&mut self.mapping).insert(slot.into(), resolver.into());
        self
    }

    /// Sets the producer configuration.
    #[must_use]
    pub fn config(mut self, config: Value) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Serves results through the cache when the producer supports it.
    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mapping(&self) -> &IndexMap<String, Resolver> {
        &self.mapping
    }

    pub fn producer_config(&self) -> &Value {
        &self.config
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Resolves the field.
    ///
    /// Mapping and producer lookup errors, including those of nested
    /// resolvers, are returned immediately. Slot failures, producer failures
    /// and cache key failures resolve the deferred to an error.
    pub fn resolve(
        &self,
        parent: &Value,
        args: &ResolverArgs,
        ctx: &ResolveContext,
    ) -> ResolveResult<Deferred<Resolved>> {
        let registry = ctx.services().producers();
        let definition = Arc::clone(
            registry
                .definition(&self.id)
                .ok_or_else(|| ConfigError::UnknownProducer(self.id.clone()))?,
        );
        self.check_mapping(&definition)?;
        let producer = registry.create_instance(&self.id, &self.config)?;

        let slots = self
            .mapping
            .iter()
            .map(|(slot, resolver)| {
                resolver
                    .resolve(parent, args, ctx)
                    .map(|deferred| (slot.clone(), deferred))
                    .map_err(|e| ResolveError::slot(slot.as_str(), e))
            })
            .collect::<ResolveResult<Vec<_>>>()?;

        let cached = self.cached && definition.cacheable && ctx.caching();
        let ctx = ctx.clone();

        Ok(Deferred::new(async move {
            let (inputs, slot_metadata) = wait_for_slots(&definition, slots).await?;
            if cached {
                resolve_cached(&definition.id, producer.as_ref(), &inputs, slot_metadata, &ctx).await
            } else {
                let produced = produce(&definition.id, producer.as_ref(), &inputs, &ctx).await?;
                Ok(Resolved::with_metadata(
                    produced.value,
                    produced.metadata.merge(&slot_metadata),
                ))
            }
        }))
    }

    fn check_mapping(&self, definition: &ProducerDefinition) -> Result<(), ConfigError> {
        if let Some(slot) = self.mapping.keys().find(|slot| definition.slot(slot).is_none()) {
            return Err(ConfigError::UndeclaredSlot {
                producer: self.id.clone(),
                slot: slot.clone(),
            });
        }
        if let Some((slot, _)) = definition
            .consumes
            .iter()
            .find(|(slot, declaration)| declaration.required && !self.mapping.contains_key(*slot))
        {
            return Err(ConfigError::MissingSlot {
                producer: self.id.clone(),
                slot: slot.clone(),
            });
        }
        Ok(())
    }
}

/// Waits for every slot, checks each value against its declaration, and
/// collects the slots' metadata.
async fn wait_for_slots(
    definition: &ProducerDefinition,
    slots: Vec<(String, Deferred<Resolved>)>,
) -> ResolveResult<(ProducerInputs, CacheableMetadata)> {
    let resolved = try_join_all(slots.into_iter().map(|(slot, deferred)| async move {
        match deferred.await {
            Ok(resolved) => Ok((slot, resolved)),
            Err(e) => Err(ResolveError::slot(slot, e)),
        }
    }))
    .await?;

    let mut inputs = ProducerInputs::new();
    let mut metadata = CacheableMetadata::new();
    for (slot, Resolved { value, metadata: slot_metadata }) in resolved {
        if let Some(declaration) = definition.slot(&slot) {
            declaration.check(&value).map_err(|message| {
                ResolveError::slot(slot.as_str(), ResolveError::producer(&definition.id, message))
            })?;
        }
        metadata.add_dependency(&slot_metadata);
        inputs.insert(slot, value);
    }
    Ok((inputs, metadata))
}

/// Runs the producer; the metadata holds its declared contexts plus
/// whatever it added while resolving.
async fn produce(
    id: &str,
    producer: &dyn DataProducer,
    inputs: &ProducerInputs,
    ctx: &ResolveContext,
) -> ResolveResult<Resolved> {
    let mut metadata = CacheableMetadata::new().with_contexts(producer.cache_contexts());
    let value = producer.resolve(inputs, ctx, &mut metadata).await?;
    debug!(producer = %id, max_age = %metadata.max_age, "data producer resolved");
    Ok(Resolved::with_metadata(value, metadata))
}

async fn resolve_cached(
    id: &str,
    producer: &dyn DataProducer,
    inputs: &ProducerInputs,
    slot_metadata: CacheableMetadata,
    ctx: &ResolveContext,
) -> ResolveResult<Resolved> {
    let vectors = producer
        .edge_cache_vectors(inputs)
        .map_err(|e| ResolveError::cache_key(id, e.to_string()))?;
    let keys = ctx
        .services()
        .contexts()
        .convert_tokens_to_keys(&producer.cache_contexts(), ctx.request())
        .map_err(|e| ResolveError::cache_key(id, e.to_string()))?;
    let prefix = prefix_key(id, &vectors, &keys);

    if let Some(hit) = read_cached(id, &prefix, ctx).await? {
        debug!(producer = %id, key = %prefix, "cache hit");
        return Ok(Resolved::with_metadata(hit.value, hit.metadata.merge(&slot_metadata)));
    }
    debug!(producer = %id, key = %prefix, "cache miss");

    let produced = produce(id, producer, inputs, ctx).await?;
    let resolved = Resolved::with_metadata(produced.value, produced.metadata.merge(&slot_metadata));

    if resolved.metadata.max_age.is_uncacheable() {
        debug!(producer = %id, "max-age 0, result not stored");
        return Ok(resolved);
    }
    write_cached(id, &prefix, &resolved, ctx).await?;
    Ok(resolved)
}

/// Looks up the context record, then the result for the live values of the
/// stored context tokens. Backend failures read as a miss.
async fn read_cached(
    id: &str,
    prefix: &str,
    ctx: &ResolveContext,
) -> ResolveResult<Option<CachedResult>> {
    let cache = ctx.services().cache();

    let key = context_key(prefix);
    let record = match cache.get(&key).await {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(producer = %id, key = %key, error = %e, "cache read failed");
            return Ok(None);
        }
    };
    let tokens: Vec<String> = match serde_json::from_value(record.data) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(producer = %id, key = %key, error = %e, "discarding unreadable context record");
            return Ok(None);
        }
    };

    let live = ctx
        .services()
        .contexts()
        .convert_tokens_to_keys(&tokens, ctx.request())
        .map_err(|e| ResolveError::cache_key(id, e.to_string()))?;
    let key = result_key(prefix, &live);

    let record = match cache.get(&key).await {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(producer = %id, key = %key, error = %e, "cache read failed");
            return Ok(None);
        }
    };
    match serde_json::from_value::<CachedResult>(record.data) {
        Ok(result) => Ok(Some(result)),
        Err(e) => {
            warn!(producer = %id, key = %key, error = %e, "discarding unreadable result record");
            Ok(None)
        }
    }
}

/// Stores the context record and the result record. Only key computation
/// failures are errors; backend failures are logged.
async fn write_cached(
    id: &str,
    prefix: &str,
    resolved: &Resolved,
    ctx: &ResolveContext,
) -> ResolveResult<()> {
    let metadata = &resolved.metadata;
    let tokens: Vec<String> = metadata.contexts.iter().cloned().collect();
    let keys = ctx
        .services()
        .contexts()
        .convert_tokens_to_keys(&tokens, ctx.request())
        .map_err(|e| ResolveError::cache_key(id, e.to_string()))?;

    let result = CachedResult {
        value: resolved.value.clone(),
        metadata: metadata.clone(),
    };
    let data = match serde_json::to_value(&result) {
        Ok(data) => data,
        Err(e) => {
            warn!(producer = %id, error = %e, "result is not storable");
            return Ok(());
        }
    };

    let expire = Expire::from_max_age(metadata.max_age, ctx.request_time());
    let records = vec![
        (
            context_key(prefix),
            CacheRecord {
                data: Value::from(tokens),
                expire,
                tags: metadata.tags.clone(),
            },
        ),
        (
            result_key(prefix, &keys),
            CacheRecord {
                data,
                expire,
                tags: metadata.tags.clone(),
            },
        ),
    ];

    if let Err(e) = ctx.services().cache().set_multiple(records).await {
        warn!(producer = %id, key = %prefix, error = %e, "cache write failed");
    }
    Ok(())
}
