//! Runtime for Fieldwork.
//!
//! This crate provides deferred, cache-aware field resolution:
//! - `proxy`: Data producer proxies (slot resolution, field caching)
//! - `producer`: Producer definitions, instances and the registry
//! - `producers`: Built-in producers
//! - `buffer`: Lazily flushed batch buffers
//! - `entity`: Entity model, storage and the entity buffer
//! - `cache`, `cache_key`, `contexts`: Cache backends, keys and cache contexts
//! - `resolver`: Resolver expressions and per-field registration
//! - `schema`: JSON resolver configuration
//! - `query`: Selection plans
//! - `executor`: Query execution

pub mod buffer;
pub mod cache;
pub mod cache_key;
pub mod context;
pub mod contexts;
pub mod entity;
pub mod executor;
pub mod producer;
pub mod producers;
pub mod proxy;
pub mod query;
pub mod resolver;
pub mod schema;

pub use buffer::{BatchLoader, Buffer};
pub use cache::{
    CacheBackend, CacheError, CacheRecord, Clock, Expire, ManualClock, MemoryCacheBackend,
    SystemClock,
};
pub use context::{Context, ResolveContext, Services};
pub use contexts::{CacheContextsManager, ContextError, ContextKeys, RequestContextsManager};
pub use entity::{
    Entity, EntityBuffer, EntityId, EntityIds, EntityLoad, EntityStorage, MemoryEntityStorage,
    StorageError,
};
pub use executor::{Executor, ExecutorConfig, FieldError, PathSegment, Response};
pub use producer::{
    DataProducer, ProducerDefinition, ProducerInputs, ProducerRegistry, SlotDefinition, SlotKind,
};
pub use proxy::DataProducerProxy;
pub use query::{FieldInfo, PlanNode, QueryPlan};
pub use resolver::{Resolved, Resolver, ResolverArgs, ResolverInfo, ResolverMap};
pub use schema::{parse_resolver, SchemaConfig};
