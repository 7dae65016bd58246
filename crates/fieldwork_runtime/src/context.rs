//! Request and resolution contexts.

use crate::buffer::{BatchLoader, Buffer};
use crate::cache::{CacheBackend, Clock, MemoryCacheBackend, SystemClock};
use crate::contexts::{CacheContextsManager, RequestContextsManager};
use crate::producer::ProducerRegistry;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Request-scoped data.
#[derive(Debug, Clone)]
pub struct Context {
    /// Request-scoped data, also the source of cache context values.
    pub data: HashMap<String, serde_json::Value>,
    /// Variables from the request.
    pub variables: HashMap<String, serde_json::Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new context.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    /// Creates a context with variables.
    pub fn with_variables(variables: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: HashMap::new(),
            variables,
        }
    }

    /// Sets a value in the context.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn with<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Gets a value from the context.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a variable by name.
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }
}

/// The collaborators a resolution needs, built once at startup.
///
/// Nothing here is request-scoped; buffers live on [`ResolveContext`].
#[derive(Clone)]
pub struct Services {
    producers: Arc<ProducerRegistry>,
    cache: Arc<dyn CacheBackend>,
    contexts: Arc<dyn CacheContextsManager>,
    clock: Arc<dyn Clock>,
    /// The cache is the in-memory default and follows the clock.
    default_cache: bool,
}

impl Services {
    /// Creates services backed by an in-memory cache and the default
    /// request-data cache contexts.
    pub fn new(producers: ProducerRegistry) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            producers: Arc::new(producers),
            cache: Arc::new(MemoryCacheBackend::with_clock(Arc::clone(&clock))),
            contexts: Arc::new(RequestContextsManager::with_defaults()),
            clock,
            default_cache: true,
        }
    }

    /// Replaces the cache backend.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = cache;
        self.default_cache = false;
        self
    }

    /// Replaces the cache contexts manager.
    #[must_use]
    pub fn with_contexts(mut self, contexts: Arc<dyn CacheContextsManager>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Replaces the clock used for request time.
    ///
    /// The default in-memory cache is rebuilt on the same clock so expiry
    /// and request time agree. A cache set with [`with_cache`](Self::with_cache)
    /// keeps its own notion of time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if self.default_cache {
            self.cache = Arc::new(MemoryCacheBackend::with_clock(Arc::clone(&clock)));
        }
        self.clock = clock;
        self
    }

    /// The producer registry.
    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    /// The cache backend.
    pub fn cache(&self) -> &dyn CacheBackend {
        self.cache.as_ref()
    }

    /// The cache contexts manager.
    pub fn contexts(&self) -> &dyn CacheContextsManager {
        self.contexts.as_ref()
    }

    /// The clock.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("producers", &self.producers)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Everything a resolver sees besides its parent value and arguments.
///
/// Cheap to clone; deferred resolutions keep their own handle. Clones share
/// the request's buffers, so loads batch within one request and never
/// across requests.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    inner: Arc<ResolveContextInner>,
}

type BufferMap = FxHashMap<&'static str, Arc<dyn Any + Send + Sync>>;

#[derive(Debug)]
struct ResolveContextInner {
    request: Context,
    services: Services,
    caching: bool,
    request_time: u64,
    buffers: Mutex<BufferMap>,
}

impl ResolveContext {
    /// Creates a resolve context with caching enabled.
    ///
    /// The request time is read once from the services clock so every cache
    /// write of the request shares the same expiry base.
    pub fn new(request: Context, services: Services) -> Self {
        Self::with_caching(request, services, true)
    }

    /// Creates a resolve context with caching switched on or off.
    pub fn with_caching(request: Context, services: Services, caching: bool) -> Self {
        let request_time = services.clock().now();
        Self {
            inner: Arc::new(ResolveContextInner {
                request,
                services,
                caching,
                request_time,
                buffers: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// The request context.
    pub fn request(&self) -> &Context {
        &self.inner.request
    }

    /// The shared services.
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Whether producer result caching is enabled for this request.
    pub fn caching(&self) -> bool {
        self.inner.caching
    }

    /// Request start, in unix seconds.
    pub fn request_time(&self) -> u64 {
        self.inner.request_time
    }

    /// The request's buffer named `name`, created on first use.
    pub fn buffer<L: BatchLoader>(
        &self,
        name: &'static str,
        create: impl FnOnce() -> Buffer<L>,
    ) -> Arc<Buffer<L>> {
        let mut buffers = self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(buffer) = buffers.get(name) {
            if let Ok(buffer) = Arc::clone(buffer).downcast::<Buffer<L>>() {
                return buffer;
            }
        }
        let buffer = Arc::new(create());
        buffers.insert(name, Arc::clone(&buffer) as Arc<dyn Any + Send + Sync>);
        buffer
    }
}
