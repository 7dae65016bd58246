//! Query execution for Fieldwork.
//!
//! The executor walks a [`QueryPlan`] and calls one resolver per field per
//! parent value. Sibling fields and list items are joined on the current
//! task rather than spawned, so buffered loads issued by siblings land in
//! the same buffer group. Field failures become [`FieldError`]s with paths;
//! the field is nulled and its siblings keep their data.

use crate::context::{Context, ResolveContext, Services};
use crate::query::{FieldInfo, PlanNode, QueryPlan};
use crate::resolver::{ResolverArgs, ResolverInfo, ResolverMap};
use fieldwork_core::{CacheableMetadata, ResolveError};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Serve cacheable producers through the cache.
    pub caching: bool,
    /// Maximum nesting of fields with sub-selections.
    pub max_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            caching: true,
            max_depth: 32,
        }
    }
}

/// The query executor.
pub struct Executor {
    config: ExecutorConfig,
    resolvers: Arc<ResolverMap>,
    services: Services,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("resolvers", &self.resolvers)
            .finish()
    }
}

impl Executor {
    /// Creates an executor with the default configuration.
    pub fn new(resolvers: ResolverMap, services: Services) -> Self {
        Self {
            config: ExecutorConfig::default(),
            resolvers: Arc::new(resolvers),
            services,
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Gets a reference to the resolvers.
    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    /// The shared services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Executes a query plan for one request.
    pub async fn execute(&self, plan: &QueryPlan, request: Context) -> Response {
        let exec_ctx = ExecutionContext {
            resolve: ResolveContext::with_caching(request, self.services.clone(), self.config.caching),
            resolvers: &self.resolvers,
            config: &self.config,
            errors: RwLock::new(Vec::new()),
            metadata: RwLock::new(CacheableMetadata::new()),
        };

        // Root value is an empty object.
        let root_value = Value::Object(serde_json::Map::new());
        let data = execute_node(&plan.root, root_value, Vec::new(), 0, &exec_ctx).await;

        let errors = exec_ctx.errors.into_inner();
        let metadata = exec_ctx.metadata.into_inner();
        debug!(
            operation = plan.operation_name.as_deref().unwrap_or("<anonymous>"),
            errors = errors.len(),
            max_age = %metadata.max_age,
            "executed query plan"
        );

        Response {
            data: Some(data),
            errors: if errors.is_empty() { None } else { Some(errors) },
            metadata,
        }
    }
}

struct ExecutionContext<'a> {
    resolve: ResolveContext,
    resolvers: &'a ResolverMap,
    config: &'a ExecutorConfig,
    errors: RwLock<Vec<FieldError>>,
    metadata: RwLock<CacheableMetadata>,
}

impl ExecutionContext<'_> {
    async fn fail(&self, error: FieldError) {
        debug!(path = ?error.path, message = %error.message, "field failed");
        self.errors.write().await.push(error);
    }
}

/// Executes a plan node.
fn execute_node<'a>(
    node: &'a PlanNode,
    parent: Value,
    path: Vec<PathSegment>,
    depth: usize,
    ctx: &'a ExecutionContext<'a>,
) -> BoxFuture<'a, Value> {
    async move {
        match node {
            PlanNode::Sequence(nodes) => {
                let mut result = serde_json::Map::new();
                for node in nodes {
                    let value = execute_node(node, parent.clone(), path.clone(), depth, ctx).await;
                    merge_into(&mut result, value);
                }
                Value::Object(result)
            }
            PlanNode::Parallel(nodes) => {
                let values = join_all(
                    nodes
                        .iter()
                        .map(|node| execute_node(node, parent.clone(), path.clone(), depth, ctx)),
                )
                .await;
                let mut result = serde_json::Map::new();
                for value in values {
                    merge_into(&mut result, value);
                }
                Value::Object(result)
            }
            PlanNode::Field { info, children } => {
                execute_field(info, children, parent, path, depth, ctx).await
            }
            PlanNode::Leaf(info) => {
                let value = resolve_field(info, &parent, path, ctx).await;
                single(info.response_key(), value)
            }
        }
    }
    .boxed()
}

/// Executes a field with nested selections.
async fn execute_field<'a>(
    info: &'a FieldInfo,
    children: &'a PlanNode,
    parent: Value,
    path: Vec<PathSegment>,
    depth: usize,
    ctx: &'a ExecutionContext<'a>,
) -> Value {
    let mut path = path;
    if depth >= ctx.config.max_depth {
        path.push(PathSegment::Field(info.response_key().to_string()));
        ctx.fail(
            FieldError::new(format!("maximum selection depth of {} exceeded", ctx.config.max_depth))
                .with_path(path)
                .with_code("MAX_DEPTH_EXCEEDED"),
        )
        .await;
        return single(info.response_key(), Value::Null);
    }

    let field_value = resolve_field(info, &parent, path.clone(), ctx).await;
    path.push(PathSegment::Field(info.response_key().to_string()));

    let result = match field_value {
        Value::Array(items) => {
            let path = &path;
            let results = join_all(items.into_iter().enumerate().map(|(i, item)| {
                let mut child_path = path.clone();
                child_path.push(PathSegment::Index(i));
                execute_node(children, item, child_path, depth + 1, ctx)
            }))
            .await;
            Value::Array(results)
        }
        Value::Null => Value::Null,
        other => execute_node(children, other, path, depth + 1, ctx).await,
    };

    single(info.response_key(), result)
}

/// Resolves a single field, recording failures and metadata.
async fn resolve_field(
    info: &FieldInfo,
    parent: &Value,
    mut path: Vec<PathSegment>,
    ctx: &ExecutionContext<'_>,
) -> Value {
    if info.is_typename() {
        return Value::String(info.parent_type.clone());
    }

    let args = ResolverArgs::from_pairs(
        info.arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    );
    path.push(PathSegment::Field(info.response_key().to_string()));
    let resolver_info = ResolverInfo::new(&info.name, &info.parent_type).with_path(path.clone());

    let resolved = match ctx
        .resolvers
        .resolve_field(parent, &args, &ctx.resolve, &resolver_info)
    {
        Ok(deferred) => deferred.await,
        Err(e) => Err(e),
    };

    match resolved {
        Ok(resolved) => {
            ctx.metadata.write().await.add_dependency(&resolved.metadata);
            resolved.value
        }
        Err(e) => {
            ctx.fail(FieldError::from_resolve_error(&e).with_path(path)).await;
            Value::Null
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(key.to_string(), value);
    Value::Object(obj)
}

fn merge_into(target: &mut serde_json::Map<String, Value>, value: Value) {
    if let Value::Object(map) = value {
        target.extend(map);
    }
}

/// A GraphQL response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// The data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// The errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    /// Cache tags, contexts and max-age of everything in `data`.
    #[serde(skip)]
    pub metadata: CacheableMetadata,
}

impl Response {
    /// Creates a successful response with data.
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Creates an error response.
    pub fn error(error: FieldError) -> Self {
        Self {
            errors: Some(vec![error]),
            ..Self::default()
        }
    }

    /// Returns true if the response has errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }

    /// Returns true if the response has data.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// A field error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    /// The error message.
    pub message: String,
    /// The path to the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// Error extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

/// A path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Creates a field error carrying the resolution error's code.
    pub fn from_resolve_error(error: &ResolveError) -> Self {
        Self::new(error.to_string()).with_code(error.code())
    }

    /// Adds a path to the error.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", serde_json::Value::String(code.into()))
    }

    /// The error code extension, if any.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}
