//! Resolver expressions and per-field resolver registration.
//!
//! A [`Resolver`] describes where a value comes from: a constant, the parent
//! value, an argument, request data, a data producer, or a chain of those.
//! Resolving one yields a [`Deferred`] of the value and the cacheable
//! metadata it depends on.

use crate::context::ResolveContext;
use crate::executor::PathSegment;
use crate::proxy::DataProducerProxy;
use fieldwork_core::{CacheableMetadata, Deferred, ResolveError, ResolveResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    args: HashMap<String, Value>,
}

impl ResolverArgs {
    /// Creates new resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> ResolveResult<T> {
        let value = self.args.get(name).ok_or_else(|| ResolveError::Argument {
            name: name.to_string(),
            message: "missing required argument".to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| ResolveError::Argument {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Returns all arguments.
    pub fn all(&self) -> &HashMap<String, Value> {
        &self.args
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    /// The field name being resolved.
    pub field_name: String,

    /// The parent type name.
    pub parent_type: String,

    /// Path to this field.
    pub path: Vec<PathSegment>,
}

impl ResolverInfo {
    /// Creates new resolver info.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            parent_type: parent_type.into(),
            path: Vec::new(),
        }
    }

    /// Sets the path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// The `Type.field` key of this field.
    pub fn field_key(&self) -> String {
        format!("{}.{}", self.parent_type, self.field_name)
    }
}

/// A resolved value together with what it depends on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolved {
    pub value: Value,
    pub metadata: CacheableMetadata,
}

impl Resolved {
    /// A value with no dependencies.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            metadata: CacheableMetadata::new(),
        }
    }

    /// A value with the given metadata.
    pub fn with_metadata(value: Value, metadata: CacheableMetadata) -> Self {
        Self { value, metadata }
    }
}

/// A resolver expression.
#[derive(Debug, Clone)]
pub enum Resolver {
    /// A constant.
    Value(Value),
    /// The parent value.
    Parent,
    /// A property of the parent value, by path.
    ParentProperty(Vec<String>),
    /// A field argument; `null` if absent.
    Argument(String),
    /// A value from request data; `null` if absent.
    Context(String),
    /// The output of a data producer.
    Produce(DataProducerProxy),
    /// Each step resolves against the previous step's value as parent.
    Compose(Vec<Resolver>),
}

impl Resolver {
    /// A constant.
    pub fn value(value: impl Into<Value>) -> Self {
        Resolver::Value(value.into())
    }

    /// A parent property; dots separate path segments.
    pub fn parent_property(path: &str) -> Self {
        Resolver::ParentProperty(path.split('.').map(str::to_string).collect())
    }

    /// A field argument.
    pub fn argument(name: impl Into<String>) -> Self {
        Resolver::Argument(name.into())
    }

    /// A request data value.
    pub fn context(name: impl Into<String>) -> Self {
        Resolver::Context(name.into())
    }

    /// A data producer.
    pub fn produce(id: impl Into<String>) -> DataProducerProxy {
        DataProducerProxy::new(id)
    }

    /// A chain of resolvers.
    pub fn compose(steps: impl IntoIterator<Item = Resolver>) -> Self {
        Resolver::Compose(steps.into_iter().collect())
    }

    /// Resolves the expression.
    ///
    /// Configuration errors anywhere in the expression are returned
    /// immediately; everything else surfaces through the deferred.
    pub fn resolve(
        &self,
        parent: &Value,
        args: &ResolverArgs,
        ctx: &ResolveContext,
    ) -> ResolveResult<Deferred<Resolved>> {
        let value = match self {
            Resolver::Value(value) => value.clone(),
            Resolver::Parent => parent.clone(),
            Resolver::ParentProperty(path) => path
                .iter()
                .try_fold(parent, |current, segment| property(current, segment))
                .cloned()
                .unwrap_or(Value::Null),
            Resolver::Argument(name) => args.get(name).cloned().unwrap_or(Value::Null),
            Resolver::Context(name) => ctx.request().data.get(name).cloned().unwrap_or(Value::Null),
            Resolver::Produce(proxy) => return proxy.resolve(parent, args, ctx),
            Resolver::Compose(steps) => return compose(steps, parent, args, ctx),
        };
        Ok(Deferred::ready(Resolved::new(value)))
    }
}

impl From<DataProducerProxy> for Resolver {
    fn from(proxy: DataProducerProxy) -> Self {
        Resolver::Produce(proxy)
    }
}

fn property<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn compose(
    steps: &[Resolver],
    parent: &Value,
    args: &ResolverArgs,
    ctx: &ResolveContext,
) -> ResolveResult<Deferred<Resolved>> {
    let Some((first, rest)) = steps.split_first() else {
        return Ok(Deferred::ready(Resolved::new(parent.clone())));
    };

    let registry = ctx.services().producers();
    for step in rest {
        registry.validate(step)?;
    }

    let first = first.resolve(parent, args, ctx)?;
    let rest = rest.to_vec();
    let args = args.clone();
    let ctx = ctx.clone();

    Ok(Deferred::new(async move {
        let mut current = first.await?;
        for step in &rest {
            let next = step.resolve(&current.value, &args, &ctx)?.await?;
            current = Resolved::with_metadata(next.value, current.metadata.merge(&next.metadata));
        }
        Ok(current)
    }))
}

/// Resolvers indexed by `Type.field`.
///
/// Fields without a registered resolver read the property of the same name
/// from the parent object, falling back to its snake_case form.
#[derive(Default)]
pub struct ResolverMap {
    resolvers: HashMap<String, Resolver>,
}

impl ResolverMap {
    /// Creates an empty resolver map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for a specific type and field.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: impl Into<Resolver>,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, resolver.into());
    }

    /// Gets the registered resolver for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&Resolver> {
        self.resolvers.get(&format!("{}.{}", type_name, field_name))
    }

    /// Iterates over registered `Type.field` keys and resolvers.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Resolver)> {
        self.resolvers.iter()
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Returns true if no resolver is registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Resolves one field of one parent.
    pub fn resolve_field(
        &self,
        parent: &Value,
        args: &ResolverArgs,
        ctx: &ResolveContext,
        info: &ResolverInfo,
    ) -> ResolveResult<Deferred<Resolved>> {
        match self.get(&info.parent_type, &info.field_name) {
            Some(resolver) => resolver.resolve(parent, args, ctx),
            None => Ok(Deferred::ready(Resolved::new(default_property(
                parent,
                &info.field_name,
            )))),
        }
    }
}

impl Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .finish()
    }
}

fn default_property(parent: &Value, field_name: &str) -> Value {
    let Value::Object(map) = parent else {
        return Value::Null;
    };
    map.get(field_name)
        .or_else(|| map.get(&to_snake_case(field_name)))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
