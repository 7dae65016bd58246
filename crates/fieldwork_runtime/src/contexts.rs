//! Cache contexts: dynamic axes a cached value varies by.
//!
//! A token is a context name with an optional parameter after a colon, e.g.
//! `user.roles` or `languages:language_interface`. Converting tokens yields
//! the concrete values for the current request.

use crate::context::Context;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Concrete context values, keyed by token.
///
/// Values keep their JSON type, so `1` and `"1"` are different keys.
pub type ContextKeys = BTreeMap<String, Value>;

/// Failure to resolve a cache context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The context name is not registered.
    #[error("unknown cache context '{0}'")]
    Unknown(String),

    /// The context exists but has no value for this request.
    #[error("cache context '{token}' could not be resolved: {message}")]
    Unresolvable { token: String, message: String },
}

/// Maps cache context tokens to their current concrete values.
pub trait CacheContextsManager: Send + Sync {
    fn convert_tokens_to_keys(
        &self,
        tokens: &[String],
        request: &Context,
    ) -> Result<ContextKeys, ContextError>;
}

/// Computes the value of one context; receives the token parameter.
pub type ContextValueFn =
    Arc<dyn Fn(Option<&str>, &Context) -> Result<Value, ContextError> + Send + Sync>;

/// Contexts whose values come from request data.
///
/// A registered name without a custom function reads `request.data[name]`;
/// with a parameter it reads the parameter's entry of that object.
#[derive(Clone, Default)]
pub struct RequestContextsManager {
    contexts: FxHashMap<String, Option<ContextValueFn>>,
}

impl RequestContextsManager {
    /// Creates a manager with no contexts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with the usual request contexts.
    pub fn with_defaults() -> Self {
        [
            "user",
            "user.roles",
            "user.permissions",
            "languages",
            "url.query_args",
            "timezone",
        ]
        .into_iter()
        .fold(Self::new(), |manager, name| manager.with_context(name))
    }

    /// Registers a context read from request data.
    #[must_use]
    pub fn with_context(mut self, name: impl Into<String>) -> Self {
        self.contexts.insert(name.into(), None);
        self
    }

    /// Registers a context computed by a function.
    #[must_use]
    pub fn with_context_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&str>, &Context) -> Result<Value, ContextError> + Send + Sync + 'static,
    {
        self.contexts.insert(name.into(), Some(Arc::new(f)));
        self
    }

    /// Returns true if the context name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    fn resolve_token(&self, token: &str, request: &Context) -> Result<Value, ContextError> {
        let (name, parameter) = match token.split_once(':') {
            Some((name, parameter)) => (name, Some(parameter)),
            None => (token, None),
        };

        match self.contexts.get(name) {
            None => Err(ContextError::Unknown(token.to_string())),
            Some(Some(f)) => f(parameter, request),
            Some(None) => {
                let value = request.data.get(name);
                let value = match (value, parameter) {
                    (Some(Value::Object(map)), Some(parameter)) => map.get(parameter),
                    (value, None) => value,
                    (Some(_), Some(_)) => {
                        return Err(ContextError::Unresolvable {
                            token: token.to_string(),
                            message: format!("request data '{}' is not an object", name),
                        })
                    }
                    (None, Some(_)) => None,
                };
                Ok(value.cloned().unwrap_or(Value::Null))
            }
        }
    }
}

impl CacheContextsManager for RequestContextsManager {
    fn convert_tokens_to_keys(
        &self,
        tokens: &[String],
        request: &Context,
    ) -> Result<ContextKeys, ContextError> {
        tokens
            .iter()
            .map(|token| Ok((token.clone(), self.resolve_token(token, request)?)))
            .collect()
    }
}

impl fmt::Debug for RequestContextsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.contexts.keys().collect();
        names.sort();
        f.debug_struct("RequestContextsManager")
            .field("contexts", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_reads_request_data() {
        let manager = RequestContextsManager::with_defaults();
        let request = Context::new()
            .with("user.roles", vec!["editor", "authenticated"])
            .with("languages", json!({"language_interface": "fr"}));

        let keys = manager
            .convert_tokens_to_keys(
                &tokens(&["user.roles", "languages:language_interface"]),
                &request,
            )
            .unwrap();

        assert_eq!(keys["user.roles"], json!(["editor", "authenticated"]));
        assert_eq!(keys["languages:language_interface"], json!("fr"));
    }

    #[test]
    fn test_missing_value_is_null() {
        let manager = RequestContextsManager::with_defaults();
        let keys = manager
            .convert_tokens_to_keys(&tokens(&["timezone"]), &Context::new())
            .unwrap();
        assert_eq!(keys["timezone"], Value::Null);
    }

    #[test]
    fn test_unknown_context_fails() {
        let manager = RequestContextsManager::new();
        let err = manager
            .convert_tokens_to_keys(&tokens(&["session"]), &Context::new())
            .unwrap_err();
        assert_eq!(err, ContextError::Unknown("session".into()));
    }

    #[test]
    fn test_custom_context_fn() {
        let manager = RequestContextsManager::new().with_context_fn("url.site", |_, _| {
            Ok(Value::from("https://example.com"))
        });
        let keys = manager
            .convert_tokens_to_keys(&tokens(&["url.site"]), &Context::new())
            .unwrap();
        assert_eq!(keys["url.site"], json!("https://example.com"));
    }

    #[test]
    fn test_values_keep_their_json_type() {
        let manager = RequestContextsManager::with_defaults();
        let convert = |value: Value| {
            manager
                .convert_tokens_to_keys(&tokens(&["user.roles"]), &Context::new().with("user.roles", value))
                .unwrap()
        };

        assert_ne!(convert(Value::Null), convert(json!("null")));
        assert_ne!(convert(json!(1)), convert(json!("1")));
        assert_eq!(convert(json!("1")), convert(json!("1")));
    }
}
