//! Selection plans handed to the executor.
//!
//! Plans are built ahead of execution, either in code or from JSON:
//!
//! ```json
//! {"root": {"parallel": [
//!   {"field": {"info": {"name": "node", "parent_type": "Query", "arguments": {"id": 1}},
//!              "children": {"leaf": {"name": "label", "parent_type": "Node"}}}}
//! ]}}
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A planned selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    /// The root node of the plan.
    pub root: PlanNode,
    /// The operation name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl QueryPlan {
    /// Creates an anonymous plan.
    pub fn new(root: PlanNode) -> Self {
        Self {
            root,
            operation_name: None,
        }
    }

    /// Parses a plan from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A node in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanNode {
    /// Executed one after another; results merged in order.
    Sequence(Vec<PlanNode>),
    /// Executed concurrently; results merged in order.
    Parallel(Vec<PlanNode>),
    /// A field with a sub-selection, executed per resolved item.
    Field {
        info: FieldInfo,
        children: Box<PlanNode>,
    },
    /// A field without a sub-selection.
    Leaf(FieldInfo),
}

impl PlanNode {
    /// A leaf field.
    pub fn leaf(info: FieldInfo) -> Self {
        PlanNode::Leaf(info)
    }

    /// A field with children.
    pub fn field(info: FieldInfo, children: PlanNode) -> Self {
        PlanNode::Field {
            info,
            children: Box::new(children),
        }
    }

    /// Concurrent children.
    pub fn parallel(nodes: impl IntoIterator<Item = PlanNode>) -> Self {
        PlanNode::Parallel(nodes.into_iter().collect())
    }
}

/// A field to resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    /// The field name.
    pub name: String,
    /// The alias, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// The type the field is defined on.
    pub parent_type: String,
    /// Argument values.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub arguments: IndexMap<String, Value>,
}

impl FieldInfo {
    /// Creates field info without arguments.
    pub fn new(name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            parent_type: parent_type.into(),
            arguments: IndexMap::new(),
        }
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// The key of the field in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Returns true for `__typename`.
    pub fn is_typename(&self) -> bool {
        self.name == "__typename"
    }
}
