//! Value trees for `response.contents`.
//!
//! A debugger adapter describes an evaluated expression as a [`ValueNode`] and renders it with
//! [`TreeBuilder`] into the nested mapping front-ends display as a tree. Keys are labels
//! (`"name (type)"` for inner nodes, `"name (type): value"` for leaves), leaves map to `0`.
//! The proxy never looks inside.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Array items rendered before the rest is summarized.
pub const ARRAY_PREVIEW_LEN: usize = 10;

/// Named structure member.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: ValueNode,
}

impl Field {
    pub fn new(name: impl Into<String>, value: ValueNode) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Debugger runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueNode {
    /// Pointer or reference. `target` is `None` for a null pointer.
    Pointer {
        type_name: String,
        address: u64,
        target: Option<Box<ValueNode>>,
    },
    Struct {
        type_name: String,
        fields: Vec<Field>,
    },
    /// `items` may hold a prefix of the array, `len` is the real length.
    Array {
        type_name: String,
        items: Vec<ValueNode>,
        len: usize,
    },
    Scalar {
        type_name: String,
        repr: String,
    },
    Str {
        type_name: String,
        value: String,
    },
    Error {
        type_name: Option<String>,
        msg: String,
    },
}

impl ValueNode {
    pub fn scalar(type_name: impl Into<String>, repr: impl ToString) -> Self {
        ValueNode::Scalar {
            type_name: type_name.into(),
            repr: repr.to_string(),
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            ValueNode::Pointer { type_name, .. }
            | ValueNode::Struct { type_name, .. }
            | ValueNode::Array { type_name, .. }
            | ValueNode::Scalar { type_name, .. }
            | ValueNode::Str { type_name, .. } => Some(type_name),
            ValueNode::Error { type_name, .. } => type_name.as_deref(),
        }
    }

    /// Label of a node named `name`.
    pub fn label(&self, name: &str) -> String {
        match self.type_name() {
            Some(type_name) => format!("{name} ({type_name})"),
            None => name.to_string(),
        }
    }

    pub fn accept<V: ValueVisitor>(&self, visit: &Visit, visitor: &mut V) -> V::Output {
        match self {
            ValueNode::Pointer {
                address, target, ..
            } => visitor.visit_pointer(visit, *address, target.as_deref()),
            ValueNode::Struct { fields, .. } => visitor.visit_struct(visit, fields),
            ValueNode::Array { items, len, .. } => visitor.visit_array(visit, items, *len),
            ValueNode::Scalar { repr, .. } => visitor.visit_scalar(visit, repr),
            ValueNode::Str { value, .. } => visitor.visit_string(visit, value),
            ValueNode::Error { msg, .. } => visitor.visit_error(visit, msg),
        }
    }
}

/// Position of a visited node: how it is labeled and the expression that reaches it.
#[derive(Debug, Clone)]
pub struct Visit {
    pub label: String,
    pub path: String,
}

impl Visit {
    fn member(&self, name: &str, node: &ValueNode) -> Visit {
        let path = if self.path.ends_with("->") {
            format!("{}{name}", self.path)
        } else {
            format!("{}.{name}", self.path)
        };
        Visit {
            label: node.label(name),
            path,
        }
    }

    fn index(&self, idx: usize, node: &ValueNode) -> Visit {
        Visit {
            label: node.label(&format!("[{idx}]")),
            path: format!("{}[{idx}]", self.path),
        }
    }
}

pub trait ValueVisitor {
    type Output;

    fn visit_pointer(
        &mut self,
        visit: &Visit,
        address: u64,
        target: Option<&ValueNode>,
    ) -> Self::Output;
    fn visit_struct(&mut self, visit: &Visit, fields: &[Field]) -> Self::Output;
    fn visit_array(&mut self, visit: &Visit, items: &[ValueNode], len: usize) -> Self::Output;
    fn visit_scalar(&mut self, visit: &Visit, repr: &str) -> Self::Output;
    fn visit_string(&mut self, visit: &Visit, value: &str) -> Self::Output;
    fn visit_error(&mut self, visit: &Visit, msg: &str) -> Self::Output;
}

/// Renders values into `(label, subtree)` entries.
///
/// Every non-null pointer address is remembered with the path that reached it first, pointing at
/// the same address again renders a reference to that path instead of descending.
#[derive(Default)]
pub struct TreeBuilder {
    seen: HashMap<u64, String>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render value named `name` as a single entry mapping.
    pub fn build(name: &str, node: &ValueNode) -> Map<String, Value> {
        let visit = Visit {
            label: node.label(name),
            path: name.to_string(),
        };
        let (key, value) = node.accept(&visit, &mut TreeBuilder::new());
        let mut tree = Map::new();
        tree.insert(key, value);
        tree
    }

    /// Render several named values (e.g. frame locals) into one mapping.
    pub fn build_all<'a>(
        values: impl IntoIterator<Item = (&'a str, &'a ValueNode)>,
    ) -> Map<String, Value> {
        let mut builder = TreeBuilder::new();
        values
            .into_iter()
            .map(|(name, node)| {
                let visit = Visit {
                    label: node.label(name),
                    path: name.to_string(),
                };
                node.accept(&visit, &mut builder)
            })
            .collect()
    }

    fn leaf(label: String) -> (String, Value) {
        (label, Value::from(0))
    }
}

impl ValueVisitor for TreeBuilder {
    type Output = (String, Value);

    fn visit_pointer(
        &mut self,
        visit: &Visit,
        address: u64,
        target: Option<&ValueNode>,
    ) -> Self::Output {
        let Some(target) = target.filter(|_| address != 0) else {
            return Self::leaf(format!("{}: nullptr", visit.label));
        };

        if let Some(first) = self.seen.get(&address) {
            return Self::leaf(format!("{} @{address:#x}: -> {first}", visit.label));
        }
        self.seen.insert(address, visit.path.clone());

        let target_visit = Visit {
            label: format!("{} @{address:#x}", visit.label),
            path: format!("{}->", visit.path),
        };
        target.accept(&target_visit, self)
    }

    fn visit_struct(&mut self, visit: &Visit, fields: &[Field]) -> Self::Output {
        let children = fields
            .iter()
            .map(|field| field.value.accept(&visit.member(&field.name, &field.value), self))
            .collect::<Map<_, _>>();
        (visit.label.clone(), Value::Object(children))
    }

    fn visit_array(&mut self, visit: &Visit, items: &[ValueNode], len: usize) -> Self::Output {
        let mut children = items
            .iter()
            .take(ARRAY_PREVIEW_LEN)
            .enumerate()
            .map(|(idx, item)| item.accept(&visit.index(idx, item), self))
            .collect::<Map<_, _>>();
        let shown = items.len().min(ARRAY_PREVIEW_LEN);
        if len > shown {
            children.insert(format!("And {} more...", len - shown), Value::from(0));
        }
        (visit.label.clone(), Value::Object(children))
    }

    fn visit_scalar(&mut self, visit: &Visit, repr: &str) -> Self::Output {
        Self::leaf(format!("{}: {repr}", visit.label))
    }

    fn visit_string(&mut self, visit: &Visit, value: &str) -> Self::Output {
        Self::leaf(format!("{}: \"{}\"", visit.label, value.escape_default()))
    }

    fn visit_error(&mut self, visit: &Visit, msg: &str) -> Self::Output {
        let mut children = Map::new();
        children.insert(msg.to_string(), Value::from(0));
        (visit.label.clone(), Value::Object(children))
    }
}
