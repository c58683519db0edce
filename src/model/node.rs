// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Mutable, shared element trees.
//!
//! Mapping execution reads from a source tree and writes into a target tree
//! while several variables may point at the same element. A [`Node`] is
//! therefore a cheap handle to a lock-protected element; cloning the handle
//! shares the element.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::provider::StructureProvider;
use super::value::FhirPathValue;
use crate::core::{FhirMapError, Result};

#[derive(Debug, Clone, Default)]
struct Element {
    type_name: String,
    value: Option<FhirPathValue>,
    children: IndexMap<String, Vec<Node>>,
}

/// Shared handle to an element of a host tree
#[derive(Clone)]
pub struct Node {
    inner: Arc<RwLock<Element>>,
}

impl Node {
    /// Empty element of the given type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Element {
                type_name: type_name.into(),
                ..Default::default()
            })),
        }
    }

    /// Element holding a primitive value
    pub fn primitive(type_name: impl Into<String>, value: FhirPathValue) -> Self {
        let node = Self::new(type_name);
        node.set_value(value);
        node
    }

    /// Type name of the element
    pub fn type_name(&self) -> String {
        self.inner.read().type_name.clone()
    }

    /// Primitive value, if any
    pub fn value(&self) -> Option<FhirPathValue> {
        self.inner.read().value.clone()
    }

    /// True when the element holds a primitive value
    pub fn has_value(&self) -> bool {
        self.inner.read().value.is_some()
    }

    /// Replace the primitive value
    pub fn set_value(&self, value: FhirPathValue) {
        self.inner.write().value = Some(value);
    }

    /// Children stored under `name`
    pub fn children(&self, name: &str) -> Vec<Node> {
        self.inner
            .read()
            .children
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// First child stored under `name`
    pub fn child(&self, name: &str) -> Option<Node> {
        self.inner
            .read()
            .children
            .get(name)
            .and_then(|c| c.first().cloned())
    }

    /// Names of populated children, in insertion order
    pub fn child_names(&self) -> Vec<String> {
        self.inner.read().children.keys().cloned().collect()
    }

    /// Every child with the name it is stored under
    pub fn all_children(&self) -> Vec<(String, Node)> {
        let element = self.inner.read();
        element
            .children
            .iter()
            .flat_map(|(name, nodes)| nodes.iter().map(move |n| (name.clone(), n.clone())))
            .collect()
    }

    /// True when the element has any child
    pub fn has_children(&self) -> bool {
        self.inner.read().children.values().any(|c| !c.is_empty())
    }

    /// Append a child under `name`
    pub fn add_child(&self, name: &str, child: Node) {
        self.inner
            .write()
            .children
            .entry(name.to_string())
            .or_default()
            .push(child);
    }

    /// Replace every child under `name` with `child`
    pub fn set_child(&self, name: &str, child: Node) {
        self.inner
            .write()
            .children
            .insert(name.to_string(), vec![child]);
    }

    /// Logical id held in the `id` child
    pub fn id(&self) -> Option<String> {
        self.child("id")
            .and_then(|n| n.value())
            .and_then(|v| v.as_string())
    }

    /// Set the logical id
    pub fn set_id(&self, id: &str) {
        self.set_child("id", Node::primitive("id", FhirPathValue::string(id)));
    }

    /// True if both handles share the same element
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Content equality, ignoring child order across different names
    pub fn deep_eq(&self, other: &Node) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (a, b) = (self.inner.read(), other.inner.read());
        a.type_name == b.type_name
            && a.value == b.value
            && a.children.len() == b.children.len()
            && a.children.iter().all(|(name, left)| {
                b.children.get(name).is_some_and(|right| {
                    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.deep_eq(r))
                })
            })
    }

    /// Independent copy of the whole subtree
    pub fn deep_copy(&self) -> Node {
        let element = self.inner.read();
        let copy = Node::new(element.type_name.clone());
        {
            let mut target = copy.inner.write();
            target.value = element.value.clone();
            for (name, nodes) in &element.children {
                target
                    .children
                    .insert(name.clone(), nodes.iter().map(Node::deep_copy).collect());
            }
        }
        copy
    }

    /// Read a FHIR JSON document.
    ///
    /// The root type comes from `resourceType` or, failing that, from
    /// `type_name`. Child types come from `provider` when it knows the
    /// element, otherwise they are inferred from the JSON shape.
    pub fn from_json(
        value: &Value,
        type_name: Option<&str>,
        provider: Option<&dyn StructureProvider>,
    ) -> Result<Node> {
        match value {
            Value::Object(map) => {
                let type_name = map
                    .get("resourceType")
                    .and_then(Value::as_str)
                    .or(type_name)
                    .ok_or_else(|| {
                        FhirMapError::semantic("Unable to determine the type of a JSON object")
                    })?;
                Ok(Self::object_from_json(map, type_name, provider))
            }
            Value::Array(_) | Value::Null => Err(FhirMapError::semantic(
                "A JSON array or null cannot be read as a single element",
            )),
            scalar => {
                let type_name = type_name.unwrap_or_else(|| inferred_type(scalar));
                let primitive = FhirPathValue::from_json_scalar(scalar, type_name)
                    .ok_or_else(|| FhirMapError::semantic("Unsupported JSON scalar"))?;
                Ok(Node::primitive(type_name, primitive))
            }
        }
    }

    fn object_from_json(
        map: &Map<String, Value>,
        type_name: &str,
        provider: Option<&dyn StructureProvider>,
    ) -> Node {
        let node = Node::new(type_name);
        for (key, value) in map {
            if key == "resourceType" || key.starts_with('_') {
                continue;
            }
            let declared = provider.and_then(|p| p.element_type(type_name, key));
            let items: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for item in items {
                let child = match item {
                    Value::Object(child) => {
                        let child_type = child
                            .get("resourceType")
                            .and_then(Value::as_str)
                            .or(declared.as_deref())
                            .unwrap_or("BackboneElement");
                        Some(Self::object_from_json(child, child_type, provider))
                    }
                    Value::Null | Value::Array(_) => None,
                    scalar => {
                        let child_type = declared.as_deref().unwrap_or_else(|| inferred_type(scalar));
                        FhirPathValue::from_json_scalar(scalar, child_type)
                            .map(|v| Node::primitive(child_type, v))
                    }
                };
                if let Some(child) = child {
                    node.add_child(key, child);
                }
            }
        }
        node
    }

    /// Write the tree as FHIR JSON.
    ///
    /// The root carries `resourceType`; nested resources carry it when the
    /// provider marks their type as a resource. A single child is written
    /// as a scalar unless the provider declares the element repeating.
    pub fn to_json(&self, provider: Option<&dyn StructureProvider>) -> Value {
        self.to_json_inner(provider, true)
    }

    fn to_json_inner(&self, provider: Option<&dyn StructureProvider>, root: bool) -> Value {
        let element = self.inner.read();
        if element.children.is_empty() {
            if let Some(value) = &element.value {
                return value.to_json();
            }
        }
        let mut map = Map::new();
        let is_resource = provider.is_some_and(|p| p.is_resource(&element.type_name));
        if root || is_resource {
            map.insert(
                "resourceType".to_string(),
                Value::String(element.type_name.clone()),
            );
        }
        if let Some(value) = &element.value {
            map.insert("value".to_string(), value.to_json());
        }
        for (name, nodes) in &element.children {
            if nodes.is_empty() {
                continue;
            }
            let repeating = provider
                .and_then(|p| p.element(&element.type_name, name))
                .map(|info| info.is_repeating())
                .unwrap_or(nodes.len() > 1);
            let mut values = nodes.iter().map(|n| n.to_json_inner(provider, false));
            let json = if repeating || nodes.len() > 1 {
                Value::Array(values.collect())
            } else {
                values.next().unwrap_or(Value::Null)
            };
            map.insert(name.clone(), json);
        }
        Value::Object(map)
    }
}

fn inferred_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(_) => "decimal",
        _ => "string",
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let element = self.inner.read();
        let mut s = f.debug_struct("Node");
        s.field("type", &element.type_name);
        if let Some(value) = &element.value {
            s.field("value", value);
        }
        for (name, nodes) in &element.children {
            s.field(name, nodes);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_without_provider() {
        let doc = json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "name": [{"family": "Chalmers", "given": ["Peter", "James"]}]
        });
        let node = Node::from_json(&doc, None, None).unwrap();
        assert_eq!(node.type_name(), "Patient");
        assert_eq!(node.id().as_deref(), Some("p1"));
        let name = node.child("name").unwrap();
        assert_eq!(name.children("given").len(), 2);
        assert_eq!(
            node.to_json(None),
            json!({
                "resourceType": "Patient",
                "id": "p1",
                "active": true,
                "name": {"family": "Chalmers", "given": ["Peter", "James"]}
            })
        );
    }

    #[test]
    fn handles_share_elements() {
        let a = Node::new("HumanName");
        let b = a.clone();
        b.add_child("family", Node::primitive("string", FhirPathValue::string("x")));
        assert!(a.has_children());
        assert!(a.ptr_eq(&b));
        let c = a.deep_copy();
        assert!(!c.ptr_eq(&a));
        assert!(c.deep_eq(&a));
    }

    #[test]
    fn object_without_type_is_rejected() {
        assert!(Node::from_json(&json!({"a": 1}), None, None).is_err());
        assert!(Node::from_json(&json!({"a": 1}), Some("Thing"), None).is_ok());
    }
}
