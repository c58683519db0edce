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

//! Host services consulted during a transform.
//!
//! Every call is synchronous. Hosts that talk to remote servers block inside
//! the call.

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::{FhirMapError, Result, TranslationFailure};
use crate::model::{FhirPathValue, Node};

/// A system/code pair with optional display text
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coding {
    /// Code system URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Display text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    /// Coding with a system and a code
    pub fn new(system: Option<&str>, code: &str) -> Self {
        Self {
            system: system.map(str::to_string),
            code: Some(code.to_string()),
            display: None,
        }
    }

    /// Read a `Coding` element
    pub fn from_node(node: &Node) -> Self {
        let text = |name: &str| node.child(name).and_then(|c| c.value()).and_then(|v| v.as_string());
        Self {
            system: text("system"),
            code: text("code"),
            display: text("display"),
        }
    }

    /// Build a `Coding` element
    pub fn to_node(&self) -> Node {
        let node = Node::new("Coding");
        for (name, type_name, value) in [
            ("system", "uri", &self.system),
            ("code", "code", &self.code),
            ("display", "string", &self.display),
        ] {
            if let Some(value) = value {
                node.set_child(name, Node::primitive(type_name, FhirPathValue::string(value)));
            }
        }
        node
    }
}

/// One entry of a value set expansion
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpansionEntry {
    /// Code system URL
    pub system: Option<String>,
    /// Code
    pub code: Option<String>,
    /// Display text
    pub display: Option<String>,
}

/// Terminology operations used by the `c` and `cc` transforms
pub trait TerminologyService: Send + Sync {
    /// Display text for a valid code, `None` when unknown or invalid
    fn validate_code(&self, system: &str, code: &str) -> Result<Option<String>>;

    /// Expansion of a value set, `None` when `url` is not a value set
    fn expand_value_set(&self, url: &str) -> Result<Option<Vec<ExpansionEntry>>>;
}

/// Callbacks a host can supply to a transform
pub trait TransformerServices: Send + Sync {
    /// Message produced by a `log` clause
    fn log(&self, message: &str) {
        info!("{message}");
    }

    /// Empty instance of a type
    fn create_type(&self, type_name: &str) -> Result<Node> {
        Ok(Node::new(type_name))
    }

    /// Hook called with every resource created by a rule; `at_root` is true
    /// for rules of the entry group
    fn create_resource(&self, resource: Node, _at_root: bool) -> Result<Node> {
        Ok(resource)
    }

    /// Translation through a concept map the engine could not find
    fn translate(&self, _source: &Coding, concept_map_url: &str) -> Result<Option<Coding>> {
        Err(FhirMapError::translation(
            TranslationFailure::NoConceptMap,
            format!("No map found for {concept_map_url}"),
        ))
    }

    /// Resource behind a reference URL
    fn resolve_reference(&self, _url: &str) -> Result<Option<Node>> {
        Ok(None)
    }

    /// Run a search produced by a `search(...)` source
    fn perform_search(&self, query: &str) -> Result<Vec<Node>> {
        Err(FhirMapError::semantic(format!(
            "Search is not supported by this host: {query}"
        )))
    }
}

/// Services with every default behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultServices;

impl TransformerServices for DefaultServices {}
