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

//! Structure definitions consumed by mapping execution and analysis.
//!
//! The engine never hard-codes FHIR. Everything it needs to know about
//! types and their elements comes through [`StructureProvider`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical base for core structure definitions
pub const FHIR_STRUCTURE_BASE: &str = "http://hl7.org/fhir/StructureDefinition/";

/// Type names treated as primitive when no provider information exists
const PRIMITIVE_TYPES: &[&str] = &[
    "boolean",
    "integer",
    "integer64",
    "decimal",
    "string",
    "code",
    "id",
    "uri",
    "url",
    "canonical",
    "oid",
    "uuid",
    "markdown",
    "base64Binary",
    "date",
    "dateTime",
    "instant",
    "time",
    "positiveInt",
    "unsignedInt",
];

/// Category of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TypeKind {
    /// Primitive data type
    PrimitiveType,
    /// Complex data type
    ComplexType,
    /// Resource
    Resource,
    /// Logical model
    Logical,
}

/// One element of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Element name; choice elements end in `[x]`
    pub name: String,
    /// Minimum cardinality
    #[serde(default)]
    pub min: u32,
    /// Maximum cardinality, `None` for unbounded
    #[serde(default)]
    pub max: Option<u32>,
    /// Allowed type names
    pub types: Vec<String>,
    /// Value set bound to the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

impl ElementInfo {
    /// Create an element definition
    pub fn new(name: &str, min: u32, max: Option<u32>, types: &[&str]) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            types: types.iter().map(|t| t.to_string()).collect(),
            binding: None,
        }
    }

    /// True for `name[x]` elements
    pub fn is_choice(&self) -> bool {
        self.name.ends_with("[x]")
    }

    /// Name without the `[x]` suffix
    pub fn base_name(&self) -> &str {
        self.name.strip_suffix("[x]").unwrap_or(&self.name)
    }

    /// True when more than one occurrence is allowed
    pub fn is_repeating(&self) -> bool {
        self.max != Some(1)
    }

    /// Maximum cardinality as written in definitions
    pub fn max_text(&self) -> String {
        match self.max {
            Some(n) => n.to_string(),
            None => "*".to_string(),
        }
    }

    /// Single declared type, if the element is not polymorphic
    pub fn single_type(&self) -> Option<&str> {
        match self.types.as_slice() {
            [only] if only != "*" => Some(only),
            _ => None,
        }
    }

    /// Concrete type selected by a choice element name such as `valueString`
    pub fn choice_type_for(&self, element_name: &str) -> Option<&str> {
        if !self.is_choice() {
            return None;
        }
        let suffix = element_name.strip_prefix(self.base_name())?;
        self.types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(suffix))
            .map(String::as_str)
    }
}

/// A type and its own (not inherited) elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    /// Type name
    pub name: String,
    /// Category
    pub kind: TypeKind,
    /// Parent type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Canonical URL of the definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Elements declared on this type
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
}

impl TypeInfo {
    /// Canonical URL, defaulting to the core definition base
    pub fn canonical(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("{FHIR_STRUCTURE_BASE}{}", self.name))
    }
}

/// Source of type and element definitions
pub trait StructureProvider: Send + Sync + fmt::Debug {
    /// Definition of a type
    fn type_info(&self, type_name: &str) -> Option<TypeInfo>;

    /// Every known type name
    fn type_names(&self) -> Vec<String>;

    /// Type name for a canonical URL or a plain type name
    fn resolve_type(&self, name_or_url: &str) -> Option<String> {
        if let Some(info) = self.type_info(name_or_url) {
            return Some(info.name);
        }
        if let Some(name) = name_or_url.strip_prefix(FHIR_STRUCTURE_BASE) {
            if let Some(info) = self.type_info(name) {
                return Some(info.name);
            }
        }
        self.type_names()
            .into_iter()
            .filter_map(|n| self.type_info(&n))
            .find(|info| info.url.as_deref() == Some(name_or_url))
            .map(|info| info.name)
    }

    /// Element of a type, looking through base types and choice names
    fn element(&self, type_name: &str, element_name: &str) -> Option<ElementInfo> {
        let mut current = self.type_info(type_name);
        while let Some(info) = current {
            if let Some(found) = info.elements.iter().find(|e| e.name == element_name) {
                return Some(found.clone());
            }
            if let Some(found) = info
                .elements
                .iter()
                .find(|e| e.choice_type_for(element_name).is_some())
            {
                return Some(found.clone());
            }
            if let Some(found) = info
                .elements
                .iter()
                .find(|e| e.is_choice() && e.base_name() == element_name)
            {
                return Some(found.clone());
            }
            current = info.base.as_deref().and_then(|b| self.type_info(b));
        }
        None
    }

    /// Every element of a type, inherited ones first
    fn elements(&self, type_name: &str) -> Vec<ElementInfo> {
        let mut chain = Vec::new();
        let mut current = self.type_info(type_name);
        while let Some(info) = current {
            current = info.base.as_deref().and_then(|b| self.type_info(b));
            chain.push(info);
        }
        chain.into_iter().rev().flat_map(|info| info.elements).collect()
    }

    /// Concrete type of an element when it can be decided from its name
    fn element_type(&self, type_name: &str, element_name: &str) -> Option<String> {
        let info = self.element(type_name, element_name)?;
        info.choice_type_for(element_name)
            .or_else(|| info.single_type())
            .map(str::to_string)
    }

    /// True for primitive types
    fn is_primitive(&self, type_name: &str) -> bool {
        match self.type_info(type_name) {
            Some(info) => info.kind == TypeKind::PrimitiveType,
            None => PRIMITIVE_TYPES.contains(&type_name),
        }
    }

    /// True for resource types
    fn is_resource(&self, type_name: &str) -> bool {
        self.type_info(type_name)
            .is_some_and(|info| info.kind == TypeKind::Resource)
    }

    /// True if `type_name` is `ancestor` or derives from it
    fn is_subtype_of(&self, type_name: &str, ancestor: &str) -> bool {
        let mut current = Some(type_name.to_string());
        let mut guard = 0;
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            guard += 1;
            if guard > 64 {
                return false;
            }
            current = self.type_info(&name).and_then(|info| info.base);
        }
        false
    }

    /// Canonical URL of a type
    fn type_url(&self, type_name: &str) -> String {
        self.type_info(type_name)
            .map(|info| info.canonical())
            .unwrap_or_else(|| format!("{FHIR_STRUCTURE_BASE}{type_name}"))
    }
}

/// True if `type_name` is one of the FHIR primitive type names
pub fn is_primitive_type_name(type_name: &str) -> bool {
    PRIMITIVE_TYPES.contains(&type_name)
}
