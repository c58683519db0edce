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

//! Mock structure provider for testing and standalone use

use indexmap::IndexMap;

use super::provider::{ElementInfo, StructureProvider, TypeInfo, TypeKind};
use crate::core::Result;

const MANY: Option<u32> = None;
const ONE: Option<u32> = Some(1);

/// Mock structure provider backed by an in-memory type table
#[derive(Debug, Clone, Default)]
pub struct MockStructureProvider {
    types: IndexMap<String, TypeInfo>,
}

impl MockStructureProvider {
    /// Create a provider preloaded with a small slice of FHIR R4
    pub fn new() -> Self {
        let mut provider = Self::default();
        provider.initialize_basic_types();
        provider
    }

    /// Create a provider with no predefined types
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load type definitions from a JSON array of [`TypeInfo`]
    pub fn from_json(text: &str) -> Result<Self> {
        let infos: Vec<TypeInfo> = serde_json::from_str(text)?;
        let mut provider = Self::empty();
        for info in infos {
            provider.add_type(info);
        }
        Ok(provider)
    }

    /// Register or replace a type
    pub fn add_type(&mut self, info: TypeInfo) {
        self.types.insert(info.name.clone(), info);
    }

    /// Add an element to an already registered type
    pub fn add_element(&mut self, type_name: &str, element: ElementInfo) {
        if let Some(info) = self.types.get_mut(type_name) {
            info.elements.retain(|e| e.name != element.name);
            info.elements.push(element);
        }
    }

    fn define(&mut self, name: &str, kind: TypeKind, base: Option<&str>, elements: Vec<ElementInfo>) {
        self.add_type(TypeInfo {
            name: name.to_string(),
            kind,
            base: base.map(str::to_string),
            url: None,
            elements,
        });
    }

    fn initialize_basic_types(&mut self) {
        let e = ElementInfo::new;

        self.define("Base", TypeKind::ComplexType, None, vec![]);
        self.define("Element", TypeKind::ComplexType, Some("Base"), vec![
            e("id", 0, ONE, &["string"]),
            e("extension", 0, MANY, &["Extension"]),
        ]);

        for (name, base) in [
            ("boolean", "Element"),
            ("integer", "Element"),
            ("decimal", "Element"),
            ("string", "Element"),
            ("uri", "Element"),
            ("date", "Element"),
            ("dateTime", "Element"),
            ("instant", "Element"),
            ("time", "Element"),
            ("base64Binary", "Element"),
            ("code", "string"),
            ("id", "string"),
            ("markdown", "string"),
            ("url", "uri"),
            ("canonical", "uri"),
            ("oid", "uri"),
            ("uuid", "uri"),
            ("positiveInt", "integer"),
            ("unsignedInt", "integer"),
        ] {
            self.define(name, TypeKind::PrimitiveType, Some(base), vec![]);
        }

        self.define("BackboneElement", TypeKind::ComplexType, Some("Element"), vec![
            e("modifierExtension", 0, MANY, &["Extension"]),
        ]);
        self.define("Extension", TypeKind::ComplexType, Some("Element"), vec![
            e("url", 1, ONE, &["uri"]),
            e("value[x]", 0, ONE, &[
                "string", "boolean", "integer", "decimal", "code", "uri", "dateTime", "date",
                "Coding", "CodeableConcept", "Quantity", "Reference", "Identifier", "Period",
            ]),
        ]);
        self.define("Coding", TypeKind::ComplexType, Some("Element"), vec![
            e("system", 0, ONE, &["uri"]),
            e("version", 0, ONE, &["string"]),
            e("code", 0, ONE, &["code"]),
            e("display", 0, ONE, &["string"]),
            e("userSelected", 0, ONE, &["boolean"]),
        ]);
        self.define("CodeableConcept", TypeKind::ComplexType, Some("Element"), vec![
            e("coding", 0, MANY, &["Coding"]),
            e("text", 0, ONE, &["string"]),
        ]);
        self.define("Quantity", TypeKind::ComplexType, Some("Element"), vec![
            e("value", 0, ONE, &["decimal"]),
            e("comparator", 0, ONE, &["code"]),
            e("unit", 0, ONE, &["string"]),
            e("system", 0, ONE, &["uri"]),
            e("code", 0, ONE, &["code"]),
        ]);
        self.define("Period", TypeKind::ComplexType, Some("Element"), vec![
            e("start", 0, ONE, &["dateTime"]),
            e("end", 0, ONE, &["dateTime"]),
        ]);
        self.define("Identifier", TypeKind::ComplexType, Some("Element"), vec![
            e("use", 0, ONE, &["code"]),
            e("type", 0, ONE, &["CodeableConcept"]),
            e("system", 0, ONE, &["uri"]),
            e("value", 0, ONE, &["string"]),
            e("period", 0, ONE, &["Period"]),
        ]);
        self.define("HumanName", TypeKind::ComplexType, Some("Element"), vec![
            e("use", 0, ONE, &["code"]),
            e("text", 0, ONE, &["string"]),
            e("family", 0, ONE, &["string"]),
            e("given", 0, MANY, &["string"]),
            e("prefix", 0, MANY, &["string"]),
            e("suffix", 0, MANY, &["string"]),
            e("period", 0, ONE, &["Period"]),
        ]);
        self.define("ContactPoint", TypeKind::ComplexType, Some("Element"), vec![
            e("system", 0, ONE, &["code"]),
            e("value", 0, ONE, &["string"]),
            e("use", 0, ONE, &["code"]),
            e("rank", 0, ONE, &["positiveInt"]),
        ]);
        self.define("Address", TypeKind::ComplexType, Some("Element"), vec![
            e("use", 0, ONE, &["code"]),
            e("line", 0, MANY, &["string"]),
            e("city", 0, ONE, &["string"]),
            e("postalCode", 0, ONE, &["string"]),
            e("country", 0, ONE, &["string"]),
        ]);
        self.define("Reference", TypeKind::ComplexType, Some("Element"), vec![
            e("reference", 0, ONE, &["string"]),
            e("type", 0, ONE, &["uri"]),
            e("identifier", 0, ONE, &["Identifier"]),
            e("display", 0, ONE, &["string"]),
        ]);
        self.define("Meta", TypeKind::ComplexType, Some("Element"), vec![
            e("versionId", 0, ONE, &["id"]),
            e("lastUpdated", 0, ONE, &["instant"]),
            e("profile", 0, MANY, &["canonical"]),
            e("tag", 0, MANY, &["Coding"]),
        ]);

        self.define("Resource", TypeKind::Resource, Some("Base"), vec![
            e("id", 0, ONE, &["id"]),
            e("meta", 0, ONE, &["Meta"]),
            e("language", 0, ONE, &["code"]),
        ]);
        self.define("DomainResource", TypeKind::Resource, Some("Resource"), vec![
            e("extension", 0, MANY, &["Extension"]),
        ]);
        self.define("Patient", TypeKind::Resource, Some("DomainResource"), vec![
            e("identifier", 0, MANY, &["Identifier"]),
            e("active", 0, ONE, &["boolean"]),
            e("name", 0, MANY, &["HumanName"]),
            e("telecom", 0, MANY, &["ContactPoint"]),
            e("gender", 0, ONE, &["code"]),
            e("birthDate", 0, ONE, &["date"]),
            e("deceased[x]", 0, ONE, &["boolean", "dateTime"]),
            e("address", 0, MANY, &["Address"]),
            e("managingOrganization", 0, ONE, &["Reference"]),
        ]);
        self.define("Observation", TypeKind::Resource, Some("DomainResource"), vec![
            e("identifier", 0, MANY, &["Identifier"]),
            e("status", 1, ONE, &["code"]),
            e("category", 0, MANY, &["CodeableConcept"]),
            e("code", 1, ONE, &["CodeableConcept"]),
            e("subject", 0, ONE, &["Reference"]),
            e("effective[x]", 0, ONE, &["dateTime", "Period", "instant"]),
            e("issued", 0, ONE, &["instant"]),
            e("value[x]", 0, ONE, &[
                "Quantity", "CodeableConcept", "string", "boolean", "integer", "dateTime", "Period",
            ]),
            e("note", 0, MANY, &["string"]),
        ]);
        self.define("Bundle", TypeKind::Resource, Some("Resource"), vec![
            e("type", 1, ONE, &["code"]),
            e("total", 0, ONE, &["unsignedInt"]),
            e("entry", 0, MANY, &["Bundle.entry"]),
        ]);
        self.define("Bundle.entry", TypeKind::ComplexType, Some("BackboneElement"), vec![
            e("fullUrl", 0, ONE, &["uri"]),
            e("resource", 0, ONE, &["Resource"]),
        ]);
    }
}

impl StructureProvider for MockStructureProvider {
    fn type_info(&self, type_name: &str) -> Option<TypeInfo> {
        self.types.get(type_name).cloned()
    }

    fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inherited_elements_are_visible() {
        let provider = MockStructureProvider::new();
        let id = provider.element("Patient", "id").unwrap();
        assert_eq!(id.types, vec!["id".to_string()]);
        assert!(provider.is_subtype_of("Patient", "Resource"));
        assert!(!provider.is_subtype_of("Patient", "Observation"));
    }

    #[test]
    fn choice_elements_resolve_by_suffix() {
        let provider = MockStructureProvider::new();
        assert_eq!(
            provider.element_type("Observation", "valueQuantity").as_deref(),
            Some("Quantity")
        );
        assert_eq!(provider.element_type("Observation", "value"), None);
        assert_eq!(
            provider.element("Patient", "deceasedBoolean").unwrap().name,
            "deceased[x]"
        );
    }

    #[test]
    fn kinds_and_urls() {
        let provider = MockStructureProvider::new();
        assert!(provider.is_primitive("code"));
        assert!(provider.is_resource("Bundle"));
        assert!(!provider.is_resource("HumanName"));
        assert_eq!(
            provider.type_url("Patient"),
            "http://hl7.org/fhir/StructureDefinition/Patient"
        );
        assert_eq!(
            provider
                .resolve_type("http://hl7.org/fhir/StructureDefinition/Observation")
                .as_deref(),
            Some("Observation")
        );
    }

    #[test]
    fn loads_from_json() {
        let provider = MockStructureProvider::from_json(
            r#"[{"name": "A", "kind": "logical", "elements": [
                {"name": "a", "min": 0, "max": 1, "types": ["string"]}
            ]}]"#,
        )
        .unwrap();
        assert_eq!(provider.element_type("A", "a").as_deref(), Some("string"));
        assert!(provider.element("A", "b").is_none());
    }
}
