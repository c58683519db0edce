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

//! Type details and the profile skeletons produced by analysis

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{FhirMapError, Result};

/// How many values a typed expression may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionStatus {
    /// At most one value
    #[default]
    Singleton,
    /// An ordered list
    Ordered,
    /// A set with no order
    Unordered,
}

/// A type name with the profiles and binding that constrain it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfiledType {
    /// Type name
    pub name: String,
    /// Profiles the value conforms to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    /// Value set the value is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

impl ProfiledType {
    /// Unconstrained type
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profiles: Vec::new(),
            binding: None,
        }
    }
}

/// The set of types a variable may hold
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDetails {
    /// Cardinality of the value
    pub collection: CollectionStatus,
    /// Possible types
    pub types: Vec<ProfiledType>,
}

impl TypeDetails {
    /// No known type yet
    pub fn empty(collection: CollectionStatus) -> Self {
        Self {
            collection,
            types: Vec::new(),
        }
    }

    /// Single value of one type
    pub fn singleton(type_name: impl Into<String>) -> Self {
        Self::of(ProfiledType::new(type_name))
    }

    /// Single value of one constrained type
    pub fn of(profiled: ProfiledType) -> Self {
        Self {
            collection: CollectionStatus::Singleton,
            types: vec![profiled],
        }
    }

    /// Add a possible type, ignoring duplicates
    pub fn add_type(&mut self, profiled: ProfiledType) {
        if !self.types.iter().any(|t| t.name == profiled.name) {
            self.types.push(profiled);
        }
    }

    /// Names of the possible types
    pub fn type_names(&self) -> Vec<&str> {
        self.types.iter().map(|t| t.name.as_str()).collect()
    }

    /// True if `type_name` is one of the possible types
    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.iter().any(|t| t.name == type_name)
    }

    /// First binding among the possible types
    pub fn binding(&self) -> Option<&str> {
        self.types.iter().find_map(|t| t.binding.as_deref())
    }

    /// The one possible type. More than one is an ambiguity the caller must
    /// resolve with a type annotation or a typed element name.
    pub fn single_type(&self, path: &str) -> Result<&str> {
        match self.types.as_slice() {
            [only] => Ok(&only.name),
            [] => Err(FhirMapError::not_found(format!("No type known for {path}"))),
            many => Err(FhirMapError::ambiguous(format!(
                "Multiple types possible for {path} ({}); use a type annotation or a typed element name",
                many.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

/// One type allowed on a constrained element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementType {
    /// Type name
    pub code: String,
    /// Profiles the value must conform to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile: Vec<String>,
    /// Profiles a referenced resource must conform to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_profile: Vec<String>,
}

/// A differential element of a generated profile
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    /// Dotted element path, choice elements keep their `[x]` name
    pub path: String,
    /// Name of the rule that populates the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_name: Option<String>,
    /// Allowed types
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "type")]
    pub types: Vec<ElementType>,
    /// Value every instance carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<Value>,
    /// Value set binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

impl ElementDefinition {
    /// Element at `path` with no constraints
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Type entry for `code`, added if missing
    pub fn type_mut(&mut self, code: &str) -> &mut ElementType {
        let index = match self.types.iter().position(|t| t.code == code) {
            Some(index) => index,
            None => {
                self.types.push(ElementType {
                    code: code.to_string(),
                    profile: Vec::new(),
                    target_profile: Vec::new(),
                });
                self.types.len() - 1
            }
        };
        &mut self.types[index]
    }
}

/// Skeleton of a constraint profile describing what a map produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSkeleton {
    /// Logical id, unique within one analysis
    pub id: String,
    /// Canonical URL
    pub url: String,
    /// Human readable name
    pub name: String,
    /// Constrained type
    #[serde(rename = "type")]
    pub type_name: String,
    /// URL of the constrained type
    pub base_definition: String,
    /// Always `constraint`
    pub derivation: String,
    /// Publication status copied from the map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Narrative description
    pub description: String,
    /// Constrained elements, the root first
    pub differential: Vec<ElementDefinition>,
}

impl ProfileSkeleton {
    /// Differential element at `path`, added if missing
    pub fn element_mut(&mut self, path: &str) -> &mut ElementDefinition {
        let index = match self.differential.iter().position(|e| e.path == path) {
            Some(index) => index,
            None => {
                self.differential.push(ElementDefinition::new(path));
                self.differential.len() - 1
            }
        };
        &mut self.differential[index]
    }

    /// Differential element at `path`
    pub fn element(&self, path: &str) -> Option<&ElementDefinition> {
        self.differential.iter().find(|e| e.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResolutionFailure;

    #[test]
    fn single_type_rejects_choices() {
        let mut details = TypeDetails::singleton("boolean");
        assert_eq!(details.single_type("x").unwrap(), "boolean");

        details.add_type(ProfiledType::new("dateTime"));
        details.add_type(ProfiledType::new("boolean"));
        assert_eq!(details.type_names(), vec!["boolean", "dateTime"]);
        let err = details.single_type("Patient.deceased").unwrap_err();
        assert!(matches!(
            err,
            FhirMapError::Resolution { reason: ResolutionFailure::Ambiguous, .. }
        ));
        assert!(err.to_string().contains("boolean, dateTime"));
    }

    #[test]
    fn elements_are_added_once() {
        let mut profile = ProfileSkeleton {
            id: "p".into(),
            url: "http://x/p".into(),
            name: "p".into(),
            type_name: "Patient".into(),
            base_definition: "http://hl7.org/fhir/StructureDefinition/Patient".into(),
            derivation: "constraint".into(),
            status: None,
            description: String::new(),
            differential: vec![ElementDefinition::new("Patient")],
        };
        profile.element_mut("Patient.name").type_mut("HumanName");
        profile.element_mut("Patient.name").type_mut("HumanName");
        assert_eq!(profile.differential.len(), 2);
        assert_eq!(profile.element("Patient.name").unwrap().types.len(), 1);

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["differential"][1]["type"][0]["code"], "HumanName");
        assert_eq!(json["type"], "Patient");
    }
}
