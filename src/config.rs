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

//! Engine configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::model::FHIR_STRUCTURE_BASE;

/// Settings shared by the transform engine and the analyzer.
///
/// Every field has a default, so a configuration file only needs the keys it
/// changes:
///
/// ```json
/// { "maxRecursionDepth": 64, "strictTypes": false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Deepest allowed nesting of group invocations
    pub max_recursion_depth: usize,
    /// Source type filters require the exact type name when set; otherwise
    /// subtypes known to the structure provider are accepted too
    pub strict_types: bool,
    /// Type created for an entry target that has no resolvable type
    pub default_output_type: String,
    /// Allow `reference` to assign an id to a resource that has none
    pub generate_identifiers: bool,
    /// Prefix of the URLs given to profiles produced by analysis
    pub profile_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 256,
            strict_types: true,
            default_output_type: "Bundle".to_string(),
            generate_identifiers: true,
            profile_base_url: FHIR_STRUCTURE_BASE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON configuration
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_keep_defaults() {
        let config = EngineConfig::from_json(r#"{ "maxRecursionDepth": 8 }"#).unwrap();
        assert_eq!(config.max_recursion_depth, 8);
        assert!(config.strict_types);
        assert_eq!(config.default_output_type, "Bundle");
    }

    #[test]
    fn unreadable_json_is_an_error() {
        assert!(EngineConfig::from_json("{").is_err());
    }
}
