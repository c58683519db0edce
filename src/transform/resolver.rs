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

//! Group resolution by name, by type pair and by single source type.
//!
//! The map being executed is searched first, then every imported map. A
//! second candidate at either stage is an error. Successful lookups are
//! memoised per calling group; failures are never cached.

use std::sync::Arc;

use log::trace;
use rustc_hash::FxHashMap;

use crate::core::{FhirMapError, Result};
use crate::mapping::{Group, GroupTypeMode, InputMode, StructureMap};
use crate::model::StructureProvider;

use super::registry::MapRegistry;

/// A group together with the map that declares it
#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    /// Declaring map
    pub map: Arc<StructureMap>,
    /// Position of the group in `map.groups`
    pub index: usize,
}

impl ResolvedGroup {
    /// The group itself
    pub fn group(&self) -> &Group {
        &self.map.groups[self.index]
    }
}

/// Memoised group lookups for one transform or analysis run
pub struct GroupResolver {
    registry: Arc<dyn MapRegistry>,
    provider: Option<Arc<dyn StructureProvider>>,
    groups: FxHashMap<String, ResolvedGroup>,
    types: FxHashMap<String, String>,
}

impl GroupResolver {
    /// Resolver searching `registry` for imported maps
    pub fn new(registry: Arc<dyn MapRegistry>, provider: Option<Arc<dyn StructureProvider>>) -> Self {
        Self {
            registry,
            provider,
            groups: FxHashMap::default(),
            types: FxHashMap::default(),
        }
    }

    /// Group named `name`, as referenced by `extends` or a dependent
    /// invocation inside `from_group`
    pub fn resolve_reference(
        &mut self,
        map: &Arc<StructureMap>,
        from_group: &str,
        name: &str,
    ) -> Result<ResolvedGroup> {
        let key = format!("{}|{from_group}|ref^{name}", map.url);
        if let Some(found) = self.groups.get(&key) {
            return Ok(found.clone());
        }
        let found = self.search(
            map,
            |_, group| group.name == name,
            || format!("Multiple possible matches for rule '{name}'"),
            |first, other, _| {
                format!(
                    "Multiple possible matches for rule '{name}' in {} and {}",
                    first.map.url, other.url
                )
            },
        )?;
        let found = found.ok_or_else(|| {
            FhirMapError::not_found(format!(
                "No matches found for rule '{name}'. Reference found in {}",
                map.url
            ))
        })?;
        trace!("Resolved group reference {name} to {}", found.group().name);
        self.groups.insert(key, found.clone());
        Ok(found)
    }

    /// Group whose typed inputs accept `source_type` and `target_type`,
    /// used for implicit dispatch
    pub fn resolve_by_types(
        &mut self,
        map: &Arc<StructureMap>,
        from_group: &str,
        rule: &str,
        source_type: &str,
        target_type: &str,
    ) -> Result<ResolvedGroup> {
        let key = format!("{}|{from_group}|types^{source_type}:{target_type}", map.url);
        if let Some(found) = self.groups.get(&key) {
            return Ok(found.clone());
        }
        let found = self.search(
            map,
            |owner, group| self.matches_by_types(owner, group, source_type, target_type),
            || {
                format!(
                    "Multiple possible matches looking for rule for '{source_type}/{target_type}', from rule '{rule}'"
                )
            },
            |first, other, group| {
                format!(
                    "Multiple possible matches for rule for '{source_type}/{target_type}' in {} ({}) and {} ({})",
                    first.map.url,
                    first.group().name,
                    other.url,
                    group.name
                )
            },
        )?;
        let found = found.ok_or_else(|| {
            FhirMapError::not_found(format!(
                "No matches found for rule for '{source_type} to {target_type}' from {}, from rule '{rule}'",
                map.url
            ))
        })?;
        self.groups.insert(key, found.clone());
        Ok(found)
    }

    /// Type to create for a target when the only clue is the type of the
    /// source item: the target input type of the `<<type+>>` group
    /// accepting `source_type`
    pub fn default_target_type(
        &mut self,
        map: &Arc<StructureMap>,
        from_group: &str,
        source_type: &str,
    ) -> Result<String> {
        let key = format!("{}|{from_group}|type^{source_type}", map.url);
        if let Some(found) = self.types.get(&key) {
            return Ok(found.clone());
        }
        let found = self.search(
            map,
            |owner, group| self.matches_by_single_type(owner, group, source_type),
            || format!("Multiple possible matches looking for default rule for '{source_type}'"),
            |first, other, group| {
                format!(
                    "Multiple possible matches for default rule for '{source_type}' in {} ({}) and {} ({})",
                    first.map.url,
                    first.group().name,
                    other.url,
                    group.name
                )
            },
        )?;
        let found = found.ok_or_else(|| {
            FhirMapError::not_found(format!(
                "No matches found for default rule for '{source_type}' from {}",
                map.url
            ))
        })?;
        let stated = found.group().inputs[1].type_name.clone().unwrap_or_default();
        let actual = self.actual_type(&found.map, &stated);
        self.types.insert(key, actual.clone());
        Ok(actual)
    }

    /// Type name behind a declared input type, following `uses` aliases
    pub fn actual_type(&self, map: &StructureMap, stated: &str) -> String {
        match map.structures.iter().find(|s| s.alias.as_deref() == Some(stated)) {
            Some(structure) => self.type_from_url(&structure.url),
            None if is_absolute_url(stated) => self.type_from_url(stated),
            None => stated.to_string(),
        }
    }

    fn type_from_url(&self, url: &str) -> String {
        self.provider
            .as_ref()
            .and_then(|p| p.resolve_type(url))
            .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string())
    }

    fn matches_type(&self, map: &StructureMap, actual: &str, stated: &str) -> bool {
        let actual = if is_absolute_url(actual) {
            self.type_from_url(actual)
        } else {
            actual.to_string()
        };
        actual == self.actual_type(map, stated)
    }

    fn has_source_target_inputs(group: &Group) -> bool {
        matches!(
            group.inputs.as_slice(),
            [source, target] if source.mode == InputMode::Source && target.mode == InputMode::Target
        )
    }

    fn matches_by_single_type(&self, map: &StructureMap, group: &Group, source_type: &str) -> bool {
        group.type_mode == GroupTypeMode::TypeAndTypes
            && Self::has_source_target_inputs(group)
            && group.inputs[0]
                .type_name
                .as_deref()
                .is_some_and(|stated| self.matches_type(map, source_type, stated))
    }

    fn matches_by_types(
        &self,
        map: &StructureMap,
        group: &Group,
        source_type: &str,
        target_type: &str,
    ) -> bool {
        if group.type_mode == GroupTypeMode::None || !Self::has_source_target_inputs(group) {
            return false;
        }
        match (&group.inputs[0].type_name, &group.inputs[1].type_name) {
            (Some(source), Some(target)) => {
                self.matches_type(map, source_type, source) && self.matches_type(map, target_type, target)
            }
            _ => false,
        }
    }

    fn search<P, L, I>(
        &self,
        map: &Arc<StructureMap>,
        predicate: P,
        local_ambiguity: L,
        import_ambiguity: I,
    ) -> Result<Option<ResolvedGroup>>
    where
        P: Fn(&StructureMap, &Group) -> bool,
        L: Fn() -> String,
        I: Fn(&ResolvedGroup, &StructureMap, &Group) -> String,
    {
        let mut found: Option<ResolvedGroup> = None;
        for (index, group) in map.groups.iter().enumerate() {
            if predicate(map, group) {
                if found.is_some() {
                    return Err(FhirMapError::ambiguous(local_ambiguity()));
                }
                found = Some(ResolvedGroup {
                    map: map.clone(),
                    index,
                });
            }
        }
        if found.is_some() {
            return Ok(found);
        }

        for import in &map.imports {
            let imported = self.registry.find_matching_maps(import);
            if imported.is_empty() {
                return Err(FhirMapError::not_found(format!(
                    "Unable to find map(s) for {import}"
                )));
            }
            for other in imported.iter().filter(|m| m.url != map.url) {
                for (index, group) in other.groups.iter().enumerate() {
                    if !predicate(other, group) {
                        continue;
                    }
                    if let Some(first) = &found {
                        return Err(FhirMapError::ambiguous(import_ambiguity(first, other, group)));
                    }
                    found = Some(ResolvedGroup {
                        map: other.clone(),
                        index,
                    });
                }
            }
        }
        Ok(found)
    }
}

fn is_absolute_url(text: &str) -> bool {
    text.starts_with("http:") || text.starts_with("https:") || text.starts_with("urn:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, ResolutionFailure};
    use crate::mapping::parse_map;
    use crate::transform::registry::InMemoryMapRegistry;

    fn resolver(registry: InMemoryMapRegistry) -> GroupResolver {
        GroupResolver::new(Arc::new(registry), None)
    }

    #[test]
    fn two_typed_groups_for_the_same_pair_are_ambiguous() {
        let map = Arc::new(
            parse_map(
                "map \"http://x/m\" = \"M\"\n\
                 group A(source s : Patient, target t : Patient) <<types>> { }\n\
                 group B(source s : Patient, target t : Patient) <<types>> { }",
            )
            .unwrap(),
        );
        let err = resolver(InMemoryMapRegistry::new())
            .resolve_by_types(&map, "A", "r", "Patient", "Patient")
            .unwrap_err();
        assert!(err.to_string().starts_with("Multiple possible matches"));
        assert!(matches!(
            err,
            FhirMapError::Resolution {
                reason: ResolutionFailure::Ambiguous,
                ..
            }
        ));
    }

    #[test]
    fn imports_are_searched_with_wildcards() {
        let registry = InMemoryMapRegistry::new();
        registry.add_map(
            parse_map(
                "map \"http://x/types\" = \"Types\"\n\
                 group Str(source s : string, target t : string) <<type+>> { }",
            )
            .unwrap(),
        );
        let map = Arc::new(
            parse_map("map \"http://x/main\" = \"Main\"\nimports \"http://x/*\"\ngroup Main(source s) { }")
                .unwrap(),
        );
        let mut resolver = resolver(registry);
        let found = resolver.resolve_reference(&map, "Main", "Str").unwrap();
        assert_eq!(found.map.url, "http://x/types");
        assert_eq!(resolver.default_target_type(&map, "Main", "string").unwrap(), "string");
        let err = resolver.resolve_reference(&map, "Main", "Missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(err.to_string().starts_with("No matches found"));
    }

    #[test]
    fn unresolvable_imports_fail() {
        let map = Arc::new(
            parse_map("map \"http://x/main\" = \"Main\"\nimports \"http://nowhere/*\"\ngroup Main(source s) { }")
                .unwrap(),
        );
        let err = resolver(InMemoryMapRegistry::new())
            .resolve_reference(&map, "Main", "Other")
            .unwrap_err();
        assert!(err.to_string().contains("Unable to find map(s) for http://nowhere/*"));
    }

    #[test]
    fn aliases_resolve_to_type_names() {
        let map = parse_map(
            "map \"http://x/m\" = \"M\"\n\
             uses \"http://hl7.org/fhir/StructureDefinition/Patient\" alias Pat as source\n\
             group A(source s : Pat, target t : Pat) <<types>> { }",
        )
        .unwrap();
        let resolver = resolver(InMemoryMapRegistry::new());
        assert_eq!(resolver.actual_type(&map, "Pat"), "Patient");
        assert_eq!(resolver.actual_type(&map, "Other"), "Other");
    }
}
