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

//! Lookup of maps and concept maps by canonical URL.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::mapping::{ConceptMap, StructureMap};

/// Source of the maps a transform may import and the concept maps it may
/// translate through
pub trait MapRegistry: Send + Sync {
    /// Map with the given URL
    fn get_map(&self, url: &str) -> Option<Arc<StructureMap>>;

    /// Every known map
    fn list_maps(&self) -> Vec<Arc<StructureMap>>;

    /// Stand-alone concept map with the given URL
    fn get_concept_map(&self, url: &str) -> Option<Arc<ConceptMap>>;

    /// Maps matching an import URL, which may hold one `*`
    fn find_matching_maps(&self, pattern: &str) -> Vec<Arc<StructureMap>> {
        if pattern.contains('*') {
            self.list_maps()
                .into_iter()
                .filter(|map| url_matches(pattern, &map.url))
                .collect()
        } else {
            self.get_map(pattern).into_iter().collect()
        }
    }
}

/// True if `url` fits `mask`, a URL with one `*` standing for at least one
/// character
pub fn url_matches(mask: &str, url: &str) -> bool {
    let Some((prefix, suffix)) = mask.split_once('*') else {
        return mask == url;
    };
    url.len() > mask.len() && url.starts_with(prefix) && url.ends_with(suffix)
}

/// Registry kept in memory
#[derive(Debug, Default)]
pub struct InMemoryMapRegistry {
    maps: RwLock<IndexMap<String, Arc<StructureMap>>>,
    concept_maps: RwLock<IndexMap<String, Arc<ConceptMap>>>,
}

impl InMemoryMapRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a map under its URL, replacing any previous one
    pub fn add_map(&self, map: StructureMap) -> Arc<StructureMap> {
        let map = Arc::new(map);
        self.maps.write().insert(map.url.clone(), map.clone());
        map
    }

    /// Register a concept map under `url`
    pub fn add_concept_map(&self, url: impl Into<String>, concept_map: ConceptMap) {
        self.concept_maps
            .write()
            .insert(url.into(), Arc::new(concept_map));
    }

    /// Number of registered maps
    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    /// True when no map is registered
    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }
}

impl MapRegistry for InMemoryMapRegistry {
    fn get_map(&self, url: &str) -> Option<Arc<StructureMap>> {
        self.maps.read().get(url).cloned()
    }

    fn list_maps(&self) -> Vec<Arc<StructureMap>> {
        self.maps.read().values().cloned().collect()
    }

    fn get_concept_map(&self, url: &str) -> Option<Arc<ConceptMap>> {
        if let Some(found) = self.concept_maps.read().get(url) {
            return Some(found.clone());
        }
        self.concept_maps
            .read()
            .values()
            .find(|cm| cm.url.as_deref() == Some(url))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_needs_at_least_one_character() {
        assert!(url_matches("http://x/*", "http://x/types"));
        assert!(url_matches("http://x/*-v2", "http://x/a-v2"));
        assert!(!url_matches("http://x/*", "http://x/"));
        assert!(!url_matches("http://x/*-v2", "http://x/a-v3"));
        assert!(url_matches("http://x/a", "http://x/a"));
    }

    #[test]
    fn find_by_pattern_or_url() {
        let registry = InMemoryMapRegistry::new();
        registry.add_map(StructureMap::new("http://x/one", "One"));
        registry.add_map(StructureMap::new("http://x/two", "Two"));
        registry.add_map(StructureMap::new("http://y/three", "Three"));
        assert_eq!(registry.find_matching_maps("http://x/*").len(), 2);
        assert_eq!(registry.find_matching_maps("http://y/three").len(), 1);
        assert!(registry.find_matching_maps("http://z/*").is_empty());
    }

    #[test]
    fn concept_maps_by_key_or_url() {
        let registry = InMemoryMapRegistry::new();
        registry.add_concept_map(
            "cm-key",
            ConceptMap {
                id: "cm".into(),
                url: Some("http://cm/url".into()),
                ..Default::default()
            },
        );
        assert!(registry.get_concept_map("cm-key").is_some());
        assert!(registry.get_concept_map("http://cm/url").is_some());
        assert!(registry.get_concept_map("http://cm/other").is_none());
    }
}
