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

//! Parsed-expression side table shared by the map parser and the engines

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ast::ExpressionNode;
use crate::core::Result;

/// Parsed FHIRPath trees keyed by their canonical text.
///
/// The map parser fills the cache as it reads `where`, `check`, `log` and
/// inline expressions; execution and analysis look the trees up instead of
/// parsing again. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ExpressionCache {
    entries: Arc<RwLock<FxHashMap<String, Arc<ExpressionNode>>>>,
}

impl ExpressionCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `node` under `text` and return the shared tree
    pub fn insert(&self, text: impl Into<String>, node: ExpressionNode) -> Arc<ExpressionNode> {
        let node = Arc::new(node);
        self.entries.write().insert(text.into(), node.clone());
        node
    }

    /// Tree stored under `text`
    pub fn get(&self, text: &str) -> Option<Arc<ExpressionNode>> {
        self.entries.read().get(text).cloned()
    }

    /// Tree stored under `text`, parsing and storing it on a miss.
    /// Parse failures are returned and not stored.
    pub fn get_or_parse<F>(&self, text: &str, parse: F) -> Result<Arc<ExpressionNode>>
    where
        F: FnOnce(&str) -> Result<ExpressionNode>,
    {
        if let Some(node) = self.get(text) {
            return Ok(node);
        }
        log::trace!("expression cache miss: {text}");
        let node = parse(text)?;
        Ok(self.insert(text, node))
    }

    /// Number of stored trees
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every stored tree
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;

    #[test]
    fn misses_parse_once() {
        let cache = ExpressionCache::new();
        let mut calls = 0;
        let first = cache
            .get_or_parse("a.b", |t| {
                calls += 1;
                parse_expression(t)
            })
            .unwrap();
        let second = cache.get_or_parse("a.b", |_| unreachable!()).unwrap();
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = ExpressionCache::new();
        assert!(cache.get_or_parse("a.", parse_expression).is_err());
        assert!(cache.is_empty());
    }
}
