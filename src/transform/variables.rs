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

//! Scoped variable environment for rule execution.
//!
//! Every source item forks the environment; a fork is an independent copy so
//! bindings made while handling one item never leak into its siblings.

use std::fmt;

use crate::evaluator::VariableResolver;
use crate::model::FhirPathValue;

/// Which side of the transform a variable belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableMode {
    /// Bound from the source tree
    Input,
    /// Bound into the target tree
    Output,
    /// `share` slots, visible to every rule of a group
    Shared,
}

impl fmt::Display for VariableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "source",
            Self::Output => "target",
            Self::Shared => "shared",
        })
    }
}

#[derive(Debug, Clone)]
struct Variable {
    mode: VariableMode,
    name: String,
    value: FhirPathValue,
}

impl Variable {
    fn summary(&self) -> String {
        match &self.value {
            FhirPathValue::Node(node) if !node.has_value() => {
                format!("{}: ({})", self.name, node.type_name())
            }
            value => format!(
                "{}: \"{}\"",
                self.name,
                value.as_string().unwrap_or_default()
            ),
        }
    }
}

/// Variables bound during rule execution
#[derive(Debug, Clone, Default)]
pub struct Variables {
    entries: Vec<Variable>,
}

impl Variables {
    /// Empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing an existing binding with the same mode
    pub fn add(&mut self, mode: VariableMode, name: impl Into<String>, value: FhirPathValue) {
        let name = name.into();
        match self
            .entries
            .iter_mut()
            .find(|v| v.mode == mode && v.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.entries.push(Variable { mode, name, value }),
        }
    }

    /// Value bound to `name` in `mode`
    pub fn get(&self, mode: VariableMode, name: &str) -> Option<&FhirPathValue> {
        self.entries
            .iter()
            .find(|v| v.mode == mode && v.name == name)
            .map(|v| &v.value)
    }

    /// Source binding first, then target binding
    pub fn lookup(&self, name: &str) -> Option<&FhirPathValue> {
        self.get(VariableMode::Input, name)
            .or_else(|| self.get(VariableMode::Output, name))
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One-line description used in log and error messages
    pub fn summary(&self) -> String {
        let list = |mode: VariableMode| {
            self.entries
                .iter()
                .filter(|v| v.mode == mode)
                .map(Variable::summary)
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "source variables [{}], target variables [{}], shared variables [{}]",
            list(VariableMode::Input),
            list(VariableMode::Output),
            list(VariableMode::Shared)
        )
    }
}

/// Mapping variables are visible to embedded expressions by bare name
impl VariableResolver for Variables {
    fn resolve_variable(&self, name: &str) -> Option<FhirPathValue> {
        self.lookup(name).cloned()
    }
}
