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

//! Two column source/target summary of an analysed map

use std::collections::BTreeMap;

use comfy_table::{Attribute, Cell, Table, presets::UTF8_FULL};
use serde::{Deserialize, Serialize};

/// What a summary row describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowKind {
    /// Group entry, listing its inputs
    Group,
    /// Rule, listing what it reads and writes
    Rule,
}

/// One line of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    /// Row kind
    pub kind: RowKind,
    /// Nesting depth, used for indentation
    pub depth: usize,
    /// Source side text
    pub source: String,
    /// Target side text
    pub target: String,
}

/// Render rows as a table
pub fn summary_table(rows: &[SummaryRow]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Source", "Target"]);

    for row in rows {
        let indent = "  ".repeat(row.depth);
        let source = Cell::new(format!("{indent}{}", row.source));
        let target = Cell::new(format!("{indent}{}", row.target));
        match row.kind {
            RowKind::Group => table.add_row(vec![
                source.add_attribute(Attribute::Bold),
                target.add_attribute(Attribute::Bold),
            ]),
            RowKind::Rule => table.add_row(vec![source, target]),
        };
    }
    table
}

/// Collects the target side of one rule and condenses it into a phrase
#[derive(Debug, Default)]
pub(crate) struct TargetWriter {
    new_resources: BTreeMap<String, String>,
    assignments: Vec<(String, String)>,
    key_properties: Vec<(String, String)>,
}

impl TargetWriter {
    /// Variable `var` holds a new instance of resource `type_name`
    pub fn new_resource(&mut self, var: &str, type_name: &str) {
        self.new_resources.insert(var.to_string(), type_name.to_string());
    }

    /// A source value is written into `context`
    pub fn value_assignment(&mut self, context: &str, description: String) {
        self.assignments.push((context.to_string(), description));
    }

    /// A fixed value that identifies the kind of instance in `context`
    pub fn key_assignment(&mut self, context: &str, description: String) {
        self.key_properties.push((context.to_string(), description));
    }

    pub fn commit(self) -> String {
        let only_assignment = match self.assignments.as_slice() {
            [(var, desc)] if self.new_resources.len() == 1 && self.new_resources.contains_key(var) => {
                Some(desc)
            }
            _ => None,
        };
        if let Some(desc) = only_assignment {
            match self.key_properties.as_slice() {
                [(var, key)] if self.new_resources.contains_key(var) => {
                    let key = key.split_once('.').map_or(key.as_str(), |(_, rest)| rest);
                    return format!("new {desc} ({key})");
                }
                [] => return format!("new {desc}"),
                _ => {}
            }
        }

        let mut parts = Vec::new();
        for (var, type_name) in &self.new_resources {
            let keys: Vec<&str> = self
                .key_properties
                .iter()
                .filter(|(v, _)| v == var)
                .map(|(_, desc)| desc.as_str())
                .collect();
            if keys.is_empty() {
                parts.push(format!("new {type_name}"));
            } else {
                parts.push(format!("new {type_name} ({})", keys.join(", ")));
            }
        }
        parts.extend(
            self.key_properties
                .into_iter()
                .filter(|(var, _)| !self.new_resources.contains_key(var))
                .map(|(_, desc)| desc),
        );
        parts.extend(self.assignments.into_iter().map(|(_, desc)| desc));
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_assignment_to_new_resource() {
        let mut writer = TargetWriter::default();
        writer.new_resource("obs", "Observation");
        writer.value_assignment("obs", "Observation.value (--> Quantity)".into());
        writer.key_assignment("obs", "Observation.code = LOINC#1234-5".into());
        assert_eq!(writer.commit(), "new Observation.value (--> Quantity) (code = LOINC#1234-5)");
    }

    #[test]
    fn general_form_lists_everything() {
        let mut writer = TargetWriter::default();
        writer.new_resource("b", "Bundle");
        writer.key_assignment("b", "Bundle.type = batch".into());
        writer.value_assignment("t", "Patient.name".into());
        assert_eq!(writer.commit(), "new Bundle (Bundle.type = batch), Patient.name");
        assert_eq!(TargetWriter::default().commit(), "");

        let mut writer = TargetWriter::default();
        writer.key_assignment("obs", "Observation.code = LOINC#1234-5".into());
        assert_eq!(writer.commit(), "Observation.code = LOINC#1234-5");
    }

    #[test]
    fn rows_are_indented() {
        let rows = vec![
            SummaryRow { kind: RowKind::Group, depth: 0, source: "Input: Patient".into(), target: "Input: Patient".into() },
            SummaryRow { kind: RowKind::Rule, depth: 1, source: "Patient.name".into(), target: "Patient.name".into() },
        ];
        let text = summary_table(&rows).to_string();
        assert!(text.contains("  Patient.name"));
        assert!(text.contains("Source"));
    }
}
