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

//! StructureMap rule tree.
//!
//! Expressions embedded in rules (`where`, `check`, `log`, inline
//! `evaluate`) are stored as their canonical text. The parsed trees live in
//! an [`ExpressionCache`](super::ExpressionCache) side table keyed by that
//! text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::Literal;

macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $code:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $code)]
                $variant,
            )*
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant,)*];

            /// Code as written in mapping text
            pub fn code(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)*
                }
            }

            /// Look up a variant by its code
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

coded_enum! {
    /// How a `uses` structure takes part in the map
    ModelMode {
        /// Read by the map
        Source => "source",
        /// Read through searches
        Queried => "queried",
        /// Written by the map
        Target => "target",
        /// Produced as a side effect
        Produced => "produced",
    }
}

coded_enum! {
    /// Direction of a group input
    InputMode {
        /// Input read by the group
        Source => "source",
        /// Input written by the group
        Target => "target",
    }
}

coded_enum! {
    /// Whether a group may be chosen by type dispatch
    GroupTypeMode {
        /// Only callable by name
        None => "none",
        /// Default group for its input types
        Types => "types",
        /// Default group for its input types, also used to pick the type of created targets
        TypeAndTypes => "type-and-types",
    }
}

coded_enum! {
    /// Narrowing applied to the items matched by a source
    SourceListMode {
        /// Only the first item
        First => "first",
        /// All but the first item
        NotFirst => "not_first",
        /// Only the last item
        Last => "last",
        /// All but the last item
        NotLast => "not_last",
        /// At most one item is allowed
        OnlyOne => "only_one",
    }
}

coded_enum! {
    /// How a target participates in list construction
    TargetListMode {
        /// Insert as the first item
        First => "first",
        /// Share one created item between rules with the same id
        Share => "share",
        /// Insert as the last item
        Last => "last",
        /// Collect into a single item
        Collate => "collate",
    }
}

coded_enum! {
    /// Transform applied by a target
    Transform {
        /// Create an instance of a type
        Create => "create",
        /// Copy a value
        Copy => "copy",
        /// Truncate a string
        Truncate => "truncate",
        /// Escape a string
        Escape => "escape",
        /// Convert a value to another type
        Cast => "cast",
        /// Concatenate strings
        Append => "append",
        /// Translate a code through a concept map
        Translate => "translate",
        /// Reference to a resource
        Reference => "reference",
        /// Date arithmetic
        DateOp => "dateOp",
        /// Random UUID
        Uuid => "uuid",
        /// Pointer to a resource in the output
        Pointer => "pointer",
        /// Evaluate a FHIRPath expression
        Evaluate => "evaluate",
        /// CodeableConcept literal
        Cc => "cc",
        /// Coding literal
        C => "c",
        /// Quantity literal
        Qty => "qty",
        /// Identifier literal
        Id => "id",
        /// ContactPoint literal
        Cp => "cp",
    }
}

coded_enum! {
    /// Relationship between a source concept and a target concept
    ConceptMapEquivalence {
        /// Related in an unspecified way
        RelatedTo => "relatedto",
        /// Equivalent
        Equivalent => "equivalent",
        /// Identical
        Equal => "equal",
        /// Target is wider in meaning
        Wider => "wider",
        /// Target subsumes the source
        Subsumes => "subsumes",
        /// Target is narrower in meaning
        Narrower => "narrower",
        /// Target specializes the source
        Specializes => "specializes",
        /// Inexact relationship
        Inexact => "inexact",
        /// No match exists
        Unmatched => "unmatched",
        /// Disjoint concepts
        Disjoint => "disjoint",
    }
}

impl ConceptMapEquivalence {
    /// Symbol used in `conceptmap` blocks
    pub fn symbol(self) -> &'static str {
        match self {
            Self::RelatedTo => "-",
            Self::Equal => "=",
            Self::Equivalent => "==",
            Self::Disjoint => "!=",
            Self::Unmatched => "--",
            Self::Wider => "<=",
            Self::Subsumes => "<-",
            Self::Narrower => ">=",
            Self::Specializes => ">-",
            Self::Inexact => "~",
        }
    }

    /// Look up an equivalence by its symbol
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.symbol() == symbol)
    }

    /// True for equivalences that count as a usable translation
    pub fn is_acceptable(self) -> bool {
        matches!(
            self,
            Self::Equal | Self::RelatedTo | Self::Equivalent | Self::Wider
        )
    }
}

/// A transform parameter: a variable reference or a literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TransformParameter {
    /// Name of a rule variable, possibly dotted (`src.code`)
    Variable(String),
    /// Literal value
    Literal(Literal),
}

impl TransformParameter {
    /// String literal parameter
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Literal::String(value.into()))
    }

    /// Variable name, for variable parameters
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Self::Variable(name) => Some(name),
            Self::Literal(_) => None,
        }
    }

    /// Text of the parameter without quoting
    pub fn as_text(&self) -> String {
        match self {
            Self::Variable(name) => name.clone(),
            Self::Literal(literal) => literal.as_text(),
        }
    }
}

/// The map itself
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureMap {
    /// Canonical URL
    pub url: String,
    /// Computable name
    pub name: String,
    /// Human title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Publication status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Business version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Free text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `uses` declarations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structures: Vec<StructureMapStructure>,
    /// `imports` URLs, possibly containing one `*`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    /// Embedded concept maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contained: Vec<ConceptMap>,
    /// Groups, the first being the entry point
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl StructureMap {
    /// Empty map with the given identity
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Contained concept map by `#id` or `id`
    pub fn contained_concept_map(&self, reference: &str) -> Option<&ConceptMap> {
        let id = reference.strip_prefix('#').unwrap_or(reference);
        self.contained.iter().find(|cm| cm.id == id)
    }

    /// Type URL behind a `uses` alias, or the name itself
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.structures
            .iter()
            .find(|s| s.alias.as_deref() == Some(name))
            .map(|s| s.url.as_str())
            .unwrap_or(name)
    }
}

/// A `uses` declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureMapStructure {
    /// Structure definition URL
    pub url: String,
    /// Role in the map
    pub mode: ModelMode,
    /// Alias used by group inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Documentation comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// A named, parameterised set of rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group name
    pub name: String,
    /// Base group executed first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Type dispatch mode
    pub type_mode: GroupTypeMode,
    /// Documentation comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    /// Inputs in declaration order
    pub inputs: Vec<GroupInput>,
    /// Rules in declaration order
    pub rules: Vec<Rule>,
}

impl Group {
    /// Group with no inputs or rules
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            type_mode: GroupTypeMode::None,
            documentation: None,
            inputs: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Inputs of the given mode
    pub fn inputs_with_mode(&self, mode: InputMode) -> impl Iterator<Item = &GroupInput> {
        self.inputs.iter().filter(move |i| i.mode == mode)
    }
}

/// A group parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInput {
    /// Variable name
    pub name: String,
    /// Declared type, possibly a `uses` alias
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Direction
    pub mode: InputMode,
    /// Documentation comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// A transformation rule
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name, explicit or derived from the source
    pub name: String,
    /// Source specifications
    pub sources: Vec<RuleSource>,
    /// Target specifications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<RuleTarget>,
    /// Nested rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
    /// Group invocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<Dependent>,
    /// Documentation comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// Match half of a rule
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSource {
    /// Variable the source reads from, or `@search`
    pub context: String,
    /// Element name, or the search expression text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    /// Required type of the matched items
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Minimum cardinality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    /// Maximum cardinality (`*` or a number)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    /// Value used when nothing matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// List narrowing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_mode: Option<SourceListMode>,
    /// Variable bound to each matched item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// `where` expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// `check` expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// `log` expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

impl RuleSource {
    /// Source reading `element` from `context`
    pub fn new(context: impl Into<String>, element: Option<&str>) -> Self {
        Self {
            context: context.into(),
            element: element.map(str::to_string),
            ..Default::default()
        }
    }

    /// True for `search(...)` sources
    pub fn is_search(&self) -> bool {
        self.context == SEARCH_CONTEXT
    }
}

/// Context marker for search sources
pub const SEARCH_CONTEXT: &str = "@search";

/// Variable bound on both sides of an abbreviated `src.a -> tgt.a` rule
pub const AUTO_VARIABLE: &str = "vvv";

impl Rule {
    /// Name given to a rule written without one: the element of its single
    /// source with the capitalised type appended, or the bare context.
    /// Rules with several sources, or a search source, have no derived name.
    pub fn derived_name(&self) -> Option<String> {
        let [source] = self.sources.as_slice() else {
            return None;
        };
        if source.is_search() {
            return None;
        }
        let base = source.element.as_deref().unwrap_or(&source.context);
        Some(match &source.type_name {
            Some(type_name) if source.element.is_some() => {
                let mut chars = type_name.chars();
                let capitalised: String = match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                };
                format!("{base}{capitalised}")
            }
            _ => base.to_string(),
        })
    }

    /// True when the rule has the shape of the `src.a -> tgt.a` shorthand
    /// after the parser expanded it
    pub fn is_abbreviated(&self) -> bool {
        let ([source], [target]) = (self.sources.as_slice(), self.targets.as_slice()) else {
            return false;
        };
        source.element.is_some()
            && !source.is_search()
            && source.variable.as_deref() == Some(AUTO_VARIABLE)
            && target.context.is_some()
            && target.element.is_some()
            && target.variable.as_deref() == Some(AUTO_VARIABLE)
            && target.transform == Some(Transform::Create)
            && target.parameters.is_empty()
            && target.list_modes.is_empty()
            && self.rules.is_empty()
            && self.dependents.is_empty()
    }
}

/// Produce half of a rule
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    /// Variable the target writes into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Element written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    /// Variable bound to the produced value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// List modes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_modes: Vec<TargetListMode>,
    /// Id shared between `share` targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_rule_id: Option<String>,
    /// Transform producing the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    /// Transform parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TransformParameter>,
}

/// Invocation of another group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependent {
    /// Group name
    pub name: String,
    /// Arguments, matched to the group inputs by position
    pub parameters: Vec<TransformParameter>,
}

coded_enum! {
    /// What to do with codes a concept map group does not list
    UnmappedMode {
        /// Keep the source code
        Provided => "provided",
        /// Use a fixed code
        Fixed => "fixed",
        /// Defer to another map
        OtherMap => "other-map",
    }
}

/// Concept map, embedded in a map or registered separately
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMap {
    /// Local id, referenced as `#id`
    pub id: String,
    /// Canonical URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Publication status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Mappings grouped by source and target system
    pub groups: Vec<ConceptMapGroup>,
}

impl ConceptMap {
    /// Group for the source/target system pair, created when missing.
    /// A `None` target matches any group of the source system.
    pub fn group_mut(&mut self, source: &str, target: Option<&str>) -> &mut ConceptMapGroup {
        let position = self.groups.iter().position(|g| {
            g.source == source && (target.is_none() || g.target.is_none() || g.target.as_deref() == target)
        });
        let index = match position {
            Some(index) => index,
            None => {
                self.groups.push(ConceptMapGroup {
                    source: source.to_string(),
                    ..Default::default()
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[index];
        if group.target.is_none() {
            group.target = target.map(str::to_string);
        }
        group
    }
}

/// Mappings between one source system and one target system
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMapGroup {
    /// Source system
    pub source: String,
    /// Target system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Unmapped handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmapped: Option<UnmappedMode>,
    /// Source concepts
    pub elements: Vec<SourceElement>,
}

/// One source concept and its targets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceElement {
    /// Source code
    pub code: String,
    /// Targets in declaration order
    pub targets: Vec<TargetElement>,
}

/// One target concept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetElement {
    /// Target code, absent for `unmatched`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Relationship to the source
    pub equivalence: ConceptMapEquivalence,
    /// Trailing comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for transform in Transform::ALL {
            assert_eq!(Transform::from_code(transform.code()), Some(*transform));
        }
        assert_eq!(Transform::from_code("dateOp"), Some(Transform::DateOp));
        assert_eq!(SourceListMode::from_code("not_first"), Some(SourceListMode::NotFirst));
        assert_eq!(GroupTypeMode::TypeAndTypes.code(), "type-and-types");
    }

    #[test]
    fn equivalence_symbols_are_distinct() {
        for eq in ConceptMapEquivalence::ALL {
            assert_eq!(ConceptMapEquivalence::from_symbol(eq.symbol()), Some(*eq));
        }
        assert!(ConceptMapEquivalence::Wider.is_acceptable());
        assert!(!ConceptMapEquivalence::Narrower.is_acceptable());
    }

    #[test]
    fn concept_map_groups_merge_by_system() {
        let mut cm = ConceptMap::default();
        cm.group_mut("s", None);
        cm.group_mut("s", Some("t")).elements.push(SourceElement::default());
        cm.group_mut("u", Some("t"));
        assert_eq!(cm.groups.len(), 2);
        assert_eq!(cm.groups[0].target.as_deref(), Some("t"));
        assert_eq!(cm.groups[0].elements.len(), 1);
    }

    #[test]
    fn derived_names_follow_the_single_source() {
        let mut rule = Rule {
            sources: vec![RuleSource::new("src", Some("value"))],
            ..Default::default()
        };
        assert_eq!(rule.derived_name().as_deref(), Some("value"));
        rule.sources[0].type_name = Some("string".into());
        assert_eq!(rule.derived_name().as_deref(), Some("valueString"));
        rule.sources[0].element = None;
        assert_eq!(rule.derived_name().as_deref(), Some("src"));
        rule.sources.push(RuleSource::new("other", None));
        assert_eq!(rule.derived_name(), None);
    }

    #[test]
    fn aliases_resolve_to_urls() {
        let mut map = StructureMap::new("http://x/y", "Y");
        map.structures.push(StructureMapStructure {
            url: "http://hl7.org/fhir/StructureDefinition/Patient".into(),
            mode: ModelMode::Source,
            alias: Some("Pat".into()),
            documentation: None,
        });
        assert_eq!(map.resolve_alias("Pat"), "http://hl7.org/fhir/StructureDefinition/Patient");
        assert_eq!(map.resolve_alias("Other"), "Other");
    }
}
