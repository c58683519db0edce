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

//! Parser for the FHIR Mapping Language.
//!
//! Both the current syntax (`group Name(source src : A) { src -> tgt; }`)
//! and the legacy syntax (`input src : A as source` ... `endgroup`) are
//! accepted. Embedded FHIRPath is parsed with the same [`Lexer`], so an
//! expression ends at the first token that cannot continue it.

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::ast::Literal;
use crate::core::Result;
use crate::evaluator::HostFunctionResolver;
use crate::parser::{FhirPathParser, Lexer, parse_number};

use super::cache::ExpressionCache;
use super::model::{
    AUTO_VARIABLE, ConceptMap, ConceptMapEquivalence, Dependent, Group, GroupInput,
    GroupTypeMode, InputMode, ModelMode, Rule, RuleSource, RuleTarget, SEARCH_CONTEXT,
    SourceElement, SourceListMode, StructureMap, StructureMapStructure, TargetElement,
    TargetListMode, Transform, TransformParameter, UnmappedMode,
};

/// `key = value` comments after the map header
static METADATA_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(title|status|version|description)\s*=\s*(.*)$")
        .expect("metadata pattern is valid")
});

const SOURCE_LIST_MODES: &[&str] = &["first", "last", "not_first", "not_last", "only_one"];
const TARGET_LIST_MODES: &[&str] = &["first", "last", "share", "collate"];

/// Which grammar a group is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Legacy,
    Current,
}

/// Parser turning mapping text into a [`StructureMap`]
#[derive(Clone)]
pub struct MapParser<'h> {
    expressions: FhirPathParser<'h>,
    cache: ExpressionCache,
}

impl Default for MapParser<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl MapParser<'static> {
    /// Parser accepting only built-in FHIRPath functions
    pub fn new() -> Self {
        Self {
            expressions: FhirPathParser::new(),
            cache: ExpressionCache::new(),
        }
    }
}

impl<'h> MapParser<'h> {
    /// Parser that also accepts functions declared by `host` in embedded
    /// expressions
    pub fn with_host(host: &'h dyn HostFunctionResolver) -> Self {
        Self {
            expressions: FhirPathParser::with_host(host),
            cache: ExpressionCache::new(),
        }
    }

    /// Store parsed expressions in `cache` instead of a private table
    pub fn with_cache(mut self, cache: ExpressionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Parsed expressions keyed by the text stored in the rules
    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }

    /// Parse a complete map. `source_name` only appears in error messages.
    pub fn parse(&self, text: &str, source_name: &str) -> Result<StructureMap> {
        let mut lexer = Lexer::with_name(text, source_name)?;
        if lexer.done() {
            return Err(lexer.error("Map Input cannot be empty"));
        }
        let map = self.parse_map(&mut lexer)?;
        debug!(
            "Parsed map {} with {} groups and {} concept maps",
            map.url,
            map.groups.len(),
            map.contained.len()
        );
        Ok(map)
    }

    fn parse_map(&self, lexer: &mut Lexer) -> Result<StructureMap> {
        lexer.token("map")?;
        let url = lexer.read_constant("url")?;
        lexer.token("=")?;
        let name = lexer.read_constant("name")?;
        let mut map = StructureMap::new(url, name);

        let leftover = apply_metadata(&mut map, lexer.take_comments());
        let mut group_documentation = None;
        if !leftover.is_empty() {
            if lexer.has_token("group") {
                group_documentation = Some(leftover.join("\n"));
            } else {
                append_description(&mut map, &leftover.join("\n"));
            }
        }

        while lexer.has_token("conceptmap") {
            self.parse_concept_map(&mut map, lexer)?;
        }
        while lexer.has_token("uses") {
            self.parse_uses(&mut map, lexer)?;
        }
        while lexer.has_token("imports") {
            self.parse_imports(&mut map, lexer)?;
        }
        while lexer.has_token("conceptmap") {
            self.parse_concept_map(&mut map, lexer)?;
        }
        while !lexer.done() {
            let documentation = group_documentation.take().or_else(|| lexer.all_comments());
            let mut group = self.parse_group(lexer)?;
            group.documentation = documentation;
            map.groups.push(group);
        }
        Ok(map)
    }

    fn parse_concept_map(&self, map: &mut StructureMap, lexer: &mut Lexer) -> Result<()> {
        lexer.token("conceptmap")?;
        let id = lexer.read_constant("map id")?;
        if id.starts_with('#') {
            return Err(lexer.error("Concept Map identifier must not start with #"));
        }
        let mut concept_map = ConceptMap {
            id,
            ..Default::default()
        };
        lexer.token("{")?;
        lexer.take_comments();

        let mut prefixes: FxHashMap<String, String> = FxHashMap::default();
        while lexer.has_token("prefix") {
            lexer.token("prefix")?;
            let prefix = lexer.take()?;
            lexer.token("=")?;
            let system = lexer.read_constant("prefix url")?;
            prefixes.insert(prefix, system);
        }

        while !lexer.has_token("}") {
            if lexer.done() {
                return Err(lexer.error("premature termination expecting '}' in concept map"));
            }
            if lexer.has_token("unmapped") {
                lexer.token("unmapped")?;
                lexer.token("for")?;
                let system = read_prefix(&prefixes, lexer)?;
                lexer.token("=")?;
                let mode = lexer.take()?;
                if mode != UnmappedMode::Provided.code() {
                    return Err(lexer.error("Only unmapped mode PROVIDED is supported at this time"));
                }
                concept_map.group_mut(&system, None).unmapped = Some(UnmappedMode::Provided);
                continue;
            }

            let source_system = read_prefix(&prefixes, lexer)?;
            lexer.token(":")?;
            let source_code = read_code(lexer)?;
            let symbol = lexer.current().to_string();
            let mut line = lexer.current_start().line;
            let equivalence = ConceptMapEquivalence::from_symbol(&symbol)
                .ok_or_else(|| lexer.error(format!("Unknown equivalence token '{symbol}'")))?;
            lexer.next()?;

            let (target_system, target_code) = if equivalence == ConceptMapEquivalence::Unmatched {
                (None, None)
            } else {
                let system = read_prefix(&prefixes, lexer)?;
                lexer.token(":")?;
                line = lexer.current_start().line;
                (Some(system), Some(read_code(lexer)?))
            };
            let comment = lexer.trailing_comment(line);

            let group = concept_map.group_mut(&source_system, target_system.as_deref());
            let target = TargetElement {
                code: target_code,
                equivalence,
                comment,
            };
            match group.elements.iter_mut().find(|e| e.code == source_code) {
                Some(element) => element.targets.push(target),
                None => group.elements.push(SourceElement {
                    code: source_code,
                    targets: vec![target],
                }),
            }
        }
        lexer.token("}")?;
        trace!("Parsed concept map #{}", concept_map.id);
        map.contained.push(concept_map);
        Ok(())
    }

    fn parse_uses(&self, map: &mut StructureMap, lexer: &mut Lexer) -> Result<()> {
        lexer.token("uses")?;
        let url = lexer.read_constant("url")?;
        let alias = if lexer.skip_token("alias")? {
            Some(lexer.take()?)
        } else {
            None
        };
        lexer.token("as")?;
        let line = lexer.current_start().line;
        let code = lexer.current().to_string();
        let mode = ModelMode::from_code(&code)
            .ok_or_else(|| lexer.error(format!("Unknown structure mode '{code}'")))?;
        lexer.next()?;
        lexer.skip_token(";")?;
        let documentation = lexer.trailing_comment(line);
        map.structures.push(StructureMapStructure {
            url,
            mode,
            alias,
            documentation,
        });
        Ok(())
    }

    fn parse_imports(&self, map: &mut StructureMap, lexer: &mut Lexer) -> Result<()> {
        lexer.token("imports")?;
        map.imports.push(lexer.read_constant("url")?);
        lexer.skip_token(";")?;
        Ok(())
    }

    fn parse_group(&self, lexer: &mut Lexer) -> Result<Group> {
        lexer.token("group")?;
        let mut type_mode = GroupTypeMode::None;
        if lexer.skip_token("for")? {
            if lexer.skip_token("type")? {
                lexer.token("+")?;
                lexer.token("types")?;
                type_mode = GroupTypeMode::TypeAndTypes;
            } else {
                lexer.token("types")?;
                type_mode = GroupTypeMode::Types;
            }
        }
        let mut group = Group::new(lexer.take()?);
        group.type_mode = type_mode;

        let mut syntax = Syntax::Legacy;
        if lexer.skip_token("(")? {
            syntax = Syntax::Current;
            while !lexer.has_token(")") {
                if lexer.done() {
                    return Err(lexer.error("premature termination expecting ')'"));
                }
                group.inputs.push(self.parse_input(lexer, syntax)?);
                lexer.skip_token(",")?;
            }
            lexer.token(")")?;
        }
        if lexer.skip_token("extends")? {
            group.extends = Some(lexer.take()?);
        }

        match syntax {
            Syntax::Current => {
                if lexer.skip_token("<")? {
                    lexer.token("<")?;
                    if lexer.skip_token("types")? {
                        group.type_mode = GroupTypeMode::Types;
                    } else {
                        lexer.token("type")?;
                        lexer.token("+")?;
                        group.type_mode = GroupTypeMode::TypeAndTypes;
                    }
                    lexer.token(">")?;
                    lexer.token(">")?;
                }
                lexer.token("{")?;
                while !lexer.has_token("}") {
                    if lexer.done() {
                        return Err(lexer.error("premature termination expecting '}'"));
                    }
                    group.rules.push(self.parse_rule(lexer, syntax)?);
                }
                lexer.token("}")?;
                lexer.skip_token(";")?;
            }
            Syntax::Legacy => {
                while lexer.has_token("input") {
                    group.inputs.push(self.parse_input(lexer, syntax)?);
                }
                while !lexer.has_token("endgroup") {
                    if lexer.done() {
                        return Err(lexer.error("premature termination expecting 'endgroup'"));
                    }
                    group.rules.push(self.parse_rule(lexer, syntax)?);
                }
                lexer.token("endgroup")?;
            }
        }
        trace!("Parsed group {} with {} rules", group.name, group.rules.len());
        Ok(group)
    }

    fn parse_input(&self, lexer: &mut Lexer, syntax: Syntax) -> Result<GroupInput> {
        let read_mode = |lexer: &mut Lexer| -> Result<InputMode> {
            let code = lexer.current().to_string();
            let mode = InputMode::from_code(&code)
                .ok_or_else(|| lexer.error(format!("Unknown input mode '{code}'")))?;
            lexer.next()?;
            Ok(mode)
        };

        match syntax {
            Syntax::Current => {
                let mode = read_mode(lexer)?;
                let name = lexer.take()?;
                let type_name = if lexer.skip_token(":")? {
                    Some(lexer.take_dotted_token()?)
                } else {
                    None
                };
                Ok(GroupInput {
                    name,
                    type_name,
                    mode,
                    documentation: None,
                })
            }
            Syntax::Legacy => {
                lexer.token("input")?;
                let name = lexer.take()?;
                let type_name = if lexer.skip_token(":")? {
                    Some(lexer.take_dotted_token()?)
                } else {
                    None
                };
                lexer.token("as")?;
                let line = lexer.current_start().line;
                let mode = read_mode(lexer)?;
                lexer.skip_token(";")?;
                Ok(GroupInput {
                    name,
                    type_name,
                    mode,
                    documentation: lexer.trailing_comment(line),
                })
            }
        }
    }

    fn parse_rule(&self, lexer: &mut Lexer, syntax: Syntax) -> Result<Rule> {
        let mut rule = Rule {
            documentation: lexer.all_comments(),
            ..Default::default()
        };
        if syntax == Syntax::Legacy {
            rule.name = lexer.take_dotted_token()?;
            lexer.token(":")?;
            lexer.token("for")?;
        }

        loop {
            rule.sources.push(self.parse_source(lexer)?);
            if !lexer.skip_token(",")? {
                break;
            }
        }

        let arrow = match syntax {
            Syntax::Current => "->",
            Syntax::Legacy => "make",
        };
        if lexer.skip_token(arrow)? {
            loop {
                rule.targets.push(self.parse_target(lexer)?);
                if !lexer.skip_token(",")? {
                    break;
                }
            }
        }

        if lexer.skip_token("then")? {
            if lexer.skip_token("{")? {
                while !lexer.has_token("}") {
                    if lexer.done() {
                        return Err(lexer.error("premature termination expecting '}' in nested rules"));
                    }
                    rule.rules.push(self.parse_rule(lexer, syntax)?);
                }
                lexer.token("}")?;
            } else {
                loop {
                    rule.dependents.push(self.parse_dependent(lexer)?);
                    if !lexer.skip_token(",")? {
                        break;
                    }
                }
            }
        }

        if is_simple_syntax(&rule) {
            rule.sources[0].variable = Some(AUTO_VARIABLE.to_string());
            rule.targets[0].variable = Some(AUTO_VARIABLE.to_string());
            rule.targets[0].transform = Some(Transform::Create);
        }

        match syntax {
            Syntax::Current => {
                if lexer.is_string_constant() {
                    rule.name = lexer.read_constant("rule name")?;
                } else if lexer.is_token() {
                    rule.name = lexer.take()?;
                } else {
                    rule.name = rule
                        .derived_name()
                        .ok_or_else(|| lexer.error("Complex rules must have an explicit name"))?;
                }
                lexer.token(";")?;
            }
            Syntax::Legacy => {
                lexer.skip_token(";")?;
            }
        }
        Ok(rule)
    }

    fn parse_source(&self, lexer: &mut Lexer) -> Result<RuleSource> {
        let context = lexer.take()?;
        let mut source = RuleSource::new(context, None);
        if source.context == "search" && lexer.has_token("(") {
            lexer.token("(")?;
            source.context = SEARCH_CONTEXT.to_string();
            source.element = Some(self.expression(lexer)?);
            lexer.token(")")?;
        } else if lexer.skip_token(".")? {
            source.element = Some(if lexer.is_fixed_name() {
                lexer.read_fixed_name("element name")?
            } else {
                lexer.take()?
            });
        }

        if lexer.skip_token(":")? {
            source.type_name = Some(lexer.take_dotted_token()?);
            if lexer.current().chars().all(|c| c.is_ascii_digit()) && !lexer.done() {
                source.min = Some(lexer.take_int()?);
                lexer.token("..")?;
                source.max = Some(lexer.take()?);
            }
        }
        if lexer.skip_token("default")? {
            source.default_value = Some(lexer.read_constant("default value")?);
        }
        if lexer.has_any(SOURCE_LIST_MODES) {
            source.list_mode = SourceListMode::from_code(&lexer.take()?);
        }
        if lexer.skip_token("as")? {
            source.variable = Some(lexer.take()?);
        }
        if lexer.skip_token("where")? {
            source.condition = Some(self.expression(lexer)?);
        }
        if lexer.skip_token("check")? {
            source.check = Some(self.expression(lexer)?);
        }
        if lexer.skip_token("log")? {
            source.log_message = Some(self.expression(lexer)?);
        }
        Ok(source)
    }

    fn parse_target(&self, lexer: &mut Lexer) -> Result<RuleTarget> {
        let mut target = RuleTarget::default();
        let mut start = Some(lexer.take()?);
        if lexer.skip_token(".")? {
            target.context = start.take();
            target.element = Some(lexer.take()?);
        }

        let mut is_constant = false;
        let name = if lexer.skip_token("=")? {
            if start.is_some() {
                target.context = start;
            }
            is_constant = lexer.is_constant();
            Some(lexer.take()?)
        } else {
            start
        };

        match name.as_deref() {
            Some("(") => {
                target.transform = Some(Transform::Evaluate);
                let expression = self.expression(lexer)?;
                target.parameters.push(TransformParameter::string(expression));
                lexer.token(")")?;
            }
            Some(code) if lexer.has_token("(") => {
                let transform = Transform::from_code(code)
                    .ok_or_else(|| lexer.error(format!("Unknown transform name '{code}'")))?;
                target.transform = Some(transform);
                lexer.token("(")?;
                if transform == Transform::Evaluate {
                    target.parameters.push(self.parse_parameter(lexer)?);
                    lexer.token(",")?;
                    let expression = self.expression(lexer)?;
                    target.parameters.push(TransformParameter::string(expression));
                } else {
                    while !lexer.has_token(")") {
                        target.parameters.push(self.parse_parameter(lexer)?);
                        if !lexer.has_token(")") {
                            lexer.token(",")?;
                        }
                    }
                }
                lexer.token(")")?;
            }
            Some(value) => {
                target.transform = Some(Transform::Copy);
                let parameter = if is_constant {
                    TransformParameter::Literal(read_literal(value, lexer)?)
                } else {
                    let mut id = value.to_string();
                    while lexer.has_token(".") {
                        id.push_str(&lexer.take()?);
                        id.push_str(&lexer.take()?);
                    }
                    TransformParameter::Variable(id)
                };
                target.parameters.push(parameter);
            }
            None => {}
        }

        if lexer.skip_token("as")? {
            target.variable = Some(lexer.take()?);
        }
        while lexer.has_any(TARGET_LIST_MODES) {
            let code = lexer.take()?;
            if let Some(mode) = TargetListMode::from_code(&code) {
                if mode == TargetListMode::Share {
                    target.list_rule_id = Some(lexer.take()?);
                }
                target.list_modes.push(mode);
            }
        }
        Ok(target)
    }

    fn parse_parameter(&self, lexer: &mut Lexer) -> Result<TransformParameter> {
        if !lexer.is_constant() {
            Ok(TransformParameter::Variable(lexer.take()?))
        } else if lexer.is_string_constant() {
            Ok(TransformParameter::string(lexer.read_constant("parameter")?))
        } else {
            let raw = lexer.take()?;
            Ok(TransformParameter::Literal(read_literal(&raw, lexer)?))
        }
    }

    fn parse_dependent(&self, lexer: &mut Lexer) -> Result<Dependent> {
        let name = lexer.take()?;
        lexer.token("(")?;
        let mut parameters = Vec::new();
        while !lexer.has_token(")") {
            parameters.push(self.parse_parameter(lexer)?);
            if !lexer.skip_token(",")? {
                break;
            }
        }
        lexer.token(")")?;
        Ok(Dependent { name, parameters })
    }

    /// Parse an embedded expression, returning the canonical text stored in
    /// the rule and caching the tree under that text
    fn expression(&self, lexer: &mut Lexer) -> Result<String> {
        let node = self.expressions.parse_from(lexer)?;
        let text = node.to_string();
        self.cache.insert(text.clone(), node);
        Ok(text)
    }
}

/// Parse mapping text with a default parser
pub fn parse_map(text: &str) -> Result<StructureMap> {
    MapParser::new().parse(text, "map")
}

fn is_simple_syntax(rule: &Rule) -> bool {
    let ([source], [target]) = (rule.sources.as_slice(), rule.targets.as_slice()) else {
        return false;
    };
    source.element.is_some()
        && !source.is_search()
        && source.variable.is_none()
        && target.context.is_some()
        && target.element.is_some()
        && target.variable.is_none()
        && target.transform.is_none()
        && target.parameters.is_empty()
        && target.list_modes.is_empty()
        && rule.dependents.is_empty()
        && rule.rules.is_empty()
}

/// Apply `key = value` comments to the map and return the others
fn apply_metadata(map: &mut StructureMap, comments: Vec<String>) -> Vec<String> {
    let mut leftover = Vec::new();
    for comment in comments {
        let Some(captures) = METADATA_COMMENT.captures(&comment) else {
            leftover.push(comment);
            continue;
        };
        let value = captures[2].trim().to_string();
        match &captures[1] {
            "title" => map.title = Some(value),
            "status" => map.status = Some(value),
            "version" => map.version = Some(value),
            _ => append_description(map, &value),
        }
    }
    leftover
}

fn append_description(map: &mut StructureMap, text: &str) {
    match &mut map.description {
        Some(description) => {
            description.push('\n');
            description.push_str(text);
        }
        None => map.description = Some(text.to_string()),
    }
}

fn read_prefix(prefixes: &FxHashMap<String, String>, lexer: &mut Lexer) -> Result<String> {
    let prefix = lexer.current().to_string();
    let system = prefixes
        .get(&prefix)
        .cloned()
        .ok_or_else(|| lexer.error(format!("Unknown prefix '{prefix}'")))?;
    lexer.next()?;
    Ok(system)
}

fn read_code(lexer: &mut Lexer) -> Result<String> {
    if lexer.is_string_constant() {
        lexer.read_constant("code")
    } else {
        lexer.take()
    }
}

/// Interpret an unquoted constant token
fn read_literal(raw: &str, lexer: &Lexer) -> Result<Literal> {
    if raw.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some(number) = parse_number(raw) {
            return Ok(number);
        }
    }
    Ok(match raw {
        "true" => Literal::Boolean(true),
        "false" => Literal::Boolean(false),
        _ => Literal::String(lexer.process_constant(raw)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> StructureMap {
        parse_map(text).unwrap()
    }

    #[test]
    fn parses_minimal_map() {
        let map = parse(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : A, target tgt : B) {\n  src -> tgt;\n}\n",
        );
        assert_eq!(map.url, "http://x/y");
        assert_eq!(map.name, "Y");
        let group = &map.groups[0];
        assert_eq!(group.name, "Main");
        assert_eq!(group.inputs.len(), 2);
        assert_eq!(group.inputs[1].mode, InputMode::Target);
        assert_eq!(group.inputs[1].type_name.as_deref(), Some("B"));
        let rule = &group.rules[0];
        assert_eq!(rule.name, "src");
        assert_eq!(rule.targets[0].transform, Some(Transform::Copy));
        assert_eq!(
            rule.targets[0].parameters,
            vec![TransformParameter::Variable("tgt".into())]
        );
    }

    #[test]
    fn simple_syntax_expands_to_create() {
        let map = parse("map \"u\" = \"n\" group G(source src, target tgt) { src.name -> tgt.name; }");
        let rule = &map.groups[0].rules[0];
        assert_eq!(rule.name, "name");
        assert_eq!(rule.sources[0].variable.as_deref(), Some(AUTO_VARIABLE));
        assert_eq!(rule.targets[0].variable.as_deref(), Some(AUTO_VARIABLE));
        assert_eq!(rule.targets[0].transform, Some(Transform::Create));
        assert!(rule.is_abbreviated());
    }

    #[test]
    fn source_clauses_are_read_in_order() {
        let parser = MapParser::new();
        let map = parser
            .parse(
                "map \"u\" = \"n\" group G(source src, target tgt) {\n\
                 src.value : string 0..1 default 'x' first as v where v.length() > 2 \
                 check v != 'y' log v -> tgt.value = v \"copyValue\";\n}",
                "test",
            )
            .unwrap();
        let source = &map.groups[0].rules[0].sources[0];
        assert_eq!(source.type_name.as_deref(), Some("string"));
        assert_eq!(source.min, Some(0));
        assert_eq!(source.max.as_deref(), Some("1"));
        assert_eq!(source.default_value.as_deref(), Some("x"));
        assert_eq!(source.list_mode, Some(SourceListMode::First));
        assert_eq!(source.variable.as_deref(), Some("v"));
        let condition = source.condition.as_deref().unwrap();
        assert!(parser.cache().get(condition).is_some());
        assert!(source.check.is_some());
        assert_eq!(source.log_message.as_deref(), Some("v"));
        assert_eq!(map.groups[0].rules[0].name, "copyValue");
    }

    #[test]
    fn target_forms() {
        let map = parse(
            "map \"u\" = \"n\" group G(source src, target tgt) {\n\
             src.a as a -> tgt.b = create('Coding') as c, tgt.c = 'fixed', tgt.d = (a + 1), \
             tgt.e = evaluate(a, a.first()), tgt.f = src.a.b, tgt.g = 3 first share k \"r\";\n}",
        );
        let targets = &map.groups[0].rules[0].targets;
        assert_eq!(targets[0].transform, Some(Transform::Create));
        assert_eq!(targets[0].parameters, vec![TransformParameter::string("Coding")]);
        assert_eq!(targets[0].variable.as_deref(), Some("c"));
        assert_eq!(targets[1].parameters, vec![TransformParameter::string("fixed")]);
        assert_eq!(targets[2].transform, Some(Transform::Evaluate));
        assert_eq!(targets[2].parameters.len(), 1);
        assert_eq!(targets[3].parameters[0], TransformParameter::Variable("a".into()));
        assert_eq!(targets[4].parameters[0], TransformParameter::Variable("src.a.b".into()));
        assert_eq!(targets[5].parameters[0], TransformParameter::Literal(Literal::Integer(3)));
        assert_eq!(targets[5].list_modes, vec![TargetListMode::First, TargetListMode::Share]);
        assert_eq!(targets[5].list_rule_id.as_deref(), Some("k"));
    }

    #[test]
    fn dependents_and_nested_rules() {
        let map = parse(
            "map \"u\" = \"n\" group G(source src, target tgt) {\n\
             src.a as a -> tgt.a as t then Inner(a, t) \"deps\";\n\
             src.b as b then { b.c as c -> tgt.c = c \"inner\"; } \"nested\";\n}",
        );
        let rules = &map.groups[0].rules;
        assert_eq!(rules[0].dependents[0].name, "Inner");
        assert_eq!(rules[0].dependents[0].parameters.len(), 2);
        assert_eq!(rules[1].rules[0].name, "inner");
        assert!(rules[1].targets.is_empty());
    }

    #[test]
    fn legacy_groups() {
        let map = parse(
            "map \"u\" = \"n\"\n\
             group for types Legacy\n\
               input src : A as source // the source\n\
               input tgt : B as target\n\
               copy: for src.a as a make tgt.a = a\n\
             endgroup\n",
        );
        let group = &map.groups[0];
        assert_eq!(group.type_mode, GroupTypeMode::Types);
        assert_eq!(group.inputs[0].documentation.as_deref(), Some("the source"));
        assert_eq!(group.inputs[1].documentation, None);
        assert_eq!(group.rules[0].name, "copy");
    }

    #[test]
    fn group_type_modes_in_current_syntax() {
        let map = parse(
            "map \"u\" = \"n\"\n\
             group A(source s : X, target t : Y) extends B <<type+>> { }\n\
             group B(source s : X, target t : Y) <<types>> { };",
        );
        assert_eq!(map.groups[0].type_mode, GroupTypeMode::TypeAndTypes);
        assert_eq!(map.groups[0].extends.as_deref(), Some("B"));
        assert_eq!(map.groups[1].type_mode, GroupTypeMode::Types);
    }

    #[test]
    fn concept_maps_group_by_system() {
        let map = parse(
            "map \"u\" = \"n\"\n\
             conceptmap \"cm\" {\n\
               prefix s = \"http://src\"\n\
               prefix t = \"http://tgt\"\n\
               unmapped for s = provided\n\
               s:a == t:x // same\n\
               s:\"b-1\" = t:y\n\
               s:c --\n\
             }\n\
             group G(source src) { src -> src; }",
        );
        let cm = map.contained_concept_map("#cm").unwrap();
        assert_eq!(cm.groups.len(), 1);
        let group = &cm.groups[0];
        assert_eq!(group.target.as_deref(), Some("http://tgt"));
        assert_eq!(group.unmapped, Some(UnmappedMode::Provided));
        assert_eq!(group.elements[0].targets[0].comment.as_deref(), Some("same"));
        assert_eq!(group.elements[1].code, "b-1");
        assert_eq!(group.elements[2].targets[0].code, None);
    }

    #[test]
    fn metadata_comments_fill_the_header() {
        let map = parse(
            "map \"u\" = \"n\"\n\
             // title = Demo\n\
             // status = draft\n\
             // free text\n\
             uses \"http://a\" alias A as source // input model\n\
             uses \"http://b\" as target\n\
             imports \"http://other/*\"\n\
             // main entry\n\
             group G(source src : A) { src -> src; }",
        );
        assert_eq!(map.title.as_deref(), Some("Demo"));
        assert_eq!(map.status.as_deref(), Some("draft"));
        assert_eq!(map.description.as_deref(), Some("free text"));
        assert_eq!(map.structures[0].documentation.as_deref(), Some("input model"));
        assert_eq!(map.structures[1].documentation, None);
        assert_eq!(map.imports, vec!["http://other/*".to_string()]);
        assert_eq!(map.groups[0].documentation.as_deref(), Some("main entry"));
    }

    #[test]
    fn errors_are_reported() {
        let cases = [
            ("", "Map Input cannot be empty"),
            ("map \"u\" = \"n\" group G(source a, source b) { a, b -> a; }", "Complex rules must have an explicit name"),
            ("map \"u\" = \"n\" conceptmap \"cm\" { s:a = t:b }", "Unknown prefix 's'"),
            ("map \"u\" = \"n\" conceptmap \"#cm\" { }", "must not start with #"),
            ("map \"u\" = \"n\" conceptmap \"cm\" { prefix s = \"x\" s:a <> s:b }", "Unknown equivalence token"),
            ("map \"u\" = \"n\" conceptmap \"cm\" { prefix s = \"x\" unmapped for s = fixed }", "Only unmapped mode PROVIDED"),
            ("map \"u\" = \"n\" group G(source a) { a -> a;", "premature termination"),
            ("map \"u\" = \"n\" group G(source a) { a -> b = bogus(a); }", "Unknown transform name 'bogus'"),
        ];
        for (text, message) in cases {
            let err = parse_map(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Syntax, "{text}");
            assert!(err.to_string().contains(message), "{err} does not mention {message}");
        }
    }
}
