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

//! Text rendering of a [`StructureMap`] in the current mapping syntax.
//!
//! Parsing the rendered text yields a map equal to the one rendered.

use std::fmt::Write;

use indexmap::IndexMap;

use crate::ast::Literal;
use crate::parser::escape_string;

use super::model::{
    ConceptMap, Dependent, Group, GroupTypeMode, Rule, RuleSource, RuleTarget, StructureMap,
    TargetListMode, Transform, TransformParameter,
};

const EOL: &str = "\r\n";

/// Render a whole map
pub fn render(map: &StructureMap) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "map {} = {}{EOL}",
        escape_string(&map.url, '"'),
        escape_string(&map.name, '"')
    );
    for (key, value) in [
        ("title", &map.title),
        ("status", &map.status),
        ("version", &map.version),
    ] {
        if let Some(value) = value {
            let _ = write!(out, "// {key} = {value}{EOL}");
        }
    }
    if let Some(description) = &map.description {
        for line in description.lines() {
            let _ = write!(out, "// description = {line}{EOL}");
        }
    }
    out.push_str(EOL);

    for concept_map in &map.contained {
        render_concept_map(&mut out, concept_map);
    }

    for structure in &map.structures {
        let _ = write!(out, "uses {}", escape_string(&structure.url, '"'));
        if let Some(alias) = &structure.alias {
            let _ = write!(out, " alias {alias}");
        }
        let _ = write!(out, " as {}", structure.mode);
        if let Some(documentation) = &structure.documentation {
            let _ = write!(out, " // {documentation}");
        }
        out.push_str(EOL);
    }
    for import in &map.imports {
        let _ = write!(out, "imports {}{EOL}", escape_string(import, '"'));
    }
    if !map.structures.is_empty() || !map.imports.is_empty() {
        out.push_str(EOL);
    }

    for group in &map.groups {
        render_group(&mut out, group);
    }
    out
}

/// Render one group, including its documentation
pub fn render_group(out: &mut String, group: &Group) {
    if let Some(documentation) = &group.documentation {
        write_comment_lines(out, documentation, "");
    }
    let _ = write!(out, "group {}(", group.name);
    for (index, input) in group.inputs.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} {}", input.mode, input.name);
        if let Some(type_name) = &input.type_name {
            let _ = write!(out, " : {type_name}");
        }
    }
    out.push(')');
    if let Some(extends) = &group.extends {
        let _ = write!(out, " extends {extends}");
    }
    match group.type_mode {
        GroupTypeMode::None => {}
        GroupTypeMode::Types => out.push_str(" <<types>>"),
        GroupTypeMode::TypeAndTypes => out.push_str(" <<type+>>"),
    }
    let _ = write!(out, " {{{EOL}");
    for rule in &group.rules {
        render_rule(out, rule, 1);
    }
    let _ = write!(out, "}}{EOL}{EOL}");
}

/// Render a rule at the given nesting depth
pub fn render_rule(out: &mut String, rule: &Rule, depth: usize) {
    let indent = "  ".repeat(depth);
    if let Some(documentation) = &rule.documentation {
        write_comment_lines(out, documentation, &indent);
    }
    let abbreviated = rule.is_abbreviated();
    out.push_str(&indent);
    for (index, source) in rule.sources.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        render_source(out, source, abbreviated);
    }
    if !rule.targets.is_empty() {
        out.push_str(" -> ");
        for (index, target) in rule.targets.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            render_target(out, target, abbreviated);
        }
    }
    if !rule.rules.is_empty() {
        let _ = write!(out, " then {{{EOL}");
        for nested in &rule.rules {
            render_rule(out, nested, depth + 1);
        }
        let _ = write!(out, "{indent}}}");
    } else if !rule.dependents.is_empty() {
        out.push_str(" then ");
        for (index, dependent) in rule.dependents.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            render_dependent(out, dependent);
        }
    }
    if rule.derived_name().as_deref() != Some(rule.name.as_str()) {
        let _ = write!(out, " {}", escape_string(&rule.name, '"'));
    }
    let _ = write!(out, ";{EOL}");
}

fn render_source(out: &mut String, source: &RuleSource, abbreviated: bool) {
    if source.is_search() {
        let _ = write!(out, "search({})", source.element.as_deref().unwrap_or_default());
    } else {
        out.push_str(&source.context);
        if let Some(element) = &source.element {
            let _ = write!(out, ".{}", element_text(element));
        }
    }
    if let Some(type_name) = &source.type_name {
        let _ = write!(out, " : {type_name}");
        if let Some(min) = source.min {
            let _ = write!(out, " {min}..{}", source.max.as_deref().unwrap_or("*"));
        }
    }
    if let Some(default) = &source.default_value {
        let _ = write!(out, " default {}", escape_string(default, '\''));
    }
    if let Some(list_mode) = source.list_mode {
        let _ = write!(out, " {list_mode}");
    }
    if let Some(variable) = &source.variable {
        if !abbreviated {
            let _ = write!(out, " as {variable}");
        }
    }
    for (keyword, expression) in [
        ("where", &source.condition),
        ("check", &source.check),
        ("log", &source.log_message),
    ] {
        if let Some(expression) = expression {
            let _ = write!(out, " {keyword} {expression}");
        }
    }
}

fn render_target(out: &mut String, target: &RuleTarget, abbreviated: bool) {
    if let Some(context) = &target.context {
        out.push_str(context);
        if let Some(element) = &target.element {
            let _ = write!(out, ".{}", element_text(element));
        }
    }
    if abbreviated {
        return;
    }
    if let Some(transform) = target.transform {
        if target.context.is_some() {
            out.push_str(" = ");
        }
        match (transform, target.parameters.as_slice()) {
            (Transform::Copy, [parameter]) => out.push_str(&parameter_text(parameter)),
            (Transform::Evaluate, [expression]) => {
                let _ = write!(out, "({})", expression.as_text());
            }
            (Transform::Evaluate, [focus, expression]) => {
                let _ = write!(
                    out,
                    "evaluate({}, {})",
                    parameter_text(focus),
                    expression.as_text()
                );
            }
            (transform, parameters) => {
                let _ = write!(out, "{transform}(");
                for (index, parameter) in parameters.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&parameter_text(parameter));
                }
                out.push(')');
            }
        }
    }
    if let Some(variable) = &target.variable {
        let _ = write!(out, " as {variable}");
    }
    for mode in &target.list_modes {
        let _ = write!(out, " {mode}");
        if *mode == TargetListMode::Share {
            let _ = write!(out, " {}", target.list_rule_id.as_deref().unwrap_or_default());
        }
    }
}

fn render_dependent(out: &mut String, dependent: &Dependent) {
    let _ = write!(out, "{}(", dependent.name);
    for (index, parameter) in dependent.parameters.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push_str(&parameter_text(parameter));
    }
    out.push(')');
}

fn parameter_text(parameter: &TransformParameter) -> String {
    match parameter {
        TransformParameter::Variable(name) => name.clone(),
        TransformParameter::Literal(Literal::String(value)) => escape_string(value, '\''),
        TransformParameter::Literal(literal) => literal.as_text(),
    }
}

/// Render an embedded concept map
pub fn render_concept_map(out: &mut String, concept_map: &ConceptMap) {
    let _ = write!(out, "conceptmap {} {{{EOL}", escape_string(&concept_map.id, '"'));

    let mut prefixes: IndexMap<&str, String> = IndexMap::new();
    for group in &concept_map.groups {
        for system in std::iter::once(group.source.as_str()).chain(group.target.as_deref()) {
            if !prefixes.contains_key(system) {
                let prefix = prefix_name(prefixes.len());
                prefixes.insert(system, prefix);
            }
        }
    }
    for (system, prefix) in &prefixes {
        let _ = write!(out, "  prefix {prefix} = {}{EOL}", escape_string(system, '"'));
    }
    out.push_str(EOL);

    for group in &concept_map.groups {
        let source_prefix = &prefixes[group.source.as_str()];
        if let Some(unmapped) = group.unmapped {
            let _ = write!(out, "  unmapped for {source_prefix} = {unmapped}{EOL}");
        }
        for element in &group.elements {
            for target in &element.targets {
                let _ = write!(
                    out,
                    "  {source_prefix}:{} {}",
                    code_text(&element.code),
                    target.equivalence.symbol()
                );
                if let (Some(code), Some(system)) = (&target.code, &group.target) {
                    let _ = write!(out, " {}:{}", prefixes[system.as_str()], code_text(code));
                }
                if let Some(comment) = &target.comment {
                    let _ = write!(out, " // {comment}");
                }
                out.push_str(EOL);
            }
        }
    }
    let _ = write!(out, "}}{EOL}{EOL}");
}

/// `s`, `t`, ... `z`, then `s1`, `t1`, ...
fn prefix_name(index: usize) -> String {
    let letter = (b's' + (index % 8) as u8) as char;
    match index / 8 {
        0 => letter.to_string(),
        round => format!("{letter}{round}"),
    }
}

fn is_plain_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

fn code_text(code: &str) -> String {
    if is_plain_name(code) || (!code.is_empty() && code.chars().all(|c| c.is_ascii_digit())) {
        code.to_string()
    } else {
        escape_string(code, '"')
    }
}

fn element_text(element: &str) -> String {
    if is_plain_name(element) {
        element.to_string()
    } else {
        escape_string(element, '`')
    }
}

fn write_comment_lines(out: &mut String, text: &str, indent: &str) {
    for line in text.lines() {
        let _ = write!(out, "{indent}// {line}{EOL}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::parser::parse_map;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_abbreviated_rules() {
        let map = parse_map(
            "map \"http://x/y\" = \"Y\" group Main(source src : A, target tgt : B) { src.name -> tgt.name; }",
        )
        .unwrap();
        let text = render(&map);
        assert_eq!(
            text,
            "map \"http://x/y\" = \"Y\"\r\n\r\n\
             group Main(source src : A, target tgt : B) {\r\n  src.name -> tgt.name;\r\n}\r\n\r\n"
        );
    }

    #[test]
    fn explicit_names_are_kept() {
        let map = parse_map(
            "map \"u\" = \"n\" group G(source src, target tgt) { src.a as a -> tgt.b = a \"copyA\"; src.c as c -> tgt.c = c; }",
        )
        .unwrap();
        let text = render(&map);
        assert!(text.contains("  src.a as a -> tgt.b = a \"copyA\";\r\n"));
        assert!(text.contains("  src.c as c -> tgt.c = c;\r\n"));
    }

    #[test]
    fn targets_render_by_transform() {
        let map = parse_map(
            "map \"u\" = \"n\" group G(source src, target tgt) {\n\
             src.a as a -> tgt.b = (a + 1), tgt.c = evaluate(a, a.first()), \
             tgt.d = truncate(a, 3), create('Coding') as cd first \"r\";\n}",
        )
        .unwrap();
        let text = render(&map);
        assert!(
            text.contains(
                "tgt.b = (a + 1), tgt.c = evaluate(a, a.first()), tgt.d = truncate(a, 3), create('Coding') as cd first \"r\";"
            ),
            "{text}"
        );
    }

    #[test]
    fn concept_map_prefixes() {
        assert_eq!(prefix_name(0), "s");
        assert_eq!(prefix_name(1), "t");
        assert_eq!(prefix_name(8), "s1");
    }

    #[test]
    fn renders_concept_maps() {
        let map = parse_map(
            "map \"u\" = \"n\"\n\
             conceptmap \"cm\" {\n\
               prefix a = \"http://src\"\n\
               prefix b = \"http://tgt\"\n\
               a:x == b:\"y-1\" // note\n\
               a:z --\n\
             }\n\
             group G(source src) { src -> src; }",
        )
        .unwrap();
        let text = render(&map);
        assert!(text.contains("  prefix s = \"http://src\"\r\n  prefix t = \"http://tgt\"\r\n"));
        assert!(text.contains("  s:x == t:\"y-1\" // note\r\n"));
        assert!(text.contains("  s:z --\r\n"));
    }
}
