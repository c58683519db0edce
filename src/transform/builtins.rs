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

//! Value-building transforms that need no rule context.
//!
//! Parameters arrive already resolved, in declaration order.

use log::debug;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::core::{FhirMapError, Result};
use crate::evaluator::{escape_html, escape_json, parse_quantity};
use crate::model::{FhirPathValue, Node};

use super::services::{Coding, TerminologyService};

pub(crate) const UCUM: &str = "http://unitsofmeasure.org";
const IDENTIFIER_TYPES: &str = "http://terminology.hl7.org/CodeSystem/v2-0203";

fn text(value: &FhirPathValue, transform: &str) -> Result<String> {
    value.as_string().ok_or_else(|| {
        FhirMapError::semantic(format!(
            "{transform}: expected a primitive value but found {}",
            value.type_name()
        ))
    })
}

fn arity(transform: &str, params: &[FhirPathValue], min: usize, max: usize) -> Result<()> {
    if params.len() < min || params.len() > max {
        return Err(FhirMapError::semantic(format!(
            "{transform} takes {min} to {max} parameters but was given {}",
            params.len()
        )));
    }
    Ok(())
}

fn primitive(type_name: &str, value: impl Into<String>) -> Node {
    Node::primitive(type_name, FhirPathValue::String(value.into()))
}

/// `truncate(value, length)`: the first `length` characters
pub fn truncate(params: &[FhirPathValue]) -> Result<FhirPathValue> {
    arity("truncate", params, 2, 2)?;
    let value = text(&params[0], "truncate")?;
    let length = params[1]
        .as_integer()
        .or_else(|| params[1].as_string().and_then(|s| s.parse().ok()))
        .filter(|l| *l >= 0)
        .ok_or_else(|| FhirMapError::semantic("truncate: length must be a non-negative integer"))?;
    Ok(FhirPathValue::String(value.chars().take(length as usize).collect()))
}

/// `append(a, b, ...)`: concatenated text of every parameter
pub fn append(params: &[FhirPathValue]) -> Result<FhirPathValue> {
    if params.is_empty() {
        return Err(FhirMapError::semantic("append needs at least one parameter"));
    }
    let mut joined = String::new();
    for param in params {
        joined.push_str(&text(param, "append")?);
    }
    Ok(FhirPathValue::String(joined))
}

/// `cast(value, type)`; only `string` is supported
pub fn cast(params: &[FhirPathValue]) -> Result<FhirPathValue> {
    match params {
        [_] => Err(FhirMapError::semantic(
            "Implicit type parameters on cast not yet supported",
        )),
        [value, target] => match text(target, "cast")?.as_str() {
            "string" => Ok(FhirPathValue::String(text(value, "cast")?)),
            other => Err(FhirMapError::semantic(format!(
                "cast to {other} not yet supported"
            ))),
        },
        _ => Err(FhirMapError::semantic("cast takes 1 or 2 parameters")),
    }
}

/// `escape(value, format)` with `json`, `xml` or `html`; a third parameter
/// naming the source format is accepted and ignored
pub fn escape(params: &[FhirPathValue]) -> Result<FhirPathValue> {
    arity("escape", params, 2, 3)?;
    let value = text(&params[0], "escape")?;
    let escaped = match text(&params[1], "escape")?.to_ascii_lowercase().as_str() {
        "json" => escape_json(&value),
        "xml" | "html" => escape_html(&value),
        other => {
            return Err(FhirMapError::semantic(format!(
                "escape to {other} is not supported"
            )));
        }
    };
    Ok(FhirPathValue::String(escaped))
}

/// Fresh lowercase UUID
pub fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Coding for `code` in `system`.
///
/// When the terminology service can expand `system` as a value set, the
/// code must occur in the expansion and takes its system and display from
/// it. Otherwise the display is whatever code validation reports.
pub fn build_coding(
    terminology: Option<&dyn TerminologyService>,
    system: &str,
    code: &str,
) -> Result<Coding> {
    let Some(terminology) = terminology else {
        return Ok(Coding::new(Some(system), code));
    };
    if let Some(expansion) = terminology.expand_value_set(system)? {
        let entry = expansion
            .into_iter()
            .find(|e| e.code.as_deref() == Some(code))
            .ok_or_else(|| {
                FhirMapError::semantic(format!(
                    "The code '{code}' is not in the value set '{system}'"
                ))
            })?;
        return Ok(Coding {
            system: entry.system,
            code: entry.code,
            display: entry.display,
        });
    }
    let display = terminology.validate_code(system, code)?;
    debug!("validated {system}|{code}: display {display:?}");
    Ok(Coding {
        system: Some(system.to_string()),
        code: Some(code.to_string()),
        display,
    })
}

/// `c(system, code[, display])`
pub fn coding(
    terminology: Option<&dyn TerminologyService>,
    params: &[FhirPathValue],
) -> Result<Node> {
    arity("c", params, 2, 3)?;
    let mut coding = build_coding(terminology, &text(&params[0], "c")?, &text(&params[1], "c")?)?;
    if let Some(display) = params.get(2) {
        coding.display = Some(text(display, "c")?);
    }
    Ok(coding.to_node())
}

/// `cc(text)` or `cc(system, code[, display])`
pub fn codeable_concept(
    terminology: Option<&dyn TerminologyService>,
    params: &[FhirPathValue],
) -> Result<Node> {
    arity("cc", params, 1, 3)?;
    let concept = Node::new("CodeableConcept");
    if let [label] = params {
        concept.set_child("text", primitive("string", text(label, "cc")?));
    } else {
        concept.add_child("coding", coding(terminology, params)?);
    }
    Ok(concept)
}

/// `qty(text)` such as `5.4 'mg'`, or `qty(value, unit[, system])`
pub fn quantity(params: &[FhirPathValue]) -> Result<Node> {
    let node = Node::new("Quantity");
    let (value, unit, system) = match params {
        [single] => {
            let raw = text(single, "qty")?;
            let parsed = parse_quantity(&raw).ok_or_else(|| {
                FhirMapError::semantic(format!("Unable to read '{raw}' as a quantity"))
            })?;
            (parsed.value, parsed.unit, Some(UCUM.to_string()))
        }
        [value, unit, rest @ ..] if rest.len() < 2 => {
            let number = match value.as_decimal() {
                Some(number) => number,
                None => {
                    let raw = text(value, "qty")?;
                    Decimal::from_str(&raw).map_err(|_| {
                        FhirMapError::semantic(format!("qty: '{raw}' is not a number"))
                    })?
                }
            };
            let system = rest.first().map(|s| text(s, "qty")).transpose()?;
            (number, text(unit, "qty")?, system)
        }
        _ => return Err(FhirMapError::semantic("qty takes 1 to 3 parameters")),
    };
    node.set_child("value", Node::primitive("decimal", FhirPathValue::Decimal(value)));
    node.set_child("unit", primitive("string", unit.clone()));
    if let Some(system) = system {
        node.set_child("system", primitive("uri", system));
        node.set_child("code", primitive("code", unit));
    }
    Ok(node)
}

/// `id(system, value[, type])`; the type is a code from the v2 identifier
/// type table
pub fn identifier(params: &[FhirPathValue]) -> Result<Node> {
    arity("id", params, 2, 3)?;
    let node = Node::new("Identifier");
    node.set_child("system", primitive("uri", text(&params[0], "id")?));
    node.set_child("value", primitive("string", text(&params[1], "id")?));
    if let Some(kind) = params.get(2) {
        let concept = Node::new("CodeableConcept");
        concept.add_child(
            "coding",
            Coding::new(Some(IDENTIFIER_TYPES), &text(kind, "id")?).to_node(),
        );
        node.set_child("type", concept);
    }
    Ok(node)
}

/// `cp(value)` or `cp(system, value)`
pub fn contact_point(params: &[FhirPathValue]) -> Result<Node> {
    let node = Node::new("ContactPoint");
    let value = match params {
        [system, value] => {
            node.set_child("system", primitive("code", text(system, "cp")?));
            value
        }
        [value] => value,
        _ => return Err(FhirMapError::semantic("cp takes 1 or 2 parameters")),
    };
    node.set_child("value", primitive("string", text(value, "cp")?));
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::services::ExpansionEntry;
    use pretty_assertions::assert_eq;

    fn s(text: &str) -> FhirPathValue {
        FhirPathValue::string(text)
    }

    fn child_text(node: &Node, name: &str) -> Option<String> {
        node.child(name).and_then(|c| c.value()).and_then(|v| v.as_string())
    }

    struct Terminology;

    impl TerminologyService for Terminology {
        fn validate_code(&self, _system: &str, code: &str) -> Result<Option<String>> {
            Ok((code == "male").then(|| "Male".to_string()))
        }

        fn expand_value_set(&self, url: &str) -> Result<Option<Vec<ExpansionEntry>>> {
            Ok((url == "http://vs/gender").then(|| {
                vec![ExpansionEntry {
                    system: Some("http://cs/gender".into()),
                    code: Some("f".into()),
                    display: Some("Female".into()),
                }]
            }))
        }
    }

    #[test]
    fn string_helpers() {
        assert_eq!(truncate(&[s("abcdef"), FhirPathValue::Integer(3)]).unwrap(), s("abc"));
        assert_eq!(append(&[s("a"), s("-"), FhirPathValue::Integer(1)]).unwrap(), s("a-1"));
        assert_eq!(escape(&[s("a\"b"), s("json")]).unwrap(), s("a\\\"b"));
        assert_eq!(escape(&[s("<a>"), s("xml")]).unwrap(), s("&lt;a&gt;"));
    }

    #[test]
    fn cast_only_handles_strings() {
        assert_eq!(cast(&[FhirPathValue::Integer(4), s("string")]).unwrap(), s("4"));
        assert!(cast(&[s("4"), s("integer")]).unwrap_err().to_string().contains("not yet supported"));
        assert!(cast(&[s("4")]).is_err());
    }

    #[test]
    fn uuids_are_lowercase() {
        let id = uuid();
        assert_eq!(id.len(), 36);
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn codings_use_terminology() {
        let node = coding(Some(&Terminology), &[s("http://cs"), s("male")]).unwrap();
        assert_eq!(child_text(&node, "display").as_deref(), Some("Male"));
        let node = coding(Some(&Terminology), &[s("http://vs/gender"), s("f")]).unwrap();
        assert_eq!(child_text(&node, "system").as_deref(), Some("http://cs/gender"));
        assert!(coding(Some(&Terminology), &[s("http://vs/gender"), s("m")]).is_err());
        let node = coding(None, &[s("http://cs"), s("x"), s("Ex")]).unwrap();
        assert_eq!(child_text(&node, "display").as_deref(), Some("Ex"));
    }

    #[test]
    fn codeable_concepts() {
        let text_only = codeable_concept(None, &[s("headache")]).unwrap();
        assert_eq!(child_text(&text_only, "text").as_deref(), Some("headache"));
        let coded = codeable_concept(None, &[s("http://cs"), s("x")]).unwrap();
        assert_eq!(coded.children("coding").len(), 1);
    }

    #[test]
    fn quantities() {
        let parsed = quantity(&[s("5.4 'mg'")]).unwrap();
        assert_eq!(child_text(&parsed, "unit").as_deref(), Some("mg"));
        assert_eq!(child_text(&parsed, "system").as_deref(), Some(UCUM));
        let plain = quantity(&[s("12"), s("kg")]).unwrap();
        assert_eq!(child_text(&plain, "value").as_deref(), Some("12"));
        assert!(plain.child("system").is_none());
    }

    #[test]
    fn identifiers_and_contact_points() {
        let id = identifier(&[s("http://ids"), s("123"), s("MR")]).unwrap();
        let coding = id.child("type").and_then(|t| t.child("coding")).unwrap();
        assert_eq!(child_text(&coding, "code").as_deref(), Some("MR"));
        let phone = contact_point(&[s("phone"), s("555")]).unwrap();
        assert_eq!(child_text(&phone, "system").as_deref(), Some("phone"));
        assert_eq!(child_text(&contact_point(&[s("555")]).unwrap(), "value").as_deref(), Some("555"));
    }
}
