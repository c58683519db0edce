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

//! Built-in function implementations

use base64::Engine as _;
use base64::engine::general_purpose;
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use super::context::EvaluationContext;
use super::conversions::{Conversion, convert};
use super::engine::{FhirPathEngine, convert_to_boolean};
use super::operators::{contains_item, item_equals, union};
use crate::ast::{BuiltinFunction, ExpressionNode, Function};
use crate::core::{FhirMapError, Result};
use crate::model::{Collection, FhirPathValue, Quantity};

fn invalid(function: BuiltinFunction, message: impl std::fmt::Display) -> FhirMapError {
    FhirMapError::evaluation(format!("Error evaluating {}: {message}", function.name()))
}

fn distinct(values: &Collection) -> Collection {
    let mut result: Collection = Vec::with_capacity(values.len());
    for value in values {
        if !contains_item(&result, value) {
            result.push(value.clone());
        }
    }
    result
}

impl FhirPathEngine {
    pub(crate) fn execute_function(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        function: &Function,
        parameters: &[ExpressionNode],
    ) -> Result<Collection> {
        match function {
            Function::Builtin(builtin) => self.execute_builtin(ctx, focus, *builtin, parameters),
            Function::Custom(name) => {
                let host = self.host().ok_or_else(|| {
                    FhirMapError::evaluation(format!("The name {name} is not a valid function name"))
                })?;
                let values = parameters
                    .iter()
                    .map(|p| self.execute(ctx, focus, p, true))
                    .collect::<Result<Vec<_>>>()?;
                host.execute(name, focus, &values)
            }
        }
    }

    fn param(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        parameters: &[ExpressionNode],
        index: usize,
    ) -> Result<Collection> {
        match parameters.get(index) {
            Some(p) => self.execute(ctx, focus, p, true),
            None => Ok(Vec::new()),
        }
    }

    fn string_param(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        parameters: &[ExpressionNode],
        index: usize,
        function: BuiltinFunction,
    ) -> Result<Option<String>> {
        let values = self.param(ctx, focus, parameters, index)?;
        match values.as_slice() {
            [] => Ok(None),
            [single] => Ok(single.as_string()),
            _ => Err(invalid(function, "parameter must be a single value")),
        }
    }

    fn integer_param(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        parameters: &[ExpressionNode],
        index: usize,
        function: BuiltinFunction,
    ) -> Result<Option<i64>> {
        let values = self.param(ctx, focus, parameters, index)?;
        match values.as_slice() {
            [] => Ok(None),
            [single] => single
                .as_integer()
                .map(Some)
                .ok_or_else(|| invalid(function, "parameter must be an integer")),
            _ => Err(invalid(function, "parameter must be a single integer")),
        }
    }

    /// Evaluate `expression` once per item with `$this` bound
    fn per_item(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        expression: &ExpressionNode,
    ) -> Result<Vec<(FhirPathValue, Collection)>> {
        focus
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let item_ctx = ctx.for_item(item, index);
                let result = self.execute(&item_ctx, &vec![item.clone()], expression, true)?;
                Ok((item.clone(), result))
            })
            .collect()
    }

    fn type_param(parameters: &[ExpressionNode], function: BuiltinFunction) -> Result<String> {
        parameters
            .first()
            .and_then(ExpressionNode::qualified_name)
            .ok_or_else(|| invalid(function, "parameter must be a type name"))
    }

    fn execute_builtin(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        function: BuiltinFunction,
        parameters: &[ExpressionNode],
    ) -> Result<Collection> {
        use BuiltinFunction as F;

        let result: Collection = match function {
            // existence
            F::Empty => vec![focus.is_empty().into()],
            F::Exists => match parameters.first() {
                Some(criteria) => {
                    let matched = self
                        .per_item(ctx, focus, criteria)?
                        .into_iter()
                        .any(|(_, r)| convert_to_boolean(&r));
                    vec![matched.into()]
                }
                None => vec![(!focus.is_empty()).into()],
            },
            F::Not => match focus.as_slice() {
                [] => Vec::new(),
                [single] => vec![(!single.as_boolean().unwrap_or(true)).into()],
                _ => return Err(invalid(function, "focus must be a single value")),
            },
            F::All => match parameters.first() {
                Some(criteria) => {
                    let all = self
                        .per_item(ctx, focus, criteria)?
                        .into_iter()
                        .all(|(_, r)| convert_to_boolean(&r));
                    vec![all.into()]
                }
                None => vec![focus.iter().all(|v| v.as_boolean() == Some(true)).into()],
            },
            F::AllTrue => vec![focus.iter().all(|v| v.as_boolean() == Some(true)).into()],
            F::AnyTrue => vec![focus.iter().any(|v| v.as_boolean() == Some(true)).into()],
            F::AllFalse => vec![focus.iter().all(|v| v.as_boolean() == Some(false)).into()],
            F::AnyFalse => vec![focus.iter().any(|v| v.as_boolean() == Some(false)).into()],
            F::Count => vec![FhirPathValue::Integer(focus.len() as i64)],
            F::Distinct => distinct(focus),
            F::IsDistinct => vec![(distinct(focus).len() == focus.len()).into()],
            F::SubsetOf => {
                let other = self.param(ctx, focus, parameters, 0)?;
                vec![focus.iter().all(|v| contains_item(&other, v)).into()]
            }
            F::SupersetOf => {
                let other = self.param(ctx, focus, parameters, 0)?;
                vec![other.iter().all(|v| contains_item(focus, v)).into()]
            }
            F::HasValue => match focus.as_slice() {
                [single] => vec![single.has_primitive().into()],
                _ => vec![false.into()],
            },

            // filtering and projection
            F::Where => {
                let criteria = parameters.first().ok_or_else(|| invalid(function, "missing criteria"))?;
                self.per_item(ctx, focus, criteria)?
                    .into_iter()
                    .filter(|(_, r)| convert_to_boolean(r))
                    .map(|(item, _)| item)
                    .collect()
            }
            F::Select => {
                let projection = parameters.first().ok_or_else(|| invalid(function, "missing projection"))?;
                self.per_item(ctx, focus, projection)?
                    .into_iter()
                    .flat_map(|(_, r)| r)
                    .collect()
            }
            F::Repeat => {
                let projection = parameters.first().ok_or_else(|| invalid(function, "missing projection"))?;
                let mut result: Collection = Vec::new();
                let mut pending = focus.clone();
                while !pending.is_empty() {
                    let mut next = Vec::new();
                    for (_, produced) in self.per_item(ctx, &pending, projection)? {
                        for value in produced {
                            if !contains_item(&result, &value) {
                                result.push(value.clone());
                                next.push(value);
                            }
                        }
                    }
                    pending = next;
                }
                result
            }
            F::Aggregate => {
                let aggregator = parameters.first().ok_or_else(|| invalid(function, "missing aggregator"))?;
                let mut total = self.param(ctx, focus, parameters, 1)?;
                for (index, item) in focus.iter().enumerate() {
                    let item_ctx = ctx.for_item(item, index).with_total(total);
                    total = self.execute(&item_ctx, &vec![item.clone()], aggregator, true)?;
                }
                total
            }
            F::OfType | F::As => {
                let type_name = Self::type_param(parameters, function)?;
                focus
                    .iter()
                    .filter(|v| self.type_matches(v, &type_name))
                    .cloned()
                    .collect()
            }
            F::Is => {
                let type_name = Self::type_param(parameters, function)?;
                match focus.as_slice() {
                    [] => Vec::new(),
                    [single] => vec![self.type_matches(single, &type_name).into()],
                    _ => return Err(invalid(function, "focus must be a single value")),
                }
            }
            F::Iif => {
                let condition = parameters.first().ok_or_else(|| invalid(function, "missing condition"))?;
                let item_ctx = match focus.as_slice() {
                    [single] => ctx.for_item(single, 0),
                    _ => ctx.clone(),
                };
                let chosen = if convert_to_boolean(&self.execute(&item_ctx, focus, condition, true)?) {
                    parameters.get(1)
                } else {
                    parameters.get(2)
                };
                match chosen {
                    Some(branch) => self.execute(&item_ctx, focus, branch, true)?,
                    None => Vec::new(),
                }
            }

            // subsetting
            F::Item => {
                let index = self.integer_param(ctx, focus, parameters, 0, function)?;
                index
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| focus.get(i).cloned())
                    .into_iter()
                    .collect()
            }
            F::Single => match focus.as_slice() {
                [] | [_] => focus.clone(),
                _ => return Err(invalid(function, "focus contains more than one item")),
            },
            F::First => focus.first().cloned().into_iter().collect(),
            F::Last => focus.last().cloned().into_iter().collect(),
            F::Tail => focus.iter().skip(1).cloned().collect(),
            F::Skip => {
                let count = self.integer_param(ctx, focus, parameters, 0, function)?.unwrap_or(0);
                focus.iter().skip(count.max(0) as usize).cloned().collect()
            }
            F::Take => {
                let count = self.integer_param(ctx, focus, parameters, 0, function)?.unwrap_or(0);
                focus.iter().take(count.max(0) as usize).cloned().collect()
            }
            F::Union => union(focus, &self.param(ctx, focus, parameters, 0)?),
            F::Combine => {
                let mut result = focus.clone();
                result.extend(self.param(ctx, focus, parameters, 0)?);
                result
            }
            F::Intersect => {
                let other = self.param(ctx, focus, parameters, 0)?;
                distinct(&focus.iter().filter(|v| contains_item(&other, v)).cloned().collect())
            }
            F::Exclude => {
                let other = self.param(ctx, focus, parameters, 0)?;
                focus.iter().filter(|v| !contains_item(&other, v)).cloned().collect()
            }

            // strings
            F::Upper
            | F::Lower
            | F::ToChars
            | F::IndexOf
            | F::Substring
            | F::StartsWith
            | F::EndsWith
            | F::Matches
            | F::ReplaceMatches
            | F::Contains
            | F::Replace
            | F::Length
            | F::Trim
            | F::Split
            | F::Encode
            | F::Decode
            | F::Escape
            | F::Unescape => return self.string_function(ctx, focus, function, parameters),
            F::Join => {
                let separator = self
                    .string_param(ctx, focus, parameters, 0, function)?
                    .unwrap_or_default();
                let parts: Vec<String> = focus.iter().filter_map(FhirPathValue::as_string).collect();
                vec![FhirPathValue::String(parts.join(&separator))]
            }

            // conversion
            F::ToBoolean => self.conversion(focus, function, Conversion::Boolean, false)?,
            F::ConvertsToBoolean => self.conversion(focus, function, Conversion::Boolean, true)?,
            F::ToInteger => self.conversion(focus, function, Conversion::Integer, false)?,
            F::ConvertsToInteger => self.conversion(focus, function, Conversion::Integer, true)?,
            F::ToDecimal => self.conversion(focus, function, Conversion::Decimal, false)?,
            F::ConvertsToDecimal => self.conversion(focus, function, Conversion::Decimal, true)?,
            F::ToString => self.conversion(focus, function, Conversion::String, false)?,
            F::ConvertsToString => self.conversion(focus, function, Conversion::String, true)?,
            F::ToQuantity => self.conversion(focus, function, Conversion::Quantity, false)?,
            F::ConvertsToQuantity => self.conversion(focus, function, Conversion::Quantity, true)?,
            F::ToDate => self.conversion(focus, function, Conversion::Date, false)?,
            F::ConvertsToDate => self.conversion(focus, function, Conversion::Date, true)?,
            F::ToDateTime => self.conversion(focus, function, Conversion::DateTime, false)?,
            F::ConvertsToDateTime => self.conversion(focus, function, Conversion::DateTime, true)?,
            F::ToTime => self.conversion(focus, function, Conversion::Time, false)?,
            F::ConvertsToTime => self.conversion(focus, function, Conversion::Time, true)?,

            // math
            F::Abs
            | F::Ceiling
            | F::Exp
            | F::Floor
            | F::Ln
            | F::Log
            | F::Power
            | F::Round
            | F::Sqrt
            | F::Truncate => return self.math_function(ctx, focus, function, parameters),

            // tree navigation
            F::Children => focus
                .iter()
                .filter_map(FhirPathValue::as_node)
                .flat_map(|n| n.all_children())
                .map(|(_, child)| FhirPathValue::Node(child))
                .collect(),
            F::Descendants => {
                let mut result = Vec::new();
                let mut pending: Vec<_> = focus.iter().filter_map(FhirPathValue::as_node).cloned().collect();
                while let Some(node) = pending.pop() {
                    for (_, child) in node.all_children().into_iter().rev() {
                        pending.push(child.clone());
                        result.push(FhirPathValue::Node(child));
                    }
                }
                result
            }
            F::Extension => {
                let url = self
                    .string_param(ctx, focus, parameters, 0, function)?
                    .ok_or_else(|| invalid(function, "missing extension URL"))?;
                focus
                    .iter()
                    .filter_map(FhirPathValue::as_node)
                    .flat_map(|n| n.children("extension"))
                    .filter(|ext| {
                        ext.child("url")
                            .and_then(|u| u.value())
                            .and_then(|v| v.as_string())
                            .is_some_and(|u| u == url)
                    })
                    .map(FhirPathValue::Node)
                    .collect()
            }
            F::Resolve => {
                let Some(host) = self.host() else {
                    return Ok(Vec::new());
                };
                focus
                    .iter()
                    .filter_map(|item| match item.as_node() {
                        Some(node) if !node.has_value() => node
                            .child("reference")
                            .and_then(|r| r.value())
                            .and_then(|v| v.as_string()),
                        _ => item.as_string(),
                    })
                    .filter_map(|reference| host.resolve_reference(&reference))
                    .collect()
            }
            F::MemberOf => {
                let url = self
                    .string_param(ctx, focus, parameters, 0, function)?
                    .ok_or_else(|| invalid(function, "missing value set URL"))?;
                self.member_of(focus, &url)?
            }

            // utility
            F::Trace => {
                let label = self
                    .string_param(ctx, focus, parameters, 0, function)?
                    .unwrap_or_default();
                let shown = match parameters.get(1) {
                    Some(projection) => self
                        .per_item(ctx, focus, projection)?
                        .into_iter()
                        .flat_map(|(_, r)| r)
                        .collect(),
                    None => focus.clone(),
                };
                let text: Vec<String> = shown.iter().map(ToString::to_string).collect();
                log::debug!("trace {label}: [{}]", text.join(", "));
                focus.clone()
            }
            F::Today => vec![FhirPathValue::Date(
                chrono::Local::now().format("%Y-%m-%d").to_string(),
            )],
            F::Now => vec![FhirPathValue::DateTime(
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
            )],
        };
        Ok(result)
    }

    fn conversion(
        &self,
        focus: &Collection,
        function: BuiltinFunction,
        target: Conversion,
        test_only: bool,
    ) -> Result<Collection> {
        let value = match focus.as_slice() {
            [] => return Ok(Vec::new()),
            [single] => single,
            _ => return Err(invalid(function, "focus contains more than one item")),
        };
        let converted = convert(value, target);
        if test_only {
            return Ok(vec![converted.is_some().into()]);
        }
        Ok(converted.into_iter().collect())
    }

    fn string_function(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        function: BuiltinFunction,
        parameters: &[ExpressionNode],
    ) -> Result<Collection> {
        use BuiltinFunction as F;

        let text = match focus.as_slice() {
            [] => return Ok(Vec::new()),
            [single] => single
                .as_string()
                .ok_or_else(|| invalid(function, "focus must be a string"))?,
            _ => return Err(invalid(function, "focus contains more than one item")),
        };
        let arg = |index: usize| self.string_param(ctx, focus, parameters, index, function);
        let string = |s: String| -> Result<Collection> { Ok(vec![FhirPathValue::String(s)]) };
        let boolean = |b: bool| -> Result<Collection> { Ok(vec![FhirPathValue::Boolean(b)]) };

        match function {
            F::Upper => string(text.to_uppercase()),
            F::Lower => string(text.to_lowercase()),
            F::Trim => string(text.trim().to_string()),
            F::Length => Ok(vec![FhirPathValue::Integer(text.chars().count() as i64)]),
            F::ToChars => Ok(text.chars().map(|c| FhirPathValue::String(c.to_string())).collect()),
            F::IndexOf => {
                let Some(needle) = arg(0)? else {
                    return Ok(Vec::new());
                };
                let index = text
                    .find(&needle)
                    .map(|byte| text[..byte].chars().count() as i64)
                    .unwrap_or(-1);
                Ok(vec![FhirPathValue::Integer(index)])
            }
            F::Substring => {
                let Some(start) = self.integer_param(ctx, focus, parameters, 0, function)? else {
                    return Ok(Vec::new());
                };
                let chars: Vec<char> = text.chars().collect();
                let Ok(start) = usize::try_from(start) else {
                    return Ok(Vec::new());
                };
                if start >= chars.len() {
                    return Ok(Vec::new());
                }
                let length = self
                    .integer_param(ctx, focus, parameters, 1, function)?
                    .map(|l| l.max(0) as usize)
                    .unwrap_or(chars.len());
                let end = start.saturating_add(length).min(chars.len());
                string(chars[start..end].iter().collect())
            }
            F::StartsWith => match arg(0)? {
                Some(prefix) => boolean(text.starts_with(&prefix)),
                None => Ok(Vec::new()),
            },
            F::EndsWith => match arg(0)? {
                Some(suffix) => boolean(text.ends_with(&suffix)),
                None => Ok(Vec::new()),
            },
            F::Contains => match arg(0)? {
                Some(needle) => boolean(text.contains(&needle)),
                None => Ok(Vec::new()),
            },
            F::Replace => match (arg(0)?, arg(1)?) {
                (Some(pattern), Some(substitution)) => string(text.replace(&pattern, &substitution)),
                _ => Ok(Vec::new()),
            },
            F::Matches => match arg(0)? {
                Some(pattern) => boolean(compile(&pattern, function)?.is_match(&text)),
                None => Ok(Vec::new()),
            },
            F::ReplaceMatches => match (arg(0)?, arg(1)?) {
                (Some(pattern), Some(substitution)) => string(
                    compile(&pattern, function)?
                        .replace_all(&text, substitution.as_str())
                        .into_owned(),
                ),
                _ => Ok(Vec::new()),
            },
            F::Split => match arg(0)? {
                Some(separator) => Ok(text
                    .split(separator.as_str())
                    .map(|part| FhirPathValue::String(part.to_string()))
                    .collect()),
                None => Ok(Vec::new()),
            },
            F::Encode => match arg(0)?.as_deref() {
                Some("base64") => string(general_purpose::STANDARD.encode(text.as_bytes())),
                Some("urlbase64") => string(general_purpose::URL_SAFE.encode(text.as_bytes())),
                Some("hex") => string(hex::encode(text.as_bytes())),
                Some(other) => Err(invalid(function, format!("unknown encoding {other}"))),
                None => Ok(Vec::new()),
            },
            F::Decode => {
                let bytes = match arg(0)?.as_deref() {
                    Some("base64") => general_purpose::STANDARD.decode(text.as_bytes()).ok(),
                    Some("urlbase64") => general_purpose::URL_SAFE.decode(text.as_bytes()).ok(),
                    Some("hex") => hex::decode(text.as_bytes()).ok(),
                    Some(other) => return Err(invalid(function, format!("unknown encoding {other}"))),
                    None => return Ok(Vec::new()),
                };
                match bytes.and_then(|b| String::from_utf8(b).ok()) {
                    Some(decoded) => string(decoded),
                    None => Ok(Vec::new()),
                }
            }
            F::Escape => match arg(0)?.as_deref() {
                Some("html") => string(escape_html(&text)),
                Some("json") => string(escape_json(&text)),
                Some(other) => Err(invalid(function, format!("unknown escape target {other}"))),
                None => Ok(Vec::new()),
            },
            F::Unescape => match arg(0)?.as_deref() {
                Some("html") => string(unescape_html(&text)),
                Some("json") => string(unescape_json(&text)),
                Some(other) => Err(invalid(function, format!("unknown escape target {other}"))),
                None => Ok(Vec::new()),
            },
            _ => Err(invalid(function, "not a string function")),
        }
    }

    fn math_function(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        function: BuiltinFunction,
        parameters: &[ExpressionNode],
    ) -> Result<Collection> {
        use BuiltinFunction as F;

        let value = match focus.as_slice() {
            [] => return Ok(Vec::new()),
            [single] => single
                .primitive()
                .ok_or_else(|| invalid(function, "focus must be a number"))?,
            _ => return Err(invalid(function, "focus contains more than one item")),
        };
        if let (F::Abs, FhirPathValue::Quantity(q)) = (function, &value) {
            return Ok(vec![FhirPathValue::Quantity(Quantity::new(q.value.abs(), q.unit.clone()))]);
        }
        let number = value
            .as_decimal()
            .ok_or_else(|| invalid(function, "focus must be a number"))?;
        let integer = |d: Decimal| d.to_i64().map(FhirPathValue::Integer);
        let via_float = |f: fn(f64) -> f64| {
            number
                .to_f64()
                .map(f)
                .filter(|r| r.is_finite())
                .and_then(Decimal::from_f64)
                .map(FhirPathValue::Decimal)
        };

        let result = match function {
            F::Abs => match value {
                FhirPathValue::Integer(i) => i.checked_abs().map(FhirPathValue::Integer),
                _ => Some(FhirPathValue::Decimal(number.abs())),
            },
            F::Ceiling => integer(number.ceil()),
            F::Floor => integer(number.floor()),
            F::Truncate => integer(number.trunc()),
            F::Round => {
                let precision = self
                    .integer_param(ctx, focus, parameters, 0, function)?
                    .unwrap_or(0);
                let precision = u32::try_from(precision)
                    .map_err(|_| invalid(function, "precision must not be negative"))?;
                Some(FhirPathValue::Decimal(
                    number.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero),
                ))
            }
            F::Sqrt => via_float(f64::sqrt),
            F::Exp => via_float(f64::exp),
            F::Ln => via_float(f64::ln),
            F::Log | F::Power => {
                let argument = self.param(ctx, focus, parameters, 0)?;
                let Some(other) = argument.first().and_then(FhirPathValue::as_decimal) else {
                    return Ok(Vec::new());
                };
                if function == F::Power {
                    if let (FhirPathValue::Integer(base), Some(exp)) =
                        (&value, argument.first().and_then(FhirPathValue::as_integer))
                    {
                        if let Ok(exp) = u32::try_from(exp) {
                            return Ok(base.checked_pow(exp).map(FhirPathValue::Integer).into_iter().collect());
                        }
                    }
                }
                let (Some(x), Some(y)) = (number.to_f64(), other.to_f64()) else {
                    return Ok(Vec::new());
                };
                let computed = if function == F::Log { x.ln() / y.ln() } else { x.powf(y) };
                Some(computed)
                    .filter(|r| r.is_finite())
                    .and_then(Decimal::from_f64)
                    .map(FhirPathValue::Decimal)
            }
            _ => return Err(invalid(function, "not a math function")),
        };
        Ok(result.into_iter().collect())
    }
}

fn compile(pattern: &str, function: BuiltinFunction) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| invalid(function, format!("invalid regular expression: {e}")))
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn escape_json(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn unescape_json(text: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{text}\"")).unwrap_or_else(|_| text.to_string())
}

/// True if two single values are equal; used by callers outside the evaluator
pub fn values_equal(a: &FhirPathValue, b: &FhirPathValue) -> bool {
    item_equals(a, b) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn eval(expression: &str) -> Collection {
        let engine = FhirPathEngine::new();
        let parsed = engine.parse(expression).unwrap();
        engine.evaluate(None, &parsed, None).unwrap()
    }

    fn text(expression: &str) -> String {
        let values = eval(expression);
        values
            .iter()
            .map(|v| v.as_string().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|")
    }

    #[rstest]
    #[case("'abc'.upper()", "ABC")]
    #[case("'abcdef'.substring(2, 3)", "cde")]
    #[case("'abcdef'.substring(4)", "ef")]
    #[case("'abc'.indexOf('c')", "2")]
    #[case("'a,b,c'.split(',').join('-')", "a-b-c")]
    #[case("'hello'.replaceMatches('l+', 'L')", "heLo")]
    #[case("'x'.encode('base64').decode('base64')", "x")]
    #[case("'<a>'.escape('html')", "&lt;a&gt;")]
    #[case("(1 | 2 | 2 | 3).count()", "3")]
    #[case("(1 | 2).combine(2).count()", "3")]
    #[case("(1 | 2 | 3).where($this > 1)", "2|3")]
    #[case("(1 | 2 | 3).select($this * 10)", "10|20|30")]
    #[case("(1 | 2 | 3).aggregate($this + $total, 0)", "6")]
    #[case("(1 | 2 | 3).tail().first()", "2")]
    #[case("(1 | 2 | 3).exclude(2)", "1|3")]
    #[case("iif(1 > 2, 'yes', 'no')", "no")]
    #[case("'12'.toInteger() + 1", "13")]
    #[case("'1.5'.convertsToDecimal()", "true")]
    #[case("2.5.round()", "3")]
    #[case("(-5).abs()", "5")]
    #[case("2.power(10)", "1024")]
    #[case("3.7.floor()", "3")]
    fn builtin_results(#[case] expression: &str, #[case] expected: &str) {
        assert_eq!(text(expression), expected);
    }

    #[test]
    fn single_rejects_many() {
        let engine = FhirPathEngine::new();
        let parsed = engine.parse("(1 | 2).single()").unwrap();
        assert!(engine.evaluate(None, &parsed, None).is_err());
    }

    #[test]
    fn exists_with_criteria() {
        assert_eq!(eval("(1 | 2).exists($this = 2)"), vec![FhirPathValue::Boolean(true)]);
        assert_eq!(eval("{}.exists()"), vec![FhirPathValue::Boolean(false)]);
        assert_eq!(eval("{}.empty()"), vec![FhirPathValue::Boolean(true)]);
    }
}
