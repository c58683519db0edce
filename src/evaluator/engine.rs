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

//! Tree-walking FHIRPath interpreter

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::context::{EvaluationContext, HostFunctionResolver, VariableResolver, default_environment};
use super::operators::{operate, short_circuit};
use crate::ast::{BinaryOperator, ExpressionKind, ExpressionNode, Literal, UnaryOperator};
use crate::core::{FhirMapError, Result};
use crate::model::{Collection, FhirPathValue, Quantity, StructureProvider};
use crate::parser::FhirPathParser;

/// Collection → boolean for conditions: empty is false, a single boolean is
/// itself, anything else non-empty is true
pub fn convert_to_boolean(values: &Collection) -> bool {
    match values.as_slice() {
        [] => false,
        [single] => single.as_boolean().unwrap_or(true),
        _ => true,
    }
}

/// FHIRPath interpreter.
///
/// The engine is immutable during evaluation and can be shared between
/// threads; per-call state lives in [`EvaluationContext`].
#[derive(Clone)]
pub struct FhirPathEngine {
    provider: Option<Arc<dyn StructureProvider>>,
    host: Option<Arc<dyn HostFunctionResolver>>,
    environment: IndexMap<String, FhirPathValue>,
}

impl Default for FhirPathEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FhirPathEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FhirPathEngine")
            .field("provider", &self.provider)
            .field("host", &self.host.is_some())
            .field("environment", &self.environment)
            .finish()
    }
}

impl FhirPathEngine {
    /// Engine with the default `%` constants and no host services
    pub fn new() -> Self {
        Self {
            provider: None,
            host: None,
            environment: default_environment(),
        }
    }

    /// Use `provider` for type tests and choice navigation
    pub fn with_provider(mut self, provider: Arc<dyn StructureProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Delegate unknown functions to `host`
    pub fn with_host(mut self, host: Arc<dyn HostFunctionResolver>) -> Self {
        self.host = Some(host);
        self
    }

    /// Define a `%` constant
    pub fn set_environment(&mut self, name: impl Into<String>, value: FhirPathValue) {
        self.environment.insert(name.into(), value);
    }

    /// Structure provider, if any
    pub fn provider(&self) -> Option<&dyn StructureProvider> {
        self.provider.as_deref()
    }

    /// Host function resolver, if any
    pub fn host(&self) -> Option<&dyn HostFunctionResolver> {
        self.host.as_deref()
    }

    /// Parse an expression, accepting host functions
    pub fn parse(&self, text: &str) -> Result<ExpressionNode> {
        match self.host() {
            Some(host) => FhirPathParser::with_host(host).parse(text),
            None => FhirPathParser::new().parse(text),
        }
    }

    /// Evaluate `expression` against `focus`
    pub fn evaluate(
        &self,
        focus: Option<&FhirPathValue>,
        expression: &ExpressionNode,
        variables: Option<&dyn VariableResolver>,
    ) -> Result<Collection> {
        let ctx = EvaluationContext::new(focus, variables, &self.environment);
        let input: Collection = focus.into_iter().cloned().collect();
        self.execute(&ctx, &input, expression, true)
    }

    /// Evaluate a condition.
    ///
    /// The result must be empty (false) or a single boolean; anything else is
    /// an evaluation error naming the expression.
    pub fn evaluate_to_boolean(
        &self,
        focus: Option<&FhirPathValue>,
        expression: &ExpressionNode,
        variables: Option<&dyn VariableResolver>,
    ) -> Result<bool> {
        let values = self.evaluate(focus, expression, variables)?;
        match values.as_slice() {
            [] => Ok(false),
            [single] => single.as_boolean().ok_or_else(|| {
                FhirMapError::evaluation(format!(
                    "Condition {expression} returned {} instead of a boolean",
                    single.type_name()
                ))
            }),
            _ => Err(FhirMapError::evaluation(format!(
                "Condition {expression} returned {} items instead of a boolean",
                values.len()
            ))),
        }
    }

    /// Evaluate and join the text of every result with `,`
    pub fn evaluate_to_string(
        &self,
        focus: Option<&FhirPathValue>,
        expression: &ExpressionNode,
        variables: Option<&dyn VariableResolver>,
    ) -> Result<String> {
        let values = self.evaluate(focus, expression, variables)?;
        Ok(values
            .iter()
            .map(|v| v.as_string().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(","))
    }

    pub(crate) fn execute(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        node: &ExpressionNode,
        at_entry: bool,
    ) -> Result<Collection> {
        let mut work = match &node.kind {
            ExpressionKind::Name(name) => self.execute_name(ctx, focus, name, at_entry)?,
            ExpressionKind::Constant(literal) => self.execute_constant(ctx, literal)?,
            ExpressionKind::Function {
                function,
                parameters,
            } => self.execute_function(ctx, focus, function, parameters)?,
            ExpressionKind::Group(body) => self.execute(ctx, focus, body, at_entry)?,
            ExpressionKind::Unary { operator, operand } => {
                let head = self.execute(ctx, focus, operand, at_entry)?;
                let values = self.fold_chain(ctx, focus, operand, head)?;
                match operator {
                    UnaryOperator::Positive => values,
                    UnaryOperator::Negate => values.iter().map(negate).collect::<Result<_>>()?,
                }
            }
        };

        if let Some(inner) = &node.inner {
            work = self.execute(ctx, &work, inner, false)?;
        }

        if node.proximal {
            work = self.fold_chain(ctx, focus, node, work)?;
        }
        Ok(work)
    }

    /// Apply the operator chain hanging off `head` to its value
    fn fold_chain(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        head: &ExpressionNode,
        mut work: Collection,
    ) -> Result<Collection> {
        let mut last = head;
        while let (Some(op), Some(next)) = (last.operation, last.op_next.as_deref()) {
            work = self.apply_operation(ctx, focus, op, work, next)?;
            last = next;
        }
        Ok(work)
    }

    fn apply_operation(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        op: BinaryOperator,
        left: Collection,
        right_node: &ExpressionNode,
    ) -> Result<Collection> {
        if let Some(result) = short_circuit(op, &left)? {
            return Ok(result);
        }
        match op {
            BinaryOperator::Is | BinaryOperator::As => {
                let type_name = right_node.qualified_name().ok_or_else(|| {
                    FhirMapError::evaluation(format!("Operator {op} requires a type name"))
                })?;
                if op == BinaryOperator::Is {
                    return match left.as_slice() {
                        [] => Ok(Vec::new()),
                        [single] => Ok(vec![self.type_matches(single, &type_name).into()]),
                        _ => Err(FhirMapError::evaluation(
                            "Operator is requires a singleton operand",
                        )),
                    };
                }
                Ok(left
                    .into_iter()
                    .filter(|v| self.type_matches(v, &type_name))
                    .collect())
            }
            BinaryOperator::MemberOf => {
                let right = self.execute(ctx, focus, right_node, true)?;
                let url = right.first().and_then(FhirPathValue::as_string).ok_or_else(|| {
                    FhirMapError::evaluation("memberOf requires a value set URL")
                })?;
                self.member_of(&left, &url)
            }
            _ => {
                let right = self.execute(ctx, focus, right_node, true)?;
                operate(op, &left, &right)
            }
        }
    }

    pub(crate) fn member_of(&self, values: &Collection, value_set: &str) -> Result<Collection> {
        let host = self.host().ok_or_else(|| {
            FhirMapError::evaluation("memberOf requires a terminology host")
        })?;
        let mut result = Vec::with_capacity(values.len());
        for value in values {
            let member = host.member_of(value, value_set).ok_or_else(|| {
                FhirMapError::evaluation(format!("Unable to check membership of {value} in {value_set}"))
            })?;
            result.push(member.into());
        }
        Ok(result)
    }

    fn execute_name(
        &self,
        ctx: &EvaluationContext<'_>,
        focus: &Collection,
        name: &str,
        at_entry: bool,
    ) -> Result<Collection> {
        if name.starts_with('$') {
            return match name {
                "$this" => Ok(ctx.this.clone().map(|v| vec![v]).unwrap_or_else(|| focus.clone())),
                "$index" => Ok(ctx
                    .index
                    .map(|i| vec![FhirPathValue::Integer(i as i64)])
                    .unwrap_or_default()),
                "$total" => Ok(ctx.total.clone().unwrap_or_default()),
                _ => Err(FhirMapError::evaluation(format!("Unknown special variable {name}"))),
            };
        }

        if at_entry {
            if let Some(value) = ctx.variables.and_then(|v| v.resolve_variable(name)) {
                return Ok(vec![value]);
            }
            let typed: Collection = focus
                .iter()
                .filter(|v| v.as_node().is_some_and(|n| n.type_name() == name))
                .cloned()
                .collect();
            if !typed.is_empty() {
                return Ok(typed);
            }
        }

        let mut result = Vec::new();
        for item in focus {
            self.navigate(item, name, &mut result);
        }
        Ok(result)
    }

    /// Children of `item` named `name`, including `name[x]` choice forms
    pub(crate) fn navigate(&self, item: &FhirPathValue, name: &str, out: &mut Collection) {
        let Some(node) = item.as_node() else {
            return;
        };
        let children = node.children(name);
        if !children.is_empty() {
            out.extend(children.into_iter().map(FhirPathValue::Node));
            return;
        }
        let is_choice = match self.provider() {
            Some(provider) => provider
                .element(&node.type_name(), name)
                .is_some_and(|e| e.is_choice()),
            None => true,
        };
        if !is_choice {
            return;
        }
        for (child_name, child) in node.all_children() {
            let typed_suffix = child_name
                .strip_prefix(name)
                .and_then(|rest| rest.chars().next())
                .is_some_and(char::is_uppercase);
            if typed_suffix {
                out.push(FhirPathValue::Node(child));
            }
        }
    }

    fn execute_constant(&self, ctx: &EvaluationContext<'_>, literal: &Literal) -> Result<Collection> {
        let value = match literal {
            Literal::String(s) => FhirPathValue::String(s.clone()),
            Literal::Integer(i) => FhirPathValue::Integer(*i),
            Literal::Decimal(d) => FhirPathValue::Decimal(*d),
            Literal::Boolean(b) => FhirPathValue::Boolean(*b),
            Literal::Quantity { value, unit } => FhirPathValue::Quantity(Quantity::new(*value, unit.clone())),
            Literal::Null => return Ok(Vec::new()),
            Literal::Special(text) => return self.execute_special(ctx, text),
        };
        Ok(vec![value])
    }

    fn execute_special(&self, ctx: &EvaluationContext<'_>, text: &str) -> Result<Collection> {
        if let Some(name) = text.strip_prefix('%') {
            let name = name.trim_matches(|c| c == '`' || c == '\'' || c == '"');
            return ctx.environment_value(name).ok_or_else(|| {
                FhirMapError::evaluation(format!("Unknown environment constant %{name}"))
            });
        }
        let Some(body) = text.strip_prefix('@') else {
            return Err(FhirMapError::evaluation(format!("Invalid constant {text}")));
        };
        let value = if let Some(time) = body.strip_prefix('T') {
            FhirPathValue::Time(time.to_string())
        } else if let Some(date) = body.strip_suffix('T') {
            FhirPathValue::DateTime(date.to_string())
        } else if body.contains('T') {
            FhirPathValue::DateTime(body.to_string())
        } else {
            FhirPathValue::Date(body.to_string())
        };
        Ok(vec![value])
    }

    /// `is`/`as`/`ofType` type test
    pub(crate) fn type_matches(&self, value: &FhirPathValue, type_name: &str) -> bool {
        let wanted = type_name
            .strip_prefix("FHIR.")
            .or_else(|| type_name.strip_prefix("System."))
            .unwrap_or(type_name);
        let actual = value.type_name();
        if actual == wanted {
            return true;
        }
        if value.as_node().is_none() && actual.eq_ignore_ascii_case(wanted) {
            return true;
        }
        self.provider()
            .is_some_and(|p| p.is_subtype_of(&actual, wanted))
    }
}

fn negate(value: &FhirPathValue) -> Result<FhirPathValue> {
    match value.primitive() {
        Some(FhirPathValue::Integer(i)) => i
            .checked_neg()
            .map(FhirPathValue::Integer)
            .ok_or_else(|| FhirMapError::evaluation("Arithmetic overflow in negation")),
        Some(FhirPathValue::Decimal(d)) => Ok(FhirPathValue::Decimal(-d)),
        Some(FhirPathValue::Quantity(q)) => Ok(FhirPathValue::Quantity(Quantity::new(-q.value, q.unit))),
        _ => Err(FhirMapError::evaluation(format!(
            "Unable to negate a value of type {}",
            value.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockStructureProvider, Node};
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn patient() -> FhirPathValue {
        let json = json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true,
            "name": [
                {"family": "Doe", "given": ["John", "Q"]},
                {"family": "Roe", "given": ["Jane"]}
            ],
            "deceasedBoolean": false
        });
        let provider = MockStructureProvider::new();
        FhirPathValue::Node(Node::from_json(&json, None, Some(&provider)).unwrap())
    }

    fn eval(expression: &str) -> Collection {
        let engine = FhirPathEngine::new();
        let parsed = engine.parse(expression).unwrap();
        engine.evaluate(Some(&patient()), &parsed, None).unwrap()
    }

    fn strings(values: &Collection) -> Vec<String> {
        values.iter().filter_map(FhirPathValue::as_string).collect()
    }

    #[test]
    fn precedence_shapes_results() {
        assert_eq!(eval("1 + 2 * 3"), vec![FhirPathValue::Integer(7)]);
        assert_eq!(eval("(1 + 2) * 3"), vec![FhirPathValue::Integer(9)]);
        assert_eq!(eval("true and false or true"), vec![FhirPathValue::Boolean(true)]);
        assert_eq!(eval("-2 + 5"), vec![FhirPathValue::Integer(-7)]);
        assert_eq!(eval("(-2) + 5"), vec![FhirPathValue::Integer(3)]);
        assert_eq!(eval("1 + -2"), vec![FhirPathValue::Integer(-1)]);
        assert_eq!(eval("10 - 4 - 3"), vec![FhirPathValue::Integer(3)]);
    }

    #[test]
    fn navigation_from_type_name() {
        assert_eq!(strings(&eval("Patient.name.given")), vec!["John", "Q", "Jane"]);
        assert_eq!(strings(&eval("name.family")), vec!["Doe", "Roe"]);
        assert_eq!(strings(&eval("name[1].family")), vec!["Roe"]);
        assert_eq!(strings(&eval("deceased")), vec!["false"]);
    }

    #[test]
    fn operator_chain_with_type_test() {
        assert_eq!(eval("Patient is Patient"), vec![FhirPathValue::Boolean(true)]);
        assert_eq!(eval("active is boolean and id = 'p1'"), vec![FhirPathValue::Boolean(true)]);
        assert_eq!(eval("'a' is String"), vec![FhirPathValue::Boolean(true)]);
    }

    #[test]
    fn variables_resolve_before_navigation() {
        let engine = FhirPathEngine::new();
        let mut vars = IndexMap::new();
        vars.insert("name".to_string(), FhirPathValue::string("bound"));
        let parsed = engine.parse("name").unwrap();
        let result = engine.evaluate(Some(&patient()), &parsed, Some(&vars)).unwrap();
        assert_eq!(result, vec![FhirPathValue::string("bound")]);
    }

    #[test]
    fn special_constants() {
        assert_eq!(strings(&eval("%sct")), vec!["http://snomed.info/sct"]);
        assert_eq!(eval("@2020-01-02"), vec![FhirPathValue::Date("2020-01-02".into())]);
        assert_eq!(eval("@T10:00"), vec![FhirPathValue::Time("10:00".into())]);
        assert_eq!(
            eval("4 'mg'"),
            vec![FhirPathValue::Quantity(Quantity::new(Decimal::from(4), "mg"))]
        );
        assert!(eval("{}").is_empty());
    }

    #[test]
    fn boolean_conversion() {
        assert!(!convert_to_boolean(&vec![]));
        assert!(!convert_to_boolean(&vec![FhirPathValue::Boolean(false)]));
        assert!(convert_to_boolean(&vec![FhirPathValue::string("x")]));
    }

    #[test]
    fn conditions_must_be_boolean() {
        let engine = FhirPathEngine::new();
        let condition = |text: &str| {
            let parsed = engine.parse(text).unwrap();
            engine.evaluate_to_boolean(None, &parsed, None)
        };
        assert!(condition("1 = 1").unwrap());
        assert!(!condition("{}").unwrap());
        let err = condition("'text'").unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Evaluation);
        assert!(condition("true | false").is_err());
    }
}
