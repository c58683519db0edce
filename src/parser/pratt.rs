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

//! FHIRPath expression parser.
//!
//! Operands are read left to right into a flat list of `(operator, operand)`
//! links. A separate reduction then gathers runs of tighter operators into
//! group nodes, one precedence tier at a time, and finally threads the
//! result into the `operation`/`op_next` chain of the head node.

use std::iter::Peekable;
use std::str::FromStr;

use rust_decimal::Decimal;

use super::lexer::Lexer;
use crate::ast::{
    BinaryOperator, BuiltinFunction, ExpressionNode, Function, Literal, UnaryOperator,
};
use crate::core::{Result, SourceLocation};
use crate::evaluator::HostFunctionResolver;

/// Operator tiers, tightest first. `implies`, `in`, `contains`, `memberOf`
/// and `as` are never gathered and so bind loosest.
pub const PRECEDENCE_TIERS: &[&[BinaryOperator]] = &[
    &[
        BinaryOperator::Multiply,
        BinaryOperator::Divide,
        BinaryOperator::IntegerDivide,
        BinaryOperator::Modulo,
    ],
    &[
        BinaryOperator::Add,
        BinaryOperator::Subtract,
        BinaryOperator::Concatenate,
    ],
    &[BinaryOperator::Union],
    &[
        BinaryOperator::LessThan,
        BinaryOperator::GreaterThan,
        BinaryOperator::LessThanOrEqual,
        BinaryOperator::GreaterThanOrEqual,
    ],
    &[BinaryOperator::Is],
    &[
        BinaryOperator::Equal,
        BinaryOperator::Equivalent,
        BinaryOperator::NotEqual,
        BinaryOperator::NotEquivalent,
    ],
    &[BinaryOperator::And],
    &[BinaryOperator::Xor, BinaryOperator::Or],
];

/// Calendar duration keywords and the UCUM codes they stand for
const CALENDAR_UNITS: &[(&str, &str)] = &[
    ("year", "a"),
    ("years", "a"),
    ("month", "mo"),
    ("months", "mo"),
    ("week", "wk"),
    ("weeks", "wk"),
    ("day", "d"),
    ("days", "d"),
    ("hour", "h"),
    ("hours", "h"),
    ("minute", "min"),
    ("minutes", "min"),
    ("second", "s"),
    ("seconds", "s"),
    ("millisecond", "ms"),
    ("milliseconds", "ms"),
];

#[derive(Debug, Clone, Copy)]
struct OpInfo {
    operation: BinaryOperator,
    start: SourceLocation,
    end: SourceLocation,
}

#[derive(Debug)]
struct ChainLink {
    op: OpInfo,
    operand: ExpressionNode,
}

/// Parser for FHIRPath expressions
#[derive(Clone, Copy, Default)]
pub struct FhirPathParser<'h> {
    host: Option<&'h dyn HostFunctionResolver>,
}

impl<'h> FhirPathParser<'h> {
    /// Parser that only accepts built-in functions
    pub fn new() -> Self {
        Self { host: None }
    }

    /// Parser that also accepts functions declared by `host`
    pub fn with_host(host: &'h dyn HostFunctionResolver) -> Self {
        Self { host: Some(host) }
    }

    /// Parse a complete expression; trailing tokens are an error
    pub fn parse(&self, text: &str) -> Result<ExpressionNode> {
        let mut lexer = Lexer::new(text)?;
        if lexer.done() {
            return Err(lexer.error("Expression is empty"));
        }
        let node = self.parse_expression(&mut lexer, true)?;
        if !lexer.done() {
            return Err(lexer.error(format!(
                "Premature expression termination at unexpected token \"{}\"",
                lexer.current()
            )));
        }
        Ok(node)
    }

    /// Parse one expression from a lexer shared with an enclosing grammar,
    /// stopping at the first token that cannot continue it
    pub fn parse_from(&self, lexer: &mut Lexer) -> Result<ExpressionNode> {
        self.parse_expression(lexer, true)
    }

    fn parse_expression(&self, lexer: &mut Lexer, proximal: bool) -> Result<ExpressionNode> {
        let start = lexer.current_start();
        let sign = match lexer.current() {
            "-" => Some(UnaryOperator::Negate),
            "+" => Some(UnaryOperator::Positive),
            _ => None,
        };
        if sign.is_some() {
            lexer.next()?;
        }
        let head = self.parse_term(lexer)?;
        if !proximal {
            return Ok(match sign {
                Some(operator) => {
                    let end = head.end;
                    ExpressionNode::unary(operator, head).at(start, end)
                }
                None => head,
            });
        }

        let mut links = Vec::new();
        while lexer.is_op() {
            let (op_start, op_end) = (lexer.current_start(), lexer.current_end());
            let symbol = lexer.take()?;
            let operation = BinaryOperator::from_symbol(&symbol)
                .ok_or_else(|| lexer.error(format!("Unknown operator \"{symbol}\"")))?;
            let operand = self.parse_expression(lexer, false)?;
            links.push(ChainLink {
                op: OpInfo {
                    operation,
                    start: op_start,
                    end: op_end,
                },
                operand,
            });
        }
        let mut node = organise_precedence(head, links);
        // a leading sign applies to the whole regrouped chain
        if let Some(operator) = sign {
            let end = node.chain().last().map_or(node.end, |last| last.end);
            node = ExpressionNode::unary(operator, node).at(start, end);
        }
        node.proximal = true;
        Ok(node)
    }

    /// A primary term followed by any `[index]` and `.path` continuation
    fn parse_term(&self, lexer: &mut Lexer) -> Result<ExpressionNode> {
        let start = lexer.current_start();
        let mut node = if lexer.is_constant() {
            self.parse_constant(lexer)?
        } else if lexer.has_token("(") {
            lexer.next()?;
            let inner = self.parse_expression(lexer, true)?;
            if !lexer.has_token(")") {
                return Err(lexer.error(format!(
                    "Found {} expecting a \")\"",
                    quoted_or_end(lexer.current())
                )));
            }
            let end = lexer.current_end();
            lexer.next()?;
            ExpressionNode::group(inner).at(start, end)
        } else {
            self.parse_name_or_call(lexer)?
        };

        if lexer.has_token("[") {
            let item_start = lexer.current_start();
            lexer.next()?;
            let index = self.parse_expression(lexer, true)?;
            if !lexer.has_token("]") {
                return Err(lexer.error(format!(
                    "The token {} is not expected here - a \"]\" expected",
                    quoted_or_end(lexer.current())
                )));
            }
            let item_end = lexer.current_end();
            lexer.next()?;
            let mut item = ExpressionNode::function(
                Function::Builtin(BuiltinFunction::Item),
                vec![index],
            )
            .at(item_start, item_end);
            if lexer.has_token(".") {
                lexer.next()?;
                item = item.with_inner(self.parse_expression(lexer, false)?);
            }
            node = node.with_inner(item);
        } else if lexer.has_token(".") {
            lexer.next()?;
            node = node.with_inner(self.parse_expression(lexer, false)?);
        }
        Ok(node)
    }

    fn parse_name_or_call(&self, lexer: &mut Lexer) -> Result<ExpressionNode> {
        let start = lexer.current_start();
        if !lexer.is_token() && !lexer.is_fixed_name() {
            return Err(lexer.error(format!(
                "Found {} expecting a token name",
                quoted_or_end(lexer.current())
            )));
        }
        let fixed = lexer.is_fixed_name();
        let mut end = lexer.current_end();
        let name = if fixed {
            lexer.read_fixed_name("Path Name")?
        } else {
            lexer.take()?
        };
        if fixed || !lexer.has_token("(") {
            return Ok(ExpressionNode::name(name).at(start, end));
        }

        let function = self.resolve_function(lexer, &name)?;
        lexer.next()?;
        let mut parameters = Vec::new();
        while !lexer.has_token(")") {
            if lexer.done() {
                return Err(lexer.error(format!(
                    "Unexpected end of expression in parameters of {name}()"
                )));
            }
            parameters.push(self.parse_expression(lexer, true)?);
            if lexer.has_token(",") {
                lexer.next()?;
            } else if !lexer.has_token(")") {
                return Err(lexer.error(format!(
                    "The token {} is not expected here - either a \",\" or a \")\" expected",
                    quoted_or_end(lexer.current())
                )));
            }
        }
        end = lexer.current_end();
        lexer.next()?;
        self.check_arity(lexer, &function, parameters.len())?;
        Ok(ExpressionNode::function(function, parameters).at(start, end))
    }

    fn resolve_function(&self, lexer: &Lexer, name: &str) -> Result<Function> {
        if let Some(builtin) = BuiltinFunction::from_name(name) {
            return Ok(Function::Builtin(builtin));
        }
        match self.host {
            Some(host) if host.arity(name).is_some() => Ok(Function::Custom(name.to_string())),
            _ => Err(lexer.error(format!("The name {name} is not a valid function name"))),
        }
    }

    fn check_arity(&self, lexer: &Lexer, function: &Function, count: usize) -> Result<()> {
        let arity = match function {
            Function::Builtin(b) => Some(b.arity()),
            Function::Custom(name) => self.host.and_then(|h| h.arity(name)),
        };
        let Some((min, max)) = arity else {
            return Ok(());
        };
        let name = function.name();
        if count < min {
            return Err(lexer.error(format!(
                "The function \"{name}\" requires at least {min} parameter(s), found {count}"
            )));
        }
        if let Some(max) = max {
            if count > max {
                return Err(lexer.error(format!(
                    "The function \"{name}\" can only have {max} parameter(s), found {count}"
                )));
            }
        }
        Ok(())
    }

    fn parse_constant(&self, lexer: &mut Lexer) -> Result<ExpressionNode> {
        let start = lexer.current_start();
        let mut end = lexer.current_end();
        let token = lexer.current().to_string();
        let literal = if lexer.is_string_constant() {
            Literal::String(lexer.read_constant("string")?)
        } else {
            lexer.next()?;
            match token.as_str() {
                "true" => Literal::Boolean(true),
                "false" => Literal::Boolean(false),
                "{}" => Literal::Null,
                t if t.starts_with('%') || t.starts_with('@') => Literal::Special(token),
                _ => {
                    let number = parse_number(&token)
                        .ok_or_else(|| lexer.error(format!("Invalid Constant {token}")))?;
                    match self.read_unit(lexer)? {
                        Some((unit, unit_end)) => {
                            end = unit_end;
                            let value = match number {
                                Literal::Integer(i) => Decimal::from(i),
                                Literal::Decimal(d) => d,
                                _ => Decimal::ZERO,
                            };
                            Literal::Quantity { value, unit }
                        }
                        None => number,
                    }
                }
            }
        };
        Ok(ExpressionNode::constant(literal).at(start, end))
    }

    /// Unit following a numeric literal, either a single-quoted UCUM code
    /// or a calendar keyword
    fn read_unit(&self, lexer: &mut Lexer) -> Result<Option<(String, SourceLocation)>> {
        let end = lexer.current_end();
        if lexer.current().starts_with('\'') {
            return Ok(Some((lexer.read_constant("unit")?, end)));
        }
        let keyword = CALENDAR_UNITS
            .iter()
            .find(|(word, _)| lexer.has_token(word))
            .map(|(_, code)| (*code).to_string());
        if let Some(code) = keyword {
            lexer.next()?;
            return Ok(Some((code, end)));
        }
        Ok(None)
    }
}

fn quoted_or_end(token: &str) -> String {
    if token.is_empty() {
        "end of input".to_string()
    } else {
        format!("\"{token}\"")
    }
}

/// Integer when the text is an exact `i64`, otherwise decimal
pub fn parse_number(text: &str) -> Option<Literal> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Literal::Integer(i));
    }
    Decimal::from_str(text).ok().map(Literal::Decimal)
}

/// Regroup a flat operator list by precedence and thread it into a chain
fn organise_precedence(head: ExpressionNode, links: Vec<ChainLink>) -> ExpressionNode {
    let (head, links) = PRECEDENCE_TIERS
        .iter()
        .fold((head, links), |(head, links), tier| gather(head, links, tier));
    build_chain(head, links)
}

/// Wrap every maximal run of `tier` operators in a group node.
///
/// Nothing changes when the list is uniform, either all inside the tier or
/// all outside it.
fn gather(
    head: ExpressionNode,
    links: Vec<ChainLink>,
    tier: &[BinaryOperator],
) -> (ExpressionNode, Vec<ChainLink>) {
    let mixed = links.iter().any(|l| tier.contains(&l.op.operation))
        && !links.iter().all(|l| tier.contains(&l.op.operation));
    if !mixed {
        return (head, links);
    }

    let mut links = links.into_iter().peekable();
    let head = gather_run(head, &mut links, tier);
    let mut gathered = Vec::new();
    while let Some(link) = links.next() {
        let operand = gather_run(link.operand, &mut links, tier);
        gathered.push(ChainLink {
            op: link.op,
            operand,
        });
    }
    (head, gathered)
}

/// Group `node` with the in-tier links that immediately follow it
fn gather_run(
    node: ExpressionNode,
    links: &mut Peekable<std::vec::IntoIter<ChainLink>>,
    tier: &[BinaryOperator],
) -> ExpressionNode {
    let mut run = Vec::new();
    while let Some(link) = links.next_if(|l| tier.contains(&l.op.operation)) {
        run.push(link);
    }
    if run.is_empty() {
        node
    } else {
        ExpressionNode::group(build_chain(node, run))
    }
}

/// Thread links into the `operation`/`op_next` chain starting at `head`
fn build_chain(mut head: ExpressionNode, links: Vec<ChainLink>) -> ExpressionNode {
    let mut tail: Option<(OpInfo, ExpressionNode)> = None;
    for link in links.into_iter().rev() {
        let mut operand = link.operand;
        if let Some((op, next)) = tail.take() {
            attach(&mut operand, op, next);
        }
        tail = Some((link.op, operand));
    }
    if let Some((op, next)) = tail {
        attach(&mut head, op, next);
    }
    head
}

fn attach(node: &mut ExpressionNode, op: OpInfo, next: ExpressionNode) {
    node.operation = Some(op.operation);
    node.op_start = Some(op.start);
    node.op_end = Some(op.end);
    node.op_next = Some(Box::new(next));
}

/// Parse a standalone expression with the built-in function set
pub fn parse_expression(text: &str) -> Result<ExpressionNode> {
    FhirPathParser::new().parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExpressionKind;
    use crate::core::ErrorKind;

    fn ops(node: &ExpressionNode) -> Vec<BinaryOperator> {
        node.chain().filter_map(|n| n.operation).collect()
    }

    #[test]
    fn test_multiplication_binds_tighter() {
        let node = parse_expression("1 + 2 * 3").unwrap();
        assert!(node.proximal);
        assert_eq!(ops(&node), vec![BinaryOperator::Add]);
        let right = node.op_next.as_deref().unwrap();
        let group = right.group_body().expect("right operand is a group");
        assert_eq!(ops(group), vec![BinaryOperator::Multiply]);
        assert_eq!(node.to_string(), "1 + (2 * 3)");
    }

    #[test]
    fn test_uniform_chain_stays_flat() {
        let node = parse_expression("1 + 2 - 3").unwrap();
        assert_eq!(ops(&node), vec![BinaryOperator::Add, BinaryOperator::Subtract]);
        assert_eq!(node.to_string(), "1 + 2 - 3");
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let node = parse_expression("a or b and c").unwrap();
        assert_eq!(node.to_string(), "a or (b and c)");
        let node = parse_expression("a = b and c = d").unwrap();
        assert_eq!(node.to_string(), "(a = b) and (c = d)");
    }

    #[test]
    fn test_implies_is_loosest() {
        let node = parse_expression("a implies b and c").unwrap();
        assert_eq!(ops(&node), vec![BinaryOperator::Implies]);
    }

    #[test]
    fn test_index_and_path() {
        let node = parse_expression("name[0].given").unwrap();
        assert_eq!(node.to_string(), "name[0].given");
        let item = node.inner.as_deref().unwrap();
        assert!(item.is_builtin(BuiltinFunction::Item));
        assert_eq!(item.inner.as_deref().and_then(|n| n.as_name()), Some("given"));
    }

    #[test]
    fn test_calendar_units_become_ucum() {
        let node = parse_expression("4 days").unwrap();
        assert_eq!(
            node.kind,
            ExpressionKind::Constant(Literal::Quantity {
                value: Decimal::from(4),
                unit: "d".into()
            })
        );
        let node = parse_expression("1.5 'mg'").unwrap();
        assert_eq!(node.to_string(), "1.5 'mg'");
    }

    #[test]
    fn test_unary_minus() {
        let node = parse_expression("-x.y + 1").unwrap();
        assert!(node.proximal);
        let ExpressionKind::Unary { operator, operand } = &node.kind else {
            panic!("expected a unary node, got {node}");
        };
        assert_eq!(*operator, UnaryOperator::Negate);
        assert!(!operand.proximal);
        assert_eq!(ops(operand), vec![BinaryOperator::Add]);
        assert_eq!(node.to_string(), "-x.y + 1");

        let operand = parse_expression("1 + -2").unwrap();
        let right = operand.op_next.as_deref().unwrap();
        assert!(matches!(right.kind, ExpressionKind::Unary { .. }));
    }

    #[test]
    fn test_function_arity_is_checked() {
        let err = parse_expression("where()").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.to_string().contains("requires at least 1"));
        let err = parse_expression("empty(1)").unwrap_err();
        assert!(err.to_string().contains("can only have 0"));
        let err = parse_expression("frobnicate()").unwrap_err();
        assert!(err.to_string().contains("not a valid function name"));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = parse_expression("a b").unwrap_err();
        assert!(err.to_string().contains("unexpected token \"b\""));
    }

    #[test]
    fn test_round_trip_through_display() {
        for text in [
            "Patient.name.where(use = 'official').given.first()",
            "(a | b).count() > 2",
            "value is Quantity and value.unit = 'mg'",
            "%resource.id & '-' & $this.id",
            "@2020-01-01T10:00:00 < now()",
            "iif(x.exists(), x, {})",
        ] {
            let first = parse_expression(text).unwrap();
            let second = parse_expression(&first.to_string()).unwrap();
            assert_eq!(first, second, "{text}");
        }
    }

    #[test]
    fn test_integer_versus_decimal() {
        assert_eq!(parse_number("42"), Some(Literal::Integer(42)));
        assert_eq!(
            parse_number("99999999999999999999"),
            Decimal::from_str("99999999999999999999").ok().map(Literal::Decimal)
        );
        assert_eq!(parse_number("4.50"), Some(Literal::Decimal(Decimal::new(450, 2))));
    }
}
