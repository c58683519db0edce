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

//! Expression tree produced by the FHIRPath parser.
//!
//! A node holds one term (`kind`) plus two links. `inner` continues a path
//! (`a.b`, `a[0]`), while `operation`/`op_next` chain the node to the right
//! operand of a binary operator. Only the head of a chain is `proximal`; the
//! evaluator folds the chain from that head, left to right. Precedence is
//! expressed by wrapping tighter runs in [`ExpressionKind::Group`] nodes.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::function::{BuiltinFunction, Function};
use super::operator::{BinaryOperator, UnaryOperator};
use crate::core::SourceLocation;
use crate::parser::lexer::escape_string;

/// Literal value appearing in an expression or a mapping rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Literal {
    /// String literal
    String(String),
    /// Integer literal
    Integer(i64),
    /// Decimal literal
    Decimal(Decimal),
    /// Boolean literal
    Boolean(bool),
    /// Quantity literal; calendar words are stored as UCUM codes
    Quantity {
        /// Numeric value
        value: Decimal,
        /// UCUM unit code
        unit: String,
    },
    /// The empty collection `{}`
    Null,
    /// `%name` constant or `@` date/time literal, kept verbatim
    Special(String),
}

impl Literal {
    /// FHIR type name of the literal
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::Quantity { .. } => "Quantity",
            Self::Null => "null",
            Self::Special(s) if s.starts_with("@T") => "time",
            Self::Special(s) if s.starts_with('@') && s.contains('T') => "dateTime",
            Self::Special(s) if s.starts_with('@') => "date",
            Self::Special(_) => "string",
        }
    }

    /// Text of the literal without quoting
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) | Self::Special(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Quantity { value, unit } => format!("{value} '{unit}'"),
            Self::Null => String::new(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(&escape_string(s, '\'')),
            Self::Quantity { value, unit } => {
                write!(f, "{value} {}", escape_string(unit, '\''))
            }
            Self::Null => f.write_str("{}"),
            other => f.write_str(&other.as_text()),
        }
    }
}

/// The term held by an expression node
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    /// Path element or variable name
    Name(String),
    /// Function invocation
    Function {
        /// The function
        function: Function,
        /// Parameter expressions
        parameters: Vec<ExpressionNode>,
    },
    /// Literal
    Constant(Literal),
    /// Parenthesised or precedence-gathered sub-expression
    Group(Box<ExpressionNode>),
    /// Sign applied to a term
    Unary {
        /// The operator
        operator: UnaryOperator,
        /// The operand
        operand: Box<ExpressionNode>,
    },
}

/// A parsed FHIRPath expression
#[derive(Debug, Clone)]
pub struct ExpressionNode {
    /// The term
    pub kind: ExpressionKind,
    /// Path continuation applied to the term's result
    pub inner: Option<Box<ExpressionNode>>,
    /// Operator joining this node to `op_next`
    pub operation: Option<BinaryOperator>,
    /// Right operand of `operation`
    pub op_next: Option<Box<ExpressionNode>>,
    /// True for the head of an operator chain
    pub proximal: bool,
    /// Where the term starts
    pub start: SourceLocation,
    /// Where the term ends
    pub end: SourceLocation,
    /// Where `operation` starts
    pub op_start: Option<SourceLocation>,
    /// Where `operation` ends
    pub op_end: Option<SourceLocation>,
}

/// Source locations are not part of structural equality
impl PartialEq for ExpressionNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.inner == other.inner
            && self.operation == other.operation
            && self.op_next == other.op_next
            && self.proximal == other.proximal
    }
}

impl ExpressionNode {
    fn with_kind(kind: ExpressionKind) -> Self {
        Self {
            kind,
            inner: None,
            operation: None,
            op_next: None,
            proximal: false,
            start: SourceLocation::default(),
            end: SourceLocation::default(),
            op_start: None,
            op_end: None,
        }
    }

    /// Name node
    pub fn name(name: impl Into<String>) -> Self {
        Self::with_kind(ExpressionKind::Name(name.into()))
    }

    /// Literal node
    pub fn constant(literal: Literal) -> Self {
        Self::with_kind(ExpressionKind::Constant(literal))
    }

    /// Function call node
    pub fn function(function: Function, parameters: Vec<ExpressionNode>) -> Self {
        Self::with_kind(ExpressionKind::Function {
            function,
            parameters,
        })
    }

    /// Group node wrapping a proximal chain
    pub fn group(mut inner: ExpressionNode) -> Self {
        inner.proximal = true;
        let (start, end) = (inner.start, inner.last_in_chain().end);
        Self::with_kind(ExpressionKind::Group(Box::new(inner))).at(start, end)
    }

    /// Unary node
    pub fn unary(operator: UnaryOperator, operand: ExpressionNode) -> Self {
        Self::with_kind(ExpressionKind::Unary {
            operator,
            operand: Box::new(operand),
        })
    }

    /// Set the term's source range
    pub fn at(mut self, start: SourceLocation, end: SourceLocation) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Set the path continuation
    pub fn with_inner(mut self, inner: ExpressionNode) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Nodes of the operator chain starting here, head first
    pub fn chain(&self) -> ChainIter<'_> {
        ChainIter { next: Some(self) }
    }

    fn last_in_chain(&self) -> &ExpressionNode {
        let mut last = self;
        for node in self.chain() {
            last = node;
        }
        last
    }

    /// Name held by a `Name` node
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExpressionKind::Name(n) => Some(n),
            _ => None,
        }
    }

    /// Group body, for `Group` nodes
    pub fn group_body(&self) -> Option<&ExpressionNode> {
        match &self.kind {
            ExpressionKind::Group(inner) => Some(inner),
            _ => None,
        }
    }

    /// True if the node is a call to `function`
    pub fn is_builtin(&self, function: BuiltinFunction) -> bool {
        matches!(&self.kind, ExpressionKind::Function { function: Function::Builtin(b), .. } if *b == function)
    }

    /// Dotted name for type specifiers such as `FHIR.Patient`
    pub fn qualified_name(&self) -> Option<String> {
        let mut name = self.as_name()?.to_string();
        let mut next = self.inner.as_deref();
        while let Some(node) = next {
            name.push('.');
            name.push_str(node.as_name()?);
            next = node.inner.as_deref();
        }
        Some(name)
    }
}

/// Iterator over an operator chain
pub struct ChainIter<'a> {
    next: Option<&'a ExpressionNode>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a ExpressionNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.op_next.as_deref();
        Some(current)
    }
}

fn needs_backticks(name: &str) -> bool {
    if name.starts_with('$') {
        return false;
    }
    let mut chars = name.chars();
    let plain = match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    };
    !plain || BinaryOperator::from_symbol(name).is_some()
}

impl fmt::Display for ExpressionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExpressionKind::Name(name) => {
                if needs_backticks(name) {
                    f.write_str(&escape_string(name, '`'))?;
                } else {
                    f.write_str(name)?;
                }
            }
            ExpressionKind::Function {
                function,
                parameters,
            } => {
                let item = function.is_item();
                if item {
                    f.write_str("[")?;
                } else {
                    write!(f, "{function}(")?;
                }
                for (i, p) in parameters.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_str(if item { "]" } else { ")" })?;
            }
            ExpressionKind::Constant(literal) => write!(f, "{literal}")?,
            ExpressionKind::Group(inner) => write!(f, "({inner})")?,
            ExpressionKind::Unary { operator, operand } => write!(f, "{operator}{operand}")?,
        }
        if let Some(inner) = &self.inner {
            let is_item = matches!(&inner.kind, ExpressionKind::Function { function, .. } if function.is_item());
            if !is_item {
                f.write_str(".")?;
            }
            write!(f, "{inner}")?;
        }
        if let (Some(op), Some(next)) = (&self.operation, &self.op_next) {
            write!(f, " {op} {next}")?;
        }
        Ok(())
    }
}
