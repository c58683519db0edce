//! Operator definitions for FHIRPath expressions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary operators in FHIRPath expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    // Arithmetic operators
    /// Addition (+)
    Add,
    /// Subtraction (-)
    Subtract,
    /// Multiplication (*)
    Multiply,
    /// Division (/)
    Divide,
    /// Modulo (mod)
    Modulo,
    /// Integer division (div)
    IntegerDivide,

    // Comparison operators
    /// Equality (=)
    Equal,
    /// Inequality (!=)
    NotEqual,
    /// Equivalence (~)
    Equivalent,
    /// Non-equivalence (!~)
    NotEquivalent,
    /// Less than (<)
    LessThan,
    /// Less than or equal (<=)
    LessThanOrEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal (>=)
    GreaterThanOrEqual,

    // Logical operators
    /// Logical AND (and)
    And,
    /// Logical OR (or)
    Or,
    /// Logical XOR (xor)
    Xor,
    /// Implication (implies)
    Implies,

    // String operators
    /// String concatenation (&)
    Concatenate,

    // Collection operators
    /// Collection union (|)
    Union,
    /// Collection membership (in)
    In,
    /// Collection containment (contains)
    Contains,
    /// Value set membership (memberOf)
    MemberOf,

    // Type operators
    /// Type checking (is)
    Is,
    /// Type casting (as)
    As,
}

/// Unary operators in FHIRPath expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    /// Arithmetic negation (-)
    Negate,
    /// Positive sign (+)
    Positive,
}

impl BinaryOperator {
    /// Look up an operator by its source symbol or keyword
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol {
            "+" => Self::Add,
            "-" => Self::Subtract,
            "*" => Self::Multiply,
            "/" => Self::Divide,
            "mod" => Self::Modulo,
            "div" => Self::IntegerDivide,
            "=" => Self::Equal,
            "!=" => Self::NotEqual,
            "~" => Self::Equivalent,
            "!~" => Self::NotEquivalent,
            "<" => Self::LessThan,
            "<=" => Self::LessThanOrEqual,
            ">" => Self::GreaterThan,
            ">=" => Self::GreaterThanOrEqual,
            "and" => Self::And,
            "or" => Self::Or,
            "xor" => Self::Xor,
            "implies" => Self::Implies,
            "&" => Self::Concatenate,
            "|" => Self::Union,
            "in" => Self::In,
            "contains" => Self::Contains,
            "memberOf" => Self::MemberOf,
            "is" => Self::Is,
            "as" => Self::As,
            _ => return None,
        };
        Some(op)
    }

    /// Check if this operator is arithmetic
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Subtract
                | Self::Multiply
                | Self::Divide
                | Self::IntegerDivide
                | Self::Modulo
        )
    }

    /// Check if this operator is comparison
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Equivalent
                | Self::NotEquivalent
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    /// Check if this operator is logical
    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Xor | Self::Implies)
    }

    /// Check if this operator is a type operator
    pub fn is_type_operator(self) -> bool {
        matches!(self, Self::Is | Self::As)
    }

    /// Get the symbol representation of this operator
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "mod",
            Self::IntegerDivide => "div",
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Equivalent => "~",
            Self::NotEquivalent => "!~",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Implies => "implies",
            Self::Concatenate => "&",
            Self::Union => "|",
            Self::In => "in",
            Self::Contains => "contains",
            Self::MemberOf => "memberOf",
            Self::Is => "is",
            Self::As => "as",
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl UnaryOperator {
    /// Get the symbol representation of this operator
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Negate => "-",
            Self::Positive => "+",
        }
    }
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_round_trip() {
        for symbol in ["+", "div", "!~", "memberOf", "implies", "|", "as"] {
            let op = BinaryOperator::from_symbol(symbol).unwrap();
            assert_eq!(op.symbol(), symbol);
        }
        assert!(BinaryOperator::from_symbol("->").is_none());
    }
}
