//! Abstract syntax tree for FHIRPath expressions

pub mod expression;
pub mod function;
pub mod operator;

pub use expression::{ChainIter, ExpressionKind, ExpressionNode, Literal};
pub use function::{BuiltinFunction, Function};
pub use operator::{BinaryOperator, UnaryOperator};
