//! Lexing and parsing of FHIRPath expressions.
//!
//! The [`lexer::Lexer`] is shared with the mapping-language parser, which
//! hands it to [`FhirPathParser::parse_from`] for embedded expressions.

pub mod lexer;
pub mod pratt;
pub mod span;

pub use lexer::{Lexer, escape_string};
pub use pratt::{FhirPathParser, PRECEDENCE_TIERS, parse_expression, parse_number};
pub use span::{LocationTracker, Spanned};
