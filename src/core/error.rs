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

//! Error types shared by the FHIRPath interpreter, the mapping parser,
//! the transform engine and the analyzer.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, FhirMapError>;

/// Position of a token in source text.
///
/// Lines and columns are 1-based. A CR, an LF or a CRLF pair each count as
/// a single line break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
}

impl SourceLocation {
    /// Create a new source location
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Location of the first character of a document
    pub const fn start() -> Self {
        Self { line: 1, column: 1 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.line, self.column)
    }
}

/// Coarse classification of an error, stable across message wording changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed token stream
    Lex,
    /// Token stream that does not match the grammar
    Syntax,
    /// Unknown, missing or ambiguous group, map or type
    Resolution,
    /// Structurally valid input that cannot be executed or analysed
    Semantic,
    /// Concept translation failure
    Translation,
    /// FHIRPath evaluation failure
    Evaluation,
    /// Filesystem or serialization failure
    Io,
}

/// Why a group or type lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionFailure {
    /// Nothing matched
    NotFound,
    /// More than one candidate matched
    Ambiguous,
}

/// Why a concept translation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationFailure {
    /// The concept map could not be located
    NoConceptMap,
    /// No source element carries the requested code
    NoMatch,
    /// The source element exists but has no target at all
    NoTarget,
    /// Targets exist but none has a usable equivalence
    NoUsableTarget,
    /// More than one target has a usable equivalence
    Ambiguous,
    /// The source value or requested output field is not supported
    Unsupported,
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum FhirMapError {
    /// Lexical errors such as unterminated strings or comments
    #[error("Error @{location}: {message}")]
    Lex {
        /// Human-readable message
        message: String,
        /// Where the offending token starts
        location: SourceLocation,
    },

    /// Grammar errors raised by the expression or mapping parser
    #[error("Error @{location}: {message}")]
    Syntax {
        /// Human-readable message
        message: String,
        /// Where the offending token starts
        location: SourceLocation,
    },

    /// Group, map or type lookup failures
    #[error("{message}")]
    Resolution {
        /// Human-readable message
        message: String,
        /// Failure category
        reason: ResolutionFailure,
    },

    /// Rules that cannot be executed as written
    #[error("{message}")]
    Semantic {
        /// Human-readable message
        message: String,
    },

    /// Concept map translation failures
    #[error("{message}")]
    Translation {
        /// Human-readable message
        message: String,
        /// Failure category
        reason: TranslationFailure,
    },

    /// FHIRPath evaluation failures
    #[error("{message}")]
    Evaluation {
        /// Human-readable message
        message: String,
    },

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FhirMapError {
    /// Create a lexical error
    pub fn lex(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Lex {
            message: message.into(),
            location,
        }
    }

    /// Create a syntax error
    pub fn syntax(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Syntax {
            message: message.into(),
            location,
        }
    }

    /// Create a "nothing matched" resolution error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
            reason: ResolutionFailure::NotFound,
        }
    }

    /// Create an ambiguity resolution error
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
            reason: ResolutionFailure::Ambiguous,
        }
    }

    /// Create a semantic error
    pub fn semantic(message: impl Into<String>) -> Self {
        Self::Semantic {
            message: message.into(),
        }
    }

    /// Create a translation error
    pub fn translation(reason: TranslationFailure, message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
            reason,
        }
    }

    /// Create an evaluation error
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lex { .. } => ErrorKind::Lex,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Semantic { .. } => ErrorKind::Semantic,
            Self::Translation { .. } => ErrorKind::Translation,
            Self::Evaluation { .. } => ErrorKind::Evaluation,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Source location, for errors raised while reading text
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            Self::Lex { location, .. } | Self::Syntax { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// Message without the location prefix
    pub fn message(&self) -> String {
        match self {
            Self::Lex { message, .. }
            | Self::Syntax { message, .. }
            | Self::Resolution { message, .. }
            | Self::Semantic { message }
            | Self::Translation { message, .. }
            | Self::Evaluation { message } => message.clone(),
            Self::Io(e) => e.to_string(),
            Self::Json(e) => e.to_string(),
        }
    }

    /// Prefix the message with the rule that was executing.
    ///
    /// Location-bearing and I/O errors are returned unchanged.
    pub fn in_rule(self, rule: &str) -> Self {
        let prefix = |m: String| format!("Rule \"{rule}\": {m}");
        match self {
            Self::Resolution { message, reason } => Self::Resolution {
                message: prefix(message),
                reason,
            },
            Self::Semantic { message } => Self::Semantic {
                message: prefix(message),
            },
            Self::Translation { message, reason } => Self::Translation {
                message: prefix(message),
                reason,
            },
            Self::Evaluation { message } => Self::Evaluation {
                message: prefix(message),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_formats_as_line_comma_column() {
        let err = FhirMapError::lex("Unterminated string", SourceLocation::new(3, 7));
        assert_eq!(err.to_string(), "Error @3, 7: Unterminated string");
        assert_eq!(err.kind(), ErrorKind::Lex);
        assert_eq!(err.location(), Some(SourceLocation::new(3, 7)));
    }

    #[test]
    fn rule_prefix_keeps_category() {
        let err = FhirMapError::ambiguous("Multiple possible matches for rule 'x'").in_rule("r1");
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(matches!(
            err,
            FhirMapError::Resolution {
                reason: ResolutionFailure::Ambiguous,
                ..
            }
        ));
        assert_eq!(err.message(), "Rule \"r1\": Multiple possible matches for rule 'x'");
    }

    #[test]
    fn io_errors_are_io_kind() {
        let err: FhirMapError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.location().is_none());
    }
}
