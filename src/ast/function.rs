//! Built-in FHIRPath function catalogue

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! builtin_functions {
    ($($variant:ident => $name:literal, $min:literal, $max:expr;)*) => {
        /// Functions known to the parser and evaluator
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum BuiltinFunction {
            $(
                #[doc = concat!("`", $name, "()`")]
                $variant,
            )*
        }

        impl BuiltinFunction {
            /// Every built-in function, in declaration order
            pub const ALL: &'static [BuiltinFunction] = &[$(BuiltinFunction::$variant,)*];

            /// Name as written in expressions
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Minimum and (optional) maximum parameter count
            pub fn arity(self) -> (usize, Option<usize>) {
                match self {
                    $(Self::$variant => ($min, $max),)*
                }
            }

            /// Look up a function by name
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

builtin_functions! {
    Empty => "empty", 0, Some(0);
    Not => "not", 0, Some(0);
    Exists => "exists", 0, Some(1);
    SubsetOf => "subsetOf", 1, Some(1);
    SupersetOf => "supersetOf", 1, Some(1);
    IsDistinct => "isDistinct", 0, Some(0);
    Distinct => "distinct", 0, Some(0);
    Count => "count", 0, Some(0);
    Where => "where", 1, Some(1);
    Select => "select", 1, Some(1);
    All => "all", 0, Some(1);
    Repeat => "repeat", 1, Some(1);
    Aggregate => "aggregate", 1, Some(2);
    Item => "item", 1, Some(1);
    As => "as", 1, Some(1);
    Is => "is", 1, Some(1);
    OfType => "ofType", 1, Some(1);
    Single => "single", 0, Some(0);
    First => "first", 0, Some(0);
    Last => "last", 0, Some(0);
    Tail => "tail", 0, Some(0);
    Skip => "skip", 1, Some(1);
    Take => "take", 1, Some(1);
    Union => "union", 1, Some(1);
    Combine => "combine", 1, Some(1);
    Intersect => "intersect", 1, Some(1);
    Exclude => "exclude", 1, Some(1);
    Iif => "iif", 2, Some(3);
    Upper => "upper", 0, Some(0);
    Lower => "lower", 0, Some(0);
    ToChars => "toChars", 0, Some(0);
    IndexOf => "indexOf", 1, Some(1);
    Substring => "substring", 1, Some(2);
    StartsWith => "startsWith", 1, Some(1);
    EndsWith => "endsWith", 1, Some(1);
    Matches => "matches", 1, Some(1);
    ReplaceMatches => "replaceMatches", 2, Some(2);
    Contains => "contains", 1, Some(1);
    Replace => "replace", 2, Some(2);
    Length => "length", 0, Some(0);
    Trim => "trim", 0, Some(0);
    Split => "split", 1, Some(1);
    Join => "join", 0, Some(1);
    Children => "children", 0, Some(0);
    Descendants => "descendants", 0, Some(0);
    MemberOf => "memberOf", 1, Some(1);
    Trace => "trace", 1, Some(2);
    Today => "today", 0, Some(0);
    Now => "now", 0, Some(0);
    Resolve => "resolve", 0, Some(0);
    Extension => "extension", 1, Some(1);
    HasValue => "hasValue", 0, Some(0);
    AllFalse => "allFalse", 0, Some(0);
    AnyFalse => "anyFalse", 0, Some(0);
    AllTrue => "allTrue", 0, Some(0);
    AnyTrue => "anyTrue", 0, Some(0);
    ToBoolean => "toBoolean", 0, Some(0);
    ConvertsToBoolean => "convertsToBoolean", 0, Some(0);
    ToInteger => "toInteger", 0, Some(0);
    ConvertsToInteger => "convertsToInteger", 0, Some(0);
    ToDecimal => "toDecimal", 0, Some(0);
    ConvertsToDecimal => "convertsToDecimal", 0, Some(0);
    ToString => "toString", 0, Some(0);
    ConvertsToString => "convertsToString", 0, Some(0);
    ToQuantity => "toQuantity", 0, Some(1);
    ConvertsToQuantity => "convertsToQuantity", 0, Some(1);
    ToDate => "toDate", 0, Some(0);
    ConvertsToDate => "convertsToDate", 0, Some(0);
    ToDateTime => "toDateTime", 0, Some(0);
    ConvertsToDateTime => "convertsToDateTime", 0, Some(0);
    ToTime => "toTime", 0, Some(0);
    ConvertsToTime => "convertsToTime", 0, Some(0);
    Abs => "abs", 0, Some(0);
    Ceiling => "ceiling", 0, Some(0);
    Exp => "exp", 0, Some(0);
    Floor => "floor", 0, Some(0);
    Ln => "ln", 0, Some(0);
    Log => "log", 1, Some(1);
    Power => "power", 1, Some(1);
    Round => "round", 0, Some(1);
    Sqrt => "sqrt", 0, Some(0);
    Truncate => "truncate", 0, Some(0);
    Encode => "encode", 1, Some(1);
    Decode => "decode", 1, Some(1);
    Escape => "escape", 1, Some(1);
    Unescape => "unescape", 1, Some(1);
}

impl BuiltinFunction {
    /// Functions whose parameters are evaluated once per focus item,
    /// with `$this` bound to that item
    pub fn is_iterating(self) -> bool {
        matches!(
            self,
            Self::Where | Self::Select | Self::All | Self::Repeat | Self::Aggregate | Self::Exists
        )
    }

    /// Functions whose single parameter names a type rather than a value
    pub fn takes_type_name(self) -> bool {
        matches!(self, Self::As | Self::Is | Self::OfType)
    }
}

/// A function referenced by an expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    /// Built-in function
    Builtin(BuiltinFunction),
    /// Function supplied by the host application
    Custom(String),
}

impl Function {
    /// Name as written in expressions
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(b) => b.name(),
            Self::Custom(name) => name,
        }
    }

    /// True for the implicit function produced by `[index]`
    pub fn is_item(&self) -> bool {
        matches!(self, Self::Builtin(BuiltinFunction::Item))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        assert_eq!(BuiltinFunction::from_name("where"), Some(BuiltinFunction::Where));
        assert_eq!(BuiltinFunction::from_name("iif").map(|f| f.arity()), Some((2, Some(3))));
        assert_eq!(BuiltinFunction::from_name("nope"), None);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = BuiltinFunction::ALL.iter().map(|f| f.name()).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
        assert!(before > 70);
    }
}
