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

//! Source location tracking for the lexers

use std::fmt;

use crate::core::SourceLocation;

/// A value with the source range it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    /// The value
    pub value: T,
    /// Location of the first character
    pub start: SourceLocation,
    /// Location just past the last character
    pub end: SourceLocation,
}

impl<T> Spanned<T> {
    /// Create a new spanned value
    pub fn new(value: T, start: SourceLocation, end: SourceLocation) -> Self {
        Self { value, start, end }
    }

    /// Map the value while preserving the span
    pub fn map<U, F>(self, f: F) -> Spanned<U>
    where
        F: FnOnce(T) -> U,
    {
        Spanned {
            value: f(self.value),
            start: self.start,
            end: self.end,
        }
    }

    /// Get a reference to the inner value
    pub fn as_ref(&self) -> Spanned<&T> {
        Spanned {
            value: &self.value,
            start: self.start,
            end: self.end,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Spanned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Incremental line/column counter.
///
/// CR, LF and CRLF each advance exactly one line.
#[derive(Debug, Clone, Copy)]
pub struct LocationTracker {
    line: usize,
    column: usize,
    after_cr: bool,
}

impl Default for LocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationTracker {
    /// Tracker positioned at line 1, column 1
    pub const fn new() -> Self {
        Self {
            line: 1,
            column: 1,
            after_cr: false,
        }
    }

    /// Account for one consumed character
    pub fn advance(&mut self, ch: char) {
        match ch {
            '\r' => {
                self.line += 1;
                self.column = 1;
                self.after_cr = true;
            }
            '\n' => {
                if !self.after_cr {
                    self.line += 1;
                    self.column = 1;
                }
                self.after_cr = false;
            }
            _ => {
                self.column += 1;
                self.after_cr = false;
            }
        }
    }

    /// Current location
    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(text: &str) -> SourceLocation {
        let mut tracker = LocationTracker::new();
        text.chars().for_each(|c| tracker.advance(c));
        tracker.location()
    }

    #[test]
    fn line_endings_count_once() {
        assert_eq!(track("a\nb"), SourceLocation::new(2, 2));
        assert_eq!(track("a\rb"), SourceLocation::new(2, 2));
        assert_eq!(track("a\r\nb"), SourceLocation::new(2, 2));
        assert_eq!(track("a\n\rb"), SourceLocation::new(3, 2));
        assert_eq!(track("\r\n\r\n"), SourceLocation::new(3, 1));
    }

    #[test]
    fn spanned_map_keeps_range() {
        let s = Spanned::new("12", SourceLocation::new(1, 1), SourceLocation::new(1, 3));
        let n = s.map(|v| v.len());
        assert_eq!(n.value, 2);
        assert_eq!(n.end, SourceLocation::new(1, 3));
    }
}
