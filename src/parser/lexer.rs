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

//! Pull-based lexer shared by the FHIRPath parser and the mapping parser.
//!
//! The lexer exposes a single current token. Parsers inspect it with the
//! `has_*`/`is_*` predicates and consume it with [`Lexer::take`] or
//! [`Lexer::token`]. Comments are collected on the side so the mapping parser
//! can attach them as documentation.

use crate::core::{FhirMapError, Result, SourceLocation};

use super::span::{LocationTracker, Spanned};

/// Words and symbols that act as binary operators
const OPERATORS: &[&str] = &[
    "=", "~", "!=", "!~", ">", "<", ">=", "<=", "|", "or", "and", "xor", "is", "as", "*", "/",
    "+", "-", "&", "implies", "div", "mod", "in", "contains", "memberOf",
];

/// Lexer over a single source text
#[derive(Debug, Clone)]
pub struct Lexer {
    source: Vec<char>,
    cursor: usize,
    tracker: LocationTracker,
    current: Option<Spanned<String>>,
    comments: Vec<(usize, String)>,
    source_name: Option<String>,
}

impl Lexer {
    /// Create a lexer positioned on the first token
    pub fn new(source: &str) -> Result<Self> {
        let text = source.strip_prefix('\u{feff}').unwrap_or(source);
        let mut lexer = Self {
            source: text.chars().collect(),
            cursor: 0,
            tracker: LocationTracker::new(),
            current: None,
            comments: Vec::new(),
            source_name: None,
        };
        lexer.next()?;
        Ok(lexer)
    }

    /// Create a lexer that mentions `name` in its error messages
    pub fn with_name(source: &str, name: impl Into<String>) -> Result<Self> {
        let mut lexer = Self::new(source)?;
        lexer.source_name = Some(name.into());
        Ok(lexer)
    }

    /// Text of the current token, or the empty string at end of input
    pub fn current(&self) -> &str {
        self.current.as_ref().map(|t| t.value.as_str()).unwrap_or("")
    }

    /// Where the current token starts
    pub fn current_start(&self) -> SourceLocation {
        self.current
            .as_ref()
            .map(|t| t.start)
            .unwrap_or_else(|| self.tracker.location())
    }

    /// Where the current token ends
    pub fn current_end(&self) -> SourceLocation {
        self.current
            .as_ref()
            .map(|t| t.end)
            .unwrap_or_else(|| self.tracker.location())
    }

    /// True once every token has been consumed
    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    /// Syntax error located at the current token
    pub fn error(&self, message: impl Into<String>) -> FhirMapError {
        let message = message.into();
        let message = match &self.source_name {
            Some(name) => format!("{message} (in {name})"),
            None => message,
        };
        FhirMapError::syntax(message, self.current_start())
    }

    fn lex_error(&self, message: &str, location: SourceLocation) -> FhirMapError {
        FhirMapError::lex(message, location)
    }

    fn peek_at(&self, index: usize) -> Option<char> {
        self.source.get(index).copied()
    }

    fn consume_to(&mut self, end: usize) {
        while self.cursor < end {
            self.tracker.advance(self.source[self.cursor]);
            self.cursor += 1;
        }
    }

    fn text(&self, start: usize, end: usize) -> String {
        self.source[start..end].iter().collect()
    }

    /// Advance to the next token, collecting any comments on the way
    pub fn next(&mut self) -> Result<()> {
        self.current = None;
        self.skip_whitespace_and_comments()?;
        if self.cursor >= self.source.len() {
            return Ok(());
        }
        let start = self.cursor;
        let start_location = self.tracker.location();
        let end = self.scan_token(start, start_location)?;
        let value = self.text(start, end);
        self.consume_to(end);
        self.current = Some(Spanned::new(value, start_location, self.tracker.location()));
        Ok(())
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            while let Some(ch) = self.peek_at(self.cursor) {
                if !ch.is_whitespace() {
                    break;
                }
                self.consume_to(self.cursor + 1);
            }
            match (self.peek_at(self.cursor), self.peek_at(self.cursor + 1)) {
                (Some('/'), Some('/')) => {
                    let mut end = self.cursor + 2;
                    while let Some(ch) = self.peek_at(end) {
                        if ch == '\r' || ch == '\n' {
                            break;
                        }
                        end += 1;
                    }
                    let comment = self.text(self.cursor + 2, end);
                    let line = self.tracker.location().line;
                    self.comments.push((line, comment.trim().to_string()));
                    self.consume_to(end);
                }
                (Some('/'), Some('*')) => {
                    let location = self.tracker.location();
                    let mut end = self.cursor + 2;
                    loop {
                        match (self.peek_at(end), self.peek_at(end + 1)) {
                            (Some('*'), Some('/')) => break,
                            (Some(_), _) => end += 1,
                            (None, _) => return Err(self.lex_error("Unfinished comment", location)),
                        }
                    }
                    let comment = self.text(self.cursor + 2, end);
                    self.comments.push((location.line, comment.trim().to_string()));
                    self.consume_to(end + 2);
                }
                _ => return Ok(()),
            }
        }
    }

    /// Find the end index of the token starting at `start`
    fn scan_token(&self, start: usize, location: SourceLocation) -> Result<usize> {
        let ch = self.source[start];
        let next = self.peek_at(start + 1);
        let end = match ch {
            '!' | '>' | '<' | ':' | '-' | '=' => match next {
                Some('=' | '~' | '-') => start + 2,
                Some('>') if ch == '-' => start + 2,
                _ => start + 1,
            },
            '.' => match next {
                Some('.') => start + 2,
                _ => start + 1,
            },
            '0'..='9' => {
                let mut end = start + 1;
                let mut dotted = false;
                while let Some(c) = self.peek_at(end) {
                    if c.is_ascii_digit() {
                        end += 1;
                    } else if c == '.' && !dotted {
                        dotted = true;
                        end += 1;
                    } else {
                        break;
                    }
                }
                if self.source[end - 1] == '.' {
                    end -= 1;
                }
                end
            }
            c if c.is_ascii_alphabetic() => {
                let mut end = start + 1;
                while let Some(c) = self.peek_at(end) {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                end
            }
            '%' => match next {
                Some('`') => self.scan_quoted(start + 1, '`', location)?,
                _ => {
                    let mut end = start + 1;
                    while let Some(c) = self.peek_at(end) {
                        if c.is_ascii_alphanumeric() || c == ':' || c == '-' {
                            end += 1;
                        } else {
                            break;
                        }
                    }
                    end
                }
            },
            '$' => {
                let mut end = start + 1;
                while matches!(self.peek_at(end), Some('a'..='z')) {
                    end += 1;
                }
                end
            }
            '{' => match next {
                Some('}') => start + 2,
                _ => start + 1,
            },
            '"' | '\'' | '`' => self.scan_quoted(start, ch, location)?,
            '@' => {
                let mut end = start + 1;
                while let Some(c) = self.peek_at(end) {
                    if self.is_date_char(c, start, end) {
                        end += 1;
                    } else {
                        break;
                    }
                }
                end
            }
            _ => start + 1,
        };
        Ok(end)
    }

    fn scan_quoted(&self, start: usize, quote: char, location: SourceLocation) -> Result<usize> {
        let mut end = start + 1;
        loop {
            match self.peek_at(end) {
                None => return Err(self.lex_error("Unterminated string", location)),
                Some(c) if c == quote => return Ok(end + 1),
                Some('\\') => end += 2,
                Some(_) => end += 1,
            }
        }
    }

    /// Date literal characters; the fraction separator is only legal at
    /// the seconds position and only when a digit follows.
    fn is_date_char(&self, ch: char, start: usize, at: usize) -> bool {
        let fraction_offset = if self.peek_at(start + 1) == Some('T') { 10 } else { 20 };
        matches!(ch, '-' | ':' | 'T' | '+' | 'Z')
            || ch.is_ascii_digit()
            || (ch == '.'
                && at - start == fraction_offset
                && self.peek_at(at + 1).is_some_and(|c| c.is_ascii_digit()))
    }

    /// Consume and return the current token
    pub fn take(&mut self) -> Result<String> {
        let value = match &self.current {
            Some(token) => token.value.clone(),
            None => return Err(self.error("Unexpected end of input")),
        };
        self.next()?;
        Ok(value)
    }

    /// Consume an unsigned integer token
    pub fn take_int(&mut self) -> Result<u32> {
        let token = self.current().to_string();
        match token.parse::<u32>() {
            Ok(value) => {
                self.next()?;
                Ok(value)
            }
            Err(_) => Err(self.error(format!("Invalid integer: \"{token}\""))),
        }
    }

    /// Consume a name that may contain dots, such as `FHIR.Patient`
    pub fn take_dotted_token(&mut self) -> Result<String> {
        let mut name = self.take()?;
        while self.has_token(".") {
            name.push_str(&self.take()?);
            name.push_str(&self.take()?);
        }
        Ok(name)
    }

    /// Require and consume a specific token
    pub fn token(&mut self, expected: &str) -> Result<()> {
        if self.current() == expected {
            self.next()
        } else {
            Err(self.error(format!(
                "Found \"{}\" expecting \"{expected}\"",
                self.current()
            )))
        }
    }

    /// Consume `token` if it is current
    pub fn skip_token(&mut self, token: &str) -> Result<bool> {
        if self.has_token(token) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// True if the current token is `token`
    pub fn has_token(&self, token: &str) -> bool {
        !self.done() && self.current() == token
    }

    /// True if the current token is any of `tokens`
    pub fn has_any(&self, tokens: &[&str]) -> bool {
        !self.done() && tokens.contains(&self.current())
    }

    /// True if the current token is a binary operator
    pub fn is_op(&self) -> bool {
        !self.done() && OPERATORS.contains(&self.current())
    }

    /// True if the current token is a quoted string
    pub fn is_string_constant(&self) -> bool {
        matches!(self.current().chars().next(), Some('"' | '\''))
    }

    /// True if the current token is a literal of any kind
    pub fn is_constant(&self) -> bool {
        let current = self.current();
        match current.chars().next() {
            Some('"' | '\'' | '@' | '%') => true,
            Some(c) if c.is_ascii_digit() => true,
            Some(_) => matches!(current, "true" | "false" | "{}"),
            None => false,
        }
    }

    /// True if the current token is a backtick-delimited name
    pub fn is_fixed_name(&self) -> bool {
        self.current().starts_with('`')
    }

    /// True if the current token is shaped like an identifier
    pub fn is_token(&self) -> bool {
        let current = self.current();
        if current.starts_with('$') || current == "*" || current == "**" {
            return true;
        }
        let mut chars = current.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    }

    /// Consume a quoted string constant and return its unescaped content
    pub fn read_constant(&mut self, description: &str) -> Result<String> {
        if !self.is_string_constant() {
            return Err(self.error(format!(
                "Found {} expecting \"[{description}]\"",
                self.current()
            )));
        }
        let raw = self.current().to_string();
        let value = self.process_constant(&raw)?;
        self.next()?;
        Ok(value)
    }

    /// Consume a backtick name and return its unescaped content
    pub fn read_fixed_name(&mut self, description: &str) -> Result<String> {
        if !self.is_fixed_name() {
            return Err(self.error(format!(
                "Found {} expecting \"[{description}]\"",
                self.current()
            )));
        }
        let raw = self.current().to_string();
        let value = self.process_constant(&raw)?;
        self.next()?;
        Ok(value)
    }

    /// Strip the delimiters from a quoted token and resolve its escapes.
    ///
    /// Tokens that are not quoted are returned unchanged.
    pub fn process_constant(&self, raw: &str) -> Result<String> {
        let mut chars = raw.chars();
        let quote = match chars.next() {
            Some(c @ ('"' | '\'' | '`')) => c,
            _ => return Ok(raw.to_string()),
        };
        let body: Vec<char> = raw.chars().collect();
        let location = self.current_start();
        if body.len() < 2 || body[body.len() - 1] != quote {
            return Err(self.lex_error("Unterminated string", location));
        }
        unescape(&body[1..body.len() - 1]).map_err(|m| self.lex_error(&m, location))
    }

    /// True if comments were collected since the last drain
    pub fn has_comments(&self) -> bool {
        !self.comments.is_empty()
    }

    /// Drain every collected comment
    pub fn take_comments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.comments)
            .into_iter()
            .map(|(_, text)| text)
            .collect()
    }

    /// Remove the oldest collected comment if it starts on `line`, leaving
    /// later comments queued for whatever follows
    pub fn trailing_comment(&mut self, line: usize) -> Option<String> {
        match self.comments.first() {
            Some((start, _)) if *start == line => Some(self.comments.remove(0).1),
            _ => None,
        }
    }

    /// Drain the collected comments joined by newlines
    pub fn all_comments(&mut self) -> Option<String> {
        let comments = self.take_comments();
        if comments.is_empty() {
            None
        } else {
            Some(comments.join("\n"))
        }
    }
}

fn unescape(body: &[char]) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let ch = body[i];
        if ch != '\\' {
            out.push(ch);
            i += 1;
            continue;
        }
        let escaped = body.get(i + 1).copied().ok_or("Unterminated escape")?;
        match escaped {
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'n' => out.push('\n'),
            'f' => out.push('\u{000c}'),
            '\'' | '"' | '`' | '\\' | '/' => out.push(escaped),
            'u' => {
                let hex: String = body.iter().skip(i + 2).take(4).collect();
                if hex.len() != 4 {
                    return Err(format!("Improper unicode escape \\u{hex}"));
                }
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| format!("Improper unicode escape \\u{hex}"))?;
                let decoded =
                    char::from_u32(code).ok_or(format!("Improper unicode escape \\u{hex}"))?;
                out.push(decoded);
                i += 4;
            }
            other => return Err(format!("Unknown character escape \\{other}")),
        }
        i += 2;
    }
    Ok(out)
}

/// Quote `value` with `quote`, escaping what [`Lexer::process_constant`] resolves
pub fn escape_string(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for ch in value.chars() {
        match ch {
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\u{000c}' => out.push_str("\\f"),
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn tokens(source: &str) -> Vec<String> {
        let mut lexer = Lexer::new(source).unwrap();
        let mut out = Vec::new();
        while !lexer.done() {
            out.push(lexer.take().unwrap());
        }
        out
    }

    #[test]
    fn test_two_character_operators() {
        assert_eq!(
            tokens("a != b <= c -> d .. e == f !~ g"),
            vec!["a", "!=", "b", "<=", "c", "->", "d", "..", "e", "==", "f", "!~", "g"]
        );
        assert_eq!(tokens("s:x -- t"), vec!["s", ":", "x", "--", "t"]);
        assert_eq!(tokens("<<type+>>"), vec!["<", "<", "type", "+", ">", ">"]);
    }

    #[test]
    fn test_trailing_dot_is_backed_off() {
        assert_eq!(tokens("3."), vec!["3"]);
        assert_eq!(tokens("3.5"), vec!["3.5"]);
        assert_eq!(tokens("0..1"), vec!["0", "..", "1"]);
        assert_eq!(tokens("1.2.3"), vec!["1.2", ".", "3"]);
    }

    #[test]
    fn test_special_tokens() {
        assert_eq!(tokens("%resource"), vec!["%resource"]);
        assert_eq!(tokens("%`vs-x y`"), vec!["%`vs-x y`"]);
        assert_eq!(tokens("%sct-concept:x"), vec!["%sct-concept:x"]);
        assert_eq!(tokens("$this.a"), vec!["$this", ".", "a"]);
        assert_eq!(tokens("{} {"), vec!["{}", "{"]);
    }

    #[test]
    fn test_date_literals() {
        assert_eq!(tokens("@2020-01-01T12:00:00.123+10:00"), vec!["@2020-01-01T12:00:00.123+10:00"]);
        assert_eq!(tokens("@T12:00:00.5"), vec!["@T12:00:00.5"]);
        assert_eq!(tokens("@2020-01-01.abs()"), vec!["@2020-01-01", ".", "abs", "(", ")"]);
    }

    #[test]
    fn test_unicode_escape() {
        let lexer = Lexer::new("'\\u0041'").unwrap();
        assert_eq!(lexer.current(), "'\\u0041'");
        assert_eq!(lexer.process_constant(lexer.current()).unwrap(), "A");
    }

    #[test]
    fn test_read_constant_handles_both_quotes() {
        let mut lexer = Lexer::new(r#""it\"s" 'don\'t'"#).unwrap();
        assert_eq!(lexer.read_constant("a").unwrap(), "it\"s");
        assert_eq!(lexer.read_constant("b").unwrap(), "don't");
        assert!(lexer.done());
    }

    #[test]
    fn test_unknown_escape_is_rejected() {
        let lexer = Lexer::new("'\\q'").unwrap();
        let err = lexer.process_constant(lexer.current()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
        assert_eq!(err.location().map(|l| (l.line, l.column)), Some((1, 1)));
        assert!(err.to_string().contains("Unknown character escape"));

        let lexer = Lexer::new("'\\u00G1'").unwrap();
        let err = lexer.process_constant(lexer.current()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
        assert!(err.to_string().contains("Improper unicode escape"));
    }

    #[test]
    fn test_identifiers_are_ascii() {
        assert_eq!(tokens("name_2.given"), vec!["name_2", ".", "given"]);
        assert_eq!(tokens("naïve"), vec!["na", "ï", "ve"]);
        for text in ["ïd", "_id"] {
            let lexer = Lexer::new(text).unwrap();
            assert!(!lexer.is_token(), "{text}");
        }
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
        assert!(err.to_string().contains("Unterminated string"));
    }

    #[test]
    fn test_unfinished_comment() {
        let mut lexer = Lexer::new("a /* never closed").unwrap();
        let err = lexer.next().unwrap_err();
        assert!(err.to_string().contains("Unfinished comment"));
    }

    #[test]
    fn test_comments_are_collected() {
        let mut lexer = Lexer::new("// first\na /* second */ b").unwrap();
        assert_eq!(lexer.current(), "a");
        assert!(lexer.has_comments());
        lexer.next().unwrap();
        assert_eq!(lexer.take_comments(), vec!["first", "second"]);
        assert!(!lexer.has_comments());
    }

    #[test]
    fn test_trailing_comment_must_share_the_line() {
        let mut lexer = Lexer::new("a // same
// own line
b").unwrap();
        lexer.next().unwrap();
        assert_eq!(lexer.trailing_comment(1).as_deref(), Some("same"));
        assert_eq!(lexer.trailing_comment(1), None);
        assert_eq!(lexer.take_comments(), vec!["own line"]);
    }

    #[test]
    fn test_locations_follow_line_breaks() {
        let mut lexer = Lexer::new("a\r\n  b\rc").unwrap();
        assert_eq!(lexer.current_start(), SourceLocation::new(1, 1));
        lexer.next().unwrap();
        assert_eq!(lexer.current_start(), SourceLocation::new(2, 3));
        lexer.next().unwrap();
        assert_eq!(lexer.current_start(), SourceLocation::new(3, 1));
    }

    #[test]
    fn test_predicates() {
        let lexer = Lexer::new("memberOf").unwrap();
        assert!(lexer.is_op());
        assert!(lexer.is_token());
        let lexer = Lexer::new("'x'").unwrap();
        assert!(lexer.is_constant());
        assert!(lexer.is_string_constant());
        let lexer = Lexer::new("->").unwrap();
        assert!(!lexer.is_constant());
        assert!(!lexer.is_token());
    }

    #[test]
    fn test_token_mismatch_message() {
        let mut lexer = Lexer::new("group").unwrap();
        let err = lexer.token("map").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.to_string().contains("Found \"group\" expecting \"map\""));
    }

    #[test]
    fn test_escape_string_round_trip() {
        let quoted = escape_string("a'b\\c\n", '\'');
        let lexer = Lexer::new(&quoted).unwrap();
        assert_eq!(lexer.process_constant(lexer.current()).unwrap(), "a'b\\c\n");
    }
}
