use std::collections::VecDeque;

use crate::span::Span;

/// Token kinds produced by the scanner.
///
/// Tokens are immutable and never retroactively reclassified; every input,
/// however malformed, scans to a finite stream ending in `Eos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Raw text outside of any tag or expression.
    Text,
    /// A `{! ... !}` comment, delimiters included.
    Comment,
    /// `{#`
    StartTagOpen,
    /// The tag name following `{#`.
    TagName,
    /// `}` closing an opening tag.
    StartTagClose,
    /// `/}` closing a self-contained tag.
    StartTagSelfClose,
    /// `{/`
    EndTagOpen,
    /// The tag name following `{/` (may be absent for the `{/}` shorthand).
    EndTagName,
    /// `}` closing an end tag.
    EndTagClose,
    /// `{@` opening a parameter declaration.
    StartParamDecl,
    /// The name part of a parameter inside a tag.
    ParameterName,
    /// A `=` separating a parameter name from its value.
    ParameterAssign,
    /// The value part of a `name=value` parameter.
    ParameterValue,
    /// A quoted literal parameter, terminated or not.
    String,
    /// `{` opening a standalone expression.
    StartExpression,
    /// The text between `{` and `}` of an expression.
    ExpressionContent,
    /// `}` closing an expression.
    EndExpression,
    /// Whitespace between parameters inside a tag.
    Whitespace,
    /// End of stream; always the final token.
    Eos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    /// After `{#` or `{/`; `end_tag` selects the token kinds to emit.
    TagName { end_tag: bool },
    /// Inside an opening tag or parameter declaration, before its `}`.
    Parameters { end_tag: bool },
    /// After a bare `{` that starts an expression.
    Expression,
}

/// Single-pass scanner over template source.
///
/// The scanner is stateful and restartable from offset 0 only: construct a
/// new one per parse. It never fails; unrecognized sequences degrade to
/// single-character `Text` tokens so the stream always reaches `Eos`.
pub struct Scanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    state: State,
    queue: VecDeque<Token>,
    done: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            state: State::Text,
            queue: VecDeque::new(),
            done: false,
        }
    }

    pub fn next_token(&mut self) -> Option<Token> {
        if let Some(token) = self.queue.pop_front() {
            return Some(token);
        }
        if self.done {
            return None;
        }
        if self.pos >= self.bytes.len() {
            self.done = true;
            return Some(self.token(TokenKind::Eos, self.pos, self.pos));
        }
        match self.state {
            State::Text => self.scan_text(),
            State::TagName { end_tag } => self.scan_tag_name(end_tag),
            State::Parameters { end_tag } => self.scan_parameters(end_tag),
            State::Expression => self.scan_expression(),
        }
        self.next_token()
    }

    fn token(&self, kind: TokenKind, start: usize, end: usize) -> Token {
        Token {
            kind,
            span: Span::new(start, end),
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize, end: usize) {
        if end > start || kind == TokenKind::Eos {
            let token = self.token(kind, start, end);
            self.queue.push_back(token);
        }
    }

    fn scan_text(&mut self) {
        let start = self.pos;
        let Some(rel) = self.text[self.pos..].find('{') else {
            self.push(TokenKind::Text, start, self.bytes.len());
            self.pos = self.bytes.len();
            return;
        };
        let brace = self.pos + rel;
        if brace > start {
            self.push(TokenKind::Text, start, brace);
            self.pos = brace;
            return;
        }

        match self.bytes.get(brace + 1) {
            Some(b'!') => self.scan_comment(brace),
            Some(b'#') => {
                self.push(TokenKind::StartTagOpen, brace, brace + 2);
                self.pos = brace + 2;
                self.state = State::TagName { end_tag: false };
            }
            Some(b'/') => {
                self.push(TokenKind::EndTagOpen, brace, brace + 2);
                self.pos = brace + 2;
                self.state = State::TagName { end_tag: true };
            }
            Some(b'@') => {
                self.push(TokenKind::StartParamDecl, brace, brace + 2);
                self.pos = brace + 2;
                self.state = State::Parameters { end_tag: false };
            }
            Some(&next) if starts_expression(next) => {
                self.push(TokenKind::StartExpression, brace, brace + 1);
                self.pos = brace + 1;
                self.state = State::Expression;
            }
            _ => {
                // A `{` followed by whitespace, another brace, or nothing is
                // ordinary text.
                self.push(TokenKind::Text, brace, brace + 1);
                self.pos = brace + 1;
            }
        }
    }

    fn scan_comment(&mut self, start: usize) {
        let body = start + 2;
        match self.text[body..].find("!}") {
            Some(rel) => {
                let end = body + rel + 2;
                self.push(TokenKind::Comment, start, end);
                self.pos = end;
            }
            None => {
                // Unterminated comment swallows the rest of the document.
                self.push(TokenKind::Comment, start, self.bytes.len());
                self.pos = self.bytes.len();
            }
        }
    }

    fn scan_tag_name(&mut self, end_tag: bool) {
        let start = self.pos;
        let mut cursor = self.pos;
        while cursor < self.bytes.len() && is_tag_name_byte(self.bytes[cursor]) {
            cursor += 1;
        }
        if cursor > start {
            let kind = if end_tag {
                TokenKind::EndTagName
            } else {
                TokenKind::TagName
            };
            self.push(kind, start, cursor);
        }
        self.pos = cursor;
        self.state = State::Parameters { end_tag };
    }

    fn scan_parameters(&mut self, end_tag: bool) {
        let len = self.bytes.len();
        let start = self.pos;
        let first = self.bytes[start];

        if first.is_ascii_whitespace() {
            let mut cursor = start;
            while cursor < len && self.bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            self.push(TokenKind::Whitespace, start, cursor);
            self.pos = cursor;
            return;
        }
        if first == b'}' {
            let kind = if end_tag {
                TokenKind::EndTagClose
            } else {
                TokenKind::StartTagClose
            };
            self.push(kind, start, start + 1);
            self.pos = start + 1;
            self.state = State::Text;
            return;
        }
        if first == b'/' && self.bytes.get(start + 1) == Some(&b'}') {
            self.push(TokenKind::StartTagSelfClose, start, start + 2);
            self.pos = start + 2;
            self.state = State::Text;
            return;
        }

        // A parameter run: consume until top-level whitespace or the tag
        // close, tracking quotes and bracket depth so `Map<K,V>`, call
        // arguments, and quoted strings are never split internally.
        let mut cursor = start;
        let mut depth = 0i32;
        let mut quote: Option<u8> = None;
        let mut assign: Option<usize> = None;
        while cursor < len {
            let ch = self.bytes[cursor];
            if let Some(q) = quote {
                if ch == b'\\' {
                    cursor += 2;
                    continue;
                }
                if ch == q {
                    quote = None;
                }
                cursor += 1;
                continue;
            }
            match ch {
                b'"' | b'\'' => quote = Some(ch),
                b'<' | b'(' | b'[' | b'{' => depth += 1,
                b'>' | b')' | b']' => {
                    if depth > 0 {
                        depth -= 1;
                    }
                }
                b'}' => {
                    if depth > 0 {
                        depth -= 1;
                    } else {
                        break;
                    }
                }
                b'/' if depth == 0 && self.bytes.get(cursor + 1) == Some(&b'}') => break,
                b'=' if depth == 0 && assign.is_none() => {
                    // `=` splits name from value, but not inside `!=`, `==`,
                    // `>=`, `<=`, nor as the first byte of a run.
                    let prev = self.bytes[cursor.saturating_sub(1)];
                    let next = self.bytes.get(cursor + 1).copied();
                    if cursor > start
                        && !matches!(prev, b'!' | b'<' | b'>' | b'=')
                        && next != Some(b'=')
                    {
                        assign = Some(cursor);
                    }
                }
                ch if ch.is_ascii_whitespace() && depth == 0 => break,
                _ => {}
            }
            cursor += 1;
        }
        let cursor = cursor.min(len);

        match assign {
            Some(eq) => {
                self.push(TokenKind::ParameterName, start, eq);
                self.push(TokenKind::ParameterAssign, eq, eq + 1);
                if cursor > eq + 1 {
                    let kind = if matches!(self.bytes[eq + 1], b'"' | b'\'') {
                        TokenKind::String
                    } else {
                        TokenKind::ParameterValue
                    };
                    self.push(kind, eq + 1, cursor);
                }
            }
            None => {
                let kind = if matches!(first, b'"' | b'\'') {
                    TokenKind::String
                } else {
                    TokenKind::ParameterName
                };
                self.push(kind, start, cursor);
            }
        }
        self.pos = cursor;
    }

    fn scan_expression(&mut self) {
        let len = self.bytes.len();
        let start = self.pos;
        let mut cursor = start;
        let mut depth = 0i32;
        let mut quote: Option<u8> = None;
        while cursor < len {
            let ch = self.bytes[cursor];
            if let Some(q) = quote {
                if ch == b'\\' {
                    cursor += 2;
                    continue;
                }
                if ch == q {
                    quote = None;
                }
                cursor += 1;
                continue;
            }
            match ch {
                b'"' | b'\'' => quote = Some(ch),
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' => {
                    if depth > 0 {
                        depth -= 1;
                    }
                }
                b'}' => {
                    if depth > 0 {
                        depth -= 1;
                    } else {
                        self.push(TokenKind::ExpressionContent, start, cursor);
                        self.push(TokenKind::EndExpression, cursor, cursor + 1);
                        self.pos = cursor + 1;
                        self.state = State::Text;
                        return;
                    }
                }
                _ => {}
            }
            cursor += 1;
        }
        // Unterminated expression: still a valid, if incomplete, token.
        self.push(TokenKind::ExpressionContent, start, len);
        self.pos = len;
        self.state = State::Text;
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.next_token()
    }
}

fn is_tag_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.')
}

fn starts_expression(byte: u8) -> bool {
    !byte.is_ascii_whitespace() && byte != b'{' && byte != b'}'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<(TokenKind, String)> {
        Scanner::new(text)
            .map(|t| (t.kind, t.text(text).to_string()))
            .collect()
    }

    #[test]
    fn scans_expression() {
        let tokens = kinds("hello {name}!");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "hello ".into()),
                (TokenKind::StartExpression, "{".into()),
                (TokenKind::ExpressionContent, "name".into()),
                (TokenKind::EndExpression, "}".into()),
                (TokenKind::Text, "!".into()),
                (TokenKind::Eos, "".into()),
            ]
        );
    }

    #[test]
    fn scans_section_tags() {
        let tokens = kinds("{#if item.active}x{/if}");
        let just_kinds: Vec<TokenKind> = tokens.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            just_kinds,
            vec![
                TokenKind::StartTagOpen,
                TokenKind::TagName,
                TokenKind::Whitespace,
                TokenKind::ParameterName,
                TokenKind::StartTagClose,
                TokenKind::Text,
                TokenKind::EndTagOpen,
                TokenKind::EndTagName,
                TokenKind::EndTagClose,
                TokenKind::Eos,
            ]
        );
        assert_eq!(tokens[3].1, "item.active");
    }

    #[test]
    fn splits_named_parameters() {
        let tokens = kinds("{#let name=value other='a b'}");
        let named: Vec<(TokenKind, &str)> =
            tokens.iter().map(|(k, t)| (*k, t.as_str())).collect();
        assert!(named.contains(&(TokenKind::ParameterName, "name")));
        assert!(named.contains(&(TokenKind::ParameterAssign, "=")));
        assert!(named.contains(&(TokenKind::ParameterValue, "value")));
        assert!(named.contains(&(TokenKind::String, "'a b'")));
    }

    #[test]
    fn generic_value_not_split_on_comma_or_space() {
        let text = "{@java.util.Map<String,java.util.List<Item>> map}";
        let tokens = kinds(text);
        assert_eq!(tokens[1].0, TokenKind::ParameterName);
        assert_eq!(tokens[1].1, "java.util.Map<String,java.util.List<Item>>");
        assert_eq!(tokens[3].1, "map");
    }

    #[test]
    fn not_equals_is_one_parameter() {
        let tokens = kinds("{#if a != b}");
        let names: Vec<&str> = tokens
            .iter()
            .filter(|(k, _)| *k == TokenKind::ParameterName)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(names, vec!["a", "!=", "b"]);
    }

    #[test]
    fn comment_and_unterminated_comment() {
        let tokens = kinds("a{! note !}b");
        assert_eq!(tokens[1], (TokenKind::Comment, "{! note !}".into()));
        let tokens = kinds("a{! runs off");
        assert_eq!(tokens[1], (TokenKind::Comment, "{! runs off".into()));
        assert_eq!(tokens.last().map(|(k, _)| *k), Some(TokenKind::Eos));
    }

    #[test]
    fn lone_brace_is_text() {
        let tokens = kinds("a { b");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "a ".into()),
                (TokenKind::Text, "{".into()),
                (TokenKind::Text, " b".into()),
                (TokenKind::Eos, "".into()),
            ]
        );
    }

    #[test]
    fn unterminated_tag_reaches_eos() {
        let tokens = kinds("{#each items");
        assert_eq!(tokens.last().map(|(k, _)| *k), Some(TokenKind::Eos));
        let tokens = kinds("{name");
        assert_eq!(tokens[1], (TokenKind::ExpressionContent, "name".into()));
        assert_eq!(tokens.last().map(|(k, _)| *k), Some(TokenKind::Eos));
    }

    #[test]
    fn unterminated_string_is_still_a_string_token() {
        let text = "{#include 'partial}";
        let tokens = kinds(text);
        // The quote swallows the close brace; the token stays a String and
        // the stream still terminates.
        assert!(tokens
            .iter()
            .any(|(k, t)| *k == TokenKind::String && t.starts_with("'partial")));
        assert_eq!(tokens.last().map(|(k, _)| *k), Some(TokenKind::Eos));
    }

    #[test]
    fn expression_with_nested_braces_and_strings() {
        let text = "{item.get('}')}";
        let tokens = kinds(text);
        assert_eq!(tokens[1], (TokenKind::ExpressionContent, "item.get('}')".into()));
        assert_eq!(tokens[2].0, TokenKind::EndExpression);
    }

    #[test]
    fn empty_end_tag_shorthand() {
        let tokens = kinds("{#set a=1}{/}");
        let just_kinds: Vec<TokenKind> = tokens.iter().map(|(k, _)| *k).collect();
        assert!(just_kinds.contains(&TokenKind::EndTagOpen));
        assert!(just_kinds.contains(&TokenKind::EndTagClose));
        assert!(!just_kinds.contains(&TokenKind::EndTagName));
    }

    #[test]
    fn arbitrary_garbage_never_loops() {
        for text in ["{{{{", "{#", "{/", "{@", "{!", "}}{", "{# }", "\u{0}{a}\u{0}"] {
            let tokens: Vec<Token> = Scanner::new(text).collect();
            assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eos), "{text:?}");
        }
    }
}
