//! Mode-driven lexer for interpolation strings
//!
//! The lexer keeps a stack of modes, the same way the grammar is specified:
//! - `Default`: top-level text of a config value (`configValue`)
//! - `Value`: a single element, resolver arguments, list and dict literals
//! - `Interpolation`: the inside of `${...}` before a resolver colon
//! - `QuotedSingle` / `QuotedDouble`: the inside of a quoted string
//!
//! Tokens only carry their kind and byte span; the parser slices the input
//! to get their text.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Lexer mode, also used as the entry mode of a parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexerMode {
    /// Top-level text (`DEFAULT_MODE`)
    Default,
    /// Single values, sequences and containers (`VALUE_MODE`)
    Value,
    /// Inside `${` before any resolver colon
    Interpolation,
    /// Inside a single-quoted string
    QuotedSingle,
    /// Inside a double-quoted string
    QuotedDouble,
}

/// Kinds of tokens produced by the lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Top-level text
    /// Plain text outside of any interpolation
    TopStr,
    /// `\${`: an escaped interpolation opening
    EscInter,
    /// A run of escaped backslashes right before an interpolation
    TopEsc,

    // Shared between modes
    /// `${`
    InterOpen,
    /// `}` closing a node interpolation
    InterClose,

    // Value mode
    BraceOpen,
    BraceClose,
    BracketOpen,
    BracketClose,
    Comma,
    Colon,
    QuoteOpenSingle,
    QuoteOpenDouble,
    Null,
    Bool,
    Int,
    Float,
    Id,
    UnquotedChar,
    /// One or more backslash escapes such as `\,` or `\\`
    Esc,
    Ws,

    // Interpolation mode
    Dot,
    /// A key that is not a valid identifier (e.g. `0` or `a+b`)
    InterKey,

    // Quoted modes
    QuotedStr,
    /// Escaped backslashes, optionally followed by an escaped quote
    QuotedEsc,
    QuoteClose,

    Eof,
}

/// A token with its byte span in the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

/// Characters allowed as standalone unquoted characters in value mode
const UNQUOTED_CHARS: &[char] = &['/', '-', '\\', '+', '.', '$', '%', '*', '@', '?', '|'];

/// Characters that may follow a backslash to form an escape in value mode
const VALUE_ESCAPABLE: &[char] = &['\\', '(', ')', '[', ']', '{', '}', ':', '=', ',', ' ', '\t'];

/// Characters that end a key inside an interpolation
const KEY_TERMINATORS: &[char] = &['\\', '{', '}', '(', ')', '[', ']', ':', '.', '\'', '"'];

fn int_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[+-]?(?:0|[1-9](?:_?[0-9])*)").expect("valid int pattern")
    })
}

fn float_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let int = r"(?:0|[1-9](?:_?[0-9])*)";
        let digits = r"[0-9](?:_?[0-9])*";
        let exponent = format!(r"[eE][+-]?{digits}");
        let point = format!(r"(?:{int}?\.{digits}|{int}\.)");
        Regex::new(&format!(
            r"^[+-]?(?:{point}(?:{exponent})?|{int}{exponent}|(?i:inf|nan))"
        ))
        .expect("valid float pattern")
    })
}

fn null_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?i:null)").expect("valid null pattern"))
}

fn bool_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?i:true|false)").expect("valid bool pattern"))
}

/// Check whether `text` is a valid identifier (`[a-zA-Z_][a-zA-Z0-9_-]*`)
pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(is_identifier_char)
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn identifier_len(rest: &str) -> usize {
    let mut chars = rest.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    for (i, c) in chars {
        if !is_identifier_char(c) {
            return i;
        }
    }
    rest.len()
}

fn whitespace_len(rest: &str) -> usize {
    rest.find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(rest.len())
}

fn backslash_run(rest: &str) -> usize {
    rest.find(|c: char| c != '\\').unwrap_or(rest.len())
}

/// Reusable lexer state: the token buffer and the mode stack
#[derive(Debug, Default)]
pub struct Lexer {
    tokens: Vec<Token>,
    modes: Vec<LexerMode>,
}

impl Lexer {
    /// Create a lexer with empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize `input` starting in `mode`.
    ///
    /// The returned slice borrows the lexer's internal buffer, which is
    /// reused by the next call.
    pub fn tokenize(&mut self, input: &str, mode: LexerMode) -> Result<&[Token]> {
        self.tokens.clear();
        self.modes.clear();
        self.modes.push(mode);

        let mut pos = 0;
        while pos < input.len() {
            let current = match self.modes.last() {
                Some(m) => *m,
                None => return Err(Error::grammar_parse(input, "lexer mode stack is empty")),
            };
            pos = match current {
                LexerMode::Default => self.lex_default(input, pos),
                LexerMode::Value => self.lex_value(input, pos)?,
                LexerMode::Interpolation => self.lex_interpolation(input, pos)?,
                LexerMode::QuotedSingle => self.lex_quoted(input, pos, '\''),
                LexerMode::QuotedDouble => self.lex_quoted(input, pos, '"'),
            };
        }

        self.tokens.push(Token {
            kind: TokenKind::Eof,
            start: input.len(),
            end: input.len(),
        });
        Ok(&self.tokens)
    }

    fn emit(&mut self, kind: TokenKind, start: usize, end: usize) -> usize {
        self.tokens.push(Token { kind, start, end });
        end
    }

    fn pop_mode(&mut self, input: &str) -> Result<()> {
        // The entry mode must stay at the bottom of the stack
        if self.modes.len() <= 1 {
            return Err(Error::grammar_parse(input, "unbalanced closing brace"));
        }
        self.modes.pop();
        Ok(())
    }

    fn lex_default(&mut self, input: &str, pos: usize) -> usize {
        let rest = &input[pos..];

        if rest.starts_with("${") {
            self.modes.push(LexerMode::Interpolation);
            return self.emit(TokenKind::InterOpen, pos, pos + 2);
        }

        if rest.starts_with('\\') {
            let run = backslash_run(rest);
            if rest[run..].starts_with("${") {
                if run % 2 == 1 {
                    // \\\${ -> escaped backslash followed by an escaped interpolation
                    if run > 1 {
                        self.emit(TokenKind::TopEsc, pos, pos + run - 1);
                    }
                    return self.emit(TokenKind::EscInter, pos + run - 1, pos + run + 2);
                }
                return self.emit(TokenKind::TopEsc, pos, pos + run);
            }
            return self.emit(TokenKind::TopStr, pos, pos + run);
        }

        let mut end = rest.len();
        for (i, c) in rest.char_indices().skip(1) {
            if c == '\\' || rest[i..].starts_with("${") {
                end = i;
                break;
            }
        }
        self.emit(TokenKind::TopStr, pos, pos + end)
    }

    fn lex_value(&mut self, input: &str, pos: usize) -> Result<usize> {
        let rest = &input[pos..];

        if rest.starts_with("${") {
            self.modes.push(LexerMode::Interpolation);
            return Ok(self.emit(TokenKind::InterOpen, pos, pos + 2));
        }

        let ws = whitespace_len(rest);
        if ws > 0 {
            // Whitespace before punctuation belongs to that token
            match rest[ws..].chars().next() {
                Some(',' | '{' | '}' | '[' | ']' | ':') => {}
                _ => return Ok(self.emit(TokenKind::Ws, pos, pos + ws)),
            }
        }
        let start = pos;
        let pos = pos + ws;
        let rest = &input[pos..];
        let trailing_ws = |after: usize| after + whitespace_len(&input[after..]);

        let Some(c) = rest.chars().next() else {
            return Ok(input.len());
        };
        let token_end = match c {
            '{' => {
                self.modes.push(LexerMode::Value);
                self.emit(TokenKind::BraceOpen, start, trailing_ws(pos + 1))
            }
            '}' => {
                self.pop_mode(input)?;
                self.emit(TokenKind::BraceClose, start, pos + 1)
            }
            '[' => self.emit(TokenKind::BracketOpen, start, trailing_ws(pos + 1)),
            ']' => self.emit(TokenKind::BracketClose, start, pos + 1),
            ',' => self.emit(TokenKind::Comma, start, trailing_ws(pos + 1)),
            ':' => self.emit(TokenKind::Colon, start, trailing_ws(pos + 1)),
            '\'' => {
                self.modes.push(LexerMode::QuotedSingle);
                self.emit(TokenKind::QuoteOpenSingle, start, pos + 1)
            }
            '"' => {
                self.modes.push(LexerMode::QuotedDouble);
                self.emit(TokenKind::QuoteOpenDouble, start, pos + 1)
            }
            '\\' if rest[1..].starts_with(VALUE_ESCAPABLE) => {
                let mut end = 0;
                let bytes = rest.as_bytes();
                while end + 1 < rest.len()
                    && bytes[end] == b'\\'
                    && rest[end + 1..].starts_with(VALUE_ESCAPABLE)
                {
                    // Every escapable character is ASCII
                    end += 2;
                }
                self.emit(TokenKind::Esc, start, pos + end)
            }
            _ => match longest_literal(rest) {
                Some((kind, len)) => self.emit(kind, start, pos + len),
                None if UNQUOTED_CHARS.contains(&c) => {
                    self.emit(TokenKind::UnquotedChar, start, pos + c.len_utf8())
                }
                None => {
                    return Err(Error::grammar_parse(
                        input,
                        format!("unexpected character '{}' at position {}", c, pos),
                    ))
                }
            },
        };
        Ok(token_end)
    }

    fn lex_interpolation(&mut self, input: &str, pos: usize) -> Result<usize> {
        let rest = &input[pos..];

        let ws = whitespace_len(rest);
        if ws > 0 {
            return Ok(pos + ws);
        }
        if rest.starts_with("${") {
            self.modes.push(LexerMode::Interpolation);
            return Ok(self.emit(TokenKind::InterOpen, pos, pos + 2));
        }

        let Some(c) = rest.chars().next() else {
            return Ok(input.len());
        };
        let end = match c {
            '}' => {
                self.pop_mode(input)?;
                self.emit(TokenKind::InterClose, pos, pos + 1)
            }
            ':' => {
                // Resolver arguments are lexed as values; their closing
                // brace pops this mode.
                if let Some(top) = self.modes.last_mut() {
                    *top = LexerMode::Value;
                }
                let end = pos + 1 + whitespace_len(&rest[1..]);
                self.emit(TokenKind::Colon, pos, end)
            }
            '.' => self.emit(TokenKind::Dot, pos, pos + 1),
            '[' => self.emit(TokenKind::BracketOpen, pos, pos + 1),
            ']' => self.emit(TokenKind::BracketClose, pos, pos + 1),
            _ => {
                let mut len = rest.len();
                for (i, ch) in rest.char_indices() {
                    if ch.is_whitespace()
                        || KEY_TERMINATORS.contains(&ch)
                        || rest[i..].starts_with("${")
                    {
                        len = i;
                        break;
                    }
                }
                if len == 0 {
                    return Err(Error::grammar_parse(
                        input,
                        format!(
                            "unexpected character '{}' in interpolation at position {}",
                            c, pos
                        ),
                    ));
                }
                let kind = if is_identifier(&rest[..len]) {
                    TokenKind::Id
                } else {
                    TokenKind::InterKey
                };
                self.emit(kind, pos, pos + len)
            }
        };
        Ok(end)
    }

    fn lex_quoted(&mut self, input: &str, pos: usize, quote: char) -> usize {
        let rest = &input[pos..];

        if rest.starts_with("${") {
            self.modes.push(LexerMode::Interpolation);
            return self.emit(TokenKind::InterOpen, pos, pos + 2);
        }

        if rest.starts_with(quote) {
            // Quoted modes are never the entry mode, so this cannot underflow
            self.modes.pop();
            return self.emit(TokenKind::QuoteClose, pos, pos + 1);
        }

        if rest.starts_with('\\') {
            let run = backslash_run(rest);
            let after = &rest[run..];
            if after.starts_with(quote) {
                if run % 2 == 1 {
                    return self.emit(TokenKind::QuotedEsc, pos, pos + run + 1);
                }
                return self.emit(TokenKind::QuotedEsc, pos, pos + run);
            }
            if after.starts_with("${") {
                if run % 2 == 1 {
                    if run > 1 {
                        self.emit(TokenKind::QuotedEsc, pos, pos + run - 1);
                    }
                    return self.emit(TokenKind::EscInter, pos + run - 1, pos + run + 2);
                }
                return self.emit(TokenKind::QuotedEsc, pos, pos + run);
            }
            return self.emit(TokenKind::QuotedStr, pos, pos + run);
        }

        let mut end = rest.len();
        for (i, c) in rest.char_indices().skip(1) {
            if c == '\\' || c == quote || rest[i..].starts_with("${") {
                end = i;
                break;
            }
        }
        self.emit(TokenKind::QuotedStr, pos, pos + end)
    }
}

/// Find the longest literal token at the start of `rest`.
///
/// Ties go to the earlier kind in the order null, bool, int, float, id.
fn longest_literal(rest: &str) -> Option<(TokenKind, usize)> {
    let candidates = [
        (TokenKind::Null, null_pattern().find(rest).map_or(0, |m| m.end())),
        (TokenKind::Bool, bool_pattern().find(rest).map_or(0, |m| m.end())),
        (TokenKind::Int, int_pattern().find(rest).map_or(0, |m| m.end())),
        (TokenKind::Float, float_pattern().find(rest).map_or(0, |m| m.end())),
        (TokenKind::Id, identifier_len(rest)),
    ];

    let mut best: Option<(TokenKind, usize)> = None;
    for (kind, len) in candidates {
        if len > best.map_or(0, |(_, l)| l) {
            best = Some((kind, len));
        }
    }
    best
}

/// Decode a backslash escape token into the text it stands for
pub fn unescape(kind: TokenKind, text: &str) -> String {
    match kind {
        // `\${` -> `${`
        TokenKind::EscInter => text[1..].to_string(),
        // `\\\\` -> `\\`
        TokenKind::TopEsc => "\\".repeat(text.len() / 2),
        // `\,` -> `,`, `\\` -> `\`
        TokenKind::Esc => text.chars().skip(1).step_by(2).collect(),
        TokenKind::QuotedEsc => {
            let run = backslash_run(text);
            let mut out = "\\".repeat(run / 2);
            out.push_str(&text[run..]);
            out
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(input: &str, mode: LexerMode) -> Vec<TokenKind> {
        let mut lexer = Lexer::new();
        lexer
            .tokenize(input, mode)
            .unwrap()
            .iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_default_mode_plain_text() {
        assert_eq!(
            kinds("hello world", LexerMode::Default),
            vec![TokenKind::TopStr, TokenKind::Eof]
        );
    }

    #[test]
    fn test_default_mode_interpolation() {
        use TokenKind::*;
        assert_eq!(
            kinds("x_${a.b}", LexerMode::Default),
            vec![TopStr, InterOpen, Id, Dot, Id, InterClose, Eof]
        );
    }

    #[test]
    fn test_default_mode_escapes() {
        use TokenKind::*;
        assert_eq!(kinds(r"\${a}", LexerMode::Default), vec![EscInter, TopStr, Eof]);
        assert_eq!(
            kinds(r"\\${a}", LexerMode::Default),
            vec![TopEsc, InterOpen, Id, InterClose, Eof]
        );
        assert_eq!(
            kinds(r"\\\${a}", LexerMode::Default),
            vec![TopEsc, EscInter, TopStr, Eof]
        );
        // A lone backslash not followed by an interpolation is plain text
        assert_eq!(kinds(r"C:\temp", LexerMode::Default), vec![TopStr, TopStr, TopStr, Eof]);
    }

    #[test]
    fn test_value_mode_literals() {
        use TokenKind::*;
        assert_eq!(kinds("null", LexerMode::Value), vec![Null, Eof]);
        assert_eq!(kinds("TRUE", LexerMode::Value), vec![Bool, Eof]);
        assert_eq!(kinds("1_000", LexerMode::Value), vec![Int, Eof]);
        assert_eq!(kinds("-1.5e3", LexerMode::Value), vec![Float, Eof]);
        assert_eq!(kinds("-inf", LexerMode::Value), vec![Float, Eof]);
        assert_eq!(kinds("info", LexerMode::Value), vec![Id, Eof]);
        assert_eq!(kinds("nullable", LexerMode::Value), vec![Id, Eof]);
        assert_eq!(kinds("012", LexerMode::Value), vec![Int, Int, Eof]);
    }

    #[test]
    fn test_value_mode_whitespace_absorbed_by_punctuation() {
        use TokenKind::*;
        assert_eq!(
            kinds("[a , b ]", LexerMode::Value),
            vec![BracketOpen, Id, Comma, Id, BracketClose, Eof]
        );
        assert_eq!(kinds("a b", LexerMode::Value), vec![Id, Ws, Id, Eof]);
    }

    #[test]
    fn test_resolver_colon_switches_to_value_mode() {
        use TokenKind::*;
        assert_eq!(
            kinds("${foo:1,[a]}", LexerMode::Default),
            vec![InterOpen, Id, Colon, Int, Comma, BracketOpen, Id, BracketClose, BraceClose, Eof]
        );
    }

    #[test]
    fn test_quoted_mode() {
        use TokenKind::*;
        assert_eq!(
            kinds(r"'it\'s ${x}'", LexerMode::Value),
            vec![QuoteOpenSingle, QuotedStr, QuotedEsc, QuotedStr, InterOpen, Id, InterClose, QuoteClose, Eof]
        );
    }

    #[test]
    fn test_interpolation_keys() {
        use TokenKind::*;
        assert_eq!(
            kinds("${a[0].b-c}", LexerMode::Default),
            vec![InterOpen, Id, BracketOpen, InterKey, BracketClose, Dot, Id, InterClose, Eof]
        );
    }

    #[test]
    fn test_unexpected_character_is_an_error() {
        let mut lexer = Lexer::new();
        assert!(lexer.tokenize("a=b", LexerMode::Value).is_err());
        assert!(lexer.tokenize("${a(b)}", LexerMode::Default).is_err());
    }

    #[test]
    fn test_unbalanced_brace_is_an_error() {
        let mut lexer = Lexer::new();
        assert!(lexer.tokenize("}", LexerMode::Value).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(TokenKind::EscInter, r"\${"), "${");
        assert_eq!(unescape(TokenKind::TopEsc, r"\\\\"), r"\\");
        assert_eq!(unescape(TokenKind::Esc, r"\,\:\\"), r",:\");
        assert_eq!(unescape(TokenKind::QuotedEsc, r"\\\'"), r"\'");
    }

    #[test]
    fn test_buffers_are_reused() {
        let mut lexer = Lexer::new();
        let first = lexer.tokenize("${a}", LexerMode::Default).unwrap().len();
        let second = lexer.tokenize("b", LexerMode::Default).unwrap().len();
        assert_eq!(first, 4);
        assert_eq!(second, 2);
    }
}
