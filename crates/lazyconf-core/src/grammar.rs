//! Interpolation grammar
//!
//! Parses interpolation strings into a parse tree. Two entry rules exist:
//! - `configValue`: arbitrary text with zero or more interpolations,
//!   e.g. `path/${name}.txt` or `\${escaped}`
//! - `singleElement`: exactly one value expression, e.g. `123`,
//!   `[a, b]`, `{a: 1}`, `'quoted'` or `${a.b}`
//!
//! Interpolations are either node paths (`${a.b}`, `${..x[0]}`) or resolver
//! calls (`${name:arg1,arg2}`), and can be nested anywhere a value or key
//! is allowed.
//!
//! Building a lexer is cheap here, but its buffers are reused through a
//! process-wide slot guarded by a non-blocking lock. A caller that cannot
//! take the lock immediately parses with a fresh, disposable lexer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, TryLockError};

use crate::error::{Error, Result};
use crate::lexer::{Lexer, LexerMode, Token, TokenKind};

/// Entry rule of a parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Text possibly containing interpolations
    ConfigValue,
    /// A single value expression
    SingleElement,
}

impl Rule {
    /// The lexer mode this rule starts in
    pub fn lexer_mode(self) -> LexerMode {
        match self {
            Rule::ConfigValue => LexerMode::Default,
            Rule::SingleElement => LexerMode::Value,
        }
    }
}

/// A token copied out of the input
#[derive(Debug, Clone, PartialEq)]
pub struct Terminal {
    pub kind: TokenKind,
    pub text: String,
}

/// One part of a text span: a literal token or an interpolation
#[derive(Debug, Clone, PartialEq)]
pub enum TextPart {
    Terminal(Terminal),
    Interpolation(Interpolation),
}

/// A value expression
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Unquoted tokens and interpolations (`foo`, `10`, `a_${b}`)
    Primitive(Vec<TextPart>),
    /// Quoted string contents, without the quotes
    Quoted(Vec<TextPart>),
    /// `[a, b]`
    List(Sequence),
    /// `{k: v}`
    Dict(Vec<DictEntry>),
}

/// One `key: value` pair of a dict literal
#[derive(Debug, Clone, PartialEq)]
pub struct DictEntry {
    pub key: Vec<Terminal>,
    pub value: Element,
}

/// A comma-separated sequence of elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    pub items: Vec<SequenceItem>,
    /// Source text of the whole sequence
    pub source: String,
}

/// A sequence element along with its source text.
///
/// `element` is `None` for the empty elements produced by leading,
/// trailing or consecutive commas.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceItem {
    pub element: Option<Element>,
    pub source: String,
}

/// A `${...}` expression
#[derive(Debug, Clone, PartialEq)]
pub enum Interpolation {
    /// `${a.b[c]}`: dots, brackets and key parts in source order
    Node { parts: Vec<TextPart> },
    /// `${name:args}`: the dotted name parts and the arguments
    Resolver { name: Vec<TextPart>, args: Sequence },
}

/// Output of a parse
#[derive(Debug, Clone, PartialEq)]
pub enum ParseTree {
    ConfigValue(Vec<TextPart>),
    SingleElement(Element),
}

/// Recursive-descent parser over a token buffer
struct Parser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn current(&self) -> Token {
        self.tokens.get(self.pos).copied().unwrap_or(Token {
            kind: TokenKind::Eof,
            start: self.input.len(),
            end: self.input.len(),
        })
    }

    fn peek(&self) -> TokenKind {
        self.kind_at(self.pos)
    }

    fn kind_at(&self, index: usize) -> TokenKind {
        self.tokens.get(index).map_or(TokenKind::Eof, |t| t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.current();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn previous_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |t| t.end)
    }

    fn terminal(&self, token: Token) -> Terminal {
        Terminal {
            kind: token.kind,
            text: self.input[token.start..token.end].to_string(),
        }
    }

    fn take_terminal(&mut self) -> Terminal {
        let token = self.advance();
        self.terminal(token)
    }

    fn error(&self, message: impl std::fmt::Display) -> Error {
        Error::grammar_parse(
            self.input,
            format!("{} at position {}", message, self.current().start),
        )
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.peek() == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn parse(&mut self, rule: Rule) -> Result<ParseTree> {
        let tree = match rule {
            Rule::ConfigValue => ParseTree::ConfigValue(self.text()?),
            Rule::SingleElement => ParseTree::SingleElement(self.element()?),
        };
        self.expect(TokenKind::Eof, "end of input")?;
        Ok(tree)
    }

    /// configValue: (interpolation | TOP_STR | ESC_INTER | TOP_ESC)*
    fn text(&mut self) -> Result<Vec<TextPart>> {
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                TokenKind::TopStr | TokenKind::EscInter | TokenKind::TopEsc => {
                    parts.push(TextPart::Terminal(self.take_terminal()));
                }
                TokenKind::InterOpen => {
                    parts.push(TextPart::Interpolation(self.interpolation()?));
                }
                _ => return Ok(parts),
            }
        }
    }

    fn element(&mut self) -> Result<Element> {
        match self.peek() {
            TokenKind::QuoteOpenSingle | TokenKind::QuoteOpenDouble => self.quoted(),
            TokenKind::BracketOpen => self.list(),
            TokenKind::BraceOpen => self.dict(),
            kind if is_primitive_start(kind) => self.primitive(),
            kind => Err(self.error(format!("expected a value, found {:?}", kind))),
        }
    }

    fn primitive(&mut self) -> Result<Element> {
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                TokenKind::InterOpen => {
                    parts.push(TextPart::Interpolation(self.interpolation()?));
                }
                kind if is_primitive_token(kind) => {
                    parts.push(TextPart::Terminal(self.take_terminal()));
                }
                _ => break,
            }
        }
        if parts.is_empty() {
            return Err(self.error("expected a value"));
        }
        Ok(Element::Primitive(parts))
    }

    fn quoted(&mut self) -> Result<Element> {
        self.advance();
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                TokenKind::QuotedStr | TokenKind::QuotedEsc | TokenKind::EscInter => {
                    parts.push(TextPart::Terminal(self.take_terminal()));
                }
                TokenKind::InterOpen => {
                    parts.push(TextPart::Interpolation(self.interpolation()?));
                }
                TokenKind::QuoteClose => {
                    self.advance();
                    return Ok(Element::Quoted(parts));
                }
                _ => return Err(self.error("unterminated quoted string")),
            }
        }
    }

    fn list(&mut self) -> Result<Element> {
        self.advance();
        if self.peek() == TokenKind::BracketClose {
            self.advance();
            return Ok(Element::List(Sequence::default()));
        }
        let sequence = self.sequence()?;
        self.expect(TokenKind::BracketClose, "']'")?;
        Ok(Element::List(sequence))
    }

    fn dict(&mut self) -> Result<Element> {
        self.advance();
        let mut entries = Vec::new();
        if self.peek() == TokenKind::BraceClose {
            self.advance();
            return Ok(Element::Dict(entries));
        }
        loop {
            let mut key = Vec::new();
            while is_primitive_token(self.peek()) {
                key.push(self.take_terminal());
            }
            if key.is_empty() {
                return Err(self.error("expected a dictionary key"));
            }
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.element()?;
            entries.push(DictEntry { key, value });

            if self.peek() == TokenKind::Comma {
                self.advance();
            } else {
                self.expect(TokenKind::BraceClose, "'}'")?;
                return Ok(Element::Dict(entries));
            }
        }
    }

    /// sequence: (element (COMMA element?)*) | (COMMA element?)+
    fn sequence(&mut self) -> Result<Sequence> {
        let start = self.current().start;
        let mut items = Vec::new();
        let mut previous_comma = true;
        loop {
            match self.peek() {
                TokenKind::Comma => {
                    self.advance();
                    if previous_comma {
                        items.push(SequenceItem::empty());
                    }
                    previous_comma = true;
                }
                kind if is_element_start(kind) => {
                    if !previous_comma {
                        return Err(self.error("expected ','"));
                    }
                    let first = self.current().start;
                    let element = self.element()?;
                    items.push(SequenceItem {
                        element: Some(element),
                        source: self.input[first..self.previous_end()].to_string(),
                    });
                    previous_comma = false;
                }
                _ => break,
            }
        }
        if previous_comma {
            items.push(SequenceItem::empty());
        }
        Ok(Sequence {
            items,
            source: self.input[start..self.previous_end()].to_string(),
        })
    }

    fn interpolation(&mut self) -> Result<Interpolation> {
        self.expect(TokenKind::InterOpen, "'${'")?;
        if self.resolver_ahead() {
            self.resolver()
        } else {
            self.node()
        }
    }

    /// Look ahead for `name(.name)*:` where each name is an ID or a nested
    /// interpolation.
    fn resolver_ahead(&self) -> bool {
        let mut i = self.pos;
        loop {
            match self.kind_at(i) {
                TokenKind::Id => i += 1,
                TokenKind::InterOpen => match self.skip_interpolation(i) {
                    Some(next) => i = next,
                    None => return false,
                },
                _ => return false,
            }
            match self.kind_at(i) {
                TokenKind::Dot => i += 1,
                TokenKind::Colon => return true,
                _ => return false,
            }
        }
    }

    /// Index right after the interpolation opening at `start`
    fn skip_interpolation(&self, start: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut i = start;
        loop {
            match self.kind_at(i) {
                TokenKind::InterOpen | TokenKind::BraceOpen => depth += 1,
                TokenKind::InterClose | TokenKind::BraceClose => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                TokenKind::Eof => return None,
                _ => {}
            }
            i += 1;
        }
    }

    fn resolver(&mut self) -> Result<Interpolation> {
        let mut name = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Id => name.push(TextPart::Terminal(self.take_terminal())),
                TokenKind::InterOpen => {
                    name.push(TextPart::Interpolation(self.interpolation()?));
                }
                kind => return Err(self.error(format!("invalid resolver name {:?}", kind))),
            }
            if self.peek() == TokenKind::Dot {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::Colon, "':'")?;

        let args = if self.peek() == TokenKind::BraceClose {
            Sequence::default()
        } else {
            self.sequence()?
        };
        self.expect(TokenKind::BraceClose, "'}'")?;
        Ok(Interpolation::Resolver { name, args })
    }

    fn node(&mut self) -> Result<Interpolation> {
        let mut parts = Vec::new();
        while self.peek() == TokenKind::Dot {
            parts.push(TextPart::Terminal(self.take_terminal()));
        }
        if self.peek() == TokenKind::InterClose {
            // `${.}` and `${..}` refer to the container itself or an ancestor
            if parts.is_empty() {
                return Err(self.error("empty interpolation"));
            }
            self.advance();
            return Ok(Interpolation::Node { parts });
        }

        if self.peek() == TokenKind::BracketOpen {
            self.bracket_key(&mut parts)?;
        } else {
            self.config_key(&mut parts)?;
        }
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    parts.push(TextPart::Terminal(self.take_terminal()));
                    self.config_key(&mut parts)?;
                }
                TokenKind::BracketOpen => self.bracket_key(&mut parts)?,
                TokenKind::InterClose => {
                    self.advance();
                    return Ok(Interpolation::Node { parts });
                }
                kind => {
                    return Err(self.error(format!("unexpected {:?} in interpolation", kind)))
                }
            }
        }
    }

    /// configKey: interpolation | ID | INTER_KEY
    fn config_key(&mut self, parts: &mut Vec<TextPart>) -> Result<()> {
        match self.peek() {
            TokenKind::Id | TokenKind::InterKey => {
                parts.push(TextPart::Terminal(self.take_terminal()));
            }
            TokenKind::InterOpen => parts.push(TextPart::Interpolation(self.interpolation()?)),
            kind => return Err(self.error(format!("expected a key, found {:?}", kind))),
        }
        Ok(())
    }

    fn bracket_key(&mut self, parts: &mut Vec<TextPart>) -> Result<()> {
        parts.push(TextPart::Terminal(self.take_terminal()));
        self.config_key(parts)?;
        let close = self.expect(TokenKind::BracketClose, "']'")?;
        parts.push(TextPart::Terminal(self.terminal(close)));
        Ok(())
    }
}

impl SequenceItem {
    fn empty() -> Self {
        Self {
            element: None,
            source: String::new(),
        }
    }
}

fn is_primitive_token(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Id
            | TokenKind::Null
            | TokenKind::Int
            | TokenKind::Float
            | TokenKind::Bool
            | TokenKind::UnquotedChar
            | TokenKind::Esc
            | TokenKind::Ws
    )
}

fn is_primitive_start(kind: TokenKind) -> bool {
    kind == TokenKind::InterOpen || is_primitive_token(kind)
}

fn is_element_start(kind: TokenKind) -> bool {
    is_primitive_start(kind)
        || matches!(
            kind,
            TokenKind::QuoteOpenSingle
                | TokenKind::QuoteOpenDouble
                | TokenKind::BracketOpen
                | TokenKind::BraceOpen
        )
}

static NEXT_PARSER_ID: AtomicU64 = AtomicU64::new(0);

/// A lexer with an identity, so tests can tell cached and fresh ones apart
#[derive(Debug)]
struct GrammarParser {
    id: u64,
    lexer: Lexer,
}

impl GrammarParser {
    fn new() -> Self {
        Self {
            id: NEXT_PARSER_ID.fetch_add(1, Ordering::Relaxed),
            lexer: Lexer::new(),
        }
    }

    fn parse(&mut self, input: &str, rule: Rule) -> Result<ParseTree> {
        let tokens = self.lexer.tokenize(input, rule.lexer_mode())?;
        Parser {
            input,
            tokens,
            pos: 0,
        }
        .parse(rule)
    }
}

fn cached_parser() -> &'static Mutex<GrammarParser> {
    static CACHE: OnceLock<Mutex<GrammarParser>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(GrammarParser::new()))
}

/// Parse `input` with `rule`, reusing the shared parser when it is free
pub fn parse(input: &str, rule: Rule) -> Result<ParseTree> {
    parse_with_id(input, rule).map(|(tree, _)| tree)
}

/// Parse `input` with a fresh parser, never touching the shared one
pub fn parse_uncached(input: &str, rule: Rule) -> Result<ParseTree> {
    GrammarParser::new().parse(input, rule)
}

/// Like [`parse`], also returning the identity of the parser that ran
pub(crate) fn parse_with_id(input: &str, rule: Rule) -> Result<(ParseTree, u64)> {
    match cached_parser().try_lock() {
        Ok(mut parser) => {
            let id = parser.id;
            parser.parse(input, rule).map(|tree| (tree, id))
        }
        // Busy or poisoned: never wait, use a throwaway parser instead
        Err(TryLockError::WouldBlock | TryLockError::Poisoned(_)) => {
            log::trace!("Grammar cache unavailable, parsing with a fresh parser");
            let mut parser = GrammarParser::new();
            let id = parser.id;
            parser.parse(input, rule).map(|tree| (tree, id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    fn term(kind: TokenKind, text: &str) -> TextPart {
        TextPart::Terminal(Terminal {
            kind,
            text: text.into(),
        })
    }

    fn node(parts: Vec<TextPart>) -> TextPart {
        TextPart::Interpolation(Interpolation::Node { parts })
    }

    #[test]
    fn test_parse_plain_text() {
        let tree = parse("hello", Rule::ConfigValue).unwrap();
        assert_eq!(
            tree,
            ParseTree::ConfigValue(vec![term(TokenKind::TopStr, "hello")])
        );
    }

    #[test]
    fn test_parse_empty_text() {
        let tree = parse("", Rule::ConfigValue).unwrap();
        assert_eq!(tree, ParseTree::ConfigValue(vec![]));
    }

    #[test]
    fn test_parse_node_interpolation_in_text() {
        let tree = parse("x_${a.b}", Rule::ConfigValue).unwrap();
        assert_eq!(
            tree,
            ParseTree::ConfigValue(vec![
                term(TokenKind::TopStr, "x_"),
                node(vec![
                    term(TokenKind::Id, "a"),
                    term(TokenKind::Dot, "."),
                    term(TokenKind::Id, "b"),
                ]),
            ])
        );
    }

    #[test]
    fn test_parse_relative_and_bracket_keys() {
        let tree = parse("${..a[0]}", Rule::ConfigValue).unwrap();
        assert_eq!(
            tree,
            ParseTree::ConfigValue(vec![node(vec![
                term(TokenKind::Dot, "."),
                term(TokenKind::Dot, "."),
                term(TokenKind::Id, "a"),
                term(TokenKind::BracketOpen, "["),
                term(TokenKind::InterKey, "0"),
                term(TokenKind::BracketClose, "]"),
            ])])
        );
    }

    #[test]
    fn test_parse_dots_only() {
        assert!(parse("${.}", Rule::ConfigValue).is_ok());
        assert!(parse("${..}", Rule::ConfigValue).is_ok());
    }

    #[test]
    fn test_parse_resolver() {
        let tree = parse("${oc.env:HOME,/tmp}", Rule::ConfigValue).unwrap();
        let ParseTree::ConfigValue(parts) = tree else {
            panic!("expected configValue");
        };
        let TextPart::Interpolation(Interpolation::Resolver { name, args }) = &parts[0] else {
            panic!("expected resolver");
        };
        assert_eq!(
            name,
            &vec![term(TokenKind::Id, "oc"), term(TokenKind::Id, "env")]
        );
        let sources: Vec<&str> = args.items.iter().map(|i| i.source.as_str()).collect();
        assert_eq!(sources, vec!["HOME", "/tmp"]);
        assert_eq!(args.source, "HOME,/tmp");
    }

    #[test]
    fn test_parse_resolver_without_args() {
        let tree = parse("${now:}", Rule::ConfigValue).unwrap();
        let ParseTree::ConfigValue(parts) = tree else {
            panic!("expected configValue");
        };
        assert!(matches!(
            &parts[0],
            TextPart::Interpolation(Interpolation::Resolver { args, .. }) if args.items.is_empty()
        ));
    }

    #[test]
    fn test_parse_interpolated_resolver_name() {
        let tree = parse("${${which}:x}", Rule::ConfigValue).unwrap();
        let ParseTree::ConfigValue(parts) = tree else {
            panic!("expected configValue");
        };
        let TextPart::Interpolation(Interpolation::Resolver { name, .. }) = &parts[0] else {
            panic!("expected resolver");
        };
        assert_eq!(name, &vec![node(vec![term(TokenKind::Id, "which")])]);
    }

    #[test]
    fn test_parse_empty_sequence_items() {
        let tree = parse("${foo:,a,,}", Rule::ConfigValue).unwrap();
        let ParseTree::ConfigValue(parts) = tree else {
            panic!("expected configValue");
        };
        let TextPart::Interpolation(Interpolation::Resolver { args, .. }) = &parts[0] else {
            panic!("expected resolver");
        };
        let present: Vec<bool> = args.items.iter().map(|i| i.element.is_some()).collect();
        assert_eq!(present, vec![false, true, false, false]);
    }

    #[test]
    fn test_parse_single_element_containers() {
        let tree = parse("{a: [1, 2], b: 'x'}", Rule::SingleElement).unwrap();
        let ParseTree::SingleElement(Element::Dict(entries)) = tree else {
            panic!("expected dict");
        };
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0].value, Element::List(seq) if seq.items.len() == 2));
        assert!(matches!(&entries[1].value, Element::Quoted(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("${}", Rule::ConfigValue).is_err());
        assert!(parse("${a", Rule::ConfigValue).is_err());
        assert!(parse("${a.}", Rule::ConfigValue).is_err());
        assert!(parse("${a[0]:x}", Rule::ConfigValue).is_err());
        assert!(parse("[1, 2", Rule::SingleElement).is_err());
        assert!(parse("'abc", Rule::SingleElement).is_err());
        assert!(parse("a b c}", Rule::SingleElement).is_err());
        assert!(parse("[1] x", Rule::SingleElement).is_err());
    }

    #[test]
    fn test_parse_uncached_matches_cached() {
        let input = "a_${b:1,[x, y]}_${c.d}";
        assert_eq!(
            parse(input, Rule::ConfigValue).unwrap(),
            parse_uncached(input, Rule::ConfigValue).unwrap()
        );
    }

    #[test]
    fn test_concurrent_parses_fall_back_to_fresh_parsers() {
        const THREADS: usize = 8;

        // Hold the shared slot so every thread has to build its own parser
        let guard = cached_parser().lock().unwrap();
        let cached_id = guard.id;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let input = format!("${{key{}}}_{}", i, i);
                    let (tree, id) = parse_with_id(&input, Rule::ConfigValue).unwrap();
                    (i, tree, id)
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            let (i, tree, id) = handle.join().unwrap();
            assert_eq!(
                tree,
                ParseTree::ConfigValue(vec![
                    node(vec![term(TokenKind::Id, &format!("key{}", i))]),
                    term(TokenKind::TopStr, &format!("_{}", i)),
                ])
            );
            assert_ne!(id, cached_id);
            ids.insert(id);
        }
        drop(guard);

        assert_eq!(ids.len(), THREADS);
    }

    #[test]
    fn test_concurrent_parses_never_mix_inputs() {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let input = format!("v{}_${{k{}}}", i, j);
                        let tree = parse(&input, Rule::ConfigValue).unwrap();
                        assert_eq!(
                            tree,
                            ParseTree::ConfigValue(vec![
                                term(TokenKind::TopStr, &format!("v{}_", i)),
                                node(vec![term(TokenKind::Id, &format!("k{}", j))]),
                            ])
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
