//! Parse tree evaluation
//!
//! Walks a [`ParseTree`] and turns it into a value. Node interpolations
//! and resolver calls are delegated to two callbacks, so the walk itself
//! knows nothing about the config tree.

use crate::error::{Error, Result};
use crate::grammar::{Element, Interpolation, ParseTree, Sequence, SequenceItem, Terminal, TextPart};
use crate::lexer::{unescape, TokenKind};
use crate::node::Node;
use crate::resolution::Memo;
use crate::resolver::ResolvedValue;
use crate::value::Value;

/// Evaluates parse trees.
///
/// `node_resolver` receives the text of a node interpolation key (e.g.
/// `..a.b[0]`), `resolver_invoker` receives a resolver name, the evaluated
/// arguments and their source texts.
pub struct GrammarVisitor<'m, N, R>
where
    N: FnMut(&str, &mut Memo) -> Result<Node>,
    R: FnMut(&str, Vec<ResolvedValue>, Vec<String>, &Memo) -> Result<ResolvedValue>,
{
    node_resolver: N,
    resolver_invoker: R,
    memo: &'m mut Memo,
}

impl<'m, N, R> GrammarVisitor<'m, N, R>
where
    N: FnMut(&str, &mut Memo) -> Result<Node>,
    R: FnMut(&str, Vec<ResolvedValue>, Vec<String>, &Memo) -> Result<ResolvedValue>,
{
    pub fn new(node_resolver: N, resolver_invoker: R, memo: &'m mut Memo) -> Self {
        Self {
            node_resolver,
            resolver_invoker,
            memo,
        }
    }

    /// Evaluate `tree`.
    ///
    /// Every failure comes out as a resolution error; errors from outside
    /// that family are wrapped.
    pub fn visit(&mut self, tree: &ParseTree) -> Result<ResolvedValue> {
        match tree {
            ParseTree::ConfigValue(parts) => self.text(parts),
            ParseTree::SingleElement(element) => self.element(element),
        }
        .map_err(Error::into_resolution)
    }

    /// A single interpolation keeps its type; anything else is a string
    fn text(&mut self, parts: &[TextPart]) -> Result<ResolvedValue> {
        if let [TextPart::Interpolation(interpolation)] = parts {
            return self.interpolation(interpolation);
        }
        Ok(Value::String(self.concat(parts)?).into())
    }

    fn concat(&mut self, parts: &[TextPart]) -> Result<String> {
        let mut out = String::new();
        for part in parts {
            match part {
                TextPart::Terminal(t) => out.push_str(&unescape(t.kind, &t.text)),
                TextPart::Interpolation(i) => {
                    out.push_str(&self.interpolation(i)?.to_value().to_string())
                }
            }
        }
        Ok(out)
    }

    fn element(&mut self, element: &Element) -> Result<ResolvedValue> {
        match element {
            Element::Primitive(parts) => self.primitive(parts),
            Element::Quoted(parts) => Ok(Value::String(self.concat(parts)?).into()),
            Element::List(sequence) => {
                let mut items = Vec::with_capacity(sequence.items.len());
                for item in &sequence.items {
                    items.push(self.sequence_item(item, sequence)?.to_value());
                }
                Ok(Value::Sequence(items).into())
            }
            Element::Dict(entries) => {
                let mut map = indexmap::IndexMap::with_capacity(entries.len());
                for entry in entries {
                    let key: String = entry
                        .key
                        .iter()
                        .map(|t| unescape(t.kind, &t.text))
                        .collect();
                    let value = self.element(&entry.value)?.to_value();
                    map.insert(key, value);
                }
                Ok(Value::Mapping(map).into())
            }
        }
    }

    fn primitive(&mut self, parts: &[TextPart]) -> Result<ResolvedValue> {
        let is_ws = |p: &TextPart| matches!(p, TextPart::Terminal(t) if t.kind == TokenKind::Ws);
        let (Some(start), Some(end)) = (
            parts.iter().position(|p| !is_ws(p)),
            parts.iter().rposition(|p| !is_ws(p)),
        ) else {
            // Only whitespace: keep it as is
            return Ok(Value::String(self.concat(parts)?).into());
        };

        match &parts[start..=end] {
            [TextPart::Interpolation(interpolation)] => self.interpolation(interpolation),
            [TextPart::Terminal(terminal)] => typed_terminal(terminal).map(Into::into),
            trimmed => Ok(Value::String(self.concat(trimmed)?).into()),
        }
    }

    fn sequence_item(&mut self, item: &SequenceItem, sequence: &Sequence) -> Result<ResolvedValue> {
        match &item.element {
            Some(element) => self.element(element),
            None => {
                log::warn!(
                    "In the sequence `{}` some elements are missing: please replace them with \
                     empty quoted strings.",
                    sequence.source
                );
                Ok(Value::String(String::new()).into())
            }
        }
    }

    fn interpolation(&mut self, interpolation: &Interpolation) -> Result<ResolvedValue> {
        match interpolation {
            Interpolation::Node { parts } => {
                let mut key = String::new();
                for part in parts {
                    key.push_str(&self.key_part(part)?);
                }
                (self.node_resolver)(&key, &mut *self.memo).map(ResolvedValue::Node)
            }
            Interpolation::Resolver { name, args } => {
                let mut names = Vec::with_capacity(name.len());
                for part in name {
                    names.push(self.key_part(part)?);
                }
                let name = names.join(".");

                let mut values = Vec::with_capacity(args.items.len());
                let mut sources = Vec::with_capacity(args.items.len());
                for item in &args.items {
                    values.push(self.sequence_item(item, args)?.into_plain());
                    sources.push(item.source.clone());
                }
                (self.resolver_invoker)(&name, values, sources, &*self.memo)
            }
        }
    }

    /// Text of one key part; nested interpolations must give a scalar
    fn key_part(&mut self, part: &TextPart) -> Result<String> {
        match part {
            TextPart::Terminal(t) => Ok(t.text.clone()),
            TextPart::Interpolation(i) => match self.interpolation(i)?.to_value() {
                value @ (Value::Null | Value::Sequence(_) | Value::Mapping(_)) => {
                    Err(Error::grammar_parse(
                        &value.to_string(),
                        format!(
                            "a nested key interpolation must give a string, number or \
                             boolean, got {}",
                            value.type_name()
                        ),
                    ))
                }
                value => Ok(value.to_string()),
            },
        }
    }
}

/// Type a lone primitive token
fn typed_terminal(terminal: &Terminal) -> Result<Value> {
    let text = terminal.text.as_str();
    Ok(match terminal.kind {
        TokenKind::Null => Value::Null,
        TokenKind::Bool => Value::Bool(text.eq_ignore_ascii_case("true")),
        TokenKind::Int => text
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| Error::grammar_parse(text, format!("invalid integer: {}", e)))?,
        TokenKind::Float => text
            .replace('_', "")
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| Error::grammar_parse(text, format!("invalid float: {}", e)))?,
        TokenKind::Esc => Value::String(unescape(terminal.kind, text)),
        _ => Value::String(text.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ResolutionErrorKind};
    use crate::grammar::{parse, Rule};
    use pretty_assertions::assert_eq;

    /// Evaluate without a config: node keys come back as `<key>` strings,
    /// resolvers as `name(arg|arg)`
    fn eval(input: &str, rule: Rule) -> Result<Value> {
        let tree = parse(input, rule)?;
        let mut memo = Memo::default();
        let mut visitor = GrammarVisitor::new(
            |key: &str, _memo: &mut Memo| Ok(Node::from_value(Value::String(format!("<{}>", key)))),
            |name: &str, args: Vec<ResolvedValue>, _sources: Vec<String>, _memo: &Memo| {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                Ok(Value::String(format!("{}({})", name, args.join("|"))).into())
            },
            &mut memo,
        );
        visitor.visit(&tree).map(|v| v.to_value())
    }

    fn element(input: &str) -> Value {
        eval(input, Rule::SingleElement).unwrap()
    }

    #[test]
    fn test_primitive_types() {
        assert_eq!(element("10"), Value::Integer(10));
        assert_eq!(element("1_000"), Value::Integer(1000));
        assert_eq!(element("-3"), Value::Integer(-3));
        assert_eq!(element("1.5"), Value::Float(1.5));
        assert_eq!(element("1e3"), Value::Float(1000.0));
        assert_eq!(element("TRUE"), Value::Bool(true));
        assert_eq!(element("false"), Value::Bool(false));
        assert_eq!(element("null"), Value::Null);
        assert_eq!(element("hello"), Value::String("hello".into()));
    }

    #[test]
    fn test_special_floats() {
        assert!(matches!(element("inf"), Value::Float(f) if f.is_infinite() && f > 0.0));
        assert!(matches!(element("-inf"), Value::Float(f) if f.is_infinite() && f < 0.0));
        assert!(matches!(element("nan"), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_integer_overflow_is_error() {
        let err = eval("99999999999999999999", Rule::SingleElement).unwrap_err();
        assert!(err.is_resolution_failure());
        assert!(err.to_string().contains("invalid integer"));
    }

    #[test]
    fn test_mixed_primitive_is_string() {
        assert_eq!(element("a b"), Value::String("a b".into()));
        assert_eq!(element("10 apples"), Value::String("10 apples".into()));
        assert_eq!(element(r"a\,b"), Value::String("a,b".into()));
    }

    #[test]
    fn test_quoted_is_always_string() {
        assert_eq!(element("'10'"), Value::String("10".into()));
        assert_eq!(element("'${a}'"), Value::String("<a>".into()));
        assert_eq!(element(r"'it\'s'"), Value::String("it's".into()));
    }

    #[test]
    fn test_list_and_dict() {
        assert_eq!(
            element("[1, a, 'b']"),
            Value::Sequence(vec![
                Value::Integer(1),
                Value::String("a".into()),
                Value::String("b".into()),
            ])
        );

        let mut expected = indexmap::IndexMap::new();
        expected.insert("a".to_string(), Value::Integer(1));
        expected.insert("b".to_string(), Value::Sequence(vec![Value::Bool(true)]));
        assert_eq!(element("{a: 1, b: [true]}"), Value::Mapping(expected));
    }

    #[test]
    fn test_empty_sequence_items() {
        assert_eq!(
            element("[a,,b]"),
            Value::Sequence(vec![
                Value::String("a".into()),
                Value::String("".into()),
                Value::String("b".into()),
            ])
        );
    }

    #[test]
    fn test_config_value_concatenation() {
        assert_eq!(
            eval("x_${a.b}_y", Rule::ConfigValue).unwrap(),
            Value::String("x_<a.b>_y".into())
        );
        assert_eq!(
            eval(r"\${a} and ${b}", Rule::ConfigValue).unwrap(),
            Value::String("${a} and <b>".into())
        );
    }

    #[test]
    fn test_relative_and_bracket_keys() {
        assert_eq!(
            eval("${..a[0].b}", Rule::ConfigValue).unwrap(),
            Value::String("<..a[0].b>".into())
        );
    }

    #[test]
    fn test_nested_key_interpolation() {
        assert_eq!(
            eval("${a.${b}}", Rule::ConfigValue).unwrap(),
            Value::String("<a.<b>>".into())
        );
    }

    #[test]
    fn test_resolver_arguments() {
        assert_eq!(
            eval("${foo.bar:1,x,${k}}", Rule::ConfigValue).unwrap(),
            Value::String("foo.bar(1|x|<k>)".into())
        );
        assert_eq!(
            eval("${foo:}", Rule::ConfigValue).unwrap(),
            Value::String("foo()".into())
        );
    }

    #[test]
    fn test_resolver_sources_and_typed_args() {
        let tree = parse("${r: 10, 'a b', [1,2]}", Rule::ConfigValue).unwrap();
        let mut memo = Memo::default();
        let mut seen = Vec::new();
        let mut visitor = GrammarVisitor::new(
            |_key: &str, _memo: &mut Memo| Ok(Node::from_value(Value::Null)),
            |_name: &str, args: Vec<ResolvedValue>, sources: Vec<String>, _memo: &Memo| {
                seen.push((args, sources));
                Ok(Value::Null.into())
            },
            &mut memo,
        );
        visitor.visit(&tree).unwrap();
        drop(visitor);

        let (args, sources) = &seen[0];
        assert_eq!(
            args,
            &vec![
                ResolvedValue::Value(Value::Integer(10)),
                ResolvedValue::Value(Value::String("a b".into())),
                ResolvedValue::Value(Value::Sequence(vec![Value::Integer(1), Value::Integer(2)])),
            ]
        );
        assert_eq!(sources, &vec!["10", "'a b'", "[1,2]"]);
    }

    #[test]
    fn test_callback_errors_become_resolution_errors() {
        let tree = parse("${a}", Rule::ConfigValue).unwrap();
        let mut memo = Memo::default();
        let mut visitor = GrammarVisitor::new(
            |key: &str, _memo: &mut Memo| Err(Error::key_not_found(key)),
            |_name: &str, _args: Vec<ResolvedValue>, _sources: Vec<String>, _memo: &Memo| {
                Ok(Value::Null.into())
            },
            &mut memo,
        );
        let err = visitor.visit(&tree).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Resolution(ResolutionErrorKind::Generic {
                kind: "KeyNotFound".into()
            })
        );
    }

    #[test]
    fn test_null_nested_key_is_error() {
        let tree = parse("${a.${b}}", Rule::ConfigValue).unwrap();
        let mut memo = Memo::default();
        let mut visitor = GrammarVisitor::new(
            |key: &str, _memo: &mut Memo| match key {
                "b" => Ok(Node::from_value(Value::Null)),
                _ => Ok(Node::from_value(Value::Integer(1))),
            },
            |_name: &str, _args: Vec<ResolvedValue>, _sources: Vec<String>, _memo: &Memo| {
                Ok(Value::Null.into())
            },
            &mut memo,
        );
        let err = visitor.visit(&tree).unwrap_err();
        assert!(err.is_resolution_failure());
        assert!(err.to_string().contains("nested key interpolation"));
    }
}
