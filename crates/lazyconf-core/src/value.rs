//! Raw configuration data
//!
//! A [`Value`] is what a document holds before anything is resolved: leaf
//! strings may still be `${...}` interpolations or the [`MISSING`] marker.
//! Resolution produces plain values of the same type, and [`split_key`]
//! turns the keys used inside interpolations into path segments.

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Text of a mandatory value that has no value yet
pub const MISSING: &str = "???";

/// Document data, as loaded or as resolved.
///
/// Serialises untagged, so YAML and JSON map onto it directly. Mapping
/// order is the document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    /// Plain text, an interpolation such as `x_${a.b}`, or `???`
    String(String),
    Sequence(Vec<Value>),
    Mapping(IndexMap<String, Value>),
}

impl Value {
    /// `???` as a value
    pub fn missing() -> Self {
        Value::String(MISSING.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True only for the exact text `???`
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::String(s) if s == MISSING)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, Value::Sequence(_))
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Value::Mapping(_))
    }

    /// The integer held, without coercing strings or floats
    pub fn as_i64(&self) -> Option<i64> {
        if let Value::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    /// The text held, which may still be an unresolved interpolation
    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_mapping(&self) -> Option<&IndexMap<String, Value>> {
        if let Value::Mapping(m) = self {
            Some(m)
        } else {
            None
        }
    }

    /// Name used in conversion and type errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }
}

/// Text form used for string interpolation (`port_${p}`) and error messages
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(n) if n.is_nan() => write!(f, "nan"),
            Value::Float(n) if n.is_infinite() => {
                write!(f, "{}", if *n > 0.0 { "inf" } else { "-inf" })
            }
            // Debug keeps the fractional part: 1.0 instead of 1
            Value::Float(n) => write!(f, "{:?}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Sequence(seq) => {
                write!(f, "[")?;
                for (i, v) in seq.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Mapping(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

macro_rules! value_from {
    ($($source:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from($v: $source) -> Self {
                    $body
                }
            }
        )*
    };
}

value_from! {
    bool => |b| Value::Bool(b),
    i64 => |i| Value::Integer(i),
    i32 => |i| Value::Integer(i64::from(i)),
    f64 => |n| Value::Float(n),
    String => |s| Value::String(s),
    &str => |s| Value::String(s.to_owned()),
    IndexMap<String, Value> => |m| Value::Mapping(m),
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

fn key_head() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\.*[^.\[]*").expect("valid key head pattern"))
}

fn key_other() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\.([^.\[]*)|\[(.*?)\]").expect("valid key segment pattern")
    })
}

/// Split a key into its segments.
///
/// Leading dots become empty segments, and both `.b` and `[b]` forms become
/// plain segments:
/// - `a.b[c].d` -> `["a", "b", "c", "d"]`
/// - `..a` -> `["", "", "a"]`
/// - `[a].b` -> `["a", "b"]`
pub fn split_key(key: &str) -> Vec<String> {
    let first_stop = key_head().find(key).map_or(0, |m| m.end());
    let mut tokens: Vec<String> = key[..first_stop].split('.').map(str::to_string).collect();

    if first_stop == key.len() {
        return tokens;
    }

    // `[a]` or `..[a]`: the head ends in an empty segment that is not a key
    if key[first_stop..].starts_with('[') && tokens.last().is_some_and(|t| t.is_empty()) {
        tokens.pop();
    }

    for caps in key_other().captures_iter(&key[first_stop..]) {
        let segment = caps
            .get(1)
            .filter(|m| !m.as_str().is_empty())
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        tokens.push(segment.to_string());
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_simple_key() {
        assert_eq!(split_key("database"), vec!["database"]);
        assert_eq!(split_key(""), vec![""]);
    }

    #[test]
    fn test_split_dotted_key() {
        assert_eq!(split_key("database.host"), vec!["database", "host"]);
    }

    #[test]
    fn test_split_bracket_key() {
        assert_eq!(split_key("servers[0].host"), vec!["servers", "0", "host"]);
        assert_eq!(split_key("[a].b"), vec!["a", "b"]);
        assert_eq!(split_key("a[b][c]"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_split_relative_key() {
        assert_eq!(split_key(".a"), vec!["", "a"]);
        assert_eq!(split_key("..a.b"), vec!["", "", "a", "b"]);
        assert_eq!(split_key("..[a]"), vec!["", "", "a"]);
    }

    #[test]
    fn test_missing_marker() {
        assert!(Value::missing().is_missing());
        assert_eq!(Value::missing().as_str(), Some(MISSING));
        assert!(!Value::from("??").is_missing());
        assert!(!Value::from("${a}").is_missing());
        assert!(!Value::Null.is_missing());
    }

    #[test]
    fn test_interpolation_text_is_kept_raw() {
        let value: Value = serde_yaml::from_str("url: http://${host}:${port}\nport: 80").unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map["url"].as_str(), Some("http://${host}:${port}"));
        assert_eq!(map["port"].as_i64(), Some(80));
        assert_eq!(map["port"].as_str(), None);
        assert_eq!(Value::from("12").as_i64(), None);
    }

    #[test]
    fn test_split_mixed_relative_and_bracket_key() {
        assert_eq!(split_key(".servers[0].host"), vec!["", "servers", "0", "host"]);
        assert_eq!(split_key("..[servers][1]"), vec!["", "", "servers", "1"]);
        assert_eq!(split_key("a.b[c.d]"), vec!["a", "b", "c.d"]);
    }

    #[test]
    fn test_float_display() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(f64::INFINITY).to_string(), "inf");
        assert_eq!(Value::Float(f64::NEG_INFINITY).to_string(), "-inf");
        assert_eq!(Value::Float(f64::NAN).to_string(), "nan");
    }

    #[test]
    fn test_container_display() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Value::Integer(1));
        map.insert("b".to_string(), Value::from(vec!["x", "y"]));
        assert_eq!(Value::Mapping(map).to_string(), "{a: 1, b: [x, y]}");
    }

    #[test]
    fn test_from_conversions() {
        assert_eq!(Value::from(3), Value::Integer(3));
        assert_eq!(Value::from(vec![1_i64, 2]), Value::Sequence(vec![Value::Integer(1), Value::Integer(2)]));
        assert_eq!(Value::from(true).type_name(), "boolean");
    }
}
