//! Main Config type for lazyconf
//!
//! A [`Config`] owns the root of a config tree and offers path-based access
//! to it. Interpolations are resolved lazily, on each access, and resolver
//! results marked as cacheable are kept on the root.

use crate::error::{Error, ErrorKind, ResolutionErrorKind, Result};
use crate::node::{Node, NodeKind, ResolverCache};
use crate::resolution::{select_node, SelectOptions};
use crate::resolver::ResolvedValue;
use crate::value::{split_key, Value};

/// The main configuration container
pub struct Config {
    root: Node,
}

impl Config {
    /// Create a new Config from a Value
    pub fn new(value: Value) -> Self {
        Self {
            root: Node::from_value(value),
        }
    }

    /// Wrap an existing tree. The node becomes the root even if it has a
    /// parent.
    pub fn from_node(root: Node) -> Self {
        Self { root }
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml).map_err(|e| Error::parse(e.to_string()))?;
        Ok(Self::new(value))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| Error::parse(e.to_string()))?;
        Ok(Self::new(value))
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Select the node at `path`, relative to the root
    pub fn select(&self, path: &str, options: &SelectOptions) -> Result<Option<Node>> {
        select_node(&self.root, path, options)
    }

    /// Select the value at `path`.
    ///
    /// Containers come back as nodes and leaves as plain values. Absent
    /// keys give the default or null, missing values give the default or
    /// `???`.
    pub fn select_value(&self, path: &str, options: &SelectOptions) -> Result<ResolvedValue> {
        let selected = match self.select(path, options) {
            Ok(selected) => selected,
            Err(e)
                if options.default.is_some()
                    && matches!(
                        e.kind,
                        ErrorKind::Resolution(ResolutionErrorKind::KeyNotFound { .. })
                    ) =>
            {
                None
            }
            Err(e) => return Err(e),
        };

        match (selected, &options.default) {
            (Some(node), _) if !node.is_missing() => Ok(ResolvedValue::Node(node).into_plain()),
            (_, Some(default)) => Ok(default.clone().into()),
            (Some(_), None) => Ok(Value::missing().into()),
            (None, None) => Ok(Value::Null.into()),
        }
    }

    /// The node at `path` without resolving anything on the way
    fn raw_node(&self, path: &str) -> Result<Node> {
        if path.is_empty() {
            return Ok(self.root.clone());
        }
        let mut node = self.root.clone();
        for segment in split_key(path) {
            node = node
                .child(&segment)
                .ok_or_else(|| Error::key_not_found(path).with_path(path))?;
        }
        Ok(node)
    }

    /// The node at `path`, with the target resolved if it is an
    /// interpolation
    fn node_at(&self, path: &str) -> Result<Node> {
        self.select(path, &SelectOptions::default())?
            .ok_or_else(|| Error::key_not_found(path).with_path(path))
    }

    /// Get the raw (unresolved) value at a path
    pub fn get_raw(&self, path: &str) -> Result<Value> {
        self.raw_node(path).map(|n| n.to_value())
    }

    /// Get a fully resolved value at a path.
    ///
    /// Containers are resolved recursively; missing values inside them
    /// stay `???`, but a missing value at `path` itself is an error.
    pub fn get(&self, path: &str) -> Result<Value> {
        let node = self.node_at(path)?;
        if node.is_missing() {
            return Err(Error::missing_mandatory(node.full_key()));
        }
        node.resolved_value()
    }

    /// Get a resolved string value, with type coercion if needed
    pub fn get_string(&self, path: &str) -> Result<String> {
        let value = self.get(path)?;
        match value {
            Value::String(s) => Ok(s),
            Value::Integer(_) | Value::Float(_) | Value::Bool(_) | Value::Null => {
                Ok(value.to_string())
            }
            _ => Err(Error::type_coercion(path, "string", value.type_name())),
        }
    }

    /// Get a resolved integer value, with type coercion if needed
    pub fn get_i64(&self, path: &str) -> Result<i64> {
        let value = self.get(path)?;
        match value {
            Value::Integer(i) => Ok(i),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::type_coercion(path, "integer", format!("string (\"{}\")", s))),
            _ => Err(Error::type_coercion(path, "integer", value.type_name())),
        }
    }

    /// Get a resolved float value, with type coercion if needed
    pub fn get_f64(&self, path: &str) -> Result<f64> {
        let value = self.get(path)?;
        match value {
            Value::Float(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::type_coercion(path, "float", format!("string (\"{}\")", s))),
            _ => Err(Error::type_coercion(path, "float", value.type_name())),
        }
    }

    /// Get a resolved boolean value; strings must be "true" or "false"
    pub fn get_bool(&self, path: &str) -> Result<bool> {
        let value = self.get(path)?;
        match value {
            Value::Bool(b) => Ok(b),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(Error::type_coercion(
                    path,
                    "boolean",
                    format!("string (\"{}\")", s),
                )),
            },
            _ => Err(Error::type_coercion(path, "boolean", value.type_name())),
        }
    }

    /// Set the value at `path`, creating intermediate dicts as needed.
    ///
    /// Existing nodes keep their declared type and validate the new value.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let segments = split_key(path);
        let Some((last, intermediate)) = segments.split_last() else {
            return self.root.set_value(value);
        };

        let mut current = self.root.clone();
        for segment in intermediate {
            current = match current.child(segment) {
                Some(child) if child.is_container() => child,
                Some(child) => {
                    return Err(Error::type_mismatch(
                        path,
                        format!("'{}' is not a container", child.full_key()),
                    ))
                }
                None if current.kind() == NodeKind::Dict => {
                    let child = Node::dict();
                    current.insert(segment.clone(), child.clone())?;
                    child
                }
                None => return Err(Error::key_not_found(path).with_path(path)),
            };
        }

        match current.child(last) {
            Some(existing) => existing.set_value(value),
            None if current.kind() == NodeKind::Dict => {
                current.insert(last.clone(), Node::from_value(value))
            }
            None => Err(Error::key_not_found(path).with_path(path)),
        }
    }

    /// Whether the value at `path` is `???`. Interpolations are not resolved.
    pub fn is_missing(&self, path: &str) -> Result<bool> {
        self.raw_node(path).map(|n| n.is_missing())
    }

    /// Whether the value at `path` is an interpolation
    pub fn is_interpolation(&self, path: &str) -> Result<bool> {
        self.raw_node(path).map(|n| n.is_interpolation())
    }

    /// Resolve every value, failing on the first error
    pub fn resolve_all(&self) -> Result<()> {
        self.root.resolved_value().map(|_| ())
    }

    /// Export the configuration as a Value
    ///
    /// With `resolve` set, interpolations are replaced by their values;
    /// otherwise they are left as written.
    pub fn to_value(&self, resolve: bool) -> Result<Value> {
        if resolve {
            self.root.resolved_value()
        } else {
            Ok(self.root.to_value())
        }
    }

    /// Export the configuration as YAML
    pub fn to_yaml(&self, resolve: bool) -> Result<String> {
        let value = self.to_value(resolve)?;
        serde_yaml::to_string(&value).map_err(|e| Error::parse(e.to_string()))
    }

    /// Export the configuration as JSON
    pub fn to_json(&self, resolve: bool) -> Result<String> {
        let value = self.to_value(resolve)?;
        serde_json::to_string_pretty(&value).map_err(|e| Error::parse(e.to_string()))
    }

    /// Make the whole config read-only, or writable again
    pub fn set_readonly(&self, readonly: bool) {
        self.root.set_flag("readonly", Some(readonly));
    }

    /// Reject keys that do not exist yet
    pub fn set_struct(&self, strict: bool) {
        self.root.set_flag("struct", Some(strict));
    }

    /// Clear the resolver cache
    pub fn clear_cache(&self) {
        self.root.clear_resolver_cache();
    }

    /// Snapshot of the resolver cache
    pub fn get_cache(&self) -> ResolverCache {
        self.root.resolver_cache()
    }

    /// Replace the resolver cache
    pub fn set_cache(&self, cache: ResolverCache) {
        self.root.set_resolver_cache(cache);
    }

    /// Copy the resolver cache of another config into this one
    pub fn copy_cache_from(&self, other: &Config) {
        self.root.copy_resolver_cache_from(&other.root);
    }
}

impl Clone for Config {
    /// Deep copy, resolver cache included
    fn clone(&self) -> Self {
        Self {
            root: self.root.deep_copy(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").field("root", &self.root).finish()
    }
}
