//! Interpolation resolution
//!
//! Turns a node holding an interpolation string into the node it stands
//! for. Keys are walked through the tree, intermediate interpolations are
//! dereferenced along the way, resolver calls go through the global
//! registry, and the result is validated against the declared type of
//! the node being resolved.
//!
//! Recursion is tracked with a [`Memo`] of the nodes currently being
//! resolved, so `a: ${b}` / `b: ${a}` fails instead of looping.
//!
//! Each hop of a reference chain (`a0: ${a1}`, `a1: ${a2}`, ...) nests a
//! few calls, and there is no depth limit other than the thread stack.
//! Chains of a hundred or so hops fit the 2 MiB default of spawned
//! threads; longer chains need a thread with a larger stack.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ConversionError, Error, ErrorKind, Result};
use crate::grammar::{self, ParseTree, Rule};
use crate::node::{DeclaredType, Node, NodeKind};
use crate::resolver::{self, ResolvedValue};
use crate::value::{split_key, Value};
use crate::visitor::GrammarVisitor;

/// How a raw value relates to interpolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A plain value
    Value,
    /// The `???` marker
    MandatoryMissing,
    /// Exactly one node reference, e.g. `${a.b}`
    NodeInterpolation,
    /// Anything else containing `${`, e.g. `x_${a}` or `${env:HOME}`
    StringInterpolation,
}

fn node_interpolation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\$\{\s*(?:\.*(?:[\w\-]+|\[[\w\-]+\])(?:\.[\w\-]+|\[[\w\-]+\])*|\.+)\s*\}$",
        )
        .expect("valid node interpolation pattern")
    })
}

/// Classify a raw value
pub fn value_kind(value: &Value) -> ValueKind {
    match value {
        Value::String(_) if value.is_missing() => ValueKind::MandatoryMissing,
        Value::String(s) if s.contains("${") => {
            if node_interpolation_pattern().is_match(s) {
                ValueKind::NodeInterpolation
            } else {
                ValueKind::StringInterpolation
            }
        }
        _ => ValueKind::Value,
    }
}

/// Nodes whose interpolation is currently being resolved
#[derive(Debug, Clone, Default)]
pub struct Memo {
    in_flight: HashSet<usize>,
}

impl Memo {
    /// Mark `node` as in flight until the guard is dropped.
    ///
    /// Fails if it already is, which means the resolution loops.
    pub fn enter(&mut self, node: &Node) -> Result<MemoGuard<'_>> {
        let id = node.id();
        if !self.in_flight.insert(id) {
            return Err(Error::cyclic(format!(
                "Recursive interpolation detected at '{}'",
                node.full_key()
            )));
        }
        Ok(MemoGuard { memo: self, id })
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.in_flight.contains(&node.id())
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Removes its node from the memo when dropped
pub struct MemoGuard<'a> {
    memo: &'a mut Memo,
    id: usize,
}

impl Deref for MemoGuard<'_> {
    type Target = Memo;

    fn deref(&self) -> &Memo {
        self.memo
    }
}

impl DerefMut for MemoGuard<'_> {
    fn deref_mut(&mut self) -> &mut Memo {
        self.memo
    }
}

impl Drop for MemoGuard<'_> {
    fn drop(&mut self) {
        self.memo.in_flight.remove(&self.id);
    }
}

/// Options for [`select_node`]
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Returned by value selection when the key is absent or missing
    pub default: Option<Value>,
    pub throw_on_resolution_failure: bool,
    pub throw_on_missing: bool,
    /// Resolve keys without a leading dot from the config root instead of
    /// from the node selected on
    pub absolute_key: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            default: None,
            throw_on_resolution_failure: true,
            throw_on_missing: false,
            absolute_key: false,
        }
    }
}

impl SelectOptions {
    pub fn default_value(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn throw_on_resolution_failure(mut self, throw: bool) -> Self {
        self.throw_on_resolution_failure = throw;
        self
    }

    pub fn throw_on_missing(mut self, throw: bool) -> Self {
        self.throw_on_missing = throw;
        self
    }

    pub fn absolute_key(mut self, absolute: bool) -> Self {
        self.absolute_key = absolute;
        self
    }
}

/// Split a possibly relative key into the node it starts from and the rest.
///
/// Keys without a leading dot start at the root. Otherwise the first dot
/// means `parent` itself and every further dot climbs one level.
pub fn resolve_key_and_root(parent: &Node, key: &str) -> Result<(Node, String)> {
    let Some(mut rest) = key.strip_prefix('.') else {
        return Ok((parent.root(), key.to_string()));
    };
    let mut root = parent.clone();
    while let Some(stripped) = rest.strip_prefix('.') {
        root = root.parent().ok_or_else(|| {
            Error::key_not_found(key).with_help(format!(
                "'{}' climbs above the top of the configuration",
                key
            ))
        })?;
        rest = stripped;
    }
    Ok((root, rest.to_string()))
}

/// One step of a key walk
fn select_one(container: &Node, key: &str, throw_on_missing: bool) -> Result<Option<Node>> {
    if container.is_missing() {
        return if throw_on_missing {
            Err(Error::missing_mandatory(container.full_key()))
        } else {
            Ok(None)
        };
    }
    // List indices that do not parse (including negative ones) are absent
    let child = container.child(key);
    match child {
        Some(child) if throw_on_missing && child.is_missing() => {
            Err(Error::missing_mandatory(child.full_key()))
        }
        other => Ok(other),
    }
}

/// The node an intermediate key segment stands for
fn maybe_dereference(node: &Node, throw_on_resolution_failure: bool, memo: &mut Memo) -> Result<Option<Node>> {
    if !node.is_interpolation() {
        return Ok(Some(node.clone()));
    }
    let parent = node.parent().unwrap_or_else(|| node.clone());
    maybe_resolve_interpolation(&parent, node, throw_on_resolution_failure, memo)
}

/// Walk `key` from `root`, resolving the target if it is an interpolation
fn select_impl(
    root: &Node,
    key: &str,
    throw_on_missing: bool,
    throw_on_resolution_failure: bool,
    memo: &mut Memo,
) -> Result<Option<Node>> {
    if key.is_empty() {
        return Ok(Some(root.clone()));
    }
    let segments = split_key(key);
    let Some((last, intermediate)) = segments.split_last() else {
        return Ok(Some(root.clone()));
    };

    let mut current = root.clone();
    for (i, segment) in intermediate.iter().enumerate() {
        let next = match select_one(&current, segment, throw_on_missing)? {
            Some(node) => maybe_dereference(&node, throw_on_resolution_failure, memo)?,
            None => None,
        };
        let Some(next) = next else {
            return Ok(None);
        };
        if !next.is_container() {
            let prefix = segments[..=i].join(".");
            return Err(Error::type_mismatch(
                key,
                format!(
                    "node '{}' is not a container and thus cannot contain '{}'",
                    prefix,
                    segments[i + 1]
                ),
            ));
        }
        current = next;
    }

    match select_one(&current, last, throw_on_missing)? {
        Some(value) => {
            maybe_resolve_interpolation(&current, &value, throw_on_resolution_failure, memo)
        }
        None => Ok(None),
    }
}

/// Resolve the node referenced by a node interpolation key, e.g. `..a.b`
pub(crate) fn resolve_node_interpolation(parent: &Node, key: &str, memo: &mut Memo) -> Result<Node> {
    let selected = resolve_key_and_root(parent, key)
        .and_then(|(root, rest)| select_impl(&root, &rest, true, true, memo))
        .map_err(|e| match e.kind.clone() {
            ErrorKind::MissingMandatoryValue => Error::interpolation_to_missing(key),
            ErrorKind::KeyNotFound { .. } => Error::interpolation_key(key),
            ErrorKind::TypeMismatch { .. } => {
                let mut err = Error::interpolation_type(key, "");
                err.cause = e.cause.clone();
                err
            }
            _ => e.into_resolution(),
        })?;

    let target = selected.ok_or_else(|| Error::interpolation_key(key))?;
    validate_not_dereferencing_to_parent(parent, &target)?;
    Ok(target)
}

/// An interpolation may not point at its own container or one of its
/// ancestors
fn validate_not_dereferencing_to_parent(parent: &Node, target: &Node) -> Result<()> {
    let mut current = Some(parent.clone());
    while let Some(node) = current {
        if node.ptr_eq(target) {
            return Err(Error::cyclic("Interpolation to parent node detected"));
        }
        current = node.parent();
    }
    Ok(())
}

/// Resolve `node` if it holds an interpolation, otherwise return it.
///
/// With `throw_on_resolution_failure` unset, resolution and validation
/// failures give `None`; malformed interpolation syntax is always an
/// error.
pub(crate) fn maybe_resolve_interpolation(
    parent: &Node,
    node: &Node,
    throw_on_resolution_failure: bool,
    memo: &mut Memo,
) -> Result<Option<Node>> {
    let Some(Value::String(text)) = node.raw_value() else {
        return Ok(Some(node.clone()));
    };
    let rule = match value_kind(&Value::String(text.clone())) {
        ValueKind::Value | ValueKind::MandatoryMissing => return Ok(Some(node.clone())),
        ValueKind::NodeInterpolation => Rule::SingleElement,
        ValueKind::StringInterpolation => Rule::ConfigValue,
    };
    let tree = grammar::parse(&text, rule).map_err(|e| e.or_path(node.full_key()))?;

    let resolved = match resolve_guarded(parent, node, &tree, memo) {
        Ok(resolved) => resolved,
        Err(e) if !throw_on_resolution_failure && e.is_resolution_failure() => {
            log::debug!("Could not resolve '{}': {}", node.full_key(), e.message());
            return Ok(None);
        }
        Err(e) => return Err(e.or_path(node.full_key())),
    };

    match validate_and_convert(parent, node, resolved) {
        Ok(result) => Ok(Some(result)),
        Err(_) if !throw_on_resolution_failure => Ok(None),
        Err(e) => Err(e),
    }
}

fn resolve_guarded(parent: &Node, node: &Node, tree: &ParseTree, memo: &mut Memo) -> Result<ResolvedValue> {
    let mut guard = memo.enter(node)?;
    resolve_parse_tree(parent, node, tree, &mut guard)
}

/// Evaluate a parse tree on behalf of `node`, whose container is `parent`
pub(crate) fn resolve_parse_tree(
    parent: &Node,
    node: &Node,
    tree: &ParseTree,
    memo: &mut Memo,
) -> Result<ResolvedValue> {
    let mut visitor = GrammarVisitor::new(
        |key: &str, memo: &mut Memo| resolve_node_interpolation(parent, key, memo),
        |name: &str, args: Vec<ResolvedValue>, args_str: Vec<String>, memo: &Memo| {
            resolver::invoke(name, args, args_str, node, parent, memo)
        },
        memo,
    );
    visitor.visit(tree)
}

fn validation_error(node: &Node, cause: ConversionError) -> Error {
    Error::interpolation_validation(cause.to_string()).with_path(node.full_key())
}

/// Check a resolution result against the declared type of `node` and turn
/// it into a node
#[inline(never)]
fn validate_and_convert(parent: &Node, node: &Node, resolved: ResolvedValue) -> Result<Node> {
    let declared = node.declared_type();
    let optional = node.is_optional();

    let wrapped = match node.kind() {
        NodeKind::Leaf | NodeKind::Union => {
            if declared == DeclaredType::Any {
                match resolved {
                    ResolvedValue::Node(n) => return Ok(n),
                    ResolvedValue::Value(v) => Node::from_value(v),
                }
            } else {
                let res_value = resolved.to_value();
                if res_value.is_null() {
                    if !optional {
                        return Err(validation_error(node, ConversionError::NotOptional));
                    }
                    Node::leaf(Value::Null, declared, true)?
                } else {
                    let converted = declared
                        .convert(&res_value)
                        .map_err(|e| validation_error(node, e))?;
                    // Unchanged by conversion: keep the target node itself
                    if let ResolvedValue::Node(n) = &resolved {
                        if converted == res_value {
                            return Ok(n.clone());
                        }
                    }
                    Node::leaf(converted, declared, optional)?
                }
            }
        }
        kind @ (NodeKind::Dict | NodeKind::List) => match resolved {
            ResolvedValue::Node(n) if n.kind() == kind => return Ok(n),
            resolved => {
                let res_value = resolved.to_value();
                match (kind, res_value) {
                    (NodeKind::Dict, v @ Value::Mapping(_)) | (NodeKind::List, v @ Value::Sequence(_)) => {
                        Node::from_value(v)
                    }
                    (_, Value::Null) if optional => {
                        let empty = if kind == NodeKind::Dict {
                            Node::dict()
                        } else {
                            Node::list()
                        };
                        empty.set_value(Value::Null)?;
                        empty
                    }
                    (_, Value::Null) => {
                        return Err(validation_error(node, ConversionError::NotOptional))
                    }
                    (_, other) => {
                        return Err(validation_error(
                            node,
                            ConversionError::Incompatible {
                                value: other.to_string(),
                                got: other.type_name(),
                                expected: declared.name(),
                            },
                        ))
                    }
                }
            }
        },
    };

    wrapped.link_to(parent, node.key());
    Ok(wrapped)
}

/// Select the node at `key` relative to `cfg`.
///
/// Absent keys give `None`. See [`SelectOptions::absolute_key`] for how
/// keys without a leading dot are read.
pub fn select_node(cfg: &Node, key: &str, options: &SelectOptions) -> Result<Option<Node>> {
    select_node_with_memo(cfg, key, options, &mut Memo::default())
}

pub(crate) fn select_node_with_memo(
    cfg: &Node,
    key: &str,
    options: &SelectOptions,
    memo: &mut Memo,
) -> Result<Option<Node>> {
    let key = if !options.absolute_key && !key.starts_with('.') {
        format!(".{}", key)
    } else {
        key.to_string()
    };

    let selected = resolve_key_and_root(cfg, &key).and_then(|(root, rest)| {
        select_impl(
            &root,
            &rest,
            options.throw_on_missing,
            options.throw_on_resolution_failure,
            memo,
        )
    });
    match selected {
        Err(e) if matches!(e.kind, ErrorKind::KeyNotFound { .. }) => Ok(None),
        other => other,
    }
}

impl Node {
    /// How this node's own value would be treated on access. Populated
    /// containers are plain values.
    pub fn value_kind(&self) -> ValueKind {
        self.raw_value()
            .map(|value| value_kind(&value))
            .unwrap_or(ValueKind::Value)
    }

    /// The node this one stands for: the resolved target of an
    /// interpolation, or the node itself
    pub fn resolve(&self) -> Result<Node> {
        let parent = self.parent().unwrap_or_else(|| self.clone());
        maybe_resolve_interpolation(&parent, self, true, &mut Memo::default())?
            .ok_or_else(|| Error::internal("resolution failed without an error"))
    }

    /// Like [`Node::resolve`], but resolution failures give `None`
    pub fn resolve_best_effort(&self) -> Result<Option<Node>> {
        let parent = self.parent().unwrap_or_else(|| self.clone());
        maybe_resolve_interpolation(&parent, self, false, &mut Memo::default())
    }

    /// The whole subtree as a plain value with every interpolation
    /// resolved. Missing values stay `???`.
    pub fn resolved_value(&self) -> Result<Value> {
        resolved_value_with(self, &mut Memo::default())
    }
}

fn resolved_value_with(node: &Node, memo: &mut Memo) -> Result<Value> {
    let parent = node.parent().unwrap_or_else(|| node.clone());
    let node = maybe_resolve_interpolation(&parent, node, true, memo)?
        .ok_or_else(|| Error::internal("resolution failed without an error"))?;
    if !node.is_container() || node.raw_value().is_some() {
        return Ok(node.to_value());
    }

    // A container reached again while descending into it loops forever
    let mut guard = memo.enter(&node)?;
    match node.kind() {
        NodeKind::Dict => {
            let mut map = indexmap::IndexMap::new();
            for (key, child) in node.keys().into_iter().zip(node.children()) {
                map.insert(key, resolved_value_with(&child, &mut guard)?);
            }
            Ok(Value::Mapping(map))
        }
        _ => {
            let mut items = Vec::new();
            for child in node.children() {
                items.push(resolved_value_with(&child, &mut guard)?);
            }
            Ok(Value::Sequence(items))
        }
    }
}
