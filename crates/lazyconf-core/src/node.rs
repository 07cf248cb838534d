//! The config tree
//!
//! A [`Node`] is a cheap, shared handle to one element of the tree. Leaves
//! hold a [`Value`] (which may be an unresolved interpolation string);
//! dict and list containers hold their children, or a raw sentinel (null,
//! `???` or an interpolation) standing in for them; union nodes hold a
//! typed leaf chosen among several candidate types.
//!
//! Ownership is strictly tree-shaped: a node has at most one parent, and
//! adopting a node that already has one is an error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::error::{ConversionError, Error, Result};
use crate::resolver::ResolvedValue;
use crate::value::Value;

/// Per-container resolver results: resolver name -> args key -> value
pub type ResolverCache = HashMap<String, HashMap<String, ResolvedValue>>;

/// Key of a node within its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Name(String),
    Index(usize),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => write!(f, "{}", name),
            Key::Index(index) => write!(f, "{}", index),
        }
    }
}

/// An enumeration type for enum leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub variants: Vec<String>,
}

impl EnumType {
    pub fn new(name: impl Into<String>, variants: &[&str]) -> Self {
        Self {
            name: name.into(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Declared type of a node
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DeclaredType {
    /// Any scalar, no conversion
    #[default]
    Any,
    String,
    Integer,
    Float,
    Boolean,
    Enum(EnumType),
    Dict,
    List,
    /// One of several leaf types, tried in order
    Union(Vec<DeclaredType>),
}

impl DeclaredType {
    /// Human readable name of the type
    pub fn name(&self) -> String {
        match self {
            DeclaredType::Any => "Any".into(),
            DeclaredType::String => "str".into(),
            DeclaredType::Integer => "int".into(),
            DeclaredType::Float => "float".into(),
            DeclaredType::Boolean => "bool".into(),
            DeclaredType::Enum(e) => e.name.clone(),
            DeclaredType::Dict => "Dict".into(),
            DeclaredType::List => "List".into(),
            DeclaredType::Union(candidates) => {
                let names: Vec<String> = candidates.iter().map(|c| c.name()).collect();
                format!("Union[{}]", names.join(", "))
            }
        }
    }

    /// Convert a non-null value to this type.
    ///
    /// The result may be of a different variant than the input (e.g. the
    /// string `"10"` converted to an integer).
    pub fn convert(&self, value: &Value) -> std::result::Result<Value, ConversionError> {
        let incompatible = || ConversionError::Incompatible {
            value: value.to_string(),
            got: value.type_name(),
            expected: self.name(),
        };

        match (self, value) {
            (DeclaredType::Dict, Value::Mapping(_)) | (DeclaredType::List, Value::Sequence(_)) => {
                Ok(value.clone())
            }
            (_, Value::Mapping(_) | Value::Sequence(_)) => Err(incompatible()),
            (DeclaredType::Dict | DeclaredType::List, _) => Err(incompatible()),

            (DeclaredType::Any, _) => Ok(value.clone()),

            (DeclaredType::String, Value::Null) => Err(incompatible()),
            (DeclaredType::String, Value::String(_)) => Ok(value.clone()),
            (DeclaredType::String, _) => Ok(Value::String(value.to_string())),

            (DeclaredType::Integer, Value::Integer(_)) => Ok(value.clone()),
            (DeclaredType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| incompatible()),
            (DeclaredType::Integer, _) => Err(incompatible()),

            (DeclaredType::Float, Value::Float(_)) => Ok(value.clone()),
            (DeclaredType::Float, Value::Integer(i)) => Ok(Value::Float(*i as f64)),
            (DeclaredType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| incompatible()),
            (DeclaredType::Float, _) => Err(incompatible()),

            (DeclaredType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (DeclaredType::Boolean, Value::Integer(i)) => Ok(Value::Bool(*i != 0)),
            (DeclaredType::Boolean, Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Ok(Value::Bool(i != 0));
                }
                match s.trim().to_lowercase().as_str() {
                    "y" | "yes" | "on" | "true" => Ok(Value::Bool(true)),
                    "n" | "no" | "off" | "false" => Ok(Value::Bool(false)),
                    _ => Err(incompatible()),
                }
            }
            (DeclaredType::Boolean, _) => Err(incompatible()),

            (DeclaredType::Enum(e), Value::String(s)) => {
                let name = s
                    .strip_prefix(&format!("{}.", e.name))
                    .unwrap_or(s.as_str());
                if e.variants.iter().any(|v| v == name) {
                    Ok(Value::String(name.to_string()))
                } else {
                    Err(ConversionError::UnknownVariant {
                        value: s.clone(),
                        variants: e.variants.join(", "),
                    })
                }
            }
            (DeclaredType::Enum(_), _) => Err(incompatible()),

            (DeclaredType::Union(candidates), _) => pick_candidate(candidates, value)
                .map(|(_, converted)| converted)
                .ok_or_else(incompatible),
        }
    }

    /// Whether `value` already has this type, without any coercion
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (DeclaredType::Any, _) => true,
            (DeclaredType::String, Value::String(_))
            | (DeclaredType::Integer, Value::Integer(_))
            | (DeclaredType::Float, Value::Float(_))
            | (DeclaredType::Boolean, Value::Bool(_))
            | (DeclaredType::Dict, Value::Mapping(_))
            | (DeclaredType::List, Value::Sequence(_)) => true,
            (DeclaredType::Enum(_), Value::String(_)) => self.convert(value).is_ok(),
            (DeclaredType::Union(candidates), _) => candidates.iter().any(|c| c.matches(value)),
            _ => false,
        }
    }
}

/// Choose the union candidate for `value`: the first exact match in declared
/// order, else the first candidate that can convert it.
fn pick_candidate(candidates: &[DeclaredType], value: &Value) -> Option<(DeclaredType, Value)> {
    candidates
        .iter()
        .find(|c| c.matches(value))
        .and_then(|c| c.convert(value).ok().map(|v| (c.clone(), v)))
        .or_else(|| {
            candidates
                .iter()
                .find_map(|c| c.convert(value).ok().map(|v| (c.clone(), v)))
        })
}

/// Metadata attached to every node
#[derive(Debug, Clone)]
pub struct Metadata {
    pub declared: DeclaredType,
    pub optional: bool,
    pub key: Option<Key>,
    /// Flags set on this node; unset flags inherit from the parent
    pub flags: HashMap<String, bool>,
    /// Stop flag inheritance at this node
    pub flags_root: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            declared: DeclaredType::Any,
            optional: true,
            key: None,
            flags: HashMap::new(),
            flags_root: false,
        }
    }
}

/// Kind of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Dict,
    List,
    Union,
}

/// Content of a container: its children, or a raw sentinel value
#[derive(Debug, Clone)]
enum Holding<T> {
    Children(T),
    Raw(Value),
}

#[derive(Debug, Clone)]
enum Content {
    Leaf(Value),
    Dict(Holding<IndexMap<String, Node>>),
    List(Holding<Vec<Node>>),
    Union(Holding<Node>),
}

struct NodeInner {
    parent: RefCell<Weak<NodeInner>>,
    metadata: RefCell<Metadata>,
    content: RefCell<Content>,
    flags_cache: RefCell<HashMap<String, Option<bool>>>,
    resolver_cache: RefCell<ResolverCache>,
}

/// Shared handle to a node of the config tree
#[derive(Clone)]
pub struct Node(Rc<NodeInner>);

/// Whether a raw value is an interpolation string
pub(crate) fn is_interpolation(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.contains("${"))
}

/// Whether a raw value bypasses type validation (missing or interpolation)
fn is_special(value: &Value) -> bool {
    value.is_missing() || is_interpolation(value)
}

fn validate_leaf(declared: &DeclaredType, optional: bool, value: Value, path: &str) -> Result<Value> {
    if is_special(&value) {
        return Ok(value);
    }
    if value.is_null() {
        return if optional {
            Ok(value)
        } else {
            Err(ConversionError::NotOptional.into_validation(path))
        };
    }
    declared
        .convert(&value)
        .map_err(|e| e.into_validation(path))
}

impl Node {
    fn with_content(content: Content, metadata: Metadata) -> Self {
        Node(Rc::new(NodeInner {
            parent: RefCell::new(Weak::new()),
            metadata: RefCell::new(metadata),
            content: RefCell::new(content),
            flags_cache: RefCell::new(HashMap::new()),
            resolver_cache: RefCell::new(HashMap::new()),
        }))
    }

    /// Build a tree from a plain value.
    ///
    /// Mappings become dicts, sequences become lists and scalars become
    /// `Any` leaves.
    pub fn from_value(value: Value) -> Node {
        match value {
            Value::Mapping(map) => {
                let node = Node::dict();
                let children: IndexMap<String, Node> = map
                    .into_iter()
                    .map(|(key, child)| (key, Node::from_value(child)))
                    .collect();
                for (key, child) in &children {
                    child.set_link(&node, Some(Key::Name(key.clone())));
                }
                *node.0.content.borrow_mut() = Content::Dict(Holding::Children(children));
                node
            }
            Value::Sequence(items) => {
                let node = Node::list();
                let children: Vec<Node> = items.into_iter().map(Node::from_value).collect();
                for (index, child) in children.iter().enumerate() {
                    child.set_link(&node, Some(Key::Index(index)));
                }
                *node.0.content.borrow_mut() = Content::List(Holding::Children(children));
                node
            }
            scalar => Node::with_content(Content::Leaf(scalar), Metadata::default()),
        }
    }

    /// Create a typed leaf, validating `value` against `declared`
    pub fn leaf(value: Value, declared: DeclaredType, optional: bool) -> Result<Node> {
        if matches!(declared, DeclaredType::Dict | DeclaredType::List) {
            return Err(Error::validation(
                "",
                format!("{} is a container type, not a leaf type", declared.name()),
            ));
        }
        if let DeclaredType::Union(candidates) = declared {
            return Node::union(candidates, value, optional);
        }
        let value = validate_leaf(&declared, optional, value, "")?;
        Ok(Node::with_content(
            Content::Leaf(value),
            Metadata {
                declared,
                optional,
                ..Metadata::default()
            },
        ))
    }

    /// Create an empty dict container
    pub fn dict() -> Node {
        Node::with_content(
            Content::Dict(Holding::Children(IndexMap::new())),
            Metadata {
                declared: DeclaredType::Dict,
                ..Metadata::default()
            },
        )
    }

    /// Create an empty list container
    pub fn list() -> Node {
        Node::with_content(
            Content::List(Holding::Children(Vec::new())),
            Metadata {
                declared: DeclaredType::List,
                ..Metadata::default()
            },
        )
    }

    /// Create a union node over `candidates`
    pub fn union(candidates: Vec<DeclaredType>, value: Value, optional: bool) -> Result<Node> {
        let node = Node::with_content(
            Content::Union(Holding::Raw(Value::Null)),
            Metadata {
                declared: DeclaredType::Union(candidates),
                optional,
                ..Metadata::default()
            },
        );
        node.set_union_value(value)?;
        Ok(node)
    }

    // ---- identity ----

    /// Identity of the node, stable for its lifetime
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Whether both handles point to the same node
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ---- navigation ----

    pub fn kind(&self) -> NodeKind {
        match &*self.0.content.borrow() {
            Content::Leaf(_) => NodeKind::Leaf,
            Content::Dict(_) => NodeKind::Dict,
            Content::List(_) => NodeKind::List,
            Content::Union(_) => NodeKind::Union,
        }
    }

    /// Whether this node can own children
    pub fn is_container(&self) -> bool {
        matches!(self.kind(), NodeKind::Dict | NodeKind::List)
    }

    pub fn parent(&self) -> Option<Node> {
        self.0.parent.borrow().upgrade().map(Node)
    }

    /// The top of the tree this node belongs to
    pub fn root(&self) -> Node {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn key(&self) -> Option<Key> {
        self.0.metadata.borrow().key.clone()
    }

    /// Dotted path from the root, e.g. `a.b[0].c`
    pub fn full_key(&self) -> String {
        let mut keys = Vec::new();
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if let Some(key) = node.key() {
                keys.push(key);
            }
            current = node.parent();
        }

        let mut out = String::new();
        for key in keys.iter().rev() {
            match key {
                Key::Name(name) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                Key::Index(index) => out.push_str(&format!("[{}]", index)),
            }
        }
        out
    }

    /// Direct child by key (list indices as strings)
    pub fn child(&self, key: &str) -> Option<Node> {
        match &*self.0.content.borrow() {
            Content::Dict(Holding::Children(children)) => children.get(key).cloned(),
            Content::List(Holding::Children(children)) => key
                .parse::<usize>()
                .ok()
                .and_then(|index| children.get(index).cloned()),
            _ => None,
        }
    }

    /// Children in order; empty for leaves and sentinel containers
    pub fn children(&self) -> Vec<Node> {
        match &*self.0.content.borrow() {
            Content::Dict(Holding::Children(children)) => children.values().cloned().collect(),
            Content::List(Holding::Children(children)) => children.clone(),
            _ => Vec::new(),
        }
    }

    /// Keys of a dict, or indices of a list
    pub fn keys(&self) -> Vec<String> {
        match &*self.0.content.borrow() {
            Content::Dict(Holding::Children(children)) => children.keys().cloned().collect(),
            Content::List(Holding::Children(children)) => {
                (0..children.len()).map(|i| i.to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &*self.0.content.borrow() {
            Content::Dict(Holding::Children(children)) => children.len(),
            Content::List(Holding::Children(children)) => children.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- metadata ----

    pub fn metadata(&self) -> Metadata {
        self.0.metadata.borrow().clone()
    }

    pub fn declared_type(&self) -> DeclaredType {
        self.0.metadata.borrow().declared.clone()
    }

    pub fn is_optional(&self) -> bool {
        self.0.metadata.borrow().optional
    }

    /// Set whether null is an acceptable value
    pub fn set_optional(&self, optional: bool) {
        self.0.metadata.borrow_mut().optional = optional;
    }

    // ---- inspection ----

    /// The scalar of a leaf or the sentinel of a container.
    ///
    /// Populated containers have no raw value and return `None`; a union
    /// returns its current leaf's value.
    pub fn raw_value(&self) -> Option<Value> {
        let union_child = match &*self.0.content.borrow() {
            Content::Leaf(value) => return Some(value.clone()),
            Content::Dict(Holding::Raw(value))
            | Content::List(Holding::Raw(value))
            | Content::Union(Holding::Raw(value)) => return Some(value.clone()),
            Content::Dict(_) | Content::List(_) => return None,
            Content::Union(Holding::Children(child)) => child.clone(),
        };
        union_child.raw_value()
    }

    /// The whole subtree as a plain value, interpolations left unresolved
    pub fn to_value(&self) -> Value {
        match &*self.0.content.borrow() {
            Content::Leaf(value) => value.clone(),
            Content::Dict(Holding::Raw(value))
            | Content::List(Holding::Raw(value))
            | Content::Union(Holding::Raw(value)) => value.clone(),
            Content::Dict(Holding::Children(children)) => Value::Mapping(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
            Content::List(Holding::Children(children)) => {
                Value::Sequence(children.iter().map(Node::to_value).collect())
            }
            Content::Union(Holding::Children(child)) => child.to_value(),
        }
    }

    pub fn is_missing(&self) -> bool {
        self.raw_value().is_some_and(|v| v.is_missing())
    }

    pub fn is_none(&self) -> bool {
        self.raw_value().is_some_and(|v| v.is_null())
    }

    pub fn is_interpolation(&self) -> bool {
        self.raw_value().is_some_and(|v| is_interpolation(&v))
    }

    // ---- mutation ----

    fn check_writable(&self) -> Result<()> {
        if self.get_flag("readonly") == Some(true) {
            return Err(Error::readonly(self.full_key()));
        }
        Ok(())
    }

    fn set_link(&self, parent: &Node, key: Option<Key>) {
        *self.0.parent.borrow_mut() = Rc::downgrade(&parent.0);
        self.0.metadata.borrow_mut().key = key;
        self.invalidate_flags_cache();
    }

    fn detach(&self) {
        *self.0.parent.borrow_mut() = Weak::new();
        self.0.metadata.borrow_mut().key = None;
        self.invalidate_flags_cache();
    }

    /// Point this node at `parent` without becoming one of its children.
    ///
    /// Used for interpolation results, which live next to the tree.
    pub(crate) fn link_to(&self, parent: &Node, key: Option<Key>) {
        self.set_link(parent, key);
    }

    fn adopt_check(&self, child: &Node) -> Result<()> {
        if child.parent().is_some() {
            return Err(Error::validation(
                self.full_key(),
                format!(
                    "Node '{}' already has a parent; detach it or use a deep copy",
                    child.full_key()
                ),
            ));
        }
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.ptr_eq(child) {
                return Err(Error::validation(
                    self.full_key(),
                    "A node cannot be inserted below itself",
                ));
            }
            current = node.parent();
        }
        Ok(())
    }

    /// Insert `child` under `key`, replacing (and detaching) any previous child
    pub fn insert(&self, key: impl Into<String>, child: Node) -> Result<()> {
        let key = key.into();
        if self.kind() != NodeKind::Dict {
            return Err(Error::type_mismatch(key, self.kind_name()));
        }
        self.check_writable()?;
        self.adopt_check(&child)?;

        let exists = self.child(&key).is_some();
        if !exists && self.get_flag("struct") == Some(true) {
            let full = join_key(&self.full_key(), &key);
            return Err(Error::key_not_found(full)
                .with_help("The config is in struct mode; new keys cannot be added"));
        }

        child.set_link(self, Some(Key::Name(key.clone())));
        let previous = {
            let mut content = self.0.content.borrow_mut();
            if let Content::Dict(holding @ Holding::Raw(_)) = &mut *content {
                *holding = Holding::Children(IndexMap::new());
            }
            match &mut *content {
                Content::Dict(Holding::Children(children)) => children.insert(key, child),
                _ => None,
            }
        };
        if let Some(previous) = previous {
            previous.detach();
        }
        Ok(())
    }

    /// Append `child` to a list
    pub fn push(&self, child: Node) -> Result<()> {
        if self.kind() != NodeKind::List {
            return Err(Error::type_mismatch(self.full_key(), self.kind_name()));
        }
        self.check_writable()?;
        self.adopt_check(&child)?;

        let mut content = self.0.content.borrow_mut();
        if let Content::List(holding @ Holding::Raw(_)) = &mut *content {
            *holding = Holding::Children(Vec::new());
        }
        if let Content::List(Holding::Children(children)) = &mut *content {
            child.set_link(self, Some(Key::Index(children.len())));
            children.push(child);
        }
        Ok(())
    }

    /// Remove and detach a child
    pub fn remove(&self, key: &str) -> Result<Option<Node>> {
        self.check_writable()?;
        let removed = {
            let mut content = self.0.content.borrow_mut();
            match &mut *content {
                Content::Dict(Holding::Children(children)) => children.shift_remove(key),
                Content::List(Holding::Children(children)) => match key.parse::<usize>() {
                    Ok(index) if index < children.len() => {
                        let removed = children.remove(index);
                        for (i, child) in children.iter().enumerate().skip(index) {
                            child.0.metadata.borrow_mut().key = Some(Key::Index(i));
                        }
                        Some(removed)
                    }
                    _ => None,
                },
                _ => None,
            }
        };
        if let Some(node) = &removed {
            node.detach();
        }
        Ok(removed)
    }

    /// Assign a new value, validated against the declared type.
    ///
    /// `???` and interpolation strings are stored as-is. Assigning a
    /// mapping to a dict (or a sequence to a list) replaces its children.
    pub fn set_value(&self, value: Value) -> Result<()> {
        self.check_writable()?;
        let path = self.full_key();
        let optional = self.is_optional();

        match self.kind() {
            NodeKind::Leaf => {
                let declared = self.declared_type();
                let value = validate_leaf(&declared, optional, value, &path)?;
                *self.0.content.borrow_mut() = Content::Leaf(value);
            }
            NodeKind::Dict => {
                let holding = match value {
                    Value::Mapping(map) => {
                        let children: IndexMap<String, Node> = map
                            .into_iter()
                            .map(|(k, v)| {
                                let child = Node::from_value(v);
                                child.set_link(self, Some(Key::Name(k.clone())));
                                (k, child)
                            })
                            .collect();
                        Holding::Children(children)
                    }
                    other => Holding::Raw(self.container_sentinel(other, &path, optional)?),
                };
                let previous = std::mem::replace(
                    &mut *self.0.content.borrow_mut(),
                    Content::Dict(holding),
                );
                detach_all(previous);
            }
            NodeKind::List => {
                let holding = match value {
                    Value::Sequence(items) => {
                        let children: Vec<Node> = items
                            .into_iter()
                            .enumerate()
                            .map(|(i, v)| {
                                let child = Node::from_value(v);
                                child.set_link(self, Some(Key::Index(i)));
                                child
                            })
                            .collect();
                        Holding::Children(children)
                    }
                    other => Holding::Raw(self.container_sentinel(other, &path, optional)?),
                };
                let previous = std::mem::replace(
                    &mut *self.0.content.borrow_mut(),
                    Content::List(holding),
                );
                detach_all(previous);
            }
            NodeKind::Union => self.set_union_value(value)?,
        }
        Ok(())
    }

    fn container_sentinel(&self, value: Value, path: &str, optional: bool) -> Result<Value> {
        if is_special(&value) || (value.is_null() && optional) {
            return Ok(value);
        }
        if value.is_null() {
            return Err(ConversionError::NotOptional.into_validation(path));
        }
        Err(ConversionError::Incompatible {
            value: value.to_string(),
            got: value.type_name(),
            expected: self.declared_type().name(),
        }
        .into_validation(path))
    }

    fn set_union_value(&self, value: Value) -> Result<()> {
        let path = self.full_key();
        let optional = self.is_optional();
        let DeclaredType::Union(candidates) = self.declared_type() else {
            return Err(Error::internal("union node without union type"));
        };

        let holding = if is_special(&value) {
            Holding::Raw(value)
        } else if value.is_null() {
            if !optional {
                return Err(ConversionError::NotOptional.into_validation(&path));
            }
            Holding::Raw(value)
        } else {
            let (declared, converted) = pick_candidate(&candidates, &value)
                .ok_or_else(|| {
                    ConversionError::Incompatible {
                        value: value.to_string(),
                        got: value.type_name(),
                        expected: DeclaredType::Union(candidates.clone()).name(),
                    }
                    .into_validation(&path)
                })?;
            let child = Node::with_content(
                Content::Leaf(converted),
                Metadata {
                    declared,
                    optional: false,
                    ..Metadata::default()
                },
            );
            child.set_link(self, None);
            Holding::Children(child)
        };
        *self.0.content.borrow_mut() = Content::Union(holding);
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self.kind() {
            NodeKind::Leaf => "leaf",
            NodeKind::Dict => "dict",
            NodeKind::List => "list",
            NodeKind::Union => "union",
        }
    }

    // ---- flags ----

    /// Value of a flag, inherited from ancestors up to the flags root
    pub fn get_flag(&self, name: &str) -> Option<bool> {
        if let Some(cached) = self.0.flags_cache.borrow().get(name) {
            return *cached;
        }
        let value = self.get_flag_uncached(name);
        self.0
            .flags_cache
            .borrow_mut()
            .insert(name.to_string(), value);
        value
    }

    fn get_flag_uncached(&self, name: &str) -> Option<bool> {
        let (own, flags_root) = {
            let metadata = self.0.metadata.borrow();
            (metadata.flags.get(name).copied(), metadata.flags_root)
        };
        if own.is_some() {
            return own;
        }
        if flags_root {
            return None;
        }
        self.parent().and_then(|p| p.get_flag(name))
    }

    /// Set (`Some`) or unset (`None`) a flag on this node
    pub fn set_flag(&self, name: &str, value: Option<bool>) {
        {
            let mut metadata = self.0.metadata.borrow_mut();
            match value {
                Some(v) => metadata.flags.insert(name.to_string(), v),
                None => metadata.flags.remove(name),
            };
        }
        self.invalidate_flags_cache();
    }

    /// Stop flag inheritance at this node
    pub fn set_flags_root(&self, flags_root: bool) {
        self.0.metadata.borrow_mut().flags_root = flags_root;
        self.invalidate_flags_cache();
    }

    fn invalidate_flags_cache(&self) {
        self.0.flags_cache.borrow_mut().clear();
        let nested = match &*self.0.content.borrow() {
            Content::Union(Holding::Children(child)) => vec![child.clone()],
            _ => Vec::new(),
        };
        for child in self.children().into_iter().chain(nested) {
            child.invalidate_flags_cache();
        }
    }

    // ---- resolver cache ----

    /// Snapshot of the resolver results cached on this node
    pub fn resolver_cache(&self) -> ResolverCache {
        self.0.resolver_cache.borrow().clone()
    }

    /// Replace the resolver cache
    pub fn set_resolver_cache(&self, cache: ResolverCache) {
        *self.0.resolver_cache.borrow_mut() = cache;
    }

    /// Drop every cached resolver result
    pub fn clear_resolver_cache(&self) {
        self.0.resolver_cache.borrow_mut().clear();
    }

    /// Copy the resolver cache of `other` into this node
    pub fn copy_resolver_cache_from(&self, other: &Node) {
        let cache = other.resolver_cache();
        self.set_resolver_cache(cache);
    }

    pub(crate) fn cached_result(&self, resolver: &str, key: &str) -> Option<ResolvedValue> {
        self.0
            .resolver_cache
            .borrow()
            .get(resolver)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    pub(crate) fn store_result(&self, resolver: &str, key: String, value: ResolvedValue) {
        self.0
            .resolver_cache
            .borrow_mut()
            .entry(resolver.to_string())
            .or_default()
            .insert(key, value);
    }

    // ---- copies ----

    /// Copy the whole subtree, including metadata and resolver cache.
    ///
    /// The copy has no parent.
    pub fn deep_copy(&self) -> Node {
        let content = match &*self.0.content.borrow() {
            Content::Leaf(value) => Content::Leaf(value.clone()),
            Content::Dict(Holding::Raw(value)) => Content::Dict(Holding::Raw(value.clone())),
            Content::List(Holding::Raw(value)) => Content::List(Holding::Raw(value.clone())),
            Content::Union(Holding::Raw(value)) => Content::Union(Holding::Raw(value.clone())),
            Content::Dict(Holding::Children(children)) => Content::Dict(Holding::Children(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            )),
            Content::List(Holding::Children(children)) => Content::List(Holding::Children(
                children.iter().map(Node::deep_copy).collect(),
            )),
            Content::Union(Holding::Children(child)) => {
                Content::Union(Holding::Children(child.deep_copy()))
            }
        };
        let mut metadata = self.metadata();
        metadata.key = None;

        let copy = Node::with_content(content, metadata);
        copy.set_resolver_cache(self.resolver_cache());

        let keyed: Vec<(Option<Key>, Node)> = match &*copy.0.content.borrow() {
            Content::Dict(Holding::Children(children)) => children
                .iter()
                .map(|(k, v)| (Some(Key::Name(k.clone())), v.clone()))
                .collect(),
            Content::List(Holding::Children(children)) => children
                .iter()
                .enumerate()
                .map(|(i, v)| (Some(Key::Index(i)), v.clone()))
                .collect(),
            Content::Union(Holding::Children(child)) => vec![(None, child.clone())],
            _ => Vec::new(),
        };
        for (key, child) in keyed {
            child.set_link(&copy, key);
        }
        copy
    }
}

fn detach_all(content: Content) {
    match content {
        Content::Dict(Holding::Children(children)) => {
            children.values().for_each(Node::detach);
        }
        Content::List(Holding::Children(children)) => children.iter().for_each(Node::detach),
        Content::Union(Holding::Children(child)) => child.detach(),
        _ => {}
    }
}

/// Join a parent full key and a child name
pub(crate) fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.full_key())
            .field("kind", &self.kind())
            .field("value", &self.to_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn sample() -> Node {
        let yaml = r#"
database:
  host: localhost
  port: 5432
servers:
  - name: a
  - name: b
"#;
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        Node::from_value(value)
    }

    #[test]
    fn test_from_value_builds_containers() {
        let root = sample();
        assert_eq!(root.kind(), NodeKind::Dict);
        assert_eq!(root.keys(), vec!["database", "servers"]);

        let servers = root.child("servers").unwrap();
        assert_eq!(servers.kind(), NodeKind::List);
        assert_eq!(servers.len(), 2);

        let port = root.child("database").unwrap().child("port").unwrap();
        assert_eq!(port.kind(), NodeKind::Leaf);
        assert_eq!(port.raw_value(), Some(Value::Integer(5432)));
    }

    #[test]
    fn test_parent_links_and_full_key() {
        let root = sample();
        let name = root
            .child("servers")
            .unwrap()
            .child("1")
            .unwrap()
            .child("name")
            .unwrap();

        assert_eq!(name.full_key(), "servers[1].name");
        assert!(name.root().ptr_eq(&root));
        assert_eq!(name.key(), Some(Key::Name("name".into())));
        assert_eq!(root.full_key(), "");
    }

    #[test]
    fn test_to_value_round_trip() {
        let value: Value = serde_yaml::from_str("a: [1, 2.5, x]\nb: {c: null}").unwrap();
        assert_eq!(Node::from_value(value.clone()).to_value(), value);
    }

    #[test]
    fn test_insert_rejects_node_with_parent() {
        let root = sample();
        let port = root.child("database").unwrap().child("port").unwrap();
        let other = Node::dict();

        let err = other.insert("port", port).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_insert_rejects_ancestor() {
        let root = Node::dict();
        let child = Node::dict();
        root.insert("child", child.clone()).unwrap();

        let detached = root.remove("child").unwrap().unwrap();
        assert!(detached.parent().is_none());

        detached.insert("x", Node::from_value(Value::Integer(1))).unwrap();
        let err = detached.insert("self", detached.clone()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_replacing_child_detaches_previous() {
        let root = Node::dict();
        let first = Node::from_value(Value::Integer(1));
        root.insert("a", first.clone()).unwrap();
        root.insert("a", Node::from_value(Value::Integer(2))).unwrap();

        assert!(first.parent().is_none());
        assert_eq!(root.child("a").unwrap().raw_value(), Some(Value::Integer(2)));
    }

    #[test]
    fn test_list_remove_reindexes() {
        let list = Node::from_value(Value::from(vec![1, 2, 3]));
        list.remove("0").unwrap();

        assert_eq!(list.to_value(), Value::from(vec![2, 3]));
        assert_eq!(list.child("1").unwrap().key(), Some(Key::Index(1)));
    }

    #[test]
    fn test_typed_leaf_conversion() {
        let node = Node::leaf(Value::from("10"), DeclaredType::Integer, false).unwrap();
        assert_eq!(node.raw_value(), Some(Value::Integer(10)));

        let err = Node::leaf(Value::from("Bond"), DeclaredType::Integer, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        // Interpolations and `???` are stored untouched
        let node = Node::leaf(Value::from("${name}"), DeclaredType::Integer, false).unwrap();
        assert!(node.is_interpolation());
        let node = Node::leaf(Value::missing(), DeclaredType::Integer, false).unwrap();
        assert!(node.is_missing());
    }

    #[test]
    fn test_optional_leaf() {
        assert!(Node::leaf(Value::Null, DeclaredType::String, true).is_ok());
        assert!(Node::leaf(Value::Null, DeclaredType::String, false).is_err());
    }

    #[test]
    fn test_convert_rules() {
        assert_eq!(
            DeclaredType::Float.convert(&Value::from("-inf")),
            Ok(Value::Float(f64::NEG_INFINITY))
        );
        assert_eq!(DeclaredType::Float.convert(&Value::Integer(2)), Ok(Value::Float(2.0)));
        assert_eq!(DeclaredType::Boolean.convert(&Value::from("on")), Ok(Value::Bool(true)));
        assert_eq!(DeclaredType::Boolean.convert(&Value::from("0")), Ok(Value::Bool(false)));
        assert_eq!(
            DeclaredType::String.convert(&Value::Integer(7)),
            Ok(Value::from("7"))
        );
        assert!(DeclaredType::Integer.convert(&Value::Float(1.5)).is_err());
        assert!(DeclaredType::String.convert(&Value::from(vec![1])).is_err());
    }

    #[test]
    fn test_enum_conversion() {
        let color = DeclaredType::Enum(EnumType::new("Color", &["RED", "GREEN"]));
        assert_eq!(color.convert(&Value::from("RED")), Ok(Value::from("RED")));
        assert_eq!(color.convert(&Value::from("Color.GREEN")), Ok(Value::from("GREEN")));
        assert!(matches!(
            color.convert(&Value::from("BLUE")),
            Err(ConversionError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn test_union_tries_candidates_in_order() {
        let node = Node::union(
            vec![DeclaredType::Integer, DeclaredType::String],
            Value::from("007"),
            false,
        )
        .unwrap();
        assert_eq!(node.raw_value(), Some(Value::from("007")));

        let coerced = Node::union(
            vec![DeclaredType::Integer, DeclaredType::Boolean],
            Value::from("12"),
            false,
        )
        .unwrap();
        assert_eq!(coerced.raw_value(), Some(Value::Integer(12)));

        node.set_value(Value::from("abc")).unwrap();
        assert_eq!(node.raw_value(), Some(Value::from("abc")));

        let strict = Node::union(
            vec![DeclaredType::Integer, DeclaredType::Boolean],
            Value::Integer(1),
            false,
        )
        .unwrap();
        assert!(strict.set_value(Value::from("abc")).is_err());
    }

    #[test]
    fn test_union_prefers_exact_match() {
        let node = Node::union(
            vec![DeclaredType::Boolean, DeclaredType::Integer],
            Value::Integer(5),
            false,
        )
        .unwrap();
        assert_eq!(node.raw_value(), Some(Value::Integer(5)));

        node.set_value(Value::Bool(false)).unwrap();
        assert_eq!(node.raw_value(), Some(Value::Bool(false)));

        let float_first = Node::union(
            vec![DeclaredType::Float, DeclaredType::Integer],
            Value::Integer(3),
            false,
        )
        .unwrap();
        assert_eq!(float_first.raw_value(), Some(Value::Integer(3)));

        let union = DeclaredType::Union(vec![DeclaredType::Boolean, DeclaredType::Integer]);
        assert_eq!(union.convert(&Value::Integer(5)).unwrap(), Value::Integer(5));
        assert_eq!(union.convert(&Value::from("yes")).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_container_sentinels() {
        let dict = Node::dict();
        dict.set_value(Value::from("${other}")).unwrap();
        assert!(dict.is_interpolation());
        assert_eq!(dict.len(), 0);

        dict.set_value(Value::missing()).unwrap();
        assert!(dict.is_missing());

        dict.set_optional(false);
        assert!(dict.set_value(Value::Null).is_err());
        assert!(dict.set_value(Value::Integer(1)).is_err());
    }

    #[test]
    fn test_flags_inherit_and_invalidate() {
        let root = sample();
        let port = root.child("database").unwrap().child("port").unwrap();

        assert_eq!(port.get_flag("readonly"), None);
        root.set_flag("readonly", Some(true));
        assert_eq!(port.get_flag("readonly"), Some(true));

        let database = root.child("database").unwrap();
        database.set_flags_root(true);
        assert_eq!(port.get_flag("readonly"), None);

        database.set_flags_root(false);
        database.set_flag("readonly", Some(false));
        assert_eq!(port.get_flag("readonly"), Some(false));
    }

    #[test]
    fn test_readonly_blocks_mutation() {
        let root = sample();
        root.set_flag("readonly", Some(true));
        let port = root.child("database").unwrap().child("port").unwrap();

        let err = port.set_value(Value::Integer(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Readonly);
        assert!(root.insert("new", Node::dict()).is_err());
    }

    #[test]
    fn test_struct_mode_rejects_new_keys() {
        let root = sample();
        root.set_flag("struct", Some(true));

        let err = root.insert("new", Node::dict()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::KeyNotFound { .. }));
        assert!(root
            .insert("database", Node::from_value(Value::Null))
            .is_ok());
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let root = sample();
        root.store_result("rand", "()".into(), ResolvedValue::Value(Value::Integer(4)));

        let copy = root.deep_copy();
        let port = copy.child("database").unwrap().child("port").unwrap();
        port.set_value(Value::Integer(1)).unwrap();

        assert!(port.root().ptr_eq(&copy));
        assert_eq!(
            root.child("database").unwrap().child("port").unwrap().raw_value(),
            Some(Value::Integer(5432))
        );
        assert!(copy.cached_result("rand", "()").is_some());

        copy.clear_resolver_cache();
        assert!(copy.cached_result("rand", "()").is_none());
        assert!(root.cached_result("rand", "()").is_some());
    }
}
