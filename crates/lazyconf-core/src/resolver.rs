//! Resolver system for lazyconf
//!
//! Resolvers are named functions called from `${name:arg1,arg2}`
//! interpolations. They live in a process-wide registry and come in two
//! calling conventions:
//! - typed: arguments arrive as evaluated values, and the resolver may ask
//!   for the current node, its parent or the config root through the
//!   reserved parameters `_node_`, `_parent_` and `_root_`
//! - legacy: arguments arrive as their unevaluated source strings and the
//!   result is always cached
//!
//! Built-in resolvers:
//! - `oc.env`: environment variables
//! - `oc.decode`: parse a string as a single value expression
//! - `oc.create`: build a config node from a mapping or sequence
//! - `oc.select`: select a node with a fallback default
//! - `oc.deprecated`: redirect a moved key with a warning
//! - `oc.dict.keys` / `oc.dict.values`: keys and values of a dict node

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use crate::error::{Error, RegistryErrorKind, Result};
use crate::grammar::{self, Rule};
use crate::node::{Node, NodeKind};
use crate::resolution::{self, Memo, SelectOptions};
use crate::value::Value;

/// Parameter names that request injected context
const NODE_PARAM: &str = "_node_";
const PARENT_PARAM: &str = "_parent_";
const ROOT_PARAM: &str = "_root_";

/// A value produced or consumed by a resolver.
///
/// Containers travel as nodes so they can keep their place in the tree;
/// everything else is a plain value.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Value(Value),
    Node(Node),
}

impl ResolvedValue {
    /// The plain value, with nodes turned into their (unresolved) contents
    pub fn to_value(&self) -> Value {
        match self {
            ResolvedValue::Value(v) => v.clone(),
            ResolvedValue::Node(n) => n.to_value(),
        }
    }

    /// Leaf nodes become their value; containers stay nodes
    pub fn into_plain(self) -> Self {
        match self {
            ResolvedValue::Node(n) if !n.is_container() => match n.raw_value() {
                Some(v) => ResolvedValue::Value(v),
                None => ResolvedValue::Node(n),
            },
            other => other,
        }
    }

    /// The node, if this is one
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            ResolvedValue::Node(n) => Some(n),
            ResolvedValue::Value(_) => None,
        }
    }

    /// The string, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedValue::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ResolvedValue::Value(Value::Null))
    }
}

impl PartialEq for ResolvedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ResolvedValue::Value(a), ResolvedValue::Value(b)) => a == b,
            (ResolvedValue::Node(a), ResolvedValue::Node(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<Value> for ResolvedValue {
    fn from(v: Value) -> Self {
        ResolvedValue::Value(v)
    }
}

impl From<Node> for ResolvedValue {
    fn from(n: Node) -> Self {
        ResolvedValue::Node(n)
    }
}

/// Context passed to a resolver call
#[derive(Debug, Clone)]
pub struct ResolverContext {
    /// Full key of the node whose interpolation is being resolved
    pub config_path: String,
    /// The node being resolved, when `_node_` was requested
    pub node: Option<Node>,
    /// Its parent container, when `_parent_` was requested
    pub parent: Option<Node>,
    /// The config root, when `_root_` was requested
    pub root: Option<Node>,
    /// Source text of each argument
    pub args_str: Vec<String>,
    /// Nodes currently being resolved, so nested lookups detect cycles
    pub(crate) memo: Memo,
}

impl ResolverContext {
    /// A context with no injected nodes, for calling resolvers directly
    pub fn new(config_path: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
            node: None,
            parent: None,
            root: None,
            args_str: Vec::new(),
            memo: Memo::default(),
        }
    }

    fn require(&self, node: &Option<Node>, param: &str, resolver: &str) -> Result<Node> {
        node.clone().ok_or_else(|| {
            Error::internal(format!(
                "Resolver '{}' did not receive its {} parameter",
                resolver, param
            ))
        })
    }
}

/// How a resolver receives its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Convention {
    /// Evaluated argument values, optional context injection
    #[default]
    Typed,
    /// Raw argument strings, always cached, no injection
    Legacy,
}

/// A resolver that can be registered and called from interpolations
pub trait Resolver: Send + Sync {
    /// Resolve a value with the given arguments
    fn resolve(&self, args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue>;

    /// Get the name of this resolver
    fn name(&self) -> &str;

    /// Declared parameter names; reserved names request injected context
    fn parameters(&self) -> Vec<String> {
        Vec::new()
    }

    fn convention(&self) -> Convention {
        Convention::Typed
    }
}

/// A function-based typed resolver
pub struct FnResolver<F>
where
    F: Fn(&[ResolvedValue], &ResolverContext) -> Result<ResolvedValue> + Send + Sync,
{
    name: String,
    parameters: Vec<String>,
    func: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&[ResolvedValue], &ResolverContext) -> Result<ResolvedValue> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            func,
        }
    }

    /// Declare the parameter names, e.g. `["key", "_parent_"]`
    pub fn with_parameters(mut self, parameters: &[&str]) -> Self {
        self.parameters = parameters.iter().map(|p| p.to_string()).collect();
        self
    }
}

impl<F> Resolver for FnResolver<F>
where
    F: Fn(&[ResolvedValue], &ResolverContext) -> Result<ResolvedValue> + Send + Sync,
{
    fn resolve(&self, args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
        (self.func)(args, ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<String> {
        self.parameters.clone()
    }
}

/// A resolver taking its arguments as raw strings
pub struct LegacyResolver<F>
where
    F: Fn(&[String]) -> Result<Value> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> LegacyResolver<F>
where
    F: Fn(&[String]) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Resolver for LegacyResolver<F>
where
    F: Fn(&[String]) -> Result<Value> + Send + Sync,
{
    fn resolve(&self, args: &[ResolvedValue], _ctx: &ResolverContext) -> Result<ResolvedValue> {
        let args: Vec<String> = args.iter().map(|a| a.to_value().to_string()).collect();
        (self.func)(&args).map(ResolvedValue::Value)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn convention(&self) -> Convention {
        Convention::Legacy
    }
}

/// Context a resolver asked for through its parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Injections {
    node: bool,
    parent: bool,
    root: bool,
}

impl Injections {
    fn from_parameters(name: &str, parameters: &[String]) -> Result<Self> {
        let mut injections = Injections::default();
        for parameter in parameters {
            match parameter.as_str() {
                NODE_PARAM => injections.node = true,
                PARENT_PARAM => injections.parent = true,
                ROOT_PARAM => injections.root = true,
                p if is_reserved(p) => {
                    return Err(Error::registry(RegistryErrorKind::UnknownParameter {
                        name: name.to_string(),
                        parameter: p.to_string(),
                    }))
                }
                _ => {}
            }
        }
        Ok(injections)
    }

    fn any(&self) -> bool {
        self.node || self.parent || self.root
    }
}

/// `_name_`-shaped parameter names are reserved for injection
fn is_reserved(parameter: &str) -> bool {
    parameter.len() > 2 && parameter.starts_with('_') && parameter.ends_with('_')
}

#[derive(Clone)]
struct Registration {
    resolver: Arc<dyn Resolver>,
    use_cache: bool,
    injections: Injections,
}

/// Registry of named resolvers
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Registration>,
}

impl ResolverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in resolvers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin_resolvers();
        registry
    }

    fn register_builtin_resolvers(&mut self) {
        let builtins: Vec<(Arc<dyn Resolver>, bool)> = vec![
            (Arc::new(FnResolver::new("oc.env", env_resolver)), false),
            (
                Arc::new(
                    FnResolver::new("oc.decode", decode_resolver)
                        .with_parameters(&["expr", PARENT_PARAM, NODE_PARAM]),
                ),
                false,
            ),
            (
                Arc::new(
                    FnResolver::new("oc.create", create_resolver)
                        .with_parameters(&["obj", PARENT_PARAM]),
                ),
                false,
            ),
            (
                Arc::new(
                    FnResolver::new("oc.select", select_resolver)
                        .with_parameters(&["key", "default", PARENT_PARAM]),
                ),
                false,
            ),
            (
                Arc::new(
                    FnResolver::new("oc.deprecated", deprecated_resolver)
                        .with_parameters(&["key", "message", PARENT_PARAM, NODE_PARAM]),
                ),
                false,
            ),
            (
                Arc::new(
                    FnResolver::new("oc.dict.keys", dict_keys_resolver)
                        .with_parameters(&["key", PARENT_PARAM]),
                ),
                false,
            ),
            (
                Arc::new(
                    FnResolver::new("oc.dict.values", dict_values_resolver)
                        .with_parameters(&["key", PARENT_PARAM]),
                ),
                false,
            ),
        ];
        for (resolver, use_cache) in builtins {
            let name = resolver.name().to_string();
            let injections = Injections::from_parameters(&name, &resolver.parameters())
                .unwrap_or_default();
            self.resolvers.insert(
                name,
                Registration {
                    resolver,
                    use_cache,
                    injections,
                },
            );
        }
    }

    /// Register a resolver.
    ///
    /// Fails when the name is empty or taken, when a reserved parameter is
    /// unknown, or when a resolver asks for injected context and caching.
    pub fn register(&mut self, resolver: Arc<dyn Resolver>, use_cache: bool) -> Result<()> {
        let name = resolver.name().to_string();
        if name.is_empty() {
            return Err(Error::registry(RegistryErrorKind::EmptyName));
        }
        if self.resolvers.contains_key(&name) {
            return Err(Error::registry(RegistryErrorKind::AlreadyRegistered {
                name,
            }));
        }
        let parameters = resolver.parameters();
        let injections = match resolver.convention() {
            Convention::Typed => Injections::from_parameters(&name, &parameters)?,
            Convention::Legacy => {
                if parameters.iter().any(|p| is_reserved(p)) {
                    return Err(Error::registry(RegistryErrorKind::LegacyInjection {
                        name,
                    }));
                }
                Injections::default()
            }
        };
        if use_cache && injections.any() {
            return Err(Error::registry(RegistryErrorKind::CachedWithContext {
                name,
            }));
        }
        let use_cache = use_cache || resolver.convention() == Convention::Legacy;
        self.resolvers.insert(
            name,
            Registration {
                resolver,
                use_cache,
                injections,
            },
        );
        Ok(())
    }

    /// Register a typed resolver from a closure
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F, use_cache: bool) -> Result<()>
    where
        F: Fn(&[ResolvedValue], &ResolverContext) -> Result<ResolvedValue> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnResolver::new(name, func)), use_cache)
    }

    /// Register a legacy resolver. Legacy resolvers are deprecated.
    pub fn register_legacy<F>(&mut self, name: impl Into<String>, func: F) -> Result<()>
    where
        F: Fn(&[String]) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        log::warn!(
            "Resolver '{}' uses the legacy string-argument convention, which is deprecated; \
             register a typed resolver instead",
            name
        );
        self.register(Arc::new(LegacyResolver::new(name, func)), true)
    }

    /// Remove a resolver, returning whether it was registered
    pub fn unregister(&mut self, name: &str) -> bool {
        self.resolvers.remove(name).is_some()
    }

    /// Remove every resolver, built-ins included
    pub fn clear(&mut self) {
        self.resolvers.clear();
    }

    /// Check if a resolver is registered
    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resolvers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a resolver by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Resolver>> {
        self.resolvers.get(name).map(|r| r.resolver.clone())
    }

    fn registration(&self, name: &str) -> Option<Registration> {
        self.resolvers.get(name).cloned()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &self.names())
            .finish()
    }
}

// =============================================================================
// Global Resolver Registry
// =============================================================================

static GLOBAL_REGISTRY: OnceLock<RwLock<ResolverRegistry>> = OnceLock::new();

/// Get the global resolver registry, initialised with the built-ins
pub fn global_registry() -> &'static RwLock<ResolverRegistry> {
    GLOBAL_REGISTRY.get_or_init(|| RwLock::new(ResolverRegistry::with_builtins()))
}

fn poisoned() -> Error {
    Error::internal("Resolver registry lock poisoned")
}

/// Register a resolver in the global registry
pub fn register_global(resolver: Arc<dyn Resolver>, use_cache: bool) -> Result<()> {
    global_registry()
        .write()
        .map_err(|_| poisoned())?
        .register(resolver, use_cache)
}

/// Register a typed closure resolver in the global registry
pub fn register_new_resolver<F>(name: impl Into<String>, func: F, use_cache: bool) -> Result<()>
where
    F: Fn(&[ResolvedValue], &ResolverContext) -> Result<ResolvedValue> + Send + Sync + 'static,
{
    global_registry()
        .write()
        .map_err(|_| poisoned())?
        .register_fn(name, func, use_cache)
}

/// Register a legacy resolver in the global registry
pub fn register_legacy_resolver<F>(name: impl Into<String>, func: F) -> Result<()>
where
    F: Fn(&[String]) -> Result<Value> + Send + Sync + 'static,
{
    global_registry()
        .write()
        .map_err(|_| poisoned())?
        .register_legacy(name, func)
}

/// Check whether a resolver is registered globally
pub fn has_resolver(name: &str) -> Result<bool> {
    Ok(global_registry()
        .read()
        .map_err(|_| poisoned())?
        .contains(name))
}

/// Remove a resolver from the global registry
pub fn unregister_resolver(name: &str) -> Result<bool> {
    Ok(global_registry()
        .write()
        .map_err(|_| poisoned())?
        .unregister(name))
}

/// Remove every resolver from the global registry, built-ins included
pub fn clear_resolvers() -> Result<()> {
    global_registry().write().map_err(|_| poisoned())?.clear();
    Ok(())
}

/// Add the built-in resolvers back to the global registry
pub fn register_default_resolvers() -> Result<()> {
    global_registry()
        .write()
        .map_err(|_| poisoned())?
        .register_builtin_resolvers();
    Ok(())
}

static GUARD_LOCK: Mutex<()> = Mutex::new(());

/// Snapshot of the global registry, restored when dropped.
///
/// Guards are serialized with each other, so code holding one sees no
/// registrations made through another guard.
pub struct RegistryGuard {
    snapshot: ResolverRegistry,
    _lock: MutexGuard<'static, ()>,
}

impl RegistryGuard {
    pub fn new() -> Self {
        let lock = GUARD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = global_registry()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Self {
            snapshot,
            _lock: lock,
        }
    }
}

impl Default for RegistryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut registry = global_registry().write().unwrap_or_else(|e| e.into_inner());
        *registry = self.snapshot.clone();
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Undo the escaping of a raw argument string (`\ ` and `\,`)
fn unescape_raw_arg(arg: &str) -> String {
    arg.replace("\\ ", " ").replace("\\,", ",")
}

fn typed_cache_key(args: &[ResolvedValue]) -> String {
    let values: Vec<Value> = args.iter().map(ResolvedValue::to_value).collect();
    format!("{:?}", values)
}

/// Call the resolver `name` on behalf of `node`, whose container is `parent`
pub(crate) fn invoke(
    name: &str,
    args: Vec<ResolvedValue>,
    args_str: Vec<String>,
    node: &Node,
    parent: &Node,
    memo: &Memo,
) -> Result<ResolvedValue> {
    // Clone out so the lock is not held while the resolver runs
    let registration = global_registry()
        .read()
        .map_err(|_| poisoned())?
        .registration(name)
        .ok_or_else(|| Error::unsupported_interpolation(name))?;

    let convention = registration.resolver.convention();
    let args = match convention {
        Convention::Typed => args,
        Convention::Legacy => {
            if let Some(arg) = args_str.iter().find(|a| a.contains("${")) {
                return Err(Error::resolver_custom(
                    name,
                    format!(
                        "Legacy resolvers do not support interpolations in arguments, got '{}'",
                        arg
                    ),
                ));
            }
            args_str
                .iter()
                .map(|a| ResolvedValue::Value(Value::String(unescape_raw_arg(a))))
                .collect()
        }
    };

    let root = parent.root();
    let cache_key = registration.use_cache.then(|| match convention {
        Convention::Typed => typed_cache_key(&args),
        Convention::Legacy => args_str.join(","),
    });
    if let Some(key) = &cache_key {
        if let Some(hit) = root.cached_result(name, key) {
            log::trace!("Resolver '{}' cache hit for {}", name, key);
            return Ok(hit);
        }
    }

    let injections = registration.injections;
    let ctx = ResolverContext {
        config_path: node.full_key(),
        node: injections.node.then(|| node.clone()),
        parent: injections.parent.then(|| parent.clone()),
        root: injections.root.then(|| root.clone()),
        args_str,
        memo: memo.clone(),
    };
    let result = registration.resolver.resolve(&args, &ctx)?;

    if let Some(key) = cache_key {
        root.store_result(name, key, result.clone());
    }
    Ok(result)
}

// =============================================================================
// Built-in Resolvers
// =============================================================================

fn string_arg<'a>(resolver: &str, args: &'a [ResolvedValue], index: usize, what: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(arg) => arg.as_str().ok_or_else(|| {
            Error::resolver_custom(
                resolver,
                format!("{} must be a string, got '{}'", what, arg.to_value().type_name()),
            )
        }),
        None => Err(Error::resolver_custom(resolver, format!("{} is required", what))),
    }
}

/// `oc.env:NAME[,default]`
fn env_resolver(args: &[ResolvedValue], _ctx: &ResolverContext) -> Result<ResolvedValue> {
    let name = string_arg("oc.env", args, 0, "Environment variable name")?;
    if args.len() > 2 {
        return Err(Error::resolver_custom(
            "oc.env",
            format!("Expected at most 2 arguments, got {}", args.len()),
        ));
    }

    match std::env::var(name) {
        Ok(value) => Ok(Value::String(value).into()),
        Err(_) => match args.get(1).map(ResolvedValue::to_value) {
            Some(Value::Null) => Ok(Value::Null.into()),
            Some(Value::String(default)) => Ok(Value::String(default).into()),
            Some(other) if !other.is_sequence() && !other.is_mapping() => {
                Ok(Value::String(other.to_string()).into())
            }
            Some(other) => Err(Error::resolver_custom(
                "oc.env",
                format!(
                    "The default value must be a string or null, got '{}'",
                    other.type_name()
                ),
            )),
            None => Err(Error::resolver_custom(
                "oc.env",
                format!("Environment variable '{}' not found", name),
            )
            .with_help(format!(
                "Set the {} environment variable or provide a default: ${{oc.env:{},default}}",
                name, name
            ))),
        },
    }
}

/// `oc.decode:expr` parses a string as a single value and evaluates it
fn decode_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.decode")?;
    let node = ctx.require(&ctx.node, NODE_PARAM, "oc.decode")?;
    let expr = match args.first() {
        None => return Err(Error::resolver_custom("oc.decode", "An expression is required")),
        Some(arg) if arg.is_null() => return Ok(Value::Null.into()),
        Some(arg) => arg.as_str().ok_or_else(|| {
            Error::resolver_custom(
                "oc.decode",
                format!(
                    "oc.decode can only take strings or null as input, got '{}'",
                    arg.to_value().type_name()
                ),
            )
        })?,
    };

    let tree = grammar::parse(expr, Rule::SingleElement)?;
    let mut memo = ctx.memo.clone();
    resolution::resolve_parse_tree(&parent, &node, &tree, &mut memo).map(ResolvedValue::into_plain)
}

/// `oc.create:obj` turns a mapping or sequence into a config node
fn create_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.create")?;
    let value = match args.first() {
        Some(ResolvedValue::Node(n)) => n.to_value(),
        // A string is read as a YAML document
        Some(ResolvedValue::Value(Value::String(s))) => serde_yaml::from_str(s).map_err(|e| {
            Error::resolver_custom("oc.create", format!("Invalid YAML input: {}", e))
        })?,
        Some(ResolvedValue::Value(v)) => v.clone(),
        None => return Err(Error::resolver_custom("oc.create", "An input object is required")),
    };
    if !value.is_mapping() && !value.is_sequence() {
        return Err(Error::resolver_custom(
            "oc.create",
            format!(
                "Input must be a mapping or a sequence, got '{}'",
                value.type_name()
            ),
        ));
    }

    let node = Node::from_value(value);
    node.link_to(&parent, None);
    Ok(node.into())
}

/// `oc.select:key[,default]` selects relative to the parent
fn select_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.select")?;
    let key = string_arg("oc.select", args, 0, "The key")?;
    let default = args.get(1).cloned();

    let options = SelectOptions::default().absolute_key(true);
    let mut memo = ctx.memo.clone();
    let selected = resolution::select_node_with_memo(&parent, key, &options, &mut memo)?;
    match selected {
        Some(node) if !node.is_missing() => Ok(ResolvedValue::Node(node).into_plain()),
        Some(_) => Ok(default.unwrap_or_else(|| Value::missing().into())),
        None => Ok(default.unwrap_or(ResolvedValue::Value(Value::Null))),
    }
}

/// `oc.deprecated:new_key[,message]` points a moved key at its new home
fn deprecated_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.deprecated")?;
    let node = ctx.require(&ctx.node, NODE_PARAM, "oc.deprecated")?;
    let key = string_arg("oc.deprecated", args, 0, "The new key")?;
    let message = match args.get(1) {
        Some(_) => string_arg("oc.deprecated", args, 1, "The message")?,
        None => "'$OLD_KEY' is deprecated. Change your code and config to use '$NEW_KEY'",
    };

    let options = SelectOptions::default().absolute_key(true);
    let mut memo = ctx.memo.clone();
    let target = resolution::select_node_with_memo(&parent, key, &options, &mut memo)?
        .ok_or_else(|| {
            Error::resolver_custom(
                "oc.deprecated",
                format!(
                    "In oc.deprecated resolver at '{}': Key not found: '{}'",
                    node.full_key(),
                    key
                ),
            )
        })?;

    let warning = message
        .replace("$OLD_KEY", &node.full_key())
        .replace("$NEW_KEY", &target.full_key());
    log::warn!("{}", warning);
    Ok(target.into())
}

/// The dict named by the first argument: either a key relative to
/// `parent` or a dict node passed directly
fn dict_arg(resolver: &str, args: &[ResolvedValue], parent: &Node, memo: &Memo) -> Result<Node> {
    let dict = match args.first() {
        Some(ResolvedValue::Node(n)) => n.clone(),
        Some(ResolvedValue::Value(Value::String(key))) => {
            let options = SelectOptions::default()
                .absolute_key(true)
                .throw_on_missing(true);
            let mut memo = memo.clone();
            resolution::select_node_with_memo(parent, key, &options, &mut memo)?.ok_or_else(
                || Error::resolver_custom(resolver, format!("Key not found: '{}'", key)),
            )?
        }
        Some(other) => {
            return Err(Error::resolver_custom(
                resolver,
                format!(
                    "The input must be a key string or a dict, got '{}'",
                    other.to_value().type_name()
                ),
            ))
        }
        None => return Err(Error::resolver_custom(resolver, "A key is required")),
    };
    if dict.kind() != NodeKind::Dict || dict.raw_value().is_some() {
        return Err(Error::resolver_custom(
            resolver,
            format!(
                "'{}' must point to a dict, got '{}'",
                dict.full_key(),
                dict.to_value().type_name()
            ),
        ));
    }
    Ok(dict)
}

/// `oc.dict.keys:key` lists the keys of a dict
fn dict_keys_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.dict.keys")?;
    let dict = dict_arg("oc.dict.keys", args, &parent, &ctx.memo)?;

    let keys = Value::Sequence(dict.keys().into_iter().map(Value::String).collect());
    let node = Node::from_value(keys);
    node.link_to(&parent, None);
    Ok(node.into())
}

/// `oc.dict.values:key` lists interpolations to each value of a dict
fn dict_values_resolver(args: &[ResolvedValue], ctx: &ResolverContext) -> Result<ResolvedValue> {
    let parent = ctx.require(&ctx.parent, PARENT_PARAM, "oc.dict.values")?;
    let dict = dict_arg("oc.dict.values", args, &parent, &ctx.memo)?;

    let base = match args.first().and_then(ResolvedValue::as_str) {
        // The values live one level deeper, in the returned list
        Some(key) if key.starts_with('.') => format!(".{}", key),
        Some(key) => key.to_string(),
        None => dict.full_key(),
    };
    let values: Vec<Value> = dict
        .keys()
        .into_iter()
        .map(|k| {
            if base.is_empty() {
                Value::String(format!("${{{}}}", k))
            } else {
                Value::String(format!("${{{}.{}}}", base, k))
            }
        })
        .collect();

    let node = Node::from_value(Value::Sequence(values));
    node.link_to(&parent, None);
    Ok(node.into())
}
