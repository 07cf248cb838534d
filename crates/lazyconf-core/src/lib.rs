//! lazyconf-core: hierarchical configuration with lazy interpolation
//!
//! Values can reference other values (`${db.host}`, `${..sibling}`), embed
//! them in strings (`http://${host}:${port}`) or call named resolvers
//! (`${oc.env:HOME,/tmp}`). References are resolved on access, validated
//! against the declared type of the node holding them, and checked for
//! cycles.
//!
//! # Example
//!
//! ```rust
//! use lazyconf_core::Config;
//!
//! let yaml = r#"
//! database:
//!   host: localhost
//!   port: 5432
//! url: postgres://${database.host}:${database.port}
//! "#;
//!
//! let config = Config::from_yaml(yaml).unwrap();
//! assert_eq!(config.get("database.host").unwrap().as_str(), Some("localhost"));
//! assert_eq!(config.get_string("url").unwrap(), "postgres://localhost:5432");
//! ```

pub mod error;
pub mod grammar;
pub mod lexer;
pub mod node;
pub mod resolution;
pub mod resolver;
pub mod value;
pub mod visitor;

mod config;

pub use config::Config;
pub use error::{Error, ErrorDetail, ErrorKind, Result};
pub use node::{DeclaredType, Node, NodeKind};
pub use resolution::{select_node, SelectOptions};
pub use resolver::{
    register_default_resolvers, register_global, register_new_resolver, RegistryGuard,
    ResolvedValue, Resolver, ResolverContext, ResolverRegistry,
};
pub use value::Value;
