//! Error types for lazyconf
//!
//! Structured errors with context, path information, and actionable help
//! messages. Every failure that happens while resolving an interpolation
//! belongs to the `ErrorKind::Resolution` family, so callers can catch
//! "resolution failed" with a single check.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Result type alias for lazyconf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lazyconf operations.
///
/// Boxed, so the error side of `Result<T>` is one pointer wide. Fields are
/// reachable through `Deref`.
#[derive(Debug, Clone)]
pub struct Error(Box<ErrorDetail>);

/// Fields of an [`Error`]
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Full key of the node where the error occurred (e.g., "database.port")
    pub path: Option<String>,
    /// Actionable help message
    pub help: Option<String>,
    /// Underlying cause (as string for Clone compatibility)
    pub cause: Option<String>,
}

/// Categories of errors that can occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed YAML or JSON document
    Parse,
    /// Malformed interpolation syntax
    GrammarParse,
    /// Failure while resolving an interpolation against the tree
    Resolution(ResolutionErrorKind),
    /// A mandatory value (`???`) was read directly
    MissingMandatoryValue,
    /// A key does not exist (plain access, outside of interpolation)
    KeyNotFound { key: String },
    /// A path walk hit a non-container (plain access)
    TypeMismatch { key: String },
    /// An assigned value does not match the declared type
    Validation,
    /// Mutation of a read-only node
    Readonly,
    /// Resolver registration failed
    Registry(RegistryErrorKind),
    /// A resolver callable returned an error
    Resolver { resolver: String },
    /// Internal error (bug in lazyconf)
    Internal,
}

/// Kinds of interpolation resolution failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionErrorKind {
    /// A node-path segment does not exist
    KeyNotFound { key: String },
    /// A path walk went through a non-container
    TypeMismatch { key: String },
    /// Resolution reached a mandatory-missing value
    ToMissingValue,
    /// Unknown resolver name
    UnsupportedInterpolationType { name: String },
    /// The resolved value does not match the destination type
    Validation,
    /// A resolution chain revisited a node
    Cyclic,
    /// Any other failure, wrapped with its original kind name
    Generic { kind: String },
}

/// Kinds of resolver registration failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// Resolver registered without a name
    EmptyName,
    /// A resolver with this name is already registered
    AlreadyRegistered { name: String },
    /// The resolver asks for injected context and for caching
    CachedWithContext { name: String },
    /// The resolver asks for an unknown reserved parameter
    UnknownParameter { name: String, parameter: String },
    /// A legacy resolver asks for injected context
    LegacyInjection { name: String },
}

impl ErrorDetail {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            path: None,
            help: None,
            cause: None,
        }
    }
}

impl From<ErrorDetail> for Error {
    fn from(detail: ErrorDetail) -> Self {
        Error(Box::new(detail))
    }
}

impl Deref for Error {
    type Target = ErrorDetail;

    fn deref(&self) -> &ErrorDetail {
        &self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut ErrorDetail {
        &mut self.0
    }
}

impl Error {
    /// Create a grammar parse error for `input`
    pub fn grammar_parse(input: &str, message: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(format!("{}\n  Input: {}", message.into(), input)),
            help: Some(
                "Check the interpolation syntax; use \\${ for a literal ${".into(),
            ),
            ..ErrorDetail::new(ErrorKind::GrammarParse)
        })
    }

    /// Create a document parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(message.into()),
            ..ErrorDetail::new(ErrorKind::Parse)
        })
    }

    /// Create an interpolation key error
    pub fn interpolation_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Error::from(ErrorDetail {
            help: Some(format!("Check that '{}' exists in the configuration", key)),
            ..ErrorDetail::new(ErrorKind::Resolution(ResolutionErrorKind::KeyNotFound {
                key,
            }))
        })
    }

    /// Create a type mismatch error raised while walking an interpolation path
    pub fn interpolation_type(key: impl Into<String>, got: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(format!("Got: {}", got.into())),
            ..ErrorDetail::new(ErrorKind::Resolution(ResolutionErrorKind::TypeMismatch {
                key: key.into(),
            }))
        })
    }

    /// Create an error for an interpolation that reached a missing value
    pub fn interpolation_to_missing(key: impl Into<String>) -> Self {
        let key = key.into();
        Error::from(ErrorDetail {
            cause: Some(format!("Interpolation key '{}' is missing", key)),
            help: Some(format!("Set a value for '{}'", key)),
            ..ErrorDetail::new(ErrorKind::Resolution(ResolutionErrorKind::ToMissingValue))
        })
    }

    /// Create an unknown resolver error
    pub fn unsupported_interpolation(name: impl Into<String>) -> Self {
        let name = name.into();
        Error::from(ErrorDetail {
            help: Some(format!("Register the '{}' resolver or check for typos", name)),
            ..ErrorDetail::new(ErrorKind::Resolution(
                ResolutionErrorKind::UnsupportedInterpolationType { name },
            ))
        })
    }

    /// Create a validation error for a resolved interpolation value
    pub fn interpolation_validation(message: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(message.into()),
            ..ErrorDetail::new(ErrorKind::Resolution(ResolutionErrorKind::Validation))
        })
    }

    /// Create a cyclic resolution error
    pub fn cyclic(message: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(message.into()),
            help: Some("Break the cycle by removing one of the references".into()),
            ..ErrorDetail::new(ErrorKind::Resolution(ResolutionErrorKind::Cyclic))
        })
    }

    /// Wrap any error outside the resolution family into a generic one.
    ///
    /// Errors already in the family are returned unchanged.
    pub fn into_resolution(self) -> Self {
        if self.is_resolution_failure() {
            return self;
        }
        let kind = self.kind_name().to_string();
        let message = self.message();
        let mut detail = *self.0;
        detail.cause = Some(match detail.cause.take() {
            Some(cause) => format!("{}: {}\n  {}", kind, message, cause),
            None => format!("{}: {}", kind, message),
        });
        detail.kind = ErrorKind::Resolution(ResolutionErrorKind::Generic { kind });
        Error(Box::new(detail))
    }

    /// Create a missing mandatory value error
    pub fn missing_mandatory(path: impl Into<String>) -> Self {
        let path = path.into();
        Error::from(ErrorDetail {
            help: Some(format!("Set a value for '{}'", path)),
            ..ErrorDetail::new(ErrorKind::MissingMandatoryValue)
        })
        .with_path(path)
    }

    /// Create a key not found error
    pub fn key_not_found(key: impl Into<String>) -> Self {
        let key = key.into();
        Error::from(ErrorDetail {
            help: Some(format!("Check that '{}' exists in the configuration", key)),
            ..ErrorDetail::new(ErrorKind::KeyNotFound { key })
        })
    }

    /// Create a type mismatch error for plain (non-interpolation) access
    pub fn type_mismatch(key: impl Into<String>, got: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            cause: Some(format!("Got: {}", got.into())),
            ..ErrorDetail::new(ErrorKind::TypeMismatch { key: key.into() })
        })
    }

    /// Create a validation error
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        let p = path.into();
        Error::from(ErrorDetail {
            path: if p.is_empty() { None } else { Some(p) },
            cause: Some(message.into()),
            ..ErrorDetail::new(ErrorKind::Validation)
        })
    }

    /// Create an error for a value that cannot be read as `expected`
    pub fn type_coercion(
        path: impl Into<String>,
        expected: &str,
        got: impl Into<String>,
    ) -> Self {
        Self::validation(
            path,
            format!("Cannot read {} as {}", got.into(), expected),
        )
    }

    /// Create a read-only error
    pub fn readonly(path: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            help: Some("Clear the 'readonly' flag before modifying the node".into()),
            ..ErrorDetail::new(ErrorKind::Readonly)
        })
        .with_path(path)
    }

    /// Create a registry error
    pub fn registry(kind: RegistryErrorKind) -> Self {
        let help = match &kind {
            RegistryErrorKind::AlreadyRegistered { name } => Some(format!(
                "Unregister '{}' first or clear the registry",
                name
            )),
            RegistryErrorKind::CachedWithContext { .. } => Some(
                "Resolvers using _node_, _parent_ or _root_ cannot use the cache".into(),
            ),
            RegistryErrorKind::UnknownParameter { .. } => {
                Some("Supported parameters are _node_, _parent_ and _root_".into())
            }
            RegistryErrorKind::LegacyInjection { .. } | RegistryErrorKind::EmptyName => None,
        };
        Error::from(ErrorDetail {
            help,
            ..ErrorDetail::new(ErrorKind::Registry(kind))
        })
    }

    /// Create a custom resolver error
    pub fn resolver_custom(resolver: impl Into<String>, message: impl Into<String>) -> Self {
        let resolver = resolver.into();
        Error::from(ErrorDetail {
            cause: Some(message.into()),
            help: Some(format!("Check the '{}' resolver implementation", resolver)),
            ..ErrorDetail::new(ErrorKind::Resolver { resolver })
        })
    }

    /// Create an internal error (bug in lazyconf)
    pub fn internal(message: impl Into<String>) -> Self {
        Error::from(ErrorDetail {
            help: Some("This is likely a bug in lazyconf. Please report it.".into()),
            cause: Some(message.into()),
            ..ErrorDetail::new(ErrorKind::Internal)
        })
    }

    /// Add path context to the error
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add path context unless the error already has one
    pub fn or_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Add help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Whether this error belongs to the interpolation resolution family
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::Resolution(_))
    }

    /// Short name of the error kind, used when wrapping errors
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ErrorKind::Parse => "ParseError",
            ErrorKind::GrammarParse => "GrammarParseError",
            ErrorKind::Resolution(r) => match r {
                ResolutionErrorKind::KeyNotFound { .. } => "InterpolationKeyError",
                ResolutionErrorKind::TypeMismatch { .. } => "InterpolationTypeError",
                ResolutionErrorKind::ToMissingValue => "InterpolationToMissingValueError",
                ResolutionErrorKind::UnsupportedInterpolationType { .. } => {
                    "UnsupportedInterpolationType"
                }
                ResolutionErrorKind::Validation => "InterpolationValidationError",
                ResolutionErrorKind::Cyclic => "InterpolationResolutionError",
                ResolutionErrorKind::Generic { .. } => "InterpolationResolutionError",
            },
            ErrorKind::MissingMandatoryValue => "MissingMandatoryValue",
            ErrorKind::KeyNotFound { .. } => "KeyNotFound",
            ErrorKind::TypeMismatch { .. } => "TypeMismatch",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Readonly => "ReadonlyConfigError",
            ErrorKind::Registry(_) => "RegistryError",
            ErrorKind::Resolver { .. } => "ResolverError",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// The one-line main message of the error
    pub fn message(&self) -> String {
        match &self.kind {
            ErrorKind::Parse => "Failed to parse configuration document".into(),
            ErrorKind::GrammarParse => "Grammar parse error".into(),
            ErrorKind::Resolution(r) => match r {
                ResolutionErrorKind::KeyNotFound { key } => {
                    format!("Interpolation key '{}' not found", key)
                }
                ResolutionErrorKind::TypeMismatch { key } => {
                    format!("Error trying to access '{}': node is not a container", key)
                }
                ResolutionErrorKind::ToMissingValue => {
                    "Interpolation resolved to a missing value".into()
                }
                ResolutionErrorKind::UnsupportedInterpolationType { name } => {
                    format!("Unsupported interpolation type {}", name)
                }
                ResolutionErrorKind::Validation => "Interpolation validation failed".into(),
                ResolutionErrorKind::Cyclic => "Cyclic interpolation detected".into(),
                ResolutionErrorKind::Generic { kind } => {
                    format!("Interpolation resolution failed ({})", kind)
                }
            },
            ErrorKind::MissingMandatoryValue => "Missing mandatory value".into(),
            ErrorKind::KeyNotFound { key } => format!("Key not found: '{}'", key),
            ErrorKind::TypeMismatch { key } => {
                format!("Error trying to access '{}': node is not a container", key)
            }
            ErrorKind::Validation => "Validation error".into(),
            ErrorKind::Readonly => "Cannot modify read-only config".into(),
            ErrorKind::Registry(r) => match r {
                RegistryErrorKind::EmptyName => "Resolver name must not be empty".into(),
                RegistryErrorKind::AlreadyRegistered { name } => {
                    format!("Resolver '{}' is already registered", name)
                }
                RegistryErrorKind::CachedWithContext { name } => format!(
                    "Resolver '{}' uses injected parameters and cannot use the cache",
                    name
                ),
                RegistryErrorKind::UnknownParameter { name, parameter } => format!(
                    "Resolver '{}' requests unknown parameter '{}'",
                    name, parameter
                ),
                RegistryErrorKind::LegacyInjection { name } => format!(
                    "Legacy resolver '{}' cannot request injected parameters",
                    name
                ),
            },
            ErrorKind::Resolver { resolver } => format!("Resolver '{}' error", resolver),
            ErrorKind::Internal => "Internal error".into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;

        if let Some(path) = &self.path {
            write!(f, "\n  Path: {}", path)?;
        }

        if let Some(cause) = &self.cause {
            write!(f, "\n  {}", cause)?;
        }

        if let Some(help) = &self.help {
            write!(f, "\n  Help: {}", help)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

/// Failure of a declared-type conversion
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("Value '{value}' of type '{got}' could not be converted to {expected}")]
    Incompatible {
        value: String,
        got: &'static str,
        expected: String,
    },
    #[error("Invalid value '{value}', expected one of [{variants}]")]
    UnknownVariant { value: String, variants: String },
    #[error("Value is not optional")]
    NotOptional,
}

impl ConversionError {
    /// Turn this conversion failure into a validation error at `path`
    pub fn into_validation(self, path: impl Into<String>) -> Error {
        Error::validation(path, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_key_error_display() {
        let err = Error::interpolation_key("database.host").with_path("app.db");
        let display = format!("{}", err);

        assert!(display.contains("Interpolation key 'database.host' not found"));
        assert!(display.contains("Path: app.db"));
        assert!(display.contains("Help:"));
        assert!(err.is_resolution_failure());
    }

    #[test]
    fn test_error_is_pointer_sized() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());

        let mut err = Error::interpolation_key("a.b");
        err.help = None;
        assert_eq!(format!("{}", err), "Interpolation key 'a.b' not found");
    }

    #[test]
    fn test_grammar_parse_error_is_outside_family() {
        let err = Error::grammar_parse("${a", "unexpected end of input");
        let display = format!("{}", err);

        assert_eq!(err.kind, ErrorKind::GrammarParse);
        assert!(!err.is_resolution_failure());
        assert!(display.contains("Input: ${a"));
    }

    #[test]
    fn test_into_resolution_wraps_foreign_errors() {
        let err = Error::resolver_custom("myresolver", "boom").into_resolution();
        let display = format!("{}", err);

        assert_eq!(
            err.kind,
            ErrorKind::Resolution(ResolutionErrorKind::Generic {
                kind: "ResolverError".into()
            })
        );
        assert!(display.contains("ResolverError: Resolver 'myresolver' error"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn test_into_resolution_keeps_family_errors() {
        let err = Error::cyclic("a -> b -> a").into_resolution();
        assert_eq!(err.kind, ErrorKind::Resolution(ResolutionErrorKind::Cyclic));
    }

    #[test]
    fn test_or_path_keeps_existing_path() {
        let err = Error::interpolation_key("x").with_path("a").or_path("b");
        assert_eq!(err.path, Some("a".into()));

        let err = Error::interpolation_key("x").or_path("b");
        assert_eq!(err.path, Some("b".into()));
    }

    #[test]
    fn test_registry_error_help() {
        let err = Error::registry(RegistryErrorKind::AlreadyRegistered {
            name: "now".into(),
        });
        let display = format!("{}", err);

        assert!(display.contains("Resolver 'now' is already registered"));
        assert!(display.contains("Help: Unregister 'now' first"));
    }

    #[test]
    fn test_validation_error_empty_path() {
        let err = Error::validation("", "bad value");
        assert!(err.path.is_none());

        let err = Error::validation("server.port", "bad value");
        assert_eq!(err.path, Some("server.port".into()));
    }

    #[test]
    fn test_conversion_error_into_validation() {
        let err = ConversionError::Incompatible {
            value: "Bond".into(),
            got: "string",
            expected: "integer".into(),
        }
        .into_validation("age");
        let display = format!("{}", err);

        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(display.contains("Value 'Bond' of type 'string' could not be converted to integer"));
    }

    #[test]
    fn test_missing_mandatory_has_path() {
        let err = Error::missing_mandatory("a.b");
        assert_eq!(err.kind, ErrorKind::MissingMandatoryValue);
        assert_eq!(err.path, Some("a.b".into()));
    }
}
