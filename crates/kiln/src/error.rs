//! Error taxonomy for the engine.
//!
//! Every fallible boundary in `kiln` returns a `Result<T, E>` with a
//! hand-rolled error enum for that subsystem; `Error` unifies them for the
//! renderer facade. No derive-macro error crate is used anywhere in this
//! crate, matching the rest of the workspace.

use std::fmt;

/// A location in a named template source, attached to most errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub template: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    #[must_use]
    pub fn new(template: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            template: template.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.template, self.line, self.column)
    }
}

/// Errors raised by a `Source` implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    NoTemplateExists(String),
    IllegalAccess { path: String, limitation: String },
    Io(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTemplateExists(name) => write!(f, "no template exists named `{name}`"),
            Self::IllegalAccess { path, limitation } => {
                write!(f, "illegal access to `{path}`: {limitation}")
            }
            Self::Io(msg) => write!(f, "source I/O error: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Errors raised while lexing or parsing a template into an AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub loc: Option<SourceLoc>,
}

impl ParseError {
    #[must_use]
    pub fn new(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        Self {
            message: message.into(),
            loc,
        }
    }

    #[must_use]
    pub fn at(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(message, Some(loc))
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "parse error at {loc}: {}", self.message),
            None => write!(f, "parse error: {}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Errors raised while resolving (inlining) an AST's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    CyclicalReference { name: String, chain: Vec<String> },
    MissingRaw(String),
    Source(SourceError),
    /// A dependency fetched during resolution failed to parse.
    Parse(ParseError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CyclicalReference { name, chain } => {
                write!(f, "cyclical inline reference to `{name}` via [{}]", chain.join(" -> "))
            }
            Self::MissingRaw(name) => write!(f, "missing raw file `{name}`"),
            Self::Source(e) => write!(f, "{e}"),
            Self::Parse(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<SourceError> for ResolveError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<ParseError> for ResolveError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

/// Errors raised while serializing a resolved AST against a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    MissingVariable(String),
    TypeMismatch { expected: String, found: String },
    UnknownFunction(String),
    NoMatchingOverload(String),
    DivisionByZero,
    IntegerOverflow,
    EncodingFailure(String),
    MissingRaw(String),
    Timeout,
    Custom(String),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVariable(v) => write!(f, "missing required variable `{v}`"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::UnknownFunction(name) => write!(f, "unknown function `{name}`"),
            Self::NoMatchingOverload(name) => write!(f, "no matching overload for `{name}`"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::IntegerOverflow => write!(f, "integer overflow"),
            Self::EncodingFailure(msg) => write!(f, "encoding failure: {msg}"),
            Self::MissingRaw(name) => write!(f, "missing raw file `{name}`"),
            Self::Timeout => write!(f, "render timed out"),
            Self::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Programming errors raised by the Entities registry. These represent a
/// host misuse of the registration API, not a template-authoring mistake;
/// the registry is only ever populated at startup before any render runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    InvalidName(String),
    Confusable { name: String, with: String },
    MutatingMethodAsFunction(String),
    EngineAlreadyStarted,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "`{name}` is not a valid entity name"),
            Self::Confusable { name, with } => {
                write!(f, "overload `{name}` has a call signature confusable with `{with}`")
            }
            Self::MutatingMethodAsFunction(name) => {
                write!(f, "mutating method `{name}` cannot be registered as a function")
            }
            Self::EngineAlreadyStarted => write!(f, "cannot register entities after the engine has started"),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Top-level error returned by the renderer facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Source(SourceError),
    Parse(ParseError),
    Resolve(ResolveError),
    Serialize(SerializeError),
    Registration(RegistrationError),
    NoSources,
    NoSourceForKey(String),
    Unknown(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(e) => write!(f, "{e}"),
            Self::Parse(e) => write!(f, "{e}"),
            Self::Resolve(e) => write!(f, "{e}"),
            Self::Serialize(e) => write!(f, "{e}"),
            Self::Registration(e) => write!(f, "{e}"),
            Self::NoSources => write!(f, "no template sources configured"),
            Self::NoSourceForKey(key) => write!(f, "no source available for key `{key}`"),
            Self::Unknown(msg) => write!(f, "unknown error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

impl From<SerializeError> for Error {
    fn from(e: SerializeError) -> Self {
        Self::Serialize(e)
    }
}

impl From<RegistrationError> for Error {
    fn from(e: RegistrationError) -> Self {
        Self::Registration(e)
    }
}

pub type KilnResult<T> = Result<T, Error>;
