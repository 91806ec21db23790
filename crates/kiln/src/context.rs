//! Render-time context: scope-keyed variable dictionaries, the registered
//! object model, and the `Options` bundle.

use std::sync::Arc;

use crate::value::{Dict, Value};

/// Text encoding the serializer renders output bytes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Iso8859_1,
    NextStep,
}

impl Encoding {
    /// Encodes `s`, or `None` if `s` contains a code point the encoding
    /// cannot represent.
    #[must_use]
    pub fn encode(self, s: &str) -> Option<Vec<u8>> {
        match self {
            Self::Utf8 => Some(s.as_bytes().to_vec()),
            Self::Ascii => {
                if s.is_ascii() {
                    Some(s.as_bytes().to_vec())
                } else {
                    None
                }
            }
            Self::Iso8859_1 => {
                let mut out = Vec::with_capacity(s.len());
                for c in s.chars() {
                    let cp = c as u32;
                    if cp > 0xFF {
                        return None;
                    }
                    out.push(cp as u8);
                }
                Some(out)
            }
            // NeXTSTEP's encoding is a superset of ASCII in its low range;
            // we accept the ASCII-representable subset and reject the rest
            // rather than ship an incorrect upper-half mapping table.
            Self::NextStep => {
                if s.is_ascii() {
                    Some(s.as_bytes().to_vec())
                } else {
                    None
                }
            }
        }
    }
}

bitflags::bitflags! {
    /// Cache behavior for a single render.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caching: u8 {
        const READ         = 0b0000_0001;
        const STORE        = 0b0000_0010;
        const AUTO_UPDATE  = 0b0000_0100;
        const DEFAULT = Self::READ.bits() | Self::STORE.bits();
        const BYPASS  = 0;
    }
}

/// Per-render configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub timeout: f64,
    pub parse_warning_throws: bool,
    pub missing_variable_throws: bool,
    pub grant_unsafe_entity_access: bool,
    pub encoding: Encoding,
    pub caching: Caching,
    pub embedded_ast_raw_limit: u32,
    pub polling_frequency: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            parse_warning_throws: false,
            missing_variable_throws: true,
            grant_unsafe_entity_access: false,
            encoding: Encoding::Utf8,
            caching: Caching::DEFAULT,
            embedded_ast_raw_limit: 32_768,
            polling_frequency: 10.0,
        }
    }
}

impl Options {
    /// Clamps `timeout` to the spec's documented minimum of 1 ms.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds.max(0.001);
        self
    }
}

/// How a registered scope-variable publishes into the template namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Pass-through reference to a host object; requires
    /// `grantUnsafeEntityAccess` to be read by an `UnsafeEntity` function.
    Unsafe,
    /// Publishes variables directly into a scope.
    Contextual,
    /// Forbids replacing an existing scope under this name.
    PreventOverlay,
    /// Forbids adding variables beyond what is already registered in this
    /// scope.
    LockContextVariables,
}

/// A single scope's variable table (`$name` or `self`).
#[derive(Debug, Clone, Default)]
pub struct ContextDictionary {
    pub values: Dict,
    /// Keys explicitly marked literal -- fixed for the Context's lifetime
    /// and eligible for parse-time inlining when `root` mode is active.
    pub literal_keys: Vec<String>,
    pub literal: bool,
    pub frozen: bool,
    pub modes: Vec<RegistrationMode>,
    /// Present only under `Unsafe` registration: opaque host references,
    /// injected into an `UnsafeEntity` function's call state.
    pub unsafe_objects: Option<Arc<Dict>>,
}

impl ContextDictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn mark_literal(&mut self, key: impl Into<String>) {
        self.literal_keys.push(key.into());
    }

    /// Freezes the dictionary on first `match`/lookup access, per the
    /// lifecycle note that a `ContextDictionary` freezes on first access.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn is_literal_key(&self, key: &str) -> bool {
        self.literal || self.literal_keys.iter().any(|k| k == key)
    }
}

/// Whether a Context was constructed in root mode, which additionally
/// allows marking entries literal (fixed for lifetime, inlinable at parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Root,
    Child,
}

/// A dictionary from scope-variable name (`$name`, or `self` for the root
/// scope) to its `ContextDictionary`, plus the render's `Options`.
///
/// Values are immutable once constructed; a `Context` is logically copied
/// (cheaply, since `Value` containers are `Arc`-backed) at render entry so
/// caller mutations after that point never affect an in-flight render.
#[derive(Debug, Clone)]
pub struct Context {
    scopes: ScopeMap,
    pub mode: ContextMode,
    pub options: Options,
}

/// Scope-name -> dictionary map. A thin named alias kept distinct from
/// `value::Dict` since its values are `ContextDictionary`, not `Value`.
type ScopeMap = std::collections::BTreeMap<String, ContextDictionary>;

impl Context {
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            scopes: ScopeMap::new(),
            mode: ContextMode::Child,
            options,
        }
    }

    #[must_use]
    pub fn root(options: Options) -> Self {
        Self {
            scopes: ScopeMap::new(),
            mode: ContextMode::Root,
            options,
        }
    }

    pub fn register(&mut self, scope: impl Into<String>, dict: ContextDictionary) {
        self.scopes.insert(scope.into(), dict);
    }

    #[must_use]
    pub fn scope(&self, name: &str) -> Option<&ContextDictionary> {
        self.scopes.get(name)
    }

    pub fn scope_mut(&mut self, name: &str) -> Option<&mut ContextDictionary> {
        self.scopes.get_mut(name)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.mode == ContextMode::Root
    }

    /// Looks up a root-level variable, falling through `self`'s scope.
    #[must_use]
    pub fn lookup_self(&self, key: &str) -> Option<&Value> {
        self.scope("self").and_then(|d| d.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_8859_1_rejects_out_of_range_code_points() {
        assert!(Encoding::Iso8859_1.encode("cafe").is_some());
        assert!(Encoding::Iso8859_1.encode("\u{1F600}").is_none());
    }

    #[test]
    fn utf8_encodes_multibyte_code_points() {
        assert_eq!(Encoding::Utf8.encode("\u{03C4}").unwrap(), vec![0xCF, 0x84]);
    }

    #[test]
    fn caching_default_enables_read_and_store_only() {
        assert!(Caching::DEFAULT.contains(Caching::READ));
        assert!(Caching::DEFAULT.contains(Caching::STORE));
        assert!(!Caching::DEFAULT.contains(Caching::AUTO_UPDATE));
    }

    #[test]
    fn options_clamp_timeout_to_minimum() {
        let o = Options::default().with_timeout(0.0);
        assert_eq!(o.timeout, 0.001);
    }
}
