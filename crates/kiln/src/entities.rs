//! The Entities registry: a process-wide, frozen-after-start catalog of
//! functions, methods, blocks, raw-block factories, types, and meta-blocks.
//!
//! Mirrors the fixed-vocabulary dispatch style of a builtins table (match on
//! an enum tag, one module per implementation) generalized to a registry
//! that the host can extend before the engine starts. Once started, the
//! table is immutable and reads take no lock at all.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{ParseError, RegistrationError};
use crate::expr::{Parameter, Tuple};
use crate::value::{Dict, Value, ValueType};
use crate::variable::Variable;

/// Opaque handle into one of the registry's per-kind tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Function,
    Method,
    Block,
    RawBlockFactory,
    Type,
    MetaBlock,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Block => "block",
            Self::RawBlockFactory => "raw block",
            Self::Type => "type",
            Self::MetaBlock => "meta-block",
        })
    }
}

/// A frozen reference to a specific overload, attached to a `Parameter`'s
/// `Function` variant once call-signature resolution finds exactly one
/// candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTarget {
    pub kind: EntityKind,
    pub id: EntityId,
}

/// One formal parameter of a call signature.
#[derive(Debug, Clone)]
pub struct ParamSignature {
    pub label: Option<String>,
    /// `None` means "possibly any" -- matches any argument base type.
    pub ty: Option<ValueType>,
    pub default: Option<Value>,
}

impl ParamSignature {
    #[must_use]
    pub fn positional(ty: Option<ValueType>) -> Self {
        Self { label: None, ty, default: None }
    }

    #[must_use]
    pub fn labeled(label: impl Into<String>, ty: Option<ValueType>) -> Self {
        Self { label: Some(label.into()), ty, default: None }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A call signature: an ordered list of formal parameters. Positional
/// parameters MUST precede labeled ones.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub params: Vec<ParamSignature>,
}

impl Signature {
    #[must_use]
    pub fn new(params: Vec<ParamSignature>) -> Self {
        Self { params }
    }

    fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.default.is_none()).count()
    }

    /// Two signatures are confusable iff, for every position, their type
    /// sets intersect (or either is "any") and their labels are compatible,
    /// and one signature's params form a prefix of the other's once
    /// defaults are accounted for. This is the condition the spec requires
    /// the registry to reject at registration time.
    #[must_use]
    pub fn is_confusable_with(&self, other: &Signature) -> bool {
        let n = self.params.len().min(other.params.len());
        for i in 0..n {
            let a = &self.params[i];
            let b = &other.params[i];
            let labels_compatible = match (&a.label, &b.label) {
                (None, None) => true,
                (Some(x), Some(y)) => x == y,
                _ => false,
            };
            if !labels_compatible {
                return false;
            }
            let types_intersect = match (a.ty, b.ty) {
                (None, _) | (_, None) => true,
                (Some(x), Some(y)) => x == y,
            };
            if !types_intersect {
                return false;
            }
        }
        // one must be a prefix of the other considering defaults: the
        // longer signature's extra params must all carry defaults.
        let (shorter, longer) = if self.params.len() <= other.params.len() {
            (self, other)
        } else {
            (other, self)
        };
        longer.params[shorter.params.len()..].iter().all(|p| p.default.is_some())
    }

    /// Attempts to match `tuple` against this signature using each
    /// Parameter's best-effort `baseType`. Returns a normalized tuple with
    /// defaults back-filled on success.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> Option<Tuple> {
        let positional_labels: Vec<&str> = self
            .params
            .iter()
            .filter_map(|p| p.label.as_deref())
            .collect();
        // labels used in the call must be a subset of the signature's labels
        // and must appear as a contiguous suffix (no positional arg after a
        // labeled one).
        let mut seen_label = false;
        for (idx, el) in tuple.elements.iter().enumerate() {
            let is_labeled = tuple.labels.values().any(|&i| i == idx);
            if is_labeled {
                seen_label = true;
            } else if seen_label {
                return None; // positional after labeled
            }
        }
        for label in tuple.labels.keys() {
            if !positional_labels.contains(&label.as_str()) {
                return None;
            }
        }
        if tuple.elements.len() > self.params.len() {
            return None;
        }
        if tuple.elements.len() < self.required_count() {
            return None;
        }

        // Build a call-order -> formal-index assignment: unlabeled args
        // fill formal slots left to right in formal order, skipping slots
        // claimed by a label.
        let mut claimed = vec![false; self.params.len()];
        let mut assignment: Vec<Option<usize>> = vec![None; tuple.elements.len()];
        for (label, &call_idx) in &tuple.labels {
            let Some(formal_idx) = self.params.iter().position(|p| p.label.as_deref() == Some(label.as_str())) else {
                return None;
            };
            if claimed[formal_idx] {
                return None;
            }
            claimed[formal_idx] = true;
            assignment[call_idx] = Some(formal_idx);
        }
        let mut next_positional = 0usize;
        for (call_idx, a) in assignment.iter_mut().enumerate() {
            if a.is_some() {
                continue;
            }
            while next_positional < claimed.len() && claimed[next_positional] {
                next_positional += 1;
            }
            if next_positional >= claimed.len() {
                return None;
            }
            claimed[next_positional] = true;
            *a = Some(next_positional);
            let _ = call_idx;
        }

        for (call_idx, formal_idx) in assignment.iter().enumerate() {
            let Some(formal_idx) = *formal_idx else { return None };
            let formal = &self.params[formal_idx];
            if let (Some(expected), Some(found)) = (formal.ty, tuple.elements[call_idx].base_type()) {
                if expected != found {
                    return None;
                }
            }
        }

        // back-fill defaults for unclaimed formals
        let mut out = Tuple::new();
        out.collection = tuple.collection;
        let mut ordered: Vec<Option<Parameter>> = vec![None; self.params.len()];
        for (call_idx, formal_idx) in assignment.iter().enumerate() {
            ordered[formal_idx.unwrap()] = Some(tuple.elements[call_idx].clone());
        }
        for (formal_idx, slot) in ordered.into_iter().enumerate() {
            let formal = &self.params[formal_idx];
            let param = match slot {
                Some(p) => p,
                None => Parameter::Value(formal.default.clone()?),
            };
            match &formal.label {
                Some(label) => out.push_labeled(label.clone(), param),
                None => out.push_positional(param),
            }
        }
        Some(out)
    }
}

/// Dispatch payload for a registered free function.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Dispatch payload for a registered method. Returns `(result, mutated)`;
/// `mutated` is `Some` for mutating methods, writing back to the bound
/// operand variable.
pub type MethodImpl = Arc<dyn Fn(&Value, &[Value]) -> (Value, Option<Value>) + Send + Sync>;

/// How many times a block's scope body should run this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCount {
    Discard,
    Finite(usize),
    Indefinite,
}

/// Dispatch payload for a registered block: given call arguments and the
/// scope-variable dictionary to populate, decides how many times (if any)
/// to execute its scope body.
pub type BlockImpl = Arc<dyn Fn(&[Value], &mut Dict) -> ScopeCount + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub signature: Signature,
    pub unsafe_entity: bool,
    pub implementation: FunctionImpl,
}

#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub name: String,
    pub signature: Signature,
    pub mutating: bool,
    pub implementation: MethodImpl,
}

#[derive(Clone)]
pub struct BlockEntry {
    pub name: String,
    pub signature: Signature,
    /// Names of chained-block antecedents this block may follow, e.g.
    /// `elseif`/`else` both declare `if` (and `elseif`, for `else`).
    pub antecedents: Vec<String>,
    pub implementation: BlockImpl,
}

impl fmt::Debug for BlockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockEntry")
            .field("name", &self.name)
            .field("antecedents", &self.antecedents)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RawBlockEntry {
    pub name: String,
}

/// The process-wide registry. Built up via `register_*` calls before
/// `start()` is invoked; after `start()`, all mutation is a no-op (debug
/// builds panic).
pub struct Entities {
    functions: AHashMap<String, Vec<FunctionEntry>>,
    methods: AHashMap<String, Vec<MethodEntry>>,
    blocks: AHashMap<String, Vec<BlockEntry>>,
    raw_blocks: AHashMap<String, RawBlockEntry>,
    types: AHashMap<String, ValueType>,
    started: AtomicBool,
}

impl Default for Entities {
    fn default() -> Self {
        Self::new()
    }
}

impl Entities {
    #[must_use]
    pub fn new() -> Self {
        Self {
            functions: AHashMap::new(),
            methods: AHashMap::new(),
            blocks: AHashMap::new(),
            raw_blocks: AHashMap::new(),
            types: AHashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Freezes the registry; after this, `register_*` calls fail.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn check_mutable(&self) -> Result<(), RegistrationError> {
        if self.is_started() {
            debug_assert!(false, "attempted to register an entity after the engine started");
            return Err(RegistrationError::EngineAlreadyStarted);
        }
        Ok(())
    }

    fn valid_name(name: &str) -> bool {
        Variable::is_valid_identifier_part(name)
    }

    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        implementation: FunctionImpl,
    ) -> Result<EntityId, RegistrationError> {
        self.check_mutable()?;
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        if self.methods.get(&name).is_some_and(|v| v.iter().any(|m| m.mutating)) {
            return Err(RegistrationError::MutatingMethodAsFunction(name));
        }
        let bucket = self.functions.entry(name.clone()).or_default();
        for existing in bucket.iter() {
            if existing.signature.is_confusable_with(&signature) {
                return Err(RegistrationError::Confusable { name, with: existing.name.clone() });
            }
        }
        let id = EntityId(u32::try_from(bucket.len()).expect("fewer than u32::MAX overloads"));
        bucket.push(FunctionEntry {
            name,
            signature,
            unsafe_entity: false,
            implementation,
        });
        Ok(id)
    }

    pub fn register_unsafe_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        implementation: FunctionImpl,
    ) -> Result<EntityId, RegistrationError> {
        let name = name.into();
        let id = self.register_function(name.clone(), signature, implementation)?;
        if let Some(bucket) = self.functions.get_mut(&name) {
            if let Some(entry) = bucket.get_mut(id.0 as usize) {
                entry.unsafe_entity = true;
            }
        }
        Ok(id)
    }

    pub fn register_method(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        mutating: bool,
        implementation: MethodImpl,
    ) -> Result<EntityId, RegistrationError> {
        self.check_mutable()?;
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        let bucket = self.methods.entry(name.clone()).or_default();
        for existing in bucket.iter() {
            if existing.signature.is_confusable_with(&signature) {
                return Err(RegistrationError::Confusable { name, with: existing.name.clone() });
            }
        }
        let id = EntityId(u32::try_from(bucket.len()).expect("fewer than u32::MAX overloads"));
        bucket.push(MethodEntry {
            name,
            signature,
            mutating,
            implementation,
        });
        Ok(id)
    }

    pub fn register_block(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        antecedents: Vec<String>,
        implementation: BlockImpl,
    ) -> Result<EntityId, RegistrationError> {
        self.check_mutable()?;
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        let bucket = self.blocks.entry(name.clone()).or_default();
        let id = EntityId(u32::try_from(bucket.len()).expect("fewer than u32::MAX overloads"));
        bucket.push(BlockEntry {
            name,
            signature,
            antecedents,
            implementation,
        });
        Ok(id)
    }

    pub fn register_raw_block(&mut self, name: impl Into<String>) -> Result<(), RegistrationError> {
        self.check_mutable()?;
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        self.raw_blocks.insert(name.clone(), RawBlockEntry { name });
        Ok(())
    }

    pub fn register_type(&mut self, name: impl Into<String>, ty: ValueType) -> Result<(), RegistrationError> {
        self.check_mutable()?;
        let name = name.into();
        if !Self::valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        self.types.insert(name, ty);
        Ok(())
    }

    #[must_use]
    pub fn function(&self, id: EntityId, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)?.get(id.0 as usize)
    }

    #[must_use]
    pub fn method(&self, id: EntityId, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)?.get(id.0 as usize)
    }

    #[must_use]
    pub fn block(&self, id: EntityId, name: &str) -> Option<&BlockEntry> {
        self.blocks.get(name)?.get(id.0 as usize)
    }

    #[must_use]
    pub fn block_named(&self, name: &str) -> Option<&[BlockEntry]> {
        self.blocks.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn is_raw_block(&self, name: &str) -> bool {
        self.raw_blocks.contains_key(name)
    }

    fn validate_call(
        &self,
        kind: EntityKind,
        name: &str,
        tuple: &Tuple,
        candidates: &[(Signature, String)],
    ) -> Result<Vec<(EntityId, Tuple)>, ParseError> {
        let mut matches = Vec::new();
        for (idx, (sig, _)) in candidates.iter().enumerate() {
            if let Some(normalized) = sig.matches(tuple) {
                matches.push((EntityId(u32::try_from(idx).unwrap()), normalized));
            }
        }
        if matches.is_empty() {
            let sigs: Vec<&str> = candidates.iter().map(|(_, n)| n.as_str()).collect();
            return Err(ParseError::new(
                format!("no matching {kind} overload for `{name}` (candidates: {})", sigs.join(", ")),
                None,
            ));
        }
        Ok(matches)
    }

    /// Validates a free-function call, returning every overload the call
    /// shape matches (the parser freezes the call if exactly one matches).
    pub fn validate_function(&self, name: &str, tuple: &Tuple) -> Result<Vec<(EntityId, Tuple)>, ParseError> {
        let bucket = self
            .functions
            .get(name)
            .ok_or_else(|| ParseError::new(format!("unknown function `{name}`"), None))?;
        let candidates: Vec<_> = bucket.iter().map(|e| (e.signature.clone(), e.name.clone())).collect();
        self.validate_call(EntityKind::Function, name, tuple, &candidates)
    }

    pub fn validate_method(&self, name: &str, tuple: &Tuple) -> Result<Vec<(EntityId, Tuple)>, ParseError> {
        let bucket = self
            .methods
            .get(name)
            .ok_or_else(|| ParseError::new(format!("unknown method `{name}`"), None))?;
        let candidates: Vec<_> = bucket.iter().map(|e| (e.signature.clone(), e.name.clone())).collect();
        self.validate_call(EntityKind::Method, name, tuple, &candidates)
    }

    pub fn validate_block(&self, name: &str, tuple: &Tuple) -> Result<Vec<(EntityId, Tuple)>, ParseError> {
        let bucket = self
            .blocks
            .get(name)
            .ok_or_else(|| ParseError::new(format!("unknown block `{name}`"), None))?;
        let candidates: Vec<_> = bucket.iter().map(|e| (e.signature.clone(), e.name.clone())).collect();
        self.validate_call(EntityKind::Block, name, tuple, &candidates)
    }

    pub fn validate_raw(&self, name: &str) -> Result<(), ParseError> {
        if self.is_raw_block(name) {
            Ok(())
        } else {
            Err(ParseError::new(format!("unknown raw block handler `{name}`"), None))
        }
    }

    pub fn validate_tuple_call(&self, tuple: &Tuple, signature: &Signature) -> Result<Tuple, ParseError> {
        signature
            .matches(tuple)
            .ok_or_else(|| ParseError::new("call arguments do not match signature", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(params: Vec<ParamSignature>) -> Signature {
        Signature::new(params)
    }

    #[test]
    fn confusable_signatures_are_rejected() {
        let mut e = Entities::new();
        e.register_function(
            "f",
            sig(vec![ParamSignature::positional(Some(ValueType::Int))]),
            Arc::new(|_| Value::Void),
        )
        .unwrap();
        let err = e
            .register_function(
                "f",
                sig(vec![ParamSignature::positional(None)]),
                Arc::new(|_| Value::Void),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Confusable { .. }));
    }

    #[test]
    fn disjoint_type_overloads_are_not_confusable() {
        let mut e = Entities::new();
        e.register_function(
            "f",
            sig(vec![ParamSignature::positional(Some(ValueType::Int))]),
            Arc::new(|_| Value::Void),
        )
        .unwrap();
        assert!(e
            .register_function(
                "f",
                sig(vec![ParamSignature::positional(Some(ValueType::String))]),
                Arc::new(|_| Value::Void),
            )
            .is_ok());
    }

    #[test]
    fn mutating_method_cannot_double_as_function() {
        let mut e = Entities::new();
        e.register_method(
            "append",
            sig(vec![ParamSignature::positional(None)]),
            true,
            Arc::new(|v, _| (v.clone(), Some(v.clone()))),
        )
        .unwrap();
        let err = e
            .register_function(
                "append",
                sig(vec![ParamSignature::positional(None)]),
                Arc::new(|_| Value::Void),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::MutatingMethodAsFunction(_)));
    }

    #[test]
    fn registration_after_start_is_rejected() {
        let mut e = Entities::new();
        e.start();
        let err = e
            .register_function("f", sig(vec![]), Arc::new(|_| Value::Void))
            .unwrap_err();
        assert_eq!(err, RegistrationError::EngineAlreadyStarted);
    }

    #[test]
    fn labeled_suffix_rule_rejects_positional_after_labeled() {
        let signature = sig(vec![
            ParamSignature::positional(Some(ValueType::Int)),
            ParamSignature::labeled("as", Some(ValueType::String)),
        ]);
        let mut t = Tuple::new();
        t.push_labeled("as", Parameter::Value(Value::string("x")));
        t.push_positional(Parameter::Value(Value::Int(1)));
        assert!(signature.matches(&t).is_none());
    }

    #[test]
    fn defaults_back_fill_missing_labeled_argument() {
        let signature = sig(vec![
            ParamSignature::positional(Some(ValueType::Int)),
            ParamSignature::labeled("as", Some(ValueType::String)).with_default(Value::string("template")),
        ]);
        let mut t = Tuple::new();
        t.push_positional(Parameter::Value(Value::Int(1)));
        let normalized = signature.matches(&t).unwrap();
        assert_eq!(normalized.elements.len(), 2);
        assert!(matches!(&normalized.elements[1], Parameter::Value(Value::String(s)) if &**s == "template"));
    }
}
