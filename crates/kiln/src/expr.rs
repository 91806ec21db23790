//! Expression-level AST nodes: `Parameter`, `Expression`, `Tuple`, and
//! function/method call nodes.
//!
//! The spec describes `Expression` as "a 2- or 3-element vector of
//! Parameters tagged with a form". We represent the same semantics as a
//! Rust enum with named fields instead of a raw tagged vector -- the
//! vector-plus-tag shape is how a dynamically typed host language would
//! encode this; a statically typed enum is the idiomatic equivalent and
//! makes illegal shapes (a 4-element "ternary", a bodyless assignment)
//! unrepresentable. See `DESIGN.md` for the record of this choice.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::entities::CallTarget;
use crate::operator::Operator;
use crate::value::{Value, ValueType};
use crate::variable::{Keyword, Variable};

/// A leaf or near-leaf AST node at expression position.
#[derive(Debug, Clone)]
pub enum Parameter {
    Value(Value),
    Keyword(Keyword),
    Operator(Operator),
    Variable(Variable),
    Expression(Box<Expression>),
    Tuple(Box<Tuple>),
    Function(Box<FunctionCall>),
}

impl Parameter {
    /// A literal is a `Parameter` whose value never depends on context --
    /// a bare `Value` or a keyword that evaluates directly (`true`, `nil`,
    /// ...). Used by the parser to decide whether a root-context literal
    /// can be inlined at parse time.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        match self {
            Self::Value(_) => true,
            Self::Keyword(k) => k.is_evaluable(),
            Self::Tuple(t) => t.elements.iter().all(Parameter::is_literal),
            _ => false,
        }
    }

    /// `true` if this parameter's shape is fully known at parse time
    /// (no context-dependent lookups of any kind, including nested ones).
    #[must_use]
    pub fn is_invariant(&self) -> bool {
        match self {
            Self::Value(_) | Self::Keyword(_) | Self::Operator(_) => true,
            Self::Variable(_) => false,
            Self::Expression(e) => e.is_invariant(),
            Self::Tuple(t) => t.elements.iter().all(Parameter::is_invariant),
            Self::Function(f) => matches!(f.resolved, CallResolution::Frozen(_)) && f.args.elements.iter().all(Parameter::is_invariant),
        }
    }

    /// Best-effort static type, used by call-signature resolution to treat
    /// an untypeable parameter as "possibly any".
    #[must_use]
    pub fn base_type(&self) -> Option<ValueType> {
        match self {
            Self::Value(v) => Some(v.stored_type()),
            Self::Keyword(k) if k.is_boolean_valued() => Some(ValueType::Bool),
            Self::Tuple(t) if t.collection => {
                if t.labels.is_empty() {
                    Some(ValueType::Array)
                } else {
                    Some(ValueType::Dictionary)
                }
            }
            _ => None,
        }
    }

    /// Collects every root identifier this parameter (transitively) reads,
    /// used to populate `AST::Info::required_variables`.
    pub fn collect_required_variables(&self, out: &mut HashSet<String>) {
        match self {
            Self::Variable(v) if !v.define_namespace => {
                out.insert(v.ancestor().to_owned());
            }
            Self::Variable(_) | Self::Value(_) | Self::Keyword(_) | Self::Operator(_) => {}
            Self::Expression(e) => e.collect_required_variables(out),
            Self::Tuple(t) => {
                for el in &t.elements {
                    el.collect_required_variables(out);
                }
            }
            Self::Function(f) => {
                match &f.operand {
                    CallOperand::MutatingMethod(v) => {
                        out.insert(v.ancestor().to_owned());
                    }
                    CallOperand::Method(receiver) => receiver.collect_required_variables(out),
                    CallOperand::Free => {}
                }
                for el in &f.args.elements {
                    el.collect_required_variables(out);
                }
            }
        }
    }
}

/// The syntactic shape of an [`Expression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Calculation,
    Assignment,
    Ternary,
    Custom,
}

/// A 2- or 3-operand expression node. Infix/prefix/postfix operator shape
/// is tracked on the `Calculation` variant rather than as a separate flag,
/// per the spec's note that these are "tracked separately as operator-form".
#[derive(Debug, Clone)]
pub enum Expression {
    Infix {
        left: Parameter,
        op: Operator,
        right: Parameter,
    },
    Prefix {
        op: Operator,
        operand: Parameter,
    },
    Postfix {
        operand: Parameter,
        op: Operator,
    },
    Assignment {
        target: Variable,
        op: Operator,
        value: Parameter,
    },
    Ternary {
        condition: Parameter,
        then: Parameter,
        otherwise: Parameter,
    },
    /// `var`/`let` decay to this node, carrying the declaring keyword.
    Declaration {
        keyword: Keyword,
        target: Variable,
        value: Option<Parameter>,
    },
}

impl Expression {
    #[must_use]
    pub fn form(&self) -> Form {
        match self {
            Self::Infix { .. } | Self::Prefix { .. } | Self::Postfix { .. } => Form::Calculation,
            Self::Assignment { .. } => Form::Assignment,
            Self::Ternary { .. } => Form::Ternary,
            Self::Declaration { .. } => Form::Custom,
        }
    }

    fn is_invariant(&self) -> bool {
        match self {
            Self::Infix { left, right, .. } => left.is_invariant() && right.is_invariant(),
            Self::Prefix { operand, .. } => operand.is_invariant(),
            Self::Postfix { operand, .. } => operand.is_invariant(),
            Self::Assignment { .. } | Self::Declaration { .. } => false,
            Self::Ternary { condition, then, otherwise } => {
                condition.is_invariant() && then.is_invariant() && otherwise.is_invariant()
            }
        }
    }

    pub fn collect_required_variables(&self, out: &mut HashSet<String>) {
        match self {
            Self::Infix { left, right, .. } => {
                left.collect_required_variables(out);
                right.collect_required_variables(out);
            }
            Self::Prefix { operand, .. } | Self::Postfix { operand, .. } => {
                operand.collect_required_variables(out);
            }
            Self::Assignment { target, value, .. } => {
                out.insert(target.ancestor().to_owned());
                value.collect_required_variables(out);
            }
            Self::Ternary { condition, then, otherwise } => {
                condition.collect_required_variables(out);
                then.collect_required_variables(out);
                otherwise.collect_required_variables(out);
            }
            Self::Declaration { value, .. } => {
                if let Some(v) = value {
                    v.collect_required_variables(out);
                }
            }
        }
    }
}

/// An ordered sequence of `Parameter`s plus an optional label for each,
/// used both for call argument lists and for array/dictionary literals.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    pub elements: Vec<Parameter>,
    /// label -> index into `elements`.
    pub labels: IndexMap<String, usize>,
    /// `true` for `[...]`/`[:]` literal syntax.
    pub collection: bool,
}

impl Tuple {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn positional(elements: Vec<Parameter>) -> Self {
        Self {
            elements,
            labels: IndexMap::new(),
            collection: false,
        }
    }

    pub fn push_positional(&mut self, p: Parameter) {
        self.elements.push(p);
    }

    pub fn push_labeled(&mut self, label: impl Into<String>, p: Parameter) {
        let idx = self.elements.len();
        self.elements.push(p);
        self.labels.insert(label.into(), idx);
    }

    #[must_use]
    pub fn get_labeled(&self, label: &str) -> Option<&Parameter> {
        self.labels.get(label).map(|&i| &self.elements[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// A tuple is evaluable iff every element is already a concrete value
    /// (no unresolved Variable/Function/Expression) and either all
    /// elements are labeled (dictionary) or none are (array).
    #[must_use]
    pub fn is_evaluable(&self) -> bool {
        let all_valued = self.elements.iter().all(|p| matches!(p, Parameter::Value(_)));
        let all_labeled = self.labels.len() == self.elements.len();
        all_valued && (all_labeled || self.labels.is_empty())
    }

    /// Evaluates a collection literal whose elements are all already
    /// concrete `Value`s (see [`Tuple::is_evaluable`]) into a `Value`.
    #[must_use]
    pub fn to_literal_value(&self) -> Option<Value> {
        if !self.is_evaluable() {
            return None;
        }
        if self.labels.is_empty() {
            let items = self
                .elements
                .iter()
                .map(|p| match p {
                    Parameter::Value(v) => v.clone(),
                    _ => unreachable!("checked by is_evaluable"),
                })
                .collect();
            Some(Value::array(items))
        } else {
            let mut dict = crate::value::Dict::default();
            for (label, &idx) in &self.labels {
                if let Parameter::Value(v) = &self.elements[idx] {
                    dict.insert(label.clone(), v.clone());
                }
            }
            Some(Value::dictionary(dict))
        }
    }
}

/// How a [`FunctionCall`] is invoked.
#[derive(Debug, Clone)]
pub enum CallOperand {
    /// A free function call, `len(x)`.
    Free,
    /// A non-mutating method call, `x.upper()`. Carries the receiver
    /// expression directly since it need not be an lvalue.
    Method(Box<Parameter>),
    /// A mutating method call on a bound variable, `x.append(1)`. The
    /// receiver must be an lvalue so the serializer can write the mutated
    /// result back.
    MutatingMethod(Variable),
}

/// The outcome of call-signature resolution at parse time.
#[derive(Debug, Clone)]
pub enum CallResolution {
    /// Exactly one overload matched; frozen to a specific implementation.
    Frozen(CallTarget),
    /// More than one candidate matched; resolved at serialize time.
    Dynamic,
}

/// A function or method call node.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: Arc<str>,
    pub args: Tuple,
    pub operand: CallOperand,
    pub resolved: CallResolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_tuple_becomes_array_value() {
        let mut t = Tuple::new();
        t.collection = true;
        t.push_positional(Parameter::Value(Value::Int(1)));
        t.push_positional(Parameter::Value(Value::Int(2)));
        let v = t.to_literal_value().unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
    }

    #[test]
    fn labeled_tuple_becomes_dictionary_value() {
        let mut t = Tuple::new();
        t.collection = true;
        t.push_labeled("a", Parameter::Value(Value::Int(1)));
        let v = t.to_literal_value().unwrap();
        assert_eq!(v.as_dictionary().unwrap().get("a").unwrap().as_int(), Some(1));
    }

    #[test]
    fn mixed_labeled_and_positional_is_not_evaluable_as_collection() {
        let mut t = Tuple::new();
        t.push_positional(Parameter::Value(Value::Int(1)));
        t.push_labeled("a", Parameter::Value(Value::Int(2)));
        assert!(!t.is_evaluable());
    }

    #[test]
    fn required_variables_are_collected_transitively() {
        let expr = Expression::Infix {
            left: Parameter::Variable(Variable::new(vec!["a".into()])),
            op: Operator::Add,
            right: Parameter::Variable(Variable::new(vec!["b".into()])),
        };
        let mut out = HashSet::new();
        expr.collect_required_variables(&mut out);
        assert!(out.contains("a") && out.contains("b"));
    }
}
