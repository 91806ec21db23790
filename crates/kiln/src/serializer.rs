//! The Serializer: a non-recursive, single-threaded interpreter over an
//! `Ast`'s scope tables.
//!
//! The main loop walks a stack of `Frame`s instead of recursing into the
//! AST, so render depth never grows the host stack: a table that wants to
//! run again (a loop body, a block with more than one scope count) simply
//! resets its own cursor rather than re-entering `execute` one level
//! deeper. A `VariableStack` frame and, for `#raw` blocks, an output buffer
//! are pushed alongside each scope frame and popped back in lock-step when
//! the frame closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::context::Context;
use crate::entities::{CallTarget, EntityId, EntityKind, Entities, ScopeCount};
use crate::error::SerializeError;
use crate::expr::{CallOperand, CallResolution, Expression, FunctionCall, Parameter, Tuple};
use crate::operator::Operator;
use crate::source::Source;
use crate::syntax::{Ast, BlockInstance, ScopeRef, Syntax, TableIndex};
use crate::value::{Dict, Value, TRUE_NIL};
use crate::variable::{Keyword, Variable};
use crate::varstack::VariableStack;

/// Loop iterations between deadline samples.
const TICK_SAMPLE_INTERVAL: u32 = 256;

/// Renders `ast` against `context`, fetching any non-embedded inline raw
/// dependency through `source`.
pub fn serialize(ast: &Ast, entities: &Entities, context: &Context, source: &dyn Source) -> Result<Vec<u8>, SerializeError> {
    let mut engine = Engine::new(ast, entities, context, source);
    engine.run()?;
    Ok(engine.output())
}

/// A call frozen for every repeat pass of a block's scope body: the
/// formal args are evaluated once against the variable stack, then the
/// same values are handed back to the implementation on each subsequent
/// pass to refill the scope-variable dictionary. See `DESIGN.md` for why
/// this collapses the spec's `evaluateScope`/`reEvaluateScope` split into
/// one reinvocation path.
struct BlockReinvoke {
    id: EntityId,
    name: String,
    args: Vec<Value>,
}

/// How many more passes a `FrameKind::Block` owes after the one currently
/// running. The engine, not the block implementation, owns this count: a
/// stateless implementation (e.g. `if`) returns the same `ScopeCount`
/// every time it's called, so a `Finite` total is decided once and
/// decremented here rather than trusted from a re-invocation.
enum BlockRemaining {
    Finite(usize),
    Indefinite,
}

enum FrameKind {
    /// The AST's root table.
    Root,
    /// A body that runs its table exactly once: an `if`/`elseif`/`else`
    /// body, a `#raw` body, an inline-template jump, an `#evaluate` jump.
    Once,
    ForLoop { binding: String, items: Vec<Value>, index: usize },
    Block { reinvoke: BlockReinvoke, remaining: BlockRemaining },
}

/// What a `#define` registered in the frame it was encountered in.
#[derive(Clone)]
enum DefineRecord {
    Scope(TableIndex),
    Expr(Parameter),
}

/// One entry on the non-recursive scope stack.
struct Frame {
    table: TableIndex,
    pos: usize,
    kind: FrameKind,
    /// `true` once some sibling in this table's `if`/`elseif`/`else` chain
    /// has already run; reset to `false` whenever a fresh `if` is seen.
    chain_hit: bool,
    owns_var_frame: bool,
    owns_buffer: bool,
    defines: AHashMap<String, DefineRecord>,
}

impl Frame {
    fn child(table: TableIndex, kind: FrameKind) -> Self {
        Self {
            table,
            pos: 0,
            kind,
            chain_hit: false,
            owns_var_frame: true,
            owns_buffer: false,
            defines: AHashMap::new(),
        }
    }
}

struct Engine<'a> {
    ast: &'a Ast,
    entities: &'a Entities,
    source: &'a dyn Source,
    vars: VariableStack<'a>,
    scopes: Vec<Frame>,
    buffers: Vec<Vec<u8>>,
    deadline: Instant,
    ticks: u32,
    missing_variable_throws: bool,
}

impl<'a> Engine<'a> {
    fn new(ast: &'a Ast, entities: &'a Entities, context: &'a Context, source: &'a dyn Source) -> Self {
        let timeout = Duration::from_secs_f64(context.options.timeout);
        Self {
            ast,
            entities,
            source,
            vars: VariableStack::new(context),
            scopes: vec![Frame {
                table: 0,
                pos: 0,
                kind: FrameKind::Root,
                chain_hit: false,
                owns_var_frame: false,
                owns_buffer: false,
                defines: AHashMap::new(),
            }],
            buffers: vec![Vec::new()],
            deadline: Instant::now() + timeout,
            ticks: 0,
            missing_variable_throws: context.options.missing_variable_throws,
        }
    }

    fn output(mut self) -> Vec<u8> {
        self.buffers.pop().unwrap_or_default()
    }

    // -- main loop ---------------------------------------------------

    fn run(&mut self) -> Result<(), SerializeError> {
        loop {
            self.sample_deadline()?;
            if self.scopes.is_empty() {
                break;
            }
            let (table, pos) = {
                let frame = self.scopes.last().expect("checked non-empty above");
                (frame.table, frame.pos)
            };
            if pos >= self.ast.tables[table].len() {
                self.end_of_table()?;
                continue;
            }
            let node = self.ast.tables[table][pos].clone();
            self.scopes.last_mut().expect("checked non-empty above").pos += 1;
            self.execute(&node)?;
        }
        Ok(())
    }

    fn sample_deadline(&mut self) -> Result<(), SerializeError> {
        self.ticks += 1;
        if self.ticks >= TICK_SAMPLE_INTERVAL {
            self.ticks = 0;
            if Instant::now() >= self.deadline {
                return Err(SerializeError::Timeout);
            }
        }
        Ok(())
    }

    fn close_frame(&mut self) {
        let frame = self.scopes.pop().expect("close_frame called with a frame present");
        if frame.owns_var_frame {
            self.vars.pop_frame();
        }
        if frame.owns_buffer {
            let finished = self.buffers.pop().expect("buffer pushed for this frame");
            self.buffers.last_mut().expect("parent buffer always present").extend_from_slice(&finished);
        }
    }

    fn end_of_table(&mut self) -> Result<(), SerializeError> {
        let kind = std::mem::replace(&mut self.scopes.last_mut().expect("non-empty").kind, FrameKind::Once);
        match kind {
            FrameKind::Root | FrameKind::Once => self.close_frame(),
            FrameKind::ForLoop { binding, items, mut index } => {
                index += 1;
                if index < items.len() {
                    let next = items[index].clone();
                    self.vars.assign(&binding, next);
                    let frame = self.scopes.last_mut().expect("non-empty");
                    frame.pos = 0;
                    frame.kind = FrameKind::ForLoop { binding, items, index };
                } else {
                    self.close_frame();
                }
            }
            FrameKind::Block { reinvoke, remaining } => self.repeat_block(reinvoke, remaining)?,
        }
        Ok(())
    }

    /// Starts the next pass of a block's scope body, or closes the frame
    /// once the remaining-pass count the engine is tracking runs out.
    ///
    /// A `Finite` total was already decided by the initial
    /// `evaluateScope` call in `enter_block`; here the implementation is
    /// re-invoked only to refill the scope-variable dictionary for the
    /// next pass (the spec's `reEvaluateScope`), and its returned count is
    /// ignored for `Finite` remainders -- per spec §4.5, a finite pass
    /// count is decided once, not re-derived from a closure that may
    /// return the same value on every call. An `Indefinite` block has no
    /// known total, so it alone is asked again each pass whether to stop.
    fn repeat_block(&mut self, reinvoke: BlockReinvoke, remaining: BlockRemaining) -> Result<(), SerializeError> {
        match remaining {
            BlockRemaining::Finite(0) => {
                self.close_frame();
                Ok(())
            }
            BlockRemaining::Finite(left) => {
                let entities = self.entities;
                let Some(entry) = entities.block(reinvoke.id, &reinvoke.name) else {
                    self.close_frame();
                    return Ok(());
                };
                let mut dict = Dict::default();
                let _ = (entry.implementation)(&reinvoke.args, &mut dict);
                self.refill_block_pass(&dict);
                let frame = self.scopes.last_mut().expect("non-empty");
                frame.pos = 0;
                frame.kind = FrameKind::Block { reinvoke, remaining: BlockRemaining::Finite(left - 1) };
                Ok(())
            }
            BlockRemaining::Indefinite => {
                let entities = self.entities;
                let Some(entry) = entities.block(reinvoke.id, &reinvoke.name) else {
                    self.close_frame();
                    return Ok(());
                };
                let mut dict = Dict::default();
                let count = (entry.implementation)(&reinvoke.args, &mut dict);
                let next = match count {
                    ScopeCount::Discard | ScopeCount::Finite(0) => None,
                    ScopeCount::Finite(n) => Some(BlockRemaining::Finite(n - 1)),
                    ScopeCount::Indefinite => Some(BlockRemaining::Indefinite),
                };
                match next {
                    None => self.close_frame(),
                    Some(remaining) => {
                        self.refill_block_pass(&dict);
                        let frame = self.scopes.last_mut().expect("non-empty");
                        frame.pos = 0;
                        frame.kind = FrameKind::Block { reinvoke, remaining };
                    }
                }
                Ok(())
            }
        }
    }

    /// Swaps in a fresh variable frame carrying `dict`'s scope variables
    /// for the pass about to run.
    fn refill_block_pass(&mut self, dict: &Dict) {
        self.vars.pop_frame();
        self.vars.push_frame();
        self.declare_dict(dict);
    }

    fn declare_dict(&mut self, dict: &Dict) {
        for (k, v) in dict {
            self.vars.declare(k.clone(), v.clone());
        }
    }

    // -- statement dispatch --------------------------------------------

    fn execute(&mut self, node: &Syntax) -> Result<(), SerializeError> {
        match node {
            Syntax::Raw(s) => {
                self.append_bytes(s.as_bytes());
                Ok(())
            }
            Syntax::Passthrough(p) => {
                let v = self.eval(p)?;
                self.append_value(&v)
            }
            Syntax::Expr(e) => {
                self.eval_expression(e)?;
                Ok(())
            }
            Syntax::Block(b) => self.enter_block(b),
            Syntax::InlineTemplate { scope, .. } => match scope {
                ScopeRef::Table(idx) => {
                    self.vars.push_frame();
                    self.scopes.push(Frame::child(*idx, FrameKind::Once));
                    Ok(())
                }
                ScopeRef::Nil => Err(SerializeError::Custom("inline template was never resolved".to_string())),
                ScopeRef::Atomic => Ok(()),
            },
            Syntax::InlineRaw { name, embedded, .. } => self.append_inline_raw(name, *embedded),
            Syntax::ForLoop { binding, iterable, scope } => self.enter_for_loop(binding, iterable, scope),
            Syntax::Define { id, scope, expr } => {
                self.record_define(id, scope, expr);
                Ok(())
            }
            Syntax::Evaluate { id, default } => self.enter_evaluate(id, default),
            Syntax::RawBlock { scope, .. } => match scope {
                ScopeRef::Table(idx) => {
                    self.vars.push_frame();
                    self.buffers.push(Vec::new());
                    let mut frame = Frame::child(*idx, FrameKind::Once);
                    frame.owns_buffer = true;
                    self.scopes.push(frame);
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        self.buffers.last_mut().expect("root buffer always present").extend_from_slice(bytes);
    }

    fn append_value(&mut self, v: &Value) -> Result<(), SerializeError> {
        if v.is_errored() {
            if self.missing_variable_throws {
                return Err(SerializeError::Custom(v.error_message().unwrap_or("errored value").to_string()));
            }
            return Ok(());
        }
        if v.is_nil() || matches!(v, Value::Void) {
            return Ok(());
        }
        let rendered = v.render();
        let encoding = self.vars.context().options.encoding;
        let bytes = encoding
            .encode(&rendered)
            .ok_or_else(|| SerializeError::EncodingFailure(rendered.clone()))?;
        self.append_bytes(&bytes);
        Ok(())
    }

    fn append_inline_raw(&mut self, name: &str, embedded: bool) -> Result<(), SerializeError> {
        let bytes = if embedded {
            self.ast
                .inlined_raw
                .get(name)
                .cloned()
                .ok_or_else(|| SerializeError::MissingRaw(name.to_string()))?
        } else {
            self.source
                .file(name, false)
                .map_err(|e| SerializeError::Custom(e.to_string()))?
                .bytes
        };
        self.append_bytes(&bytes);
        Ok(())
    }

    fn enter_for_loop(&mut self, binding: &str, iterable: &Parameter, scope: &ScopeRef) -> Result<(), SerializeError> {
        let ScopeRef::Table(table) = *scope else { return Ok(()) };
        let iter_val = self.eval(iterable)?;
        let items: Vec<Value> = match iter_val {
            Value::Array(a) => a.to_vec(),
            Value::Dictionary(d) => d.values().cloned().collect(),
            Value::Void | Value::Nil(_) => Vec::new(),
            other => {
                return Err(SerializeError::TypeMismatch {
                    expected: "array or dictionary".to_string(),
                    found: other.stored_type().to_string(),
                })
            }
        };
        if items.is_empty() {
            return Ok(());
        }
        self.vars.push_frame();
        self.vars.declare(binding.to_string(), items[0].clone());
        self.scopes.push(Frame::child(
            table,
            FrameKind::ForLoop { binding: binding.to_string(), items, index: 0 },
        ));
        Ok(())
    }

    fn record_define(&mut self, id: &str, scope: &ScopeRef, expr: &Option<Parameter>) {
        let record = match scope {
            ScopeRef::Table(t) => DefineRecord::Scope(*t),
            _ => DefineRecord::Expr(expr.clone().unwrap_or(Parameter::Value(TRUE_NIL))),
        };
        self.scopes.last_mut().expect("non-empty").defines.insert(id.to_string(), record);
    }

    /// Finds the nearest enclosing `#define(id)`, searching frames
    /// top-down the way `VariableStack` searches for an existing local
    /// binding on assignment.
    fn resolve_define(&self, id: &str) -> Option<DefineRecord> {
        self.scopes.iter().rev().find_map(|f| f.defines.get(id).cloned())
    }

    fn enter_evaluate(&mut self, id: &str, default: &Option<Parameter>) -> Result<(), SerializeError> {
        match self.resolve_define(id) {
            Some(DefineRecord::Scope(table)) => {
                self.vars.push_frame();
                self.scopes.push(Frame::child(table, FrameKind::Once));
                Ok(())
            }
            Some(DefineRecord::Expr(p)) => {
                let v = self.eval(&p)?.resolve();
                if (v.is_nil() || v.is_errored()) && default.is_some() {
                    let dv = self.eval(default.as_ref().expect("checked above"))?;
                    return self.append_value(&dv);
                }
                self.append_value(&v)
            }
            None => match default {
                Some(p) => {
                    let v = self.eval(p)?;
                    self.append_value(&v)
                }
                None if self.missing_variable_throws => {
                    Err(SerializeError::Custom(format!("no `#define({id})` is in scope")))
                }
                None => Ok(()),
            },
        }
    }

    /// The expression-position counterpart to `#evaluate(id ?? default)`:
    /// used when a call to the free function `evaluate` appears nested
    /// inside another expression, e.g. `#if(evaluate(x ?? false))`. Shares
    /// the same define-lookup and nil-coalescing default as the statement
    /// form, just returns a `Value` instead of appending to output.
    fn eval_define_expr(&mut self, id: &str, default: Option<&Parameter>) -> Result<Value, SerializeError> {
        match self.resolve_define(id) {
            Some(DefineRecord::Expr(p)) => {
                let v = self.eval(&p)?.resolve();
                if (v.is_nil() || v.is_errored()) && default.is_some() {
                    return self.eval(default.expect("checked above"));
                }
                Ok(v)
            }
            Some(DefineRecord::Scope(_)) => match default {
                Some(d) => self.eval(d),
                None => Err(SerializeError::Custom(format!("`{id}` is a scope `#define` and has no expression value"))),
            },
            None => match default {
                Some(d) => self.eval(d),
                None if self.missing_variable_throws => {
                    Err(SerializeError::Custom(format!("no `#define({id})` is in scope")))
                }
                None => Ok(TRUE_NIL),
            },
        }
    }

    fn enter_block(&mut self, b: &BlockInstance) -> Result<(), SerializeError> {
        let is_continuation = matches!(b.name.as_str(), "elseif" | "else");
        if is_continuation && self.scopes.last().expect("non-empty").chain_hit {
            return Ok(());
        }
        if b.name == "if" {
            self.scopes.last_mut().expect("non-empty").chain_hit = false;
        }
        let args_tuple = match &b.params {
            Some(t) => self.eval_tuple_to_values(t)?,
            None => Tuple::new(),
        };
        let (id, normalized) = self.resolve_block(&b.name, &b.target, &args_tuple)?;
        let args = tuple_values(&normalized);
        let entities = self.entities;
        let entry = entities.block(id, &b.name).ok_or_else(|| SerializeError::UnknownFunction(b.name.clone()))?;
        let mut dict = Dict::default();
        let count = (entry.implementation)(&args, &mut dict);
        self.start_block_body(b, count, dict, BlockReinvoke { id, name: b.name.clone(), args })
    }

    fn start_block_body(
        &mut self,
        b: &BlockInstance,
        count: ScopeCount,
        dict: Dict,
        reinvoke: BlockReinvoke,
    ) -> Result<(), SerializeError> {
        if matches!(count, ScopeCount::Discard | ScopeCount::Finite(0)) {
            return Ok(());
        }
        let remaining = match count {
            ScopeCount::Discard | ScopeCount::Finite(0) => unreachable!("handled above"),
            ScopeCount::Finite(n) => BlockRemaining::Finite(n - 1),
            ScopeCount::Indefinite => BlockRemaining::Indefinite,
        };
        self.scopes.last_mut().expect("non-empty").chain_hit = true;
        match b.scope {
            ScopeRef::Nil => Ok(()),
            ScopeRef::Atomic => {
                if let Some(body) = &b.atomic_body {
                    self.vars.push_frame();
                    self.declare_dict(&dict);
                    let body = (**body).clone();
                    self.execute(&body)?;
                    self.vars.pop_frame();
                }
                Ok(())
            }
            ScopeRef::Table(table) => {
                self.vars.push_frame();
                self.declare_dict(&dict);
                self.scopes.push(Frame::child(table, FrameKind::Block { reinvoke, remaining }));
                Ok(())
            }
        }
    }

    fn resolve_block(
        &self,
        name: &str,
        target: &Option<CallTarget>,
        args_tuple: &Tuple,
    ) -> Result<(EntityId, Tuple), SerializeError> {
        if let Some(t) = target {
            return Ok((t.id, args_tuple.clone()));
        }
        let matches = self
            .entities
            .validate_block(name, args_tuple)
            .map_err(|e| SerializeError::NoMatchingOverload(e.message))?;
        matches.into_iter().next().ok_or_else(|| SerializeError::NoMatchingOverload(name.to_string()))
    }

    // -- expression evaluation -------------------------------------------

    fn eval(&mut self, param: &Parameter) -> Result<Value, SerializeError> {
        match param {
            Parameter::Value(v) => Ok(v.clone()),
            Parameter::Keyword(k) => Ok(self.eval_keyword(*k)),
            Parameter::Operator(_) => Ok(TRUE_NIL),
            Parameter::Variable(v) => self.eval_variable(v),
            Parameter::Expression(e) => self.eval_expression(e),
            Parameter::Tuple(t) => self.eval_tuple_literal(t),
            Parameter::Function(f) => {
                // `evaluate(id)`/`evaluate(id ?? default)` used inside an
                // expression (e.g. `#if(evaluate(x ?? false))`) reads a
                // `#define` the same way the statement-form `#evaluate`
                // tag does. The parser has no special knowledge of this
                // name at expression position -- it's an ordinary free
                // call until the serializer recognizes the shape here.
                if matches!(f.operand, CallOperand::Free) && &*f.name == "evaluate" && f.args.elements.len() == 1 {
                    if let Some((id, default)) = as_evaluate_arg(&f.args.elements[0]) {
                        return self.eval_define_expr(&id, default.as_ref());
                    }
                }
                self.eval_call(f)
            }
        }
    }

    fn eval_keyword(&self, k: Keyword) -> Value {
        match k {
            Keyword::True | Keyword::Yes => Value::Bool(true),
            Keyword::False | Keyword::No => Value::Bool(false),
            Keyword::Nil => TRUE_NIL,
            Keyword::SelfRef => self
                .vars
                .context()
                .scope("self")
                .map(|d| Value::dictionary(d.values.clone()))
                .unwrap_or(TRUE_NIL),
            Keyword::In | Keyword::Underscore | Keyword::Template | Keyword::Var | Keyword::Let => TRUE_NIL,
        }
    }

    fn eval_variable(&mut self, v: &Variable) -> Result<Value, SerializeError> {
        let parts = v.parts();
        let (base, rest_start) = if v.contextualized {
            if parts.len() < 2 {
                return Err(SerializeError::Custom(format!("`${}` requires a path segment", parts[0])));
            }
            (self.vars.get_scoped(&parts[0], &parts[1]).cloned(), 2)
        } else {
            (self.vars.get(&parts[0]).cloned(), 1)
        };
        let Some(mut current) = base else {
            return self.missing(v);
        };
        for part in &parts[rest_start..] {
            current = match &current {
                Value::Dictionary(d) => match d.get(part.as_str()) {
                    Some(val) => val.clone(),
                    None => return self.missing(v),
                },
                Value::Errored(_) => return Ok(current),
                _ => {
                    if self.missing_variable_throws && !v.coalesced {
                        return Err(SerializeError::TypeMismatch {
                            expected: "dictionary".to_string(),
                            found: current.stored_type().to_string(),
                        });
                    }
                    return Ok(TRUE_NIL);
                }
            };
        }
        Ok(current.resolve())
    }

    fn missing(&self, v: &Variable) -> Result<Value, SerializeError> {
        if v.coalesced || !self.missing_variable_throws {
            Ok(TRUE_NIL)
        } else {
            Err(SerializeError::MissingVariable(v.to_string()))
        }
    }

    fn eval_tuple_literal(&mut self, t: &Tuple) -> Result<Value, SerializeError> {
        if t.labels.is_empty() {
            let mut items = Vec::with_capacity(t.elements.len());
            for el in &t.elements {
                items.push(self.eval(el)?);
            }
            Ok(Value::array(items))
        } else {
            let mut dict = Dict::default();
            for (label, &idx) in &t.labels {
                let v = self.eval(&t.elements[idx])?;
                dict.insert(label.clone(), v);
            }
            Ok(Value::dictionary(dict))
        }
    }

    fn eval_tuple_to_values(&mut self, tuple: &Tuple) -> Result<Tuple, SerializeError> {
        let mut out = Tuple::new();
        out.collection = tuple.collection;
        for (idx, el) in tuple.elements.iter().enumerate() {
            let v = self.eval(el)?;
            let mut label = None;
            for (k, &i) in &tuple.labels {
                if i == idx {
                    label = Some(k.clone());
                    break;
                }
            }
            match label {
                Some(l) => out.push_labeled(l, Parameter::Value(v)),
                None => out.push_positional(Parameter::Value(v)),
            }
        }
        Ok(out)
    }

    fn eval_expression(&mut self, expr: &Expression) -> Result<Value, SerializeError> {
        match expr {
            Expression::Infix { left, op, right } => self.eval_infix(left, *op, right),
            Expression::Prefix { operand, .. } => {
                let v = self.eval(operand)?;
                if v.is_errored() {
                    Ok(v)
                } else {
                    Ok(Value::Bool(!truthy(&v)))
                }
            }
            Expression::Postfix { operand, .. } => self.eval(operand),
            Expression::Assignment { target, op, value } => self.eval_assignment(target, *op, value),
            Expression::Ternary { condition, then, otherwise } => {
                if truthy(&self.eval(condition)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expression::Declaration { target, value, .. } => {
                let v = match value {
                    Some(p) => self.eval(p)?,
                    None => TRUE_NIL,
                };
                self.vars.declare(target.ancestor().to_string(), v.clone());
                Ok(v)
            }
        }
    }

    fn eval_infix(&mut self, left: &Parameter, op: Operator, right: &Parameter) -> Result<Value, SerializeError> {
        match op {
            Operator::NilCoalesce => {
                let lv = self.eval(left)?;
                if lv.is_nil() || lv.is_errored() {
                    self.eval(right)
                } else {
                    Ok(lv)
                }
            }
            Operator::And => {
                let lv = self.eval(left)?;
                if lv.is_errored() {
                    return Ok(lv);
                }
                if !truthy(&lv) {
                    return Ok(Value::Bool(false));
                }
                let rv = self.eval(right)?;
                if rv.is_errored() {
                    return Ok(rv);
                }
                Ok(Value::Bool(truthy(&rv)))
            }
            Operator::Or => {
                let lv = self.eval(left)?;
                if truthy(&lv) {
                    return Ok(Value::Bool(true));
                }
                // exempt from error propagation: always evaluate the right
                // operand, even when the left one is errored.
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Operator::Xor | Operator::NotEq => {
                // exempt from error propagation: both operands are evaluated
                // and combined regardless of either being errored.
                let lv = self.eval(left)?;
                let rv = self.eval(right)?;
                Ok(apply_binary(op, &lv, &rv))
            }
            _ => {
                let lv = self.eval(left)?;
                if lv.is_errored() {
                    return Ok(lv);
                }
                let rv = self.eval(right)?;
                if rv.is_errored() {
                    return Ok(rv);
                }
                Ok(apply_binary(op, &lv, &rv))
            }
        }
    }

    fn eval_assignment(&mut self, target: &Variable, op: Operator, value: &Parameter) -> Result<Value, SerializeError> {
        let rhs = self.eval(value)?;
        let new_val = if op == Operator::Assign {
            rhs
        } else {
            let current = self.eval_variable(target)?;
            let bin_op = match op {
                Operator::AddAssign => Operator::Add,
                Operator::SubAssign => Operator::Sub,
                Operator::MulAssign => Operator::Mul,
                Operator::DivAssign => Operator::Div,
                Operator::ModAssign => Operator::Mod,
                other => return Err(SerializeError::Custom(format!("`{other}` is not an assignment operator"))),
            };
            apply_binary(bin_op, &current, &rhs)
        };
        self.write_variable(target, new_val.clone())?;
        Ok(new_val)
    }

    fn write_variable(&mut self, target: &Variable, value: Value) -> Result<(), SerializeError> {
        if target.is_atomic() {
            self.vars.assign(target.ancestor(), value);
            return Ok(());
        }
        let root = self.vars.get(target.ancestor()).cloned().unwrap_or(TRUE_NIL);
        let updated = set_path(root, &target.parts()[1..], value);
        self.vars.assign(target.ancestor(), updated);
        Ok(())
    }

    fn eval_call(&mut self, call: &FunctionCall) -> Result<Value, SerializeError> {
        match &call.operand {
            CallOperand::Free => self.call_function(call),
            CallOperand::Method(receiver) => {
                let recv = self.eval(receiver)?;
                let (result, mutated) = self.call_method(call, &recv)?;
                if mutated.is_some() {
                    return Err(SerializeError::Custom(format!(
                        "method `{}` is mutating but its receiver is not an assignable variable",
                        call.name
                    )));
                }
                Ok(result)
            }
            CallOperand::MutatingMethod(target) => {
                let recv = self.eval_variable(target)?;
                let (result, mutated) = self.call_method(call, &recv)?;
                if let Some(new_val) = mutated {
                    self.write_variable(target, new_val)?;
                }
                Ok(result)
            }
        }
    }

    fn resolve_call(
        &self,
        kind: EntityKind,
        name: &str,
        resolved: &CallResolution,
        args_tuple: &Tuple,
    ) -> Result<(EntityId, Tuple), SerializeError> {
        if let CallResolution::Frozen(target) = resolved {
            return Ok((target.id, args_tuple.clone()));
        }
        let matches = match kind {
            EntityKind::Function => self.entities.validate_function(name, args_tuple),
            EntityKind::Method => self.entities.validate_method(name, args_tuple),
            _ => return Err(SerializeError::Custom(format!("`{name}` is not a callable entity kind"))),
        }
        .map_err(|e| SerializeError::NoMatchingOverload(e.message))?;
        matches.into_iter().next().ok_or_else(|| SerializeError::NoMatchingOverload(name.to_string()))
    }

    fn call_function(&mut self, call: &FunctionCall) -> Result<Value, SerializeError> {
        let args_tuple = self.eval_tuple_to_values(&call.args)?;
        let (id, normalized) = self.resolve_call(EntityKind::Function, &call.name, &call.resolved, &args_tuple)?;
        let entities = self.entities;
        let entry = entities
            .function(id, &call.name)
            .ok_or_else(|| SerializeError::UnknownFunction(call.name.to_string()))?;
        let mut args = tuple_values(&normalized);
        if entry.unsafe_entity {
            if !self.vars.context().options.grant_unsafe_entity_access {
                return Err(SerializeError::Custom(format!(
                    "function `{}` requires unsafe entity access",
                    call.name
                )));
            }
            if let Some(objs) = self.unsafe_objects() {
                args.push(Value::dictionary((*objs).clone()));
            }
        }
        Ok((entry.implementation)(&args))
    }

    fn call_method(&mut self, call: &FunctionCall, receiver: &Value) -> Result<(Value, Option<Value>), SerializeError> {
        let args_tuple = self.eval_tuple_to_values(&call.args)?;
        let (id, normalized) = self.resolve_call(EntityKind::Method, &call.name, &call.resolved, &args_tuple)?;
        let entities = self.entities;
        let entry = entities
            .method(id, &call.name)
            .ok_or_else(|| SerializeError::UnknownFunction(call.name.to_string()))?;
        let args = tuple_values(&normalized);
        Ok((entry.implementation)(receiver, &args))
    }

    fn unsafe_objects(&self) -> Option<Arc<Dict>> {
        self.vars.context().scope("self").and_then(|d| d.unsafe_objects.clone())
    }
}

/// Recognizes the two call shapes `evaluate(id)` and `evaluate(id ??
/// default)` can take once parsed as an ordinary expression-position
/// function call, returning the define id and optional default
/// parameter. Any other shape (a non-variable argument, a path rather
/// than a bare identifier) is not this special form and falls through
/// to an ordinary registry call.
fn as_evaluate_arg(p: &Parameter) -> Option<(String, Option<Parameter>)> {
    match p {
        Parameter::Variable(v) if v.is_atomic() => Some((v.last_part().to_string(), None)),
        Parameter::Expression(e) => match &**e {
            Expression::Infix { left: Parameter::Variable(v), op: Operator::NilCoalesce, right }
                if v.is_atomic() =>
            {
                Some((v.last_part().to_string(), Some(right.clone())))
            }
            _ => None,
        },
        _ => None,
    }
}

fn tuple_values(tuple: &Tuple) -> Vec<Value> {
    tuple
        .elements
        .iter()
        .map(|p| match p {
            Parameter::Value(v) => v.clone(),
            _ => Value::errored("argument did not evaluate to a concrete value before the call"),
        })
        .collect()
}

/// Truthiness per the value model's coercion lattice: numbers are falsy
/// only at zero, strings/data at empty, collections are always truthy
/// once present, `nil`/`void`/errored are falsy.
fn truthy(v: &Value) -> bool {
    let resolved = v.clone().resolve();
    resolved
        .coerce(crate::value::ValueType::Bool)
        .and_then(|b| b.as_bool())
        .unwrap_or(false)
}

fn apply_binary(op: Operator, l: &Value, r: &Value) -> Value {
    match op {
        Operator::Add => l.checked_add(r).unwrap_or_else(|| type_mismatch("+", l, r)),
        Operator::Sub => l.checked_sub(r).unwrap_or_else(|| type_mismatch("-", l, r)),
        Operator::Mul => l.checked_mul(r).unwrap_or_else(|| type_mismatch("*", l, r)),
        Operator::Div => l.checked_div(r),
        Operator::Mod => l.checked_rem(r),
        Operator::Eq => Value::Bool(l.py_eq(r)),
        Operator::NotEq => Value::Bool(!l.py_eq(r)),
        Operator::Lt => l.py_cmp(r).map(|o| Value::Bool(o.is_lt())).unwrap_or_else(|| type_mismatch("<", l, r)),
        Operator::Lte => l.py_cmp(r).map(|o| Value::Bool(o.is_le())).unwrap_or_else(|| type_mismatch("<=", l, r)),
        Operator::Gt => l.py_cmp(r).map(|o| Value::Bool(o.is_gt())).unwrap_or_else(|| type_mismatch(">", l, r)),
        Operator::Gte => l.py_cmp(r).map(|o| Value::Bool(o.is_ge())).unwrap_or_else(|| type_mismatch(">=", l, r)),
        Operator::Xor => Value::Bool(truthy(l) ^ truthy(r)),
        Operator::Subscript => subscript(l, r),
        other => Value::errored(format!("`{other}` is not valid in expression position")),
    }
}

fn type_mismatch(op: &str, l: &Value, r: &Value) -> Value {
    Value::errored(format!(
        "unsupported operand types for {op}: {} and {}",
        l.stored_type(),
        r.stored_type()
    ))
}

fn subscript(container: &Value, index: &Value) -> Value {
    match container {
        Value::Array(items) => match index.as_int() {
            Some(i) if i >= 0 && (i as usize) < items.len() => items[i as usize].clone(),
            _ => Value::errored(format!("array index {index:?} out of bounds")),
        },
        Value::Dictionary(d) => match index.as_string() {
            Some(key) => d.get(&*key).cloned().unwrap_or(TRUE_NIL),
            None => Value::errored("dictionary subscript requires a string key"),
        },
        other => Value::errored(format!("cannot subscript a {}", other.stored_type())),
    }
}

/// Rebuilds the dictionary chain down to `path`, replacing the leaf with
/// `new_leaf`. Used by both the assignment operator and mutating-method
/// write-back so pathed targets (`todo.title = ...`) work the same as
/// atomic ones.
fn set_path(root: Value, path: &[String], new_leaf: Value) -> Value {
    let Some((head, rest)) = path.split_first() else { return new_leaf };
    let mut dict = match root {
        Value::Dictionary(d) => (*d).clone(),
        _ => Dict::default(),
    };
    let child = dict.get(head.as_str()).cloned().unwrap_or(TRUE_NIL);
    let updated_child = set_path(child, rest, new_leaf);
    dict.insert(head.clone(), updated_child);
    Value::dictionary(dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDictionary, Options};
    use crate::entities::{ParamSignature, Signature};
    use crate::parser;
    use crate::source::MemorySource;
    use crate::syntax::AstKey;

    fn empty_started_entities() -> Entities {
        let mut e = Entities::new();
        e.start();
        e
    }

    fn test_entities() -> Entities {
        let mut e = Entities::new();
        e.register_block(
            "if",
            Signature::new(vec![ParamSignature::positional(None)]),
            Vec::new(),
            Arc::new(|args, _dict| if truthy(&args[0]) { ScopeCount::Finite(1) } else { ScopeCount::Discard }),
        )
        .unwrap();
        e.register_block(
            "elseif",
            Signature::new(vec![ParamSignature::positional(None)]),
            vec!["if".to_string()],
            Arc::new(|args, _dict| if truthy(&args[0]) { ScopeCount::Finite(1) } else { ScopeCount::Discard }),
        )
        .unwrap();
        e.register_block(
            "else",
            Signature::new(vec![]),
            vec!["if".to_string(), "elseif".to_string()],
            Arc::new(|_args, _dict| ScopeCount::Finite(1)),
        )
        .unwrap();
        e.register_function(
            "len",
            Signature::new(vec![ParamSignature::positional(None)]),
            Arc::new(|args| match &args[0] {
                Value::Array(a) => Value::Int(a.len() as i64),
                Value::String(s) => Value::Int(s.chars().count() as i64),
                _ => Value::errored("len() expects an array or string"),
            }),
        )
        .unwrap();
        e.register_method(
            "push",
            Signature::new(vec![ParamSignature::positional(None)]),
            true,
            Arc::new(|receiver, args| {
                let mut items = receiver.as_array().map(<[Value]>::to_vec).unwrap_or_default();
                items.push(args[0].clone());
                let updated = Value::array(items);
                (updated.clone(), Some(updated))
            }),
        )
        .unwrap();
        e.start();
        e
    }

    fn render(src: &[u8], entities: &Entities, context: &Context) -> Result<String, SerializeError> {
        let ast = parser::parse(src, &AstKey::new("mem", "t")).expect("parses");
        let source = MemorySource::new();
        let bytes = serialize(&ast, entities, context, &source)?;
        Ok(String::from_utf8(bytes).expect("utf8 output"))
    }

    #[test]
    fn raw_text_and_passthrough_render() {
        let entities = empty_started_entities();
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("name", Value::string("World"));
        context.register("self", dict);
        let out = render(b"Hello #(name)!", &entities, &context).unwrap();
        assert_eq!(out, "Hello World!");
    }

    #[test]
    fn if_elseif_else_chain_picks_first_true_branch() {
        let entities = test_entities();
        let context = Context::root(Options::default());
        let out = render(b"#if(false): a #elseif(true): b #else: c #endif", &entities, &context).unwrap();
        assert_eq!(out.trim(), "b");
    }

    #[test]
    fn for_loop_iterates_array_binding_each_item() {
        let entities = empty_started_entities();
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("items", Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        context.register("self", dict);
        let out = render(b"#for(item in items):#(item),#endfor", &entities, &context).unwrap();
        assert_eq!(out, "1,2,3,");
    }

    #[test]
    fn declaration_and_assignment_round_trip() {
        let entities = empty_started_entities();
        let context = Context::root(Options::default());
        let out = render(b"#var(x = 1)#(x = x + 1)#(x)", &entities, &context).unwrap();
        assert_eq!(out, "2");
    }

    #[test]
    fn contextualized_variable_reads_registered_scope() {
        let entities = empty_started_entities();
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("status", Value::string("ok"));
        context.register("api", dict);
        let out = render(b"#($api.status)", &entities, &context).unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn define_evaluate_renders_recorded_scope() {
        let entities = empty_started_entities();
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("name", Value::string("Sam"));
        context.register("self", dict);
        let out = render(b"#define(greeting):Hi #(name)#enddefine#evaluate(greeting)", &entities, &context).unwrap();
        assert_eq!(out, "Hi Sam");
    }

    #[test]
    fn mutating_method_writes_back_and_len_reads_result() {
        let entities = test_entities();
        let context = Context::root(Options::default());
        let out = render(b"#var(xs = [1, 2])#(xs.push(3))#(len(xs))", &entities, &context).unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn arithmetic_infix_respects_precedence() {
        let entities = empty_started_entities();
        let context = Context::root(Options::default());
        let out = render(b"#(2 + 3 * 4)", &entities, &context).unwrap();
        assert_eq!(out, "14");
    }

    #[test]
    fn division_by_zero_surfaces_as_error_when_strict() {
        let entities = empty_started_entities();
        let context = Context::root(Options::default());
        assert!(render(b"#(1 / 0)", &entities, &context).is_err());
    }

    #[test]
    fn missing_variable_errors_when_strict() {
        let entities = empty_started_entities();
        let context = Context::root(Options::default());
        assert!(render(b"#(nope)", &entities, &context).is_err());
    }

    #[test]
    fn missing_variable_swallowed_when_lenient() {
        let entities = empty_started_entities();
        let mut opts = Options::default();
        opts.missing_variable_throws = false;
        let context = Context::root(opts);
        let out = render(b"[#(nope)]", &entities, &context).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn expired_deadline_is_detected_on_tick_sample() {
        let entities = empty_started_entities();
        let context = Context::root(Options::default());
        let source = MemorySource::new();
        let ast = parser::parse(b"", &AstKey::new("mem", "t")).unwrap();
        let mut engine = Engine::new(&ast, &entities, &context, &source);
        engine.deadline = Instant::now() - Duration::from_secs(1);
        engine.ticks = TICK_SAMPLE_INTERVAL - 1;
        assert!(matches!(engine.sample_deadline(), Err(SerializeError::Timeout)));
    }
}
