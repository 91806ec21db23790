//! The serializer's variable-lookup stack: an ordered stack of locally
//! scoped frames layered on top of the render's root `Context`.
//!
//! `var`/`let` declarations and `#for` loop bindings push into the
//! current top frame; a block invocation pushes a fresh frame so its
//! locals never leak to the caller. Lookups walk frames top-down before
//! falling through to the `Context`'s registered `self` scope.

use ahash::AHashMap;

use crate::context::Context;
use crate::value::Value;

#[derive(Debug, Clone, Default)]
struct Frame {
    locals: AHashMap<String, Value>,
}

/// Borrowed for the lifetime of one render.
pub struct VariableStack<'ctx> {
    context: &'ctx Context,
    frames: Vec<Frame>,
}

impl<'ctx> VariableStack<'ctx> {
    #[must_use]
    pub fn new(context: &'ctx Context) -> Self {
        Self { context, frames: vec![Frame::default()] }
    }

    /// Opens a new local scope, e.g. entering a block's body or a loop
    /// iteration.
    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Closes the most recently opened local scope.
    ///
    /// # Panics
    /// Panics if called with no frame beyond the root, which would be a
    /// serializer bug (an unbalanced push/pop).
    pub fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "cannot pop the root frame");
        self.frames.pop();
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Binds `name` to `value` in the current top frame, shadowing any
    /// outer frame's binding of the same name for the rest of this scope.
    pub fn declare(&mut self, name: impl Into<String>, value: Value) {
        self.frames.last_mut().expect("at least one frame always present").locals.insert(name.into(), value);
    }

    /// Assigns `value` to `name`'s nearest existing local binding, or
    /// declares it in the top frame if not yet locally bound anywhere --
    /// the behavior an unscoped `x = 1` assignment needs.
    pub fn assign(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.locals.contains_key(name) {
                frame.locals.insert(name.to_string(), value);
                return;
            }
        }
        self.declare(name.to_string(), value);
    }

    /// Looks up an unscoped identifier, walking frames top-down and
    /// falling through to the context's root (`self`) scope.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.locals.get(name) {
                return Some(v);
            }
        }
        self.context.lookup_self(name)
    }

    /// Looks up a contextualized `$scope.key` reference directly against
    /// the registered `Context` scopes, bypassing local frames: a scope
    /// name is never locally shadowable.
    #[must_use]
    pub fn get_scoped(&self, scope: &str, key: &str) -> Option<&Value> {
        self.context.scope(scope).and_then(|d| d.get(key))
    }

    #[must_use]
    pub fn context(&self) -> &'ctx Context {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDictionary, Options};

    fn root_with(key: &str, value: Value) -> Context {
        let mut ctx = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert(key, value);
        ctx.register("self", dict);
        ctx
    }

    #[test]
    fn local_frame_shadows_root_context() {
        let ctx = root_with("x", Value::Int(1));
        let mut stack = VariableStack::new(&ctx);
        assert_eq!(stack.get("x").and_then(Value::as_int), Some(1));
        stack.push_frame();
        stack.declare("x", Value::Int(2));
        assert_eq!(stack.get("x").and_then(Value::as_int), Some(2));
        stack.pop_frame();
        assert_eq!(stack.get("x").and_then(Value::as_int), Some(1));
    }

    #[test]
    fn assign_updates_nearest_existing_binding() {
        let ctx = Context::root(Options::default());
        let mut stack = VariableStack::new(&ctx);
        stack.declare("count", Value::Int(0));
        stack.push_frame();
        stack.assign("count", Value::Int(1));
        assert_eq!(stack.get("count").and_then(Value::as_int), Some(1));
        stack.pop_frame();
        assert_eq!(stack.get("count").and_then(Value::as_int), Some(1));
    }

    #[test]
    fn assign_without_prior_declaration_declares_in_top_frame() {
        let ctx = Context::root(Options::default());
        let mut stack = VariableStack::new(&ctx);
        stack.push_frame();
        stack.assign("fresh", Value::Int(9));
        assert_eq!(stack.get("fresh").and_then(Value::as_int), Some(9));
        stack.pop_frame();
        assert!(stack.get("fresh").is_none());
    }

    #[test]
    fn scoped_lookup_reads_registered_context_scopes() {
        let mut ctx = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("status", Value::string("ok"));
        ctx.register("api", dict);
        let stack = VariableStack::new(&ctx);
        assert!(matches!(stack.get_scoped("api", "status"), Some(Value::String(s)) if &**s == "ok"));
    }
}
