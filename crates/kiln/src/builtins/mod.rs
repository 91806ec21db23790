//! The seed entity library every `Renderer::new` registers before
//! starting the engine: the `if`/`elseif`/`else` chained block, and a
//! small set of everyday functions and methods. A host embedding `kiln`
//! is free to register more (or, via `Renderer::with_entities`, start
//! from a registry that never saw this module at all); nothing here is
//! privileged over a host registration.

use std::sync::Arc;

use crate::entities::{Entities, ParamSignature, ScopeCount, Signature};
use crate::error::RegistrationError;
use crate::value::{Value, ValueType};

/// Coerces to bool the same lenient way the serializer's condition
/// evaluation does: numbers falsy only at zero, strings/data at empty,
/// nil/void/errored always falsy, collections always truthy once present.
fn truthy(v: &Value) -> bool {
    v.clone().resolve().coerce(ValueType::Bool).and_then(|b| b.as_bool()).unwrap_or(false)
}

pub fn register(entities: &mut Entities) -> Result<(), RegistrationError> {
    register_conditionals(entities)?;
    register_functions(entities)?;
    register_methods(entities)?;
    Ok(())
}

fn register_conditionals(entities: &mut Entities) -> Result<(), RegistrationError> {
    entities.register_block(
        "if",
        Signature::new(vec![ParamSignature::positional(None)]),
        Vec::new(),
        Arc::new(|args, _dict| {
            if args.first().is_some_and(truthy) {
                ScopeCount::Finite(1)
            } else {
                ScopeCount::Discard
            }
        }),
    )?;
    entities.register_block(
        "elseif",
        Signature::new(vec![ParamSignature::positional(None)]),
        vec!["if".to_string(), "elseif".to_string()],
        Arc::new(|args, _dict| {
            if args.first().is_some_and(truthy) {
                ScopeCount::Finite(1)
            } else {
                ScopeCount::Discard
            }
        }),
    )?;
    entities.register_block(
        "else",
        Signature::new(vec![]),
        vec!["if".to_string(), "elseif".to_string()],
        Arc::new(|_args, _dict| ScopeCount::Finite(1)),
    )?;
    Ok(())
}

fn register_functions(entities: &mut Entities) -> Result<(), RegistrationError> {
    entities.register_function(
        "len",
        Signature::new(vec![ParamSignature::positional(None)]),
        Arc::new(|args| match args.first() {
            Some(Value::Array(a)) => Value::Int(a.len() as i64),
            Some(Value::Dictionary(d)) => Value::Int(d.len() as i64),
            Some(Value::String(s)) => Value::Int(s.chars().count() as i64),
            Some(Value::Data(d)) => Value::Int(d.len() as i64),
            Some(Value::Void | Value::Nil(_)) => Value::Int(0),
            _ => Value::errored("len() requires a string, array, dictionary, or data argument"),
        }),
    )?;
    entities.register_function(
        "isEmpty",
        Signature::new(vec![ParamSignature::positional(None)]),
        Arc::new(|args| match args.first() {
            Some(Value::Array(a)) => Value::Bool(a.is_empty()),
            Some(Value::Dictionary(d)) => Value::Bool(d.is_empty()),
            Some(Value::String(s)) => Value::Bool(s.is_empty()),
            Some(Value::Data(d)) => Value::Bool(d.is_empty()),
            Some(Value::Void | Value::Nil(_)) => Value::Bool(true),
            _ => Value::errored("isEmpty() requires a string, array, dictionary, or data argument"),
        }),
    )?;
    entities.register_function(
        "contains",
        Signature::new(vec![
            ParamSignature::positional(Some(ValueType::Array)),
            ParamSignature::positional(None),
        ]),
        Arc::new(|args| match args.first() {
            Some(Value::Array(a)) => Value::Bool(args.get(1).is_some_and(|needle| a.iter().any(|v| v.py_eq(needle)))),
            _ => Value::errored("contains() requires an array as its first argument"),
        }),
    )?;
    Ok(())
}

fn register_methods(entities: &mut Entities) -> Result<(), RegistrationError> {
    entities.register_method(
        "uppercased",
        Signature::new(vec![]),
        false,
        Arc::new(|recv, _args| match recv.as_string() {
            Some(s) => (Value::string(s.to_uppercase()), None),
            None => (Value::errored("uppercased() requires a string receiver"), None),
        }),
    )?;
    entities.register_method(
        "lowercased",
        Signature::new(vec![]),
        false,
        Arc::new(|recv, _args| match recv.as_string() {
            Some(s) => (Value::string(s.to_lowercase()), None),
            None => (Value::errored("lowercased() requires a string receiver"), None),
        }),
    )?;
    entities.register_method(
        "append",
        Signature::new(vec![ParamSignature::positional(None)]),
        true,
        Arc::new(|recv, args| match recv {
            Value::Array(a) => {
                let mut items = a.to_vec();
                items.push(args.first().cloned().unwrap_or(Value::Void));
                let updated = Value::array(items);
                (updated.clone(), Some(updated))
            }
            other => {
                let err = Value::errored(format!("append() requires an array receiver, found {}", other.stored_type()));
                (err.clone(), Some(err))
            }
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Tuple;

    #[test]
    fn len_reports_string_character_count() {
        let mut e = Entities::new();
        register(&mut e).unwrap();
        let matches = e.validate_function("len", &{
            let mut t = Tuple::new();
            t.push_positional(crate::expr::Parameter::Value(Value::string("hi")));
            t
        });
        assert!(matches.is_ok());
        let entry = e.function(matches.unwrap()[0].0, "len").unwrap();
        assert!(matches!((entry.implementation)(&[Value::string("hi")]), Value::Int(2)));
    }

    #[test]
    fn if_block_discards_on_falsy_condition() {
        let mut e = Entities::new();
        register(&mut e).unwrap();
        let entry = &e.block_named("if").unwrap()[0];
        let mut dict = crate::value::Dict::default();
        assert_eq!((entry.implementation)(&[Value::Bool(false)], &mut dict), ScopeCount::Discard);
        assert_eq!((entry.implementation)(&[Value::Bool(true)], &mut dict), ScopeCount::Finite(1));
    }

    #[test]
    fn append_method_returns_new_array_and_writes_back() {
        let mut e = Entities::new();
        register(&mut e).unwrap();
        let entry = &e.method(crate::entities::EntityId(0), "append").unwrap();
        let (result, mutated) = (entry.implementation)(&Value::array(vec![Value::Int(1)]), &[Value::Int(2)]);
        assert!(mutated.is_some());
        assert_eq!(result.as_array().unwrap().len(), 2);
    }
}
