//! `kiln`: a server-side text template engine -- lexer, parser, an
//! arena-of-tables AST, a resolver that splices `#inline` dependencies
//! together, a non-recursive serializer, and a `Renderer` facade tying
//! them to a `Cache` and an extensible `Entities` registry.

mod builtins;
mod cache;
mod context;
mod entities;
mod error;
mod expr;
mod lexer;
mod operator;
mod parser;
mod render;
mod resolver;
mod serializer;
mod source;
mod syntax;
mod token;
mod value;
mod variable;
mod varstack;

pub use crate::{
    cache::{Cache, Touch},
    context::{Caching, Context, ContextDictionary, ContextMode, Encoding, Options, RegistrationMode},
    entities::{
        BlockImpl, EntityId, Entities, FunctionImpl, MethodImpl, ParamSignature, ScopeCount, Signature,
    },
    error::{Error, KilnResult, ParseError, RegistrationError, ResolveError, SerializeError, SourceError, SourceLoc},
    render::Renderer,
    source::{Fetched, FileSystemSource, MemorySource, Source},
    syntax::{Ast, AstKey},
    value::{Dict, Value, ValueType, TRUE_NIL},
};
