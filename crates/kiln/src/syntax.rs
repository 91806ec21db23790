//! Scope tables: the compiled, tree-shaped body of a parsed template,
//! represented as an arena of tables indexed by integer rather than
//! direct pointers, so tables can reference each other cyclically and be
//! spliced by the resolver without invalidating existing indices.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;

use crate::entities::CallTarget;
use crate::expr::{Expression, Parameter, Tuple};

/// Index into an `AST`'s `tables` vector. `None` is a placeholder (the
/// block has no body yet, or the body is empty); a table may reference
/// itself or an ancestor, modeling the source's cyclic-by-index ownership.
pub type TableIndex = usize;

/// A pointer from a block instance to its body, or lack thereof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRef {
    /// No body (e.g. a bodyless tag).
    Nil,
    /// Body lives in `tables[idx]`.
    Table(TableIndex),
    /// Atomic, single-statement body inlined directly (no separate table).
    Atomic,
}

/// One block invocation site: `name`, the frozen or dynamic call target,
/// the call tuple, and a pointer to its scope body.
#[derive(Debug, Clone)]
pub struct BlockInstance {
    pub name: String,
    pub target: Option<CallTarget>,
    pub params: Option<Tuple>,
    pub scope: ScopeRef,
    /// The atomic single-statement body, present iff `scope == Atomic`.
    pub atomic_body: Option<Box<Syntax>>,
}

/// One node in a scope table.
#[derive(Debug, Clone)]
pub enum Syntax {
    /// A verbatim byte span copied straight to output.
    Raw(String),
    /// A bare expression tag, `#(expr)`, appended to output when evaluated.
    Passthrough(Parameter),
    /// `var`/`let`, or an assignment operator used at statement position.
    Expr(Expression),
    /// A general block invocation (includes meta-blocks like `define`;
    /// the serializer special-cases meta-block names).
    Block(BlockInstance),
    /// `#inline("name", as: template)`. `scope` starts `Nil` and is filled
    /// in by the Resolver once the dependency's AST has been spliced.
    InlineTemplate { name: String, scope: ScopeRef },
    /// `#inline("name", as: raw|<handler>)`. The Resolver either embeds the
    /// fetched bytes into the owning AST (`inlined_raw`, keyed by `name`)
    /// when under `embeddedASTRawLimit`, or leaves this unembedded so the
    /// Serializer re-fetches through the Source at render time.
    InlineRaw { name: String, handler: String, embedded: bool },
    /// `#for(binding in iterable): ... #endfor`. The loop-parameter
    /// signature (`ident in expr`) is a fixed grammar of its own rather
    /// than a generic labeled Tuple call, so it gets a dedicated node.
    ForLoop { binding: String, iterable: Parameter, scope: ScopeRef },
    /// `#define(id)`/`#define(id = expr)`.
    Define { id: String, scope: ScopeRef, expr: Option<Parameter> },
    /// `#evaluate(id)`/`#evaluate(id ?? default)`.
    Evaluate { id: String, default: Option<Parameter> },
    /// `#raw(handler): ... #endraw`, opening a new output buffer.
    RawBlock { handler: String, scope: ScopeRef },
}

/// Aggregate per-AST bookkeeping, refreshed on each parse and updated by
/// the Cache's touch aggregation.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub required_asts: HashSet<String>,
    pub required_raw: HashSet<String>,
    pub required_variables: HashSet<String>,
    pub max_scope_depth: u32,
    pub estimated_output_size: u64,
    pub parsed_at: Option<Duration>,
    pub touch_count: u64,
    pub avg_exec_time: f64,
    pub avg_output_size: f64,
    pub last_poll: Option<Duration>,
    pub cached: bool,
    pub resolved: bool,
    /// The source's mtime at the time this AST was parsed, used by
    /// `Caching::AUTO_UPDATE` to decide whether to re-fetch.
    pub source_mtime: Option<SystemTime>,
}

/// `(source, name)`, the Cache's lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AstKey {
    pub source: String,
    pub name: String,
}

impl AstKey {
    #[must_use]
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self { source: source.into(), name: name.into() }
    }
}

/// A compiled document: the root scope table plus every table it
/// (transitively) owns, addressed by index rather than pointer.
#[derive(Debug, Clone)]
pub struct Ast {
    pub key: AstKey,
    pub tables: Vec<Vec<Syntax>>,
    /// inline-raw name -> already-serialized bytes, populated by the
    /// resolver when a raw dependency is small enough to embed.
    pub inlined_raw: AHashMap<String, Vec<u8>>,
    pub info: Info,
}

impl Ast {
    #[must_use]
    pub fn new(key: AstKey, root: Vec<Syntax>) -> Self {
        Self {
            key,
            tables: vec![root],
            inlined_raw: AHashMap::new(),
            info: Info::default(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &[Syntax] {
        &self.tables[0]
    }

    /// Appends `table` to the arena and returns its index.
    pub fn push_table(&mut self, table: Vec<Syntax>) -> TableIndex {
        self.tables.push(table);
        self.tables.len() - 1
    }

    /// Splices another AST's tables into this one, offsetting every
    /// `ScopeRef::Table` index the dependency contains by the insertion
    /// point, and returns the offset that was applied (so the caller can
    /// rewrite the inline site's own pointer).
    pub fn splice_tables(&mut self, mut dependency_tables: Vec<Vec<Syntax>>) -> usize {
        let offset = self.tables.len();
        for table in &mut dependency_tables {
            for node in table {
                let scope = match node {
                    Syntax::Block(b) => Some(&mut b.scope),
                    Syntax::InlineTemplate { scope, .. } => Some(scope),
                    _ => None,
                };
                if let Some(ScopeRef::Table(idx)) = scope {
                    *idx += offset;
                }
            }
        }
        self.tables.extend(dependency_tables);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splicing_offsets_inner_table_pointers() {
        let mut ast = Ast::new(AstKey::new("fs", "a"), vec![]);
        let dep_root = vec![Syntax::Block(BlockInstance {
            name: "if".into(),
            target: None,
            params: None,
            scope: ScopeRef::Table(1),
            atomic_body: None,
        })];
        let dep_inner = vec![Syntax::Raw("x".into())];
        let offset = ast.splice_tables(vec![dep_root, dep_inner]);
        assert_eq!(offset, 1);
        let Syntax::Block(b) = &ast.tables[1][0] else { panic!() };
        assert_eq!(b.scope, ScopeRef::Table(2));
    }
}
