//! The Resolver: the fixpoint driver that fetches and splices an AST's
//! inline dependencies, detecting cycles as it goes.

use crate::cache::Cache;
use crate::context::Options;
use crate::error::ResolveError;
use crate::parser;
use crate::source::Source;
use crate::syntax::{Ast, AstKey, ScopeRef, Syntax};

/// Resolves `ast`'s `#inline(..., as: template)` and `#inline(..., as: raw|handler)`
/// dependencies in place, recursively resolving each fetched dependency
/// first. `chain` threads the names currently in progress so a cycle is
/// detected as soon as it closes.
pub fn resolve(
    ast: &mut Ast,
    source: &dyn Source,
    cache: &Cache,
    options: &Options,
    chain: &mut Vec<String>,
) -> Result<(), ResolveError> {
    if ast.info.resolved {
        return Ok(());
    }
    chain.push(ast.key.name.clone());

    let template_targets = collect_template_targets(ast);
    for name in template_targets {
        if chain.contains(&name) {
            return Err(ResolveError::CyclicalReference { name, chain: chain.clone() });
        }
        let dep_key = AstKey::new(ast.key.source.clone(), name.clone());
        let mut dep_ast = match cache.retrieve(&dep_key) {
            Some(dep) => dep,
            None => {
                let fetched = source.file(&name, false)?;
                parser::parse(&fetched.bytes, &dep_key)?
            }
        };
        resolve(&mut dep_ast, source, cache, options, chain)?;
        cache.insert(dep_ast.clone(), true);

        // `splice_tables` offsets every internal `Table` pointer in the
        // dependency's own arena uniformly, so the dependency's root table
        // (index 0 before splicing) lands at the returned offset.
        let offset = ast.splice_tables(dep_ast.tables);

        for table in &mut ast.tables {
            for node in table.iter_mut() {
                if let Syntax::InlineTemplate { name: n, scope } = node {
                    if n == &name && matches!(scope, ScopeRef::Nil) {
                        *scope = ScopeRef::Table(offset);
                    }
                }
            }
        }
    }

    let raw_targets = collect_raw_targets(ast);
    for (name, _handler) in raw_targets {
        let fetched = source.file(&name, false)?;
        let embed = fetched.bytes.len() <= options.embedded_ast_raw_limit as usize;
        if embed {
            ast.inlined_raw.insert(name.clone(), fetched.bytes);
        }
        for table in &mut ast.tables {
            for node in table.iter_mut() {
                if let Syntax::InlineRaw { name: n, embedded, .. } = node {
                    if n == &name {
                        *embedded = embed;
                    }
                }
            }
        }
    }

    ast.info.resolved = true;
    chain.pop();
    Ok(())
}

fn collect_template_targets(ast: &Ast) -> Vec<String> {
    let mut out = Vec::new();
    for table in &ast.tables {
        for node in table {
            if let Syntax::InlineTemplate { name, scope } = node {
                if matches!(scope, ScopeRef::Nil) && !out.contains(name) {
                    out.push(name.clone());
                }
            }
        }
    }
    out
}

fn collect_raw_targets(ast: &Ast) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for table in &ast.tables {
        for node in table {
            if let Syntax::InlineRaw { name, handler, embedded } = node {
                if !embedded && !out.iter().any(|(n, _)| n == name) {
                    out.push((name.clone(), handler.clone()));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use crate::source::MemorySource;
    use crate::syntax::AstKey;

    #[test]
    fn cyclic_inline_chain_is_detected() {
        let source = MemorySource::new();
        source.insert("a", "#inline(\"b\")");
        source.insert("b", "#inline(\"c\")");
        source.insert("c", "#inline(\"a\")");
        let cache = Cache::new();
        let options = Options::default();

        let mut ast = parser::parse(&source.file("a", false).unwrap().bytes, &AstKey::new("mem", "a")).unwrap();
        let mut chain = Vec::new();
        let err = resolve(&mut ast, &source, &cache, &options, &mut chain).unwrap_err();
        assert!(matches!(err, ResolveError::CyclicalReference { .. }));
    }

    #[test]
    fn non_cyclic_inline_resolves_and_splices() {
        let source = MemorySource::new();
        source.insert("base", "#inline(\"leaf\")");
        source.insert("leaf", "hello");
        let cache = Cache::new();
        let options = Options::default();

        let mut ast =
            parser::parse(&source.file("base", false).unwrap().bytes, &AstKey::new("mem", "base")).unwrap();
        let mut chain = Vec::new();
        resolve(&mut ast, &source, &cache, &options, &mut chain).unwrap();
        assert!(ast.info.resolved);
        assert!(ast.tables.len() >= 2);
    }
}
