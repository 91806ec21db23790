//! The `Renderer` facade: the single public entry point tying `parser`,
//! `resolver`, and `serializer` together over a shared `Cache` and
//! `Entities` registry, mirroring the teacher's `Executor` as the one
//! object callers hold onto across renders.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use crate::cache::{Cache, Touch};
use crate::context::{Caching, Context, Options};
use crate::entities::Entities;
use crate::error::Error;
use crate::resolver;
use crate::serializer;
use crate::source::Source;
use crate::syntax::AstKey;

/// The fixed source id every `AstKey` is namespaced under: a `Renderer`
/// only ever talks to the one `Source` it was built with.
const SOURCE_ID: &str = "renderer";

/// Ties a `Source`, a registered `Entities` table, and a `Cache` together
/// behind one `render` call. Built once at startup; `Entities`
/// registration happens during construction, before the one-way latch
/// in `Entities::start` closes.
pub struct Renderer {
    source: Box<dyn Source>,
    options: Options,
    entities: Entities,
    cache: Cache,
    last_poll: RwLock<HashMap<AstKey, Instant>>,
}

impl Renderer {
    /// Builds a renderer with the seed builtin library registered and
    /// started. `options` supplies the default per-render configuration;
    /// an individual `render` call's `Context` carries its own `Options`
    /// copy that can diverge from this default.
    #[must_use]
    pub fn new(source: Box<dyn Source>, options: Options) -> Self {
        let mut entities = Entities::new();
        crate::builtins::register(&mut entities).expect("builtin registration is infallible");
        entities.start();
        Self {
            source,
            options,
            entities,
            cache: Cache::new(),
            last_poll: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a renderer around an already-populated `Entities` table
    /// (e.g. the seed library plus host-specific registrations). `entities`
    /// must not have been started yet; this call starts it.
    #[must_use]
    pub fn with_entities(source: Box<dyn Source>, options: Options, mut entities: Entities) -> Self {
        entities.start();
        Self {
            source,
            options,
            entities,
            cache: Cache::new(),
            last_poll: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    /// Renders `name` against `context`, fetching and parsing it (or any
    /// of its `#inline` dependencies) as needed, and driving the cache per
    /// `context.options.caching`.
    pub fn render(&self, name: &str, context: &Context) -> Result<Vec<u8>, Error> {
        let key = AstKey::new(SOURCE_ID, name);
        let caching = context.options.caching;
        let started = Instant::now();

        let ast = if caching.contains(Caching::READ) {
            match self.cache.retrieve(&key) {
                Some(cached) => self.maybe_auto_update(&key, cached, caching)?,
                None => self.fetch_and_resolve(&key, name, caching)?,
            }
        } else {
            self.fetch_and_resolve(&key, name, caching)?
        };

        let output = serializer::serialize(&ast, &self.entities, context, self.source.as_ref())?;

        if !caching.is_empty() {
            self.cache.touch(&key, Touch { exec_time: started.elapsed(), output_size: output.len() as u64 });
        }
        Ok(output)
    }

    fn fetch_and_resolve(&self, key: &AstKey, name: &str, caching: Caching) -> Result<crate::syntax::Ast, Error> {
        let fetched = self.source.file(name, false)?;
        let mut ast = crate::parser::parse(&fetched.bytes, key)?;
        ast.info.source_mtime = self.source.timestamp(name).ok();
        let mut chain = Vec::new();
        resolver::resolve(&mut ast, self.source.as_ref(), &self.cache, &self.options, &mut chain)?;
        if caching.contains(Caching::STORE) {
            ast = self.cache.insert(ast, true);
        }
        Ok(ast)
    }

    /// Re-checks a cached AST's freshness when `AUTO_UPDATE` is set and
    /// enough wall time has passed since the last poll, per
    /// `Options::polling_frequency`.
    fn maybe_auto_update(&self, key: &AstKey, ast: crate::syntax::Ast, caching: Caching) -> Result<crate::syntax::Ast, Error> {
        if !caching.contains(Caching::AUTO_UPDATE) {
            return Ok(ast);
        }
        let due = {
            let polls = self.last_poll.read().expect("poll lock poisoned");
            match polls.get(key) {
                Some(last) => last.elapsed().as_secs_f64() >= self.options.polling_frequency,
                None => true,
            }
        };
        if !due {
            return Ok(ast);
        }
        self.last_poll.write().expect("poll lock poisoned").insert(key.clone(), Instant::now());
        let current_mtime = self.source.timestamp(&key.name).ok();
        if current_mtime.is_some() && current_mtime == ast.info.source_mtime {
            return Ok(ast);
        }
        self.cache.remove(key);
        self.fetch_and_resolve(key, &key.name, caching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextDictionary;
    use crate::source::MemorySource;

    fn source_with(name: &str, body: &str) -> MemorySource {
        let s = MemorySource::new();
        s.insert(name, body);
        s
    }

    #[test]
    fn renders_a_simple_template_end_to_end() {
        let source = source_with("greet", "Hello #(name)!");
        let renderer = Renderer::new(Box::new(source), Options::default());
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("name", crate::value::Value::string("World"));
        context.register("self", dict);
        let out = renderer.render("greet", &context).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hello World!");
    }

    #[test]
    fn repeated_renders_reuse_the_cached_ast() {
        let source = source_with("greet", "hi #(name)");
        let renderer = Renderer::new(Box::new(source), Options::default());
        let mut context = Context::root(Options::default());
        let mut dict = ContextDictionary::new();
        dict.insert("name", crate::value::Value::string("A"));
        context.register("self", dict);
        renderer.render("greet", &context).unwrap();
        renderer.render("greet", &context).unwrap();
        let info = renderer.cache().info(&AstKey::new(SOURCE_ID, "greet")).unwrap();
        assert_eq!(info.touch_count, 2);
    }

    #[test]
    fn bypass_caching_still_renders_correctly() {
        let source = source_with("greet", "hi #(name)");
        let renderer = Renderer::new(Box::new(source), Options::default());
        let mut opts = Options::default();
        opts.caching = Caching::BYPASS;
        let mut context = Context::root(opts);
        let mut dict = ContextDictionary::new();
        dict.insert("name", crate::value::Value::string("B"));
        context.register("self", dict);
        let out = renderer.render("greet", &context).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hi B");
        assert!(renderer.cache().info(&AstKey::new(SOURCE_ID, "greet")).is_none());
    }
}
