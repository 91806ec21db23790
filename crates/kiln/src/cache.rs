//! Thread-safe AST cache, keyed by `(source, name)`.
//!
//! Two independent reader-writer locks separate the AST data from the
//! pending touch statistics, so a render that only wants to record a touch
//! never contends with a concurrent `retrieve`. Per the spec's lock
//! ordering rule, the touch lock is always acquired after the data lock
//! when both are needed.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::syntax::{Ast, AstKey, Info};

/// One execution sample recorded against a cached AST.
#[derive(Debug, Clone, Copy)]
pub struct Touch {
    pub exec_time: Duration,
    pub output_size: u64,
}

/// Pending, not-yet-flushed touch samples for one AST key.
#[derive(Debug, Clone, Default)]
struct PendingTouch {
    count: u64,
    total_exec_time: Duration,
    total_output_size: u64,
}

const TOUCH_FLUSH_THRESHOLD: u64 = 128;

/// The process-wide (or per-renderer) AST cache.
pub struct Cache {
    data: RwLock<HashMap<AstKey, Ast>>,
    touches: RwLock<HashMap<AstKey, PendingTouch>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            touches: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `ast`. If an entry already exists and `replace` is false,
    /// the existing entry is returned unchanged and `ast` is dropped.
    pub fn insert(&self, ast: Ast, replace: bool) -> Ast {
        let mut data = self.data.write().expect("cache data lock poisoned");
        if !replace {
            if let Some(existing) = data.get(&ast.key) {
                return existing.clone();
            }
        }
        data.insert(ast.key.clone(), ast.clone());
        ast
    }

    #[must_use]
    pub fn retrieve(&self, key: &AstKey) -> Option<Ast> {
        let ast = {
            let data = self.data.read().expect("cache data lock poisoned");
            data.get(key).cloned()
        };
        if ast.is_some() {
            self.flush_if_pending(key);
        }
        ast
    }

    pub fn remove(&self, key: &AstKey) -> Option<bool> {
        let mut data = self.data.write().expect("cache data lock poisoned");
        let removed = data.remove(key).is_some();
        drop(data);
        let mut touches = self.touches.write().expect("cache touch lock poisoned");
        touches.remove(key);
        Some(removed)
    }

    #[must_use]
    pub fn info(&self, key: &AstKey) -> Option<Info> {
        self.flush_if_pending(key);
        let data = self.data.read().expect("cache data lock poisoned");
        data.get(key).map(|a| a.info.clone())
    }

    /// Records a render sample against `key`'s running averages. Flushes
    /// immediately once the pending count reaches `TOUCH_FLUSH_THRESHOLD`.
    pub fn touch(&self, key: &AstKey, touch: Touch) {
        let should_flush = {
            let mut touches = self.touches.write().expect("cache touch lock poisoned");
            let pending = touches.entry(key.clone()).or_default();
            pending.count += 1;
            pending.total_exec_time += touch.exec_time;
            pending.total_output_size += touch.output_size;
            pending.count >= TOUCH_FLUSH_THRESHOLD
        };
        if should_flush {
            self.flush(key);
        }
    }

    pub fn drop_all(&self) {
        self.data.write().expect("cache data lock poisoned").clear();
        self.touches.write().expect("cache touch lock poisoned").clear();
    }

    fn flush_if_pending(&self, key: &AstKey) {
        let has_pending = {
            let touches = self.touches.read().expect("cache touch lock poisoned");
            touches.get(key).is_some_and(|p| p.count > 0)
        };
        if has_pending {
            self.flush(key);
        }
    }

    fn flush(&self, key: &AstKey) {
        let pending = {
            let mut touches = self.touches.write().expect("cache touch lock poisoned");
            touches.remove(key)
        };
        let Some(pending) = pending else { return };
        if pending.count == 0 {
            return;
        }
        let mut data = self.data.write().expect("cache data lock poisoned");
        if let Some(ast) = data.get_mut(key) {
            let prior_count = ast.info.touch_count;
            let new_count = prior_count + pending.count;
            let avg_exec_ms =
                pending.total_exec_time.as_secs_f64() * 1000.0 / pending.count as f64;
            let avg_size = pending.total_output_size as f64 / pending.count as f64;
            ast.info.avg_exec_time = weighted_average(ast.info.avg_exec_time, prior_count, avg_exec_ms, pending.count);
            ast.info.avg_output_size =
                weighted_average(ast.info.avg_output_size, prior_count, avg_size, pending.count);
            ast.info.touch_count = new_count;
        }
    }
}

fn weighted_average(prior: f64, prior_count: u64, batch: f64, batch_count: u64) -> f64 {
    let total = prior_count + batch_count;
    if total == 0 {
        return 0.0;
    }
    (prior * prior_count as f64 + batch * batch_count as f64) / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::AstKey;

    fn empty_ast(name: &str) -> Ast {
        Ast::new(AstKey::new("fs", name), vec![])
    }

    #[test]
    fn insert_then_retrieve_round_trips() {
        let cache = Cache::new();
        let key = AstKey::new("fs", "a");
        cache.insert(empty_ast("a"), true);
        assert!(cache.retrieve(&key).is_some());
    }

    #[test]
    fn insert_without_replace_keeps_existing() {
        let cache = Cache::new();
        let key = AstKey::new("fs", "a");
        let mut first = empty_ast("a");
        first.info.touch_count = 1;
        cache.insert(first, true);
        let mut second = empty_ast("a");
        second.info.touch_count = 99;
        cache.insert(second, false);
        assert_eq!(cache.info(&key).unwrap().touch_count, 1);
    }

    #[test]
    fn touch_flushes_at_threshold() {
        let cache = Cache::new();
        let key = AstKey::new("fs", "a");
        cache.insert(empty_ast("a"), true);
        for _ in 0..TOUCH_FLUSH_THRESHOLD {
            cache.touch(&key, Touch { exec_time: Duration::from_millis(1), output_size: 10 });
        }
        let info = cache.info(&key).unwrap();
        assert_eq!(info.touch_count, TOUCH_FLUSH_THRESHOLD);
        assert_eq!(info.avg_output_size, 10.0);
    }

    #[test]
    fn remove_clears_data_and_pending_touches() {
        let cache = Cache::new();
        let key = AstKey::new("fs", "a");
        cache.insert(empty_ast("a"), true);
        cache.touch(&key, Touch { exec_time: Duration::from_millis(1), output_size: 1 });
        assert_eq!(cache.remove(&key), Some(true));
        assert!(cache.retrieve(&key).is_none());
    }
}
