//! CommonJS-style resolution and compilation, §4.2.
//!
//! Unlike the grounding codebase, which loads ES modules through
//! `deno_core::ModuleLoader` against database-resident source, this system
//! wraps each file as `(function(module,exports,require,__filename,__dirname)
//! {...})` and hands the wrapped text to a JS-side `require` implemented in
//! the bootstrap script (`bridge::BOOTSTRAP_SCRIPT`). That JS-side `Module
//! _cache` Map *is* the per-execution cache from §4.2 — the grounding
//! codebase's cyclic-require handling (partial `module.exports` visible to
//! the back edge) is a JS-land concern in both systems, so that part is kept
//! as ordinary CommonJS loader JS rather than reimplemented in Rust.
//!
//! What Rust owns is resolution against the VFS and the **cross-execution**
//! cache: `(function_id, package_hash, absolute_path) -> wrapped source
//! text`, bounded by `module_cache_max` with LRU eviction. Unlike the
//! engine facade's metadata/policy snapshot cache, this one is a plain
//! `Mutex<LruCache>` rather than `async_lru::AsyncLru`: reads come off local
//! disk through [`Vfs::read_sync`], so there is no expensive async
//! computation worth coalescing, and keeping it synchronous lets
//! `require()` stay synchronous end to end in the guest, matching real
//! CommonJS semantics.

use std::{num::NonZeroUsize, path::Path, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;
use rt_errors::RuntimeError;
use tracing::{debug, trace};

use crate::vfs::Vfs;

/// Modules resolvable by bare specifier without touching the VFS — the
/// fixed builtin surface from §4.3. Arbitrary package resolution is
/// explicitly unsupported.
pub const BUILTIN_MODULES: &[&str] = &["path", "fs", "http", "https", "net", "dns", "buffer", "util"];

pub fn is_builtin(specifier: &str) -> bool {
    BUILTIN_MODULES.contains(&specifier)
}

#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct ModuleCacheKey {
    function_id: String,
    package_hash: String,
    absolute_path: String,
}

/// Resolves specifiers against a VFS and caches wrapped CJS source text
/// across executions.
pub struct ModuleLoader {
    cache: Mutex<LruCache<ModuleCacheKey, Arc<String>>>,
}

impl ModuleLoader {
    pub fn new(max_size: usize) -> Self {
        let max_size = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(max_size)),
        }
    }

    /// Implements §4.2 resolution rules 2-3 (rule 1, builtins, is handled in
    /// JS before this is ever called).
    pub fn resolve(
        &self,
        vfs: &Vfs,
        caller_dir: &Path,
        specifier: &str,
    ) -> Result<std::path::PathBuf, RuntimeError> {
        if !(specifier.starts_with("./") || specifier.starts_with("../")) {
            return Err(RuntimeError::ModuleNotFound {
                specifier: specifier.to_string(),
                from: caller_dir.display().to_string(),
            });
        }
        for candidate in [
            specifier.to_string(),
            format!("{specifier}.js"),
            format!("{}/index.js", specifier.trim_end_matches('/')),
        ] {
            if let Ok(resolved) = vfs.resolve(caller_dir, &candidate) {
                return Ok(resolved);
            }
        }
        Err(RuntimeError::ModuleNotFound {
            specifier: specifier.to_string(),
            from: caller_dir.display().to_string(),
        })
    }

    /// Returns the wrapped `(function(module,exports,require,__filename,
    /// __dirname){...})` source for `absolute_path`, computing and caching
    /// it on miss.
    pub fn load_wrapped(
        &self,
        vfs: &Vfs,
        function_id: &str,
        package_hash: &str,
        absolute_path: &Path,
    ) -> Result<Arc<String>, RuntimeError> {
        let key = ModuleCacheKey {
            function_id: function_id.to_string(),
            package_hash: package_hash.to_string(),
            absolute_path: absolute_path.display().to_string(),
        };
        if let Some(hit) = self.cache.lock().get(&key) {
            trace!(path = %absolute_path.display(), "module cache hit");
            return Ok(hit.clone());
        }
        trace!(path = %absolute_path.display(), "module cache miss, compiling");
        let source = vfs.read_sync(absolute_path)?;
        let text = String::from_utf8(source).map_err(|e| RuntimeError::ParseError {
            path: absolute_path.display().to_string(),
            message: format!("not valid utf-8: {e}"),
        })?;
        let wrapped = Arc::new(wrap_commonjs(&text, absolute_path));
        self.cache.lock().put(key, wrapped.clone());
        Ok(wrapped)
    }

    /// Drops every cached entry belonging to `function_id`. Used on
    /// invalidation events (§4.7); since the cache key embeds
    /// `package_hash`, a version bump alone already makes old entries
    /// unreachable, but we still reclaim eagerly rather than waiting for
    /// LRU pressure.
    pub fn invalidate_function(&self, function_id: &str) {
        let mut cache = self.cache.lock();
        let stale: Vec<ModuleCacheKey> = cache
            .iter()
            .filter(|(k, _)| k.function_id == function_id)
            .map(|(k, _)| k.clone())
            .collect();
        let evicted = stale.len();
        for key in stale {
            cache.pop(&key);
        }
        debug!(function_id, evicted, "module cache entries invalidated");
    }
}

fn wrap_commonjs(source: &str, absolute_path: &Path) -> String {
    let path_str = absolute_path.display().to_string();
    format!(
        "(function(module,exports,require,__filename,__dirname){{\n{source}\n}})\n//# sourceURL={path_str}"
    )
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn wraps_and_caches_source() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), b"module.exports = 1;").unwrap();
        let vfs = Vfs::mount(dir.path());
        let loader = ModuleLoader::new(8);
        let path = Path::new("/app/index.js");

        let wrapped = loader.load_wrapped(&vfs, "fn1", "hash1", path).unwrap();
        assert!(wrapped.contains("module.exports = 1;"));
        assert!(wrapped.starts_with("(function(module,exports,require,__filename,__dirname){"));

        std::fs::write(dir.path().join("index.js"), b"module.exports = 2;").unwrap();
        let wrapped_again = loader.load_wrapped(&vfs, "fn1", "hash1", path).unwrap();
        assert_eq!(wrapped, wrapped_again);
    }

    #[test]
    fn package_hash_change_busts_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), b"module.exports = 1;").unwrap();
        let vfs = Vfs::mount(dir.path());
        let loader = ModuleLoader::new(8);
        let path = Path::new("/app/index.js");

        loader.load_wrapped(&vfs, "fn1", "hash1", path).unwrap();
        std::fs::write(dir.path().join("index.js"), b"module.exports = 2;").unwrap();
        let wrapped = loader.load_wrapped(&vfs, "fn1", "hash2", path).unwrap();
        assert!(wrapped.contains("module.exports = 2;"));
    }

    #[test]
    fn resolve_rejects_bare_specifiers() {
        let dir = TempDir::new().unwrap();
        let vfs = Vfs::mount(dir.path());
        let loader = ModuleLoader::new(8);
        let err = loader.resolve(&vfs, Path::new("/app"), "left-pad").unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleNotFound { .. }));
    }

    #[test]
    fn invalidate_function_drops_only_its_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.js"), b"1").unwrap();
        let vfs = Vfs::mount(dir.path());
        let loader = ModuleLoader::new(8);
        let path = Path::new("/app/a.js");
        loader.load_wrapped(&vfs, "fn1", "hash1", path).unwrap();
        loader.load_wrapped(&vfs, "fn2", "hash1", path).unwrap();
        loader.invalidate_function("fn1");
        assert_eq!(loader.cache.lock().len(), 1);
    }
}
