//! Cached file discovery.
//!
//! Glob traversal over a source tree is expensive enough to matter when the
//! watcher and the coordinator both ask for listings. Results are cached by
//! `(root, include, exclude)` and stay valid until the TTL expires or the
//! root directory's mtime moves forward. LRU eviction bounds memory.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use lru::LruCache;

/// Default cache TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default entry bound.
const DEFAULT_MAX_ENTRIES: usize = 100;

/// Discovery statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub cache_size: usize,
    pub hit_rate_percent: u32,
}

struct CacheEntry {
    files: Vec<PathBuf>,
    stored_at: Instant,
    root_mtime: SystemTime,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

/// Cached recursive scanner with mtime-keyed invalidation.
pub struct FileDiscoveryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    respect_gitignore: bool,
}

impl FileDiscoveryCache {
    pub fn new(respect_gitignore: bool) -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_TTL, respect_gitignore)
    }

    pub fn with_limits(max_entries: usize, ttl: Duration, respect_gitignore: bool) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
                evictions: 0,
                invalidations: 0,
            }),
            ttl,
            respect_gitignore,
        }
    }

    /// List files under `root` matching `include` and not `exclude`.
    ///
    /// Fatal only when the root itself is unreadable; per-entry I/O errors
    /// are skipped silently (the subtree just goes missing from the result).
    pub fn list_files(
        &self,
        root: &Path,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<PathBuf>, std::io::Error> {
        let root_meta = std::fs::metadata(root)?;
        let root_mtime = root_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let key = cache_key(root, include, exclude);

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.entry_status(&key, self.ttl, root_mtime) {
                EntryStatus::Valid => {
                    state.hits += 1;
                    let files = state
                        .entries
                        .get(&key)
                        .map(|e| e.files.clone())
                        .unwrap_or_default();
                    tracing::debug!(root = %root.display(), files = files.len(), "Discovery cache hit");
                    return Ok(files);
                }
                EntryStatus::Expired => {
                    state.entries.pop(&key);
                    state.evictions += 1;
                }
                EntryStatus::Stale => {
                    state.entries.pop(&key);
                    state.invalidations += 1;
                }
                EntryStatus::Missing => {}
            }
            state.misses += 1;
        }

        tracing::debug!(root = %root.display(), "Discovery cache miss, scanning");
        let files = self.scan(root, include, exclude);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.entries.len() == state.entries.cap().get()
            && !state.entries.contains(&key)
        {
            state.evictions += 1;
        }
        state.entries.put(
            key,
            CacheEntry {
                files: files.clone(),
                stored_at: Instant::now(),
                root_mtime,
            },
        );
        Ok(files)
    }

    /// Drop every cache entry under `root`. Returns the number removed.
    pub fn invalidate_root(&self, root: &Path) -> usize {
        let prefix = format!("{}|", root.display());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = state
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| k.starts_with(&prefix))
            .collect();
        for key in &keys {
            state.entries.pop(key);
            state.invalidations += 1;
        }
        keys.len()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let count = state.entries.len() as u64;
        state.entries.clear();
        state.evictions += count;
    }

    pub fn stats(&self) -> DiscoveryStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let total = state.hits + state.misses;
        let hit_rate_percent = if total > 0 {
            ((state.hits as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        };
        DiscoveryStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            invalidations: state.invalidations,
            cache_size: state.entries.len(),
            hit_rate_percent,
        }
    }

    /// Single recursive pass with non-symlink-following reads.
    fn scan(&self, root: &Path, include: &[String], exclude: &[String]) -> Vec<PathBuf> {
        let filter = IncludeFilter::from_patterns(include);
        let exclude_set = build_globset(exclude);
        let gitignore = if self.respect_gitignore {
            load_gitignore(root)
        } else {
            None
        };

        let mut files = Vec::new();
        scan_directory(
            root,
            root,
            &filter,
            exclude_set.as_ref(),
            gitignore.as_ref(),
            &mut files,
        );
        files.sort();
        files
    }
}

enum EntryStatus {
    Valid,
    Expired,
    Stale,
    Missing,
}

impl CacheState {
    fn entry_status(&mut self, key: &str, ttl: Duration, root_mtime: SystemTime) -> EntryStatus {
        let Some(entry) = self.entries.get(key) else {
            return EntryStatus::Missing;
        };
        if entry.stored_at.elapsed() > ttl {
            return EntryStatus::Expired;
        }
        if root_mtime > entry.root_mtime {
            return EntryStatus::Stale;
        }
        EntryStatus::Valid
    }
}

fn cache_key(root: &Path, include: &[String], exclude: &[String]) -> String {
    let mut inc: Vec<&str> = include.iter().map(|s| s.as_str()).collect();
    inc.sort_unstable();
    let mut exc: Vec<&str> = exclude.iter().map(|s| s.as_str()).collect();
    exc.sort_unstable();
    format!("{}|{}|{}", root.display(), inc.join("|"), exc.join("|"))
}

/// Fast include filter derived from the glob patterns: a suffix set for
/// `**/*X` patterns and a name set for `**/NAME` patterns.
struct IncludeFilter {
    suffixes: Vec<String>,
    special_names: HashSet<String>,
}

impl IncludeFilter {
    fn from_patterns(patterns: &[String]) -> Self {
        let mut suffixes = Vec::new();
        let mut special_names = HashSet::new();
        for pattern in patterns {
            if let Some(suffix) = pattern.strip_prefix("**/*") {
                if !suffix.is_empty() {
                    suffixes.push(suffix.to_string());
                }
            } else if let Some(name) = pattern.strip_prefix("**/") {
                if !name.is_empty() && !name.contains('*') {
                    special_names.insert(name.to_string());
                }
            }
        }
        Self {
            suffixes,
            special_names,
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        self.special_names.contains(file_name)
            || self.suffixes.iter().any(|s| file_name.ends_with(s.as_str()))
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Skipping invalid exclude glob");
            }
        }
    }
    builder.build().ok()
}

fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let path = root.join(".gitignore");
    if !path.is_file() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(root);
    builder.add(path);
    builder.build().ok()
}

fn scan_directory(
    root: &Path,
    dir: &Path,
    filter: &IncludeFilter,
    exclude: Option<&GlobSet>,
    gitignore: Option<&Gitignore>,
    out: &mut Vec<PathBuf>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // Inaccessible subtree: recorded as a miss, never an error.
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            // Hidden directories are always skipped.
            if name.starts_with('.') {
                continue;
            }
            if let Some(gi) = gitignore {
                if gi.matched(&path, true).is_ignore() {
                    continue;
                }
            }
            scan_directory(root, &path, filter, exclude, gitignore, out);
            continue;
        }

        if !file_type.is_file() || !filter.matches(&name) {
            continue;
        }
        if let Some(set) = exclude {
            if let Ok(rel) = path.strip_prefix(root) {
                if set.is_match(rel) {
                    continue;
                }
            }
        }
        if let Some(gi) = gitignore {
            if gi.matched(&path, false).is_ignore() {
                continue;
            }
        }
        out.push(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, "x").unwrap();
    }

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scan_matches_extensions_and_names() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");
        touch(dir.path(), "sub/b.py");
        touch(dir.path(), "sub/Makefile");
        touch(dir.path(), "c.txt");

        let cache = FileDiscoveryCache::new(false);
        let files = cache
            .list_files(
                dir.path(),
                &patterns(&["**/*.py", "**/Makefile"]),
                &[],
            )
            .unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 3);
        assert!(names.contains(&"a.py".to_string()));
        assert!(names.contains(&"Makefile".to_string()));
        assert!(!names.contains(&"c.txt".to_string()));
    }

    #[test]
    fn test_hidden_directories_skipped() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), ".hidden/x.py");
        touch(dir.path(), "visible/y.py");

        let cache = FileDiscoveryCache::new(false);
        let files = cache
            .list_files(dir.path(), &patterns(&["**/*.py"]), &[])
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("visible/y.py"));
    }

    #[test]
    fn test_exclude_globs() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/keep.py");
        touch(dir.path(), "vendor/skip.py");

        let cache = FileDiscoveryCache::new(false);
        let files = cache
            .list_files(
                dir.path(),
                &patterns(&["**/*.py"]),
                &patterns(&["vendor/**"]),
            )
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/keep.py"));
    }

    #[test]
    fn test_cache_hit_and_stats() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");

        let cache = FileDiscoveryCache::new(false);
        let include = patterns(&["**/*.py"]);
        cache.list_files(dir.path(), &include, &[]).unwrap();
        cache.list_files(dir.path(), &include, &[]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.hit_rate_percent, 50);
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");

        let cache =
            FileDiscoveryCache::with_limits(10, Duration::from_millis(0), false);
        let include = patterns(&["**/*.py"]);
        cache.list_files(dir.path(), &include, &[]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.list_files(dir.path(), &include, &[]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_lru_eviction_bound() {
        let base = TempDir::new().unwrap();
        let cache = FileDiscoveryCache::with_limits(2, DEFAULT_TTL, false);
        for i in 0..3 {
            let sub = base.path().join(format!("p{}", i));
            std::fs::create_dir_all(&sub).unwrap();
            touch(&sub, "a.py");
            cache.list_files(&sub, &patterns(&["**/*.py"]), &[]).unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.cache_size, 2);
        assert!(stats.evictions >= 1);
    }

    #[test]
    fn test_invalidate_root() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a.py");

        let cache = FileDiscoveryCache::new(false);
        cache
            .list_files(dir.path(), &patterns(&["**/*.py"]), &[])
            .unwrap();
        let removed = cache.invalidate_root(dir.path());
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[test]
    fn test_unreadable_root_is_fatal() {
        let cache = FileDiscoveryCache::new(false);
        let err = cache.list_files(
            Path::new("/nonexistent/definitely/missing"),
            &patterns(&["**/*.py"]),
            &[],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_gitignore_respected() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "keep.py");
        touch(dir.path(), "generated.py");
        std::fs::write(dir.path().join(".gitignore"), "generated.py\n").unwrap();

        let cache = FileDiscoveryCache::new(true);
        let files = cache
            .list_files(dir.path(), &patterns(&["**/*.py"]), &[])
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.py"));
    }
}
