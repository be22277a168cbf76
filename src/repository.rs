//! In-memory snapshot of the source tree: directory -> (name -> stat).
//!
//! Keys are `/`-separated paths relative to the source root, without a
//! leading `./`. The root itself is `.`. Only the change engine mutates the
//! repository after the initial full scan.

use std::collections::{HashMap, HashSet};

use crate::stat::EntryStat;

/// Name of the state directory under the source root; always excluded.
pub const STATE_DIR: &str = ".unrealsync";

pub struct Repository {
    dirs: HashMap<String, HashMap<String, EntryStat>>,
    excludes: HashSet<String>,
}

impl Repository {
    pub fn new(excludes: HashSet<String>) -> Self {
        Self {
            dirs: HashMap::new(),
            excludes,
        }
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.dirs.contains_key(dir)
    }

    /// Entries of `dir`, creating the empty mapping if absent.
    pub fn dir_entries_mut(&mut self, dir: &str) -> &mut HashMap<String, EntryStat> {
        self.dirs.entry(dir.to_string()).or_default()
    }

    pub fn dir_entries(&self, dir: &str) -> Option<&HashMap<String, EntryStat>> {
        self.dirs.get(dir)
    }

    /// Record `file` inside `dir`, creating the directory mapping if needed.
    /// Used by the big-file sender to pre-register a transfer so the next
    /// rescan does not re-trigger it.
    pub fn insert(&mut self, dir: &str, file: &str, stat: EntryStat) {
        self.dir_entries_mut(dir).insert(file.to_string(), stat);
    }

    /// True when `path` (relative, `/`-separated) falls under the state
    /// directory or a configured exclude prefix.
    pub fn is_excluded(&self, path: &str) -> bool {
        if path.starts_with(STATE_DIR) {
            return true;
        }
        self.excludes.iter().any(|ex| path.starts_with(ex.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> EntryStat {
        EntryStat {
            is_dir: false,
            is_link: false,
            mode: 0o644,
            mtime: 1,
            size: 2,
            hash: None,
        }
    }

    #[test]
    fn test_dir_lifecycle() {
        let mut repo = Repository::new(HashSet::new());
        assert!(!repo.has_dir("a"));
        repo.dir_entries_mut("a");
        assert!(repo.has_dir("a"));
        repo.insert("a", "f", stat());
        assert_eq!(repo.dir_entries("a").unwrap().len(), 1);
    }

    #[test]
    fn test_excludes() {
        let mut ex = HashSet::new();
        ex.insert("vendor".to_string());
        let repo = Repository::new(ex);
        assert!(repo.is_excluded(".unrealsync/out.log"));
        assert!(repo.is_excluded("vendor/lib"));
        assert!(!repo.is_excluded("src/lib.rs"));
    }
}
