//! Compact per-entry metadata and its text serialisation.
//!
//! Only mode and mtime are replicated; ownership and ACLs are not. Symlinks
//! are exempt from mode and mtime comparison (neither can be set on a link),
//! directories from size and mtime.

use std::fs::Metadata;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use md5::{Digest, Md5};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    pub is_dir: bool,
    pub is_link: bool,
    /// POSIX permissions; only the low 9 bits are meaningful.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub size: i64,
    /// Lazily computed MD5 of the file contents, hex-encoded. Filled only in
    /// hash-check mode, and only when an mtime mismatch forces a content read.
    pub hash: Option<String>,
}

impl EntryStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            is_dir: meta.is_dir(),
            is_link: meta.file_type().is_symlink(),
            mode: meta.mode() & 0o777,
            mtime: meta.mtime(),
            size: meta.size() as i64,
            hash: None,
        }
    }

    /// Text form: `[dir ][symlink ]mode=<octal> mtime=<dec> size=<dec>`.
    pub fn serialize(&self) -> String {
        let mut res = String::new();
        if self.is_dir {
            res.push_str("dir ");
        }
        if self.is_link {
            res.push_str("symlink ");
        }
        res.push_str(&format!(
            "mode={:o} mtime={} size={}",
            self.mode, self.mtime, self.size
        ));
        res
    }

    /// Inverse of [`serialize`]. Unknown tokens are ignored, malformed numbers
    /// read as zero; a corrupt stat line yields a zeroed record rather than an
    /// error, matching the tolerant wire parser this format was built for.
    pub fn unserialize(input: &str) -> Self {
        let mut result = Self {
            is_dir: false,
            is_link: false,
            mode: 0,
            mtime: 0,
            size: 0,
            hash: None,
        };
        for part in input.split(' ') {
            if part == "dir" {
                result.is_dir = true;
            } else if part == "symlink" {
                result.is_link = true;
            } else if let Some(rest) = part.strip_prefix("mode=") {
                result.mode = u32::from_str_radix(rest, 8).unwrap_or(0);
            } else if let Some(rest) = part.strip_prefix("mtime=") {
                result.mtime = rest.parse().unwrap_or(0);
            } else if let Some(rest) = part.strip_prefix("size=") {
                result.size = rest.parse().unwrap_or(0);
            }
        }
        result
    }

    /// MD5 of the file contents at `path`, computed once and cached.
    pub fn content_hash(&mut self, path: &Path) -> Option<&str> {
        if self.hash.is_none() {
            self.hash = md5_of_file(path);
        }
        self.hash.as_deref()
    }
}

/// Compare a freshly lstat-ed record against the previously stored one.
///
/// When `hash_check` is on and only the mtime differs, the new record's
/// content hash is compared against the hash cached on the old record; the
/// hash is computed (and cached on `new`) at most once.
pub fn stats_equal(path: &Path, new: &mut EntryStat, old: &EntryStat, hash_check: bool) -> bool {
    if new.is_dir != old.is_dir {
        return false;
    }
    if new.is_link != old.is_link {
        return false;
    }
    // mode cannot be set on a symlink, so it is not compared for one
    if !old.is_link && (old.mode & 0o777) != (new.mode & 0o777) {
        return false;
    }
    if !old.is_dir && old.size != new.size {
        return false;
    }
    // mtime is neither set for directories nor settable on symlinks
    if !old.is_link && !old.is_dir && old.mtime != new.mtime {
        return hash_check
            && old.hash.is_some()
            && old.hash.as_deref() == new.content_hash(path);
    }
    true
}

fn md5_of_file(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(_) => return None,
        }
    }
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn plain(mode: u32, mtime: i64, size: i64) -> EntryStat {
        EntryStat {
            is_dir: false,
            is_link: false,
            mode,
            mtime,
            size,
            hash: None,
        }
    }

    #[test]
    fn test_serialize_file() {
        let stat = plain(0o644, 1700000000, 12);
        assert_eq!(stat.serialize(), "mode=644 mtime=1700000000 size=12");
    }

    #[test]
    fn test_serialize_dir_and_symlink_prefixes() {
        let mut stat = plain(0o755, 5, 0);
        stat.is_dir = true;
        assert!(stat.serialize().starts_with("dir "));
        stat.is_dir = false;
        stat.is_link = true;
        assert!(stat.serialize().starts_with("symlink "));
    }

    #[test]
    fn test_unserialize_roundtrip() {
        for stat in [
            plain(0o644, 1700000000, 12),
            {
                let mut s = plain(0o755, 0, 0);
                s.is_dir = true;
                s
            },
            {
                let mut s = plain(0o777, 123, 9);
                s.is_link = true;
                s
            },
        ] {
            let back = EntryStat::unserialize(&stat.serialize());
            assert_eq!(back.is_dir, stat.is_dir);
            assert_eq!(back.is_link, stat.is_link);
            assert_eq!(back.mode, stat.mode);
            assert_eq!(back.mtime, stat.mtime);
            assert_eq!(back.size, stat.size);
        }
    }

    #[test]
    fn test_stats_equal_reflexive() {
        let path = PathBuf::from("/nonexistent");
        for stat in [plain(0o644, 42, 7), {
            let mut s = plain(0o755, 0, 0);
            s.is_dir = true;
            s
        }] {
            let mut fresh = stat.clone();
            assert!(stats_equal(&path, &mut fresh, &stat, false));
        }
    }

    #[test]
    fn test_stats_equal_symlink_exemptions() {
        let path = PathBuf::from("/nonexistent");
        let mut old = plain(0o777, 100, 6);
        old.is_link = true;
        // symlinks: neither mode nor mtime participate
        let mut new = old.clone();
        new.mode = 0o755;
        new.mtime = 200;
        assert!(stats_equal(&path, &mut new, &old, false));
        // but size still does
        new.size = 7;
        assert!(!stats_equal(&path, &mut new, &old, false));
    }

    #[test]
    fn test_stats_equal_dir_ignores_size_and_mtime() {
        let path = PathBuf::from("/nonexistent");
        let mut old = plain(0o755, 100, 4096);
        old.is_dir = true;
        let mut new = old.clone();
        new.size = 8192;
        new.mtime = 200;
        assert!(stats_equal(&path, &mut new, &old, false));
    }

    #[test]
    fn test_stats_equal_mtime_mismatch() {
        let path = PathBuf::from("/nonexistent");
        let old = plain(0o644, 100, 5);
        let mut new = plain(0o644, 200, 5);
        assert!(!stats_equal(&path, &mut new, &old, false));
        // hash-check mode cannot save it either: the old record carries no
        // hash and the file does not exist
        assert!(!stats_equal(&path, &mut new, &old, true));
    }

    #[test]
    fn test_stats_equal_hash_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"same content").unwrap();

        let mut old = plain(0o644, 100, 12);
        old.content_hash(&file);
        assert!(old.hash.is_some());

        let mut new = plain(0o644, 200, 12);
        assert!(stats_equal(&file, &mut new, &old, true));
        // the computed hash is cached on the new record
        assert_eq!(new.hash, old.hash);

        std::fs::write(&file, b"other stuff!").unwrap();
        let mut changed = plain(0o644, 300, 12);
        assert!(!stats_equal(&file, &mut changed, &old, true));
    }
}
