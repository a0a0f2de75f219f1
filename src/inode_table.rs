//! In-memory inode bookkeeping: which real paths are known to reference each
//! inode, and how many kernel-side lookups are still outstanding.
//!
//! Inode numbers are the backing filesystem's own; this table only tracks
//! them. An entry lives from the first lookup that discovers the inode until
//! the kernel's forget notifications bring its reference count back to zero.

use libc::c_int;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};

pub const ROOT_INODE: u64 = fuser::FUSE_ROOT_ID;

/// Real paths currently referencing one inode. A file with hardlinks expands
/// to `Multiple`; removing the second-to-last path collapses it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSet {
    Single(OsString),
    Multiple(HashSet<OsString>),
}

impl PathSet {
    /// Any one path. With hardlinks every member is equally valid for
    /// operations that do not depend on the specific name.
    pub fn any(&self) -> &OsStr {
        match self {
            PathSet::Single(path) => path,
            PathSet::Multiple(paths) => paths
                .iter()
                .next()
                .expect("multiple path-set is never empty"),
        }
    }

    fn insert(&mut self, path: OsString) {
        match self {
            PathSet::Single(existing) => {
                if *existing != path {
                    let mut paths = HashSet::with_capacity(2);
                    paths.insert(std::mem::take(existing));
                    paths.insert(path);
                    *self = PathSet::Multiple(paths);
                }
            }
            PathSet::Multiple(paths) => {
                paths.insert(path);
            }
        }
    }

    /// Removes a path; returns true when no path remains.
    fn remove(&mut self, path: &OsStr) -> bool {
        match self {
            PathSet::Single(existing) => existing.as_os_str() == path,
            PathSet::Multiple(paths) => {
                paths.remove(path);
                if paths.len() == 1 {
                    let last = paths.drain().next().expect("one path left");
                    *self = PathSet::Single(last);
                }
                false
            }
        }
    }

    /// Aborts when `old` is not a tracked path; a path-set that disagrees
    /// with the kernel's view is unrecoverable corruption.
    fn replace(&mut self, old: &OsStr, new: OsString) {
        match self {
            PathSet::Single(existing) => {
                assert_eq!(existing.as_os_str(), old, "renamed path was not tracked");
                *existing = new;
            }
            PathSet::Multiple(paths) => {
                assert!(paths.remove(old), "renamed path was not tracked");
                paths.insert(new);
            }
        }
    }
}

#[derive(Debug)]
struct InodeEntry {
    /// None once every known path was unlinked while the kernel still holds
    /// lookup references; resolve fails until the final forget arrives.
    paths: Option<PathSet>,
    lookup_count: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    entries: HashMap<u64, InodeEntry>,
}

impl InodeTable {
    /// Seeds the root inode with the source directory. The root is created
    /// once and never forgotten.
    pub fn new(root_path: OsString) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INODE,
            InodeEntry {
                paths: Some(PathSet::Single(root_path)),
                lookup_count: 1,
            },
        );
        Self { entries }
    }

    pub fn is_tracked(&self, ino: u64) -> bool {
        self.entries.contains_key(&ino)
    }

    /// Any one real path for the inode, or ENOENT when it is not tracked.
    pub fn resolve(&self, ino: u64) -> Result<&OsStr, c_int> {
        self.entries
            .get(&ino)
            .and_then(|entry| entry.paths.as_ref())
            .map(PathSet::any)
            .ok_or(libc::ENOENT)
    }

    /// Registers one kernel lookup of `path` resolving to `ino`.
    pub fn record_lookup(&mut self, ino: u64, path: OsString) {
        debug!("record_lookup for {}, {:?}", ino, path);
        let entry = self.entries.entry(ino).or_insert(InodeEntry {
            paths: None,
            lookup_count: 0,
        });
        entry.lookup_count += 1;
        match entry.paths.as_mut() {
            Some(paths) => paths.insert(path),
            None => entry.paths = Some(PathSet::Single(path)),
        }
    }

    /// Releases `nlookup` references; returns true when the entry was
    /// dropped. The root inode is exempt.
    pub fn forget(&mut self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return false;
        };
        if entry.lookup_count > nlookup {
            entry.lookup_count -= nlookup;
            return false;
        }
        debug!("forgetting about inode {}", ino);
        self.entries.remove(&ino);
        true
    }

    /// Drops a path after unlink/rmdir. Untracked inodes are ignored, since
    /// nothing references them client-side.
    pub fn remove_path(&mut self, ino: u64, path: &OsStr) {
        debug!("remove path {:?} for {}", path, ino);
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        if let Some(paths) = entry.paths.as_mut() {
            if paths.remove(path) {
                entry.paths = None;
            }
        }
    }

    /// Swaps `old` for `new` in the path-set after a rename.
    pub fn rename_path(&mut self, ino: u64, old: &OsStr, new: OsString) {
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        if let Some(paths) = entry.paths.as_mut() {
            paths.replace(old, new);
        }
    }
}
