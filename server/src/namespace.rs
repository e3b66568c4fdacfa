//! In-memory metadata namespace.
//!
//! A path-keyed tree of directories and files, enough to give client
//! requests real semantics. Executor threads apply requests against it;
//! all access goes through one mutex since metadata operations are short.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use protocol_meta::{Request, RequestKind};

pub const ENOENT: i32 = -2;
pub const EEXIST: i32 = -17;
pub const ENOTDIR: i32 = -20;
pub const EISDIR: i32 = -21;
pub const EINVAL: i32 = -22;
pub const ENOTEMPTY: i32 = -39;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: EntryKind,
    id: u64,
}

struct Tree {
    entries: BTreeMap<String, Entry>,
    next_id: u64,
}

/// The metadata tree.
pub struct Namespace {
    tree: Mutex<Tree>,
}

impl Namespace {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                kind: EntryKind::Dir,
                id: 1,
            },
        );
        Namespace {
            tree: Mutex::new(Tree {
                entries,
                next_id: 2,
            }),
        }
    }

    /// Execute a request, filling in its status and response body.
    pub fn apply(&self, req: &mut Request) {
        match req.kind.clone() {
            RequestKind::Ping | RequestKind::Disconnect => {}
            RequestKind::Lookup { path } | RequestKind::Stat { path } => {
                self.stat(&path, req)
            }
            RequestKind::Mkdir { path } => self.insert(&path, EntryKind::Dir, req),
            RequestKind::Create { path } => self.insert(&path, EntryKind::File, req),
            RequestKind::Rmdir { path } => self.remove(&path, EntryKind::Dir, req),
            RequestKind::Remove { path } => self.remove(&path, EntryKind::File, req),
            RequestKind::Rename { old_path, new_path } => {
                self.rename(&old_path, &new_path, req)
            }
            RequestKind::Readdir { path } => self.readdir(&path, req),
        }
    }

    fn stat(&self, path: &str, req: &mut Request) {
        let Some(path) = normalize(path) else {
            return req.fail(EINVAL, "invalid path");
        };
        let tree = self.tree.lock();
        match tree.entries.get(&path) {
            Some(entry) => {
                req.body = describe(entry);
            }
            None => req.fail(ENOENT, "no such entry"),
        }
    }

    fn insert(&self, path: &str, kind: EntryKind, req: &mut Request) {
        let Some(path) = normalize(path) else {
            return req.fail(EINVAL, "invalid path");
        };
        if path == "/" {
            return req.fail(EEXIST, "entry exists");
        }
        let mut tree = self.tree.lock();
        match tree.entries.get(parent_of(&path)) {
            Some(p) if p.kind == EntryKind::Dir => {}
            Some(_) => return req.fail(ENOTDIR, "parent is not a directory"),
            None => return req.fail(ENOENT, "no such parent directory"),
        }
        if tree.entries.contains_key(&path) {
            return req.fail(EEXIST, "entry exists");
        }
        let id = tree.next_id;
        tree.next_id += 1;
        tree.entries.insert(path, Entry { kind, id });
        req.body = format!("Id: {id}\r\n");
    }

    fn remove(&self, path: &str, kind: EntryKind, req: &mut Request) {
        let Some(path) = normalize(path) else {
            return req.fail(EINVAL, "invalid path");
        };
        if path == "/" {
            return req.fail(EINVAL, "cannot remove root");
        }
        let mut tree = self.tree.lock();
        let entry = match tree.entries.get(&path) {
            Some(e) => *e,
            None => return req.fail(ENOENT, "no such entry"),
        };
        match (entry.kind, kind) {
            (EntryKind::Dir, EntryKind::File) => return req.fail(EISDIR, "is a directory"),
            (EntryKind::File, EntryKind::Dir) => {
                return req.fail(ENOTDIR, "not a directory")
            }
            _ => {}
        }
        if entry.kind == EntryKind::Dir && has_children(&tree.entries, &path) {
            return req.fail(ENOTEMPTY, "directory not empty");
        }
        tree.entries.remove(&path);
    }

    fn rename(&self, old: &str, new: &str, req: &mut Request) {
        let (Some(old), Some(new)) = (normalize(old), normalize(new)) else {
            return req.fail(EINVAL, "invalid path");
        };
        if old == "/" || new == "/" {
            return req.fail(EINVAL, "cannot rename root");
        }
        if new == old || new.starts_with(&format!("{old}/")) {
            return req.fail(EINVAL, "destination inside source");
        }
        let mut tree = self.tree.lock();
        if !tree.entries.contains_key(&old) {
            return req.fail(ENOENT, "no such entry");
        }
        match tree.entries.get(parent_of(&new)) {
            Some(p) if p.kind == EntryKind::Dir => {}
            Some(_) => return req.fail(ENOTDIR, "parent is not a directory"),
            None => return req.fail(ENOENT, "no such parent directory"),
        }
        if tree.entries.contains_key(&new) {
            return req.fail(EEXIST, "entry exists");
        }
        // Move the entry and, for directories, everything beneath it.
        let prefix = format!("{old}/");
        let moved: Vec<String> = tree
            .entries
            .range(old.clone()..)
            .take_while(|(k, _)| **k == old || k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in moved {
            let entry = tree.entries.remove(&key).expect("key listed above");
            let suffix = &key[old.len()..];
            tree.entries.insert(format!("{new}{suffix}"), entry);
        }
    }

    fn readdir(&self, path: &str, req: &mut Request) {
        let Some(path) = normalize(path) else {
            return req.fail(EINVAL, "invalid path");
        };
        let tree = self.tree.lock();
        match tree.entries.get(&path) {
            Some(e) if e.kind == EntryKind::Dir => {}
            Some(_) => return req.fail(ENOTDIR, "not a directory"),
            None => return req.fail(ENOENT, "no such entry"),
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let names: Vec<&str> = tree
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| &k[prefix.len()..])
            .collect();
        let mut body = format!("Entries: {}\r\n", names.len());
        for name in names {
            let _ = write!(body, "{name}\r\n");
        }
        req.body = body;
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new()
    }
}

fn describe(entry: &Entry) -> String {
    let kind = match entry.kind {
        EntryKind::Dir => "dir",
        EntryKind::File => "file",
    };
    format!("Type: {kind}\r\nId: {}\r\n", entry.id)
}

/// Absolute path with no trailing slash (other than root), no empty or dot
/// components.
fn normalize(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Some("/".to_string());
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/').skip(1) {
        if part.is_empty() || part == "." || part == ".." {
            return None;
        }
        parts.push(part);
    }
    Some(format!("/{}", parts.join("/")))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn has_children(entries: &BTreeMap<String, Entry>, path: &str) -> bool {
    let prefix = format!("{path}/");
    entries
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(k, _)| k.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_meta::PROTO_VERSION;

    fn run(ns: &Namespace, kind: RequestKind) -> Request {
        let mut req = Request::new(kind, 1, PROTO_VERSION);
        ns.apply(&mut req);
        req
    }

    #[test]
    fn mkdir_then_stat() {
        let ns = Namespace::new();
        let req = run(&ns, RequestKind::Mkdir { path: "/a".into() });
        assert_eq!(req.status, 0);
        let req = run(&ns, RequestKind::Stat { path: "/a".into() });
        assert_eq!(req.status, 0);
        assert!(req.body.contains("Type: dir"));
    }

    #[test]
    fn mkdir_requires_parent() {
        let ns = Namespace::new();
        let req = run(&ns, RequestKind::Mkdir { path: "/a/b".into() });
        assert_eq!(req.status, ENOENT);
    }

    #[test]
    fn create_twice_fails() {
        let ns = Namespace::new();
        assert_eq!(run(&ns, RequestKind::Create { path: "/f".into() }).status, 0);
        assert_eq!(
            run(&ns, RequestKind::Create { path: "/f".into() }).status,
            EEXIST
        );
    }

    #[test]
    fn rmdir_refuses_nonempty() {
        let ns = Namespace::new();
        run(&ns, RequestKind::Mkdir { path: "/a".into() });
        run(&ns, RequestKind::Create { path: "/a/f".into() });
        assert_eq!(
            run(&ns, RequestKind::Rmdir { path: "/a".into() }).status,
            ENOTEMPTY
        );
        assert_eq!(
            run(&ns, RequestKind::Remove { path: "/a/f".into() }).status,
            0
        );
        assert_eq!(run(&ns, RequestKind::Rmdir { path: "/a".into() }).status, 0);
    }

    #[test]
    fn remove_of_directory_fails() {
        let ns = Namespace::new();
        run(&ns, RequestKind::Mkdir { path: "/a".into() });
        assert_eq!(
            run(&ns, RequestKind::Remove { path: "/a".into() }).status,
            EISDIR
        );
    }

    #[test]
    fn rename_moves_subtree() {
        let ns = Namespace::new();
        run(&ns, RequestKind::Mkdir { path: "/a".into() });
        run(&ns, RequestKind::Create { path: "/a/f".into() });
        let req = run(
            &ns,
            RequestKind::Rename {
                old_path: "/a".into(),
                new_path: "/b".into(),
            },
        );
        assert_eq!(req.status, 0);
        assert_eq!(run(&ns, RequestKind::Stat { path: "/a".into() }).status, ENOENT);
        assert_eq!(run(&ns, RequestKind::Stat { path: "/b/f".into() }).status, 0);
    }

    #[test]
    fn rename_into_own_subtree_fails() {
        let ns = Namespace::new();
        run(&ns, RequestKind::Mkdir { path: "/a".into() });
        let req = run(
            &ns,
            RequestKind::Rename {
                old_path: "/a".into(),
                new_path: "/a/b".into(),
            },
        );
        assert_eq!(req.status, EINVAL);
    }

    #[test]
    fn readdir_lists_immediate_children() {
        let ns = Namespace::new();
        run(&ns, RequestKind::Mkdir { path: "/a".into() });
        run(&ns, RequestKind::Create { path: "/a/x".into() });
        run(&ns, RequestKind::Mkdir { path: "/a/d".into() });
        run(&ns, RequestKind::Create { path: "/a/d/deep".into() });
        let req = run(&ns, RequestKind::Readdir { path: "/a".into() });
        assert_eq!(req.status, 0);
        assert!(req.body.starts_with("Entries: 2\r\n"));
        assert!(req.body.contains("x\r\n"));
        assert!(req.body.contains("d\r\n"));
        assert!(!req.body.contains("deep"));
    }

    #[test]
    fn paths_are_normalized() {
        let ns = Namespace::new();
        assert_eq!(run(&ns, RequestKind::Mkdir { path: "/a/".into() }).status, 0);
        assert_eq!(run(&ns, RequestKind::Stat { path: "/a".into() }).status, 0);
        assert_eq!(
            run(&ns, RequestKind::Stat { path: "relative".into() }).status,
            EINVAL
        );
        assert_eq!(
            run(&ns, RequestKind::Stat { path: "/a/../b".into() }).status,
            EINVAL
        );
    }
}
