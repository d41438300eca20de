use std::collections::BTreeMap;

use crate::entry::ObjectHash;
use crate::error::IndexError;
use crate::parse_utils::{str_field, t_delim_name, t_nul_name, t_oid};

/// Cache-tree nodes keyed by their joined full path ending in '/'; the root
/// key is the empty string.
pub type CacheTree = BTreeMap<String, CacheTreeNode>;

/// Resolve-undo records grouped by the directory prefix of their path.
pub type ResolveUndo = BTreeMap<String, Vec<ResolveUndoRecord>>;

/// One memoised tree: how many index entries the directory covers and the
/// hash of the tree object they would produce. `entry_count == -1` marks the
/// memoisation invalid; an invalid node carries no hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTreeNode {
    pub entry_count: i32,
    pub subtree_count: u32,
    pub objname: Option<ObjectHash>,
}

impl CacheTreeNode {
    pub fn is_valid(&self) -> bool {
        self.entry_count >= 0
    }
}

/// The three merge ancestries of a once-conflicted path. A missing stage has
/// mode 0 and no hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveUndoRecord {
    pub path: String,
    pub modes: [u32; 3],
    pub hashes: [Option<ObjectHash>; 3],
}

/// Decodes the payload of a `TREE` extension.
///
/// Each record is a NUL-terminated path component relative to its parent, a
/// space-terminated decimal entry count (literal `-1` = invalid), a
/// newline-terminated decimal subtree count, and a 20-byte tree hash iff the
/// node is valid. Full paths are rebuilt from a stack of
/// (path, remaining subtrees) frames.
pub fn decode_cache_tree(data: &[u8]) -> Result<CacheTree, IndexError> {
    let mut tree = CacheTree::new();
    let mut stack: Vec<(String, u32)> = Vec::new();
    let mut input = data;

    while !input.is_empty() {
        let (rest, component) =
            t_nul_name(input).map_err(|_| IndexError::Truncated("cache-tree path"))?;
        let (rest, count_raw) =
            t_delim_name(b' ')(rest).map_err(|_| IndexError::Truncated("cache-tree entry count"))?;
        let (rest, subtrees_raw) = t_delim_name(b'\n')(rest)
            .map_err(|_| IndexError::Truncated("cache-tree subtree count"))?;

        let component = str_field("cache-tree path", component)?;
        let entry_count = ascii_i32("cache-tree entry count", count_raw)?;
        if entry_count < -1 {
            return Err(IndexError::MalformedField(
                "cache-tree entry count",
                entry_count.to_string(),
            ));
        }
        let subtree_count = ascii_u32("cache-tree subtree count", subtrees_raw)?;

        let (rest, objname) = if entry_count >= 0 {
            let (rest, oid) =
                t_oid(rest).map_err(|_| IndexError::Truncated("cache-tree object hash"))?;
            (rest, Some(oid))
        } else {
            (rest, None)
        };
        input = rest;

        // Frames whose subtrees have all arrived are done.
        while matches!(stack.last(), Some((_, 0))) {
            stack.pop();
        }

        let full = match stack.last_mut() {
            Some((parent, remaining)) => {
                *remaining -= 1;
                format!("{parent}{component}/")
            }
            None if component.is_empty() => String::new(),
            None => format!("{component}/"),
        };

        tree.insert(
            full.clone(),
            CacheTreeNode {
                entry_count,
                subtree_count,
                objname,
            },
        );
        stack.push((full, subtree_count));
    }

    Ok(tree)
}

/// Decodes the payload of a `REUC` extension: per record a NUL-terminated
/// path, three NUL-terminated octal mode strings, then one 20-byte hash for
/// every stage whose mode is non-zero.
pub fn decode_resolve_undo(data: &[u8]) -> Result<ResolveUndo, IndexError> {
    let mut reuc = ResolveUndo::new();
    let mut input = data;

    while !input.is_empty() {
        let (rest, path) =
            t_nul_name(input).map_err(|_| IndexError::Truncated("resolve-undo path"))?;
        let path = str_field("resolve-undo path", path)?;

        let mut modes = [0u32; 3];
        let mut rest = rest;
        for mode in modes.iter_mut() {
            let (r, raw) =
                t_nul_name(rest).map_err(|_| IndexError::Truncated("resolve-undo mode"))?;
            *mode = octal_u32("resolve-undo mode", raw)?;
            rest = r;
        }

        let mut hashes = [None; 3];
        for (stage, hash) in hashes.iter_mut().enumerate() {
            if modes[stage] != 0 {
                let (r, oid) =
                    t_oid(rest).map_err(|_| IndexError::Truncated("resolve-undo object hash"))?;
                *hash = Some(oid);
                rest = r;
            }
        }
        input = rest;

        let dir = match path.rfind('/') {
            Some(i) => path[..i].to_string(),
            None => String::new(),
        };
        reuc.entry(dir).or_default().push(ResolveUndoRecord {
            path,
            modes,
            hashes,
        });
    }

    Ok(reuc)
}

fn ascii_i32(what: &'static str, raw: &[u8]) -> Result<i32, IndexError> {
    let text = str_field(what, raw)?;
    text.parse()
        .map_err(|_| IndexError::MalformedField(what, text))
}

fn ascii_u32(what: &'static str, raw: &[u8]) -> Result<u32, IndexError> {
    let text = str_field(what, raw)?;
    text.parse()
        .map_err(|_| IndexError::MalformedField(what, text))
}

fn octal_u32(what: &'static str, raw: &[u8]) -> Result<u32, IndexError> {
    let text = str_field(what, raw)?;
    u32::from_str_radix(&text, 8).map_err(|_| IndexError::MalformedField(what, text))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::OID_SIZE;
    use crate::error::IndexError;

    fn tree_record(component: &str, counts: &str, oid: Option<u8>) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(component.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(counts.as_bytes());
        if let Some(fill) = oid {
            bytes.extend_from_slice(&[fill; OID_SIZE]);
        }
        bytes
    }

    #[test]
    fn decodes_nested_cache_tree() {
        let mut data = Vec::new();
        data.extend_from_slice(&tree_record("", "3 1\n", Some(0xaa)));
        data.extend_from_slice(&tree_record("sub", "2 1\n", Some(0xbb)));
        data.extend_from_slice(&tree_record("deep", "1 0\n", Some(0xcc)));

        let tree = decode_cache_tree(&data).unwrap();

        assert_eq!(3, tree.len());
        let root = &tree[""];
        assert_eq!(3, root.entry_count);
        assert_eq!(1, root.subtree_count);
        assert_eq!(Some(ObjectHash([0xaa; OID_SIZE])), root.objname);

        assert!(tree.contains_key("sub/"));
        let deep = &tree["sub/deep/"];
        assert_eq!(1, deep.entry_count);
        assert_eq!(Some(ObjectHash([0xcc; OID_SIZE])), deep.objname);
    }

    #[test]
    fn sibling_subtrees_pop_back_to_the_parent() {
        let mut data = Vec::new();
        data.extend_from_slice(&tree_record("", "4 2\n", Some(0x01)));
        data.extend_from_slice(&tree_record("a", "1 0\n", Some(0x02)));
        data.extend_from_slice(&tree_record("b", "1 0\n", Some(0x03)));

        let tree = decode_cache_tree(&data).unwrap();

        assert!(tree.contains_key("a/"));
        // "b" is a sibling of "a", not its child
        assert!(tree.contains_key("b/"));
        assert!(!tree.contains_key("a/b/"));
    }

    #[test]
    fn invalid_node_has_no_hash() {
        let data = tree_record("", "-1 0\n", None);

        let tree = decode_cache_tree(&data).unwrap();

        let root = &tree[""];
        assert!(!root.is_valid());
        assert_eq!(None, root.objname);
    }

    #[test]
    fn non_numeric_entry_count_is_malformed() {
        let data = tree_record("", "x 0\n", None);

        assert!(matches!(
            decode_cache_tree(&data),
            Err(IndexError::MalformedField("cache-tree entry count", _))
        ));
    }

    #[test]
    fn truncated_hash_is_reported() {
        let mut data = tree_record("", "1 0\n", None);
        data.extend_from_slice(&[0xaa; 4]); // 4 of the 20 hash bytes

        assert!(matches!(
            decode_cache_tree(&data),
            Err(IndexError::Truncated("cache-tree object hash"))
        ));
    }

    fn reuc_record(path: &str, modes: [&str; 3], hashes: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
        for mode in modes {
            bytes.extend_from_slice(mode.as_bytes());
            bytes.push(0);
        }
        for fill in hashes {
            bytes.extend_from_slice(&[*fill; OID_SIZE]);
        }
        bytes
    }

    #[test]
    fn decodes_resolve_undo_with_missing_stage() {
        let data = reuc_record("dir/file", ["100644", "0", "100755"], &[0x11, 0x33]);

        let reuc = decode_resolve_undo(&data).unwrap();

        let records = &reuc["dir"];
        assert_eq!(1, records.len());
        let record = &records[0];
        assert_eq!("dir/file", record.path);
        assert_eq!([0o100644, 0, 0o100755], record.modes);
        assert_eq!(Some(ObjectHash([0x11; OID_SIZE])), record.hashes[0]);
        assert_eq!(None, record.hashes[1]);
        assert_eq!(Some(ObjectHash([0x33; OID_SIZE])), record.hashes[2]);
    }

    #[test]
    fn root_level_path_keys_under_the_empty_directory() {
        let data = reuc_record("file", ["100644", "100644", "100644"], &[0x01, 0x02, 0x03]);

        let reuc = decode_resolve_undo(&data).unwrap();

        assert!(reuc.contains_key(""));
        assert_eq!("file", reuc[""][0].path);
    }

    #[test]
    fn modes_parse_as_octal() {
        let data = reuc_record("file", ["100644", "0", "0"], &[0x01]);

        let reuc = decode_resolve_undo(&data).unwrap();
        assert_eq!(0o100644, reuc[""][0].modes[0]);
    }

    #[test]
    fn non_octal_mode_is_malformed() {
        let data = reuc_record("file", ["100698", "0", "0"], &[0x01]);

        assert!(matches!(
            decode_resolve_undo(&data),
            Err(IndexError::MalformedField("resolve-undo mode", _))
        ));
    }
}
