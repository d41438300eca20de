use std::collections::{BTreeMap, BTreeSet};

use crate::entry::{IndexEntry, ObjectHash, FLAG_CONFLICTED, FLAG_STAGE_MASK, FLAG_STAGE_SHIFT};
use crate::error::IndexError;
use crate::index::Index;
use crate::v5::records::{ConflictGroup, ConflictStage, DirRecord};

/// The planned shape of a sharded index before any offsets exist: every
/// directory record with its counts and cache-tree data, the file list in
/// block order, and the conflict groups in block order. The writer fills in
/// `foffset`, `cr` and `ncr`.
#[derive(Debug)]
pub struct Layout {
    pub dirs: Vec<DirRecord>,

    /// (directory index, entry), grouped by directory in directory order.
    pub files: Vec<(usize, IndexEntry)>,

    /// (directory index, group), grouped by directory in directory order.
    pub conflicts: Vec<(usize, ConflictGroup)>,
}

impl Layout {
    pub fn plan(index: &Index) -> Result<Layout, IndexError> {
        // The directory set is the closure of every referenced directory
        // under prefix-taking. Empty ancestors matter: each path prefix that
        // owns a descendant entry needs its own record.
        let mut pathnames: BTreeSet<String> = BTreeSet::new();
        pathnames.insert(String::new());
        for entry in &index.entries {
            insert_with_ancestors(&mut pathnames, &entry.dir);
        }
        for dir in index.conflicts.keys().chain(index.resolve_undo.keys()) {
            insert_with_ancestors(&mut pathnames, dir);
        }

        // BTreeSet iteration is already the on-disk order: the root's empty
        // pathname first, then trailing-slash names byte-wise, which keeps
        // every subtree contiguous behind its parent.
        let mut dirs: Vec<DirRecord> = pathnames
            .iter()
            .map(|pathname| DirRecord::empty(pathname.clone()))
            .collect();

        let by_path: BTreeMap<String, usize> = dirs
            .iter()
            .enumerate()
            .map(|(i, dir)| (dir.dir_path().to_string(), i))
            .collect();

        for i in 0..dirs.len() {
            let path = dirs[i].dir_path();
            if path.is_empty() {
                continue;
            }
            let parent = match path.rfind('/') {
                Some(cut) => &path[..cut],
                None => "",
            };
            let parent = *by_path
                .get(parent)
                .ok_or_else(|| missing_directory(parent))?;
            dirs[parent].nsubtrees += 1;
        }

        let mut files = Vec::with_capacity(index.entries.len());
        for entry in &index.entries {
            let owner = *by_path
                .get(&entry.dir)
                .ok_or_else(|| missing_directory(&entry.dir))?;
            dirs[owner].nfiles += 1;
            files.push((owner, entry.clone()));
        }
        files.sort_by(|(da, a), (db, b)| {
            da.cmp(db)
                .then_with(|| a.filename.cmp(&b.filename))
                .then_with(|| a.full_path().cmp(&b.full_path()))
        });

        for dir in dirs.iter_mut() {
            if let Some(node) = index.cache_tree.get(&dir.pathname) {
                if node.is_valid() {
                    dir.nentries = node.entry_count as u32;
                    dir.objname = node.objname.unwrap_or(ObjectHash::ZERO);
                }
            }
        }

        let mut conflicts = Vec::new();
        for (i, dir) in dirs.iter().enumerate() {
            for group in conflict_groups(index, dir.dir_path()) {
                conflicts.push((i, group));
            }
        }

        Ok(Layout {
            dirs,
            files,
            conflicts,
        })
    }
}

fn insert_with_ancestors(pathnames: &mut BTreeSet<String>, dir: &str) {
    let mut dir = dir;
    while !dir.is_empty() {
        pathnames.insert(format!("{dir}/"));
        dir = match dir.rfind('/') {
            Some(cut) => &dir[..cut],
            None => "",
        };
    }
}

/// Conflict groups of one directory: live conflicted entries and replayed
/// resolve-undo ancestries, merged per path, stages ascending.
fn conflict_groups(index: &Index, dir_path: &str) -> Vec<ConflictGroup> {
    let mut by_path: BTreeMap<String, Vec<ConflictStage>> = BTreeMap::new();

    if let Some(entries) = index.conflicts.get(dir_path) {
        for entry in entries {
            by_path
                .entry(entry.full_path())
                .or_default()
                .push(ConflictStage {
                    flags: (entry.flags & FLAG_STAGE_MASK) | FLAG_CONFLICTED,
                    mode: entry.mode as u16,
                    objhash: entry.objhash,
                });
        }
    }

    if let Some(records) = index.resolve_undo.get(dir_path) {
        for record in records {
            let stages = by_path.entry(record.path.clone()).or_default();
            for (i, mode) in record.modes.iter().enumerate() {
                if *mode != 0 {
                    stages.push(ConflictStage {
                        flags: (i as u16 + 1) << FLAG_STAGE_SHIFT,
                        mode: *mode as u16,
                        objhash: record.hashes[i].unwrap_or(ObjectHash::ZERO),
                    });
                }
            }
        }
    }

    by_path
        .into_iter()
        .filter(|(_, stages)| !stages.is_empty())
        .map(|(path, mut stages)| {
            stages.sort_by_key(ConflictStage::stage_bits);
            ConflictGroup { path, stages }
        })
        .collect()
}

fn missing_directory(dir: &str) -> IndexError {
    IndexError::InvariantViolation(format!(
        "directory {dir:?} is referenced but missing from the planned set"
    ))
}
