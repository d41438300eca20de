use std::collections::BTreeMap;
use std::io::{Read, Seek};

use crate::entry::{IndexEntry, Stage};
use crate::error::IndexError;
use crate::extensions::{CacheTree, ResolveUndo};
use crate::legacy::{self, LegacyHeader};
use crate::{DeSerialise, Signature};

/// The in-memory model a decoded legacy index produces and the v5 planner
/// consumes.
///
/// `entries` holds stage-0 entries plus stage-1 entries (keeping the
/// ancestral state around means resolving a conflict does not force a full
/// rewrite); `conflicts` holds stages 1-3 keyed by directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Index {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
    pub conflicts: BTreeMap<String, Vec<IndexEntry>>,
    pub cache_tree: CacheTree,
    pub resolve_undo: ResolveUndo,
}

impl Index {
    pub fn new(version: u32) -> Index {
        Index {
            version,
            ..Index::default()
        }
    }

    /// The header this model would carry in the legacy format, for summary
    /// printing. The entry count is the number of on-disk records: stages 0
    /// and 1 from the entry list plus the higher stages, which only live in
    /// the conflict map.
    pub fn header(&self) -> LegacyHeader {
        let higher_stages = self
            .conflicts
            .values()
            .flatten()
            .filter(|e| matches!(e.stage(), Stage::Ours | Stage::Theirs))
            .count();
        LegacyHeader {
            signature: Signature::Dirc,
            version: self.version,
            nrofentries: (self.entries.len() + higher_stages) as u32,
        }
    }

    /// Files the v5 file block will carry.
    pub fn nfiles(&self) -> usize {
        self.entries.len()
    }

    pub fn nconflicted(&self) -> usize {
        self.conflicts.values().map(Vec::len).sum()
    }

    /// Routes a decoded entry by its merge stage.
    pub(crate) fn push_entry(&mut self, entry: IndexEntry) {
        match entry.stage() {
            Stage::Resolved => self.entries.push(entry),
            Stage::Base => {
                self.conflicts
                    .entry(entry.dir.clone())
                    .or_default()
                    .push(entry.clone());
                self.entries.push(entry);
            }
            Stage::Ours | Stage::Theirs => {
                self.conflicts
                    .entry(entry.dir.clone())
                    .or_default()
                    .push(entry);
            }
        }
    }
}

impl<T> DeSerialise<T> for Index {
    type Item = Index;

    fn deserialize(reader: &mut T) -> Result<Self::Item, IndexError>
    where
        T: Read + Seek,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        legacy::decode(&data)
    }
}
