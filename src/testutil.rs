use sha1::{Digest, Sha1};

use crate::entry::{split_path, IndexEntry, ObjectHash, Stage, OID_SIZE};

pub(crate) fn entry(path: &str) -> IndexEntry {
    entry_at_stage(path, Stage::Resolved)
}

pub(crate) fn entry_at_stage(path: &str, stage: Stage) -> IndexEntry {
    let (dir, filename) = split_path(path).unwrap();
    IndexEntry {
        ctime_sec: 1_700_000_000,
        ctime_nsec: 1,
        mtime_sec: 1_700_000_100,
        mtime_nsec: 2,
        dev: 2049,
        ino: 4242,
        mode: 0o100644,
        uid: 1000,
        gid: 1000,
        size: 42,
        objhash: ObjectHash([0x42; OID_SIZE]),
        flags: stage.bits() | (path.len().min(0xfff) as u16),
        xtflags: None,
        dir,
        filename,
    }
}

/// Assembles byte-exact v2/v3 index files, trailing SHA-1 included.
pub(crate) struct LegacyBuilder {
    version: u32,
    magic: [u8; 4],
    entries: Vec<IndexEntry>,
    claimed_entries: Option<u32>,
    extensions: Vec<u8>,
}

impl LegacyBuilder {
    pub(crate) fn new(version: u32) -> LegacyBuilder {
        LegacyBuilder {
            version,
            magic: *b"DIRC",
            entries: Vec::new(),
            claimed_entries: None,
            extensions: Vec::new(),
        }
    }

    pub(crate) fn magic(mut self, magic: &[u8; 4]) -> LegacyBuilder {
        self.magic = *magic;
        self
    }

    pub(crate) fn entry(mut self, path: &str, stage: Stage) -> LegacyBuilder {
        let mut entry = entry_at_stage(path, stage);
        if self.version == 3 {
            entry.xtflags = Some(0);
        }
        self.entries.push(entry);
        self
    }

    /// Overrides the entry count in the header, for truncation tests.
    pub(crate) fn claimed_entries(mut self, count: u32) -> LegacyBuilder {
        self.claimed_entries = Some(count);
        self
    }

    pub(crate) fn extension(mut self, signature: &[u8; 4], payload: &[u8]) -> LegacyBuilder {
        self.extensions.extend_from_slice(signature);
        self.extensions
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.extensions.extend_from_slice(payload);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.magic);
        data.extend_from_slice(&self.version.to_be_bytes());
        let count = self
            .claimed_entries
            .unwrap_or(self.entries.len() as u32);
        data.extend_from_slice(&count.to_be_bytes());

        for entry in &self.entries {
            encode_entry(&mut data, entry, self.version);
        }
        data.extend_from_slice(&self.extensions);

        let digest = Sha1::digest(&data);
        data.extend_from_slice(&digest);
        data
    }
}

fn encode_entry(data: &mut Vec<u8>, entry: &IndexEntry, version: u32) {
    let start = data.len();
    for word in [
        entry.ctime_sec,
        entry.ctime_nsec,
        entry.mtime_sec,
        entry.mtime_nsec,
        entry.dev,
        entry.ino,
        entry.mode,
        entry.uid,
        entry.gid,
        entry.size,
    ] {
        data.extend_from_slice(&word.to_be_bytes());
    }
    data.extend_from_slice(entry.objhash.as_bytes());
    data.extend_from_slice(&entry.flags.to_be_bytes());
    if version == 3 {
        data.extend_from_slice(&entry.xtflags.unwrap_or(0).to_be_bytes());
    }

    let path = entry.full_path();
    data.extend_from_slice(path.as_bytes());

    // NUL terminator plus padding up to the next multiple of 8.
    let pad = 8 - ((data.len() - start) % 8);
    data.extend(std::iter::repeat(0u8).take(pad));
    debug_assert_eq!(0, (data.len() - start) % 8);
}
