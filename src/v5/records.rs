use crc::{Crc, CRC_32_ISO_HDLC};
use nom::sequence::tuple;
use nom::IResult;

use crate::entry::{IndexEntry, ObjectHash};
use crate::error::IndexError;
use crate::parse_utils::{str_field, t_nul_name, t_oid, t_sign, t_u16, t_u32};
use crate::v5::V5_VERSION;
use crate::{Crc32, Serialise, Signature, Validation};

/// Header of a sharded index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V5Header {
    // MUST be 0x44495243, "DIRC" as UTF-8.
    pub signature: Signature,

    pub version: u32,

    // Number of directory records, the root included.
    pub ndir: u32,

    // Number of file records across all directories.
    pub nfile: u32,

    // Absolute offset of the file block, i.e. of the first file record; the
    // file-offset table sits immediately before it.
    pub fblockoffset: u32,

    // Number of trailing extensions. This writer emits none.
    pub nextensions: u32,
}

impl V5Header {
    pub const SIGN: &'static [u8] = b"DIRC";
    pub const SIZE: usize = 24;
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
}

impl Crc32 for V5Header {
    fn crc32(&self) -> u32 {
        let mut digest = V5Header::CRC.digest();
        self.crc32_from_digest(&mut digest);
        digest.finalize()
    }

    fn crc32_from_digest(&self, digest: &mut crc::Digest<u32>) {
        digest.update(V5Header::SIGN);
        digest.update(&self.version.to_be_bytes());
        digest.update(&self.ndir.to_be_bytes());
        digest.update(&self.nfile.to_be_bytes());
        digest.update(&self.fblockoffset.to_be_bytes());
        digest.update(&self.nextensions.to_be_bytes());
    }
}

impl Validation for V5Header {
    fn validate(&self) -> Result<(), IndexError> {
        if self.signature != Signature::Dirc {
            return Err(IndexError::SignatureError(
                Signature::Dirc,
                self.signature.clone(),
            ));
        }

        if self.version != V5_VERSION {
            return Err(IndexError::VersionError(self.version));
        }

        Ok(())
    }
}

pub(crate) fn parse_v5_header(input: &[u8]) -> IResult<&[u8], V5Header> {
    let (rest, (signature, version, ndir, nfile, fblockoffset, nextensions)) =
        tuple((t_sign, t_u32, t_u32, t_u32, t_u32, t_u32))(input)?;
    Ok((
        rest,
        V5Header {
            signature,
            version,
            ndir,
            nfile,
            fblockoffset,
            nextensions,
        },
    ))
}

/// One directory record in the directory block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    // On-disk spelling: "" for the root, "<path>/" for everything else. The
    // trailing '/' makes a pathname comparable against full file names
    // during the merge walk.
    pub pathname: String,

    pub flags: u16,

    // Offset of this directory's first file record, relative to the file
    // block. A directory without direct files records where its files would
    // have begun.
    pub foffset: u32,

    // Absolute offset of this directory's first conflict group, 0 if none.
    pub cr: u32,

    // Number of conflict groups belonging to this directory.
    pub ncr: u32,

    pub nsubtrees: u32,
    pub nfiles: u32,

    // Entry count from a valid cache-tree node, 0 otherwise.
    pub nentries: u32,

    // Tree hash from a valid cache-tree node, zeroes otherwise.
    pub objname: ObjectHash,
}

impl DirRecord {
    // flags through objname.
    pub const DATA_SIZE: usize = 46;
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    pub(crate) fn empty(pathname: String) -> DirRecord {
        DirRecord {
            pathname,
            flags: 0,
            foffset: 0,
            cr: 0,
            ncr: 0,
            nsubtrees: 0,
            nfiles: 0,
            nentries: 0,
            objname: ObjectHash::ZERO,
        }
    }

    /// The pathname without its trailing separator; empty for the root.
    pub fn dir_path(&self) -> &str {
        self.pathname.strip_suffix('/').unwrap_or(&self.pathname)
    }
}

impl Crc32 for DirRecord {
    fn crc32(&self) -> u32 {
        let mut digest = DirRecord::CRC.digest();
        self.crc32_from_digest(&mut digest);
        digest.finalize()
    }

    fn crc32_from_digest(&self, digest: &mut crc::Digest<u32>) {
        digest.update(self.pathname.as_bytes());
        digest.update(&[0]);
        digest.update(&self.flags.to_be_bytes());
        digest.update(&self.foffset.to_be_bytes());
        digest.update(&self.cr.to_be_bytes());
        digest.update(&self.ncr.to_be_bytes());
        digest.update(&self.nsubtrees.to_be_bytes());
        digest.update(&self.nfiles.to_be_bytes());
        digest.update(&self.nentries.to_be_bytes());
        digest.update(self.objname.as_bytes());
    }
}

impl Serialise for DirRecord {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.pathname.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.foffset.to_be_bytes());
        buf.extend_from_slice(&self.cr.to_be_bytes());
        buf.extend_from_slice(&self.ncr.to_be_bytes());
        buf.extend_from_slice(&self.nsubtrees.to_be_bytes());
        buf.extend_from_slice(&self.nfiles.to_be_bytes());
        buf.extend_from_slice(&self.nentries.to_be_bytes());
        buf.extend_from_slice(self.objname.as_bytes());
        buf.extend_from_slice(&self.crc32().to_be_bytes());
    }
}

pub(crate) fn parse_dir_record(input: &[u8]) -> Result<(&[u8], DirRecord), IndexError> {
    let (rest, pathname) =
        t_nul_name(input).map_err(|_| IndexError::Truncated("directory pathname"))?;
    let (rest, (flags, foffset, cr, ncr, nsubtrees, nfiles, nentries, objname)) =
        tuple((t_u16, t_u32, t_u32, t_u32, t_u32, t_u32, t_u32, t_oid))(rest)
            .map_err(|_| IndexError::Truncated("directory record"))?;
    let (rest, stored) =
        t_u32(rest).map_err(|_| IndexError::Truncated("directory record crc"))?;

    let pathname = str_field("directory pathname", pathname)?;
    let record = DirRecord {
        pathname,
        flags,
        foffset,
        cr,
        ncr,
        nsubtrees,
        nfiles,
        nentries,
        objname,
    };

    let computed = record.crc32();
    if stored != computed {
        return Err(IndexError::crc_mismatch(
            format!("directory record \"{}\"", record.pathname),
            stored,
            computed,
        ));
    }
    Ok((rest, record))
}

/// One file record in the file block. The record's own CRC covers its
/// relative offset as well, so a record copied to the wrong place fails
/// verification even when its bytes are intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub flags: u16,
    pub mode: u16,
    pub mtime_sec: u32,
    pub mtime_nsec: u32,

    // CRC over the stat fields whose change must invalidate the fast stat
    // comparison: foffset, ctime, ino, size, dev, uid, gid.
    pub stat_crc: u32,

    pub objhash: ObjectHash,
}

impl FileRecord {
    // flags through objhash.
    pub const DATA_SIZE: usize = 36;
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    pub(crate) fn from_entry(entry: &IndexEntry, foffset: u32) -> FileRecord {
        FileRecord {
            filename: entry.filename.clone(),
            flags: entry.flags,
            mode: entry.mode as u16,
            mtime_sec: entry.mtime_sec,
            mtime_nsec: entry.mtime_nsec,
            stat_crc: stat_crc(entry, foffset),
            objhash: entry.objhash,
        }
    }

    pub fn record_crc(&self, foffset: u32) -> u32 {
        let mut digest = FileRecord::CRC.digest();
        digest.update(&foffset.to_be_bytes());
        digest.update(self.filename.as_bytes());
        digest.update(&[0]);
        digest.update(&self.flags.to_be_bytes());
        digest.update(&self.mode.to_be_bytes());
        digest.update(&self.mtime_sec.to_be_bytes());
        digest.update(&self.mtime_nsec.to_be_bytes());
        digest.update(&self.stat_crc.to_be_bytes());
        digest.update(self.objhash.as_bytes());
        digest.finalize()
    }

    pub(crate) fn serialize_with_offset(&self, foffset: u32, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.filename.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf.extend_from_slice(&self.mtime_sec.to_be_bytes());
        buf.extend_from_slice(&self.mtime_nsec.to_be_bytes());
        buf.extend_from_slice(&self.stat_crc.to_be_bytes());
        buf.extend_from_slice(self.objhash.as_bytes());
        buf.extend_from_slice(&self.record_crc(foffset).to_be_bytes());
    }
}

/// CRC of the stat snapshot, bound to the record's position.
pub(crate) fn stat_crc(entry: &IndexEntry, foffset: u32) -> u32 {
    let mut digest = FileRecord::CRC.digest();
    for word in [
        foffset,
        entry.ctime_sec,
        entry.ctime_nsec,
        entry.ino,
        entry.size,
        entry.dev,
        entry.uid,
        entry.gid,
    ] {
        digest.update(&word.to_be_bytes());
    }
    digest.finalize()
}

pub(crate) fn parse_file_record<'a>(
    input: &'a [u8],
    foffset: u32,
    dir_pathname: &str,
) -> Result<(&'a [u8], FileRecord), IndexError> {
    let (rest, filename) =
        t_nul_name(input).map_err(|_| IndexError::Truncated("file record name"))?;
    let (rest, (flags, mode, mtime_sec, mtime_nsec, stat_crc, objhash)) =
        tuple((t_u16, t_u16, t_u32, t_u32, t_u32, t_oid))(rest)
            .map_err(|_| IndexError::Truncated("file record"))?;
    let (rest, stored) = t_u32(rest).map_err(|_| IndexError::Truncated("file record crc"))?;

    let filename = str_field("file record name", filename)?;
    let record = FileRecord {
        filename,
        flags,
        mode,
        mtime_sec,
        mtime_nsec,
        stat_crc,
        objhash,
    };

    let computed = record.record_crc(foffset);
    if stored != computed {
        return Err(IndexError::crc_mismatch(
            format!("file record \"{}{}\"", dir_pathname, record.filename),
            stored,
            computed,
        ));
    }
    Ok((rest, record))
}

/// One merge ancestry inside a conflict group. Stage bits sit in their
/// legacy position; records taken from live conflicted entries carry the
/// conflict marker on top, resolve-undo replays do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictStage {
    pub flags: u16,
    pub mode: u16,
    pub objhash: ObjectHash,
}

impl ConflictStage {
    pub fn stage_bits(&self) -> u16 {
        (self.flags >> 12) & 0x3
    }
}

/// All recorded ancestries of one path, sorted by ascending stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictGroup {
    pub path: String,
    pub stages: Vec<ConflictStage>,
}

impl ConflictGroup {
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
}

impl Crc32 for ConflictGroup {
    fn crc32(&self) -> u32 {
        let mut digest = ConflictGroup::CRC.digest();
        self.crc32_from_digest(&mut digest);
        digest.finalize()
    }

    fn crc32_from_digest(&self, digest: &mut crc::Digest<u32>) {
        digest.update(self.path.as_bytes());
        digest.update(&[0]);
        digest.update(&(self.stages.len() as u32).to_be_bytes());
        for stage in &self.stages {
            digest.update(&stage.flags.to_be_bytes());
            digest.update(&stage.mode.to_be_bytes());
            digest.update(stage.objhash.as_bytes());
        }
    }
}

impl Serialise for ConflictGroup {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(self.stages.len() as u32).to_be_bytes());
        for stage in &self.stages {
            buf.extend_from_slice(&stage.flags.to_be_bytes());
            buf.extend_from_slice(&stage.mode.to_be_bytes());
            buf.extend_from_slice(stage.objhash.as_bytes());
        }
        buf.extend_from_slice(&self.crc32().to_be_bytes());
    }
}

pub(crate) fn parse_conflict_group(input: &[u8]) -> Result<(&[u8], ConflictGroup), IndexError> {
    let (rest, path) = t_nul_name(input).map_err(|_| IndexError::Truncated("conflict path"))?;
    let (mut rest, count) = t_u32(rest).map_err(|_| IndexError::Truncated("conflict count"))?;

    let mut stages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (r, (flags, mode, objhash)) = tuple((t_u16, t_u16, t_oid))(rest)
            .map_err(|_| IndexError::Truncated("conflict stage"))?;
        stages.push(ConflictStage {
            flags,
            mode,
            objhash,
        });
        rest = r;
    }
    let (rest, stored) = t_u32(rest).map_err(|_| IndexError::Truncated("conflict record crc"))?;

    let group = ConflictGroup {
        path: str_field("conflict path", path)?,
        stages,
    };
    let computed = group.crc32();
    if stored != computed {
        return Err(IndexError::crc_mismatch(
            format!("conflict record \"{}\"", group.path),
            stored,
            computed,
        ));
    }
    Ok((rest, group))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::OID_SIZE;
    use crate::testutil::entry;

    #[test]
    fn header_crc_covers_the_exact_struct_image() {
        let header = V5Header {
            signature: Signature::Dirc,
            version: V5_VERSION,
            ndir: 3,
            nfile: 7,
            fblockoffset: 0x100,
            nextensions: 0,
        };

        let mut image = Vec::new();
        image.extend_from_slice(V5Header::SIGN);
        for word in [5u32, 3, 7, 0x100, 0] {
            image.extend_from_slice(&word.to_be_bytes());
        }
        assert_eq!(V5Header::SIZE, image.len());
        assert_eq!(V5Header::CRC.checksum(&image), header.crc32());
    }

    #[test]
    fn header_validation_checks_magic_and_version() {
        let mut header = V5Header {
            signature: Signature::Dirc,
            version: V5_VERSION,
            ndir: 0,
            nfile: 0,
            fblockoffset: 0,
            nextensions: 0,
        };
        assert!(header.validate().is_ok());

        header.version = 2;
        assert!(matches!(
            header.validate(),
            Err(IndexError::VersionError(2))
        ));

        header.version = V5_VERSION;
        header.signature = Signature::Unknown(b"link".to_vec());
        assert!(matches!(
            header.validate(),
            Err(IndexError::SignatureError(Signature::Dirc, _))
        ));
    }

    #[test]
    fn dir_record_round_trips_through_its_own_bytes() {
        let mut record = DirRecord::empty("src/".to_string());
        record.foffset = 12;
        record.nsubtrees = 1;
        record.nfiles = 2;
        record.nentries = 3;
        record.objname = ObjectHash([0xab; OID_SIZE]);

        let mut bytes = Vec::new();
        record.serialize(&mut bytes);
        assert_eq!("src/".len() + 1 + DirRecord::DATA_SIZE + 4, bytes.len());

        let (rest, parsed) = parse_dir_record(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(record, parsed);
        assert_eq!("src", parsed.dir_path());
    }

    #[test]
    fn dir_record_with_a_flipped_byte_fails_its_crc() {
        let mut bytes = Vec::new();
        DirRecord::empty("src/".to_string()).serialize(&mut bytes);
        bytes[7] ^= 0x40;

        assert!(matches!(
            parse_dir_record(&bytes),
            Err(IndexError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn file_record_round_trips_at_its_offset() {
        let record = FileRecord::from_entry(&entry("src/lib.rs"), 64);

        let mut bytes = Vec::new();
        record.serialize_with_offset(64, &mut bytes);
        assert_eq!("lib.rs".len() + 1 + FileRecord::DATA_SIZE + 4, bytes.len());

        let (rest, parsed) = parse_file_record(&bytes, 64, "src/").unwrap();
        assert!(rest.is_empty());
        assert_eq!(record, parsed);
    }

    #[test]
    fn file_record_read_at_the_wrong_offset_fails_its_crc() {
        let record = FileRecord::from_entry(&entry("README"), 0);
        let mut bytes = Vec::new();
        record.serialize_with_offset(0, &mut bytes);

        let result = parse_file_record(&bytes, 8, "");
        match result {
            Err(IndexError::ChecksumMismatch { subject, .. }) => {
                assert_eq!("file record \"README\"", subject);
            }
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn stat_crc_reacts_to_every_covered_field() {
        let base = entry("README");
        let reference = stat_crc(&base, 0);

        assert_ne!(reference, stat_crc(&base, 4));

        let mut changed = base.clone();
        changed.ino += 1;
        assert_ne!(reference, stat_crc(&changed, 0));

        // mtime is carried in the record itself, not in the stat crc
        let mut mtime_only = base.clone();
        mtime_only.mtime_sec += 1;
        assert_eq!(reference, stat_crc(&mtime_only, 0));
    }

    #[test]
    fn conflict_group_round_trips() {
        let group = ConflictGroup {
            path: "x".to_string(),
            stages: vec![
                ConflictStage {
                    flags: 0x9000,
                    mode: 0o100644,
                    objhash: ObjectHash([0x01; OID_SIZE]),
                },
                ConflictStage {
                    flags: 0xa000,
                    mode: 0o100644,
                    objhash: ObjectHash([0x02; OID_SIZE]),
                },
            ],
        };

        let mut bytes = Vec::new();
        group.serialize(&mut bytes);

        let (rest, parsed) = parse_conflict_group(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(group, parsed);
        assert_eq!(1, parsed.stages[0].stage_bits());
        assert_eq!(2, parsed.stages[1].stage_bits());
    }
}
