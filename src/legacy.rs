use log::debug;
use nom::combinator::{map, peek};
use nom::sequence::tuple;
use nom::IResult;
use sha1::{Digest, Sha1};

use crate::entry::{split_path, IndexEntry, ObjectHash, OID_SIZE};
use crate::error::IndexError;
use crate::extensions::{decode_cache_tree, decode_resolve_undo};
use crate::index::Index;
use crate::parse_utils::{str_field, t_nul_name, t_oid, t_sign, t_u16, t_u32};
use crate::{Signature, Validation};

pub const LEGACY_HEADER_SIZE: usize = 12;

// Fixed bytes before the pathname: 10 stat words, the object hash and the
// flags word; version 3 adds a second flags word.
const V2_ENTRY_PREFIX: usize = 62;
const V3_ENTRY_PREFIX: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub signature: Signature,
    pub version: u32,
    pub nrofentries: u32,
}

impl LegacyHeader {
    pub const SIGN: &'static [u8] = b"DIRC";
}

impl Validation for LegacyHeader {
    fn validate(&self) -> Result<(), IndexError> {
        if self.signature != Signature::Dirc {
            return Err(IndexError::SignatureError(
                Signature::Dirc,
                self.signature.clone(),
            ));
        }

        if !(2..=3).contains(&self.version) {
            return Err(IndexError::VersionError(self.version));
        }

        Ok(())
    }
}

fn parse_header(input: &[u8]) -> IResult<&[u8], LegacyHeader> {
    map(
        tuple((t_sign, t_u32, t_u32)),
        |(signature, version, nrofentries)| LegacyHeader {
            signature,
            version,
            nrofentries,
        },
    )(input)
}

/// Decodes a whole version 2 or 3 index file into the in-memory model.
///
/// The trailing 20 bytes are the SHA-1 of everything before them and are
/// checked before any structural decoding; the file is bounded and already
/// in memory, so the hash is computed in one pass.
pub fn decode(data: &[u8]) -> Result<Index, IndexError> {
    if data.len() < LEGACY_HEADER_SIZE + OID_SIZE {
        return Err(IndexError::Truncated("index header"));
    }
    verify_sha1(data)?;
    let content = &data[..data.len() - OID_SIZE];

    let (rest, header) =
        parse_header(content).map_err(|_| IndexError::Truncated("index header"))?;
    header.validate()?;

    let mut index = Index::new(header.version);
    let mut input = rest;
    for _ in 0..header.nrofentries {
        let (rest, entry) = parse_entry(input, header.version)?;
        index.push_entry(entry);
        input = rest;
    }

    let input = parse_extensions(input, &mut index)?;
    if !input.is_empty() {
        debug!(
            "ignoring {} trailing bytes after the last known extension",
            input.len()
        );
    }

    debug!(
        "decoded v{} index: {} entries, {} conflicted, {} cache-tree nodes",
        header.version,
        index.entries.len(),
        index.nconflicted(),
        index.cache_tree.len()
    );
    Ok(index)
}

type StatPrefix = (u32, u32, u32, u32, u32, u32, u32, u32, u32, u32);

fn parse_entry_prefix(input: &[u8]) -> IResult<&[u8], (StatPrefix, ObjectHash, u16)> {
    tuple((
        tuple((
            t_u32, t_u32, t_u32, t_u32, t_u32, t_u32, t_u32, t_u32, t_u32, t_u32,
        )),
        t_oid,
        t_u16,
    ))(input)
}

fn parse_entry<'a>(
    input: &'a [u8],
    version: u32,
) -> Result<(&'a [u8], IndexEntry), IndexError> {
    let before = input.len();
    let (rest, (stat, objhash, flags)) =
        parse_entry_prefix(input).map_err(|_| IndexError::Truncated("index entry"))?;
    let (ctime_sec, ctime_nsec, mtime_sec, mtime_nsec, dev, ino, mode, uid, gid, size) = stat;

    let (rest, xtflags) = if version == 3 {
        let (rest, xt) = t_u16(rest).map_err(|_| IndexError::Truncated("extended flags"))?;
        (rest, Some(xt))
    } else {
        (rest, None)
    };

    let (rest, name) = t_nul_name(rest).map_err(|_| IndexError::Truncated("entry path"))?;

    // The entry tail is 1..=8 NUL bytes, the name terminator included,
    // bringing the total entry size to a multiple of 8. The terminator is
    // already consumed, so `pad - 1` bytes remain.
    let prefix = if version == 3 {
        V3_ENTRY_PREFIX
    } else {
        V2_ENTRY_PREFIX
    };
    let pad = 8 - ((prefix + name.len()) % 8);
    if rest.len() < pad - 1 {
        return Err(IndexError::Truncated("entry padding"));
    }
    let rest = &rest[pad - 1..];
    debug_assert_eq!(0, (before - rest.len()) % 8);

    let path = str_field("entry path", name)?;
    let (dir, filename) = split_path(&path)?;

    Ok((
        rest,
        IndexEntry {
            ctime_sec,
            ctime_nsec,
            mtime_sec,
            mtime_nsec,
            dev,
            ino,
            mode,
            uid,
            gid,
            size,
            objhash,
            flags,
            xtflags,
            dir,
            filename,
        },
    ))
}

fn parse_extensions<'a>(
    mut input: &'a [u8],
    index: &mut Index,
) -> Result<&'a [u8], IndexError> {
    while input.len() >= 8 {
        let (_, signature) =
            peek(t_sign)(input).map_err(|_| IndexError::Truncated("extension signature"))?;
        match signature {
            Signature::Tree => {
                let (rest, payload) = extension_payload(input)?;
                index.cache_tree = decode_cache_tree(payload)?;
                input = rest;
            }
            Signature::Reuc => {
                let (rest, payload) = extension_payload(input)?;
                index.resolve_undo = decode_resolve_undo(payload)?;
                input = rest;
            }
            // Anything else would have been the trailing hash in the raw
            // stream; it is already stripped, so decoding is done.
            _ => break,
        }
    }
    Ok(input)
}

fn extension_payload(input: &[u8]) -> Result<(&[u8], &[u8]), IndexError> {
    let (rest, (_, size)) = tuple((t_sign, t_u32))(input)
        .map_err(|_| IndexError::Truncated("extension header"))?;
    let size = size as usize;
    if rest.len() < size {
        return Err(IndexError::Truncated("extension payload"));
    }
    Ok((&rest[size..], &rest[..size]))
}

fn verify_sha1(data: &[u8]) -> Result<(), IndexError> {
    let (content, stored) = data.split_at(data.len() - OID_SIZE);
    let computed = Sha1::digest(content);
    if stored != computed.as_slice() {
        return Err(IndexError::sha_mismatch("index", stored, computed.as_slice()));
    }
    Ok(())
}
