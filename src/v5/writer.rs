use std::io::Write;

use log::debug;

use crate::error::IndexError;
use crate::index::Index;
use crate::v5::layout::Layout;
use crate::v5::records::{DirRecord, FileRecord, V5Header};
use crate::v5::V5_VERSION;
use crate::{Crc32, Serialise, Signature};

/// A grow-only output buffer with reserve-then-fill offset slots. Every
/// reserved slot must be patched exactly once before `finish`, so a
/// forgotten back-patch surfaces as an error instead of a zero on disk.
struct PatchBuf {
    buf: Vec<u8>,
    reserved: usize,
    patched: usize,
}

#[must_use]
struct Slot(usize);

impl PatchBuf {
    fn new() -> PatchBuf {
        PatchBuf {
            buf: Vec::new(),
            reserved: 0,
            patched: 0,
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn reserve_u32(&mut self) -> Slot {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.reserved += 1;
        Slot(pos)
    }

    fn patch(&mut self, slot: Slot, value: u32) {
        self.buf[slot.0..slot.0 + 4].copy_from_slice(&value.to_be_bytes());
        self.patched += 1;
    }

    fn splice(&mut self, pos: usize, bytes: &[u8]) {
        self.buf[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    fn finish(self) -> Result<Vec<u8>, IndexError> {
        if self.reserved != self.patched {
            return Err(IndexError::InvariantViolation(format!(
                "{} offset slots were never patched",
                self.reserved - self.patched
            )));
        }
        Ok(self.buf)
    }
}

/// Emits a whole sharded index file.
///
/// Writing is reserve-then-fill: the header CRC, the file-block offset, both
/// offset tables and every directory record depend on sizes that only exist
/// once later blocks are emitted, so their slots are reserved first and
/// patched at the end.
pub fn to_bytes(index: &Index) -> Result<Vec<u8>, IndexError> {
    let mut layout = Layout::plan(index)?;
    let ndir = layout.dirs.len() as u32;
    let nfile = layout.files.len() as u32;

    let mut out = PatchBuf::new();

    // Header struct, its CRC slot, and the directory-offset table.
    out.append(V5Header::SIGN);
    out.append(&V5_VERSION.to_be_bytes());
    out.append(&ndir.to_be_bytes());
    out.append(&nfile.to_be_bytes());
    let fblock_slot = out.reserve_u32();
    out.append(&0u32.to_be_bytes()); // no trailing extensions
    let header_crc_slot = out.reserve_u32();
    let dir_slots: Vec<Slot> = (0..ndir).map(|_| out.reserve_u32()).collect();

    // Directory block. Pathnames are final; the data structs are zeroes
    // until every offset is known, then rewritten in place.
    let dir_block = out.len();
    let mut dir_positions = Vec::with_capacity(layout.dirs.len());
    for (slot, dir) in dir_slots.into_iter().zip(&layout.dirs) {
        out.patch(slot, (out.len() - dir_block) as u32);
        dir_positions.push(out.len());
        out.append(dir.pathname.as_bytes());
        out.append(&[0]);
        out.append(&[0u8; DirRecord::DATA_SIZE + 4]);
    }

    // File-offset table, then the file block itself. All file offsets are
    // relative to the file block so the block stays relocatable.
    let file_slots: Vec<Slot> = (0..nfile).map(|_| out.reserve_u32()).collect();
    let fblockoffset = out.len() as u32;
    out.patch(fblock_slot, fblockoffset);

    let mut file_slots = file_slots.into_iter();
    let mut files = layout.files.iter().peekable();
    for (i, dir) in layout.dirs.iter_mut().enumerate() {
        dir.foffset = out.len() as u32 - fblockoffset;
        while let Some((owner, entry)) = files.peek() {
            if *owner != i {
                break;
            }
            let foffset = out.len() as u32 - fblockoffset;
            let slot = file_slots.next().ok_or_else(|| {
                IndexError::InvariantViolation(
                    "more file records than file-offset slots".to_string(),
                )
            })?;
            out.patch(slot, foffset);

            let record = FileRecord::from_entry(entry, foffset);
            let mut bytes = Vec::new();
            record.serialize_with_offset(foffset, &mut bytes);
            out.append(&bytes);
            files.next();
        }
    }

    // Conflict block, grouped by directory in directory order.
    for i in 0..layout.conflicts.len() {
        let owner = layout.conflicts[i].0;
        let cr = out.len() as u32;
        let dir = &mut layout.dirs[owner];
        if dir.ncr == 0 {
            dir.cr = cr;
        }
        dir.ncr += 1;

        let mut bytes = Vec::new();
        layout.conflicts[i].1.serialize(&mut bytes);
        out.append(&bytes);
    }

    // Back-patch the header CRC over its final bytes, then every directory
    // record with its now-known offsets and counts.
    let header = V5Header {
        signature: Signature::Dirc,
        version: V5_VERSION,
        ndir,
        nfile,
        fblockoffset,
        nextensions: 0,
    };
    out.patch(header_crc_slot, header.crc32());

    for (pos, dir) in dir_positions.iter().zip(&layout.dirs) {
        let mut bytes = Vec::new();
        dir.serialize(&mut bytes);
        out.splice(*pos, &bytes);
    }

    debug!(
        "wrote v5 index: {} directories, {} files, {} conflict groups",
        ndir,
        nfile,
        layout.conflicts.len()
    );
    out.finish()
}

pub fn write<W: Write>(index: &Index, destination: &mut W) -> Result<(), IndexError> {
    let bytes = to_bytes(index)?;
    destination.write_all(&bytes)?;
    Ok(())
}
