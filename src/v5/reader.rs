use std::collections::VecDeque;
use std::io::{Read, Seek};

use log::debug;

use crate::error::IndexError;
use crate::parse_utils::t_u32;
use crate::v5::records::{
    parse_dir_record, parse_file_record, parse_v5_header, DirRecord, FileRecord, V5Header,
};
use crate::{Crc32, DeSerialise, Validation};

/// One file read back from a sharded index, with its path rebuilt from the
/// owning directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V5File {
    pub fullname: String,
    pub record: FileRecord,
}

/// A decoded sharded index. `files` is in global lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V5Index {
    pub header: V5Header,
    pub dirs: Vec<DirRecord>,
    pub files: Vec<V5File>,
}

impl<T> DeSerialise<T> for V5Index {
    type Item = V5Index;

    fn deserialize(reader: &mut T) -> Result<Self::Item, IndexError>
    where
        T: Read + Seek,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        decode(&data)
    }
}

/// Decodes a whole sharded index file.
///
/// Directory records are read in order, then the walk starts at the first
/// directory's files; every further directory's files follow contiguously in
/// the file block, so only that first position needs the offset.
pub fn decode(data: &[u8]) -> Result<V5Index, IndexError> {
    if data.len() < V5Header::SIZE + 4 {
        return Err(IndexError::Truncated("index header"));
    }
    let (_, header) = parse_v5_header(data).map_err(|_| IndexError::Truncated("index header"))?;
    header.validate()?;

    let (_, stored) =
        t_u32(&data[V5Header::SIZE..]).map_err(|_| IndexError::Truncated("header crc"))?;
    let computed = header.crc32();
    if stored != computed {
        return Err(IndexError::crc_mismatch("header", stored, computed));
    }

    let tables = (header.nextensions as usize + header.ndir as usize) * 4;
    let dir_block = V5Header::SIZE + 4 + tables;
    if data.len() < dir_block {
        return Err(IndexError::Truncated("offset tables"));
    }

    let mut dirs = Vec::with_capacity(header.ndir as usize);
    let mut input = &data[dir_block..];
    for _ in 0..header.ndir {
        let (rest, record) = parse_dir_record(input)?;
        dirs.push(record);
        input = rest;
    }

    let mut files = Vec::new();
    if let Some(first) = dirs.first() {
        let fblock = header.fblockoffset as usize;
        let start = fblock + first.foffset as usize;
        if start > data.len() {
            return Err(IndexError::InvariantViolation(format!(
                "file offset {} of directory \"{}\" lies beyond the file",
                first.foffset, first.pathname
            )));
        }

        let mut walk = Walk {
            data,
            dirs: &dirs,
            fblock,
            next_dir: 0,
            cursor: start,
            files: Vec::with_capacity(header.nfile as usize),
        };
        walk.descend()?;
        files = walk.files;
    }

    if files.len() != header.nfile as usize {
        return Err(IndexError::InvariantViolation(format!(
            "header promises {} files, the directory walk produced {}",
            header.nfile,
            files.len()
        )));
    }

    debug!(
        "read v5 index: {} directories, {} files",
        dirs.len(),
        files.len()
    );
    Ok(V5Index {
        header,
        dirs,
        files,
    })
}

enum Step {
    Descend,
    Emit,
    Done,
}

/// The merge walk of §"file block": each directory's files form a FIFO, and
/// the head is emitted until its name reaches the next directory's pathname,
/// at which point that directory's files come first.
struct Walk<'a> {
    data: &'a [u8],
    dirs: &'a [DirRecord],
    fblock: usize,
    next_dir: usize,
    cursor: usize,
    files: Vec<V5File>,
}

impl<'a> Walk<'a> {
    fn descend(&mut self) -> Result<(), IndexError> {
        let dirs = self.dirs;
        let dir = &dirs[self.next_dir];
        self.next_dir += 1;

        let mut fifo = VecDeque::with_capacity(dir.nfiles as usize);
        for _ in 0..dir.nfiles {
            if self.cursor > self.data.len() {
                return Err(IndexError::Truncated("file record"));
            }
            let foffset = (self.cursor - self.fblock) as u32;
            let input = &self.data[self.cursor..];
            let (rest, record) = parse_file_record(input, foffset, &dir.pathname)?;
            self.cursor += input.len() - rest.len();
            fifo.push_back(V5File {
                fullname: format!("{}{}", dir.pathname, record.filename),
                record,
            });
        }

        loop {
            let step = match (fifo.front(), dirs.get(self.next_dir)) {
                // Everything under the next directory sorts before the head:
                // its pathname ends in '/', so head >= pathname means the
                // whole subtree comes first.
                (Some(file), Some(next)) if file.fullname.as_str() >= next.pathname.as_str() => {
                    Step::Descend
                }
                (Some(_), _) => Step::Emit,
                (None, Some(next)) if next.pathname.starts_with(dir.pathname.as_str()) => {
                    Step::Descend
                }
                (None, _) => Step::Done,
            };

            match step {
                Step::Descend => self.descend()?,
                Step::Emit => {
                    if let Some(file) = fifo.pop_front() {
                        self.files.push(file);
                    }
                }
                Step::Done => break,
            }
        }
        Ok(())
    }
}
