use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::error::IndexError;
use crate::index::Index;
use crate::v5;
use crate::DeSerialise;

/// Conventional location of the legacy index inside a working directory.
pub const DEFAULT_INDEX_PATH: &str = ".git/index";

/// Conventional location of the sharded index, a sibling of the legacy one.
pub const DEFAULT_V5_PATH: &str = ".git/index-v5";

/// Owns the source and destination handles for the duration of one
/// conversion; both are released on every exit path. Callers wanting an
/// atomic replacement should hand in a temporary destination and rename it
/// afterwards. An interrupted write must never be read back, because the
/// header and the offset tables are patched last.
pub struct Converter {
    source: BufReader<File>,
    destination: BufWriter<File>,
}

impl Converter {
    pub fn open(source: &Path, destination: &Path) -> Result<Converter, IndexError> {
        Ok(Converter {
            source: BufReader::new(File::open(source)?),
            destination: BufWriter::new(File::create(destination)?),
        })
    }

    /// Opens the conventional paths relative to a repository working
    /// directory.
    pub fn with_defaults(workdir: &Path) -> Result<Converter, IndexError> {
        Converter::open(
            &workdir.join(DEFAULT_INDEX_PATH),
            &workdir.join(DEFAULT_V5_PATH),
        )
    }

    /// Decodes the legacy index and writes it back out in the sharded
    /// format. Returns the decoded model so a front-end can print from it.
    pub fn convert(mut self) -> Result<Index, IndexError> {
        let index = Index::deserialize(&mut self.source)?;
        debug!(
            "converting {} entries ({} conflicted) to v5",
            index.nfiles(),
            index.nconflicted()
        );
        v5::writer::write(&index, &mut self.destination)?;
        self.destination.flush()?;
        Ok(index)
    }
}
