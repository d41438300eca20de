use thiserror::Error;

use crate::Signature;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("expected signature {0:?}, found {1:?}")]
    SignatureError(Signature, Signature),

    #[error("unsupported index version {0}")]
    VersionError(u32),

    #[error("checksum mismatch for {subject}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        subject: String,
        stored: String,
        computed: String,
    },

    #[error("malformed {0}: {1:?}")]
    MalformedField(&'static str, String),

    #[error("broken invariant: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub(crate) fn crc_mismatch(subject: impl Into<String>, stored: u32, computed: u32) -> Self {
        IndexError::ChecksumMismatch {
            subject: subject.into(),
            stored: format!("{stored:08x}"),
            computed: format!("{computed:08x}"),
        }
    }

    pub(crate) fn sha_mismatch(subject: impl Into<String>, stored: &[u8], computed: &[u8]) -> Self {
        IndexError::ChecksumMismatch {
            subject: subject.into(),
            stored: hex::encode(stored),
            computed: hex::encode(computed),
        }
    }
}
