use std::io::{Read, Seek};

use error::IndexError;

pub mod converter;
pub mod entry;
pub mod error;
pub mod extensions;
pub mod index;
pub mod legacy;
pub mod parse_utils;
pub mod v5;

#[cfg(test)]
pub(crate) mod testutil;

pub trait DeSerialise<T> {
    type Item;

    fn deserialize(reader: &mut T) -> Result<Self::Item, IndexError>
    where
        T: Read + Seek;
}

pub trait Serialise {
    fn serialize(&self, buf: &mut Vec<u8>);
}

pub trait Crc32 {
    fn crc32(&self) -> u32;
    fn crc32_from_digest(&self, digest: &mut crc::Digest<u32>);
}

pub trait Validation {
    fn validate(&self) -> Result<(), IndexError>;
}

#[derive(Debug, Eq, PartialEq, Clone, Ord, PartialOrd)]
pub enum Signature {
    Dirc,
    Tree,
    Reuc,
    Unknown(Vec<u8>),
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Signature {
        match bytes {
            b"DIRC" => Signature::Dirc,
            b"TREE" => Signature::Tree,
            b"REUC" => Signature::Reuc,
            _ => Signature::Unknown(bytes.to_vec()),
        }
    }
}
