use nom::bytes::complete::{take, take_till};
use nom::combinator::map;
use nom::number::complete::{be_u16, be_u32};
use nom::IResult;

use crate::entry::{ObjectHash, OID_SIZE};
use crate::error::IndexError;
use crate::Signature;

// Both index formats are big-endian on the wire, whatever the host is.

pub fn t_u16(input: &[u8]) -> IResult<&[u8], u16> {
    be_u16(input)
}

pub fn t_u32(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

pub fn t_sign(input: &[u8]) -> IResult<&[u8], Signature> {
    map(take(4usize), Signature::from_bytes)(input)
}

pub fn t_oid(input: &[u8]) -> IResult<&[u8], ObjectHash> {
    map(take(OID_SIZE), ObjectHash::from_slice)(input)
}

/// Bytes up to (not including) the next NUL; consumes the NUL.
pub fn t_nul_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, name) = take_till(|b| b == 0)(input)?;
    let (input, _) = take(1usize)(input)?;
    Ok((input, name))
}

/// Like [`t_nul_name`] but with a caller-chosen terminator. The cache-tree
/// extension terminates its counters with ' ' and '\n'.
pub fn t_delim_name(delim: u8) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| {
        let (input, field) = take_till(move |b| b == delim)(input)?;
        let (input, _) = take(1usize)(input)?;
        Ok((input, field))
    }
}

pub(crate) fn str_field(what: &'static str, bytes: &[u8]) -> Result<String, IndexError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| IndexError::MalformedField(what, String::from_utf8_lossy(bytes).into_owned()))
}
