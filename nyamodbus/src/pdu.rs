//! Parsers for the function-specific part of a frame (everything between the function
//! code and the CRC).

use nom::{
    multi::length_data,
    number::complete::{be_u16, be_u8},
    sequence::tuple,
    IResult,
};

pub type ParseError<'a> = nom::Err<nom::error::Error<&'a [u8]>>;

/// Start register and register count (or value, for single writes)
pub fn register_range(i: &[u8]) -> IResult<&[u8], (u16, u16)> {
    tuple((be_u16, be_u16))(i)
}

/// Multi-write request: start, count, then a length-prefixed data block
pub fn write_block(i: &[u8]) -> IResult<&[u8], (u16, u16, &[u8])> {
    tuple((be_u16, be_u16, length_data(be_u8)))(i)
}

/// Read response: length-prefixed data block
pub fn byte_block(i: &[u8]) -> IResult<&[u8], &[u8]> {
    length_data(be_u8)(i)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdRequest {
    pub mei_type: u8,
    pub read_code: u8,
    pub object: u8,
}

pub fn device_id_request(i: &[u8]) -> IResult<&[u8], DeviceIdRequest> {
    let (i, (mei_type, read_code, object)) = tuple((be_u8, be_u8, be_u8))(i)?;
    Ok((
        i,
        DeviceIdRequest {
            mei_type,
            read_code,
            object,
        },
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdHeader {
    pub mei_type: u8,
    pub read_code: u8,
    pub conformity: u8,
    pub more_follows: u8,
    pub next_object: u8,
    pub objects: u8,
}

pub fn device_id_header(i: &[u8]) -> IResult<&[u8], DeviceIdHeader> {
    let (i, (mei_type, read_code, conformity, more_follows, next_object, objects)) =
        tuple((be_u8, be_u8, be_u8, be_u8, be_u8, be_u8))(i)?;
    Ok((
        i,
        DeviceIdHeader {
            mei_type,
            read_code,
            conformity,
            more_follows,
            next_object,
            objects,
        },
    ))
}

/// One identification object: id followed by a length-prefixed value
pub fn device_id_object(i: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    tuple((be_u8, length_data(be_u8)))(i)
}

/// Coil `index` of a multi-coil write: bit `index % 16` of the big-endian word
/// `index / 16`. Bytes past the end of `data` read as zero.
pub fn coil_bit(data: &[u8], index: u16) -> bool {
    let offset = usize::from(index / 16) * 2;
    let hi = data.get(offset).copied().unwrap_or_default();
    let lo = data.get(offset + 1).copied().unwrap_or_default();
    let word = u16::from_be_bytes([hi, lo]);
    word & (1 << (index % 16)) != 0
}
