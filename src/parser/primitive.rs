//! Primitive scalar parsing utilities (little-endian).

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use num_traits::FromPrimitive;

use super::{Error, Result};

/// Parses a `u8` from the `Read` source.
pub fn u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::IO)
}

/// Parses an `i8` from the `Read` source.
pub fn i8(src: &mut impl Read) -> Result<i8> {
    src.read_i8().map_err(Error::IO)
}

/// Parses a `u16` from the `Read` source.
pub fn u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u32` from the `Read` source.
pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(Error::IO)
}

/// Parses an `i32` from the `Read` source.
pub fn i32(src: &mut impl Read) -> Result<i32> {
    src.read_i32::<LittleEndian>().map_err(Error::IO)
}

/// Parses a `u64` from the `Read` source.
pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<LittleEndian>().map_err(Error::IO)
}

/// Parses a fixed-size byte array from the `Read` source.
pub fn array<const N: usize>(src: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf).map_err(Error::IO)?;
    Ok(buf)
}

/// Parses `len` raw bytes from the `Read` source.
pub fn bytes(src: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    src.read_exact(buf.as_mut_slice()).map_err(Error::IO)?;
    Ok(buf)
}

/// Parses an enum encoded as a `u8` discriminant.
pub fn variant<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    FromPrimitive::from_u8(u8(src)?).ok_or(Error::EnumDiscMismatch)
}
