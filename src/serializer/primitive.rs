//! Primitive scalar serialization utilities (little-endian).

use byteorder::{LittleEndian, WriteBytesExt};

/// Serializes a `u8`.
pub fn u8(dest: &mut Vec<u8>, n: u8) {
    dest.push(n);
}

/// Serializes an `i8`.
pub fn i8(dest: &mut Vec<u8>, n: i8) {
    dest.push(n as u8);
}

/// Serializes a `u16` in little-endian order.
pub fn u16(dest: &mut Vec<u8>, n: u16) {
    dest.write_u16::<LittleEndian>(n).expect("vec write");
}

/// Serializes a `u32` in little-endian order.
pub fn u32(dest: &mut Vec<u8>, n: u32) {
    dest.write_u32::<LittleEndian>(n).expect("vec write");
}

/// Serializes an `i32` in little-endian order.
pub fn i32(dest: &mut Vec<u8>, n: i32) {
    dest.write_i32::<LittleEndian>(n).expect("vec write");
}

/// Serializes a `u64` in little-endian order.
pub fn u64(dest: &mut Vec<u8>, n: u64) {
    dest.write_u64::<LittleEndian>(n).expect("vec write");
}

/// Serializes raw bytes verbatim.
pub fn bytes(dest: &mut Vec<u8>, data: &[u8]) {
    dest.extend_from_slice(data);
}
