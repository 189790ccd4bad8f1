#![cfg(test)]

use std::io::Cursor;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::parser::primitive::{bytes, i32, i8, u16, u32, u64, u8, variant};
use crate::parser::Error;
use crate::message_types::Command;

#[test]
fn test_u32() {
    let init = [0u32, 7, 788965];
    let mut src = Vec::with_capacity(size_of::<u32>() * init.len());
    for i in init {
        src.write_u32::<LittleEndian>(i).unwrap();
    }
    let mut src = Cursor::new(src);
    for correct_res in init {
        let val = u32(&mut src).expect("Cannot parse value!");
        assert_eq!(val, correct_res)
    }
}

#[test]
fn test_u64() {
    let init = [2u64, 0, 125, 78569];
    let mut src = Vec::with_capacity(size_of::<u64>() * init.len());
    for i in init {
        src.write_u64::<LittleEndian>(i).unwrap();
    }
    let mut src = Cursor::new(src);
    for correct_res in init {
        let val = u64(&mut src).expect("Cannot parse value!");
        assert_eq!(val, correct_res)
    }
}

#[test]
fn test_signed() {
    let mut src = Vec::new();
    src.write_i32::<LittleEndian>(-11).unwrap();
    src.write_i8(-1).unwrap();
    let mut src = Cursor::new(src);
    assert_eq!(i32(&mut src).unwrap(), -11);
    assert_eq!(i8(&mut src).unwrap(), -1);
}

#[test]
fn test_u16_and_u8() {
    let mut src = Vec::new();
    src.write_u16::<LittleEndian>(4096).unwrap();
    src.write_u8(14).unwrap();
    let mut src = Cursor::new(src);
    assert_eq!(u16(&mut src).unwrap(), 4096);
    assert_eq!(u8(&mut src).unwrap(), 14);
}

#[test]
fn test_bytes_short_read() {
    let mut src = Cursor::new(vec![1u8, 2, 3]);
    assert_eq!(bytes(&mut src, 3).unwrap(), vec![1, 2, 3]);
    let mut src = Cursor::new(vec![1u8, 2]);
    assert!(matches!(bytes(&mut src, 3), Err(Error::IO(_))));
}

#[test]
fn test_variant() {
    let mut src = Cursor::new(vec![9u8]);
    let cmd: Command = variant(&mut src).unwrap();
    assert_eq!(cmd, Command::Grant);
    let mut src = Cursor::new(vec![200u8]);
    assert!(matches!(
        variant::<Command>(&mut src),
        Err(Error::EnumDiscMismatch)
    ));
}
