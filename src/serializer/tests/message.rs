#![cfg(test)]

use byteorder::{ByteOrder, LittleEndian};

use crate::message_types::{Body, Command, LockMessage, HEADER_LEN, WIRE_VERSION};
use crate::serializer::message::write_frame;

#[test]
fn header_layout() {
    let bytes = write_frame(0x0102_0304, 7, Command::Unlock, &Body::Lock(LockMessage::default()));
    assert_eq!(LittleEndian::read_u32(&bytes[0..4]), WIRE_VERSION);
    assert_eq!(LittleEndian::read_u32(&bytes[4..8]), 0x0102_0304);
    assert_eq!(LittleEndian::read_u32(&bytes[8..12]), 7);
    assert_eq!(
        LittleEndian::read_u16(&bytes[12..14]) as usize,
        bytes.len()
    );
    assert_eq!(bytes[14], Command::Unlock as u8);
    assert_eq!(bytes[15], 0);
}

#[test]
fn name_rides_at_the_tail() {
    let mut msg = LockMessage::default();
    msg.name = b"tail".to_vec();
    let bytes = write_frame(1, 1, Command::Lookup, &Body::Lock(msg));
    assert_eq!(&bytes[bytes.len() - 4..], b"tail");
    assert!(bytes.len() > HEADER_LEN + 4);
}
