#![cfg(test)]

use crate::message_types::{Body, Command, LockMessage, RecoverMessage, HEADER_LEN};
use crate::parser::message::{parse_frame, LOCK_BODY_FIXED};
use crate::parser::Error;
use crate::serializer::message::write_frame;

#[test]
fn lock_frame_fields_survive() {
    let mut msg = LockMessage::default();
    msg.lkid = 0x10004;
    msg.remid = 0x2_0007;
    msg.exflags = 0x28;
    msg.rqmode = 5;
    msg.grmode = -1;
    msg.result = -11;
    msg.lvb[0] = 0xab;
    msg.range = [16, 1 << 40];
    msg.name = b"inode-17".to_vec();

    let bytes = write_frame(0xfeed, 3, Command::Request, &Body::Lock(msg.clone()));
    assert_eq!(
        bytes.len(),
        HEADER_LEN + LOCK_BODY_FIXED + msg.name.len()
    );
    let frame = parse_frame(&bytes).unwrap();
    assert_eq!(frame.header.lockspace, 0xfeed);
    assert_eq!(frame.header.nodeid, 3);
    assert_eq!(frame.header.cmd, Command::Request);
    assert_eq!(frame.header.length as usize, bytes.len());
    assert_eq!(frame.body, Body::Lock(msg));
}

#[test]
fn recover_frame_carries_payload() {
    let msg = RecoverMessage {
        msgid: 42,
        subcmd: 2,
        data: vec![0, 1, 2, 3, 4],
    };
    let bytes = write_frame(1, 2, Command::Recover, &Body::Recover(msg.clone()));
    let frame = parse_frame(&bytes).unwrap();
    assert_eq!(frame.body, Body::Recover(msg));
}

#[test]
fn rejects_unknown_command() {
    let mut bytes = write_frame(1, 2, Command::Bast, &Body::Lock(LockMessage::default()));
    bytes[14] = 250;
    assert!(matches!(
        parse_frame(&bytes),
        Err(Error::UnknownCommand(250))
    ));
}

#[test]
fn rejects_wrong_version() {
    let mut bytes = write_frame(1, 2, Command::Bast, &Body::Lock(LockMessage::default()));
    bytes[2] = 9; // major version byte
    assert!(matches!(parse_frame(&bytes), Err(Error::VersionMismatch(_))));
}

#[test]
fn rejects_length_mismatch() {
    let bytes = write_frame(1, 2, Command::Bast, &Body::Lock(LockMessage::default()));
    assert!(matches!(
        parse_frame(&bytes[..bytes.len() - 1]),
        Err(Error::BadLength { .. })
    ));
}
