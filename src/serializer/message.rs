//! Frame and body encoding.

use crate::message_types::{
    Body, Command, Header, LockMessage, RecoverMessage, HEADER_LEN, WIRE_VERSION,
};
use crate::parser::message::{LOCK_BODY_FIXED, RECOVER_BODY_FIXED};

use super::primitive;

fn write_header(dest: &mut Vec<u8>, header: &Header) {
    primitive::u32(dest, header.version);
    primitive::u32(dest, header.lockspace);
    primitive::u32(dest, header.nodeid);
    primitive::u16(dest, header.length);
    primitive::u8(dest, header.cmd as u8);
    primitive::u8(dest, header.flags);
}

fn write_lock_body(dest: &mut Vec<u8>, body: &LockMessage) {
    primitive::u32(dest, body.remid);
    primitive::u32(dest, body.lkid);
    primitive::u32(dest, body.parent_remid);
    primitive::u32(dest, body.parent_lkid);
    primitive::u32(dest, body.nodeid);
    primitive::u32(dest, body.exflags);
    primitive::u8(dest, body.sbflags);
    primitive::u32(dest, body.iflags);
    primitive::u32(dest, body.lvbseq);
    primitive::u8(dest, body.status);
    primitive::i8(dest, body.grmode);
    primitive::i8(dest, body.rqmode);
    primitive::i8(dest, body.bastmode);
    primitive::u8(dest, body.asts);
    primitive::i32(dest, body.result);
    primitive::bytes(dest, &body.lvb);
    primitive::u64(dest, body.range[0]);
    primitive::u64(dest, body.range[1]);
    primitive::bytes(dest, &body.name);
}

fn write_recover_body(dest: &mut Vec<u8>, body: &RecoverMessage) {
    primitive::u32(dest, body.msgid);
    primitive::u8(dest, body.subcmd);
    primitive::bytes(dest, &body.data);
}

/// Encodes one complete frame.
pub fn write_frame(lockspace: u32, nodeid: u32, cmd: Command, body: &Body) -> Vec<u8> {
    let body_len = match body {
        Body::Lock(lock) => LOCK_BODY_FIXED + lock.name.len(),
        Body::Recover(recover) => RECOVER_BODY_FIXED + recover.data.len(),
    };
    let length = (HEADER_LEN + body_len) as u16;
    let header = Header {
        version: WIRE_VERSION,
        lockspace,
        nodeid,
        length,
        cmd,
        flags: 0,
    };
    let mut dest = Vec::with_capacity(length as usize);
    write_header(&mut dest, &header);
    match body {
        Body::Lock(lock) => write_lock_body(&mut dest, lock),
        Body::Recover(recover) => write_recover_body(&mut dest, recover),
    }
    dest
}
