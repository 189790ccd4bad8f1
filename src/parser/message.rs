//! Frame and body decoding.

use std::io::Read;

use num_traits::FromPrimitive;

use crate::message_types::{
    Body, Command, Frame, Header, LockMessage, RecoverMessage, HEADER_LEN, LVB_LEN, WIRE_VERSION,
};

use super::{primitive, Error, Result};

/// Fixed part of a lock body, before the variable name tail.
pub const LOCK_BODY_FIXED: usize = 122;
/// Fixed part of a recovery body, before the payload.
pub const RECOVER_BODY_FIXED: usize = 5;

/// Parses the 16-byte header.
pub fn parse_header(src: &mut impl Read) -> Result<Header> {
    let version = primitive::u32(src)?;
    let lockspace = primitive::u32(src)?;
    let nodeid = primitive::u32(src)?;
    let length = primitive::u16(src)?;
    let raw_cmd = primitive::u8(src)?;
    let flags = primitive::u8(src)?;
    if version >> 16 != WIRE_VERSION >> 16 {
        return Err(Error::VersionMismatch(version));
    }
    let cmd = Command::from_u8(raw_cmd).ok_or(Error::UnknownCommand(raw_cmd))?;
    Ok(Header {
        version,
        lockspace,
        nodeid,
        length,
        cmd,
        flags,
    })
}

fn parse_lock_body(src: &mut impl Read, name_len: usize) -> Result<LockMessage> {
    Ok(LockMessage {
        remid: primitive::u32(src)?,
        lkid: primitive::u32(src)?,
        parent_remid: primitive::u32(src)?,
        parent_lkid: primitive::u32(src)?,
        nodeid: primitive::u32(src)?,
        exflags: primitive::u32(src)?,
        sbflags: primitive::u8(src)?,
        iflags: primitive::u32(src)?,
        lvbseq: primitive::u32(src)?,
        status: primitive::u8(src)?,
        grmode: primitive::i8(src)?,
        rqmode: primitive::i8(src)?,
        bastmode: primitive::i8(src)?,
        asts: primitive::u8(src)?,
        result: primitive::i32(src)?,
        lvb: primitive::array::<LVB_LEN>(src)?,
        range: [primitive::u64(src)?, primitive::u64(src)?],
        name: primitive::bytes(src, name_len)?,
    })
}

fn parse_recover_body(src: &mut impl Read, data_len: usize) -> Result<RecoverMessage> {
    Ok(RecoverMessage {
        msgid: primitive::u32(src)?,
        subcmd: primitive::u8(src)?,
        data: primitive::bytes(src, data_len)?,
    })
}

/// Parses one complete frame out of `buf`.
pub fn parse_frame(buf: &[u8]) -> Result<Frame> {
    let mut src = buf;
    let header = parse_header(&mut src)?;
    let announced = header.length as usize;
    if announced != buf.len() || announced < HEADER_LEN {
        return Err(Error::BadLength {
            announced,
            available: buf.len(),
        });
    }
    let body_len = announced - HEADER_LEN;
    let body = match header.cmd {
        Command::Recover | Command::RecoverReply => {
            let data_len = body_len.checked_sub(RECOVER_BODY_FIXED).ok_or(Error::BadLength {
                announced,
                available: buf.len(),
            })?;
            Body::Recover(parse_recover_body(&mut src, data_len)?)
        }
        _ => {
            let name_len = body_len.checked_sub(LOCK_BODY_FIXED).ok_or(Error::BadLength {
                announced,
                available: buf.len(),
            })?;
            Body::Lock(parse_lock_body(&mut src, name_len)?)
        }
    };
    Ok(Frame { header, body })
}
