//! Wire decoding for the lock manager protocol.
//!
//! Messages are length-framed byte strings: a 16-byte header followed by a
//! command-specific body. All multibyte scalars are little-endian; there
//! are no floats and no alignment padding.

pub mod message;
pub mod primitive;

#[cfg(test)]
mod tests;

use std::io;

/// Decoding errors.
#[derive(Debug)]
pub enum Error {
    /// The underlying read failed or the buffer ran short.
    IO(io::Error),
    /// The header announced a protocol version we do not speak.
    VersionMismatch(u32),
    /// Unknown command discriminant.
    UnknownCommand(u8),
    /// Unknown enum discriminant inside a body.
    EnumDiscMismatch,
    /// The length field contradicts the bytes present.
    BadLength { announced: usize, available: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IO(err) => write!(f, "read failed: {err}"),
            Error::VersionMismatch(version) => {
                write!(f, "unsupported protocol version {version:#x}")
            }
            Error::UnknownCommand(cmd) => write!(f, "unknown command {cmd}"),
            Error::EnumDiscMismatch => write!(f, "invalid enum discriminant"),
            Error::BadLength {
                announced,
                available,
            } => write!(f, "length {announced} but {available} bytes present"),
        }
    }
}

impl std::error::Error for Error {}

/// Result of parsing operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
