//! Wire encoding for the lock manager protocol.
//!
//! Mirror of [`crate::parser`]: a 16-byte header followed by the
//! command-specific body, every scalar little-endian, no padding. Encoding
//! writes into an in-memory buffer and cannot fail, so these functions
//! return the buffer directly.

pub mod message;
pub mod primitive;

#[cfg(test)]
mod tests;
