//! Shared message and notification types.
//!
//! Wire shapes live here as plain structs; the byte-level work is done by
//! [`crate::parser`] and [`crate::serializer`]. All multibyte scalars are
//! little-endian on the wire.

use std::sync::Arc;

use num_derive::FromPrimitive;

use crate::mode::Mode;

/// Wire protocol version, `major << 16 | minor`.
pub const WIRE_VERSION: u32 = (1 << 16) | 1;

/// Bytes in a lock value block as carried on the wire.
pub const LVB_LEN: usize = 64;

/// Wire size of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Maximum resource name length.
pub const MAX_NAME_LEN: usize = 64;

/// Fixed message header, 16 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Protocol version of the sender.
    pub version: u32,
    /// Global id of the target lockspace.
    pub lockspace: u32,
    /// Sending node.
    pub nodeid: u32,
    /// Total message length, header included.
    pub length: u16,
    /// Command discriminant.
    pub cmd: Command,
    /// Currently unused; must be zero.
    pub flags: u8,
}

/// The closed command set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    Request = 1,
    Convert = 2,
    Unlock = 3,
    Cancel = 4,
    RequestReply = 5,
    ConvertReply = 6,
    UnlockReply = 7,
    CancelReply = 8,
    /// Master tells a process copy its lock is now granted.
    Grant = 9,
    /// Master tells a holder a conflicting request is waiting.
    Bast = 10,
    /// Ask a directory node for the master of a name.
    Lookup = 11,
    LookupReply = 12,
    /// Ask a directory node to drop a name on last-holder release.
    Remove = 13,
    /// Recovery message; the body carries a [`RecoverCmd`].
    Recover = 14,
    RecoverReply = 15,
}

impl Command {
    /// True for the four replies a parked operation may be waiting on.
    pub fn is_op_reply(self) -> bool {
        matches!(
            self,
            Command::RequestReply
                | Command::ConvertReply
                | Command::UnlockReply
                | Command::CancelReply
        )
    }
}

/// Caller-visible result of an operation, delivered through the completion
/// notification (or returned synchronously for validation failures).
/// Wire representation is a little-endian `i32`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(i32)]
pub enum Status {
    /// Granted (request/convert) or accepted.
    Ok = 0,
    /// A NOQUEUE operation could not be granted immediately.
    TryFailed = -11,
    /// The operation was invalid at the time it was processed; also the
    /// wrong-master reply on the wire.
    Invalid = -22,
    /// Unlock refused: the lock has children. Reserved; the engine does not
    /// build lock hierarchies.
    NotEmpty = -39,
    /// The conversion lost a conversion-deadlock resolution.
    Deadlock = -35,
    /// A parked remote operation outlived the lock timeout.
    TimedOut = -110,
    /// Normal unlock completion.
    Unlocked = -0x10002,
    /// A pending convert/wait was cancelled.
    Cancelled = -0x10001,
}

impl Status {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(raw: i32) -> Option<Status> {
        num_traits::FromPrimitive::from_i32(raw)
    }
}

/// Body shared by all lock commands and their replies. Fields irrelevant to
/// a given command are zero. The `nodeid` field carries the master node in
/// a `LookupReply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMessage {
    /// Receiver's lock id (the master copy id, or the process copy id on
    /// master-to-process traffic).
    pub remid: u32,
    /// Sender's lock id.
    pub lkid: u32,
    /// Reserved for lock hierarchies; always zero.
    pub parent_remid: u32,
    /// Reserved for lock hierarchies; always zero.
    pub parent_lkid: u32,
    /// Master nodeid in a `LookupReply`; zero elsewhere.
    pub nodeid: u32,
    /// Caller flags of the operation.
    pub exflags: u32,
    /// Status-block flags accompanying a grant.
    pub sbflags: u8,
    /// Internal flags the receiver needs (`IFL_RANGE`, `IFL_DEMOTED`, ...).
    pub iflags: u32,
    /// LVB sequence number of the sending holder.
    pub lvbseq: u32,
    /// Queue the lock landed on (reply traffic); raw
    /// [`crate::lkb::LkbState`].
    pub status: u8,
    pub grmode: i8,
    pub rqmode: i8,
    /// Blocked requested mode in a `Bast`.
    pub bastmode: i8,
    /// Which notifications the requester registered (`AST_COMP`/`AST_BAST`).
    pub asts: u8,
    /// Operation result as seen by the caller.
    pub result: i32,
    pub lvb: [u8; LVB_LEN],
    /// Requested range bounds; meaningful iff `IFL_RANGE` is set.
    pub range: [u64; 2],
    /// Resource name tail; only lookups, requests and removes carry one.
    pub name: Vec<u8>,
}

impl Default for LockMessage {
    fn default() -> Self {
        Self {
            remid: 0,
            lkid: 0,
            parent_remid: 0,
            parent_lkid: 0,
            nodeid: 0,
            exflags: 0,
            sbflags: 0,
            iflags: 0,
            lvbseq: 0,
            status: 0,
            grmode: Mode::Iv.as_i8(),
            rqmode: Mode::Iv.as_i8(),
            bastmode: Mode::Iv.as_i8(),
            asts: 0,
            result: 0,
            lvb: [0; LVB_LEN],
            range: [0, u64::MAX],
            name: Vec::new(),
        }
    }
}

/// Recovery subcommands carried inside `Command::Recover{,Reply}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum RecoverCmd {
    /// Poll a peer's recovery status flags.
    Status = 1,
    /// Page of `{master, name}` pairs for the directory rebuild.
    Names = 2,
    /// Directory lookup of a single name during recovery.
    NewMaster = 3,
    /// Batch of serialised locks for a new master.
    Locks = 4,
    /// New lock ids handed back by the new master.
    LockIds = 5,
    /// Directory remove routed around a stopped lockspace.
    Remove = 6,
}

/// Recovery message body: a correlation id, a subcommand and an opaque
/// payload interpreted per subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoverMessage {
    pub msgid: u32,
    pub subcmd: u8,
    pub data: Vec<u8>,
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Lock(LockMessage),
    Recover(RecoverMessage),
}

/// One decoded frame: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Body,
}

/// Snapshot of a lock's status block, delivered with every completion
/// notification.
#[derive(Debug, Clone)]
pub struct LockStatus {
    /// The lock the notification is for.
    pub lkid: u32,
    pub status: Status,
    /// `SBF_*` bits.
    pub flags: u8,
    /// LVB content read back on grant, when the lock uses one.
    pub lvb: Option<Vec<u8>>,
}

/// Completion notification callback. Fired from the dispatcher task only.
pub type CompletionFn = Arc<dyn Fn(&LockStatus) + Send + Sync>;

/// Blocking notification callback: `(lkid, blocked requested mode)`.
pub type BlockingFn = Arc<dyn Fn(u32, Mode) + Send + Sync>;
