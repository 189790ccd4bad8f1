//! Flag bits used across the engine.
//!
//! Caller flags ride in on every request and are carried on the wire in the
//! `exflags` field. Internal flags never leave the node except where the
//! remaster path says otherwise. Status-block flags are reported back to the
//! caller with the completion notification.

// Caller-visible operation flags.

/// Turn an unlock into a cancel of a pending convert/wait.
pub const LKF_CANCEL: u32 = 0x0000_0001;
/// The operation is a conversion of an existing lock.
pub const LKF_CONVERT: u32 = 0x0000_0002;
/// Queue the conversion at the tail of the convert queue.
pub const LKF_QUECVT: u32 = 0x0000_0004;
/// This lock reads/writes the resource's lock value block.
pub const LKF_VALBLK: u32 = 0x0000_0008;
/// Place the conversion at the head of the convert queue.
pub const LKF_EXPEDITE: u32 = 0x0000_0010;
/// Fail with `TryFailed` instead of waiting.
pub const LKF_NOQUEUE: u32 = 0x0000_0020;
/// With `NOQUEUE`: still send blocking notifications to the holders that
/// caused the failure.
pub const LKF_NOQUEUEBAST: u32 = 0x0000_0040;
/// The lock survives the death of the owning process.
pub const LKF_PERSISTENT: u32 = 0x0000_0080;
/// Exclude this conversion from deadlock detection.
pub const LKF_NODLCKWT: u32 = 0x0000_0100;
/// Allow demoting this lock to NL to break a conversion deadlock.
pub const LKF_CONVDEADLK: u32 = 0x0000_0200;
/// If the requested mode cannot be granted, try PR instead.
pub const LKF_ALTPR: u32 = 0x0000_0400;
/// If the requested mode cannot be granted, try CW instead.
pub const LKF_ALTCW: u32 = 0x0000_0800;
/// Zero the resource LVB on unlock.
pub const LKF_IVVALBLK: u32 = 0x0000_1000;

/// Every caller flag the engine accepts; anything else is rejected.
pub const LKF_ALL: u32 = LKF_CANCEL
    | LKF_CONVERT
    | LKF_QUECVT
    | LKF_VALBLK
    | LKF_EXPEDITE
    | LKF_NOQUEUE
    | LKF_NOQUEUEBAST
    | LKF_PERSISTENT
    | LKF_NODLCKWT
    | LKF_CONVDEADLK
    | LKF_ALTPR
    | LKF_ALTCW
    | LKF_IVVALBLK;

// Internal per-lock flags (`iflags` on the wire where sent at all).

/// Master copy of a lock held on another node.
pub const IFL_MSTCPY: u32 = 0x0000_0001;
/// The lock carries an LVB.
pub const IFL_VALBLK: u32 = 0x0000_0002;
/// A range accompanies the message payload.
pub const IFL_RANGE: u32 = 0x0000_0004;
/// The parked request must be resent after recovery.
pub const IFL_RESEND: u32 = 0x0000_0008;
/// Do not rebuild this lock on the new master during remastering.
pub const IFL_NOREBUILD: u32 = 0x0000_0010;
/// In-flight conversion; the new master grants it at its prior mode.
pub const IFL_LQCONVERT: u32 = 0x0000_0020;
/// Unlock in progress; the lock may no longer be operated on.
pub const IFL_DELETED: u32 = 0x0000_0040;
/// The lock was demoted to NL to break a conversion deadlock.
pub const IFL_DEMOTED: u32 = 0x0000_0080;
/// Recovery decided this unlock completed on the dead master.
pub const IFL_UNLOCKDONE: u32 = 0x0000_0100;

// Status-block flags reported to the caller.

/// The lock was demoted to NL at some point.
pub const SBF_DEMOTED: u8 = 0x01;
/// The resource LVB does not reflect any committed writer.
pub const SBF_VALNOTVALID: u8 = 0x02;
/// The lock was granted in the alternate (ALTPR/ALTCW) mode.
pub const SBF_ALTMODE: u8 = 0x04;

// Per-resource flags.

/// This node masters the resource.
pub const RSF_MASTER: u32 = 0x0000_0001;
/// Mastery moved here during the current recovery epoch.
pub const RSF_NEW_MASTER: u32 = 0x0000_0002;
/// The resource LVB is not valid (no holder above CR since last clear).
pub const RSF_VALNOTVALID: u32 = 0x0000_0004;
/// The resource is on the recovery bookkeeping list.
pub const RSF_RECOVER_LIST: u32 = 0x0000_0008;

// Pending notification kinds, kept as a small bitmask per lock.

/// Completion notification pending.
pub const AST_COMP: u8 = 0x01;
/// Blocking notification pending.
pub const AST_BAST: u8 = 0x02;
/// Release the lock after delivering the completion.
pub const AST_DEL: u8 = 0x04;
