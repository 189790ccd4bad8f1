//! Lock modes and the mode-compatibility tables.
//!
//! The six usable modes are ordered by strength: `NL < CR < CW, PR, PW < EX`
//! (`CW`, `PR` and `PW` are mutually incomparable). `IV` is not a real mode;
//! it stands for "no mode" in a lock that has never been granted.

use num_derive::FromPrimitive;

/// Lock mode of a request or a grant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive)]
#[repr(i8)]
pub enum Mode {
    /// Invalid; a lock that has no granted mode yet.
    Iv = -1,
    /// Null. Carries no access rights, compatible with everything.
    Nl = 0,
    /// Concurrent read.
    Cr = 1,
    /// Concurrent write.
    Cw = 2,
    /// Protected read (shared).
    Pr = 3,
    /// Protected write (update).
    Pw = 4,
    /// Exclusive.
    Ex = 5,
}

/// Row/column index into the 8x8 tables; `IV` maps to row 0.
#[inline]
fn idx(mode: Mode) -> usize {
    (mode as i8 + 1) as usize
}

/// Which modes may coexist on the granted queue.
/// Rows are the granted mode, columns the requested mode; `IV` row/column
/// included so an ungranted lock compares as compatible with everything.
const COMPAT: [[bool; 8]; 8] = {
    const T: bool = true;
    const F: bool = false;
    [
        // IV NL CR CW PR PW EX --
        [T, T, T, T, T, T, T, F], // IV
        [T, T, T, T, T, T, T, F], // NL
        [T, T, T, T, T, T, F, F], // CR
        [T, T, T, T, F, F, F, F], // CW
        [T, T, T, F, T, F, F, F], // PR
        [T, T, T, F, F, F, F, F], // PW
        [T, T, F, F, F, F, F, F], // EX
        [F, F, F, F, F, F, F, F],
    ]
};

/// Legal granted->requested transitions for a QUECVT conversion.
const QUECVT_COMPAT: [[bool; 8]; 8] = {
    const T: bool = true;
    const F: bool = false;
    [
        // IV NL CR CW PR PW EX --
        [F, F, F, F, F, F, F, F], // IV
        [F, F, T, T, T, T, T, F], // NL
        [F, F, F, T, T, T, T, F], // CR
        [F, F, F, F, T, T, T, F], // CW
        [F, F, F, T, F, T, T, F], // PR
        [F, F, F, F, F, F, T, F], // PW
        [F, F, F, F, F, F, F, F], // EX
        [F, F, F, F, F, F, F, F],
    ]
};

/// Direction of LVB transfer when a lock at granted mode (row) is granted at
/// the requested mode (column).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LvbOp {
    /// Resource LVB is copied out to the lock holder.
    ToLock,
    /// Holder's LVB is written into the resource.
    ToResource,
    /// LVB untouched.
    None,
}

const LVB_OPS: [[i8; 8]; 8] = [
    // IV  NL  CR  CW  PR  PW  EX  --
    [-1, 1, 1, 1, 1, 1, 1, -1], // IV
    [-1, 1, 1, 1, 1, 1, 1, 0],  // NL
    [-1, -1, 1, 1, 1, 1, 1, 0], // CR
    [-1, -1, -1, 1, 1, 1, 1, 0], // CW
    [-1, -1, -1, -1, 1, 1, 1, 0], // PR
    [-1, 0, 0, 0, 0, 0, 1, 0],  // PW
    [-1, 0, 0, 0, 0, 0, 0, 0],  // EX
    [-1, 0, 0, 0, 0, 0, 0, 0],
];

impl Mode {
    /// True if a lock granted at `self` can coexist with one requesting `rq`.
    pub fn compat(self, rq: Mode) -> bool {
        COMPAT[idx(self)][idx(rq)]
    }

    /// True if converting from `self` to `rq` is a legal QUECVT conversion
    /// (strictly upward; QUECVT may not convert down or sideways).
    pub fn quecvt_compat(self, rq: Mode) -> bool {
        QUECVT_COMPAT[idx(self)][idx(rq)]
    }

    /// LVB transfer direction when a lock granted at `self` is regranted
    /// at `rq`.
    pub fn lvb_op(self, rq: Mode) -> LvbOp {
        match LVB_OPS[idx(self)][idx(rq)] {
            1 => LvbOp::ToLock,
            0 => LvbOp::ToResource,
            _ => LvbOp::None,
        }
    }

    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(raw: i8) -> Option<Mode> {
        num_traits::FromPrimitive::from_i8(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nl_compatible_with_all() {
        for mode in [Mode::Iv, Mode::Nl, Mode::Cr, Mode::Cw, Mode::Pr, Mode::Pw, Mode::Ex] {
            assert!(Mode::Nl.compat(mode), "NL vs {mode:?}");
            assert!(mode.compat(Mode::Nl), "{mode:?} vs NL");
        }
    }

    #[test]
    fn ex_excludes_everything_but_nl() {
        assert!(Mode::Ex.compat(Mode::Nl));
        for mode in [Mode::Cr, Mode::Cw, Mode::Pr, Mode::Pw, Mode::Ex] {
            assert!(!Mode::Ex.compat(mode), "EX vs {mode:?}");
        }
    }

    #[test]
    fn compat_is_symmetric() {
        let all = [Mode::Nl, Mode::Cr, Mode::Cw, Mode::Pr, Mode::Pw, Mode::Ex];
        for a in all {
            for b in all {
                assert_eq!(a.compat(b), b.compat(a), "{a:?}/{b:?}");
            }
        }
    }

    #[test]
    fn quecvt_only_upward() {
        assert!(Mode::Cr.quecvt_compat(Mode::Ex));
        assert!(Mode::Nl.quecvt_compat(Mode::Cr));
        assert!(!Mode::Ex.quecvt_compat(Mode::Cr));
        assert!(!Mode::Pr.quecvt_compat(Mode::Cr));
        // Sideways between the incomparable middle modes is allowed only
        // where the table says so.
        assert!(Mode::Pr.quecvt_compat(Mode::Cw));
        assert!(!Mode::Cw.quecvt_compat(Mode::Cw));
    }

    #[test]
    fn lvb_matrix_directions() {
        // A writer being granted downward publishes its LVB.
        assert_eq!(Mode::Ex.lvb_op(Mode::Nl), LvbOp::ToResource);
        assert_eq!(Mode::Pw.lvb_op(Mode::Cr), LvbOp::ToResource);
        // A reader converting upward reads the resource copy.
        assert_eq!(Mode::Nl.lvb_op(Mode::Pr), LvbOp::ToLock);
        assert_eq!(Mode::Iv.lvb_op(Mode::Ex), LvbOp::ToLock);
        // Same-mode regrants of a writer keep the resource copy untouched.
        assert_eq!(Mode::Ex.lvb_op(Mode::Ex), LvbOp::None);
        assert_eq!(Mode::Cr.lvb_op(Mode::Nl), LvbOp::None);
    }

    #[test]
    fn i8_round_trip() {
        for mode in [Mode::Iv, Mode::Nl, Mode::Cr, Mode::Cw, Mode::Pr, Mode::Pw, Mode::Ex] {
            assert_eq!(Mode::from_i8(mode.as_i8()), Some(mode));
        }
        assert_eq!(Mode::from_i8(6), None);
        assert_eq!(Mode::from_i8(-2), None);
    }
}
