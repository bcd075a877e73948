//! Serial number arithmetic for TSNs and SSNs.
//!
//! TSNs are 32-bit and SSNs 16-bit counters that wrap around. Two values are
//! ordered by the sign of their wrapping difference, so a value is "before"
//! another when it lies less than half the number space behind it:
//!
//! ```text
//!   0xFFFF_FFFE  0xFFFF_FFFF  0x0000_0000  0x0000_0001  0x0000_0002
//!        a  <         <            <            <            b
//! ```

/// a < b under modular arithmetic
pub fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b under modular arithmetic
pub fn tsn_le(a: u32, b: u32) -> bool {
    a == b || tsn_lt(a, b)
}

/// a > b under modular arithmetic
pub fn tsn_gt(a: u32, b: u32) -> bool {
    tsn_lt(b, a)
}

/// a >= b under modular arithmetic
pub fn tsn_ge(a: u32, b: u32) -> bool {
    a == b || tsn_lt(b, a)
}

/// Is `mid` in the closed interval from `low` to `high`, walking forward from
/// `low` around the ring?
pub fn tsn_between(low: u32, mid: u32, high: u32) -> bool {
    high.wrapping_sub(low) >= mid.wrapping_sub(low)
}

/// The later of two TSNs
pub fn tsn_max(a: u32, b: u32) -> u32 {
    if tsn_lt(a, b) {
        b
    } else {
        a
    }
}

/// a > b for 16-bit stream sequence numbers
pub fn ssn_gt(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) < 0
}

/// a >= b for 16-bit stream sequence numbers
pub fn ssn_ge(a: u16, b: u16) -> bool {
    a == b || ssn_gt(a, b)
}
