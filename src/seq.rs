//! Wrap-around sequence number arithmetic.
//!
//! Sequence numbers live in a 32-bit space that wraps modulo 2^32.  Two
//! numbers are ordered by the sign of their wrapping difference, which is
//! correct as long as they are less than 2^31 apart (always the case for any
//! realistic window).

/// `a` comes strictly before `b`.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` comes before or is equal to `b`.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a` comes strictly after `b`.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Number of sequence numbers from `from` up to (not including) `to`.
#[inline]
pub fn seq_distance(from: u32, to: u32) -> usize {
    to.wrapping_sub(from) as usize
}
