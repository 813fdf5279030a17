//! Bit helpers and architectural field accessors.

/// Sign-extend the low 8 bits of a word.
#[inline]
pub fn sext8(word: u16) -> u16 {
    word as u8 as i8 as i16 as u16
}

/// Sign-extend the low 6 bits of a word into an `i8`.
#[inline]
pub fn sext6(word: u16) -> i8 {
    ((word as u8) << 2) as i8 >> 2
}

/// Test bit `n` of a word.
#[inline]
pub fn bit(word: u16, n: u32) -> bool {
    word & (1 << n) != 0
}

/// Return `word` with bit `n` set to `value`.
#[inline]
pub fn with_bit(word: u16, n: u32, value: bool) -> u16 {
    if value {
        word | (1 << n)
    } else {
        word & !(1 << n)
    }
}

/// Index of the highest set bit, if any.
#[inline]
pub fn highest_bit(word: u16) -> Option<u8> {
    if word == 0 {
        None
    } else {
        Some(15 - word.leading_zeros() as u8)
    }
}

/// Index of the lowest set bit, if any.
#[inline]
pub fn lowest_bit(word: u16) -> Option<u8> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros() as u8)
    }
}

/// Byte field descriptor held in T (destination) or D (source).
///
/// Bits 0-11 hold the remaining length in bytes, bit 15 selects the
/// right-hand byte of the current word and bit 13 marks a move whose
/// setup step has already run.
pub mod field {
    /// Length mask of a byte field descriptor.
    pub const LENGTH: u16 = 0o7777;
    /// Setup-done marker used by MOVB and MOVBF.
    pub const SETUP: u16 = 1 << 13;
    /// Right-byte selector.
    pub const RIGHT: u16 = 1 << 15;

    /// Remaining length.
    #[inline]
    pub fn length(desc: u16) -> u16 {
        desc & LENGTH
    }

    /// Replace the length field.
    #[inline]
    pub fn with_length(desc: u16, len: u16) -> u16 {
        (desc & !LENGTH) | (len & LENGTH)
    }

    /// True if the descriptor points at the right-hand byte.
    #[inline]
    pub fn is_right(desc: u16) -> bool {
        desc & RIGHT != 0
    }
}
