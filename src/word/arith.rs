//! Integer arithmetic with ND-100 flag semantics.
//!
//! Results are returned together with the flag outcomes; the caller decides
//! which status bits to update.

use serde::{Deserialize, Serialize};

/// Outcome of a 16-bit add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    /// The 16-bit sum.
    pub sum: u16,
    /// Carry out of bit 15.
    pub carry: bool,
    /// Signed overflow.
    pub overflow: bool,
}

/// Add two words and a carry-in.
///
/// Overflow is set when both operands have the same sign and the sum's sign
/// differs from it. SUB is `add3(a, !b, 1)`.
pub fn add3(a: u16, b: u16, carry_in: u16) -> AddResult {
    let wide = u32::from(a) + u32::from(b) + u32::from(carry_in & 1);
    let sum = wide as u16;
    let same_sign = (a ^ b) & 0x8000 == 0;
    AddResult {
        sum,
        carry: wide & 0x1_0000 != 0,
        overflow: same_sign && (a ^ sum) & 0x8000 != 0,
    }
}

/// Signed 16x16 multiply, truncated to 16 bits.
///
/// Returns the low word and whether the true product is outside the
/// signed 16-bit range.
pub fn mpy(a: u16, b: u16) -> (u16, bool) {
    let product = i32::from(a as i16) * i32::from(b as i16);
    let overflow = product > i32::from(i16::MAX) || product < i32::from(i16::MIN);
    (product as u16, overflow)
}

/// End-fill policy of a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftKind {
    /// Left shifts fill with zero, right shifts replicate the sign bit.
    Arithmetic,
    /// Bits shifted out re-enter at the other end.
    Rotate,
    /// Zero fill in both directions.
    ZeroFill,
    /// The M flag is shifted in, and each bit shifted out becomes the new M.
    LinkFill,
}

impl ShiftKind {
    /// Decode the two shift-type bits (9-10) of an SHT instruction.
    pub fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => ShiftKind::Arithmetic,
            1 => ShiftKind::Rotate,
            2 => ShiftKind::ZeroFill,
            _ => ShiftKind::LinkFill,
        }
    }

    /// Encode into the two shift-type bits.
    pub fn to_bits(self) -> u16 {
        match self {
            ShiftKind::Arithmetic => 0,
            ShiftKind::Rotate => 1,
            ShiftKind::ZeroFill => 2,
            ShiftKind::LinkFill => 3,
        }
    }
}

/// Shift a value of `width` bits (16 or 32).
///
/// Positive counts shift left, negative counts shift right. Returns the
/// shifted value and the last bit shifted out, or `None` for a zero count.
pub fn shift(
    value: u32,
    width: u32,
    kind: ShiftKind,
    count: i8,
    link: bool,
) -> (u32, Option<bool>) {
    let mask = if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    };
    let top = 1u32 << (width - 1);
    let mut v = value & mask;
    let mut link = link;
    let mut last = None;

    for _ in 0..count.unsigned_abs() {
        let out;
        if count > 0 {
            out = v & top != 0;
            let fill = match kind {
                ShiftKind::Arithmetic | ShiftKind::ZeroFill => false,
                ShiftKind::Rotate => out,
                ShiftKind::LinkFill => link,
            };
            v = ((v << 1) & mask) | u32::from(fill);
        } else {
            out = v & 1 != 0;
            let fill = match kind {
                ShiftKind::Arithmetic => v & top != 0,
                ShiftKind::ZeroFill => false,
                ShiftKind::Rotate => out,
                ShiftKind::LinkFill => link,
            };
            v = (v >> 1) | if fill { top } else { 0 };
        }
        link = out;
        last = Some(out);
    }

    (v, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add3_carry_and_overflow() {
        let r = add3(0x7fff, 1, 0);
        assert_eq!(r.sum, 0x8000);
        assert!(r.overflow);
        assert!(!r.carry);

        let r = add3(0xffff, 1, 0);
        assert_eq!(r.sum, 0);
        assert!(r.carry);
        assert!(!r.overflow);
    }

    #[test]
    fn test_sub_as_complement_add() {
        let r = add3(5, !7, 1);
        assert_eq!(r.sum as i16, -2);
        assert!(!r.carry);

        let r = add3(7, !5, 1);
        assert_eq!(r.sum, 2);
        assert!(r.carry);
    }

    #[test]
    fn test_mpy() {
        assert_eq!(mpy(100, 200), (20000, false));
        assert_eq!(mpy((-3i16) as u16, 7), ((-21i16) as u16, false));
        let (_, overflow) = mpy(300, 300);
        assert!(overflow);
    }

    #[test]
    fn test_shift_arithmetic_right_keeps_sign() {
        let (v, out) = shift(0x8002, 16, ShiftKind::Arithmetic, -2, false);
        assert_eq!(v, 0xe000);
        assert_eq!(out, Some(true));
    }

    #[test]
    fn test_shift_rotate() {
        let (v, out) = shift(0x8001, 16, ShiftKind::Rotate, 1, false);
        assert_eq!(v, 0x0003);
        assert_eq!(out, Some(true));
        let (v, _) = shift(0x0001, 16, ShiftKind::Rotate, -1, false);
        assert_eq!(v, 0x8000);
    }

    #[test]
    fn test_shift_link_fill() {
        let (v, out) = shift(0x0000, 16, ShiftKind::LinkFill, 1, true);
        assert_eq!(v, 1);
        assert_eq!(out, Some(false));
    }

    #[test]
    fn test_shift_double_width() {
        let (v, _) = shift(0x0000_8000, 32, ShiftKind::ZeroFill, 1, false);
        assert_eq!(v, 0x0001_0000);
        let (v, out) = shift(0x1234_5678, 32, ShiftKind::ZeroFill, 0, true);
        assert_eq!(v, 0x1234_5678);
        assert_eq!(out, None);
    }

    proptest! {
        #[test]
        fn prop_add3_matches_twos_complement(a: u16, b: u16) {
            let r = add3(a, b, 0);
            prop_assert_eq!(r.sum, a.wrapping_add(b));
            prop_assert_eq!(r.carry, a.checked_add(b).is_none());
            prop_assert_eq!(r.overflow, (a as i16).checked_add(b as i16).is_none());
        }

        #[test]
        fn prop_shift_left_zero_fill_matches_shl(v: u16, n in 1i8..16) {
            let (s, _) = shift(u32::from(v), 16, ShiftKind::ZeroFill, n, false);
            prop_assert_eq!(s as u16, v << n);
        }
    }
}
