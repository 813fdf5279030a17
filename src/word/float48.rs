//! 48-bit floating point.
//!
//! A value occupies three words: T holds the sign (bit 15) and a 15-bit
//! exponent biased by 16384, A and D hold the 32-bit mantissa. Positive
//! numbers store the exponent and the normalized mantissa (`0.1xxx...`)
//! directly. Negative numbers store the one's complement of the exponent
//! field and the two's complement of the mantissa.
//!
//! Arithmetic works on the sign/magnitude form produced by
//! [`Float48::unpack`], with `GUARD_BITS` extra low-order bits kept through
//! alignment and division so the final result can be rounded.

use thiserror::Error;

/// Exponent bias.
pub const EXP_BIAS: i32 = 0o40000;

const EXP_MAX: i32 = 0o77777;
const GUARD_BITS: u32 = 8;
const NORMAL_TOP: u32 = 31 + GUARD_BITS;

/// Floating point exceptions. Both set the error indicator (Z).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FloatError {
    #[error("floating point overflow")]
    Overflow,

    #[error("floating point divide by zero")]
    DivideByZero,
}

/// A 48-bit float in sign/magnitude working form.
///
/// The value is `0.mantissa * 2^(exponent - EXP_BIAS)`; a zero mantissa is
/// zero regardless of sign and exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Float48 {
    /// Sign of the value.
    pub negative: bool,
    /// Biased exponent, 0..=0o77777 once packed.
    pub exponent: i32,
    /// Mantissa magnitude; bit 31 is set when normalized.
    pub mantissa: u32,
}

impl Float48 {
    /// Positive zero.
    pub const ZERO: Float48 = Float48 {
        negative: false,
        exponent: 0,
        mantissa: 0,
    };

    /// Largest magnitude with the given sign, stored on overflow and divide by zero.
    pub fn saturated(negative: bool) -> Self {
        Float48 {
            negative,
            exponent: EXP_MAX,
            mantissa: u32::MAX,
        }
    }

    /// Decode the T, A, D words.
    pub fn unpack(t: u16, a: u16, d: u16) -> Self {
        let negative = t & 0x8000 != 0;
        let mut exponent = t & 0x7fff;
        let mut mantissa = (u32::from(a) << 16) | u32::from(d);
        if negative {
            exponent = !exponent & 0x7fff;
            mantissa = mantissa.wrapping_neg();
        }
        if mantissa == 0 {
            return Self::ZERO;
        }
        Float48 {
            negative,
            exponent: i32::from(exponent),
            mantissa,
        }
    }

    /// Encode into T, A, D words. Any zero packs as all-zero words.
    pub fn pack(self) -> [u16; 3] {
        if self.mantissa == 0 {
            return [0, 0, 0];
        }
        let mut t = (self.exponent & EXP_MAX) as u16;
        let mut m = self.mantissa;
        if self.negative {
            t = (!t & 0x7fff) | 0x8000;
            m = m.wrapping_neg();
        }
        [t, (m >> 16) as u16, m as u16]
    }

    /// True for any zero.
    pub fn is_zero(self) -> bool {
        self.mantissa == 0
    }

    /// Flip the sign.
    pub fn negate(self) -> Self {
        if self.is_zero() {
            return self;
        }
        Float48 {
            negative: !self.negative,
            ..self
        }
    }

    /// Shift the mantissa up until bit 31 is set.
    fn normalized(self) -> Self {
        if self.is_zero() {
            return Self::ZERO;
        }
        let n = self.mantissa.leading_zeros();
        Float48 {
            negative: self.negative,
            exponent: self.exponent - n as i32,
            mantissa: self.mantissa << n,
        }
    }

    /// Sum of two floats.
    pub fn add(self, rhs: Float48) -> Result<Float48, FloatError> {
        let (x, y) = (self.normalized(), rhs.normalized());
        if x.is_zero() {
            return Ok(y);
        }
        if y.is_zero() {
            return Ok(x);
        }

        let (big, small) = if (x.exponent, x.mantissa) >= (y.exponent, y.mantissa) {
            (x, y)
        } else {
            (y, x)
        };
        let diff = (big.exponent - small.exponent) as u32;
        let mb = u64::from(big.mantissa) << GUARD_BITS;
        let ms = shift_right_sticky(u64::from(small.mantissa) << GUARD_BITS, diff);

        if big.negative == small.negative {
            round_pack(big.negative, big.exponent, mb + ms)
        } else {
            // Exact cancellation lands here with mb == ms.
            round_pack(big.negative, big.exponent, mb - ms)
        }
    }

    /// Difference of two floats.
    pub fn sub(self, rhs: Float48) -> Result<Float48, FloatError> {
        self.add(rhs.negate())
    }

    /// Product of two floats.
    pub fn mul(self, rhs: Float48) -> Result<Float48, FloatError> {
        let (x, y) = (self.normalized(), rhs.normalized());
        if x.is_zero() || y.is_zero() {
            return Ok(Self::ZERO);
        }
        let product = u64::from(x.mantissa) * u64::from(y.mantissa);
        let m = shift_right_sticky(product, 32 - GUARD_BITS);
        round_pack(
            x.negative != y.negative,
            x.exponent + y.exponent - EXP_BIAS,
            m,
        )
    }

    /// Quotient of two floats.
    pub fn div(self, rhs: Float48) -> Result<Float48, FloatError> {
        let (x, y) = (self.normalized(), rhs.normalized());
        if y.is_zero() {
            return Err(FloatError::DivideByZero);
        }
        if x.is_zero() {
            return Ok(Self::ZERO);
        }
        let dividend = u128::from(x.mantissa) << (32 + GUARD_BITS);
        let divisor = u128::from(y.mantissa);
        let mut q = (dividend / divisor) as u64;
        if dividend % divisor != 0 {
            q |= 1;
        }
        round_pack(
            x.negative != y.negative,
            x.exponent - y.exponent + EXP_BIAS,
            q,
        )
    }

    /// Convert a signed 16-bit integer to float (NLZ).
    ///
    /// The result is `value * 2^(scale - 16)`, so a scale of 16 converts an
    /// integer exactly.
    pub fn from_fixed(value: u16, scale: i8) -> Result<Float48, FloatError> {
        let v = i32::from(value as i16);
        if v == 0 {
            return Ok(Self::ZERO);
        }
        let magnitude = v.unsigned_abs();
        let width = 32 - magnitude.leading_zeros();
        let exponent = width as i32 + i32::from(scale) - 16 + EXP_BIAS;
        if exponent > EXP_MAX {
            return Err(FloatError::Overflow);
        }
        if exponent < 0 {
            return Ok(Self::ZERO);
        }
        Ok(Float48 {
            negative: v < 0,
            exponent,
            mantissa: magnitude << (32 - width),
        })
    }

    /// Convert to a signed 16-bit integer (DNZ), truncating toward zero.
    ///
    /// The result is `self * 2^(scale + 16)`. Magnitudes below one give zero;
    /// results outside the signed 16-bit range are an overflow.
    pub fn to_fixed(self, scale: i8) -> Result<u16, FloatError> {
        let x = self.normalized();
        if x.is_zero() {
            return Ok(0);
        }
        let k = x.exponent - EXP_BIAS + i32::from(scale) + 16;
        if k <= 0 {
            return Ok(0);
        }
        if k > 16 {
            return Err(FloatError::Overflow);
        }
        let magnitude = x.mantissa >> (32 - k as u32);
        if x.negative {
            if magnitude > 0x8000 {
                return Err(FloatError::Overflow);
            }
            Ok((-(magnitude as i32)) as u16)
        } else {
            if magnitude > 0x7fff {
                return Err(FloatError::Overflow);
            }
            Ok(magnitude as u16)
        }
    }
}

/// Shift right, OR-ing every lost bit into bit 0.
fn shift_right_sticky(m: u64, n: u32) -> u64 {
    if n == 0 {
        m
    } else if n >= 64 {
        u64::from(m != 0)
    } else {
        let lost = m & ((1u64 << n) - 1);
        (m >> n) | u64::from(lost != 0)
    }
}

/// Normalize a guard-extended mantissa, round half up and range-check.
fn round_pack(negative: bool, mut exponent: i32, mut m: u64) -> Result<Float48, FloatError> {
    if m == 0 {
        return Ok(Float48::ZERO);
    }
    let top = 63 - m.leading_zeros();
    if top > NORMAL_TOP {
        let n = top - NORMAL_TOP;
        m = shift_right_sticky(m, n);
        exponent += n as i32;
    } else if top < NORMAL_TOP {
        let n = NORMAL_TOP - top;
        m <<= n;
        exponent -= n as i32;
    }

    m += 1 << (GUARD_BITS - 1);
    if m >> (NORMAL_TOP + 1) != 0 {
        m >>= 1;
        exponent += 1;
    }

    if exponent > EXP_MAX {
        return Err(FloatError::Overflow);
    }
    if exponent < 0 {
        return Ok(Float48::ZERO);
    }
    Ok(Float48 {
        negative,
        exponent,
        mantissa: (m >> GUARD_BITS) as u32,
    })
}
