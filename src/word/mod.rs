//! 16-bit word primitives for the ND-100.
//!
//! This module provides the value-level building blocks the CPU uses:
//! - [`bits`] - bit helpers and named architectural fields
//! - [`arith`] - integer add, multiply and shift with flag results
//! - [`Float48`] - the 48-bit floating point format held in T, A and D

pub mod arith;
pub mod bits;
mod float48;

pub use arith::{add3, mpy, shift, AddResult, ShiftKind};
pub use bits::{sext6, sext8};
pub use float48::{Float48, FloatError, EXP_BIAS};
