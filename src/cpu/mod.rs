//! CPU emulation for the ND-100.
//!
//! This module implements the processor core:
//! - 16 interrupt levels, each with its own bank of eight registers
//! - paged memory management with four page tables, rings and shadow memory
//! - internal traps and device interrupts resolved once per fetch
//! - the full 32-group instruction set, including resumable byte moves

pub mod bytes;
pub mod decode;
pub mod execute;
pub mod interrupt;
pub mod memory;
pub mod mmu;
pub mod registers;

pub use bytes::MoveState;
pub use decode::{decode, encode, Instruction};
pub use execute::{Cpu, LoadError, Snapshot, StepOutcome, StopReason};
pub use interrupt::{
    DeviceHandle, InterruptError, InterruptLine, Interrupts, IoBus, IoError, NoDevices, Trap,
};
pub use memory::{Memory, MemoryError, OutOfRange};
pub use mmu::{AccessKind, ByteSide, Mmu, MmuContext, TableSelect};
pub use registers::{Reg, Registers};
