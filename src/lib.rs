//! # ND-100 Emulator
//!
//! An emulator of the processor and memory management unit of the Norsk
//! Data ND-100, a 16-bit minicomputer with 16 interrupt levels, paged
//! virtual memory and 48-bit floating point.
//!
//! The library owns no threads and installs no logger. A host drives the
//! machine with [`Cpu::step`] or [`Cpu::run_limited`], attaches devices
//! through [`IoBus`] and raises their interrupts with an [`InterruptLine`].

pub mod config;
pub mod cpu;
pub mod word;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use cpu::{
    Cpu, DeviceHandle, Instruction, InterruptLine, IoBus, IoError, Memory, Registers, StepOutcome,
    StopReason, Trap,
};
pub use word::Float48;
