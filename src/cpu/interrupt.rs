//! Interrupt and trap controller.
//!
//! Sixteen priority levels share two 16-bit registers, PID (detected) and
//! PIE (enabled). The CPU always runs at the highest level set in
//! `PID & PIE` while the interrupt system is on.
//!
//! Internal traps are collected at level 14 through IID (detected), IIE
//! (enabled) and IIC (the code of the pending source). Device interrupts use
//! levels 10-13; each level keeps a FIFO of devices waiting to answer IDENT.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::word::bits::{highest_bit, lowest_bit};

/// Level that receives internal interrupts.
pub const INTERNAL_LEVEL: u8 = 14;

/// Lowest device interrupt level.
pub const FIRST_DEVICE_LEVEL: u8 = 10;

/// Highest device interrupt level.
pub const LAST_DEVICE_LEVEL: u8 = 13;

/// Internal interrupt sources, numbered by their IIE/IID bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Trap {
    /// MON instruction.
    MonitorCall = 1,
    /// Page access outside the permitted ring or permission bits.
    ProtectViolation = 2,
    /// Page not present.
    PageFault = 3,
    /// Undefined instruction.
    IllegalInstruction = 4,
    /// Error indicator (Z) set: floating overflow or divide by zero.
    ErrorIndicator = 5,
    /// Privileged instruction in ring 0 or 1.
    PrivilegedInstruction = 6,
    /// IOX to a device that did not answer, or IDENT with nothing queued.
    IoxError = 7,
    /// Memory parity error.
    MemoryParity = 8,
    /// Physical address beyond installed memory.
    MemoryOutOfRange = 9,
    /// Power fail.
    PowerFail = 10,
}

impl Trap {
    /// Source bit in IIE/IID.
    pub fn mask(self) -> u16 {
        1 << self as u16
    }

    /// True for traps that abandon the instruction before it completes.
    ///
    /// The program counter is left on the faulting instruction so that it is
    /// executed again once the trap handler returns.
    pub fn aborts(self) -> bool {
        matches!(
            self,
            Trap::PageFault | Trap::ProtectViolation | Trap::MemoryOutOfRange | Trap::MemoryParity
        )
    }
}

/// A device registered for IDENT polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceSlot {
    level: u8,
    ident: u16,
    queued: bool,
}

/// Interrupt controller state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interrupts {
    /// Priority interrupt detect, one bit per level.
    pub pid: u16,
    /// Priority interrupt enable, one bit per level.
    pub pie: u16,
    /// Internal interrupt enable, one bit per [`Trap`] source.
    pub iie: u16,
    /// Internal interrupt detect.
    iid: u16,
    /// Internal interrupt code of the pending source.
    iic: u16,
    /// Low byte of the last MON instruction, sign-extended.
    monitor_call: u16,
    devices: Vec<DeviceSlot>,
    queues: [VecDeque<usize>; 4],
}

impl Interrupts {
    /// Create a controller with nothing pending or enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear pending and enabled state. Registered devices are kept.
    pub fn reset(&mut self) {
        self.pid = 0;
        self.pie = 0;
        self.iie = 0;
        self.iid = 0;
        self.iic = 0;
        self.monitor_call = 0;
        for queue in &mut self.queues {
            queue.clear();
        }
        for slot in &mut self.devices {
            slot.queued = false;
        }
    }

    /// Post an internal interrupt.
    ///
    /// Sets the detect bit and recomputes IIC as the lowest detected and
    /// enabled source. Level 14 is requested only for enabled sources.
    pub fn post_internal(&mut self, trap: Trap) {
        self.iid |= trap.mask();
        if let Some(code) = lowest_bit(self.iid & self.iie) {
            self.iic = u16::from(code);
            self.pid |= 1 << INTERNAL_LEVEL;
        }
        debug!("internal interrupt {:?} (iid={:#06x} iic={})", trap, self.iid, self.iic);
    }

    /// Post a monitor call, remembering its sign-extended number.
    pub fn post_monitor_call(&mut self, number: u16) {
        self.monitor_call = number;
        self.post_internal(Trap::MonitorCall);
    }

    /// Current IIC without side effects.
    pub fn iic(&self) -> u16 {
        self.iic
    }

    /// Read IIC (TRA IIC). Clears IIC, IID and level 14's PID bit together.
    pub fn take_iic(&mut self) -> u16 {
        let code = self.iic;
        self.iic = 0;
        self.iid = 0;
        self.pid &= !(1 << INTERNAL_LEVEL);
        code
    }

    /// Sign-extended number of the last monitor call.
    pub fn monitor_call(&self) -> u16 {
        self.monitor_call
    }

    /// True if a monitor call is the pending internal interrupt.
    pub fn monitor_call_pending(&self) -> bool {
        self.iic == Trap::MonitorCall as u16
    }

    /// Highest level set in `PID & PIE`, or 0.
    pub fn highest_level(&self) -> u8 {
        highest_bit(self.pid & self.pie).unwrap_or(0)
    }

    /// Register a device that interrupts on `level` and answers IDENT with `ident`.
    pub fn register_device(
        &mut self,
        level: u8,
        ident: u16,
    ) -> Result<DeviceHandle, InterruptError> {
        check_device_level(level)?;
        self.devices.push(DeviceSlot {
            level,
            ident,
            queued: false,
        });
        Ok(DeviceHandle(self.devices.len() - 1))
    }

    /// Level a device was registered on.
    pub fn device_level(&self, device: DeviceHandle) -> Option<u8> {
        self.devices.get(device.0).map(|slot| slot.level)
    }

    /// Post a device interrupt on `level`.
    ///
    /// The device joins the level's queue unless it is already waiting.
    pub fn post_external(&mut self, level: u8, device: DeviceHandle) -> Result<(), InterruptError> {
        check_device_level(level)?;
        let slot = self.devices.get_mut(device.0).ok_or(InterruptError::UnknownDevice)?;
        if slot.level != level {
            return Err(InterruptError::LevelMismatch {
                registered: slot.level,
                posted: level,
            });
        }
        if !slot.queued {
            slot.queued = true;
            self.queues[usize::from(level - FIRST_DEVICE_LEVEL)].push_back(device.0);
        }
        self.pid |= 1 << level;
        debug!("device {} posted on level {}", device.0, level);
        Ok(())
    }

    /// Dequeue the device at the head of `level`'s queue (IDENT).
    ///
    /// The level's PID bit is cleared once its queue is empty. Returns `None`
    /// if nothing was queued.
    pub fn ident(&mut self, level: u8) -> Option<u16> {
        if !(FIRST_DEVICE_LEVEL..=LAST_DEVICE_LEVEL).contains(&level) {
            return None;
        }
        let queue = &mut self.queues[usize::from(level - FIRST_DEVICE_LEVEL)];
        let index = queue.pop_front()?;
        if queue.is_empty() {
            self.pid &= !(1 << level);
        }
        let slot = &mut self.devices[index];
        slot.queued = false;
        Some(slot.ident)
    }
}

fn check_device_level(level: u8) -> Result<(), InterruptError> {
    if (FIRST_DEVICE_LEVEL..=LAST_DEVICE_LEVEL).contains(&level) {
        Ok(())
    } else {
        Err(InterruptError::InvalidLevel(level))
    }
}

/// A cloneable, thread-safe line a device model uses to raise its interrupt.
///
/// Requests are queued and applied by the CPU at the top of its next
/// fetch-loop iteration.
#[derive(Debug, Clone)]
pub struct InterruptLine {
    pub(crate) level: u8,
    pub(crate) device: DeviceHandle,
    pub(crate) tx: Sender<(u8, DeviceHandle)>,
}

impl InterruptLine {
    /// Request the interrupt. Returns false if the CPU has been dropped.
    pub fn raise(&self) -> bool {
        self.tx.send((self.level, self.device)).is_ok()
    }
}

/// Host IO bus reached by IOX and IOXT.
pub trait IoBus {
    /// Perform an IOX to `device` with the current A.
    ///
    /// Returns the new value of A for input transfers, `None` for output.
    fn iox(&mut self, device: u16, a: u16) -> Result<Option<u16>, IoError>;
}

/// An IO bus with nothing attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

impl IoBus for NoDevices {
    fn iox(&mut self, device: u16, _a: u16) -> Result<Option<u16>, IoError> {
        Err(IoError::Unhandled(device))
    }
}

/// IO bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("device {0:#o} did not respond")]
    NoResponse(u16),

    #[error("no device model for address {0:#o}")]
    Unhandled(u16),
}

/// Errors from device registration and posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterruptError {
    #[error("level {0} is not a device interrupt level (10-13)")]
    InvalidLevel(u8),

    #[error("unknown device handle")]
    UnknownDevice,

    #[error("device registered on level {registered} posted on level {posted}")]
    LevelMismatch { registered: u8, posted: u8 },
}
