//! ND-100 register file and per-level register banks.
//!
//! Eight working registers are visible at a time:
//! - STS: status (low byte per level, high byte shared by all levels)
//! - D, A: double accumulator (A is the main accumulator)
//! - P: program counter
//! - B: base register
//! - L: link register
//! - T: temporary / float exponent
//! - X: index register
//!
//! Each of the 16 interrupt levels owns a saved copy of these eight
//! registers. The working set belongs to the current level; it is flushed
//! to that level's bank only when the level changes.

use serde::{Deserialize, Serialize};

/// Number of interrupt levels.
pub const LEVELS: usize = 16;

/// Low status bits, private to each level.
pub mod sts {
    /// Page table mode.
    pub const PTM: u16 = 1 << 0;
    /// Floating rounding mode.
    pub const TG: u16 = 1 << 1;
    /// One-bit accumulator of the bit instructions.
    pub const K: u16 = 1 << 2;
    /// Error indicator.
    pub const Z: u16 = 1 << 3;
    /// Dynamic overflow.
    pub const Q: u16 = 1 << 4;
    /// Static (sticky) overflow.
    pub const O: u16 = 1 << 5;
    /// Carry.
    pub const C: u16 = 1 << 6;
    /// Multi-shift link.
    pub const M: u16 = 1 << 7;

    /// High status bits, common to all levels.
    pub const N100: u16 = 1 << 8;
    /// Extended (32-bit page table entry) addressing.
    pub const SEXI: u16 = 1 << 9;
    /// Paging enabled.
    pub const PONI: u16 = 1 << 10;
    /// Interrupt system enabled.
    pub const IONI: u16 = 1 << 11;

    /// Mask of the per-level low byte.
    pub const LOW: u16 = 0x00ff;
}

/// Architectural register numbers, as used in instruction register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reg {
    Sts = 0,
    D = 1,
    P = 2,
    B = 3,
    L = 4,
    A = 5,
    T = 6,
    X = 7,
}

impl Reg {
    /// All registers in field-number order.
    pub const ALL: [Reg; 8] = [Reg::Sts, Reg::D, Reg::P, Reg::B, Reg::L, Reg::A, Reg::T, Reg::X];

    /// Register named by a 3-bit field.
    pub fn from_field(field: u16) -> Reg {
        Self::ALL[(field & 7) as usize]
    }

    /// The 3-bit field value.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Memory order of a register block, as stored by SRB and loaded by LRB.
pub const BLOCK_ORDER: [Reg; 8] = [
    Reg::P,
    Reg::X,
    Reg::T,
    Reg::A,
    Reg::D,
    Reg::L,
    Reg::Sts,
    Reg::B,
];

/// The working register set plus the per-level banks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// Working registers of the current level.
    r: [u16; 8],
    /// Saved register banks, one per level.
    banks: [[u16; 8]; LEVELS],
    /// Status bits shared by all levels (IONI, PONI, SEXI, N100).
    sth: u16,
    /// Current interrupt level.
    level: u8,
    /// Level active before the last switch.
    prev_level: u8,
}

impl Registers {
    /// Create a register file with everything zeroed, at level 0.
    pub fn new() -> Self {
        Self {
            r: [0; 8],
            banks: [[0; 8]; LEVELS],
            sth: 0,
            level: 0,
            prev_level: 0,
        }
    }

    /// Reset all registers and banks to zero.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Read a working register. STS reads back the full status word.
    #[inline]
    pub fn get(&self, reg: Reg) -> u16 {
        match reg {
            Reg::Sts => self.status(),
            _ => self.r[reg.index()],
        }
    }

    /// Write a working register. Writes to STS only reach the low byte.
    #[inline]
    pub fn set(&mut self, reg: Reg, value: u16) {
        match reg {
            Reg::Sts => self.r[0] = value & sts::LOW,
            _ => self.r[reg.index()] = value,
        }
    }

    /// Read a register as an operand: field 0 reads as zero.
    #[inline]
    pub fn operand(&self, field: u16) -> u16 {
        match Reg::from_field(field) {
            Reg::Sts => 0,
            reg => self.r[reg.index()],
        }
    }

    pub fn a(&self) -> u16 {
        self.r[Reg::A.index()]
    }

    pub fn d(&self) -> u16 {
        self.r[Reg::D.index()]
    }

    pub fn t(&self) -> u16 {
        self.r[Reg::T.index()]
    }

    pub fn x(&self) -> u16 {
        self.r[Reg::X.index()]
    }

    pub fn b(&self) -> u16 {
        self.r[Reg::B.index()]
    }

    pub fn p(&self) -> u16 {
        self.r[Reg::P.index()]
    }

    /// The AD register pair as one 32-bit value, A high.
    pub fn ad(&self) -> u32 {
        (u32::from(self.a()) << 16) | u32::from(self.d())
    }

    /// Set the AD register pair.
    pub fn set_ad(&mut self, value: u32) {
        self.set(Reg::A, (value >> 16) as u16);
        self.set(Reg::D, value as u16);
    }

    /// Advance the program counter by `n` words.
    pub fn advance_pc(&mut self, n: u16) {
        let p = self.p().wrapping_add(n);
        self.set(Reg::P, p);
    }

    /// Set the program counter.
    pub fn jump(&mut self, addr: u16) {
        self.set(Reg::P, addr);
    }

    /// Full status word: this level's low byte plus the shared high byte.
    pub fn status(&self) -> u16 {
        (self.r[0] & sts::LOW) | self.sth
    }

    /// Test a status bit (low or high).
    pub fn flag(&self, bit: u16) -> bool {
        self.status() & bit != 0
    }

    /// Set or clear a status bit (low or high).
    pub fn set_flag(&mut self, bit: u16, value: bool) {
        let low = bit & sts::LOW;
        let high = bit & !sts::LOW;
        if value {
            self.r[0] |= low;
            self.sth |= high;
        } else {
            self.r[0] &= !low;
            self.sth &= !high;
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.flag(sts::IONI)
    }

    pub fn paging_enabled(&self) -> bool {
        self.flag(sts::PONI)
    }

    pub fn extended(&self) -> bool {
        self.flag(sts::SEXI)
    }

    /// Current interrupt level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Level active before the last switch.
    pub fn prev_level(&self) -> u8 {
        self.prev_level
    }

    /// Switch the working set to another level's bank.
    ///
    /// The current registers are flushed to the current level's bank first.
    /// `t_patch` replaces T in the new level's bank before it is loaded; it
    /// carries the monitor-call number when entering level 14 for MON.
    pub fn switch_level(&mut self, new_level: u8, t_patch: Option<u16>) {
        let new_level = new_level & 0xf;
        self.banks[self.level as usize] = self.r;
        self.prev_level = self.level;
        self.level = new_level;
        if let Some(t) = t_patch {
            self.banks[new_level as usize][Reg::T.index()] = t;
        }
        self.r = self.banks[new_level as usize];
    }

    /// Read one register of a level's bank (IRR).
    ///
    /// The current level is served from the working set.
    pub fn read_banked(&self, level: u8, reg: Reg) -> u16 {
        let level = level & 0xf;
        let value = if level == self.level {
            self.r[reg.index()]
        } else {
            self.banks[level as usize][reg.index()]
        };
        if reg == Reg::Sts {
            value & sts::LOW
        } else {
            value
        }
    }

    /// Write one register of a level's bank (IRW).
    ///
    /// For the current level the working register follows, except P.
    pub fn write_banked(&mut self, level: u8, reg: Reg, value: u16) {
        let level = level & 0xf;
        let value = if reg == Reg::Sts { value & sts::LOW } else { value };
        self.banks[level as usize][reg.index()] = value;
        if level == self.level && reg != Reg::P {
            self.r[reg.index()] = value;
        }
    }

    /// Register block of a level in SRB memory order.
    ///
    /// When `level` is current, the working set is first snapshotted into its
    /// own bank with P already advanced past the storing instruction.
    pub fn store_block(&mut self, level: u8) -> [u16; 8] {
        let level = level & 0xf;
        if level == self.level {
            let mut snapshot = self.r;
            snapshot[Reg::P.index()] = snapshot[Reg::P.index()].wrapping_add(1);
            self.banks[level as usize] = snapshot;
        }
        let bank = &self.banks[level as usize];
        let mut block = [0; 8];
        for (slot, reg) in block.iter_mut().zip(BLOCK_ORDER) {
            *slot = match reg {
                Reg::Sts => (bank[0] & sts::LOW) | self.sth,
                _ => bank[reg.index()],
            };
        }
        block
    }

    /// Load a register block in SRB memory order into a level's bank (LRB).
    ///
    /// The status word keeps only its low byte. For the current level the
    /// working set is refreshed from the bank, except P.
    pub fn load_block(&mut self, level: u8, block: [u16; 8]) {
        let level = level & 0xf;
        let bank = &mut self.banks[level as usize];
        for (word, reg) in block.into_iter().zip(BLOCK_ORDER) {
            bank[reg.index()] = match reg {
                Reg::Sts => word & sts::LOW,
                _ => word,
            };
        }
        if level == self.level {
            let p = self.p();
            self.r = self.banks[level as usize];
            self.r[Reg::P.index()] = p;
        }
    }

    /// A copy of the working set in field-number order.
    pub fn working_set(&self) -> [u16; 8] {
        let mut regs = self.r;
        regs[0] = self.status();
        regs
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}
