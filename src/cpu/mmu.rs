//! Memory management unit.
//!
//! Virtual addresses are 16 bits, split into a 6-bit page number and a
//! 10-bit offset (1K-word pages). Four page tables of 64 entries each hold,
//! per page, a protection part (permission bits, ring, used/written bits)
//! and a physical page number. Each interrupt level has a paging control
//! register (PCR) choosing its ring and its normal and alternate page table.
//!
//! In normal mode a page table entry is one word: the protection part in
//! bits 9-15 and a 9-bit physical page number. In extended mode (SEX) an
//! entry is two words, protection first, then a 14-bit page number.
//!
//! The page tables themselves are reachable through a shadow window at the
//! top of the virtual space, when running in ring 3 or with paging off.

use serde::{Deserialize, Serialize};

use crate::cpu::interrupt::Trap;
use crate::cpu::memory::{Memory, OutOfRange};
use crate::cpu::registers::LEVELS;

/// Number of page tables.
pub const PAGE_TABLES: usize = 4;
/// Entries per page table.
pub const PAGES: usize = 64;
/// Words per page.
pub const PAGE_WORDS: u32 = 1024;

/// First shadow address in normal mode.
pub const SHADOW_NORMAL: u16 = 0o177400;
/// First shadow address in extended mode.
pub const SHADOW_EXTENDED: u16 = 0o177000;

/// Protection bits of a page table entry.
pub mod pte {
    /// Write permitted.
    pub const WPM: u16 = 1 << 15;
    /// Read permitted.
    pub const RPM: u16 = 1 << 14;
    /// Fetch permitted.
    pub const FPM: u16 = 1 << 13;
    /// Written in page.
    pub const WIP: u16 = 1 << 12;
    /// Page used.
    pub const PGU: u16 = 1 << 11;
    /// Ring field.
    pub const RING: u16 = 3 << 9;
    /// Whole protection part.
    pub const PROTECTION: u16 = 0o177000;
    /// Physical page mask in normal mode.
    pub const PPN_NORMAL: u16 = 0o777;
    /// Physical page mask in extended mode.
    pub const PPN_EXTENDED: u16 = 0o37777;

    /// Ring of a protection word.
    pub fn ring(prot: u16) -> u8 {
        ((prot & RING) >> 9) as u8
    }
}

/// Paging control register fields.
pub mod pcr {
    /// Fields writable through TRR PCR.
    pub const MASK: u16 = 0o3603;

    /// Ring of the level.
    pub fn ring(pcr: u16) -> u8 {
        (pcr & 3) as u8
    }

    /// Normal page table number.
    pub fn page_table(pcr: u16) -> usize {
        usize::from((pcr >> 9) & 3)
    }

    /// Alternate page table number.
    pub fn alternate_table(pcr: u16) -> usize {
        usize::from((pcr >> 7) & 3)
    }

    /// Target level of a TRR PCR operand.
    pub fn level(operand: u16) -> usize {
        usize::from((operand >> 3) & 0xf)
    }
}

/// Page fault status bits.
pub mod pgs {
    /// Fault happened on an instruction fetch.
    pub const FETCH: u16 = 1 << 15;
    /// Permission or ring violation (clear for a missing page).
    pub const PERMIT: u16 = 1 << 14;
}

/// Kind of memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Fetch,
    Read,
    Write,
}

impl AccessKind {
    fn permission(self) -> u16 {
        match self {
            AccessKind::Fetch => pte::FPM,
            AccessKind::Read => pte::RPM,
            AccessKind::Write => pte::WPM,
        }
    }
}

/// Which of the level's two page tables an access uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableSelect {
    Normal,
    Alternate,
}

/// Left (high) or right (low) byte of a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteSide {
    Left,
    Right,
}

/// Per-access processor context the MMU needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuContext {
    /// Current interrupt level, selecting the PCR.
    pub level: u8,
    /// Paging enabled (PONI).
    pub paging: bool,
    /// Extended page table entries (SEXI).
    pub extended: bool,
}

/// A status register that holds its first value until read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latch {
    /// Latched status word.
    pub status: u16,
    /// Latched address.
    pub address: u32,
    /// Set while a value is waiting to be read.
    pub locked: bool,
}

impl Latch {
    /// Record a fault unless a previous one is still unread.
    pub fn record(&mut self, status: u16, address: u32) {
        if !self.locked {
            self.status = status;
            self.address = address;
            self.locked = true;
        }
    }

    /// Read the latched status, releasing the lock.
    pub fn take_status(&mut self) -> u16 {
        self.locked = false;
        self.status
    }

    /// Read the latched address, releasing the lock.
    pub fn take_address(&mut self) -> u32 {
        self.locked = false;
        self.address
    }
}

/// The memory management unit and the physical memory behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mmu {
    mem: Memory,
    /// Protection part of each entry, `PAGE_TABLES * PAGES` words.
    ptmap: Vec<u16>,
    /// Physical page number of each entry.
    pmmap: Vec<u16>,
    /// Paging control register per level.
    pcr: [u16; LEVELS],
    /// Page fault status (PGS).
    pub page_fault: Latch,
    /// Memory error status and address (PES/PEA).
    pub memory_error: Latch,
}

impl Mmu {
    /// Create an MMU in front of `mem`, with empty page tables.
    pub fn new(mem: Memory) -> Self {
        Self {
            mem,
            ptmap: vec![0; PAGE_TABLES * PAGES],
            pmmap: vec![0; PAGE_TABLES * PAGES],
            pcr: [0; LEVELS],
            page_fault: Latch::default(),
            memory_error: Latch::default(),
        }
    }

    /// Clear page tables, PCRs and latches. Memory is left alone.
    pub fn reset(&mut self) {
        self.ptmap.fill(0);
        self.pmmap.fill(0);
        self.pcr = [0; LEVELS];
        self.page_fault = Latch::default();
        self.memory_error = Latch::default();
    }

    /// Physical memory.
    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    /// Physical memory, for loaders and DMA.
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    /// PCR of a level.
    pub fn pcr(&self, level: u8) -> u16 {
        self.pcr[usize::from(level & 0xf)]
    }

    /// Load a PCR from a TRR operand (target level in bits 3-6).
    pub fn set_pcr(&mut self, operand: u16) {
        self.pcr[pcr::level(operand)] = operand & pcr::MASK;
    }

    /// Ring of a level.
    pub fn ring(&self, level: u8) -> u8 {
        pcr::ring(self.pcr(level))
    }

    /// Set a page table entry directly.
    pub fn set_entry(&mut self, table: usize, page: usize, protection: u16, ppn: u16) {
        let i = entry_index(table, page);
        self.ptmap[i] = protection & pte::PROTECTION;
        self.pmmap[i] = ppn;
    }

    /// A page table entry as (protection, physical page).
    pub fn entry(&self, table: usize, page: usize) -> (u16, u16) {
        let i = entry_index(table, page);
        (self.ptmap[i], self.pmmap[i])
    }

    /// Read a word.
    pub fn read(
        &mut self,
        ctx: MmuContext,
        vaddr: u16,
        kind: AccessKind,
        table: TableSelect,
    ) -> Result<u16, Trap> {
        if let Some(value) = self.shadow_read(ctx, vaddr) {
            return Ok(value);
        }
        let paddr = self.translate(ctx, vaddr, kind, table)?;
        self.physical_read(paddr)
    }

    /// Write a word.
    pub fn write(
        &mut self,
        ctx: MmuContext,
        vaddr: u16,
        value: u16,
        table: TableSelect,
    ) -> Result<(), Trap> {
        if self.shadow_write(ctx, vaddr, value) {
            return Ok(());
        }
        let paddr = self.translate(ctx, vaddr, AccessKind::Write, table)?;
        self.physical_write(paddr, value)
    }

    /// Read one byte of a word.
    pub fn read_byte(
        &mut self,
        ctx: MmuContext,
        vaddr: u16,
        side: ByteSide,
        table: TableSelect,
    ) -> Result<u8, Trap> {
        let word = self.read(ctx, vaddr, AccessKind::Read, table)?;
        Ok(match side {
            ByteSide::Left => (word >> 8) as u8,
            ByteSide::Right => word as u8,
        })
    }

    /// Write one byte of a word, keeping the other byte.
    pub fn write_byte(
        &mut self,
        ctx: MmuContext,
        vaddr: u16,
        side: ByteSide,
        value: u8,
        table: TableSelect,
    ) -> Result<(), Trap> {
        let word = self.read(ctx, vaddr, AccessKind::Read, table)?;
        let word = match side {
            ByteSide::Left => (word & 0x00ff) | (u16::from(value) << 8),
            ByteSide::Right => (word & 0xff00) | u16::from(value),
        };
        self.write(ctx, vaddr, word, table)
    }

    /// Physical read through the CPU path; out of range latches PES/PEA.
    pub fn physical_read(&mut self, paddr: u32) -> Result<u16, Trap> {
        self.mem.read(paddr).map_err(|e| self.out_of_range(e))
    }

    /// Physical write through the CPU path; out of range latches PES/PEA.
    pub fn physical_write(&mut self, paddr: u32, value: u16) -> Result<(), Trap> {
        self.mem.write(paddr, value).map_err(|e| self.out_of_range(e))
    }

    /// PES carries the source bit and address bits 16-23; PEA the low 16 bits.
    fn out_of_range(&mut self, err: OutOfRange) -> Trap {
        let bank = ((err.0 >> 16) & 0xff) as u16;
        self.memory_error.record(Trap::MemoryOutOfRange.mask() | bank, err.0);
        Trap::MemoryOutOfRange
    }

    /// Translate a virtual address to a physical one.
    ///
    /// With paging off the address is used as is.
    pub fn translate(
        &mut self,
        ctx: MmuContext,
        vaddr: u16,
        kind: AccessKind,
        table: TableSelect,
    ) -> Result<u32, Trap> {
        if !ctx.paging {
            return Ok(u32::from(vaddr));
        }

        let pcr = self.pcr(ctx.level);
        let table_no = match table {
            TableSelect::Normal => pcr::page_table(pcr),
            TableSelect::Alternate => pcr::alternate_table(pcr),
        };
        let page = usize::from(vaddr >> 10);
        let i = entry_index(table_no, page);
        let prot = self.ptmap[i];
        let fault_status = |permit: bool| {
            let mut status = (page as u16) | ((table_no as u16) << 6);
            if kind == AccessKind::Fetch {
                status |= pgs::FETCH;
            }
            if permit {
                status |= pgs::PERMIT;
            }
            status
        };

        if prot & (pte::WPM | pte::RPM | pte::FPM) == 0 {
            self.page_fault.record(fault_status(false), u32::from(vaddr));
            return Err(Trap::PageFault);
        }
        if prot & kind.permission() == 0 || pte::ring(prot) > pcr::ring(pcr) {
            self.page_fault.record(fault_status(true), u32::from(vaddr));
            return Err(Trap::ProtectViolation);
        }

        self.ptmap[i] |= pte::PGU;
        if kind == AccessKind::Write {
            self.ptmap[i] |= pte::WIP;
        }
        let ppn_mask = if ctx.extended { pte::PPN_EXTENDED } else { pte::PPN_NORMAL };
        let ppn = u32::from(self.pmmap[i] & ppn_mask);
        Ok(ppn * PAGE_WORDS | u32::from(vaddr & 0o1777))
    }

    /// Locate a shadow access: entry index and, in extended mode, which half.
    fn shadow_slot(&self, ctx: MmuContext, vaddr: u16) -> Option<(usize, Option<bool>)> {
        if ctx.paging && self.ring(ctx.level) != 3 {
            return None;
        }
        if ctx.extended {
            if vaddr < SHADOW_EXTENDED {
                return None;
            }
            let offset = usize::from(vaddr - SHADOW_EXTENDED);
            Some((offset >> 1, Some(offset & 1 == 1)))
        } else {
            if vaddr < SHADOW_NORMAL {
                return None;
            }
            Some((usize::from(vaddr - SHADOW_NORMAL), None))
        }
    }

    fn shadow_read(&self, ctx: MmuContext, vaddr: u16) -> Option<u16> {
        let (i, half) = self.shadow_slot(ctx, vaddr)?;
        Some(match half {
            None => self.ptmap[i] | (self.pmmap[i] & pte::PPN_NORMAL),
            Some(false) => self.ptmap[i],
            Some(true) => self.pmmap[i],
        })
    }

    fn shadow_write(&mut self, ctx: MmuContext, vaddr: u16, value: u16) -> bool {
        let Some((i, half)) = self.shadow_slot(ctx, vaddr) else {
            return false;
        };
        match half {
            None => {
                self.ptmap[i] = value & pte::PROTECTION;
                self.pmmap[i] = value & pte::PPN_NORMAL;
            }
            Some(false) => self.ptmap[i] = value & pte::PROTECTION,
            Some(true) => self.pmmap[i] = value & pte::PPN_EXTENDED,
        }
        true
    }
}

fn entry_index(table: usize, page: usize) -> usize {
    (table % PAGE_TABLES) * PAGES + (page % PAGES)
}
