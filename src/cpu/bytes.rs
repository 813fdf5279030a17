//! Byte and string instructions.
//!
//! A byte field is a word address plus a descriptor (see
//! [`crate::word::bits::field`]): the destination lives in X/T, the source in
//! A/D. Every byte moved is committed to these registers before the next one
//! is touched, so a page fault in the middle of a move leaves the registers
//! describing exactly what is left. Re-executing the instruction after the
//! fault handler returns picks up from there.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::cpu::execute::{Cpu, Fault, Flow};
use crate::cpu::interrupt::Trap;
use crate::cpu::mmu::{ByteSide, TableSelect};
use crate::cpu::registers::Reg;
use crate::word::bits::field;

/// Progress of a MOVB or MOVBF, as recorded in the source descriptor.
///
/// The state lives in D rather than in the CPU so that a trap handler, an
/// SRB/LRB pair or a snapshot carries it along with the rest of the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveState {
    /// The next execution runs the setup step.
    Fresh,
    /// Setup has run; execution continues copying.
    Resumed,
}

impl MoveState {
    /// Read the state from a source descriptor.
    pub fn of(source: u16) -> Self {
        if source & field::SETUP != 0 {
            MoveState::Resumed
        } else {
            MoveState::Fresh
        }
    }

    /// Record the state in a source descriptor.
    pub fn apply(self, source: u16) -> u16 {
        match self {
            MoveState::Fresh => source & !field::SETUP,
            MoveState::Resumed => source | field::SETUP,
        }
    }
}

/// Position of one byte: a word address and a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BytePointer {
    word: u16,
    right: bool,
}

impl BytePointer {
    fn new(word: u16, descriptor: u16) -> Self {
        Self {
            word,
            right: field::is_right(descriptor),
        }
    }

    fn side(self) -> ByteSide {
        if self.right {
            ByteSide::Right
        } else {
            ByteSide::Left
        }
    }

    /// The following byte; leaving the right side moves to the next word.
    fn advance(self) -> Self {
        if self.right {
            Self {
                word: self.word.wrapping_add(1),
                right: false,
            }
        } else {
            Self {
                word: self.word,
                right: true,
            }
        }
    }

    /// Linear byte address, for overlap checks.
    fn byte_address(self) -> u32 {
        u32::from(self.word) * 2 + u32::from(self.right)
    }

    /// `descriptor` with its side bit taken from this pointer.
    fn descriptor(self, descriptor: u16) -> u16 {
        if self.right {
            descriptor | field::RIGHT
        } else {
            descriptor & !field::RIGHT
        }
    }
}

impl Cpu {
    /// The MOVB/MOVBF state held in D.
    pub fn move_state(&self) -> MoveState {
        MoveState::of(self.regs.d())
    }

    fn read_byte_at(&mut self, ptr: BytePointer) -> Result<u8, Trap> {
        let ctx = self.ctx();
        self.mmu.read_byte(ctx, ptr.word, ptr.side(), TableSelect::Normal)
    }

    fn write_byte_at(&mut self, ptr: BytePointer, value: u8) -> Result<(), Trap> {
        let ctx = self.ctx();
        self.mmu.write_byte(ctx, ptr.word, ptr.side(), value, TableSelect::Normal)
    }

    fn destination(&self) -> BytePointer {
        BytePointer::new(self.regs.x(), self.regs.t())
    }

    fn source_field(&self) -> BytePointer {
        BytePointer::new(self.regs.a(), self.regs.d())
    }

    fn commit_destination(&mut self, ptr: BytePointer, length: u16) {
        let t = field::with_length(self.regs.t(), length);
        self.regs.set(Reg::X, ptr.word);
        self.regs.set(Reg::T, ptr.descriptor(t));
    }

    fn commit_source(&mut self, ptr: BytePointer, length: u16) {
        let d = field::with_length(self.regs.d(), length);
        self.regs.set(Reg::A, ptr.word);
        self.regs.set(Reg::D, ptr.descriptor(d));
    }

    /// BFILL: store the low byte of A into every byte of the X/T field.
    pub(crate) fn bfill(&mut self) -> Result<Flow, Fault> {
        let byte = self.regs.a() as u8;
        loop {
            let remaining = field::length(self.regs.t());
            if remaining == 0 {
                break;
            }
            let dst = self.destination();
            self.write_byte_at(dst, byte)?;
            self.commit_destination(dst.advance(), remaining - 1);
        }
        Ok(Flow::Skip)
    }

    /// MOVB: copy the A/D field to the X/T field.
    ///
    /// Setup clamps the destination length to the shorter field and zeroes
    /// the source length, which then counts bytes moved.
    pub(crate) fn movb(&mut self) -> Result<Flow, Fault> {
        if self.move_state() == MoveState::Fresh {
            let (d, t) = (self.regs.d(), self.regs.t());
            let n = field::length(d).min(field::length(t));
            self.regs.set(Reg::T, field::with_length(t, n));
            self.regs.set(Reg::D, MoveState::Resumed.apply(field::with_length(d, 0)));
        }

        loop {
            let remaining = field::length(self.regs.t());
            if remaining == 0 {
                break;
            }
            let (src, dst) = (self.source_field(), self.destination());
            let byte = self.read_byte_at(src)?;
            self.write_byte_at(dst, byte)?;
            let moved = field::length(self.regs.d()) + 1;
            self.commit_destination(dst.advance(), remaining - 1);
            self.commit_source(src.advance(), moved);
        }

        self.regs.set(Reg::D, MoveState::Fresh.apply(self.regs.d()));
        Ok(Flow::Skip)
    }

    /// MOVBF: copy forward, refusing a destination that starts inside the
    /// part of the source still to be read.
    ///
    /// Both lengths count down as bytes move. A refused move does not skip.
    pub(crate) fn movbf(&mut self) -> Result<Flow, Fault> {
        if self.move_state() == MoveState::Fresh {
            let src = self.source_field().byte_address();
            let dst = self.destination().byte_address();
            let end = src + u32::from(field::length(self.regs.d()));
            if src < dst && dst < end {
                debug!("MOVBF refused: destination {:o} inside source {:o}..{:o}", dst, src, end);
                return Ok(Flow::Next);
            }
            self.regs.set(Reg::D, MoveState::Resumed.apply(self.regs.d()));
        }

        loop {
            let src_len = field::length(self.regs.d());
            let dst_len = field::length(self.regs.t());
            if src_len == 0 || dst_len == 0 {
                break;
            }
            let (src, dst) = (self.source_field(), self.destination());
            let byte = self.read_byte_at(src)?;
            self.write_byte_at(dst, byte)?;
            self.commit_destination(dst.advance(), dst_len - 1);
            self.commit_source(src.advance(), src_len - 1);
        }

        self.regs.set(Reg::D, MoveState::Fresh.apply(self.regs.d()));
        Ok(Flow::Skip)
    }

    /// Byte addressed by T (word) and X (byte offset).
    fn indexed_byte(&self) -> BytePointer {
        let x = self.regs.x();
        BytePointer {
            word: self.regs.t().wrapping_add(x >> 1),
            right: x & 1 == 1,
        }
    }

    /// LBYT: A := byte.
    pub(crate) fn lbyt(&mut self) -> Result<Flow, Fault> {
        let byte = self.read_byte_at(self.indexed_byte())?;
        self.regs.set(Reg::A, u16::from(byte));
        Ok(Flow::Next)
    }

    /// SBYT: byte := low byte of A.
    pub(crate) fn sbyt(&mut self) -> Result<Flow, Fault> {
        let byte = self.regs.a() as u8;
        self.write_byte_at(self.indexed_byte(), byte)?;
        Ok(Flow::Next)
    }
}
