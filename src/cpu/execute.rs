//! CPU execution engine for the ND-100.
//!
//! Implements the fetch loop, the interrupt check that runs once per
//! iteration, and the behavior of every instruction group.
//!
//! Handlers return `Result<Flow, Fault>`. A [`Flow`] says how P moves on;
//! a [`Fault`] is either an internal trap, which is posted to the interrupt
//! controller and never leaves the CPU, or a [`StopReason`] for the host.

use std::collections::BTreeSet;
use std::sync::mpsc::{channel, Receiver, Sender};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::cpu::decode::{
    decode, AddrMode, ArgTarget, BopFunc, Control, InternalOp, Instruction, JumpCond, MemOp,
    RopFunc, ShiftTarget, SkipCond,
};
use crate::cpu::interrupt::{
    DeviceHandle, InterruptError, InterruptLine, Interrupts, IoBus, IoError, NoDevices, Trap,
    INTERNAL_LEVEL,
};
use crate::cpu::memory::{Memory, MemoryError};
use crate::cpu::mmu::{AccessKind, Mmu, MmuContext, TableSelect};
use crate::cpu::registers::{sts, Reg, Registers};
use crate::word::bits::{bit, with_bit};
use crate::word::{add3, mpy, sext8, shift, AddResult, Float48, FloatError, ShiftKind};

/// Reasons the fetch loop hands control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StopReason {
    #[error("unhandled instruction {0:#08o}")]
    UnhandledInstruction(u16),

    #[error("no device at IO address {device:#o}")]
    UnhandledIo { device: u16 },

    #[error("checksum mismatch: expected {expected:#08o}, computed {actual:#08o}")]
    Checksum { expected: u16, actual: u16 },

    #[error("breakpoint at {0:#08o}")]
    Breakpoint(u16),

    #[error("WAIT with interrupts off")]
    WaitWithInterruptsOff,

    #[error("WAIT on level 0, idle until an interrupt arrives")]
    Idle,
}

/// Result of one fetch-loop iteration that did not stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction ran to completion.
    Executed(Instruction),
    /// The instruction raised an internal trap.
    Trapped(Trap),
}

/// Errors from loading a checked block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Stop(#[from] StopReason),
}

/// How P moves after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// P + 1.
    Next,
    /// P + 2.
    Skip,
    /// P := address.
    Jump(u16),
    /// P was already handled.
    Stay,
}

/// Why an instruction did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Trap(Trap),
    Stop(StopReason),
}

impl From<Trap> for Fault {
    fn from(trap: Trap) -> Self {
        Fault::Trap(trap)
    }
}

impl From<StopReason> for Fault {
    fn from(reason: StopReason) -> Self {
        Fault::Stop(reason)
    }
}

/// Internal register numbers of TRA and TRR.
mod ireg {
    pub const PANS: u8 = 0o0;
    pub const STS: u8 = 0o1;
    pub const OPR: u8 = 0o2;
    pub const LMP: u8 = 0o2;
    pub const PGS: u8 = 0o3;
    pub const PCR: u8 = 0o3;
    pub const PVL: u8 = 0o4;
    pub const IIC: u8 = 0o5;
    pub const IIE: u8 = 0o5;
    pub const PID: u8 = 0o6;
    pub const PIE: u8 = 0o7;
    pub const CSR: u8 = 0o10;
    pub const ACTL: u8 = 0o11;
    pub const ALD: u8 = 0o12;
    pub const PES: u8 = 0o13;
    pub const PGC: u8 = 0o14;
    pub const PEA: u8 = 0o15;
}

/// IIE bits that exist in hardware.
const IIE_MASK: u16 = 0o3776;

/// `IRR 0 DP`; TRA PVL returns it with the previous level filled in.
const IRR_DP: u16 = 0o153602;

/// Machine state the host can save and restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub regs: Registers,
    pub mmu: Mmu,
    pub intr: Interrupts,
    pub opr: u16,
    pub lamps: u16,
    pub cycles: u64,
}

/// The ND-100 CPU.
pub struct Cpu {
    /// Registers and level banks.
    pub regs: Registers,
    /// Memory management and physical memory.
    pub mmu: Mmu,
    /// Interrupt and trap controller.
    pub intr: Interrupts,
    /// Operator panel switch register (TRA OPR).
    pub opr: u16,
    /// Panel lamps (TRR LMP).
    pub lamps: u16,
    /// Instruction count.
    pub cycles: u64,
    io: Box<dyn IoBus>,
    breakpoints: BTreeSet<u16>,
    /// Breakpoint reported by the previous step, passed on the next one.
    resume_at: Option<u16>,
    last_instr: Option<Instruction>,
    nd100: bool,
    start_address: u16,
    line_tx: Sender<(u8, DeviceHandle)>,
    line_rx: Receiver<(u8, DeviceHandle)>,
}

impl Cpu {
    /// Create a CPU with the default configuration.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// Create a CPU with the given memory size and start address.
    pub fn with_config(config: &Config) -> Self {
        let (line_tx, line_rx) = channel();
        let mut cpu = Self {
            regs: Registers::new(),
            mmu: Mmu::new(Memory::with_size(config.memory_words)),
            intr: Interrupts::new(),
            opr: 0,
            lamps: 0,
            cycles: 0,
            io: Box::new(NoDevices),
            breakpoints: BTreeSet::new(),
            resume_at: None,
            last_instr: None,
            nd100: config.nd100,
            start_address: config.start_address,
            line_tx,
            line_rx,
        };
        cpu.reset_registers();
        cpu
    }

    fn reset_registers(&mut self) {
        self.regs.reset();
        self.regs.set_flag(sts::N100, self.nd100);
        self.regs.jump(self.start_address);
    }

    /// Reset the processor. Memory contents, devices and breakpoints are kept.
    pub fn reset(&mut self) {
        self.reset_registers();
        self.mmu.reset();
        self.intr.reset();
        self.cycles = 0;
        self.resume_at = None;
        self.last_instr = None;
        while self.line_rx.try_recv().is_ok() {}
    }

    /// Load words into physical memory.
    pub fn load_program(&mut self, start: u32, program: &[u16]) -> Result<(), MemoryError> {
        self.mmu.memory_mut().load_program(start, program)
    }

    /// Load words after checking their 16-bit additive checksum.
    pub fn load_block(
        &mut self,
        start: u32,
        words: &[u16],
        checksum: u16,
    ) -> Result<(), LoadError> {
        let actual = words.iter().fold(0u16, |sum, w| sum.wrapping_add(*w));
        if actual != checksum {
            let reason = StopReason::Checksum {
                expected: checksum,
                actual,
            };
            warn!("{}", reason);
            return Err(reason.into());
        }
        Ok(self.load_program(start, words)?)
    }

    /// Attach the host IO bus.
    pub fn attach_io(&mut self, io: impl IoBus + 'static) {
        self.io = Box::new(io);
    }

    /// Register a device that interrupts on `level` (10-13).
    pub fn register_device(
        &mut self,
        level: u8,
        ident: u16,
    ) -> Result<DeviceHandle, InterruptError> {
        self.intr.register_device(level, ident)
    }

    /// Post a device interrupt from the host's own thread.
    pub fn post_external(&mut self, level: u8, device: DeviceHandle) -> Result<(), InterruptError> {
        self.intr.post_external(level, device)
    }

    /// Post an internal interrupt.
    pub fn post_internal(&mut self, trap: Trap) {
        self.intr.post_internal(trap);
    }

    /// A line a device model on another thread uses to interrupt.
    pub fn interrupt_line(
        &self,
        level: u8,
        device: DeviceHandle,
    ) -> Result<InterruptLine, InterruptError> {
        match self.intr.device_level(device) {
            None => Err(InterruptError::UnknownDevice),
            Some(registered) if registered != level => Err(InterruptError::LevelMismatch {
                registered,
                posted: level,
            }),
            Some(_) => Ok(InterruptLine {
                level,
                device,
                tx: self.line_tx.clone(),
            }),
        }
    }

    pub fn add_breakpoint(&mut self, addr: u16) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u16) -> bool {
        self.breakpoints.remove(&addr)
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Capture the machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            regs: self.regs.clone(),
            mmu: self.mmu.clone(),
            intr: self.intr.clone(),
            opr: self.opr,
            lamps: self.lamps,
            cycles: self.cycles,
        }
    }

    /// Restore a captured machine state.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.regs = snapshot.regs;
        self.mmu = snapshot.mmu;
        self.intr = snapshot.intr;
        self.opr = snapshot.opr;
        self.lamps = snapshot.lamps;
        self.cycles = snapshot.cycles;
        self.resume_at = None;
        self.last_instr = None;
    }

    /// Switch to the highest requesting level if it is above the current one.
    ///
    /// Only WAIT gives a level up.
    pub fn check_interrupts(&mut self) {
        if !self.regs.interrupts_enabled() {
            return;
        }
        let target = self.intr.highest_level();
        if target > self.regs.level() {
            self.switch_to(target);
        }
    }

    fn switch_to(&mut self, level: u8) {
        let t_patch = (level == INTERNAL_LEVEL && self.intr.monitor_call_pending())
            .then(|| self.intr.monitor_call());
        debug!("level {} -> {}", self.regs.level(), level);
        self.regs.switch_level(level, t_patch);
    }

    fn drain_interrupt_lines(&mut self) {
        while let Ok((level, device)) = self.line_rx.try_recv() {
            if let Err(e) = self.intr.post_external(level, device) {
                warn!("dropped device interrupt: {}", e);
            }
        }
    }

    /// Run one fetch-loop iteration.
    pub fn step(&mut self) -> Result<StepOutcome, StopReason> {
        self.drain_interrupt_lines();
        self.check_interrupts();

        let p = self.regs.p();
        if self.breakpoints.contains(&p) && self.resume_at != Some(p) {
            self.resume_at = Some(p);
            info!("breakpoint at {:06o}", p);
            return Err(StopReason::Breakpoint(p));
        }
        self.resume_at = None;

        let ctx = self.ctx();
        let word = match self.mmu.read(ctx, p, AccessKind::Fetch, TableSelect::Normal) {
            Ok(word) => word,
            Err(trap) => return Ok(self.trapped(trap)),
        };
        let instr = decode(word);
        trace!("{:02} {:06o}: {:06o} {:?}", self.regs.level(), p, word, instr);

        let result = self.execute(instr);
        self.cycles += 1;
        self.last_instr = Some(instr);

        match result {
            Ok(flow) => {
                match flow {
                    Flow::Next => self.regs.advance_pc(1),
                    Flow::Skip => self.regs.advance_pc(2),
                    Flow::Jump(addr) => self.regs.jump(addr),
                    Flow::Stay => {}
                }
                Ok(StepOutcome::Executed(instr))
            }
            Err(Fault::Trap(trap)) => {
                if !trap.aborts() {
                    self.regs.advance_pc(1);
                }
                Ok(self.trapped(trap))
            }
            Err(Fault::Stop(reason)) => {
                if reason != StopReason::Idle {
                    warn!("stopped at {:06o}: {}", p, reason);
                }
                Err(reason)
            }
        }
    }

    fn trapped(&mut self, trap: Trap) -> StepOutcome {
        self.intr.post_internal(trap);
        StepOutcome::Trapped(trap)
    }

    /// Run until the host is needed.
    pub fn run(&mut self) -> StopReason {
        loop {
            if let Err(reason) = self.step() {
                return reason;
            }
        }
    }

    /// Run for at most `max_steps` iterations.
    ///
    /// Returns the number of iterations run when the budget is used up.
    pub fn run_limited(&mut self, max_steps: u64) -> Result<u64, StopReason> {
        for done in 0..max_steps {
            if let Err(reason) = self.step() {
                debug!("stopped after {} steps", done);
                return Err(reason);
            }
        }
        Ok(max_steps)
    }

    /// Last executed instruction.
    pub fn last_instruction(&self) -> Option<Instruction> {
        self.last_instr
    }

    pub(crate) fn ctx(&self) -> MmuContext {
        MmuContext {
            level: self.regs.level(),
            paging: self.regs.paging_enabled(),
            extended: self.regs.extended(),
        }
    }

    pub(crate) fn load(&mut self, addr: u16, table: TableSelect) -> Result<u16, Trap> {
        let ctx = self.ctx();
        self.mmu.read(ctx, addr, AccessKind::Read, table)
    }

    pub(crate) fn store(&mut self, addr: u16, value: u16, table: TableSelect) -> Result<(), Trap> {
        let ctx = self.ctx();
        self.mmu.write(ctx, addr, value, table)
    }

    /// Register operand; field 0 reads as zero.
    fn source(&self, reg: Reg) -> u16 {
        self.regs.operand(reg.index() as u16)
    }

    fn set_add_flags(&mut self, r: AddResult) {
        self.regs.set_flag(sts::C, r.carry);
        self.regs.set_flag(sts::Q, r.overflow);
        if r.overflow {
            self.regs.set_flag(sts::O, true);
        }
    }

    fn error_indicator(&mut self) -> Fault {
        self.regs.set_flag(sts::Z, true);
        Trap::ErrorIndicator.into()
    }

    /// Execute a decoded instruction.
    pub(crate) fn execute(&mut self, instr: Instruction) -> Result<Flow, Fault> {
        if instr.is_privileged()
            && self.regs.paging_enabled()
            && self.mmu.ring(self.regs.level()) < 2
        {
            return Err(Trap::PrivilegedInstruction.into());
        }

        match instr {
            Instruction::Memory { op, mode, disp } => self.memory_reference(op, mode, disp),
            Instruction::CondJump { cond, disp } => Ok(self.cond_jump(cond, disp)),
            Instruction::Skip { cond, dr, sr } => Ok(self.skip(cond, dr, sr)),
            Instruction::Exr { sr } => {
                let target = decode(self.source(sr));
                if matches!(target, Instruction::Exr { .. }) {
                    return Err(Trap::IllegalInstruction.into());
                }
                self.execute(target)
            }
            Instruction::Bfill => self.bfill(),
            Instruction::Movb => self.movb(),
            Instruction::Movbf => self.movbf(),
            Instruction::Lbyt => self.lbyt(),
            Instruction::Sbyt => self.sbyt(),
            Instruction::Mix3 => {
                let x = self.regs.a().wrapping_sub(1).wrapping_mul(3);
                self.regs.set(Reg::X, x);
                Ok(Flow::Next)
            }
            Instruction::Rmpy { dr, sr } => {
                let product = i32::from(self.source(dr) as i16) * i32::from(self.source(sr) as i16);
                self.regs.set_ad(product as u32);
                Ok(Flow::Next)
            }
            Instruction::Rdiv { sr } => self.rdiv(sr),
            Instruction::Ident { level } => match self.intr.ident(level) {
                Some(ident) => {
                    self.regs.set(Reg::A, ident);
                    Ok(Flow::Next)
                }
                None => Err(Trap::IoxError.into()),
            },
            Instruction::Rop {
                func,
                cm1,
                cld,
                dr,
                sr,
            } => Ok(self.rop(func, cm1, cld, dr, sr)),
            Instruction::Internal { op, reg } => Ok(self.transfer(op, reg)),
            Instruction::Control(control) => Ok(self.control(control)),
            Instruction::Ioxt => self.iox(self.regs.t()),
            Instruction::Exam => {
                let value = self.mmu.physical_read(self.regs.ad())?;
                self.regs.set(Reg::T, value);
                Ok(Flow::Next)
            }
            Instruction::Depo => {
                self.mmu.physical_write(self.regs.ad(), self.regs.t())?;
                Ok(Flow::Next)
            }
            Instruction::Wait { .. } => self.wait(),
            Instruction::Nlz { scale } => match Float48::from_fixed(self.regs.a(), scale) {
                Ok(value) => {
                    self.set_float(value);
                    Ok(Flow::Next)
                }
                Err(_) => Err(self.error_indicator()),
            },
            Instruction::Dnz { scale } => {
                match Float48::unpack(self.regs.t(), self.regs.a(), self.regs.d()).to_fixed(scale) {
                    Ok(value) => {
                        self.regs.set(Reg::A, value);
                        self.regs.set(Reg::T, 0);
                        self.regs.set(Reg::D, 0);
                        Ok(Flow::Next)
                    }
                    Err(_) => Err(self.error_indicator()),
                }
            }
            Instruction::Srb { level } => {
                let block = self.regs.store_block(level);
                let x = self.regs.x();
                for (offset, word) in (0u16..).zip(block) {
                    self.store(x.wrapping_add(offset), word, TableSelect::Normal)?;
                }
                Ok(Flow::Next)
            }
            Instruction::Lrb { level } => {
                let x = self.regs.x();
                let mut block = [0; 8];
                for (offset, slot) in (0u16..).zip(block.iter_mut()) {
                    *slot = self.load(x.wrapping_add(offset), TableSelect::Normal)?;
                }
                self.regs.load_block(level, block);
                Ok(Flow::Next)
            }
            Instruction::Mon { number } => {
                self.intr.post_monitor_call(sext8(u16::from(number)));
                Ok(Flow::Next)
            }
            Instruction::Irw { level, reg } => {
                self.regs.write_banked(level, reg, self.regs.a());
                Ok(Flow::Next)
            }
            Instruction::Irr { level, reg } => {
                let value = self.regs.read_banked(level, reg);
                self.regs.set(Reg::A, value);
                Ok(Flow::Next)
            }
            Instruction::Shift {
                target,
                kind,
                count,
            } => Ok(self.shift(target, kind, count)),
            Instruction::Iox { device } => self.iox(device),
            Instruction::Arg { target, add, value } => Ok(self.arg(target, add, value)),
            Instruction::Bop { func, bit, dr } => Ok(self.bop(func, bit, dr)),
            Instruction::Unsupported(word) => Err(StopReason::UnhandledInstruction(word).into()),
            Instruction::Illegal(word) => {
                debug!("illegal instruction {:06o}", word);
                Err(Trap::IllegalInstruction.into())
            }
        }
    }

    /// Effective address of a memory reference instruction.
    fn effective_address(
        &mut self,
        mode: AddrMode,
        disp: i8,
        table: TableSelect,
    ) -> Result<u16, Trap> {
        let origin = if mode.base {
            self.regs.b()
        } else if mode.indexed && !mode.indirect {
            0
        } else {
            self.regs.p()
        };
        let mut ea = origin.wrapping_add(disp as i16 as u16);
        if mode.indirect {
            ea = self.load(ea, table)?;
        }
        if mode.indexed {
            ea = ea.wrapping_add(self.regs.x());
        }
        Ok(ea)
    }

    fn memory_reference(&mut self, op: MemOp, mode: AddrMode, disp: i8) -> Result<Flow, Fault> {
        let table = if mode.base {
            TableSelect::Alternate
        } else {
            TableSelect::Normal
        };
        let ea = self.effective_address(mode, disp, table)?;
        let next = ea.wrapping_add(1);

        match op {
            MemOp::Jmp => return Ok(Flow::Jump(ea)),
            MemOp::Jpl => {
                self.regs.set(Reg::L, self.regs.p().wrapping_add(1));
                return Ok(Flow::Jump(ea));
            }
            MemOp::Stz => self.store(ea, 0, table)?,
            MemOp::Sta => self.store(ea, self.regs.a(), table)?,
            MemOp::Stt => self.store(ea, self.regs.t(), table)?,
            MemOp::Stx => self.store(ea, self.regs.x(), table)?,
            MemOp::Std => {
                self.store(ea, self.regs.a(), table)?;
                self.store(next, self.regs.d(), table)?;
            }
            MemOp::Ldd => {
                let a = self.load(ea, table)?;
                let d = self.load(next, table)?;
                self.regs.set(Reg::A, a);
                self.regs.set(Reg::D, d);
            }
            MemOp::Stf => {
                let [t, a, d] = [self.regs.t(), self.regs.a(), self.regs.d()];
                self.store(ea, t, table)?;
                self.store(next, a, table)?;
                self.store(next.wrapping_add(1), d, table)?;
            }
            MemOp::Ldf => {
                let value = self.load_float(ea, table)?;
                self.set_float(value);
            }
            MemOp::Min => {
                let value = self.load(ea, table)?.wrapping_add(1);
                self.store(ea, value, table)?;
                if value == 0 {
                    return Ok(Flow::Skip);
                }
            }
            MemOp::Lda => {
                let value = self.load(ea, table)?;
                self.regs.set(Reg::A, value);
            }
            MemOp::Ldt => {
                let value = self.load(ea, table)?;
                self.regs.set(Reg::T, value);
            }
            MemOp::Ldx => {
                let value = self.load(ea, table)?;
                self.regs.set(Reg::X, value);
            }
            MemOp::Add | MemOp::Sub => {
                let operand = self.load(ea, table)?;
                let r = if op == MemOp::Add {
                    add3(self.regs.a(), operand, 0)
                } else {
                    add3(self.regs.a(), !operand, 1)
                };
                self.regs.set(Reg::A, r.sum);
                self.set_add_flags(r);
            }
            MemOp::And => {
                let operand = self.load(ea, table)?;
                self.regs.set(Reg::A, self.regs.a() & operand);
            }
            MemOp::Ora => {
                let operand = self.load(ea, table)?;
                self.regs.set(Reg::A, self.regs.a() | operand);
            }
            MemOp::Fad | MemOp::Fsb | MemOp::Fmu | MemOp::Fdv => {
                return self.float_arith(op, ea, table);
            }
            MemOp::Mpy => {
                let operand = self.load(ea, table)?;
                let (product, overflow) = mpy(self.regs.a(), operand);
                self.regs.set(Reg::A, product);
                self.regs.set_flag(sts::Q, overflow);
                if overflow {
                    self.regs.set_flag(sts::O, true);
                }
            }
        }
        Ok(Flow::Next)
    }

    fn load_float(&mut self, ea: u16, table: TableSelect) -> Result<Float48, Trap> {
        let t = self.load(ea, table)?;
        let a = self.load(ea.wrapping_add(1), table)?;
        let d = self.load(ea.wrapping_add(2), table)?;
        Ok(Float48::unpack(t, a, d))
    }

    fn set_float(&mut self, value: Float48) {
        let [t, a, d] = value.pack();
        self.regs.set(Reg::T, t);
        self.regs.set(Reg::A, a);
        self.regs.set(Reg::D, d);
    }

    fn float_arith(&mut self, op: MemOp, ea: u16, table: TableSelect) -> Result<Flow, Fault> {
        let y = self.load_float(ea, table)?;
        let x = Float48::unpack(self.regs.t(), self.regs.a(), self.regs.d());
        let (result, negative): (Result<Float48, FloatError>, bool) = match op {
            MemOp::Fad => (x.add(y), x.negative),
            MemOp::Fsb => (x.sub(y), x.negative),
            MemOp::Fmu => (x.mul(y), x.negative != y.negative),
            _ => (x.div(y), x.negative != y.negative),
        };
        match result {
            Ok(value) => {
                self.set_float(value);
                Ok(Flow::Next)
            }
            Err(e) => {
                debug!("{:?} at {:06o}: {}", op, self.regs.p(), e);
                self.set_float(Float48::saturated(negative));
                Err(self.error_indicator())
            }
        }
    }

    fn cond_jump(&mut self, cond: JumpCond, disp: i8) -> Flow {
        let a = self.regs.a() as i16;
        let taken = match cond {
            JumpCond::Jap => a >= 0,
            JumpCond::Jan => a < 0,
            JumpCond::Jaz => a == 0,
            JumpCond::Jaf => a != 0,
            JumpCond::Jpc | JumpCond::Jnc => {
                let x = self.regs.x().wrapping_add(1);
                self.regs.set(Reg::X, x);
                (x as i16 >= 0) == (cond == JumpCond::Jpc)
            }
            JumpCond::Jxz => self.regs.x() == 0,
            JumpCond::Jxn => (self.regs.x() as i16) < 0,
        };
        if taken {
            Flow::Jump(self.regs.p().wrapping_add(disp as i16 as u16))
        } else {
            Flow::Next
        }
    }

    fn skip(&mut self, cond: SkipCond, dr: Reg, sr: Reg) -> Flow {
        let d = self.source(dr);
        let s = self.source(sr);
        let difference = add3(d, !s, 1).sum as i16;
        let taken = match cond {
            SkipCond::Eql => d == s,
            SkipCond::Ueq => d != s,
            SkipCond::Geq => difference >= 0,
            SkipCond::Lss => difference < 0,
            SkipCond::Gre => d as i16 >= s as i16,
            SkipCond::Lst => (d as i16) < s as i16,
            SkipCond::Mgre => d >= s,
            SkipCond::Mlst => d < s,
        };
        if taken {
            Flow::Skip
        } else {
            Flow::Next
        }
    }

    fn rdiv(&mut self, sr: Reg) -> Result<Flow, Fault> {
        let divisor = i32::from(self.source(sr) as i16);
        let dividend = self.regs.ad() as i32;
        let quotient = dividend
            .checked_div(divisor)
            .filter(|q| i16::try_from(*q).is_ok());
        match (quotient, dividend.checked_rem(divisor)) {
            (Some(q), Some(r)) => {
                self.regs.set(Reg::A, q as u16);
                self.regs.set(Reg::D, r as u16);
                Ok(Flow::Next)
            }
            _ => Err(self.error_indicator()),
        }
    }

    fn rop(&mut self, func: RopFunc, cm1: bool, cld: bool, dr: Reg, sr: Reg) -> Flow {
        let mut s = self.source(sr);
        if cm1 {
            s = !s;
        }
        let d = if cld { 0 } else { self.source(dr) };

        let mut wrote_p = dr == Reg::P;
        let result = match func {
            RopFunc::Swap => {
                if sr != Reg::Sts {
                    self.regs.set(sr, d);
                    wrote_p |= sr == Reg::P;
                }
                s
            }
            RopFunc::And => d & s,
            RopFunc::Exor => d ^ s,
            RopFunc::Or => d | s,
            RopFunc::Add { ad1, adc } => {
                let mut r = add3(d, s, u16::from(ad1));
                if adc && self.regs.flag(sts::C) {
                    let again = add3(r.sum, 0, 1);
                    r = AddResult {
                        sum: again.sum,
                        carry: r.carry || again.carry,
                        overflow: r.overflow || again.overflow,
                    };
                }
                self.regs.set(dr, r.sum);
                self.set_add_flags(r);
                return if wrote_p { Flow::Jump(r.sum) } else { Flow::Next };
            }
        };
        self.regs.set(dr, result);
        if wrote_p {
            Flow::Jump(self.regs.p())
        } else {
            Flow::Next
        }
    }

    fn transfer(&mut self, op: InternalOp, reg: u8) -> Flow {
        let a = self.regs.a();
        match op {
            InternalOp::Tra => {
                let value = self.read_internal(reg);
                self.regs.set(Reg::A, value);
            }
            InternalOp::Trr => self.write_internal(reg, a),
            InternalOp::Mcl => self.modify_internal(reg, |v| v & !a),
            InternalOp::Mst => self.modify_internal(reg, |v| v | a),
        }
        Flow::Next
    }

    fn read_internal(&mut self, reg: u8) -> u16 {
        let level = self.regs.level();
        match reg {
            ireg::PANS | ireg::CSR | ireg::ALD => 0,
            ireg::STS => self.regs.status(),
            ireg::OPR => self.opr,
            ireg::PGS => self.mmu.page_fault.take_status(),
            ireg::PVL => IRR_DP | (u16::from(self.regs.prev_level()) << 3),
            ireg::IIC => self.intr.take_iic(),
            ireg::PID => self.intr.pid,
            ireg::PIE => self.intr.pie,
            ireg::ACTL => 1 << level,
            ireg::PES => self.mmu.memory_error.take_status(),
            ireg::PGC => self.mmu.pcr(level),
            ireg::PEA => self.mmu.memory_error.take_address() as u16,
            _ => 0,
        }
    }

    fn write_internal(&mut self, reg: u8, value: u16) {
        match reg {
            ireg::STS => self.regs.set(Reg::Sts, value),
            ireg::LMP => self.lamps = value,
            ireg::PCR => self.mmu.set_pcr(value),
            ireg::IIE => self.intr.iie = value & IIE_MASK,
            ireg::PID => self.intr.pid = value,
            ireg::PIE => self.intr.pie = value,
            _ => {}
        }
    }

    fn modify_internal(&mut self, reg: u8, f: impl Fn(u16) -> u16) {
        match reg {
            ireg::STS => {
                let value = f(self.regs.status() & sts::LOW);
                self.regs.set(Reg::Sts, value);
            }
            ireg::PID => self.intr.pid = f(self.intr.pid),
            ireg::PIE => self.intr.pie = f(self.intr.pie),
            _ => {}
        }
    }

    fn control(&mut self, control: Control) -> Flow {
        let (bits, on) = match control {
            Control::Ion => (sts::IONI, true),
            Control::Iof => (sts::IONI, false),
            Control::Pon => (sts::PONI, true),
            Control::Pof => (sts::PONI, false),
            Control::Pion => (sts::PONI | sts::IONI, true),
            Control::Piof => (sts::PONI | sts::IONI, false),
            Control::Sex => (sts::SEXI, true),
            Control::Rex => (sts::SEXI, false),
        };
        self.regs.set_flag(bits, on);
        debug!("{:?}: status {:06o}", control, self.regs.status());
        Flow::Next
    }

    fn iox(&mut self, device: u16) -> Result<Flow, Fault> {
        match self.io.iox(device, self.regs.a()) {
            Ok(Some(value)) => {
                self.regs.set(Reg::A, value);
                Ok(Flow::Next)
            }
            Ok(None) => Ok(Flow::Next),
            Err(IoError::NoResponse(_)) => Err(Trap::IoxError.into()),
            Err(IoError::Unhandled(device)) => Err(StopReason::UnhandledIo { device }.into()),
        }
    }

    fn wait(&mut self) -> Result<Flow, Fault> {
        if !self.regs.interrupts_enabled() {
            return Err(StopReason::WaitWithInterruptsOff.into());
        }
        let level = self.regs.level();
        if level == 0 {
            info!("idle on level 0 at {:06o}", self.regs.p());
            return Err(StopReason::Idle.into());
        }
        self.intr.pid &= !(1 << level);
        self.regs.advance_pc(1);
        let target = self.intr.highest_level();
        self.switch_to(target);
        Ok(Flow::Stay)
    }

    fn shift(&mut self, target: ShiftTarget, kind: ShiftKind, count: i8) -> Flow {
        let link = self.regs.flag(sts::M);
        let (value, width) = match target {
            ShiftTarget::T => (u32::from(self.regs.t()), 16),
            ShiftTarget::D => (u32::from(self.regs.d()), 16),
            ShiftTarget::A => (u32::from(self.regs.a()), 16),
            ShiftTarget::Ad => (self.regs.ad(), 32),
        };
        let (result, last) = shift(value, width, kind, count, link);
        match target {
            ShiftTarget::T => self.regs.set(Reg::T, result as u16),
            ShiftTarget::D => self.regs.set(Reg::D, result as u16),
            ShiftTarget::A => self.regs.set(Reg::A, result as u16),
            ShiftTarget::Ad => self.regs.set_ad(result),
        }
        if let Some(out) = last {
            self.regs.set_flag(sts::M, out);
        }
        Flow::Next
    }

    fn arg(&mut self, target: ArgTarget, add: bool, value: i8) -> Flow {
        let reg = target.reg();
        let value = value as i16 as u16;
        if add {
            let r = add3(self.regs.get(reg), value, 0);
            self.regs.set(reg, r.sum);
            self.set_add_flags(r);
        } else {
            self.regs.set(reg, value);
        }
        Flow::Next
    }

    fn bop(&mut self, func: BopFunc, n: u8, dr: Reg) -> Flow {
        let n = u32::from(n);
        let word = self.regs.get(dr);
        let b = bit(word, n);
        let k = self.regs.flag(sts::K);

        let mut new_bit = None;
        let mut new_k = None;
        let mut flow = Flow::Next;
        match func {
            BopFunc::SetZero => new_bit = Some(false),
            BopFunc::SetOne => new_bit = Some(true),
            BopFunc::SetComplement => new_bit = Some(!b),
            BopFunc::SetFromK => new_bit = Some(k),
            BopFunc::SkipZero
            | BopFunc::SkipOne
            | BopFunc::SkipComplementK
            | BopFunc::SkipEqualK => {
                let taken = match func {
                    BopFunc::SkipZero => !b,
                    BopFunc::SkipOne => b,
                    BopFunc::SkipComplementK => b != k,
                    _ => b == k,
                };
                if taken {
                    flow = Flow::Skip;
                }
            }
            BopFunc::StoreComplementK => {
                new_bit = Some(!k);
                new_k = Some(true);
            }
            BopFunc::StoreK => {
                new_bit = Some(k);
                new_k = Some(false);
            }
            BopFunc::LoadComplement => new_k = Some(!b),
            BopFunc::LoadK => new_k = Some(b),
            BopFunc::AndComplement => new_k = Some(k && !b),
            BopFunc::And => new_k = Some(k && b),
            BopFunc::OrComplement => new_k = Some(k || !b),
            BopFunc::Or => new_k = Some(k || b),
        }

        if let Some(value) = new_bit {
            self.regs.set(dr, with_bit(word, n, value));
        }
        if let Some(value) = new_k {
            self.regs.set_flag(sts::K, value);
        }
        flow
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ND-100 CPU (level {}):", self.regs.level())?;
        for (reg, value) in Reg::ALL.iter().zip(self.regs.working_set()) {
            writeln!(f, "  {:<4}{:06o}", format!("{:?}", reg).to_uppercase(), value)?;
        }
        writeln!(
            f,
            "  PID {:06o}  PIE {:06o}  IIE {:06o}",
            self.intr.pid, self.intr.pie, self.intr.iie
        )?;
        writeln!(f, "  Cycles: {}", self.cycles)?;
        if let Some(instr) = self.last_instr {
            writeln!(f, "  Last: {:?}", instr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::encode;
    use crate::cpu::mmu::pte;

    fn cpu_with(program: &[Instruction]) -> Cpu {
        let config = Config {
            memory_words: 0o200000,
            ..Config::default()
        };
        let mut cpu = Cpu::with_config(&config);
        place(&mut cpu, 0, program);
        cpu
    }

    fn place(cpu: &mut Cpu, addr: u32, program: &[Instruction]) {
        let words: Vec<u16> = program.iter().map(encode).collect();
        cpu.load_program(addr, &words).unwrap();
    }

    fn poke(cpu: &mut Cpu, addr: u32, value: u16) {
        cpu.mmu.memory_mut().write(addr, value).unwrap();
    }

    fn peek(cpu: &Cpu, addr: u32) -> u16 {
        cpu.mmu.memory().read(addr).unwrap()
    }

    fn mem(op: MemOp, disp: i8) -> Instruction {
        Instruction::Memory {
            op,
            mode: AddrMode::DIRECT,
            disp,
        }
    }

    fn set(target: ArgTarget, value: i8) -> Instruction {
        Instruction::Arg {
            target,
            add: false,
            value,
        }
    }

    fn rop(func: RopFunc, sr: Reg, dr: Reg) -> Instruction {
        Instruction::Rop {
            func,
            cm1: false,
            cld: false,
            dr,
            sr,
        }
    }

    const RADD: RopFunc = RopFunc::Add {
        ad1: false,
        adc: false,
    };

    /// `COPY sr dr`: RADD with the destination cleared first.
    fn copy(sr: Reg, dr: Reg) -> Instruction {
        Instruction::Rop {
            func: RADD,
            cm1: false,
            cld: true,
            dr,
            sr,
        }
    }

    #[test]
    fn test_load_add_store() {
        let mut cpu = cpu_with(&[mem(MemOp::Lda, 10), mem(MemOp::Add, 10), mem(MemOp::Sta, 10)]);
        poke(&mut cpu, 10, 0o1000);
        poke(&mut cpu, 11, 0o234);

        cpu.run_limited(3).unwrap();
        assert_eq!(cpu.regs.a(), 0o1234);
        assert_eq!(peek(&cpu, 12), 0o1234);
        assert_eq!(cpu.regs.p(), 3);
        assert!(!cpu.regs.flag(sts::C));
    }

    #[test]
    fn test_sub_carry_and_overflow() {
        let mut cpu = cpu_with(&[mem(MemOp::Sub, 5), mem(MemOp::Add, 5)]);
        cpu.regs.set(Reg::A, 5);
        poke(&mut cpu, 5, 3);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 2);
        assert!(cpu.regs.flag(sts::C));

        cpu.regs.set(Reg::A, 0x7fff);
        poke(&mut cpu, 6, 1);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0x8000);
        assert!(cpu.regs.flag(sts::Q));
        assert!(cpu.regs.flag(sts::O));
    }

    #[test]
    fn test_addressing_modes() {
        let indexed = AddrMode {
            indexed: true,
            ..AddrMode::DIRECT
        };
        let indirect_indexed = AddrMode {
            indexed: true,
            indirect: true,
            base: false,
        };
        let base = AddrMode {
            base: true,
            ..AddrMode::DIRECT
        };
        let mut cpu = cpu_with(&[
            Instruction::Memory {
                op: MemOp::Lda,
                mode: indexed,
                disp: 4,
            },
            Instruction::Memory {
                op: MemOp::Ldt,
                mode: indirect_indexed,
                disp: 9,
            },
            Instruction::Memory {
                op: MemOp::Ldd,
                mode: base,
                disp: -2,
            },
        ]);
        cpu.regs.set(Reg::X, 0o100);
        cpu.regs.set(Reg::B, 0o302);
        poke(&mut cpu, 0o104, 0o11);
        poke(&mut cpu, 10, 0o200);
        poke(&mut cpu, 0o300, 0o22);
        poke(&mut cpu, 0o301, 0o33);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0o11);

        // (P + 9) + X = 0o200 + 0o100
        cpu.step().unwrap();
        assert_eq!(cpu.regs.t(), 0o22);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0o22);
        assert_eq!(cpu.regs.d(), 0o33);
    }

    #[test]
    fn test_jpl_and_return() {
        let mut cpu = cpu_with(&[
            mem(MemOp::Jpl, 4),
            set(ArgTarget::T, 7),
        ]);
        place(&mut cpu, 4, &[set(ArgTarget::A, 1), copy(Reg::L, Reg::P)]);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 4);
        assert_eq!(cpu.regs.get(Reg::L), 1);
        cpu.run_limited(3).unwrap();
        assert_eq!(cpu.regs.a(), 1);
        assert_eq!(cpu.regs.t(), 7);
        assert_eq!(cpu.regs.p(), 2);
    }

    #[test]
    fn test_jpc_counts_loop() {
        // X = -3; loop: AAA 1; JNC loop
        let mut cpu = cpu_with(&[
            set(ArgTarget::X, -3),
            Instruction::Arg {
                target: ArgTarget::A,
                add: true,
                value: 1,
            },
            Instruction::CondJump {
                cond: JumpCond::Jnc,
                disp: -1,
            },
        ]);
        cpu.run_limited(1 + 2 * 3).unwrap();
        assert_eq!(cpu.regs.a(), 3);
        assert_eq!(cpu.regs.x(), 0);
        assert_eq!(cpu.regs.p(), 3);
    }

    #[test]
    fn test_skip_conditions() {
        let skp = |cond, dr, sr| Instruction::Skip { cond, dr, sr };
        let mut cpu = cpu_with(&[
            skp(SkipCond::Eql, Reg::A, Reg::T),
            Instruction::Illegal(0o160000),
            skp(SkipCond::Gre, Reg::A, Reg::X),
            skp(SkipCond::Mgre, Reg::A, Reg::X),
        ]);
        cpu.regs.set(Reg::A, 5);
        cpu.regs.set(Reg::T, 5);
        cpu.regs.set(Reg::X, 0xffff);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 2);
        // 5 >= -1 signed
        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 4);

        cpu.regs.jump(3);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 4);
    }

    #[test]
    fn test_skip_source_zero() {
        let mut cpu = cpu_with(&[Instruction::Skip {
            cond: SkipCond::Eql,
            dr: Reg::A,
            sr: Reg::Sts,
        }]);
        cpu.regs.set_flag(sts::C, true);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 2);
    }

    #[test]
    fn test_min_skips_on_zero() {
        let mut cpu = cpu_with(&[mem(MemOp::Min, 8), mem(MemOp::Min, 7)]);
        poke(&mut cpu, 8, 0xfffe);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 1);
        cpu.step().unwrap();
        assert_eq!(peek(&cpu, 8), 0);
        assert_eq!(cpu.regs.p(), 3);
    }

    #[test]
    fn test_mpy_overflow() {
        let mut cpu = cpu_with(&[mem(MemOp::Mpy, 4), mem(MemOp::Mpy, 3)]);
        poke(&mut cpu, 4, 0xfffd);
        cpu.regs.set(Reg::A, 7);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a() as i16, -21);
        assert!(!cpu.regs.flag(sts::Q));

        cpu.regs.set(Reg::A, 0x4000);
        cpu.step().unwrap();
        assert!(cpu.regs.flag(sts::Q));
        assert!(cpu.regs.flag(sts::O));
    }

    #[test]
    fn test_rmpy_and_rdiv() {
        let mut cpu = cpu_with(&[
            Instruction::Rmpy {
                dr: Reg::T,
                sr: Reg::A,
            },
            Instruction::Rdiv { sr: Reg::T },
            Instruction::Rdiv { sr: Reg::Sts },
        ]);
        cpu.regs.set(Reg::A, (-3i16) as u16);
        cpu.regs.set(Reg::T, 5);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ad() as i32, -15);

        cpu.regs.set_ad(100);
        cpu.regs.set(Reg::T, 7);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 14);
        assert_eq!(cpu.regs.d(), 2);

        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::ErrorIndicator)));
        assert!(cpu.regs.flag(sts::Z));
        assert_eq!(cpu.regs.p(), 3);
    }

    #[test]
    fn test_rop_functions() {
        let mut cpu = cpu_with(&[
            rop(RADD, Reg::A, Reg::X),
            rop(RopFunc::Swap, Reg::A, Reg::X),
            Instruction::Rop {
                func: RopFunc::Add {
                    ad1: true,
                    adc: false,
                },
                cm1: true,
                cld: false,
                dr: Reg::T,
                sr: Reg::A,
            },
            rop(RopFunc::Exor, Reg::T, Reg::T),
            copy(Reg::L, Reg::P),
        ]);
        cpu.regs.set(Reg::A, 3);
        cpu.regs.set(Reg::X, 4);
        cpu.regs.set(Reg::T, 10);
        cpu.regs.set(Reg::L, 0o50);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.x(), 7);

        cpu.step().unwrap();
        assert_eq!((cpu.regs.a(), cpu.regs.x()), (7, 3));

        // T - A
        cpu.step().unwrap();
        assert_eq!(cpu.regs.t(), 3);
        assert!(cpu.regs.flag(sts::C));

        cpu.step().unwrap();
        assert_eq!(cpu.regs.t(), 0);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.p(), 0o50);
    }

    #[test]
    fn test_shift_sets_link() {
        let mut cpu = cpu_with(&[
            Instruction::Shift {
                target: ShiftTarget::A,
                kind: ShiftKind::Arithmetic,
                count: 1,
            },
            Instruction::Shift {
                target: ShiftTarget::Ad,
                kind: ShiftKind::LinkFill,
                count: -1,
            },
        ]);
        cpu.regs.set(Reg::A, 0x8001);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0x0002);
        assert!(cpu.regs.flag(sts::M));

        cpu.regs.set(Reg::D, 1);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ad(), 0x8001_0000);
        assert!(cpu.regs.flag(sts::M));
    }

    #[test]
    fn test_bit_operations() {
        let bop = |func, bit, dr| Instruction::Bop { func, bit, dr };
        let mut cpu = cpu_with(&[
            bop(BopFunc::SetOne, 3, Reg::A),
            bop(BopFunc::SkipOne, 3, Reg::A),
            Instruction::Illegal(0o160000),
            bop(BopFunc::LoadK, 3, Reg::A),
            bop(BopFunc::StoreComplementK, 0, Reg::A),
            bop(BopFunc::SetOne, 6, Reg::Sts),
        ]);
        cpu.run_limited(5).unwrap();
        assert_eq!(cpu.regs.a(), 0o10);
        assert!(cpu.regs.flag(sts::K));
        assert!(cpu.regs.flag(sts::C));
        assert_eq!(cpu.regs.p(), 6);
    }

    #[test]
    fn test_mix3() {
        let mut cpu = cpu_with(&[Instruction::Mix3]);
        cpu.regs.set(Reg::A, 5);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.x(), 12);
    }

    #[test]
    fn test_float_divide_by_zero() {
        let fdv = mem(MemOp::Fdv, 0o100);
        let mut cpu = cpu_with(&[fdv]);
        let one = Float48::from_fixed(1, 16).unwrap();
        cpu.set_float(one);

        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::ErrorIndicator)));
        assert!(cpu.regs.flag(sts::Z));
        assert_eq!(
            [cpu.regs.t(), cpu.regs.a(), cpu.regs.d()],
            Float48::saturated(false).pack()
        );
        assert_eq!(cpu.regs.p(), 1);
    }

    #[test]
    fn test_float_memory_ops() {
        let mut cpu = cpu_with(&[
            mem(MemOp::Ldf, 0o20),
            mem(MemOp::Fad, 0o17),
            mem(MemOp::Stf, 0o22),
        ]);
        let [t, a, d] = Float48::from_fixed(3, 16).unwrap().pack();
        cpu.load_program(0o20, &[t, a, d]).unwrap();

        cpu.run_limited(3).unwrap();
        let sum = Float48::unpack(peek(&cpu, 0o24), peek(&cpu, 0o25), peek(&cpu, 0o26));
        assert_eq!(sum.to_fixed(-16), Ok(6));
    }

    #[test]
    fn test_nlz_dnz() {
        let mut cpu = cpu_with(&[Instruction::Nlz { scale: 16 }, Instruction::Dnz { scale: -16 }]);
        cpu.regs.set(Reg::A, (-5i16) as u16);
        cpu.step().unwrap();
        assert_ne!(cpu.regs.t(), 0);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.a() as i16, -5);
        assert_eq!((cpu.regs.t(), cpu.regs.d()), (0, 0));
    }

    #[test]
    fn test_exr() {
        let mut cpu = cpu_with(&[Instruction::Exr { sr: Reg::T }, Instruction::Exr { sr: Reg::T }]);
        cpu.regs.set(Reg::T, encode(&set(ArgTarget::A, 9)));
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 9);
        assert_eq!(cpu.regs.p(), 1);

        cpu.regs.set(Reg::T, encode(&Instruction::Exr { sr: Reg::T }));
        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::IllegalInstruction)));
        assert_eq!(cpu.regs.p(), 2);
    }

    #[test]
    fn test_illegal_and_unhandled() {
        let mut cpu = cpu_with(&[
            Instruction::Illegal(0o142700),
            Instruction::Unsupported(0o140301),
        ]);
        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::IllegalInstruction)));
        assert_eq!(cpu.regs.p(), 1);
        assert_eq!(cpu.step(), Err(StopReason::UnhandledInstruction(0o140301)));
        assert_eq!(cpu.regs.p(), 1);
    }

    #[test]
    fn test_wait_with_interrupts_off() {
        let mut cpu = cpu_with(&[Instruction::Wait { code: 0 }]);
        assert_eq!(cpu.run(), StopReason::WaitWithInterruptsOff);
        assert_eq!(cpu.regs.p(), 0);
    }

    #[test]
    fn test_wait_idles_then_resumes_at_handler() {
        let mut cpu = cpu_with(&[
            Instruction::Control(Control::Ion),
            Instruction::Wait { code: 0 },
        ]);
        place(&mut cpu, 0o100, &[Instruction::Ident { level: 12 }, Instruction::Wait { code: 0 }]);
        cpu.intr.pie = (1 << 12) | 1;
        cpu.regs.write_banked(12, Reg::P, 0o100);

        cpu.step().unwrap();
        assert_eq!(cpu.step(), Err(StopReason::Idle));
        assert_eq!(cpu.regs.p(), 1);
        assert_eq!(cpu.step(), Err(StopReason::Idle));

        let dev = cpu.register_device(12, 0o42).unwrap();
        cpu.post_external(12, dev).unwrap();
        assert_eq!(
            cpu.step(),
            Ok(StepOutcome::Executed(Instruction::Ident { level: 12 }))
        );
        assert_eq!(cpu.regs.level(), 12);
        assert_eq!(cpu.regs.a(), 0o42);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.level(), 0);
        assert_eq!(cpu.regs.p(), 1);
        assert_eq!(cpu.regs.read_banked(12, Reg::P), 0o102);
        assert_eq!(cpu.step(), Err(StopReason::Idle));
    }

    #[test]
    fn test_ident_empty_queue_traps() {
        let mut cpu = cpu_with(&[Instruction::Ident { level: 10 }]);
        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::IoxError)));
        assert_eq!(cpu.regs.p(), 1);
    }

    #[test]
    fn test_interrupt_priority_switch() {
        let mut cpu = cpu_with(&[]);
        cpu.regs.write_banked(5, Reg::A, 0o555);
        cpu.regs.set_flag(sts::IONI, true);
        cpu.intr.pid = 0b0000_0000_0010_0100;
        cpu.intr.pie = 0xffff;

        cpu.check_interrupts();
        assert_eq!(cpu.regs.level(), 5);
        assert_eq!(cpu.regs.a(), 0o555);
    }

    #[test]
    fn test_monitor_call_enters_level_14() {
        let mut cpu = cpu_with(&[
            Instruction::Control(Control::Ion),
            Instruction::Mon { number: 0o377 },
        ]);
        let tra_iic = Instruction::Internal {
            op: InternalOp::Tra,
            reg: ireg::IIC,
        };
        place(&mut cpu, 0o200, &[tra_iic]);
        cpu.intr.pie = (1 << 14) | 1;
        cpu.intr.iie = Trap::MonitorCall.mask();
        cpu.regs.write_banked(14, Reg::P, 0o200);

        cpu.run_limited(3).unwrap();
        assert_eq!(cpu.regs.level(), 14);
        assert_eq!(cpu.regs.t(), 0xffff);
        assert_eq!(cpu.regs.a(), 1);
        assert_eq!(cpu.intr.pid & (1 << 14), 0);
        assert_eq!(cpu.regs.read_banked(0, Reg::P), 2);
    }

    #[test]
    fn test_handler_keeps_level_until_wait() {
        let mut cpu = cpu_with(&[
            Instruction::Control(Control::Ion),
            Instruction::Mon { number: 1 },
        ]);
        place(
            &mut cpu,
            0o200,
            &[
                Instruction::Internal {
                    op: InternalOp::Tra,
                    reg: ireg::IIC,
                },
                set(ArgTarget::A, 5),
                Instruction::Wait { code: 0 },
            ],
        );
        cpu.intr.pie = (1 << 14) | 1;
        cpu.intr.iie = Trap::MonitorCall.mask();
        cpu.regs.write_banked(14, Reg::P, 0o200);

        cpu.run_limited(3).unwrap();
        assert_eq!(cpu.regs.level(), 14);
        assert_eq!(cpu.intr.pid & (1 << 14), 0);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.level(), 14);
        assert_eq!(cpu.regs.a(), 5);
        assert_eq!(cpu.regs.p(), 0o202);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.level(), 0);
        assert_eq!(cpu.regs.p(), 2);
        assert_eq!(cpu.regs.read_banked(14, Reg::P), 0o203);
    }

    #[test]
    fn test_lower_request_waits_for_current_level() {
        let mut cpu = cpu_with(&[]);
        cpu.regs.set_flag(sts::IONI, true);
        cpu.intr.pie = 0xffff;
        cpu.intr.pid = 1 << 12;
        cpu.check_interrupts();
        assert_eq!(cpu.regs.level(), 12);

        cpu.intr.pid = 1 << 10;
        cpu.check_interrupts();
        assert_eq!(cpu.regs.level(), 12);
    }

    #[test]
    fn test_page_fault_traps_to_level_14() {
        let mut cpu = cpu_with(&[Instruction::Memory {
            op: MemOp::Lda,
            mode: AddrMode {
                indexed: true,
                ..AddrMode::DIRECT
            },
            disp: 0,
        }]);
        let tra_pgs = Instruction::Internal {
            op: InternalOp::Tra,
            reg: ireg::PGS,
        };
        place(&mut cpu, 0o100, &[tra_pgs]);
        cpu.mmu.set_entry(0, 0, pte::FPM | pte::RPM | pte::WPM, 0);
        cpu.mmu.set_pcr((14 << 3) | 3);
        cpu.regs.set_flag(sts::PONI | sts::IONI, true);
        cpu.intr.pie = (1 << 14) | 1;
        cpu.intr.iie = Trap::PageFault.mask();
        cpu.regs.set(Reg::X, 0o4000);
        cpu.regs.write_banked(14, Reg::P, 0o100);

        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::PageFault)));
        assert_eq!(cpu.regs.p(), 0);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.level(), 14);
        assert_eq!(cpu.regs.a(), 2);
        assert!(!cpu.mmu.page_fault.locked);
    }

    #[test]
    fn test_privileged_in_low_ring() {
        let mut cpu = cpu_with(&[Instruction::Control(Control::Ion)]);
        cpu.mmu.set_entry(0, 0, pte::FPM | pte::RPM, 0);
        cpu.regs.set_flag(sts::PONI, true);

        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::PrivilegedInstruction)));
        assert!(!cpu.regs.interrupts_enabled());
        assert_eq!(cpu.regs.p(), 1);
    }

    #[test]
    fn test_srb_lrb_roundtrip() {
        let mut cpu = cpu_with(&[Instruction::Srb { level: 0 }, Instruction::Lrb { level: 0 }]);
        for (reg, value) in [(Reg::A, 1), (Reg::D, 2), (Reg::B, 3), (Reg::L, 4), (Reg::T, 5)] {
            cpu.regs.set(reg, value);
        }
        cpu.regs.set(Reg::X, 0o300);
        cpu.regs.set_flag(sts::C, true);
        let before = cpu.regs.working_set();

        cpu.step().unwrap();
        assert_eq!(peek(&cpu, 0o300), 1);
        assert_eq!(peek(&cpu, 0o303), 1);
        for reg in [Reg::A, Reg::D, Reg::B, Reg::L, Reg::T] {
            cpu.regs.set(reg, 0o7777);
        }
        cpu.regs.set_flag(sts::C, false);

        cpu.step().unwrap();
        let after = cpu.regs.working_set();
        for reg in Reg::ALL.iter().filter(|r| **r != Reg::P) {
            assert_eq!(after[reg.index()], before[reg.index()], "{reg:?}");
        }
        assert_eq!(cpu.regs.p(), 2);
    }

    #[test]
    fn test_irr_irw() {
        let mut cpu = cpu_with(&[
            Instruction::Irw {
                level: 9,
                reg: Reg::B,
            },
            Instruction::Irr {
                level: 9,
                reg: Reg::B,
            },
        ]);
        cpu.regs.set(Reg::A, 0o4711);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.read_banked(9, Reg::B), 0o4711);
        cpu.regs.set(Reg::A, 0);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0o4711);
    }

    #[test]
    fn test_tra_pvl_yields_irr() {
        let tra_pvl = Instruction::Internal {
            op: InternalOp::Tra,
            reg: ireg::PVL,
        };
        let mut cpu = cpu_with(&[tra_pvl]);
        cpu.regs.switch_level(2, None);
        cpu.regs.switch_level(3, None);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0o153622);
        assert_eq!(
            decode(cpu.regs.a()),
            Instruction::Irr {
                level: 2,
                reg: Reg::P,
            }
        );
    }

    #[test]
    fn test_trr_and_mst() {
        let mut cpu = cpu_with(&[
            Instruction::Internal {
                op: InternalOp::Trr,
                reg: ireg::IIE,
            },
            Instruction::Internal {
                op: InternalOp::Mst,
                reg: ireg::PIE,
            },
            Instruction::Internal {
                op: InternalOp::Mcl,
                reg: ireg::PIE,
            },
        ]);
        cpu.regs.set(Reg::A, 0xffff);
        cpu.step().unwrap();
        assert_eq!(cpu.intr.iie, 0o3776);

        cpu.regs.set(Reg::A, 0o12);
        cpu.step().unwrap();
        assert_eq!(cpu.intr.pie, 0o12);
        cpu.regs.set(Reg::A, 0o2);
        cpu.step().unwrap();
        assert_eq!(cpu.intr.pie, 0o10);
    }

    #[test]
    fn test_breakpoint_stops_once() {
        let mut cpu = cpu_with(&[
            set(ArgTarget::A, 5),
            Instruction::Arg {
                target: ArgTarget::A,
                add: true,
                value: 1,
            },
        ]);
        cpu.add_breakpoint(1);
        cpu.step().unwrap();
        assert_eq!(cpu.step(), Err(StopReason::Breakpoint(1)));
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 6);
        assert!(cpu.remove_breakpoint(1));
    }

    #[test]
    fn test_interrupt_line_from_thread() {
        let mut cpu = cpu_with(&[]);
        place(&mut cpu, 0o100, &[Instruction::Ident { level: 11 }]);
        let dev = cpu.register_device(11, 0o7).unwrap();
        assert!(matches!(
            cpu.interrupt_line(12, dev),
            Err(InterruptError::LevelMismatch { .. })
        ));
        let line = cpu.interrupt_line(11, dev).unwrap();
        let raised = std::thread::spawn(move || line.raise()).join().unwrap();
        assert!(raised);

        cpu.intr.pie = 1 << 11;
        cpu.regs.set_flag(sts::IONI, true);
        cpu.regs.write_banked(11, Reg::P, 0o100);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.level(), 11);
        assert_eq!(cpu.regs.a(), 0o7);
    }

    struct Loopback;

    impl IoBus for Loopback {
        fn iox(&mut self, device: u16, a: u16) -> Result<Option<u16>, IoError> {
            match device {
                0o300 => Ok(Some(a + 1)),
                0o301 => Ok(None),
                _ => Err(IoError::NoResponse(device)),
            }
        }
    }

    #[test]
    fn test_iox() {
        let mut cpu = cpu_with(&[
            Instruction::Iox { device: 0o300 },
            Instruction::Iox { device: 0o301 },
            Instruction::Iox { device: 0o302 },
        ]);
        assert_eq!(cpu.step(), Err(StopReason::UnhandledIo { device: 0o300 }));

        cpu.attach_io(Loopback);
        cpu.regs.set(Reg::A, 41);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 42);
        cpu.step().unwrap();
        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::IoxError)));
        assert_eq!(cpu.regs.p(), 3);
    }

    #[test]
    fn test_exam_depo() {
        let mut cpu = cpu_with(&[Instruction::Depo, Instruction::Exam]);
        cpu.regs.set_ad(0o1234);
        cpu.regs.set(Reg::T, 0o777);
        cpu.step().unwrap();
        assert_eq!(peek(&cpu, 0o1234), 0o777);

        cpu.regs.set(Reg::T, 0);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.t(), 0o777);
    }

    #[test]
    fn test_tra_pes_pea_split_address() {
        let mut cpu = cpu_with(&[
            Instruction::Exam,
            Instruction::Internal {
                op: InternalOp::Tra,
                reg: ireg::PES,
            },
            Instruction::Internal {
                op: InternalOp::Tra,
                reg: ireg::PEA,
            },
        ]);
        cpu.regs.set_ad(0x12_3456);
        assert_eq!(cpu.step(), Ok(StepOutcome::Trapped(Trap::MemoryOutOfRange)));
        assert_eq!(cpu.regs.p(), 0);

        cpu.regs.jump(1);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), Trap::MemoryOutOfRange.mask() | 0x12);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.a(), 0x3456);
        assert!(!cpu.mmu.memory_error.locked);
    }

    #[test]
    fn test_load_block_checksum() {
        let mut cpu = cpu_with(&[]);
        cpu.load_block(0o400, &[1, 2, 3], 6).unwrap();
        assert_eq!(peek(&cpu, 0o402), 3);
        assert_eq!(
            cpu.load_block(0o400, &[1, 2, 3], 7),
            Err(LoadError::Stop(StopReason::Checksum {
                expected: 7,
                actual: 6,
            }))
        );
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut cpu = cpu_with(&[set(ArgTarget::A, 3)]);
        cpu.step().unwrap();
        cpu.intr.pie = 0o40;
        cpu.mmu.set_pcr(0o3);

        let json = serde_json::to_string(&cpu.snapshot()).unwrap();
        let mut other = cpu_with(&[]);
        other.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(other.regs, cpu.regs);
        assert_eq!(other.intr.pie, 0o40);
        assert_eq!(other.mmu.pcr(0), 0o3);
        assert_eq!(peek(&other, 0), encode(&set(ArgTarget::A, 3)));
        assert_eq!(other.cycles, 1);
    }

    #[test]
    fn test_reset_keeps_memory() {
        let mut cpu = cpu_with(&[set(ArgTarget::A, 3)]);
        cpu.step().unwrap();
        cpu.reset();
        assert_eq!(cpu.regs.a(), 0);
        assert_eq!(cpu.regs.p(), 0);
        assert!(cpu.regs.flag(sts::N100));
        assert_eq!(peek(&cpu, 0), encode(&set(ArgTarget::A, 3)));
    }
}
