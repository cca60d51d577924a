//! MC6809 instruction execution engine.
//!
//! `step` runs exactly one instruction: consult the debugger at the
//! instruction boundary, fetch the opcode through the bus read callback
//! (one extra fetch for the $10/$11 page prefixes), dispatch, execute, then
//! add the instruction's cost to the cycle ledger. The register exchange and
//! transfer instructions carry the full postbyte semantics; the rest of the
//! implemented set covers each addressing mode the dispatch supports.

pub mod registers;


use crate::callback::{ByteReader, ByteWriter};
use crate::debugger::{Debugger, RegisterSnapshot};
use self::registers::{postbyte_pair, ConditionCodes, Registers};

/// Big-endian reset vector location.
pub const RESET_VECTOR: u16 = 0xFFFE;

/// Result of driving the engine for one instruction.
pub enum StepOutcome {
    /// One instruction ran; the cycle cost is reported for pacing.
    Executed(u32),
    /// The debugger holds the processor; nothing was fetched.
    Halted,
}

pub struct Cpu {
    pub regs: Registers,
    cycles: u64,
    bus_read: ByteReader,
    bus_write: ByteWriter,
}

impl Cpu {
    pub fn new(bus_read: ByteReader, bus_write: ByteWriter) -> Self {
        Cpu {
            regs: Registers::power_up(),
            cycles: 0,
            bus_read,
            bus_write,
        }
    }

    /// Cold start: power-up register values, PC from the reset vector,
    /// ledger cleared.
    pub fn reset(&mut self) {
        self.regs = Registers::power_up();
        self.regs.pc = self.read_word(RESET_VECTOR);
        self.cycles = 0;
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[allow(dead_code)]
    pub fn reset_cycles(&mut self) {
        self.cycles = 0;
    }

    pub fn set_cycles(&mut self, cycles: u64) {
        self.cycles = cycles;
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            a: self.regs.a,
            b: self.regs.b,
            x: self.regs.x,
            y: self.regs.y,
            u: self.regs.u,
            s: self.regs.s,
            pc: self.regs.pc,
            dp: self.regs.dp,
            cc: self.regs.cc.bits(),
            cycles: self.cycles,
        }
    }

    /// Execute one instruction, honoring the debugger at the boundary.
    /// While the debugger holds the processor this fetches nothing and
    /// returns `Halted`; the caller owns the resume decision.
    pub fn step(&mut self, debugger: &mut Debugger) -> StepOutcome {
        if debugger.check_boundary(self.regs.pc) {
            return StepOutcome::Halted;
        }

        let pc = self.regs.pc;
        let mut op = self.fetch_byte() as u16;
        if op == 0x10 || op == 0x11 {
            op = (op << 8) | self.fetch_byte() as u16;
        }
        let cost = self.execute(op);
        self.cycles = self.cycles.wrapping_add(cost as u64);
        debugger.record_trace(pc, op, self.cycles);
        StepOutcome::Executed(cost)
    }

    fn fetch_byte(&mut self) -> u8 {
        let value = self.bus_read.invoke(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self) -> u16 {
        let hi = self.fetch_byte() as u16;
        let lo = self.fetch_byte() as u16;
        (hi << 8) | lo
    }

    fn read_word(&mut self, addr: u16) -> u16 {
        let hi = self.bus_read.invoke(addr) as u16;
        let lo = self.bus_read.invoke(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    fn execute(&mut self, op: u16) -> u32 {
        match op {
            0x12 => 2, // NOP
            0x1E => self.exg(),
            0x1F => self.tfr(),
            0x20 => self.bra(),
            0x4F => self.clra(),
            0x5F => self.clrb(),
            0x7E => self.jmp_extended(),
            0x86 => self.lda_immediate(),
            0x8E => self.ldx_immediate(),
            0xB6 => self.lda_extended(),
            0xB7 => self.sta_extended(),
            0xC6 => self.ldb_immediate(),
            0xCE => self.ldu_immediate(),
            0xF7 => self.stb_extended(),
            0x108E => self.ldy_immediate(),
            0x10CE => self.lds_immediate(),
            // Undefined encodings (either page) execute as a no-op; the
            // emulated hardware's observed behavior, kept for compatibility.
            _ => 2,
        }
    }

    // ---- register exchange / transfer ----
    //
    // PC is already past the opcode and postbyte when the pair is applied,
    // so a pair naming PC reads "address of next instruction" and a write
    // to PC is a jump that sticks.

    fn exg(&mut self) -> u32 {
        let postbyte = self.fetch_byte();
        if let Some((first, second)) = postbyte_pair(postbyte) {
            let a = self.regs.read_inter(first);
            let b = self.regs.read_inter(second);
            self.regs.write_inter(first, b);
            self.regs.write_inter(second, a);
        }
        6
    }

    fn tfr(&mut self) -> u32 {
        let postbyte = self.fetch_byte();
        if let Some((source, target)) = postbyte_pair(postbyte) {
            let value = self.regs.read_inter(source);
            self.regs.write_inter(target, value);
        }
        4
    }

    // ---- loads and stores ----

    fn update_nzv8(&mut self, value: u8) {
        self.regs.cc.set(ConditionCodes::NEGATIVE, value & 0x80 != 0);
        self.regs.cc.set(ConditionCodes::ZERO, value == 0);
        self.regs.cc.remove(ConditionCodes::OVERFLOW);
    }

    fn update_nzv16(&mut self, value: u16) {
        self.regs.cc.set(ConditionCodes::NEGATIVE, value & 0x8000 != 0);
        self.regs.cc.set(ConditionCodes::ZERO, value == 0);
        self.regs.cc.remove(ConditionCodes::OVERFLOW);
    }

    fn lda_immediate(&mut self) -> u32 {
        let value = self.fetch_byte();
        self.regs.a = value;
        self.update_nzv8(value);
        2
    }

    fn ldb_immediate(&mut self) -> u32 {
        let value = self.fetch_byte();
        self.regs.b = value;
        self.update_nzv8(value);
        2
    }

    fn ldx_immediate(&mut self) -> u32 {
        let value = self.fetch_word();
        self.regs.x = value;
        self.update_nzv16(value);
        3
    }

    fn ldu_immediate(&mut self) -> u32 {
        let value = self.fetch_word();
        self.regs.u = value;
        self.update_nzv16(value);
        3
    }

    fn ldy_immediate(&mut self) -> u32 {
        let value = self.fetch_word();
        self.regs.y = value;
        self.update_nzv16(value);
        4
    }

    fn lds_immediate(&mut self) -> u32 {
        let value = self.fetch_word();
        self.regs.s = value;
        self.update_nzv16(value);
        4
    }

    fn lda_extended(&mut self) -> u32 {
        let addr = self.fetch_word();
        let value = self.bus_read.invoke(addr);
        self.regs.a = value;
        self.update_nzv8(value);
        5
    }

    fn sta_extended(&mut self) -> u32 {
        let addr = self.fetch_word();
        let value = self.regs.a;
        self.bus_write.invoke(addr, value);
        self.update_nzv8(value);
        5
    }

    fn stb_extended(&mut self) -> u32 {
        let addr = self.fetch_word();
        let value = self.regs.b;
        self.bus_write.invoke(addr, value);
        self.update_nzv8(value);
        5
    }

    fn clra(&mut self) -> u32 {
        self.regs.a = 0;
        self.regs.cc.remove(
            ConditionCodes::NEGATIVE | ConditionCodes::OVERFLOW | ConditionCodes::CARRY,
        );
        self.regs.cc.insert(ConditionCodes::ZERO);
        2
    }

    fn clrb(&mut self) -> u32 {
        self.regs.b = 0;
        self.regs.cc.remove(
            ConditionCodes::NEGATIVE | ConditionCodes::OVERFLOW | ConditionCodes::CARRY,
        );
        self.regs.cc.insert(ConditionCodes::ZERO);
        2
    }

    // ---- control transfer ----

    fn jmp_extended(&mut self) -> u32 {
        let target = self.fetch_word();
        self.regs.pc = target;
        4
    }

    fn bra(&mut self) -> u32 {
        let offset = self.fetch_byte() as i8;
        self.regs.pc = self.regs.pc.wrapping_add(offset as u16);
        3
    }
}
