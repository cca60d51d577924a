//! Debug break controller.
//!
//! Sits between the execution engine and the remote session: the engine
//! consults `check_boundary` once per instruction boundary, and the session
//! mutates breakpoints and the run state. Halting is cooperative; the engine
//! refuses to fetch while paused and the host loop services the session
//! until a resume decision arrives. An asynchronous halt request (signal
//! handler, operator interrupt) is latched elsewhere as an atomic flag and
//! consumed here through the installed signal source, never mid-instruction.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::callback::Notify;

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub enabled: bool,
    pub hit_count: u32,
}

/// Registers and ledger captured at one point in time. Readable in any run
/// state; writes go through the register file while paused only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub a: u8,
    pub b: u8,
    pub x: u16,
    pub y: u16,
    pub u: u16,
    pub s: u16,
    pub pc: u16,
    pub dp: u8,
    pub cc: u8,
    pub cycles: u64,
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pc={:04X} a={:02X} b={:02X} x={:04X} y={:04X} u={:04X} s={:04X} dp={:02X} cc={:02X} cycles={}",
            self.pc, self.a, self.b, self.x, self.y, self.u, self.s, self.dp, self.cc, self.cycles
        )
    }
}

#[derive(Debug, Clone)]
struct TraceEntry {
    pc: u16,
    op: u16,
    mnemonic: &'static str,
    cycles: u64,
}

pub struct Debugger {
    breakpoints: HashMap<u16, Breakpoint>,
    paused: bool,
    step_budget: Option<u32>,
    resume_pc: Option<u16>,
    on_halt: Notify,
    signal_poll: fn() -> bool,
    trace: VecDeque<TraceEntry>,
    history_size: usize,
    instruction_count: u64,
}

fn no_signal() -> bool {
    false
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            breakpoints: HashMap::new(),
            paused: false,
            step_budget: None,
            resume_pc: None,
            on_halt: Notify::unbound(),
            signal_poll: no_signal,
            trace: VecDeque::new(),
            history_size: 1000,
            instruction_count: 0,
        }
    }

    /// Invoked on every Running -> Halted transition.
    pub fn set_halt_notifier(&mut self, notify: Notify) {
        self.on_halt = notify;
    }

    /// Install the consuming poll for the asynchronous halt flag (set from
    /// a signal handler; must swap the flag off when it reads true).
    pub fn set_signal_source(&mut self, poll: fn() -> bool) {
        self.signal_poll = poll;
    }

    // ---- breakpoint management ----

    pub fn add_breakpoint(&mut self, address: u16) {
        self.breakpoints.entry(address).or_insert(Breakpoint {
            enabled: true,
            hit_count: 0,
        });
        log::info!("breakpoint added at {:04X}", address);
    }

    pub fn remove_breakpoint(&mut self, address: u16) -> bool {
        let removed = self.breakpoints.remove(&address).is_some();
        if removed {
            log::info!("breakpoint removed from {:04X}", address);
        }
        removed
    }

    #[allow(dead_code)]
    pub fn toggle_breakpoint(&mut self, address: u16) -> Option<bool> {
        let bp = self.breakpoints.get_mut(&address)?;
        bp.enabled = !bp.enabled;
        Some(bp.enabled)
    }

    #[allow(dead_code)]
    pub fn breakpoint(&self, address: u16) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    pub fn list_breakpoints(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .breakpoints
            .iter()
            .map(|(addr, bp)| {
                format!(
                    "{:04X} {} hits={}",
                    addr,
                    if bp.enabled { "enabled" } else { "disabled" },
                    bp.hit_count
                )
            })
            .collect();
        lines.sort();
        lines
    }

    // ---- run state ----

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Synchronous halt request from the session. Takes effect immediately
    /// at the current boundary; the engine is never mid-instruction when
    /// the session runs.
    pub fn pause(&mut self, pc: u16) {
        if !self.paused {
            self.enter_halt(pc, "halt requested");
        }
    }

    /// Leave the paused state. The breakpoint at the resume address, if
    /// any, is suppressed for one boundary so the halted instruction can
    /// execute exactly once.
    pub fn resume(&mut self, pc: u16) {
        self.paused = false;
        self.step_budget = None;
        self.resume_pc = Some(pc);
        log::info!("resumed at {:04X}", pc);
    }

    /// Run one instruction, then halt again at the next boundary.
    pub fn step_instruction(&mut self, pc: u16) {
        self.paused = false;
        self.step_budget = Some(1);
        self.resume_pc = Some(pc);
    }

    /// One check per instruction boundary. Returns true when the engine
    /// must not fetch.
    pub fn check_boundary(&mut self, pc: u16) -> bool {
        if self.paused {
            return true;
        }
        if (self.signal_poll)() {
            self.enter_halt(pc, "halt signal");
            return true;
        }

        let skip = self.resume_pc.take();
        if skip != Some(pc) {
            if let Some(bp) = self.breakpoints.get_mut(&pc) {
                if bp.enabled {
                    bp.hit_count += 1;
                    let hits = bp.hit_count;
                    self.enter_halt(pc, "breakpoint");
                    log::info!("breakpoint hit at {:04X} (hit count: {})", pc, hits);
                    return true;
                }
            }
        }

        match self.step_budget {
            Some(0) => {
                self.step_budget = None;
                self.enter_halt(pc, "step complete");
                true
            }
            Some(n) => {
                self.step_budget = Some(n - 1);
                false
            }
            None => false,
        }
    }

    fn enter_halt(&mut self, pc: u16, reason: &str) {
        self.paused = true;
        self.step_budget = None;
        log::debug!("halted at {:04X}: {}", pc, reason);
        self.on_halt.invoke_if_bound();
    }

    // ---- execution trace ----

    pub fn record_trace(&mut self, pc: u16, op: u16, cycles: u64) {
        self.instruction_count += 1;
        if crate::debug_flags::trace() {
            log::trace!("{:04X}: {}", pc, mnemonic(op));
        }
        self.trace.push_back(TraceEntry {
            pc,
            op,
            mnemonic: mnemonic(op),
            cycles,
        });
        if self.trace.len() > self.history_size {
            self.trace.pop_front();
        }
    }

    pub fn recent_trace(&self, count: usize) -> Vec<String> {
        let start = self.trace.len().saturating_sub(count);
        self.trace
            .iter()
            .skip(start)
            .map(|e| {
                let op = if e.op > 0xFF {
                    format!("{:04X}", e.op)
                } else {
                    format!("{:02X}", e.op)
                };
                format!("{:04X}: {} {} cycles={}", e.pc, op, e.mnemonic, e.cycles)
            })
            .collect()
    }

    #[allow(dead_code)]
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }
}

/// One-level disassembly of the implemented opcode set.
pub fn mnemonic(op: u16) -> &'static str {
    match op {
        0x12 => "NOP",
        0x1E => "EXG",
        0x1F => "TFR",
        0x20 => "BRA rel",
        0x4F => "CLRA",
        0x5F => "CLRB",
        0x7E => "JMP ext",
        0x86 => "LDA #imm",
        0x8E => "LDX #imm",
        0xB6 => "LDA ext",
        0xB7 => "STA ext",
        0xC6 => "LDB #imm",
        0xCE => "LDU #imm",
        0xF7 => "STB ext",
        0x108E => "LDY #imm",
        0x10CE => "LDS #imm",
        _ => "???",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn breakpoint_halts_at_boundary_and_counts_hits() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x2000);

        assert!(!dbg.check_boundary(0x1FFE));
        assert!(dbg.check_boundary(0x2000));
        assert!(dbg.is_paused());
        assert_eq!(dbg.breakpoint(0x2000).unwrap().hit_count, 1);

        // still held at subsequent boundaries
        assert!(dbg.check_boundary(0x2000));
        assert_eq!(dbg.breakpoint(0x2000).unwrap().hit_count, 1);
    }

    #[test]
    fn resume_suppresses_the_breakpoint_once() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x2000);
        assert!(dbg.check_boundary(0x2000));

        dbg.resume(0x2000);
        assert!(!dbg.check_boundary(0x2000));
        // next visit to the same address halts again
        assert!(dbg.check_boundary(0x2000));
        assert_eq!(dbg.breakpoint(0x2000).unwrap().hit_count, 2);
    }

    #[test]
    fn step_runs_exactly_one_instruction() {
        let mut dbg = Debugger::new();
        dbg.pause(0x1000);
        assert!(dbg.is_paused());

        dbg.step_instruction(0x1000);
        assert!(!dbg.check_boundary(0x1000)); // the stepped instruction
        assert!(dbg.check_boundary(0x1001)); // halted again
        assert!(dbg.is_paused());
    }

    #[test]
    fn disabled_breakpoint_does_not_halt() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x3000);
        assert_eq!(dbg.toggle_breakpoint(0x3000), Some(false));
        assert!(!dbg.check_boundary(0x3000));
        assert_eq!(dbg.breakpoint(0x3000).unwrap().hit_count, 0);
    }

    #[test]
    fn async_halt_request_is_consumed_at_the_boundary() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static FLAG: AtomicBool = AtomicBool::new(false);
        fn take_flag() -> bool {
            FLAG.swap(false, Ordering::SeqCst)
        }

        let mut dbg = Debugger::new();
        dbg.set_signal_source(take_flag);

        assert!(!dbg.check_boundary(0x1234));
        FLAG.store(true, Ordering::SeqCst);
        assert!(dbg.check_boundary(0x1234));
        assert!(dbg.is_paused());

        // the poll consumed the flag
        assert!(!FLAG.load(Ordering::SeqCst));
        dbg.resume(0x1234);
        assert!(!dbg.check_boundary(0x1234));
    }

    #[test]
    fn halt_notifier_fires_on_transition_only() {
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let mut dbg = Debugger::new();
        dbg.set_halt_notifier(crate::callback::Notify::bind(move || h.set(h.get() + 1)));

        dbg.pause(0x0100);
        dbg.pause(0x0100); // already paused, no second transition
        assert_eq!(hits.get(), 1);

        dbg.resume(0x0100);
        dbg.add_breakpoint(0x0200);
        assert!(dbg.check_boundary(0x0200));
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn trace_ring_is_bounded_and_formats_entries() {
        let mut dbg = Debugger::new();
        for i in 0..1100u32 {
            dbg.record_trace(i as u16, 0x12, i as u64);
        }
        assert_eq!(dbg.instruction_count(), 1100);
        let tail = dbg.recent_trace(2);
        assert_eq!(tail.len(), 2);
        assert!(tail[1].contains("NOP"));
        assert!(tail[1].starts_with("044B:"));
        // ring capped at history size
        assert_eq!(dbg.recent_trace(usize::MAX).len(), 1000);
    }

    #[test]
    fn mnemonics_cover_paged_opcodes() {
        assert_eq!(mnemonic(0x1E), "EXG");
        assert_eq!(mnemonic(0x108E), "LDY #imm");
        assert_eq!(mnemonic(0x01), "???");
    }
}
