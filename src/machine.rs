//! Host driver loop.
//!
//! Owns the processor, the memory it is wired to, the debug break
//! controller and the optional remote session. Execution is cooperative
//! and single-threaded: one instruction per engine call, and while the
//! debugger holds the processor this loop services the session until a
//! resume decision arrives instead of calling back into the engine.

use std::thread;
use std::time::{Duration, Instant};

use crate::callback::Notify;
use crate::cpu::{Cpu, StepOutcome};
use crate::debugger::Debugger;
use crate::memory::{Memory, SharedMemory};
use crate::remote::RemoteDebug;
use crate::shutdown;

/// Nominal 6809 E-clock for pacing.
const CLOCK_HZ: u64 = 1_000_000;

/// While running, the session is polled every this many instructions so an
/// asynchronous halt arrives promptly without a syscall per instruction.
const POLL_INTERVAL: u32 = 1024;

pub struct Machine {
    cpu: Cpu,
    #[allow(dead_code)]
    memory: SharedMemory,
    debugger: Debugger,
    remote: Option<RemoteDebug>,
    throttle: bool,
}

impl Machine {
    pub fn new(memory: SharedMemory, remote: Option<RemoteDebug>, throttle: bool) -> Self {
        let cpu = Cpu::new(Memory::reader(&memory), Memory::writer(&memory));

        let mut debugger = Debugger::new();
        debugger.set_signal_source(shutdown::take_halt_request);
        debugger.set_halt_notifier(Notify::bind(|| {
            log::debug!("execution suspended, returning control to the host loop");
        }));

        Machine {
            cpu,
            memory,
            debugger,
            remote,
            throttle,
        }
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        log::info!("reset: pc={:04X}", self.cpu.regs.pc);
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn debugger_mut(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    /// Drive the processor until the quit flag is raised or the optional
    /// cycle budget is spent.
    pub fn run(&mut self, cycle_limit: Option<u64>) {
        let started = Instant::now();
        let mut since_poll: u32 = 0;

        loop {
            if shutdown::should_quit() {
                break;
            }
            if let Some(limit) = cycle_limit {
                if self.cpu.cycles() >= limit {
                    break;
                }
            }

            match self.cpu.step(&mut self.debugger) {
                StepOutcome::Executed(_) => {
                    since_poll += 1;
                    if since_poll >= POLL_INTERVAL {
                        since_poll = 0;
                        if let Some(remote) = self.remote.as_mut() {
                            remote.poll(&mut self.cpu, &mut self.debugger);
                        }
                        if self.throttle {
                            pace(started, self.cpu.cycles());
                        }
                    }
                }
                StepOutcome::Halted => {
                    if !self.service_halted() {
                        break;
                    }
                }
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            remote.shutdown();
        }
    }

    /// Cooperative suspension: poll the session until it resumes us.
    /// Returns false when the run should end instead.
    fn service_halted(&mut self) -> bool {
        let Some(remote) = self.remote.as_mut() else {
            // halted with no session to resume us; treat as a stop request
            log::info!("halted at {:04X} with no debug session", self.cpu.regs.pc);
            return false;
        };

        while self.debugger.is_paused() {
            if shutdown::should_quit() {
                return false;
            }
            remote.poll(&mut self.cpu, &mut self.debugger);
            thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

/// Sleep off any lead the emulated clock has over wall time.
fn pace(started: Instant, cycles: u64) {
    let emulated = Duration::from_micros(cycles / (CLOCK_HZ / 1_000_000));
    let elapsed = started.elapsed();
    if emulated > elapsed {
        thread::sleep(emulated - elapsed);
    }
}
