//! Remote debug session.
//!
//! Newline-delimited ASCII commands over TCP, one client at a time. The
//! session only converts commands into debug controller actions and
//! register/memory queries; it owns no processor state. While the target
//! runs, only the asynchronous halt and the read-only queries are honored;
//! everything else is acked with an error and changes nothing. Memory
//! access goes through the session's own bus callbacks.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::callback::{ByteReader, ByteWriter};
use crate::cpu::registers::InterReg;
use crate::cpu::Cpu;
use crate::debugger::Debugger;
use crate::savestate;

/// What a processed command did to the run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Resumed,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Break(u16),
    Clear(u16),
    ListBreaks,
    Step,
    Continue,
    Halt,
    Regs,
    SetReg(InterReg, u16),
    ReadMem(u16, usize),
    WriteMem(u16, Vec<u8>),
    Trace(usize),
    Save(String),
    Load(String),
    Detach,
}

const READ_LIMIT: usize = 256;

fn parse_addr(token: &str) -> Result<u16, String> {
    let digits = token.trim_start_matches("0x").trim_start_matches('$');
    u16::from_str_radix(digits, 16).map_err(|_| format!("bad address '{}'", token))
}

fn parse_byte(token: &str) -> Result<u8, String> {
    let digits = token.trim_start_matches("0x").trim_start_matches('$');
    u8::from_str_radix(digits, 16).map_err(|_| format!("bad byte '{}'", token))
}

pub fn parse(line: &str) -> Result<Command, String> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or_else(|| "empty command".to_string())?;
    let mut rest: Vec<&str> = tokens.collect();

    match verb {
        "break" => match rest.as_slice() {
            [addr] => Ok(Command::Break(parse_addr(addr)?)),
            _ => Err("usage: break <hex-addr>".to_string()),
        },
        "clear" => match rest.as_slice() {
            [addr] => Ok(Command::Clear(parse_addr(addr)?)),
            _ => Err("usage: clear <hex-addr>".to_string()),
        },
        "breaks" => Ok(Command::ListBreaks),
        "step" | "s" => Ok(Command::Step),
        "continue" | "c" => Ok(Command::Continue),
        "halt" => Ok(Command::Halt),
        "regs" => Ok(Command::Regs),
        "set" => match rest.as_slice() {
            [reg, value] => {
                let reg = InterReg::parse_name(reg)
                    .ok_or_else(|| format!("unknown register '{}'", reg))?;
                let digits = value.trim_start_matches("0x").trim_start_matches('$');
                let value = u16::from_str_radix(digits, 16)
                    .map_err(|_| format!("bad value '{}'", value))?;
                Ok(Command::SetReg(reg, value))
            }
            _ => Err("usage: set <reg> <hex-value>".to_string()),
        },
        "read" => match rest.as_slice() {
            [addr, len] => {
                let len: usize = len.parse().map_err(|_| format!("bad length '{}'", len))?;
                if len == 0 || len > READ_LIMIT {
                    return Err(format!("length must be 1..={}", READ_LIMIT));
                }
                Ok(Command::ReadMem(parse_addr(addr)?, len))
            }
            _ => Err("usage: read <hex-addr> <len>".to_string()),
        },
        "write" => {
            if rest.len() < 2 {
                return Err("usage: write <hex-addr> <hex-byte>...".to_string());
            }
            let addr = parse_addr(rest.remove(0))?;
            let bytes = rest
                .iter()
                .map(|t| parse_byte(t))
                .collect::<Result<Vec<u8>, String>>()?;
            Ok(Command::WriteMem(addr, bytes))
        }
        "trace" => match rest.as_slice() {
            [] => Ok(Command::Trace(10)),
            [n] => {
                let n: usize = n.parse().map_err(|_| format!("bad count '{}'", n))?;
                Ok(Command::Trace(n))
            }
            _ => Err("usage: trace [n]".to_string()),
        },
        "save" => match rest.as_slice() {
            [path] => Ok(Command::Save(path.to_string())),
            _ => Err("usage: save <path>".to_string()),
        },
        "load" => match rest.as_slice() {
            [path] => Ok(Command::Load(path.to_string())),
            _ => Err("usage: load <path>".to_string()),
        },
        "detach" => Ok(Command::Detach),
        other => Err(format!("unknown command '{}'", other)),
    }
}

/// Commands honored while the target is running: the asynchronous halt and
/// the read-only queries.
fn allowed_while_running(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::Halt | Command::Regs | Command::ListBreaks | Command::Trace(_) | Command::Detach
    )
}

pub(crate) fn execute_command(
    cmd: Command,
    cpu: &mut Cpu,
    debugger: &mut Debugger,
    bus_read: &mut ByteReader,
    bus_write: &mut ByteWriter,
) -> (String, Outcome) {
    if !debugger.is_paused() && !allowed_while_running(&cmd) {
        return ("err target is running".to_string(), Outcome::Unchanged);
    }

    match cmd {
        Command::Break(addr) => {
            debugger.add_breakpoint(addr);
            ("ok".to_string(), Outcome::Unchanged)
        }
        Command::Clear(addr) => {
            if debugger.remove_breakpoint(addr) {
                ("ok".to_string(), Outcome::Unchanged)
            } else {
                (
                    format!("err no breakpoint at {:04X}", addr),
                    Outcome::Unchanged,
                )
            }
        }
        Command::ListBreaks => {
            let lines = debugger.list_breakpoints();
            if lines.is_empty() {
                ("no breakpoints".to_string(), Outcome::Unchanged)
            } else {
                (lines.join("\n"), Outcome::Unchanged)
            }
        }
        Command::Step => {
            debugger.step_instruction(cpu.regs.pc);
            ("ok".to_string(), Outcome::Resumed)
        }
        Command::Continue => {
            debugger.resume(cpu.regs.pc);
            ("ok".to_string(), Outcome::Resumed)
        }
        Command::Halt => {
            debugger.pause(cpu.regs.pc);
            (
                format!("halted pc={:04X}", cpu.regs.pc),
                Outcome::Halted,
            )
        }
        Command::Regs => (cpu.snapshot().to_string(), Outcome::Unchanged),
        Command::SetReg(reg, value) => {
            cpu.regs.write_inter(reg, value);
            (
                format!("ok {}={:04X}", reg.name(), cpu.regs.read_inter(reg)),
                Outcome::Unchanged,
            )
        }
        Command::ReadMem(addr, len) => {
            let bytes: Vec<String> = (0..len)
                .map(|i| format!("{:02X}", bus_read.invoke(addr.wrapping_add(i as u16))))
                .collect();
            (bytes.join(" "), Outcome::Unchanged)
        }
        Command::WriteMem(addr, bytes) => {
            for (i, byte) in bytes.iter().enumerate() {
                bus_write.invoke(addr.wrapping_add(i as u16), *byte);
            }
            (format!("ok wrote {} bytes", bytes.len()), Outcome::Unchanged)
        }
        Command::Trace(n) => {
            let lines = debugger.recent_trace(n);
            if lines.is_empty() {
                ("trace empty".to_string(), Outcome::Unchanged)
            } else {
                (lines.join("\n"), Outcome::Unchanged)
            }
        }
        Command::Save(path) => match savestate::save_to_file(cpu, &path) {
            Ok(()) => ("ok".to_string(), Outcome::Unchanged),
            Err(e) => (format!("err {}", e), Outcome::Unchanged),
        },
        Command::Load(path) => match savestate::load_from_file(cpu, &path) {
            Ok(()) => ("ok".to_string(), Outcome::Unchanged),
            Err(e) => (format!("err {}", e), Outcome::Unchanged),
        },
        // handled by the transport layer before execution
        Command::Detach => ("ok".to_string(), Outcome::Unchanged),
    }
}

pub struct RemoteDebug {
    listener: TcpListener,
    client: Option<TcpStream>,
    pending: String,
    bus_read: ByteReader,
    bus_write: ByteWriter,
}

impl RemoteDebug {
    /// Bind the session listener. Failure is reported to the host, which
    /// decides whether to run without remote debugging.
    pub fn bind(port: u16, bus_read: ByteReader, bus_write: ByteWriter) -> Result<Self, String> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| format!("failed to bind debug port {}: {}", port, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("failed to configure debug listener: {}", e))?;
        log::info!(
            "remote debug session listening on port {}",
            listener.local_addr().map(|a| a.port()).unwrap_or(port)
        );
        Ok(RemoteDebug {
            listener,
            client: None,
            pending: String::new(),
            bus_read,
            bus_write,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Drop any connected client. The listener goes away with the session.
    pub fn shutdown(&mut self) {
        if self.client.take().is_some() {
            log::info!("remote debug session closed");
        }
        self.pending.clear();
    }

    /// Accept/read without blocking and process any complete command lines.
    pub fn poll(&mut self, cpu: &mut Cpu, debugger: &mut Debugger) -> Outcome {
        self.accept_pending();

        let mut disconnected = false;
        match self.client.as_mut() {
            None => return Outcome::Unchanged,
            Some(client) => {
                let mut buf = [0u8; 256];
                loop {
                    match client.read(&mut buf) {
                        Ok(0) => {
                            disconnected = true;
                            break;
                        }
                        Ok(n) => self.pending.push_str(&String::from_utf8_lossy(&buf[..n])),
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("debug client read error: {}", e);
                            disconnected = true;
                            break;
                        }
                    }
                }
            }
        }
        if disconnected {
            // client went away; never leave the target wedged
            log::info!("debug client disconnected");
            self.client = None;
            self.pending.clear();
            if debugger.is_paused() {
                debugger.resume(cpu.regs.pc);
                return Outcome::Resumed;
            }
            return Outcome::Unchanged;
        }

        let mut outcome = Outcome::Unchanged;
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (response, line_outcome) = match parse(line) {
                Ok(Command::Detach) => {
                    let was_paused = debugger.is_paused();
                    if was_paused {
                        debugger.resume(cpu.regs.pc);
                    }
                    self.respond("ok");
                    log::info!("debug client detached");
                    self.client = None;
                    self.pending.clear();
                    return if was_paused {
                        Outcome::Resumed
                    } else {
                        outcome
                    };
                }
                Ok(cmd) => execute_command(
                    cmd,
                    cpu,
                    debugger,
                    &mut self.bus_read,
                    &mut self.bus_write,
                ),
                Err(e) => (format!("err {}", e), Outcome::Unchanged),
            };
            self.respond(&response);
            if line_outcome != Outcome::Unchanged {
                outcome = line_outcome;
            }
        }
        outcome
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.client.is_some() {
                        // one debugger per target
                        let mut extra = stream;
                        let _ = extra.write_all(b"err busy\n");
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("failed to configure debug client: {}", e);
                        continue;
                    }
                    log::info!("debug client connected from {}", peer);
                    self.client = Some(stream);
                    self.pending.clear();
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("debug accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn respond(&mut self, response: &str) {
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client
                .write_all(response.as_bytes())
                .and_then(|_| client.write_all(b"\n"))
            {
                log::warn!("debug client write error: {}", e);
                self.client = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    fn test_rig() -> (Cpu, Debugger, ByteReader, ByteWriter) {
        let mem = Memory::new_shared();
        {
            let mut m = mem.borrow_mut();
            m.set_reset_vector(0x8000);
        }
        let mut cpu = Cpu::new(Memory::reader(&mem), Memory::writer(&mem));
        cpu.reset();
        (
            cpu,
            Debugger::new(),
            Memory::reader(&mem),
            Memory::writer(&mem),
        )
    }

    #[test]
    fn parse_accepts_the_command_set() {
        assert_eq!(parse("break 2000"), Ok(Command::Break(0x2000)));
        assert_eq!(parse("clear $2000"), Ok(Command::Clear(0x2000)));
        assert_eq!(parse("step"), Ok(Command::Step));
        assert_eq!(parse("c"), Ok(Command::Continue));
        assert_eq!(
            parse("set pc 1234"),
            Ok(Command::SetReg(InterReg::Pc, 0x1234))
        );
        assert_eq!(parse("read 0x8000 16"), Ok(Command::ReadMem(0x8000, 16)));
        assert_eq!(
            parse("write 8000 aa bb"),
            Ok(Command::WriteMem(0x8000, vec![0xAA, 0xBB]))
        );
        assert_eq!(parse("trace"), Ok(Command::Trace(10)));
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(parse("").is_err());
        assert!(parse("break").is_err());
        assert!(parse("break zz").is_err());
        assert!(parse("set q 12").is_err());
        assert!(parse("read 0 0").is_err());
        assert!(parse("read 0 9999").is_err());
        assert!(parse("warp 9").is_err());
    }

    #[test]
    fn mutating_commands_are_gated_on_halted() {
        let (mut cpu, mut dbg, mut br, mut bw) = test_rig();

        // running: writes refused, snapshot allowed
        let (resp, out) =
            execute_command(Command::SetReg(InterReg::A, 0x42), &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "err target is running");
        assert_eq!(out, Outcome::Unchanged);
        assert_eq!(cpu.regs.a, 0);

        let (resp, out) = execute_command(Command::Regs, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert!(resp.contains("pc=8000"));
        assert_eq!(out, Outcome::Unchanged);

        // halt, then the write goes through
        let (resp, out) = execute_command(Command::Halt, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "halted pc=8000");
        assert_eq!(out, Outcome::Halted);

        let (resp, _) =
            execute_command(Command::SetReg(InterReg::A, 0x42), &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "ok a=0042");
        assert_eq!(cpu.regs.a, 0x42);
    }

    #[test]
    fn halt_while_halted_confirms_the_state() {
        let (mut cpu, mut dbg, mut br, mut bw) = test_rig();
        dbg.pause(cpu.regs.pc);

        let (resp, out) = execute_command(Command::Halt, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "halted pc=8000");
        assert_eq!(out, Outcome::Halted);
        assert!(dbg.is_paused());
    }

    #[test]
    fn memory_commands_go_through_the_bus_callbacks() {
        let (mut cpu, mut dbg, mut br, mut bw) = test_rig();
        dbg.pause(cpu.regs.pc);

        let (resp, _) = execute_command(
            Command::WriteMem(0x3000, vec![0xDE, 0xAD]),
            &mut cpu,
            &mut dbg,
            &mut br,
            &mut bw,
        );
        assert_eq!(resp, "ok wrote 2 bytes");

        let (resp, _) =
            execute_command(Command::ReadMem(0x3000, 2), &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "DE AD");
    }

    #[test]
    fn continue_and_step_report_resumed() {
        let (mut cpu, mut dbg, mut br, mut bw) = test_rig();
        dbg.pause(cpu.regs.pc);

        let (resp, out) = execute_command(Command::Step, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "ok");
        assert_eq!(out, Outcome::Resumed);
        assert!(!dbg.is_paused());

        dbg.pause(cpu.regs.pc);
        let (_, out) = execute_command(Command::Continue, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(out, Outcome::Resumed);
        assert!(!dbg.is_paused());
    }

    #[test]
    fn breakpoint_commands_manage_the_set() {
        let (mut cpu, mut dbg, mut br, mut bw) = test_rig();
        dbg.pause(cpu.regs.pc);

        execute_command(Command::Break(0x2000), &mut cpu, &mut dbg, &mut br, &mut bw);
        let (resp, _) = execute_command(Command::ListBreaks, &mut cpu, &mut dbg, &mut br, &mut bw);
        assert!(resp.contains("2000 enabled hits=0"));

        let (resp, _) =
            execute_command(Command::Clear(0x2000), &mut cpu, &mut dbg, &mut br, &mut bw);
        assert_eq!(resp, "ok");
        let (resp, _) =
            execute_command(Command::Clear(0x2000), &mut cpu, &mut dbg, &mut br, &mut bw);
        assert!(resp.starts_with("err no breakpoint"));
    }

    #[test]
    fn tcp_session_round_trip() {
        use std::io::BufRead;
        use std::time::Duration;

        let mem = Memory::new_shared();
        mem.borrow_mut().set_reset_vector(0x8000);
        let mut cpu = Cpu::new(Memory::reader(&mem), Memory::writer(&mem));
        cpu.reset();
        let mut dbg = Debugger::new();

        let mut remote =
            RemoteDebug::bind(0, Memory::reader(&mem), Memory::writer(&mem)).unwrap();
        let port = remote.local_port();

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut writer = client.try_clone().unwrap();
        writer.write_all(b"halt\nregs\n").unwrap();

        let mut reader = std::io::BufReader::new(client);
        let mut lines = Vec::new();
        for _ in 0..200 {
            remote.poll(&mut cpu, &mut dbg);
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(n) if n > 0 => lines.push(line.trim().to_string()),
                _ => {}
            }
            if lines.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(lines[0], "halted pc=8000");
        assert!(lines[1].contains("a=00"));
        assert!(dbg.is_paused());

        remote.shutdown();
    }
}
