//! Versioned processor savestate.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::cpu::registers::ConditionCodes;
use crate::cpu::Cpu;

pub const SAVESTATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub struct SaveState {
    pub version: u32,
    pub cpu: CpuSaveState,
}

#[derive(Serialize, Deserialize)]
pub struct CpuSaveState {
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

pub fn capture(cpu: &Cpu) -> SaveState {
    SaveState {
        version: SAVESTATE_VERSION,
        cpu: CpuSaveState {
            a: cpu.regs.a,
            b: cpu.regs.b,
            x: cpu.regs.x,
            y: cpu.regs.y,
            u: cpu.regs.u,
            s: cpu.regs.s,
            pc: cpu.regs.pc,
            dp: cpu.regs.dp,
            cc: cpu.regs.cc.bits(),
            cycles: cpu.cycles(),
        },
    }
}

pub fn apply(cpu: &mut Cpu, state: &SaveState) -> Result<(), String> {
    if state.version != SAVESTATE_VERSION {
        return Err(format!(
            "savestate version {} not supported (expected {})",
            state.version, SAVESTATE_VERSION
        ));
    }
    cpu.regs.a = state.cpu.a;
    cpu.regs.b = state.cpu.b;
    cpu.regs.x = state.cpu.x;
    cpu.regs.y = state.cpu.y;
    cpu.regs.u = state.cpu.u;
    cpu.regs.s = state.cpu.s;
    cpu.regs.pc = state.cpu.pc;
    cpu.regs.dp = state.cpu.dp;
    cpu.regs.cc = ConditionCodes::from_bits_retain(state.cpu.cc);
    cpu.set_cycles(state.cpu.cycles);
    Ok(())
}

pub fn save_to_file<P: AsRef<Path>>(cpu: &Cpu, path: P) -> Result<(), String> {
    let path = path.as_ref();
    let state = capture(cpu);
    let encoded = bincode::serialize(&state)
        .map_err(|e| format!("failed to encode savestate: {}", e))?;
    let mut file = File::create(path)
        .map_err(|e| format!("failed to create '{}': {}", path.display(), e))?;
    file.write_all(&encoded)
        .map_err(|e| format!("failed to write '{}': {}", path.display(), e))?;
    Ok(())
}

pub fn load_from_file<P: AsRef<Path>>(cpu: &mut Cpu, path: P) -> Result<(), String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| format!("failed to open '{}': {}", path.display(), e))?;
    let mut encoded = Vec::new();
    file.read_to_end(&mut encoded)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    let state: SaveState = bincode::deserialize(&encoded)
        .map_err(|e| format!("failed to decode '{}': {}", path.display(), e))?;
    apply(cpu, &state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ByteReader, ByteWriter};

    fn idle_cpu() -> Cpu {
        Cpu::new(ByteReader::unbound(), ByteWriter::unbound())
    }

    #[test]
    fn capture_apply_preserves_the_register_file() {
        let mut cpu = idle_cpu();
        cpu.regs.a = 0x12;
        cpu.regs.b = 0x34;
        cpu.regs.x = 0x5678;
        cpu.regs.y = 0x9ABC;
        cpu.regs.u = 0xDEF0;
        cpu.regs.s = 0x0123;
        cpu.regs.pc = 0x4567;
        cpu.regs.dp = 0x89;
        cpu.regs.cc = ConditionCodes::from_bits_retain(0xD5);
        cpu.set_cycles(987_654);

        let state = capture(&cpu);
        let mut other = idle_cpu();
        apply(&mut other, &state).unwrap();

        assert_eq!(other.snapshot(), cpu.snapshot());
        assert_eq!(other.regs.d(), 0x1234);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let cpu = idle_cpu();
        let mut state = capture(&cpu);
        state.version = 99;

        let mut other = idle_cpu();
        let err = apply(&mut other, &state).unwrap_err();
        assert!(err.contains("version 99"));
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join("m6809-savestate-test.sav");

        let mut cpu = idle_cpu();
        cpu.regs.pc = 0x2000;
        cpu.regs.set_d(0xBEEF);
        cpu.set_cycles(42);
        save_to_file(&cpu, &path).unwrap();

        let mut restored = idle_cpu();
        load_from_file(&mut restored, &path).unwrap();
        assert_eq!(restored.regs.pc, 0x2000);
        assert_eq!(restored.regs.d(), 0xBEEF);
        assert_eq!(restored.cycles(), 42);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unreadable_file_reports_an_error() {
        let mut cpu = idle_cpu();
        let err = load_from_file(&mut cpu, "/nonexistent/m6809.sav").unwrap_err();
        assert!(err.contains("failed to open"));
    }
}
