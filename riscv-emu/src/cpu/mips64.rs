//! MIPS64 (big-endian) register file, decoder, and execution loop.
//!
//! A smaller subset than the RV64I loop: the arithmetic/logical, load/store,
//! branch, jump, and syscall instructions needed to run a minimal statically
//! linked target to completion. MIPS64 is the big-endian counterpart used to
//! exercise that the MMU and execution loop are endianness-agnostic; it does
//! not need RV64I's full instruction coverage to do that.

use super::{ExitReason, StepOutcome};
use crate::coverage::Coverage;
use crate::mmu::{Error as MmuError, Mmu, VirtAddr};
use crate::syscall::{self, dispatch_mips64};

/// ABI register names and indices (MIPS o32/n64 convention).
pub mod reg {
    pub const ZERO: usize = 0;
    pub const AT: usize = 1;
    pub const V0: usize = 2;
    pub const V1: usize = 3;
    pub const A0: usize = 4;
    pub const A1: usize = 5;
    pub const A2: usize = 6;
    pub const A3: usize = 7;
    pub const T0: usize = 8;
    pub const T1: usize = 9;
    pub const T2: usize = 10;
    pub const T3: usize = 11;
    pub const T4: usize = 12;
    pub const T5: usize = 13;
    pub const T6: usize = 14;
    pub const T7: usize = 15;
    pub const S0: usize = 16;
    pub const S1: usize = 17;
    pub const S2: usize = 18;
    pub const S3: usize = 19;
    pub const S4: usize = 20;
    pub const S5: usize = 21;
    pub const S6: usize = 22;
    pub const S7: usize = 23;
    pub const T8: usize = 24;
    pub const T9: usize = 25;
    pub const K0: usize = 26;
    pub const K1: usize = 27;
    pub const GP: usize = 28;
    pub const SP: usize = 29;
    pub const FP: usize = 30;
    pub const RA: usize = 31;

    pub const NAMES: [&str; 32] = [
        "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5",
        "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp",
        "sp", "fp", "ra",
    ];

    pub fn name(idx: usize) -> &'static str {
        NAMES[idx]
    }

    pub fn by_name(name: &str) -> Option<usize> {
        NAMES.iter().position(|&n| n == name)
    }
}

/// MIPS64 register file plus scalar CPU state.
#[derive(Debug, Clone)]
pub struct Mips64Cpu {
    pub regs: [u64; 32],
    pub pc: u64,
    pub exit_reason: ExitReason,
    pub new_coverage: bool,
    pub stack_size: usize,
}

impl Mips64Cpu {
    pub fn new() -> Mips64Cpu {
        Mips64Cpu {
            regs: [0; 32],
            pc: 0,
            exit_reason: ExitReason::Ok,
            new_coverage: false,
            stack_size: 0,
        }
    }
}

impl Default for Mips64Cpu {
    fn default() -> Mips64Cpu {
        Mips64Cpu::new()
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    ((value << shift) as i32 >> shift) as i64
}

#[derive(Debug, Clone, Copy)]
struct Decoded {
    opcode: u32,
    rs: usize,
    rt: usize,
    rd: usize,
    shamt: u32,
    funct: u32,
    imm: i64,
    target: u32,
}

fn decode(word: u32) -> Decoded {
    Decoded {
        opcode: word >> 26,
        rs: ((word >> 21) & 0x1f) as usize,
        rt: ((word >> 16) & 0x1f) as usize,
        rd: ((word >> 11) & 0x1f) as usize,
        shamt: (word >> 6) & 0x1f,
        funct: word & 0x3f,
        imm: sign_extend(word & 0xffff, 16),
        target: word & 0x3ff_ffff,
    }
}

fn mem_exit(err: MmuError, is_write: bool) -> ExitReason {
    match err {
        MmuError::NoPerm { .. } | MmuError::AdrOutOfRange { .. } => {
            if is_write {
                ExitReason::SegfaultWrite
            } else {
                ExitReason::SegfaultRead
            }
        }
        MmuError::MemFull | MmuError::WouldOverrun { .. } => ExitReason::HostError,
    }
}

/// Executes exactly one instruction at `cpu.pc`. Mirrors
/// [`crate::cpu::riscv::step`]'s contract but reads/writes guest memory
/// big-endian, per MIPS64's wire format.
pub fn step(cpu: &mut Mips64Cpu, mmu: &mut Mmu, coverage: &mut Coverage) -> StepOutcome {
    let mut word_bytes = [0u8; 4];
    if mmu.fetch(VirtAddr(cpu.pc as usize), &mut word_bytes).is_err() {
        return StepOutcome::Exit(ExitReason::SegfaultExec);
    }
    let word = u32::from_be_bytes(word_bytes);
    let d = decode(word);

    let pc = cpu.pc;
    let mut next_pc = pc.wrapping_add(4);
    let mut outcome = StepOutcome::Continue;

    macro_rules! rv {
        ($i:expr) => {
            cpu.regs[$i] as i64
        };
    }

    match d.opcode {
        0x00 => match d.funct {
            0x20 => set(cpu, d.rd, rv!(d.rs).wrapping_add(rv!(d.rt)) as u64), // ADD(U)
            0x22 => set(cpu, d.rd, rv!(d.rs).wrapping_sub(rv!(d.rt)) as u64), // SUB(U)
            0x24 => set(cpu, d.rd, (rv!(d.rs) & rv!(d.rt)) as u64),          // AND
            0x25 => set(cpu, d.rd, (rv!(d.rs) | rv!(d.rt)) as u64),          // OR
            0x26 => set(cpu, d.rd, (rv!(d.rs) ^ rv!(d.rt)) as u64),          // XOR
            0x2a => set(cpu, d.rd, (rv!(d.rs) < rv!(d.rt)) as u64),          // SLT
            0x2b => set(cpu, d.rd, ((rv!(d.rs) as u64) < (rv!(d.rt) as u64)) as u64), // SLTU
            0x00 => set(cpu, d.rd, (rv!(d.rt) as u64) << d.shamt), // SLL
            0x02 => set(cpu, d.rd, (rv!(d.rt) as u64) >> d.shamt), // SRL
            0x03 => set(cpu, d.rd, (rv!(d.rt) >> d.shamt) as u64),          // SRA
            0x08 => next_pc = rv!(d.rs) as u64,                            // JR
            0x09 => {
                set(cpu, d.rd, next_pc);
                next_pc = rv!(d.rs) as u64; // JALR
            }
            0x0c => {
                // SYSCALL
                let num = cpu.regs[reg::V0];
                let args = [
                    cpu.regs[reg::A0],
                    cpu.regs[reg::A1],
                    cpu.regs[reg::A2],
                    cpu.regs[reg::A3],
                    0,
                    0,
                ];
                match dispatch_mips64(num, args, mmu) {
                    Ok(syscall::SyscallResult { return_value, exit }) => {
                        cpu.regs[reg::V0] = return_value;
                        if exit {
                            outcome = StepOutcome::Exit(ExitReason::Ok);
                        }
                    }
                    Err(_) => outcome = StepOutcome::Exit(ExitReason::SyscallNotSupported),
                }
            }
            _ => outcome = StepOutcome::Exit(ExitReason::InvalidInstruction),
        },
        0x08 => set(cpu, d.rt, rv!(d.rs).wrapping_add(d.imm) as u64), // ADDI
        0x09 => set(cpu, d.rt, rv!(d.rs).wrapping_add(d.imm) as u64), // ADDIU
        0x0c => set(cpu, d.rt, (rv!(d.rs) & d.imm) as u64),           // ANDI
        0x0d => set(cpu, d.rt, (rv!(d.rs) | d.imm) as u64),           // ORI
        0x0e => set(cpu, d.rt, (rv!(d.rs) ^ d.imm) as u64),           // XORI
        0x0f => set(cpu, d.rt, (d.imm << 16) as u64),                 // LUI
        0x0a => set(cpu, d.rt, (rv!(d.rs) < d.imm) as u64),           // SLTI
        0x0b => set(cpu, d.rt, ((rv!(d.rs) as u64) < (d.imm as u64)) as u64), // SLTIU
        // Branches
        0x04..=0x07 => {
            let taken = match d.opcode {
                0x04 => rv!(d.rs) == rv!(d.rt), // BEQ
                0x05 => rv!(d.rs) != rv!(d.rt), // BNE
                0x06 => rv!(d.rs) <= 0,         // BLEZ
                0x07 => rv!(d.rs) > 0,          // BGTZ
                _ => unreachable!(),
            };
            if taken {
                next_pc = pc.wrapping_add(4).wrapping_add((d.imm << 2) as u64);
            }
        }
        // Loads
        0x20 | 0x21 | 0x23 | 0x24 | 0x25 | 0x27 | 0x37 => {
            let addr = VirtAddr((rv!(d.rs).wrapping_add(d.imm)) as u64 as usize);
            let (width, sign) = match d.opcode {
                0x20 => (1, true),  // LB
                0x21 => (2, true),  // LH
                0x23 => (4, true),  // LW
                0x24 => (1, false), // LBU
                0x25 => (2, false), // LHU
                0x27 => (4, false), // LWU
                0x37 => (8, false), // LD
                _ => unreachable!(),
            };
            let mut buf = [0u8; 8];
            match mmu.read(addr, &mut buf[..width]) {
                Ok(()) => {
                    let mut value = 0u64;
                    for i in 0..width {
                        value = (value << 8) | buf[i] as u64; // big-endian
                    }
                    let value = if sign && width < 8 {
                        sign_extend(value as u32, (width * 8) as u32) as u64
                    } else {
                        value
                    };
                    set(cpu, d.rt, value);
                }
                Err(err) => outcome = StepOutcome::Exit(mem_exit(err, false)),
            }
        }
        // Stores
        0x28 | 0x29 | 0x2b | 0x3f => {
            let addr = VirtAddr((rv!(d.rs).wrapping_add(d.imm)) as u64 as usize);
            let width = match d.opcode {
                0x28 => 1, // SB
                0x29 => 2, // SH
                0x2b => 4, // SW
                0x3f => 8, // SD
                _ => unreachable!(),
            };
            let value = cpu.regs[d.rt];
            let mut bytes = [0u8; 8];
            for i in 0..width {
                bytes[i] = (value >> (8 * (width - 1 - i))) as u8; // big-endian
            }
            if let Err(err) = mmu.write(addr, &bytes[..width]) {
                outcome = StepOutcome::Exit(mem_exit(err, true));
            }
        }
        // J / JAL
        0x02 | 0x03 => {
            let target = (pc & !0x0fff_ffff) | ((d.target as u64) << 2);
            if d.opcode == 0x03 {
                set(cpu, reg::RA, next_pc);
            }
            next_pc = target;
        }
        _ => outcome = StepOutcome::Exit(ExitReason::InvalidInstruction),
    }

    cpu.pc = next_pc;

    if matches!(outcome, StepOutcome::Continue) && next_pc != pc.wrapping_add(4)
        && coverage.record(pc, next_pc) {
            cpu.new_coverage = true;
        }

    outcome
}

fn set(cpu: &mut Mips64Cpu, idx: usize, value: u64) {
    if idx != reg::ZERO {
        cpu.regs[idx] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{Perm, PERM_EXEC, PERM_READ, PERM_WRITE};

    fn boot(code: &[u32]) -> (Mips64Cpu, Mmu) {
        let mut mmu = Mmu::new(4096);
        let base = mmu.allocate(code.len() * 4).unwrap();
        mmu.set_permissions(base, Perm(PERM_EXEC | PERM_READ), code.len() * 4);
        for (i, &w) in code.iter().enumerate() {
            mmu.poke(VirtAddr(*base + i * 4), &w.to_be_bytes()).unwrap();
        }
        let mut cpu = Mips64Cpu::new();
        cpu.pc = *base as u64;
        (cpu, mmu)
    }

    fn encode_i(opcode: u32, rs: usize, rt: usize, imm: i32) -> u32 {
        (opcode << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | (imm as u32 & 0xffff)
    }

    fn encode_r(rs: usize, rt: usize, rd: usize, shamt: u32, funct: u32) -> u32 {
        ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | (shamt << 6) | funct
    }

    #[test]
    fn addiu_sets_register() {
        let word = encode_i(0x09, reg::ZERO, reg::V0, 42);
        let (mut cpu, mut mmu) = boot(&[word]);
        let mut coverage = Coverage::new();

        step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(cpu.regs[reg::V0], 42);
    }

    #[test]
    fn addu_computes_sum() {
        let word = encode_r(reg::A0, reg::A1, reg::V0, 0, 0x20);
        let (mut cpu, mut mmu) = boot(&[word]);
        cpu.regs[reg::A0] = 10;
        cpu.regs[reg::A1] = 32;
        let mut coverage = Coverage::new();

        step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(cpu.regs[reg::V0], 42);
    }

    #[test]
    fn store_then_load_round_trips_big_endian() {
        let sw = encode_i(0x2b, reg::A1, reg::A0, 0); // sw a0, 0(a1)
        let lw = encode_i(0x23, reg::A1, reg::V0, 0); // lw v0, 0(a1)

        let (mut cpu, mut mmu) = boot(&[sw, lw]);
        let data = mmu.allocate(8).unwrap();
        mmu.set_permissions(data, Perm(PERM_READ | PERM_WRITE), 8);
        mmu.add_segment(VirtAddr(0x5000), *data, 8);
        mmu.set_permissions(VirtAddr(0x5000), Perm(PERM_READ | PERM_WRITE), 8);

        cpu.regs[reg::A0] = 0xdead_beef;
        cpu.regs[reg::A1] = 0x5000;

        let mut coverage = Coverage::new();
        step(&mut cpu, &mut mmu, &mut coverage);
        step(&mut cpu, &mut mmu, &mut coverage);

        assert_eq!(cpu.regs[reg::V0] as u32, 0xdead_beef);
    }

    #[test]
    fn syscall_exit_reports_ok() {
        let word = encode_r(0, 0, 0, 0, 0x0c);
        let (mut cpu, mut mmu) = boot(&[word]);
        cpu.regs[reg::V0] = syscall::mips64_nr::EXIT;
        let mut coverage = Coverage::new();

        let outcome = step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(outcome, StepOutcome::Exit(ExitReason::Ok));
    }

    #[test]
    fn exec_fault_on_non_executable_pc() {
        let mut mmu = Mmu::new(4096);
        let mut cpu = Mips64Cpu::new();
        cpu.pc = 0;
        let mut coverage = Coverage::new();

        let outcome = step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(outcome, StepOutcome::Exit(ExitReason::SegfaultExec));
    }
}
