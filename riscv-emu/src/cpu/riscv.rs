//! RV64I (little-endian) register file, decoder, and execution loop.
//!
//! Implements the RV64I base integer instruction set: loads/stores,
//! register-immediate and register-register ALU ops, branches, jumps,
//! `lui`/`auipc`, and `ecall`. No compressed (`C`), multiply/divide (`M`),
//! atomics (`A`), or floating point (`F`/`D`) extensions — not needed to
//! drive the MMU and exit-reason machinery this crate actually tests.

use super::{ExitReason, StepOutcome};
use crate::coverage::Coverage;
use crate::mmu::{Error as MmuError, Mmu, VirtAddr};
use crate::syscall::{self, dispatch_riscv};

/// ABI register names and indices (spec.md §6's `watch`/`swatch` table).
pub mod reg {
    pub const ZERO: usize = 0;
    pub const RA: usize = 1;
    pub const SP: usize = 2;
    pub const GP: usize = 3;
    pub const TP: usize = 4;
    pub const T0: usize = 5;
    pub const T1: usize = 6;
    pub const T2: usize = 7;
    pub const S0: usize = 8;
    pub const S1: usize = 9;
    pub const A0: usize = 10;
    pub const A1: usize = 11;
    pub const A2: usize = 12;
    pub const A3: usize = 13;
    pub const A4: usize = 14;
    pub const A5: usize = 15;
    pub const A6: usize = 16;
    pub const A7: usize = 17;
    pub const S2: usize = 18;
    pub const S3: usize = 19;
    pub const S4: usize = 20;
    pub const S5: usize = 21;
    pub const S6: usize = 22;
    pub const S7: usize = 23;
    pub const S8: usize = 24;
    pub const S9: usize = 25;
    pub const S10: usize = 26;
    pub const S11: usize = 27;
    pub const T3: usize = 28;
    pub const T4: usize = 29;
    pub const T5: usize = 30;
    pub const T6: usize = 31;

    pub const NAMES: [&str; 32] = [
        "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
        "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
        "t3", "t4", "t5", "t6",
    ];

    /// Register name for display (`ir`/debug CLI).
    pub fn name(idx: usize) -> &'static str {
        NAMES[idx]
    }

    /// Resolves an ABI register name (`fp` is an alias for `s0`) to its
    /// index.
    pub fn by_name(name: &str) -> Option<usize> {
        if name == "fp" {
            return Some(S0);
        }
        NAMES.iter().position(|&n| n == name)
    }
}

/// RV64I register file plus scalar CPU state.
#[derive(Debug, Clone)]
pub struct RiscVCpu {
    pub regs: [u64; 32],
    pub pc: u64,
    pub exit_reason: ExitReason,
    pub new_coverage: bool,
    pub stack_size: usize,
}

impl RiscVCpu {
    pub fn new() -> RiscVCpu {
        RiscVCpu {
            regs: [0; 32],
            pc: 0,
            exit_reason: ExitReason::Ok,
            new_coverage: false,
            stack_size: 0,
        }
    }
}

impl Default for RiscVCpu {
    fn default() -> RiscVCpu {
        RiscVCpu::new()
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    ((value << shift) as i32 >> shift) as i64
}

#[derive(Debug, Clone, Copy)]
struct Decoded {
    opcode: u32,
    rd: usize,
    rs1: usize,
    rs2: usize,
    funct3: u32,
    funct7: u32,
    imm_i: i64,
    imm_s: i64,
    imm_b: i64,
    imm_u: i64,
    imm_j: i64,
}

fn decode(word: u32) -> Decoded {
    let opcode = word & 0x7f;
    let rd = ((word >> 7) & 0x1f) as usize;
    let funct3 = (word >> 12) & 0x7;
    let rs1 = ((word >> 15) & 0x1f) as usize;
    let rs2 = ((word >> 20) & 0x1f) as usize;
    let funct7 = (word >> 25) & 0x7f;

    let imm_i = sign_extend(word >> 20, 12);

    let imm_s_raw = ((word >> 25) << 5) | ((word >> 7) & 0x1f);
    let imm_s = sign_extend(imm_s_raw, 12);

    let imm_b_raw = (((word >> 31) & 0x1) << 12)
        | (((word >> 7) & 0x1) << 11)
        | (((word >> 25) & 0x3f) << 5)
        | (((word >> 8) & 0xf) << 1);
    let imm_b = sign_extend(imm_b_raw, 13);

    let imm_u = ((word & 0xffff_f000) as i32) as i64;

    let imm_j_raw = (((word >> 31) & 0x1) << 20)
        | (((word >> 12) & 0xff) << 12)
        | (((word >> 20) & 0x1) << 11)
        | (((word >> 21) & 0x3ff) << 1);
    let imm_j = sign_extend(imm_j_raw, 21);

    Decoded {
        opcode,
        rd,
        rs1,
        rs2,
        funct3,
        funct7,
        imm_i,
        imm_s,
        imm_b,
        imm_u,
        imm_j,
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

/// Executes exactly one instruction at `cpu.pc`. Updates the register
/// file, `pc`, and `coverage`; never touches `cpu.exit_reason` itself (the
/// caller, `Emulator::execute`, does that from the returned outcome).
pub fn step(cpu: &mut RiscVCpu, mmu: &mut Mmu, coverage: &mut Coverage) -> StepOutcome {
    let mut word_bytes = [0u8; 4];
    if let Err(err) = mmu.fetch(VirtAddr(cpu.pc as usize), &mut word_bytes) {
        let _ = err;
        return StepOutcome::Exit(ExitReason::SegfaultExec);
    }
    let word = u32::from_le_bytes(word_bytes);
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
        // LOAD
        0x03 => {
            let addr = VirtAddr((rv!(d.rs1) + d.imm_i) as u64 as usize);
            let mut buf = [0u8; 8];
            let (width, sign) = match d.funct3 {
                0 => (1, true),  // LB
                1 => (2, true),  // LH
                2 => (4, true),  // LW
                3 => (8, false), // LD
                4 => (1, false), // LBU
                5 => (2, false), // LHU
                6 => (4, false), // LWU
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    (0, false)
                }
            };
            if width > 0 {
                match mmu.read(addr, &mut buf[..width]) {
                    Ok(()) => {
                        let mut value = 0u64;
                        for i in 0..width {
                            value |= (buf[i] as u64) << (8 * i);
                        }
                        let value = if sign && width < 8 {
                            let bits = (width * 8) as u32;
                            sign_extend(value as u32, bits) as u64
                        } else {
                            value
                        };
                        if d.rd != reg::ZERO {
                            cpu.regs[d.rd] = value;
                        }
                    }
                    Err(err) => outcome = StepOutcome::Exit(mem_exit(err, false)),
                }
            }
        }
        // STORE
        0x23 => {
            let addr = VirtAddr((rv!(d.rs1) + d.imm_s) as u64 as usize);
            let value = cpu.regs[d.rs2];
            let width = match d.funct3 {
                0 => 1, // SB
                1 => 2, // SH
                2 => 4, // SW
                3 => 8, // SD
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    0
                }
            };
            if width > 0 {
                let bytes = value.to_le_bytes();
                if let Err(err) = mmu.write(addr, &bytes[..width]) {
                    outcome = StepOutcome::Exit(mem_exit(err, true));
                }
            }
        }
        // OP-IMM
        0x13 => {
            let rs1 = rv!(d.rs1);
            let result: i64 = match d.funct3 {
                0 => rs1.wrapping_add(d.imm_i),                      // ADDI
                2 => (rs1 < d.imm_i) as i64,                         // SLTI
                3 => ((rs1 as u64) < (d.imm_i as u64)) as i64,       // SLTIU
                4 => rs1 ^ d.imm_i,                                  // XORI
                6 => rs1 | d.imm_i,                                  // ORI
                7 => rs1 & d.imm_i,                                  // ANDI
                1 => ((rs1 as u64) << (d.imm_i as u32 & 0x3f)) as i64, // SLLI
                5 => {
                    let shamt = d.imm_i as u32 & 0x3f;
                    if d.funct7 & 0x20 != 0 {
                        rs1 >> shamt // SRAI
                    } else {
                        ((rs1 as u64) >> shamt) as i64 // SRLI
                    }
                }
                _ => unreachable!("funct3 is 3 bits"),
            };
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = result as u64;
            }
        }
        // OP-IMM-32 (word ops, sign-extended to 64 bits)
        0x1b => {
            let rs1 = rv!(d.rs1) as i32;
            let result: i32 = match d.funct3 {
                0 => rs1.wrapping_add(d.imm_i as i32), // ADDIW
                1 => rs1.wrapping_shl(d.imm_i as u32 & 0x1f), // SLLIW
                5 => {
                    let shamt = d.imm_i as u32 & 0x1f;
                    if d.funct7 & 0x20 != 0 {
                        rs1.wrapping_shr(shamt) // SRAIW
                    } else {
                        ((rs1 as u32) >> shamt) as i32 // SRLIW
                    }
                }
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    0
                }
            };
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = result as i64 as u64;
            }
        }
        // LUI
        0x37 => {
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = d.imm_u as u64;
            }
        }
        // AUIPC
        0x17 => {
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = pc.wrapping_add(d.imm_u as u64);
            }
        }
        // OP
        0x33 => {
            let rs1 = rv!(d.rs1);
            let rs2 = rv!(d.rs2);
            let result: i64 = match (d.funct3, d.funct7) {
                (0, 0x00) => rs1.wrapping_add(rs2),
                (0, 0x20) => rs1.wrapping_sub(rs2),
                (1, 0x00) => ((rs1 as u64) << (rs2 as u32 & 0x3f)) as i64,
                (2, 0x00) => (rs1 < rs2) as i64,
                (3, 0x00) => ((rs1 as u64) < (rs2 as u64)) as i64,
                (4, 0x00) => rs1 ^ rs2,
                (5, 0x00) => ((rs1 as u64) >> (rs2 as u32 & 0x3f)) as i64,
                (5, 0x20) => rs1 >> (rs2 as u32 & 0x3f),
                (6, 0x00) => rs1 | rs2,
                (7, 0x00) => rs1 & rs2,
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    0
                }
            };
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = result as u64;
            }
        }
        // OP-32
        0x3b => {
            let rs1 = rv!(d.rs1) as i32;
            let rs2 = rv!(d.rs2) as i32;
            let result: i32 = match (d.funct3, d.funct7) {
                (0, 0x00) => rs1.wrapping_add(rs2),
                (0, 0x20) => rs1.wrapping_sub(rs2),
                (1, 0x00) => rs1.wrapping_shl(rs2 as u32 & 0x1f),
                (5, 0x00) => ((rs1 as u32) >> (rs2 as u32 & 0x1f)) as i32,
                (5, 0x20) => rs1.wrapping_shr(rs2 as u32 & 0x1f),
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    0
                }
            };
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = result as i64 as u64;
            }
        }
        // BRANCH
        0x63 => {
            let rs1 = rv!(d.rs1);
            let rs2 = rv!(d.rs2);
            let taken = match d.funct3 {
                0 => rs1 == rs2,                           // BEQ
                1 => rs1 != rs2,                           // BNE
                4 => rs1 < rs2,                            // BLT
                5 => rs1 >= rs2,                            // BGE
                6 => (rs1 as u64) < (rs2 as u64),          // BLTU
                7 => (rs1 as u64) >= (rs2 as u64),         // BGEU
                _ => {
                    outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
                    false
                }
            };
            if taken {
                next_pc = pc.wrapping_add(d.imm_b as u64);
            }
        }
        // JALR
        0x67 => {
            let target = (rv!(d.rs1).wrapping_add(d.imm_i) as u64) & !1u64;
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = next_pc;
            }
            next_pc = target;
        }
        // JAL
        0x6f => {
            if d.rd != reg::ZERO {
                cpu.regs[d.rd] = next_pc;
            }
            next_pc = pc.wrapping_add(d.imm_j as u64);
        }
        // SYSTEM (ecall/ebreak)
        0x73 => {
            if d.imm_i == 0 {
                // ECALL
                let num = cpu.regs[reg::A7];
                let args = [
                    cpu.regs[reg::A0],
                    cpu.regs[reg::A1],
                    cpu.regs[reg::A2],
                    cpu.regs[reg::A3],
                    cpu.regs[reg::A4],
                    cpu.regs[reg::A5],
                ];
                match dispatch_riscv(num, args, mmu) {
                    Ok(syscall::SyscallResult { return_value, exit }) => {
                        cpu.regs[reg::A0] = return_value;
                        if exit {
                            outcome = StepOutcome::Exit(ExitReason::Ok);
                        }
                    }
                    Err(_) => outcome = StepOutcome::Exit(ExitReason::SyscallNotSupported),
                }
            } else {
                outcome = StepOutcome::Exit(ExitReason::Breakpoint);
            }
        }
        // MISC-MEM (FENCE): no-op, single hart emulator.
        0x0f => {}
        _ => {
            outcome = StepOutcome::Exit(ExitReason::InvalidInstruction);
        }
    }

    cpu.pc = next_pc;

    if matches!(outcome, StepOutcome::Continue) && next_pc != pc.wrapping_add(4)
        && coverage.record(pc, next_pc) {
            cpu.new_coverage = true;
        }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{Perm, PERM_EXEC, PERM_READ, PERM_WRITE};

    fn boot(code: &[u32]) -> (RiscVCpu, Mmu) {
        let mut mmu = Mmu::new(4096);
        let base = mmu.allocate(code.len() * 4).unwrap();
        mmu.set_permissions(base, Perm(PERM_EXEC | PERM_READ), code.len() * 4);
        for (i, &w) in code.iter().enumerate() {
            mmu.poke(VirtAddr(*base + i * 4), &w.to_le_bytes()).unwrap();
        }
        let mut cpu = RiscVCpu::new();
        cpu.pc = *base as u64;
        (cpu, mmu)
    }

    fn encode_i(opcode: u32, rd: usize, funct3: u32, rs1: usize, imm: i32) -> u32 {
        opcode | ((rd as u32) << 7) | (funct3 << 12) | ((rs1 as u32) << 15) | ((imm as u32) << 20)
    }

    fn encode_r(opcode: u32, rd: usize, funct3: u32, rs1: usize, rs2: usize, funct7: u32) -> u32 {
        opcode
            | ((rd as u32) << 7)
            | (funct3 << 12)
            | ((rs1 as u32) << 15)
            | ((rs2 as u32) << 20)
            | (funct7 << 25)
    }

    fn encode_s(opcode: u32, funct3: u32, rs1: usize, rs2: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        opcode
            | ((imm & 0x1f) << 7)
            | (funct3 << 12)
            | ((rs1 as u32) << 15)
            | ((rs2 as u32) << 20)
            | (((imm >> 5) & 0x7f) << 25)
    }

    fn encode_b(opcode: u32, funct3: u32, rs1: usize, rs2: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        opcode
            | (((imm >> 11) & 0x1) << 7)
            | (((imm >> 1) & 0xf) << 8)
            | (funct3 << 12)
            | ((rs1 as u32) << 15)
            | ((rs2 as u32) << 20)
            | (((imm >> 5) & 0x3f) << 25)
            | (((imm >> 12) & 0x1) << 31)
    }

    fn encode_j(opcode: u32, rd: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        opcode
            | ((rd as u32) << 7)
            | (((imm >> 12) & 0xff) << 12)
            | (((imm >> 11) & 0x1) << 20)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 20) & 0x1) << 31)
    }

    #[test]
    fn addi_sets_register() {
        // addi a0, zero, 42
        let word = encode_i(0x13, reg::A0, 0, reg::ZERO, 42);
        let (mut cpu, mut mmu) = boot(&[word]);
        let mut coverage = Coverage::new();

        let outcome = step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(outcome, StepOutcome::Continue);
        assert_eq!(cpu.regs[reg::A0], 42);
    }

    #[test]
    fn add_computes_sum() {
        // add a0, a1, a2
        let word = encode_r(0x33, reg::A0, 0, reg::A1, reg::A2, 0x00);
        let (mut cpu, mut mmu) = boot(&[word]);
        cpu.regs[reg::A1] = 10;
        cpu.regs[reg::A2] = 32;
        let mut coverage = Coverage::new();

        step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(cpu.regs[reg::A0], 42);
    }

    #[test]
    fn store_then_load_round_trips() {
        let sw = encode_s(0x23, 2, reg::A1, reg::A0, 0); // sw a0, 0(a1)
        let lw = encode_i(0x03, reg::A2, 2, reg::A1, 0); // lw a2, 0(a1)

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

        assert_eq!(cpu.regs[reg::A2] as u32, 0xdead_beef);
    }

    #[test]
    fn branch_taken_changes_pc_and_marks_coverage() {
        // beq zero, zero, +8
        let word = encode_b(0x63, 0, reg::ZERO, reg::ZERO, 8);
        let (mut cpu, mut mmu) = boot(&[word, 0, 0]);
        let start_pc = cpu.pc;
        let mut coverage = Coverage::new();

        step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(cpu.pc, start_pc + 8);
        assert!(cpu.new_coverage);
    }

    #[test]
    fn jal_links_return_address() {
        // jal ra, +8 (skip the next instruction)
        let word = encode_j(0x6f, reg::RA, 8);
        let (mut cpu, mut mmu) = boot(&[word, 0, 0]);
        let start_pc = cpu.pc;
        let mut coverage = Coverage::new();

        step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(cpu.regs[reg::RA], start_pc + 4);
        assert_eq!(cpu.pc, start_pc + 8);
    }

    #[test]
    fn exec_fault_on_non_executable_pc() {
        let mut mmu = Mmu::new(4096);
        let mut cpu = RiscVCpu::new();
        cpu.pc = 0; // never mapped executable
        let mut coverage = Coverage::new();

        let outcome = step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(outcome, StepOutcome::Exit(ExitReason::SegfaultExec));
    }

    #[test]
    fn ecall_exit_reports_ok() {
        let ecall = 0x73;
        let (mut cpu, mut mmu) = boot(&[ecall]);
        cpu.regs[reg::A7] = syscall::riscv_nr::EXIT;
        cpu.regs[reg::A0] = 0;
        let mut coverage = Coverage::new();

        let outcome = step(&mut cpu, &mut mmu, &mut coverage);
        assert_eq!(outcome, StepOutcome::Exit(ExitReason::Ok));
    }

    #[test]
    fn register_name_round_trips() {
        assert_eq!(reg::by_name("sp"), Some(reg::SP));
        assert_eq!(reg::by_name("fp"), Some(reg::S0));
        assert_eq!(reg::name(reg::A0), "a0");
        assert_eq!(reg::by_name("bogus"), None);
    }
}
