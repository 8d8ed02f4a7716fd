//! Emulator facade (spec.md §4.4).
//!
//! Architecture-tagged wrapper owning one `Mmu` and one `CpuState`, exposing
//! a uniform surface (`load_elf`, `build_stack`, `execute`, `fork`, `reset`,
//! `run`, `run_until`, `stack_push`, getters) regardless of which
//! architecture is loaded. Mirrors `original_source/emu/emu_generic.c`'s
//! dispatch-on-`self->arch` design, but as a Rust sum type with a `match`
//! instead of a struct of function pointers (spec.md §9).

use crate::coverage::Coverage;
pub use crate::cpu::Arch;
use crate::cpu::{riscv, mips64, CpuState, ExitReason, StepOutcome};
use crate::elf::{self, Target};
use crate::mmu::{Mmu, Perm, VirtAddr, PERM_READ, PERM_WRITE};
use crate::stats::Stats;

/// Size of the region reserved for the guest stack (spec.md §3).
pub const STACK_SIZE: usize = 1024 * 1024;

/// Architecture-tagged emulator instance: one MMU, one CPU state, one
/// per-emulator coverage set.
#[derive(Debug, Clone)]
pub struct Emulator {
    arch: Arch,
    mmu: Mmu,
    cpu: CpuState,
    coverage: Coverage,
}

impl Emulator {
    /// Creates a fresh, unbooted emulator with `memory_size` bytes of guest
    /// memory.
    pub fn new(arch: Arch, memory_size: usize) -> Emulator {
        Emulator {
            arch,
            mmu: Mmu::new(memory_size),
            cpu: CpuState::new(arch),
            coverage: Coverage::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn pc(&self) -> u64 {
        self.cpu.pc()
    }

    pub fn exit_reason(&self) -> ExitReason {
        self.cpu.exit_reason()
    }

    pub fn new_coverage(&self) -> bool {
        self.cpu.new_coverage()
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    pub fn stack_size(&self) -> usize {
        self.cpu.stack_size()
    }

    /// Loads every `PT_LOAD` segment of `target`: allocate, record the
    /// address-map entry (so the write below translates correctly), write
    /// the segment bytes, then apply the segment's declared permissions.
    /// PC is set to the target's entry point.
    pub fn load_elf(&mut self, target: &Target, file_bytes: &[u8]) -> Result<(), elf::Error> {
        for seg in &target.segments {
            let mapped = self
                .mmu
                .allocate(seg.mem_size as usize)
                .map_err(|_| elf::Error::UnsupportedClass)?;

            self.mmu.add_segment(VirtAddr(seg.virt_addr as usize), *mapped, seg.mem_size as usize);

            let start = seg.file_offset as usize;
            let end = start + seg.file_size as usize;
            let bytes = file_bytes.get(start..end).unwrap_or(&[]);
            self.mmu
                .poke(VirtAddr(seg.virt_addr as usize), bytes)
                .map_err(|_| elf::Error::UnsupportedClass)?;

            self.mmu
                .set_permissions(VirtAddr(seg.virt_addr as usize), Perm(seg.perm_bits()), seg.mem_size as usize);
        }

        self.cpu.set_pc(target.entry);
        Ok(())
    }

    /// Reserves a 1 MiB stack region, marks it `R|W`, and pushes `argv`
    /// (each entry followed by a NUL terminator) so the guest's `_start`
    /// sees a conventional `argc; argv[]; NULL; envp[]; NULL; auxv AT_NULL`
    /// frame at SP.
    pub fn build_stack(&mut self, argv: &[&[u8]]) {
        let stack_base = self.mmu.allocate(STACK_SIZE).unwrap();
        self.mmu
            .set_permissions(stack_base, Perm(PERM_READ | PERM_WRITE), STACK_SIZE);

        let stack_top = *stack_base + STACK_SIZE;
        self.mmu.set_initial_stack_adr(stack_base, *stack_base);
        self.cpu.set_sp(stack_top as u64);
        self.cpu.set_stack_size(STACK_SIZE);

        // argv strings, highest address first, so pointers come out in
        // argv order once we push them below.
        let mut pointers = Vec::with_capacity(argv.len());
        for arg in argv.iter().rev() {
            let mut with_nul = arg.to_vec();
            with_nul.push(0);
            self.stack_push(&with_nul);
            pointers.push(self.cpu.sp());
        }
        pointers.reverse();

        // AT_NULL auxv terminator, NULL envp terminator, NULL argv
        // terminator, then argv pointers and argc, all 8 bytes wide.
        self.stack_push(&0u64.to_le_bytes());
        self.stack_push(&0u64.to_le_bytes());
        self.stack_push(&0u64.to_le_bytes());
        for ptr in pointers.iter().rev() {
            self.stack_push(&ptr.to_le_bytes());
        }
        self.stack_push(&(argv.len() as u64).to_le_bytes());
    }

    /// Writes `bytes` at SP, then decrements SP by `bytes.len()`.
    pub fn stack_push(&mut self, bytes: &[u8]) {
        let new_sp = self.cpu.sp() - bytes.len() as u64;
        self.cpu.set_sp(new_sp);
        self.mmu.write(VirtAddr(new_sp as usize), bytes).expect("stack push out of bounds");
    }

    /// Executes exactly one instruction at PC.
    pub fn execute(&mut self) -> StepOutcome {
        let outcome = match &mut self.cpu {
            CpuState::RiscV(cpu) => riscv::step(cpu, &mut self.mmu, &mut self.coverage),
            CpuState::Mips64(cpu) => mips64::step(cpu, &mut self.mmu, &mut self.coverage),
        };
        if let StepOutcome::Exit(reason) = outcome {
            self.cpu.set_exit_reason(reason);
        }
        outcome
    }

    /// Runs until an exit reason is raised, honoring `stats`' per-case
    /// instruction budget (spec.md §5's timeout mechanism).
    pub fn run(&mut self, stats: &mut Stats) -> ExitReason {
        loop {
            if stats.tick() {
                let reason = ExitReason::HostError;
                self.cpu.set_exit_reason(reason);
                stats.finish_case(self.new_coverage());
                return reason;
            }
            if let StepOutcome::Exit(reason) = self.execute() {
                stats.finish_case(self.new_coverage());
                return reason;
            }
        }
    }

    /// Like `run`, but also exits with `BREAKPOINT` when PC reaches
    /// `break_adr` before that instruction executes (spec.md §4.5's
    /// tie-break: breakpoint wins over a simultaneous syscall).
    pub fn run_until(&mut self, stats: &mut Stats, break_adr: u64) -> ExitReason {
        loop {
            if self.pc() == break_adr {
                let reason = ExitReason::Breakpoint;
                self.cpu.set_exit_reason(reason);
                stats.finish_case(self.new_coverage());
                return reason;
            }
            if stats.tick() {
                let reason = ExitReason::HostError;
                self.cpu.set_exit_reason(reason);
                stats.finish_case(self.new_coverage());
                return reason;
            }
            if let StepOutcome::Exit(reason) = self.execute() {
                stats.finish_case(self.new_coverage());
                return reason;
            }
        }
    }

    /// Deep-copies MMU buffers and CPU state into a fresh emulator with an
    /// empty dirty journal.
    pub fn fork(&self) -> Emulator {
        Emulator {
            arch: self.arch,
            mmu: self.mmu.fork(),
            cpu: self.cpu.clone(),
            coverage: self.coverage.clone(),
        }
    }

    /// Restores `self` to the state of reference emulator `src`: only the
    /// blocks `self`'s journal recorded dirty are copied back, then the
    /// journal is cleared and the CPU state is copied wholesale.
    pub fn reset(&mut self, src: &Emulator) {
        self.mmu.reset(&src.mmu);
        self.cpu = src.cpu.clone();
        self.coverage = src.coverage.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::PERM_EXEC;

    #[test]
    fn fork_then_reset_restores_state() {
        let mut reference = Emulator::new(Arch::RiscV, 64 * 1024);
        let code_addr = reference.mmu_mut().allocate(4).unwrap();
        reference
            .mmu_mut()
            .set_permissions(code_addr, Perm(PERM_EXEC | PERM_READ), 4);
        reference.mmu_mut().poke(code_addr, &[0x13, 0x00, 0x00, 0x00]).unwrap(); // nop (addi x0, x0, 0)
        reference.cpu = CpuState::RiscV(riscv::RiscVCpu::new());
        reference.cpu.set_pc(*code_addr as u64);

        let mut worker = reference.fork();
        let scratch = worker.mmu_mut().allocate(16).unwrap();
        worker
            .mmu_mut()
            .set_permissions(scratch, Perm(PERM_READ | PERM_WRITE), 16);
        worker.mmu_mut().write(scratch, &[1, 2, 3, 4]).unwrap();
        worker.cpu.set_pc(0xdead);

        worker.reset(&reference);

        assert_eq!(worker.pc(), reference.pc());
        let mut buf = [0u8; 4];
        match worker.mmu().read(scratch, &mut buf) {
            Err(_) => {}
            Ok(()) => panic!("expected reset to restore pre-write permissions"),
        }
    }

    #[test]
    fn run_until_breakpoint_stops_before_executing() {
        let mut emu = Emulator::new(Arch::RiscV, 64 * 1024);
        // Two nops (addi x0, x0, 0) then ecall-exit, not reached.
        let nop: u32 = 0x13;
        let code_addr = emu.mmu_mut().allocate(8).unwrap();
        emu.mmu_mut().set_permissions(code_addr, Perm(PERM_EXEC | PERM_READ), 8);
        emu.mmu_mut().poke(code_addr, &nop.to_le_bytes()).unwrap();
        emu.mmu_mut().poke(VirtAddr(*code_addr + 4), &nop.to_le_bytes()).unwrap();
        emu.cpu.set_pc(*code_addr as u64);

        let break_adr = *code_addr as u64 + 4;
        let mut stats = Stats::new(1000);
        let reason = emu.run_until(&mut stats, break_adr);

        assert_eq!(reason, ExitReason::Breakpoint);
        assert_eq!(emu.pc(), break_adr);
    }

    #[test]
    fn run_exits_on_syscall() {
        let mut emu = Emulator::new(Arch::RiscV, 64 * 1024);
        let ecall: u32 = 0x73;
        let code_addr = emu.mmu_mut().allocate(4).unwrap();
        emu.mmu_mut().set_permissions(code_addr, Perm(PERM_EXEC | PERM_READ), 4);
        emu.mmu_mut().poke(code_addr, &ecall.to_le_bytes()).unwrap();
        emu.cpu.set_pc(*code_addr as u64);
        if let CpuState::RiscV(cpu) = &mut emu.cpu {
            cpu.regs[riscv::reg::A7] = crate::syscall::riscv_nr::EXIT;
        }

        let mut stats = Stats::new(1000);
        let reason = emu.run(&mut stats);

        assert_eq!(reason, ExitReason::Ok);
        assert_eq!(stats.cases, 1);
    }

    #[test]
    fn run_times_out_on_instruction_budget() {
        let mut emu = Emulator::new(Arch::RiscV, 64 * 1024);
        let jal_self: u32 = 0x0000_006f; // jal x0, 0 (infinite self-loop)
        let code_addr = emu.mmu_mut().allocate(4).unwrap();
        emu.mmu_mut().set_permissions(code_addr, Perm(PERM_EXEC | PERM_READ), 4);
        emu.mmu_mut().poke(code_addr, &jal_self.to_le_bytes()).unwrap();
        emu.cpu.set_pc(*code_addr as u64);

        let mut stats = Stats::new(3);
        let reason = emu.run(&mut stats);

        assert_eq!(reason, ExitReason::HostError);
    }

    #[test]
    fn build_stack_sets_sp_below_stack_top() {
        let mut emu = Emulator::new(Arch::RiscV, 4 * 1024 * 1024);
        let before_sp = emu.cpu.sp();
        emu.build_stack(&[b"prog", b"arg1"]);
        assert!(emu.cpu.sp() < before_sp || before_sp == 0);
        assert_eq!(emu.stack_size(), STACK_SIZE);
    }

    #[test]
    fn build_stack_pushes_auxv_null_terminator() {
        let mut emu = Emulator::new(Arch::RiscV, 4 * 1024 * 1024);
        emu.build_stack(&[b"prog", b"arg1"]);

        let sp = emu.cpu.sp();
        let mut argc_bytes = [0u8; 8];
        emu.mmu().read(VirtAddr(sp as usize), &mut argc_bytes).unwrap();
        let argc = u64::from_le_bytes(argc_bytes);
        assert_eq!(argc, 2);

        // argv-NULL, envp-NULL, and the AT_NULL auxv terminator follow the
        // argc + argv-pointer block: three consecutive zero u64 words.
        let triplet_adr = sp + 8 * (argc + 1);
        let mut triplet = [0u8; 24];
        emu.mmu().read(VirtAddr(triplet_adr as usize), &mut triplet).unwrap();
        assert_eq!(triplet, [0u8; 24]);
    }
}
