//! Coverage-guided, snapshot-based emulator for statically linked RV64I
//! (little-endian) and MIPS64 (big-endian) user-mode executables.
//!
//! The hard part of this crate is [`mmu`]: a software MMU with byte-granular
//! permissions and read-after-write taint tracking, plus the dirty-block
//! journal ([`dirty`]) that makes restoring a worker emulator to a reference
//! snapshot proportional to how much memory the worker actually touched.
//! Everything above that — the per-architecture execution loops ([`cpu`]),
//! the [`emulator`] facade tying an MMU to a CPU state, the [`elf`] loader,
//! and the [`corpus`]/[`mutator`]/[`syscall`]/[`stats`] collaborators — exist
//! to drive the MMU and journal with real guest code.

pub mod addr_map;
pub mod corpus;
pub mod coverage;
pub mod cpu;
pub mod dirty;
pub mod elf;
pub mod emulator;
pub mod mmu;
pub mod mutator;
pub mod stats;
pub mod syscall;

pub use emulator::{Arch, Emulator};
pub use mmu::Mmu;
