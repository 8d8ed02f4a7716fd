//! CLI driver: loads a target ELF, boots a reference emulator, then either
//! drops into the interactive debug REPL (`--debug`) or forks it across a
//! pool of worker threads that fuzz it against a shared corpus.

mod debug_cli;

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info};
use thiserror::Error;

use riscv_emu::corpus::Corpus;
use riscv_emu::cpu::Arch;
use riscv_emu::elf;
use riscv_emu::emulator::Emulator;
use riscv_emu::mutator::mutate;
use riscv_emu::stats::Stats;
use xorshift::Xorshift64;

/// Per-case fuzz-injection buffer size handed to `mutate` (spec.md §6).
const FUZZ_BUF_SIZE: usize = 256;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read target file {0:?}: {1}")]
    ReadTarget(PathBuf, std::io::Error),
    #[error("failed to load target: {0}")]
    Elf(#[from] elf::Error),
    #[error("unrecognized architecture for target (expected RISC-V or MIPS64)")]
    UnknownArch,
}

/// Coverage-guided snapshot-fuzzing emulator for statically linked RV64I /
/// MIPS64 executables.
#[derive(Debug, Parser)]
#[command(name = "fuzzer-cli", version, about)]
struct Cli {
    /// Path to the statically linked target executable.
    target: PathBuf,

    /// Guest memory size, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    memory_size: usize,

    /// Number of worker threads to fuzz with.
    #[arg(long, short = 'j', default_value_t = 1)]
    workers: usize,

    /// PRNG seed driving mutation site/strategy selection.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Per-case instruction budget before a worker gives up and treats the
    /// case as a timeout.
    #[arg(long, default_value_t = 1_000_000)]
    instruction_budget: u64,

    /// Drop into the interactive debug REPL instead of fuzzing.
    #[arg(long)]
    debug: bool,

    /// Raise logging verbosity (stackable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn arch_for(target: &elf::Target) -> Option<Arch> {
    // Both architectures this emulator supports are 64-bit; disambiguate by
    // declared endianness (RV64I is little-endian, MIPS64 big-endian here).
    match target.endian {
        elf::Endian::Little => Some(Arch::RiscV),
        elf::Endian::Big => Some(Arch::Mips64),
    }
}

fn boot_reference(cli: &Cli) -> Result<(Emulator, u64), CliError> {
    let bytes = std::fs::read(&cli.target).map_err(|e| CliError::ReadTarget(cli.target.clone(), e))?;
    let target = elf::parse(&bytes)?;
    let arch = arch_for(&target).ok_or(CliError::UnknownArch)?;

    let mut emu = Emulator::new(arch, cli.memory_size);
    emu.load_elf(&target, &bytes)?;

    let prog_name = cli.target.to_string_lossy().into_owned();
    emu.build_stack(&[prog_name.as_bytes()]);

    let fuzz_buf_adr = emu
        .mmu_mut()
        .allocate(FUZZ_BUF_SIZE)
        .expect("reference memory exhausted allocating the fuzz-injection buffer");
    emu.mmu_mut().set_permissions(
        fuzz_buf_adr,
        riscv_emu::mmu::Perm(riscv_emu::mmu::PERM_READ | riscv_emu::mmu::PERM_WRITE),
        FUZZ_BUF_SIZE,
    );

    Ok((emu, *fuzz_buf_adr as u64))
}

/// Fuzzes `emu` against `corpus`, resetting to `reference` after every case.
/// `fuzz_buf_adr` is where each mutated input is written before `run`; it is
/// the address the target REPL session marks with `adr` (spec.md §6).
#[allow(clippy::too_many_arguments)]
fn run_worker(
    id: usize,
    mut emu: Emulator,
    reference: Arc<Emulator>,
    corpus: Arc<Corpus>,
    fuzz_buf_adr: u64,
    instruction_budget: u64,
    seed: u64,
    tx: mpsc::Sender<Stats>,
) {
    let mut rng = Xorshift64::new(seed ^ (id as u64 + 1));

    loop {
        let Some(mut input) = corpus.pick(&mut rng) else {
            thread::yield_now();
            continue;
        };
        let donor = corpus.pick(&mut rng).unwrap_or_default();
        mutate(&mut input, &donor, &mut rng);

        emu.reset(&reference);
        if emu.mmu_mut().write(riscv_emu::mmu::VirtAddr(fuzz_buf_adr as usize), &input).is_err() {
            error!("worker {id}: fuzz buffer write out of bounds, skipping case");
            continue;
        }

        let mut stats = Stats::new(instruction_budget);
        let reason = emu.run(&mut stats);
        info!("worker {id}: case finished, exit_reason={reason:?}");

        corpus.promote_if_new_coverage(input, emu.coverage());

        if tx.send(stats).is_err() {
            return;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let (reference, fuzz_buf_adr) = match boot_reference(&cli) {
        Ok(pair) => pair,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    if cli.debug {
        let code = debug_cli::run(reference, fuzz_buf_adr, FUZZ_BUF_SIZE);
        std::process::exit(code);
    }

    let corpus = Arc::new(Corpus::new());
    corpus.add_seed(vec![0u8; FUZZ_BUF_SIZE]);

    let reference = Arc::new(reference);
    let (tx, rx) = mpsc::channel();

    for id in 0..cli.workers {
        let worker_emu = reference.fork();
        let reference = Arc::clone(&reference);
        let corpus = Arc::clone(&corpus);
        let tx = tx.clone();
        let seed = cli.seed;
        let budget = cli.instruction_budget;

        thread::spawn(move || {
            run_worker(id, worker_emu, reference, corpus, fuzz_buf_adr, budget, seed, tx)
        });
    }
    drop(tx);

    let mut total_cases = 0u64;
    for stats in rx {
        total_cases += stats.cases;
        info!("total cases so far: {total_cases}, coverage edges: {}", corpus.coverage_len());
    }
}
