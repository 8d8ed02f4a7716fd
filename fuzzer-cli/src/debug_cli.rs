//! Interactive debug REPL (spec.md §6).
//!
//! A line-based command loop mirroring a GDB-style session: examine/search
//! memory, single-step, dump registers, manage breakpoints and (display
//! only) watchpoints, and hand the driver a `{snapshot, fuzz_buf_adr,
//! fuzz_buf_size}` triple via `go`. Empty input repeats the previous
//! command.

use std::io::{self, Write as _};

use log::error;

use riscv_emu::cpu::{CpuState, StepOutcome};
use riscv_emu::emulator::Emulator;
use riscv_emu::mmu::{SizeLetter, VirtAddr};

/// Runs the REPL against `emu` until `go` or `quit`. Returns the process
/// exit code (spec.md §6: 0 on normal `quit`, non-zero on fatal error).
pub fn run(mut emu: Emulator, fuzz_buf_adr: u64, fuzz_buf_size: usize) -> i32 {
    let mut breakpoints: Vec<u64> = Vec::new();
    let mut watches: Vec<String> = Vec::new();
    let mut fuzz_buf_adr = fuzz_buf_adr;
    let mut fuzz_buf_size = fuzz_buf_size;
    let mut last_line = String::new();

    println!("fuzzer-cli debug REPL; type `help` for commands.");

    loop {
        print!("(fuzzer-cli) ");
        if io::stdout().flush().is_err() {
            return 1;
        }

        let mut line = String::new();
        let read = io::stdin().read_line(&mut line);
        let Ok(n) = read else {
            error!("failed to read from stdin");
            return 1;
        };
        if n == 0 {
            // EOF: treat like `quit`.
            return 0;
        }

        let trimmed = line.trim();
        let line = if trimmed.is_empty() { last_line.clone() } else { trimmed.to_string() };
        if line.is_empty() {
            continue;
        }
        last_line = line.clone();

        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();

        match cmd {
            "help" => print_help(),
            "quit" => return 0,
            "xmem" => cmd_xmem(&emu, &args),
            "smem" => cmd_smem(&emu, &args),
            "ni" => cmd_ni(&mut emu),
            "ir" => cmd_ir(&emu),
            "break" => cmd_break(&emu, &args, &mut breakpoints),
            "sbreak" => cmd_sbreak(&breakpoints),
            "watch" | "swatch" => cmd_watch(&emu, &args, &mut watches),
            "continue" => cmd_continue(&mut emu, &breakpoints),
            "snapshot" => println!("snapshot marked at pc={:#x}", emu.pc()),
            "adr" => {
                if let Some(hex) = args.first() {
                    match parse_hex(hex) {
                        Some(v) => {
                            fuzz_buf_adr = v;
                            println!("fuzz_buf_adr = {fuzz_buf_adr:#x}");
                        }
                        None => error!("bad address: {hex}"),
                    }
                } else {
                    println!("fuzz_buf_adr = {fuzz_buf_adr:#x}");
                }
            }
            "length" => {
                if let Some(n) = args.first().and_then(|s| s.parse::<usize>().ok()) {
                    fuzz_buf_size = n;
                    println!("fuzz_buf_size = {fuzz_buf_size}");
                } else {
                    println!("fuzz_buf_size = {fuzz_buf_size}");
                }
            }
            "go" => {
                println!(
                    "go: snapshot@pc={:#x} fuzz_buf_adr={:#x} fuzz_buf_size={}",
                    emu.pc(),
                    fuzz_buf_adr,
                    fuzz_buf_size
                );
                return 0;
            }
            other => error!("unrecognized command: {other} (try `help`)"),
        }
    }
}

fn print_help() {
    println!(
        "commands: xmem [range] [b|h|w|g] <hex-adr> | smem <needle-hex> <b|h|w|g> | ni | ir \
         | break <hex-adr> | sbreak | watch <reg> | swatch | continue | snapshot | adr [hex] \
         | length [n] | go | help | quit"
    );
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn cmd_xmem(emu: &Emulator, args: &[&str]) {
    if args.is_empty() {
        error!("usage: xmem [range] [b|h|w|g] <hex-adr>");
        return;
    }
    let (range, rest) = match args[0].parse::<usize>() {
        Ok(n) => (n, &args[1..]),
        Err(_) => (1, args),
    };
    let (letter, adr_str) = match rest {
        [letter, adr] => (*letter, *adr),
        [adr] => ("w", *adr),
        _ => {
            error!("usage: xmem [range] [b|h|w|g] <hex-adr>");
            return;
        }
    };
    let Some(size_letter) = letter.chars().next().and_then(SizeLetter::from_char) else {
        error!("unknown size letter: {letter}");
        return;
    };
    let Some(adr) = parse_hex(adr_str) else {
        error!("bad address: {adr_str}");
        return;
    };
    emu.mmu().print(VirtAddr(adr as usize), range, size_letter);
}

fn cmd_smem(emu: &Emulator, args: &[&str]) {
    let [needle_str, letter] = args else {
        error!("usage: smem <needle-hex> <b|h|w|g>");
        return;
    };
    let Some(needle) = parse_hex(needle_str) else {
        error!("bad needle: {needle_str}");
        return;
    };
    let Some(size_letter) = letter.chars().next().and_then(SizeLetter::from_char) else {
        error!("unknown size letter: {letter}");
        return;
    };
    let hits = emu.mmu().search(needle, size_letter);
    println!("{} match(es)", hits.len());
    for offset in hits {
        println!("  {offset:#x}");
    }
}

fn cmd_ni(emu: &mut Emulator) {
    match emu.execute() {
        StepOutcome::Continue => println!("pc = {:#x}", emu.pc()),
        StepOutcome::Exit(reason) => println!("exited: {reason:?}"),
    }
}

fn cmd_ir(emu: &Emulator) {
    let names: &[&str] = match emu.cpu() {
        CpuState::RiscV(_) => &riscv_emu::cpu::riscv::reg::NAMES,
        CpuState::Mips64(_) => &riscv_emu::cpu::mips64::reg::NAMES,
    };
    for name in names {
        if let Some(value) = emu.cpu().reg_by_name(name) {
            println!("{name:>4} = {value:#018x}");
        }
    }
    println!("{:>4} = {:#018x}", "pc", emu.pc());
}

fn cmd_break(emu: &Emulator, args: &[&str], breakpoints: &mut Vec<u64>) {
    let Some(hex) = args.first() else {
        error!("usage: break <hex-adr>");
        return;
    };
    let Some(adr) = parse_hex(hex) else {
        error!("bad address: {hex}");
        return;
    };
    let mut probe = [0u8; 1];
    if emu.mmu().fetch(VirtAddr(adr as usize), &mut probe).is_err() {
        error!("address {adr:#x} is out of range or lacks EXEC permission");
        return;
    }
    breakpoints.push(adr);
    println!("breakpoint set at {adr:#x}");
}

fn cmd_sbreak(breakpoints: &[u64]) {
    for (i, adr) in breakpoints.iter().enumerate() {
        println!("{i}: {adr:#x}");
    }
}

fn cmd_watch(emu: &Emulator, args: &[&str], watches: &mut Vec<String>) {
    let Some(reg) = args.first() else {
        for w in watches.iter() {
            let value = emu.cpu().reg_by_name(w);
            println!("{w} = {value:?}");
        }
        return;
    };
    if emu.cpu().reg_by_name(reg).is_none() {
        error!("unknown register: {reg}");
        return;
    }
    watches.push(reg.to_string());
    println!("watching {reg} (accept-and-display only)");
}

fn cmd_continue(emu: &mut Emulator, breakpoints: &[u64]) {
    loop {
        if breakpoints.contains(&emu.pc()) {
            println!("hit breakpoint at {:#x}", emu.pc());
            return;
        }
        match emu.execute() {
            StepOutcome::Continue => {}
            StepOutcome::Exit(reason) => {
                println!("exited: {reason:?}");
                return;
            }
        }
    }
}
