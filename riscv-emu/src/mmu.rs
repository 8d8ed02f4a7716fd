//! Emulated software MMU with byte-level memory permissions able to detect
//! uninitialized memory accesses.
//!
//! The MMU owns the guest's flat memory buffer, the parallel byte-level
//! permissions buffer, the bump allocator used to carve out loaded
//! segments/stack/heap, the address map translating segment virtual
//! addresses, and the dirty-block journal used to make resetting a worker
//! back to a reference snapshot proportional to how much memory it actually
//! touched.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::addr_map::AddrMap;
use crate::dirty::{DirtyJournal, DIRTY_BLOCK_SIZE};

/// Executable memory. Aimed to be used with `Perm`.
pub const PERM_EXEC: u8 = 1;

/// Writable memory. Aimed to be used with `Perm`.
pub const PERM_WRITE: u8 = 1 << 1;

/// Readable memory. Aimed to be used with `Perm`.
pub const PERM_READ: u8 = 1 << 2;

/// Read-after-write memory. Aimed to be used with `Perm`.
///
/// This permission is set when allocating writable memory. If a memory
/// position has this flag and is written, the READ permission will be
/// automatically assigned afterwards. This allows us to detect accesses to
/// uninitialized memory.
pub const PERM_RAW: u8 = 1 << 3;

/// Memory error.
#[derive(Debug)]
pub enum Error {
    /// The bump allocator's cursor is already at the end of memory.
    MemFull,

    /// The requested allocation would advance the cursor past the end of
    /// memory.
    WouldOverrun { addr: VirtAddr, size: usize },

    /// Memory access does not satisfy the expected permissions (includes
    /// accesses to memory still tainted `PERM_RAW`).
    NoPerm { addr: VirtAddr, size: usize },

    /// Memory address (after translation) is outside the flat buffer.
    AdrOutOfRange { addr: VirtAddr, size: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MemFull => write!(f, "memory full"),
            Error::WouldOverrun { addr, size } => {
                write!(f, "allocation would overrun memory: addr={} size={}", addr, size)
            }
            Error::NoPerm { addr, size } => {
                write!(f, "no permission: addr={} size={}", addr, size)
            }
            Error::AdrOutOfRange { addr, size } => {
                write!(f, "address out of range: addr={} size={}", addr, size)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Memory permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm(pub u8);

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut disp = String::new();

        disp.push(if self.0 & PERM_READ != 0 { 'R' } else { '-' });
        disp.push(if self.0 & PERM_WRITE != 0 { 'W' } else { '-' });
        disp.push(if self.0 & PERM_EXEC != 0 { 'X' } else { '-' });

        write!(f, "{}", disp)
    }
}

impl Deref for Perm {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Deref for VirtAddr {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VirtAddr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Size letter used by `search`/`print`, naming how many bytes make up one
/// element: byte, half-word, word, giant (quad-word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLetter {
    Byte,
    Half,
    Word,
    Giant,
}

impl SizeLetter {
    /// Parses the single-character CLI spelling (`b`, `h`, `w`, `g`).
    pub fn from_char(c: char) -> Option<SizeLetter> {
        match c {
            'b' => Some(SizeLetter::Byte),
            'h' => Some(SizeLetter::Half),
            'w' => Some(SizeLetter::Word),
            'g' => Some(SizeLetter::Giant),
            _ => None,
        }
    }

    /// Number of bytes making up one element of this size.
    pub fn nb_bytes(self) -> usize {
        match self {
            SizeLetter::Byte => 1,
            SizeLetter::Half => 2,
            SizeLetter::Word => 4,
            SizeLetter::Giant => 8,
        }
    }
}

/// Emulated memory management unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mmu {
    /// Memory size.
    size: usize,

    /// Memory contents.
    memory: Vec<u8>,

    /// Byte-level memory permissions.
    perms: Vec<Perm>,

    /// Dirty-block journal, see `dirty`.
    journal: DirtyJournal,

    /// Address map translating loaded-segment virtual addresses, see
    /// `addr_map`.
    addr_map: AddrMap,

    /// Bump allocator cursor. Used, in order, to carve out loaded segments,
    /// the guest stack, and then the guest heap. Only ever increases.
    curr_alloc_adr: VirtAddr,

    /// Virtual address where the guest stack starts. Set once at boot by
    /// `Emulator::build_stack` and never changed afterwards.
    initial_stack_adr_virt: VirtAddr,

    /// Mapped (flat-buffer) address where the guest stack starts. Set once
    /// at boot and never changed afterwards.
    initial_stack_adr_mapped: usize,
}

impl Mmu {
    /// Returns a new Mmu with a given memory `size`.
    ///
    /// # Panics
    ///
    /// This function panics if `size` is lower than `DIRTY_BLOCK_SIZE`.
    pub fn new(size: usize) -> Mmu {
        assert!(size >= DIRTY_BLOCK_SIZE, "invalid size");

        Mmu {
            size,
            memory: vec![0; size],
            perms: vec![Perm(0); size],
            journal: DirtyJournal::new(size),
            addr_map: AddrMap::new(),
            curr_alloc_adr: VirtAddr(0),
            initial_stack_adr_virt: VirtAddr(0),
            initial_stack_adr_mapped: 0,
        }
    }

    /// Returns the size of the memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns a copy of the MMU. It marks all memory as clean in the new
    /// copy.
    pub fn fork(&self) -> Mmu {
        Mmu {
            size: self.size,
            memory: self.memory.clone(),
            perms: self.perms.clone(),
            journal: DirtyJournal::new(self.size),
            addr_map: self.addr_map.clone(),
            curr_alloc_adr: self.curr_alloc_adr,
            initial_stack_adr_virt: self.initial_stack_adr_virt,
            initial_stack_adr_mapped: self.initial_stack_adr_mapped,
        }
    }

    /// Restores memory to the original state `other`, touching only the
    /// blocks that `self`'s journal recorded as dirty.
    pub fn reset(&mut self, other: &Mmu) {
        for &block in self.journal.dirty_blocks() {
            let start = block * DIRTY_BLOCK_SIZE;
            let end = ((block + 1) * DIRTY_BLOCK_SIZE).min(self.size);

            self.memory[start..end].copy_from_slice(&other.memory[start..end]);
            self.perms[start..end].copy_from_slice(&other.perms[start..end]);
        }
        self.journal.clear();

        // The bump cursor is only ever advanced by loading/boot, which
        // happens once before the reference snapshot is taken; restoring it
        // keeps resets correct even if a case allocates.
        self.curr_alloc_adr = other.curr_alloc_adr;
    }

    /// Returns the current bump-allocator cursor.
    pub fn curr_alloc_adr(&self) -> VirtAddr {
        self.curr_alloc_adr
    }

    /// Returns the virtual address where the stack starts.
    pub fn initial_stack_adr_virt(&self) -> VirtAddr {
        self.initial_stack_adr_virt
    }

    /// Records the address (virtual and mapped) of the start of the guest
    /// stack. Called once by `Emulator::build_stack`.
    pub fn set_initial_stack_adr(&mut self, virt: VirtAddr, mapped: usize) {
        self.initial_stack_adr_virt = virt;
        self.initial_stack_adr_mapped = mapped;
    }

    /// Records an address-map translation for a loaded segment.
    pub fn add_segment(&mut self, virtual_base: VirtAddr, mapped_base: usize, length: usize) {
        self.addr_map.add_segment(*virtual_base, mapped_base, length);
    }

    /// Translates a guest virtual address to an offset in the flat memory
    /// buffer.
    pub fn virt_to_mapped(&self, virt: VirtAddr) -> usize {
        self.addr_map.virt_to_mapped(*virt)
    }

    /// Bump-allocates `size` bytes, advancing the cursor. Returns the
    /// virtual base address of the allocation. Sets permissions of the new
    /// range to `WRITE | RAW`, so the first read of any byte before it is
    /// written is a fault.
    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, Error> {
        let addr = self.curr_alloc_adr;

        if *addr >= self.size {
            return Err(Error::MemFull);
        }

        let end = addr
            .checked_add(size)
            .filter(|&e| e <= self.size)
            .ok_or(Error::WouldOverrun { addr, size })?;

        self.set_permissions_mapped(*addr, end - *addr, Perm(PERM_WRITE | PERM_RAW));

        self.curr_alloc_adr = VirtAddr(end);

        Ok(addr)
    }

    /// Writes `perm` to every permissions byte in the virtual range
    /// `[start_virt, start_virt + size)`. No bounds error: the caller is
    /// trusted to have obtained `start_virt` from `allocate` or a loaded
    /// segment. Any prior `RAW` bit is replaced by `perm` verbatim.
    pub fn set_permissions(&mut self, start_virt: VirtAddr, perm: Perm, size: usize) {
        let mapped = self.virt_to_mapped(start_virt);
        self.set_permissions_mapped(mapped, size, perm);
    }

    fn set_permissions_mapped(&mut self, mapped: usize, size: usize, perm: Perm) {
        for p in &mut self.perms[mapped..mapped + size] {
            *p = perm;
        }
        self.journal.make_dirty_range(mapped, size);
    }

    /// Copies `n` bytes from `src` to `dst_virt`. Returns an error at the
    /// first byte that either falls outside the flat buffer
    /// (`AdrOutOfRange`) or is not writable (`NoPerm`); bytes already
    /// written before the faulting byte remain written and dirtied.
    pub fn write(&mut self, dst_virt: VirtAddr, src: &[u8]) -> Result<(), Error> {
        for (i, &byte) in src.iter().enumerate() {
            let virt = VirtAddr(*dst_virt + i);
            let mapped = self.virt_to_mapped(virt);

            if mapped >= self.size {
                return Err(Error::AdrOutOfRange { addr: virt, size: src.len() - i });
            }

            let perm = self.perms[mapped];
            if *perm & PERM_WRITE == 0 {
                return Err(Error::NoPerm { addr: virt, size: src.len() - i });
            }

            self.memory[mapped] = byte;

            if *perm & PERM_RAW != 0 {
                self.perms[mapped] = Perm((*perm | PERM_READ) & !PERM_RAW);
            }

            self.journal.make_dirty(mapped);
        }

        Ok(())
    }

    /// Copies `n = dst.len()` bytes starting at `src_virt` into `dst`.
    /// Returns an error at the first byte that either falls outside the
    /// flat buffer (`AdrOutOfRange`) or is not readable (`NoPerm`, which
    /// also covers memory still tainted `RAW`); bytes already copied before
    /// the faulting byte remain in `dst`.
    pub fn read(&self, src_virt: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        let n = dst.len();
        for (i, slot) in dst.iter_mut().enumerate() {
            let virt = VirtAddr(*src_virt + i);
            let mapped = self.virt_to_mapped(virt);

            if mapped >= self.size {
                return Err(Error::AdrOutOfRange { addr: virt, size: n - i });
            }

            let perm = self.perms[mapped];
            if *perm & PERM_READ == 0 {
                return Err(Error::NoPerm { addr: virt, size: n - i });
            }

            *slot = self.memory[mapped];
        }

        Ok(())
    }

    /// Fetches `dst.len()` instruction bytes starting at `src_virt`,
    /// checking the `EXEC` permission bit rather than `READ` (executable
    /// memory need not be readable, and `RAW` taint does not apply to code).
    /// Same byte-by-byte, partial-fill-on-error semantics as `read`.
    pub fn fetch(&self, src_virt: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        let n = dst.len();
        for (i, slot) in dst.iter_mut().enumerate() {
            let virt = VirtAddr(*src_virt + i);
            let mapped = self.virt_to_mapped(virt);

            if mapped >= self.size {
                return Err(Error::AdrOutOfRange { addr: virt, size: n - i });
            }

            let perm = self.perms[mapped];
            if *perm & PERM_EXEC == 0 {
                return Err(Error::NoPerm { addr: virt, size: n - i });
            }

            *slot = self.memory[mapped];
        }

        Ok(())
    }

    /// Writes `src` to `dst_virt`, bypassing permission checks. Used by the
    /// ELF loader to place segment bytes directly, before the segment's
    /// declared permissions are applied.
    pub fn poke(&mut self, dst_virt: VirtAddr, src: &[u8]) -> Result<(), Error> {
        for (i, &byte) in src.iter().enumerate() {
            let virt = VirtAddr(*dst_virt + i);
            let mapped = self.virt_to_mapped(virt);
            if mapped >= self.size {
                return Err(Error::AdrOutOfRange { addr: virt, size: src.len() - i });
            }
            self.memory[mapped] = byte;
            self.journal.make_dirty(mapped);
        }
        Ok(())
    }

    /// Linearly scans guest memory, reading `size_letter`-sized
    /// little-endian unsigned integers at every offset, and returns every
    /// offset where the value equals `needle`. Debug-only; not on a hot
    /// path.
    pub fn search(&self, needle: u64, size_letter: SizeLetter) -> Vec<usize> {
        let width = size_letter.nb_bytes();
        let mut hits = Vec::new();

        if self.memory.len() < width {
            return hits;
        }

        for offset in 0..=(self.memory.len() - width) {
            let value = read_le(&self.memory[offset..offset + width]);
            if value == needle {
                hits.push(offset);
            }
        }

        hits
    }

    /// Pretty-prints `range` elements of `size_letter` bytes starting at
    /// `start_virt`.
    pub fn print(&self, start_virt: VirtAddr, range: usize, size_letter: SizeLetter) {
        let width = size_letter.nb_bytes();
        let mapped = self.virt_to_mapped(start_virt);

        for i in 0..range {
            let offset = mapped + i * width;
            if offset + width > self.memory.len() {
                break;
            }
            let value = read_le(&self.memory[offset..offset + width]);
            println!("{:#x}: {:#0width$x}", *start_virt + i * width, value, width = width * 2 + 2);
        }
    }
}

fn read_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as u64) << (8 * i);
    }
    value
}
