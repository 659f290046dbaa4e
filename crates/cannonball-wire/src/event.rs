//! Typed trace events.
//!
//! One [`EventRecord`] describes one observed guest event: the flag word
//! naming what it is, plus exactly one class-specific payload.  Records
//! are what the plugin parks in its scratch tables, what crosses the
//! socket, and what the consumer tooling prints.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flags::EventFlags;

/// Maximum opcode length carried on the wire.  Sized for x86_64, which
/// has the longest encoding of any target we trace.
pub const MAX_OPCODE_SIZE: usize = 16;

/// Number of syscall argument words captured at syscall entry.
pub const NUM_SYSCALL_ARGS: usize = 8;

// ═══════════════════════════════════════════════════════════════════════
//  Payloads
// ═══════════════════════════════════════════════════════════════════════

/// Program-image description, emitted once per run before any other
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEvent {
    /// Lowest mapped virtual address of the program image.
    pub min: u64,
    /// Highest mapped virtual address of the program image.
    pub max: u64,
    /// Entry point virtual address.
    pub entry: u64,
    /// Protection bits of the image mapping.
    pub prot: u8,
}

/// Program counter of one executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcEvent {
    pub pc: u64,
    /// Whether this instruction terminates its translation block.
    pub branch: bool,
}

/// Opcode bytes of one executed instruction.
///
/// Disassembly is deliberately left to consumers: doing it in-process
/// would bottleneck the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrEvent {
    pub pc: u64,
    /// Raw opcode bytes; only the first `opcode_len` are meaningful.
    pub opcode: [u8; MAX_OPCODE_SIZE],
    pub opcode_len: u8,
}

impl InstrEvent {
    /// Build from the instruction bytes the host exposes, truncating at
    /// [`MAX_OPCODE_SIZE`].
    pub fn new(pc: u64, data: &[u8]) -> Self {
        let len = data.len().min(MAX_OPCODE_SIZE);
        let mut opcode = [0u8; MAX_OPCODE_SIZE];
        opcode[..len].copy_from_slice(&data[..len]);
        Self {
            pc,
            opcode,
            opcode_len: len as u8,
        }
    }

    /// The meaningful prefix of the opcode buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.opcode[..self.opcode_len as usize]
    }
}

/// One memory access performed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccessEvent {
    /// Program counter of the accessing instruction.
    pub pc: u64,
    /// Virtual address touched by the access.
    pub addr: u64,
    pub is_write: bool,
}

/// One completed syscall (entry arguments plus return value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallEvent {
    pub num: i64,
    /// Return value; `-1` until the return callback stamps it.
    pub rv: i64,
    /// Argument words as captured at entry.  Pointed-to memory is not
    /// captured.
    pub args: [u64; NUM_SYSCALL_ARGS],
}

// ═══════════════════════════════════════════════════════════════════════
//  Record
// ═══════════════════════════════════════════════════════════════════════

/// The payload half of a record, tagged by event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Load(LoadEvent),
    Pc(PcEvent),
    Instr(InstrEvent),
    MemAccess(MemAccessEvent),
    Syscall(SyscallEvent),
}

impl EventKind {
    /// Stable one-byte wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            EventKind::Load(_) => 0,
            EventKind::Pc(_) => 1,
            EventKind::Instr(_) => 2,
            EventKind::MemAccess(_) => 3,
            EventKind::Syscall(_) => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Load(_) => "load",
            EventKind::Pc(_) => "pc",
            EventKind::Instr(_) => "instr",
            EventKind::MemAccess(_) => "mem_access",
            EventKind::Syscall(_) => "syscall",
        }
    }
}

/// A single trace event: flag word plus tagged payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub flags: EventFlags,
    pub kind: EventKind,
}

impl EventRecord {
    pub fn load(min: u64, max: u64, entry: u64, prot: u8) -> Self {
        Self {
            flags: EventFlags::LOAD,
            kind: EventKind::Load(LoadEvent {
                min,
                max,
                entry,
                prot,
            }),
        }
    }

    pub fn pc(pc: u64, branch: bool) -> Self {
        Self {
            flags: EventFlags::PC,
            kind: EventKind::Pc(PcEvent { pc, branch }),
        }
    }

    pub fn instr(pc: u64, data: &[u8]) -> Self {
        Self {
            flags: EventFlags::INSTRS,
            kind: EventKind::Instr(InstrEvent::new(pc, data)),
        }
    }

    pub fn mem_access(pc: u64, addr: u64, is_write: bool) -> Self {
        Self {
            flags: EventFlags::READS_WRITES,
            kind: EventKind::MemAccess(MemAccessEvent { pc, addr, is_write }),
        }
    }

    pub fn syscall(num: i64, args: [u64; NUM_SYSCALL_ARGS]) -> Self {
        Self {
            flags: EventFlags::SYSCALLS,
            kind: EventKind::Syscall(SyscallEvent { num, rv: -1, args }),
        }
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Load(load) => write!(
                f,
                "LOAD  min={:#x} max={:#x} entry={:#x} prot={:#o}",
                load.min, load.max, load.entry, load.prot,
            ),
            EventKind::Pc(pc) => {
                write!(f, "PC    pc={:#x} branch={}", pc.pc, pc.branch)
            }
            EventKind::Instr(instr) => {
                write!(f, "INSN  pc={:#x} opcode=", instr.pc)?;
                for byte in instr.bytes() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            EventKind::MemAccess(mem) => write!(
                f,
                "MEM   {} pc={:#x} addr={:#x}",
                if mem.is_write { "W" } else { "R" },
                mem.pc,
                mem.addr,
            ),
            EventKind::Syscall(sys) => write!(
                f,
                "SYS   num={} rv={} args={:x?}",
                sys.num, sys.rv, sys.args,
            ),
        }
    }
}
