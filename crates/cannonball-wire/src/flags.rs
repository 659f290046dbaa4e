//! The event flag word.
//!
//! A single 32-bit bitset does double duty: the plugin's global *request
//! mask* records which event classes the user asked for, and each event
//! record carries the subset of bits its callbacks have produced.  The
//! correlation hot path then reduces to integer masking.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Request and progress bits for a traced event.
    ///
    /// `PC`, `READS_WRITES`, `INSTRS`, `SYSCALLS` and `BRANCHES` are the
    /// request bits; they are also used as kind bits on individual
    /// records.  `EXECUTED`, `FINISHED` and `LOAD` are markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EventFlags: u32 {
        /// Trace the program counter of executed instructions.
        const PC           = 0b0_0000_0001;
        /// Trace memory reads and writes.  A single bit covers both
        /// directions; the access payload carries the discriminator.
        const READS_WRITES = 0b0_0000_0010;
        /// Trace instruction opcode bytes.
        const INSTRS       = 0b0_0000_1000;
        /// Trace syscall entry/return pairs.
        const SYSCALLS     = 0b0_0001_0000;
        /// Trace only block-terminating instructions.
        const BRANCHES     = 0b0_0010_0000;
        /// Marker: the instruction behind this event has executed.
        const EXECUTED     = 0b0_0100_0000;
        /// Marker: reserved for end-of-stream signalling.
        const FINISHED     = 0b0_1000_0000;
        /// Marker: program-image description event.
        const LOAD         = 0b1_0000_0000;
    }
}

impl EventFlags {
    /// The four instruction-class request bits (everything that causes
    /// per-instruction instrumentation at translation time).
    pub const INSN_CLASSES: EventFlags = EventFlags::PC
        .union(EventFlags::READS_WRITES)
        .union(EventFlags::INSTRS)
        .union(EventFlags::BRANCHES);

    /// Build a request mask from the user's per-class switches.
    ///
    /// Reads and writes share one bit: either switch enables both
    /// directions of memory tracing.
    pub fn from_requests(
        pc: bool,
        reads_writes: bool,
        instrs: bool,
        syscalls: bool,
        branches: bool,
    ) -> Self {
        let mut flags = EventFlags::default();
        if pc {
            flags |= EventFlags::PC;
        }
        if reads_writes {
            flags |= EventFlags::READS_WRITES;
        }
        if instrs {
            flags |= EventFlags::INSTRS;
        }
        if syscalls {
            flags |= EventFlags::SYSCALLS;
        }
        if branches {
            flags |= EventFlags::BRANCHES;
        }
        flags
    }

    /// Whether `progress` satisfies `request`.
    ///
    /// Syscall completion is signalled by the return callback rather
    /// than by bit accumulation, so `SYSCALLS` is masked out of the
    /// comparison on both sides.
    pub fn ready(request: EventFlags, progress: EventFlags) -> bool {
        (request - EventFlags::SYSCALLS) == (progress - EventFlags::SYSCALLS)
    }

    /// Whether `BRANCHES` is the only instruction-class bit requested.
    ///
    /// In that configuration only the last instruction of each
    /// translation block needs instrumenting.
    pub fn is_branch_only(self) -> bool {
        self.intersection(EventFlags::INSN_CLASSES) == EventFlags::BRANCHES
    }

    /// Whether any instruction-class bit is requested at all.  When this
    /// is false the translation hook is never registered.
    pub fn wants_instrumentation(self) -> bool {
        self.intersects(EventFlags::INSN_CLASSES)
    }
}
