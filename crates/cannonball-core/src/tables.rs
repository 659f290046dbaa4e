//! Concurrent scratch tables for in-flight events.
//!
//! The host fires the callbacks that complete an event in an order the
//! plugin does not control, from whichever worker thread is executing
//! the guest.  These tables park a partially-built record between
//! callbacks, keyed by the opaque token the host carries as callback
//! user-data.
//!
//! Three tables, three lifetimes:
//!
//! * translation table: events completed by a single execute callback
//! * memory table: events needing an execute *and* a memory callback,
//!   in either order
//! * syscall table: one slot per VCPU, filled at entry, drained at
//!   return
//!
//! Each table owns exactly one mutex and no operation ever holds two of
//! them; a thread holds at most one table lock at any time.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cannonball_wire::{EventKind, EventRecord};

use crate::error::CoreError;

/// Soft cap on scratch-table entries.  A healthy run stays far below
/// this; hitting it means callbacks stopped draining and we shed events
/// instead of growing without bound.
pub const DEFAULT_TABLE_CAPACITY: usize = 1 << 20;

/// Opaque identity of an in-flight event.
///
/// Minted densely by [`TokenMint`]; handed to the host as callback
/// user-data and used to recover the parked record.  Never a pointer,
/// so the host can outlive the record without an aliasing hazard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(u64);

impl EventToken {
    /// The raw value crossing the host ABI as a user-data word.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a token from the host's user-data word.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for EventToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic token allocator shared by all tables.
#[derive(Debug)]
pub struct TokenMint {
    next: AtomicU64,
}

impl TokenMint {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn mint(&self) -> EventToken {
        EventToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenMint {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Translation table
// ═══════════════════════════════════════════════════════════════════════

/// Scratch storage for events that complete on their execute callback.
#[derive(Debug)]
pub struct TranslationTable {
    entries: Mutex<HashMap<EventToken, EventRecord>>,
    capacity: usize,
}

impl TranslationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Park a record under `token`.
    pub fn insert(&self, token: EventToken, record: EventRecord) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            return Err(CoreError::OutOfMemory);
        }
        entries.insert(token, record);
        Ok(())
    }

    /// Detach the record under `token`, if any.  Absence means the
    /// event was already claimed by a concurrent callback or never
    /// belonged to this table.
    pub fn remove(&self, token: EventToken) -> Option<EventRecord> {
        self.entries.lock().unwrap().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory table
// ═══════════════════════════════════════════════════════════════════════

/// Which side of a memory event has been observed so far.  The
/// completed state is never stored: the callback that completes the
/// entry removes it in the same critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemProgress {
    AwaitingBoth,
    ExecSeen,
    MemSeen,
}

#[derive(Debug)]
struct MemEntry {
    event: EventRecord,
    progress: MemProgress,
}

/// Scratch storage for memory events, which need an execute callback
/// and a memory-access callback in either order.
#[derive(Debug)]
pub struct MemoryTable {
    entries: Mutex<HashMap<EventToken, MemEntry>>,
    capacity: usize,
}

impl MemoryTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Park a memory record under `token` with neither side seen.
    pub fn insert(&self, token: EventToken, event: EventRecord) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            return Err(CoreError::OutOfMemory);
        }
        entries.insert(
            token,
            MemEntry {
                event,
                progress: MemProgress::AwaitingBoth,
            },
        );
        Ok(())
    }

    /// Record that the instruction behind `token` executed.  Returns
    /// the completed event if the memory side was already seen.
    pub fn observe_exec(&self, token: EventToken) -> Option<EventRecord> {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(token) {
            Entry::Occupied(mut occupied) => match occupied.get().progress {
                MemProgress::MemSeen => Some(occupied.remove().event),
                MemProgress::AwaitingBoth => {
                    occupied.get_mut().progress = MemProgress::ExecSeen;
                    None
                }
                // Duplicate execute callback; keep waiting for the
                // access.
                MemProgress::ExecSeen => None,
            },
            Entry::Vacant(_) => None,
        }
    }

    /// Record the memory access behind `token`, filling in the address
    /// and direction.  Returns the completed event if the execute side
    /// was already seen.
    pub fn observe_access(
        &self,
        token: EventToken,
        addr: u64,
        is_write: bool,
    ) -> Option<EventRecord> {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(token) {
            Entry::Occupied(mut occupied) => {
                if let EventKind::MemAccess(mem) = &mut occupied.get_mut().event.kind {
                    mem.addr = addr;
                    mem.is_write = is_write;
                }
                match occupied.get().progress {
                    MemProgress::ExecSeen => Some(occupied.remove().event),
                    MemProgress::AwaitingBoth => {
                        occupied.get_mut().progress = MemProgress::MemSeen;
                        None
                    }
                    // An instruction can touch memory more than once;
                    // the last access before the execute callback wins.
                    MemProgress::MemSeen => None,
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Syscall table
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of parking a syscall entry.
#[derive(Debug)]
pub enum SyscallPut {
    Parked,
    /// A prior entry for the VCPU was still pending and has been
    /// evicted.
    Evicted(EventRecord),
    /// The VCPU index is outside the host-declared bound.
    VcpuOutOfRange,
}

/// Outcome of draining a syscall slot at return.
#[derive(Debug)]
pub enum SyscallTake {
    Matched(EventRecord),
    /// The slot held a different syscall number; the stale entry has
    /// been dropped.
    Mismatch { stored_num: i64 },
    Empty,
}

/// One pending syscall per VCPU, as a fixed slot array: the "at most
/// one in-flight syscall per VCPU" rule is structural, and lookups are
/// an index, not a hash.
#[derive(Debug)]
pub struct SyscallTable {
    slots: Mutex<Box<[Option<EventRecord>]>>,
}

impl SyscallTable {
    pub fn new(max_vcpus: usize) -> Self {
        let slots = vec![None; max_vcpus.max(1)];
        Self {
            slots: Mutex::new(slots.into_boxed_slice()),
        }
    }

    /// Park `record` in the VCPU's slot, evicting any prior entry.
    pub fn put(&self, vcpu: u32, record: EventRecord) -> SyscallPut {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(vcpu as usize) else {
            return SyscallPut::VcpuOutOfRange;
        };
        match slot.replace(record) {
            Some(prior) => SyscallPut::Evicted(prior),
            None => SyscallPut::Parked,
        }
    }

    /// Drain the VCPU's slot.  The slot is emptied regardless of
    /// outcome; a number mismatch means the entry was stale.
    pub fn take(&self, vcpu: u32, expected_num: i64) -> SyscallTake {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(vcpu as usize) else {
            return SyscallTake::Empty;
        };
        match slot.take() {
            Some(record) => match record.kind {
                EventKind::Syscall(sys) if sys.num == expected_num => {
                    SyscallTake::Matched(record)
                }
                EventKind::Syscall(sys) => SyscallTake::Mismatch {
                    stored_num: sys.num,
                },
                _ => SyscallTake::Empty,
            },
            None => SyscallTake::Empty,
        }
    }

    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}
