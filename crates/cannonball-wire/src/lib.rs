//! Shared wire definitions for the cannonball tracer.
//!
//! This crate is the single source of truth for everything that crosses
//! the plugin ↔ consumer socket: the event flag word, the typed event
//! payloads, and the length-prefixed frame encoding.  The plugin side
//! (`cannonball-core`) encodes with it, the consumer side
//! (`cannonball-tools`) decodes with it, and neither defines wire
//! knowledge of its own.
//!
//! # Stream layout
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────┐
//! │ u32 length │ frame body                               │
//! │ (big end.) │  u32 flags │ u8 tag │ fixed payload ...  │
//! └────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Frames are self-delimiting and fixed-size per tag, so a consumer can
//! reassemble the stream from arbitrary read boundaries.

pub mod codec;
pub mod event;
pub mod flags;

pub use codec::{decode_record, encode_record, CodecError};
pub use event::{
    EventKind, EventRecord, InstrEvent, LoadEvent, MemAccessEvent, PcEvent, SyscallEvent,
    MAX_OPCODE_SIZE, NUM_SYSCALL_ARGS,
};
pub use flags::EventFlags;
