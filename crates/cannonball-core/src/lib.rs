//! In-process tracing core for the cannonball emulator plugin.
//!
//! The hosting emulator loads the plugin, hands it its options, and
//! from then on drives it entirely through callbacks: block
//! translation, instruction execution, memory accesses, syscall
//! entry/return, and VCPU exit.  This crate correlates those callbacks
//! into whole trace events and streams them to a consumer over a local
//! socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Host emulator (drives all control flow)     │
//! └───────┬──────────────────────────────────────┘
//!         │ callbacks via the boundary adapter (host::*)
//! ┌───────▼──────────────────────────────────────┐
//! │  Tracer (tracer::Tracer)                     │
//! │    request mask          (wire::EventFlags)  │
//! │    correlation tables    (tables::*)         │
//! │    batching sender       (sender::Sender)    │
//! └───────┬──────────────────────────────────────┘
//!         │ length-prefixed frames (cannonball-wire)
//! ┌───────▼──────────────────────────────────────┐
//! │  Consumer on the unix socket                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The adapter that implements [`host`]'s traits over the real plugin
//! ABI lives outside this crate; everything here is host-agnostic and
//! unit-testable.

pub mod error;
pub mod host;
pub mod logging;
pub mod options;
pub mod sender;
pub mod tables;
pub mod tracer;

pub use error::CoreError;
pub use host::{HostInfo, ImageInfo, ImageSource, InsnHook, Instruction, MemInfo, TranslationBlock};
pub use options::Options;
pub use sender::{Sender, SenderStats, DEFAULT_BATCH_SIZE};
pub use tables::EventToken;
pub use tracer::Tracer;
