//! Length-prefixed frame encoding for event records.
//!
//! Each record becomes one frame: a big-endian `u32` body length,
//! followed by the flag word, the kind tag, and the fixed-layout
//! payload for that tag.  All integers are big-endian.  Because every
//! tag has a fixed payload size, a frame whose declared length
//! disagrees with its tag is rejected outright.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::event::{
    EventKind, EventRecord, InstrEvent, LoadEvent, MemAccessEvent, PcEvent, SyscallEvent,
    MAX_OPCODE_SIZE, NUM_SYSCALL_ARGS,
};
use crate::flags::EventFlags;

/// Bytes of frame body shared by every tag: flag word plus kind tag.
const BODY_HEADER_LEN: usize = 5;

/// Errors from frame decoding.  The stream is not recoverable after an
/// error; the consumer should drop the connection.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown event tag: {0:#x}")]
    UnknownTag(u8),

    #[error("Frame length {got} does not match tag {tag:#x} (expected {expected})")]
    BadLength { tag: u8, got: usize, expected: usize },

    #[error("Frame body shorter than its header ({0} bytes)")]
    TruncatedBody(usize),
}

fn payload_len(tag: u8) -> Option<usize> {
    match tag {
        // min + max + entry + prot
        0 => Some(8 + 8 + 8 + 1),
        // pc + branch
        1 => Some(8 + 1),
        // pc + opcode buffer + opcode_len
        2 => Some(8 + MAX_OPCODE_SIZE + 1),
        // pc + addr + is_write
        3 => Some(8 + 8 + 1),
        // num + rv + args
        4 => Some(8 + 8 + 8 * NUM_SYSCALL_ARGS),
        _ => None,
    }
}

/// Append one record to `dst` as a complete frame.
pub fn encode_record(record: &EventRecord, dst: &mut BytesMut) {
    let tag = record.kind.tag();
    // payload_len is total for every tag we can construct
    let body_len = BODY_HEADER_LEN + payload_len(tag).unwrap_or(0);

    dst.reserve(4 + body_len);
    dst.put_u32(body_len as u32);
    dst.put_u32(record.flags.bits());
    dst.put_u8(tag);

    match &record.kind {
        EventKind::Load(load) => {
            dst.put_u64(load.min);
            dst.put_u64(load.max);
            dst.put_u64(load.entry);
            dst.put_u8(load.prot);
        }
        EventKind::Pc(pc) => {
            dst.put_u64(pc.pc);
            dst.put_u8(pc.branch as u8);
        }
        EventKind::Instr(instr) => {
            dst.put_u64(instr.pc);
            dst.put_slice(&instr.opcode);
            dst.put_u8(instr.opcode_len);
        }
        EventKind::MemAccess(mem) => {
            dst.put_u64(mem.pc);
            dst.put_u64(mem.addr);
            dst.put_u8(mem.is_write as u8);
        }
        EventKind::Syscall(sys) => {
            dst.put_i64(sys.num);
            dst.put_i64(sys.rv);
            for arg in sys.args.iter() {
                dst.put_u64(*arg);
            }
        }
    }
}

/// Decode one record from `src` if a complete frame is buffered.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is left
/// untouched in that case so the caller can keep appending reads.
pub fn decode_record(src: &mut BytesMut) -> Result<Option<EventRecord>, CodecError> {
    if src.len() < 4 {
        return Ok(None);
    }

    let mut header = [0u8; 4];
    header.copy_from_slice(&src[..4]);
    let body_len = u32::from_be_bytes(header) as usize;

    if src.len() < 4 + body_len {
        return Ok(None);
    }

    if body_len < BODY_HEADER_LEN {
        return Err(CodecError::TruncatedBody(body_len));
    }

    src.advance(4);
    let flags = EventFlags::from_bits_truncate(src.get_u32());
    let tag = src.get_u8();

    let expected = payload_len(tag).ok_or(CodecError::UnknownTag(tag))?;
    if body_len != BODY_HEADER_LEN + expected {
        return Err(CodecError::BadLength {
            tag,
            got: body_len,
            expected: BODY_HEADER_LEN + expected,
        });
    }

    let kind = match tag {
        0 => EventKind::Load(LoadEvent {
            min: src.get_u64(),
            max: src.get_u64(),
            entry: src.get_u64(),
            prot: src.get_u8(),
        }),
        1 => EventKind::Pc(PcEvent {
            pc: src.get_u64(),
            branch: src.get_u8() != 0,
        }),
        2 => {
            let pc = src.get_u64();
            let mut opcode = [0u8; MAX_OPCODE_SIZE];
            src.copy_to_slice(&mut opcode);
            let opcode_len = src.get_u8();
            EventKind::Instr(InstrEvent {
                pc,
                opcode,
                opcode_len,
            })
        }
        3 => EventKind::MemAccess(MemAccessEvent {
            pc: src.get_u64(),
            addr: src.get_u64(),
            is_write: src.get_u8() != 0,
        }),
        4 => {
            let num = src.get_i64();
            let rv = src.get_i64();
            let mut args = [0u64; NUM_SYSCALL_ARGS];
            for arg in args.iter_mut() {
                *arg = src.get_u64();
            }
            EventKind::Syscall(SyscallEvent { num, rv, args })
        }
        _ => unreachable!("tag validated above"),
    };

    Ok(Some(EventRecord { flags, kind }))
}
