//! Batching event sender.
//!
//! The sender owns the outbound socket exclusively.  Submitted records
//! are encoded into a pending batch under the sender's own lock and the
//! batch goes out in a single write once it holds [`DEFAULT_BATCH_SIZE`]
//! records, amortizing the write syscall across the batch.  Teardown
//! flushes whatever is pending and closes the connection.
//!
//! A write error is terminal: the connection is dropped, subsequent
//! submits are discarded (and counted), and no reconnect is attempted.
//! Reconnect logic would put unbounded latency into instrumentation
//! callbacks, which stall guest execution while they run.

use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info};

use cannonball_wire::{encode_record, EventRecord};

use crate::error::CoreError;

/// Records per batch.  Empirically the balance between callback latency
/// and write syscall overhead for this class of tracer.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Delay between connection attempts while the consumer is not yet
/// listening.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(333);

/// Rough upper bound on an encoded frame, used to size the batch
/// buffer.
const FRAME_SIZE_HINT: usize = 96;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Records accepted into a batch.
    pub submitted: u64,
    /// Batches written to the socket (including partial batches flushed
    /// at teardown).
    pub batches_flushed: u64,
    /// Records discarded after the connection failed.
    pub dropped: u64,
}

#[derive(Debug)]
struct SenderInner {
    /// `None` once the connection has failed or been torn down.
    conn: Option<UnixStream>,
    /// Encoded frames of the pending batch.
    buf: BytesMut,
    /// Records in the pending batch.
    pending: usize,
    stats: SenderStats,
}

/// Write half of the plugin ↔ consumer socket.
///
/// All submissions funnel through one internal lock, so the batch
/// buffer has a single writer no matter how many host threads fire
/// callbacks concurrently.  Dropping the sender tears it down.
#[derive(Debug)]
pub struct Sender {
    batch_size: usize,
    inner: Mutex<SenderInner>,
}

impl Sender {
    /// Connect to the consumer listening at `path`.
    ///
    /// Blocks until the consumer is listening; install-time blocking is
    /// acceptable and the alternative is losing the head of the trace.
    /// Errors other than "nobody is listening yet" fail installation.
    pub fn connect(batch_size: usize, path: &str) -> Result<Self, CoreError> {
        let conn = loop {
            match UnixStream::connect(path) {
                Ok(conn) => break conn,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    debug!("Waiting for consumer at {}: {}", path, err);
                    sleep(CONNECT_RETRY_DELAY);
                }
                Err(err) => return Err(CoreError::SenderInit(err)),
            }
        };

        info!("Connected to consumer at {}", path);

        Ok(Self {
            batch_size: batch_size.max(1),
            inner: Mutex::new(SenderInner {
                conn: Some(conn),
                buf: BytesMut::with_capacity(batch_size.max(1) * FRAME_SIZE_HINT),
                pending: 0,
                stats: SenderStats::default(),
            }),
        })
    }

    /// Copy `record` into the pending batch, flushing if the batch is
    /// now full.  After a connection failure this is a counted no-op.
    pub fn submit(&self, record: &EventRecord) {
        let mut inner = self.inner.lock().unwrap();

        if inner.conn.is_none() {
            inner.stats.dropped += 1;
            return;
        }

        encode_record(record, &mut inner.buf);
        inner.pending += 1;
        inner.stats.submitted += 1;

        if inner.pending >= self.batch_size {
            Self::flush_locked(&mut inner);
        }
    }

    /// Flush the pending batch and close the connection.  Safe to call
    /// any number of times.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::flush_locked(&mut inner);
        if let Some(conn) = inner.conn.take() {
            let _ = conn.shutdown(Shutdown::Both);
            info!("Event sender torn down");
        }
    }

    pub fn stats(&self) -> SenderStats {
        self.inner.lock().unwrap().stats
    }

    /// Records currently waiting in the partial batch.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().conn.is_some()
    }

    fn flush_locked(inner: &mut SenderInner) {
        if inner.pending == 0 {
            inner.buf.clear();
            return;
        }

        let batch = inner.buf.split();
        inner.pending = 0;

        if let Some(conn) = inner.conn.as_mut() {
            // write_all retries partial writes until the batch is out
            // or the connection is dead.
            match conn.write_all(&batch) {
                Ok(()) => inner.stats.batches_flushed += 1,
                Err(err) => {
                    error!(
                        "Event stream write failed, discarding further events: {}",
                        err
                    );
                    inner.conn = None;
                }
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.teardown();
    }
}
