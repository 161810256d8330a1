//! The inbound flush loop: a buffered, backpressure-aware delivery path
//! from the decrypting side to the application (spec.md §4.6).
//!
//! The coalescing "flusher token" itself (spec.md §2, GLOSSARY) is
//! realized by `Connection`/`Context` as a plain dirty flag rather than
//! a distinct handle: `Context::schedule_flush` inserts a `ConnId` into a
//! `HashSet`, so any number of schedules between engine-loop turns
//! collapse into a single `flush_once` call, matching the "coalescing"
//! behavior spec.md requires.

use crate::engine::callbacks::{DataCb, DataEvent};

use super::inbound::InboundBuffer;

/// Bytes delivered to `data_cb` per invocation (spec.md §4.6).
pub const FLUSH_CHUNK: usize = 16 * 1024;

/// Outcome of one `flush_once` call, telling the caller whether to
/// reschedule (backpressure) or that delivery drained as far as it can
/// go for now.
#[derive(Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// The buffer is empty (and not at FIN) or FIN+EOF was already
    /// delivered; nothing more to do until new bytes arrive.
    Drained,
    /// `EOF` was just delivered for the first and only time.
    EofDelivered,
    /// `data_cb` signalled backpressure; the caller already
    /// re-queued the unconsumed suffix and must reschedule a flush.
    Backpressure,
}

/// Runs one flush pass per spec.md §4.6.
///
/// `eof_delivered` must be toggled on `EofDelivered` by the caller so a
/// later, spurious reschedule cannot redeliver `EOF` (property 5: "...
/// and never again").
pub fn flush_once(
    inbound: &mut InboundBuffer,
    fin_recv: bool,
    eof_delivered: bool,
    data_cb: &mut DataCb,
) -> FlushOutcome {
    if fin_recv && inbound.is_empty() {
        if eof_delivered {
            return FlushOutcome::Drained;
        }
        data_cb(DataEvent::Eof);
        return FlushOutcome::EofDelivered;
    }

    while !inbound.is_empty() {
        let chunk = inbound.pop_chunk(FLUSH_CHUNK);
        let len = chunk.len() as i64;
        let consumed = data_cb(DataEvent::Chunk(&chunk));

        if consumed < 0 {
            // The application signalled an error processing this chunk.
            // We still try to surface any remaining buffered bytes
            // rather than discarding them silently (spec.md §4.6).
            log::warn!("data_cb reported error {} while flushing", consumed);
            continue;
        }

        if (consumed as usize) < chunk.len() {
            let (_, unconsumed) = chunk.split_at(consumed as usize);
            inbound.push_front_unconsumed(unconsumed);
            return FlushOutcome::Backpressure;
        }

        debug_assert_eq!(consumed, len);
    }

    FlushOutcome::Drained
}
