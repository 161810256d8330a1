//! Tagged callback-kind types (spec.md §9: "replace [ad-hoc
//! polymorphism via callback + void context] with a tagged variant of
//! callback kinds (`ConnCb`, `ListenCb`, `DataCb`, `WriteCb`,
//! `ClientCb`) carried by the appropriate owner").
//!
//! Each alias below is the Rust realization of one of those kinds: a
//! boxed closure carried by the `Connection`/`ConnectAttempt` that owns
//! it, rather than a C function pointer plus an untyped `ctx`.

use crate::engine::conn::Connection;
use crate::engine::error::Error;

/// One chunk, or the terminal EOF/error event, delivered to a
/// connection's `data_cb` (spec.md §4.6, §7).
pub enum DataEvent<'a> {
    /// A chunk of up to 16 KiB of decrypted inbound bytes.
    Chunk(&'a [u8]),
    /// The peer has half-closed and all buffered bytes have been
    /// delivered (spec.md §4.6, property 5).
    Eof,
    /// A fatal error terminated the read path (spec.md §7).
    Error(Error),
}

/// `data_cb(conn, buf, len) -> consumed`. Only the `Chunk` case's return
/// value is consulted (spec.md §4.6); it is ignored for `Eof`/`Error`.
pub type DataCb = Box<dyn FnMut(DataEvent<'_>) -> i64 + Send + 'static>;

/// `conn_cb(conn, status)`, invoked exactly once to resolve a `dial`,
/// `accept`, or the dial leg of `bind`'s peer handshake.
pub type ConnCb = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// `listen_cb(conn, status)`, invoked exactly once to resolve a `bind`.
pub type ListenCb = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// `client_cb(parent, child)`, invoked once per inbound dial against a
/// bound connection, handing the application a fresh child `Connection`
/// to `accept()`.
pub type ClientCb = Box<dyn FnMut(Connection) + Send + 'static>;

/// `write_cb(conn, status, ctx)`; `status` is bytes written on success.
pub type WriteCb = Box<dyn FnOnce(Result<usize, Error>) + Send + 'static>;
