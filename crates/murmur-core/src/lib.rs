//! The event-driven core of the murmur chat server.
//!
//! One reactor thread demultiplexes socket readiness with `mio`; a fixed
//! worker pool runs the per-connection protocol state machines; a registry
//! tracks live sessions and name ownership; broadcasts fan out through
//! per-recipient write queues drained on writable events.

pub mod auth;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod session;

mod error;

pub use error::{DisconnectReason, StartupError};
pub use server::{ChatServer, ServerConfig};

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the guard if a panicking task poisoned it.
/// Worker panics are caught and logged; the data they guarded stays usable.
pub(crate) fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
