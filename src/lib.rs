//! Shell Bridge — interactive SSH terminals for a VPS control panel
//!
//! Browser terminals connect to the gateway over WebSocket; the gateway binds
//! each connection to a shared, per-(server, user) SSH shell owned by the
//! session registry. The `client` module is the terminal-side adapter.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod ssh;
pub mod terminal;

pub use error::{ConnectError, ErrorCategory};
pub use registry::{SessionKey, SessionRegistry};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
