//! Namespace Observer
//!
//! Keeps a local snapshot of one namespace eventually consistent with the
//! coordination store:
//! 1. Full prefix read at store revision R
//! 2. Snapshot built from the read
//! 3. Prefix watch from R + 1, so no change between read and watch is lost
//! 4. Each watch batch applied in delivery order and published atomically
//! 5. On any failure: fixed backoff, then back to step 1
//!
//! Readers get the current snapshot without locking and can block until the
//! next publication through an [`ObserverSession`].

mod client;
mod session;

pub use client::ObserverClient;
pub use session::{MembershipWatcher, ObserverSession};
