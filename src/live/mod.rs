//! Live queries: re-execution on database change with listener dispatch.
//!
//! Each live query owns one worker thread while it has listeners. Store
//! writes only take the query's lock briefly and poke the worker; execution,
//! comparison and callbacks all happen on the worker.

/// Result-set equivalence used to suppress redundant notifications.
pub(crate) mod comparator;
/// State machine and worker loop.
pub(crate) mod controller;
/// Listener tokens and per-listener snapshots.
pub(crate) mod registry;
/// Pull-style subscription handle.
pub mod stream;

pub use controller::{LiveQueryStats, LiveState};
pub use registry::ListenerToken;
pub use stream::LiveQueryStream;

pub(crate) use controller::{LiveQueryController, LiveSource};
