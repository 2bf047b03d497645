//! Config history controller: discovers tracked kinds, watches them and
//! forwards their changes to the history store.

#![forbid(unsafe_code)]

pub mod discovery;
pub mod queue;
pub mod watches;

pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryLoop, SyncKey, SyncReport};
pub use queue::{RateLimit, WorkQueue};
pub use watches::{Classifier, WatchManager, WatchedKind};
