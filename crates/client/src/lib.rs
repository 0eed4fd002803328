//! Shares one connection to a remote peer between many tabs of a user.
//!
//! Tabs talk to each other only through a shared key-value store. They elect
//! a single leader that drives the sync node, mirror its connection state,
//! and replay each other's log changes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broadcast;
mod client;
mod config;
mod election;
mod error;
mod keys;
mod liveness;
mod mirror;
mod tab;

pub use broadcast::BroadcastChannel;
pub use client::{ClientEvent, CrossTabClient};
pub use config::{
    ANONYMOUS_SCOPE, Clock, CrossTabConfig, DEFAULT_PREFIX, SystemClock, TokioClock,
};
pub use election::{LeaderRecord, Role};
pub use error::{Error, Result};
pub use keys::StorageKeys;
pub use liveness::{TAB_REASON_PREFIX, reason_owner, tab_reason};
pub use mirror::{MutationRecord, SUBSCRIBE_TYPE, is_subscription};
