//! Shared queue multiplexers.
//!
//! When a port runs more sessions than hardware queues, sessions contend
//! for a small fixed queue set. [`shared`] implements the shared TX queue
//! (TSQ) and shared RX queue (RSQ) fan-in/out; [`srss`] funnels many
//! RSS-bucketed queues into a configurable number of classifier workers.

pub mod shared;
pub mod srss;

pub use shared::{RsqEntry, RsqManager, TsqEntry, TsqManager};
pub use srss::{SrssEntry, SrssManager};
