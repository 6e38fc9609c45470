//! Vigil controller: the level-triggered reconciliation engine.
//!
//! ```text
//! change stream -> cache (vigil-store) -> bridge -> work queue -> workers -> sync -> remote write
//! ```
//!
//! The sync function always re-reads the cache instead of trusting event payloads, and the work
//! queue never hands the same key to two workers, so duplicate and out-of-order notifications are
//! harmless.

#![forbid(unsafe_code)]

mod bridge;
mod controller;
mod error;
pub mod policy;
mod sync;
mod worker;

#[cfg(test)]
mod testing;

pub use bridge::NotificationBridge;
pub use controller::{Controller, ControllerConfig};
pub use error::{ControllerError, SyncError, SyncOutcome};
pub use policy::{AnnotationLabelPolicy, Correction, Policy};
pub use sync::Reconciler;
pub use worker::{process_next, run_worker, ItemOutcome};
