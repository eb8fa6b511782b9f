//! Delay-tolerant store-and-forward
//!
//! When no direct path to a peer exists, sealed sync payloads travel as
//! [`Bundle`]s carried by whoever happens to meet. The [`BundleRouter`]
//! decides what to hand each contact and what to keep when space runs out.

mod bundle;
mod router;
mod store;

pub use bundle::{Bundle, BundleId, Priority, BUNDLE_VERSION};
pub use router::{AcceptOutcome, BundleRouter, DropReason};
pub use store::{BundleStore, StoreLimits};
