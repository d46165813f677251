//! Trust anchors and the shared store that holds them.
//!
//! Anchors are added at runtime and read concurrently by every connection
//! performing trust evaluation.

mod certificate;
mod store;

pub use certificate::{AnchorError, AnchorResult, TrustAnchor};
pub use store::{AnchorSet, StoreChange, TrustAnchorStore};
