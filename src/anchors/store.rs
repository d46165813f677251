//! Copy-on-write store of user-approved trust anchors.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, info};

use super::TrustAnchor;

/// An immutable, point-in-time view of the store.
///
/// Dereferences to the anchors in first-insertion order.
#[derive(Debug, Default)]
pub struct AnchorSet {
    version: u64,
    anchors: Vec<TrustAnchor>,
}

impl AnchorSet {
    /// Returns the store version this set was published at.
    ///
    /// Version 0 is the empty store; every insertion bumps it by one.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Deref for AnchorSet {
    type Target = [TrustAnchor];

    fn deref(&self) -> &Self::Target {
        &self.anchors
    }
}

/// Change notification published after each insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreChange {
    /// Version of the set that is now current.
    pub version: u64,
    /// Number of anchors in that set.
    pub len: usize,
}

/// Shared, observable, ordered set of trust anchors.
///
/// Readers load the current [`AnchorSet`] without locking. Writers are
/// serialized, build a new set and publish it with a single pointer swap, so a
/// reader sees either the old or the new set in full.
pub struct TrustAnchorStore {
    current: ArcSwap<AnchorSet>,
    /// Serializes writers so the duplicate check and the swap are one step.
    writer: Mutex<()>,
    changes: watch::Sender<StoreChange>,
}

impl TrustAnchorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(StoreChange::default());
        Self {
            current: ArcSwap::from_pointee(AnchorSet::default()),
            writer: Mutex::new(()),
            changes,
        }
    }

    /// Appends an anchor unless a byte-identical one is already present.
    ///
    /// Returns `true` if the anchor was inserted. Subscribers are notified
    /// only after the new set is visible to [`snapshot`](Self::snapshot).
    pub fn add(&self, anchor: TrustAnchor) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current.load_full();
        if current.contains(&anchor) {
            debug!("trust anchor {} already present", anchor);
            return false;
        }

        let mut anchors = Vec::with_capacity(current.len() + 1);
        anchors.extend_from_slice(&current);
        anchors.push(anchor);
        let next = AnchorSet {
            version: current.version + 1,
            anchors,
        };
        let change = StoreChange {
            version: next.version,
            len: next.len(),
        };

        info!(
            "installed trust anchor {} (version {}, {} anchors)",
            next[next.len() - 1],
            change.version,
            change.len
        );

        self.current.store(Arc::new(next));
        // Still under the writer lock, so notifications go out in
        // version order.
        self.changes.send_replace(change);

        true
    }

    /// Returns the current anchors.
    ///
    /// Only a reference count is taken; the set itself is never copied.
    pub fn snapshot(&self) -> Arc<AnchorSet> {
        self.current.load_full()
    }

    /// Returns the current version without taking a snapshot.
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn contains(&self, anchor: &TrustAnchor) -> bool {
        self.current.load().contains(anchor)
    }

    /// Subscribes to change notifications.
    ///
    /// The receiver starts at the current state; `changed()` resolves on the
    /// next insertion.
    pub fn subscribe(&self) -> watch::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

impl Default for TrustAnchorStore {
    fn default() -> Self {
        Self::new()
    }
}
