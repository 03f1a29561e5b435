//! Incounter: a vertex's join counter, backed by a GSNZI tree.

use pulse_utils_sync::gsnzi;

use crate::{scheduler, vertex::VertexCore};

/// Handle to the tree node a particular edge increments; the matching
/// decrement must go through the same handle.
pub type Handle = gsnzi::Handle;

/// Counts the in-edges of one vertex and releases it at zero.
pub struct Incounter {
    tree: gsnzi::Tree,
}

impl Incounter {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Incounter { tree: gsnzi::Tree::new() }
    }

    /// Registers one in-edge, routed by `key` (typically the source's
    /// address) to spread contention across the tree's leaves.
    pub fn increment(&self, key: usize) -> Handle {
        self.tree.increment(gsnzi::hash_path(key))
    }

    /// Removes the in-edge behind `handle`; if this was the last one, the
    /// annotated vertex is released onto the current worker's frontier.
    pub fn decrement(handle: Handle) {
        // SAFETY: handles are only created by `increment` on incounters of
        // live vertices, and edge conservation decrements each exactly once.
        if let Some(annotation) = unsafe { gsnzi::Tree::decrement(handle) } {
            let core = annotation as *const VertexCore;
            // SAFETY: reaching zero confers ownership of the vertex; the
            // core outlives its incounter's last decrement.
            let v = unsafe { (*core).self_ref() };
            tracing::trace!(target: "pulse::sched", "incounter released a vertex");
            scheduler::schedule(v);
        }
    }

    /// Decrement without the release side effect; used when the caller will
    /// place the vertex somewhere itself.
    pub(crate) fn decrement_detached(handle: Handle) -> bool {
        // SAFETY: as for `decrement`.
        unsafe { gsnzi::Tree::decrement(handle) }.is_some()
    }

    pub fn is_nonzero(&self) -> bool {
        self.tree.is_nonzero()
    }

    pub(crate) fn annotate(&self, core: *const VertexCore) {
        self.tree.set_annotation(core as usize);
    }
}
