//! Outset: the bag of continuations waiting on a vertex's completion.

use std::{collections::VecDeque, ptr::NonNull, sync::Arc};

use pulse_utils_sync::{bag, gsnzi};

use crate::{
    incounter::{Handle, Incounter},
    scheduler,
    vertex::Fuel,
};

type Node = gsnzi::Node;
pub(crate) type ResidueList = VecDeque<NonNull<bag::TreeNode<Node>>>;

/// Concurrent set of incounter handles representing a vertex's out-edges.
///
/// Always handled through `Arc`: any party that may insert after the owning
/// vertex completed holds its own reference, so a racing insert fails
/// gracefully instead of touching freed memory. The overflow block tree
/// stays owned by the bag while drains walk it; whoever drops the last
/// reference deallocates it (piecewise, when it is large).
pub struct Outset {
    bag: bag::Bag<Node>,
}

impl Outset {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Outset { bag: bag::Bag::new() }
    }

    /// Registers `handle` for decrement at completion.
    ///
    /// Fails iff the outset is already sealed; the caller must then issue
    /// the decrement itself so the edge is not leaked.
    pub fn insert(&self, handle: Handle) -> bool {
        // Worker ids stay below `bag::MAX_WORKERS`; the scheduler caps its
        // worker count accordingly.
        scheduler::with_worker_id_and_rng(|worker_id, random_int| {
            self.bag.insert(handle, worker_id, random_int)
        })
    }

    /// Seals the outset, decrements every inline handle, and returns a
    /// cursor over the overflow tree, if one grew.
    pub(crate) fn seal(self: &Arc<Self>) -> Option<OutsetDrain> {
        let root = self.bag.seal(Incounter::decrement);
        root.map(|root| OutsetDrain { _outset: Arc::clone(self), cursor: bag::Drain::new(root) })
    }
}

impl Drop for Outset {
    fn drop(&mut self) {
        let Some(root) = self.bag.take_tree() else { return };
        let mut todo = ResidueList::new();
        todo.push_back(root);
        scheduler::deallocate_residue(todo);
    }
}

// DRAIN
// ================================================================================================

/// Owned, resumable drain over a sealed outset's overflow tree.
///
/// Holds a reference on the outset so the sealed blocks stay alive for the
/// whole drain, wherever the drain travels.
pub(crate) struct OutsetDrain {
    _outset: Arc<Outset>,
    cursor: bag::Drain<Node>,
}

impl OutsetDrain {
    pub fn is_done(&self) -> bool {
        self.cursor.is_done()
    }

    pub fn nb_strands(&self) -> usize {
        self.cursor.nb_strands()
    }

    /// Decrements up to `budget` registered handles.
    pub fn notify_nb(&mut self, budget: Fuel) {
        self.cursor.notify_nb(budget, Incounter::decrement);
    }

    /// Splits remaining drain work into a sibling: whole subtrees while any
    /// are unexplored, otherwise up to `nb` items of the current range.
    pub fn split(&mut self, nb: usize) -> OutsetDrain {
        let cursor = if self.cursor.has_subtrees() {
            self.cursor.split_subtree()
        } else {
            self.cursor.split_range(nb.min(self.cursor.nb_strands()))
        };
        OutsetDrain { _outset: Arc::clone(&self._outset), cursor }
    }

    /// Frees up to `budget` nodes of a detached residue work list.
    pub fn deallocate_nb(budget: Fuel, todo: &mut ResidueList) -> usize {
        bag::Bag::<Node>::deallocate_nb(budget, todo)
    }
}
