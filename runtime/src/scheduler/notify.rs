//! Completion: draining outsets and deallocating their block trees.
//!
//! A completing vertex decrements every handle registered in its outset.
//! Small outsets (the overwhelmingly common case: one continuation) drain
//! inline during sealing. Large ones drain in budgeted steps; when the
//! completed vertex was a future, the remaining drain is published onto the
//! frontier as a [`ParallelNotifyFuture`] vertex so that idle workers can
//! steal shares of it. Likewise, a large block tree is freed piecewise by a
//! [`ParallelDeallocateHeavy`] vertex.

use std::{mem, sync::Arc};

use super::{dag_freq, release, schedule, worker};
use crate::{
    outset::{Outset, OutsetDrain, ResidueList},
    vertex::{Fuel, RunOutcome, Vertex, VertexCore, VertexRef},
};

// COMPLETION
// ================================================================================================

/// Drains `v`'s outset and frees it. `v` must have no strands left.
pub(crate) fn delete_vertex(v: VertexRef) {
    debug_assert_eq!(v.nb_strands(), 0);
    let (is_future, outset) = {
        // SAFETY: the caller owns the completed vertex.
        let d = unsafe { v.as_dyn() };
        (d.core().is_future(), Arc::clone(d.core().outset()))
    };
    parallel_notify(is_future, &outset);
    // SAFETY: ownership ends here; the Arc keeps the outset alive for any
    // in-flight inserter or drain.
    unsafe { v.delete() };
}

/// Seals and drains an outset.
///
/// Futures may fan out to many continuations, so their leftover drain work
/// is scheduled as a splittable vertex; ordinary outsets almost always hold
/// a single handle and are drained on the spot.
pub(crate) fn parallel_notify(is_future: bool, outset: &Arc<Outset>) {
    let Some(mut drain) = outset.seal() else { return };
    let budget = dag_freq();
    drain.notify_nb(budget);
    if drain.is_done() {
        return;
    }
    if is_future {
        let v = VertexRef::new(Box::new(ParallelNotifyFuture::new(drain)));
        release(v);
    } else {
        while !drain.is_done() {
            drain.notify_nb(budget);
        }
    }
}

/// Frees a detached outset block tree, spawning a deallocation vertex when
/// it is too large to free within one budget.
pub(crate) fn deallocate_residue(mut todo: ResidueList) {
    let budget = dag_freq();
    OutsetDrain::deallocate_nb(budget, &mut todo);
    if todo.is_empty() {
        return;
    }
    let handed_off = worker::with_current(|_| {
        let v = VertexRef::new(Box::new(ParallelDeallocateHeavy::new(mem::take(&mut todo))));
        release(v);
    })
    .is_some();
    if !handed_off {
        // Teardown path with no scheduler: free it all here.
        while OutsetDrain::deallocate_nb(Fuel::MAX, &mut todo) > 0 {}
    }
}

// NOTIFY VERTEX
// ================================================================================================

enum Resume {
    Entry,
    Header,
}

/// Frontier vertex that finishes draining a future's outset.
///
/// On each run it reschedules itself *first* and then decrements a budget
/// of handles, so vertices unblocked by those decrements sit above it in
/// the LIFO frontier and run before the drain continues.
struct ParallelNotifyFuture {
    core: VertexCore,
    drain: OutsetDrain,
    resume: Resume,
}

impl ParallelNotifyFuture {
    fn new(drain: OutsetDrain) -> Self {
        ParallelNotifyFuture { core: VertexCore::new(), drain, resume: Resume::Entry }
    }
}

impl Vertex for ParallelNotifyFuture {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        self.drain.nb_strands()
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        match self.resume {
            Resume::Entry => {
                self.resume = Resume::Header;
                schedule(VertexRef::from_core(&self.core));
                self.drain.notify_nb(fuel);
                RunOutcome::Released(0)
            },
            Resume::Header => {
                if self.drain.is_done() {
                    RunOutcome::Completed(fuel.saturating_sub(1))
                } else {
                    self.resume = Resume::Entry;
                    schedule(VertexRef::from_core(&self.core));
                    RunOutcome::Released(fuel.saturating_sub(1))
                }
            },
        }
    }

    fn split(&mut self, nb: usize) -> (Option<VertexRef>, VertexRef) {
        let sibling = self.drain.split(nb);
        let v = VertexRef::new(Box::new(ParallelNotifyFuture::new(sibling)));
        v.detach_release();
        (None, v)
    }
}

// DEALLOCATE VERTEX
// ================================================================================================

/// Frontier vertex that frees a large outset block tree piecewise.
struct ParallelDeallocateHeavy {
    core: VertexCore,
    todo: ResidueList,
    resume: Resume,
}

impl ParallelDeallocateHeavy {
    fn new(todo: ResidueList) -> Self {
        ParallelDeallocateHeavy { core: VertexCore::new(), todo, resume: Resume::Entry }
    }
}

// SAFETY: `todo` holds `NonNull` pointers into block-tree nodes exclusively
// owned by this vertex, mirroring `bag::Drain`'s `unsafe impl Send`.
unsafe impl Send for ParallelDeallocateHeavy {}

impl Vertex for ParallelDeallocateHeavy {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.todo.is_empty() { 0 } else { self.todo.len().min(2) }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        match self.resume {
            Resume::Entry => {
                // Reschedule first: freeing memory is the lowest-priority
                // work on the frontier.
                self.resume = Resume::Header;
                schedule(VertexRef::from_core(&self.core));
                OutsetDrain::deallocate_nb(fuel, &mut self.todo);
                RunOutcome::Released(0)
            },
            Resume::Header => {
                if self.todo.is_empty() {
                    RunOutcome::Completed(fuel.saturating_sub(1))
                } else {
                    self.resume = Resume::Entry;
                    schedule(VertexRef::from_core(&self.core));
                    RunOutcome::Released(fuel.saturating_sub(1))
                }
            },
        }
    }

    fn split(&mut self, _nb: usize) -> (Option<VertexRef>, VertexRef) {
        let mut sibling = ResidueList::new();
        if let Some(node) = self.todo.pop_front() {
            sibling.push_back(node);
        }
        let v = VertexRef::new(Box::new(ParallelDeallocateHeavy::new(sibling)));
        v.detach_release();
        (None, v)
    }
}
