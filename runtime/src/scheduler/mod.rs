//! Work-stealing scheduler: per-worker frontiers, the steal protocol, and
//! the scheduling primitives vertices use to wire the DAG.

use std::sync::Arc;

use crate::{
    incounter::Incounter,
    options::DEFAULT_DAG_FREQ,
    outset::Outset,
    vertex::{Fuel, RunOutcome, VertexRef},
};

mod frontier;
mod notify;
pub(crate) mod stats;
mod worker;

pub use stats::Stats;
pub use worker::launch_scheduler;

pub(crate) use notify::deallocate_residue;

// SCHEDULING PRIMITIVES
// ================================================================================================

/// Makes `v` runnable on the calling worker's frontier.
///
/// A vertex with no strands left is completed instead: its outset is
/// drained and the vertex deleted.
pub fn schedule(v: VertexRef) {
    if v.nb_strands() == 0 {
        notify::delete_vertex(v);
        return;
    }
    let pushed = worker::with_current(|w| w.push_local(v)).is_some();
    assert!(pushed, "schedule called outside a worker");
}

/// Declares the implicit "creation" edge of `v` satisfied; once every other
/// in-edge is gone too, `v` is scheduled.
pub fn release(v: VertexRef) {
    // SAFETY: the creating worker still owns `v`.
    let handle = unsafe { v.as_dyn() }.core().release_handle();
    Incounter::decrement(handle);
}

/// Parks `v` on the calling worker's suspended list; the worker revisits it
/// between heartbeats.
pub fn suspend(v: VertexRef) {
    let parked = worker::with_current(|w| w.park_suspended(v)).is_some();
    assert!(parked, "suspend called outside a worker");
}

/// Runs `v` to completion on `nb_workers` workers and reports scheduler
/// statistics. Convenience wrapper over [`launch_scheduler`].
pub fn launch(nb_workers: usize, v: VertexRef) -> Stats {
    let options = crate::options::RuntimeOptions { nb_workers, ..Default::default() };
    launch_scheduler(options, v)
}

// EDGES
// ================================================================================================

/// Anything with an outset: an edge source.
pub trait EdgeSource {
    fn source_outset(&self) -> &Arc<Outset>;
}

/// Anything with an incounter: an edge target.
pub trait EdgeTarget {
    fn target_incounter(&self) -> &Incounter;
}

impl EdgeSource for VertexRef {
    fn source_outset(&self) -> &Arc<Outset> {
        // SAFETY: edges are wired by the worker that owns the endpoint.
        unsafe { self.as_dyn() }.core().outset()
    }
}

impl EdgeSource for Arc<Outset> {
    fn source_outset(&self) -> &Arc<Outset> {
        self
    }
}

impl EdgeTarget for VertexRef {
    fn target_incounter(&self) -> &Incounter {
        // SAFETY: as above.
        unsafe { self.as_dyn() }.core().incounter()
    }
}

impl EdgeTarget for Incounter {
    fn target_incounter(&self) -> &Incounter {
        self
    }
}

/// Adds a dependency edge: `dst` will not be scheduled until `src` has
/// completed (or the edge is found to be already satisfied).
///
/// The incounter is incremented first; if the source's outset refuses the
/// handle because the source already completed, the edge is satisfied on
/// the spot by decrementing it back.
pub fn new_edge(src: &impl EdgeSource, dst: &impl EdgeTarget) {
    let outset = src.source_outset();
    let handle = dst.target_incounter().increment(Arc::as_ptr(outset) as usize);
    if !outset.insert(handle) {
        Incounter::decrement(handle);
    }
}

// WORKER CONTEXT SERVICES
// ================================================================================================

/// Worker id plus a worker-local random-int source, with a deterministic
/// fallback for off-worker callers.
pub(crate) fn with_worker_id_and_rng<R>(
    f: impl FnOnce(usize, &mut dyn FnMut(usize) -> usize) -> R,
) -> R {
    worker::with_id_and_rng(f)
}

pub(crate) fn never_promote() -> bool {
    worker::with_current(|w| w.options().never_promote).unwrap_or(false)
}

pub(crate) fn dag_freq() -> Fuel {
    worker::with_current(|w| w.options().dag_freq).unwrap_or(DEFAULT_DAG_FREQ)
}

pub(crate) use notify::delete_vertex;

/// Runs one vertex on behalf of the owning worker, completing it if it
/// finishes.
pub(crate) fn run_vertex(v: VertexRef, fuel: Fuel) -> Fuel {
    // SAFETY: the caller owns `v`.
    let outcome = unsafe { v.as_dyn_mut() }.run(fuel);
    match outcome {
        RunOutcome::Completed(remaining) => {
            notify::delete_vertex(v);
            remaining
        },
        RunOutcome::Released(remaining) => remaining,
    }
}
