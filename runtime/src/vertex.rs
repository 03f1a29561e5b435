//! Vertices: the schedulable nodes of the runtime's implicit DAG.

use std::{ptr::NonNull, sync::Arc};

use crate::{incounter::Incounter, outset::Outset};

/// Scheduling budget, in basic blocks.
pub type Fuel = usize;

/// What `Vertex::run` did with the vertex.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The vertex has no strands left. The caller still owns it and must
    /// drain its outset and delete it.
    Completed(Fuel),
    /// Ownership left the caller during the run: the vertex rescheduled
    /// itself, parked on its incounter, or suspended on a dependency. The
    /// caller must forget its reference.
    Released(Fuel),
}

impl RunOutcome {
    pub fn remaining(&self) -> Fuel {
        match *self {
            RunOutcome::Completed(f) | RunOutcome::Released(f) => f,
        }
    }
}

// VERTEX TRAIT
// ================================================================================================

/// A schedulable unit of work.
///
/// Implementations embed a [`VertexCore`] for the DAG wiring and provide
/// the three scheduler-facing operations. `run` executes up to `fuel`
/// basic blocks; `split` detaches `nb` strands into a new vertex for load
/// balancing.
pub trait Vertex: Send {
    fn core(&self) -> &VertexCore;
    fn core_mut(&mut self) -> &mut VertexCore;

    /// Number of schedulable strands: 0 means the vertex is finished.
    fn nb_strands(&self) -> usize;

    fn run(&mut self, fuel: Fuel) -> RunOutcome;

    /// Detaches `nb` strands (`0 < nb < nb_strands()`) into a new vertex.
    ///
    /// Returns `(replacement, detached)`. When `replacement` is `Some`, the
    /// vertex repurposed itself (typically as a join) and the caller must
    /// treat the replacement as the runnable remainder instead of `self`.
    /// The detached vertex is returned with its release handle already
    /// consumed: it is ready to run but not yet scheduled.
    fn split(&mut self, nb: usize) -> (Option<VertexRef>, VertexRef) {
        let _ = nb;
        panic!("vertex reported multiple strands but cannot split")
    }
}

// VERTEX CORE
// ================================================================================================

/// DAG state common to every vertex.
///
/// The incounter handle and self reference are plain pointers; they travel
/// with the vertex, whose cross-worker movement is already governed by the
/// ownership rules on [`VertexRef`].
pub struct VertexCore {
    incounter: Incounter,
    outset: Arc<Outset>,
    release_handle: crate::incounter::Handle,
    is_future: bool,
    pub(crate) is_suspended: bool,
    self_ref: Option<VertexRef>,
}

// SAFETY: see the type docs.
unsafe impl Send for VertexCore {}

impl VertexCore {
    /// Fresh core whose incounter already counts the pending release edge.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let incounter = Incounter::new();
        let release_handle = incounter.increment(&incounter as *const _ as usize);
        VertexCore {
            incounter,
            outset: Arc::new(Outset::new()),
            release_handle,
            is_future: false,
            is_suspended: false,
            self_ref: None,
        }
    }

    pub fn incounter(&self) -> &Incounter {
        &self.incounter
    }

    pub fn outset(&self) -> &Arc<Outset> {
        &self.outset
    }

    pub fn is_future(&self) -> bool {
        self.is_future
    }

    /// Marks this vertex as a future: its outset is drained in parallel on
    /// completion.
    pub fn enable_future(&mut self) {
        self.is_future = true;
    }

    /// Reference to the vertex this core is embedded in.
    ///
    /// Available once the vertex has been wrapped by [`VertexRef::new`];
    /// manual vertices use this to wire edges to themselves.
    pub fn vertex_ref(&self) -> VertexRef {
        self.self_ref()
    }

    pub(crate) fn release_handle(&self) -> crate::incounter::Handle {
        self.release_handle
    }

    pub(crate) fn self_ref(&self) -> VertexRef {
        self.self_ref.expect("vertex core not bound")
    }

    fn bind(&mut self, me: VertexRef) {
        debug_assert!(self.self_ref.is_none());
        self.self_ref = Some(me);
        self.incounter.annotate(self as *const VertexCore);
    }
}

// VERTEX REF
// ================================================================================================

/// Raw owning reference to a heap-allocated vertex.
///
/// Ownership is logical, enforced by the runtime's release-exactly-once
/// invariant: at any instant exactly one party (a frontier, a suspended
/// list, or the vertex's own incounter annotation) is entitled to run or
/// delete the vertex. The type is `Copy` because promotion and edge wiring
/// pass the same reference through several hands on one worker; the
/// discipline is the same as for the raw pointers it replaces.
#[derive(Clone, Copy)]
pub struct VertexRef(NonNull<dyn Vertex>);

// SAFETY: a vertex is mutated only by the worker that currently owns it;
// handing a VertexRef to another worker transfers that right.
unsafe impl Send for VertexRef {}

impl VertexRef {
    /// Moves `v` to the heap and wires its incounter annotation back to the
    /// allocation.
    pub fn new(v: Box<dyn Vertex>) -> VertexRef {
        let raw = Box::into_raw(v);
        // SAFETY: `raw` is a valid, exclusively owned allocation.
        let me = VertexRef(unsafe { NonNull::new_unchecked(raw) });
        unsafe { (*raw).core_mut().bind(me) };
        me
    }

    pub(crate) fn from_core(core: &VertexCore) -> VertexRef {
        core.self_ref()
    }

    /// # Safety
    /// The caller must be the current logical owner.
    pub(crate) unsafe fn as_dyn(&self) -> &dyn Vertex {
        // SAFETY: per the ownership contract above.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    /// The caller must be the current logical owner.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_dyn_mut(&self) -> &mut dyn Vertex {
        // SAFETY: per the ownership contract above.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn nb_strands(&self) -> usize {
        // SAFETY: reading strand counts is limited to the owner or the
        // worker servicing its frontier.
        unsafe { self.as_dyn() }.nb_strands()
    }

    /// Consumes the release handle without scheduling; used when a freshly
    /// split vertex is handed straight to a frontier.
    pub(crate) fn detach_release(&self) {
        let handle = unsafe { self.as_dyn() }.core().release_handle();
        let _released = Incounter::decrement_detached(handle);
        debug_assert!(_released, "detached release handle was not the last edge");
    }

    /// Frees the vertex.
    ///
    /// # Safety
    /// The caller must own the vertex and never use any copy of this
    /// reference again.
    pub(crate) unsafe fn delete(self) {
        // SAFETY: per the documented contract.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}
