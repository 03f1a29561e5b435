//! Control-flow-graph program representation.
//!
//! Client computations are compiled (by hand, or by a frontend) into a
//! [`Cfg`]: a vector of [`BasicBlock`]s over a *shared* activation record
//! `S` (the program's per-call state) and a *private* record
//! (`S::Private`, carrying the resumption [`Trampoline`] and any parallel
//! loop bookkeeping). The interpreter executes one basic block per fuel
//! unit and can suspend, fork, or split a computation at block boundaries
//! without any cooperation from the program itself.
//!
//! A program type implements [`FlowProgram`] and exposes its CFG through a
//! `LazyLock` static; see the demo crate for complete examples.

use std::{ptr::NonNull, sync::Arc};

use crate::{cactus::{LinkKind, Stack}, incounter::Incounter, outset::Outset, vertex::VertexRef};

mod builder;
pub use builder::Stmt;

// IDS AND TRAMPOLINES
// ================================================================================================

/// Index of a basic block within its CFG.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Pseudo-label meaning "return from this activation".
    pub const EXIT: BlockId = BlockId(u32::MAX);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// First block executed by a fresh activation.
pub const ENTRY_BLOCK: BlockId = BlockId(0);

/// Index of a parallel loop within its CFG.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LoopId(pub u32);

impl LoopId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resumption point of an activation: the block just executed and the block
/// to execute next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Trampoline {
    pub pred: BlockId,
    pub succ: BlockId,
}

impl Default for Trampoline {
    fn default() -> Self {
        Trampoline { pred: ENTRY_BLOCK, succ: ENTRY_BLOCK }
    }
}

// SLOT TYPES
// ================================================================================================

/// Storage for the outset of an asynchronously produced value; written by
/// the runtime when a `SpawnPlus` site is promoted, read by the matching
/// `JoinMinus`.
pub type OutsetSlot = Option<Arc<Outset>>;

/// Storage for the incounter a producer should target; written by the
/// runtime when a `JoinPlus` site is promoted, read by the matching
/// `SpawnMinus`.
pub type IncounterSlot = Option<NonNull<Incounter>>;

// BASIC BLOCKS
// ================================================================================================

/// Straight-line code: mutate the records, fall through to `next`.
pub type BlockFn<S> = fn(&mut S, &mut <S as FlowProgram>::Private);

/// Branch: returns an index into the block's target list.
pub type CondFn<S> = fn(&mut S, &mut <S as FlowProgram>::Private) -> usize;

/// Call site: pushes the callee's frame onto the stack with the given
/// linkage (see [`crate::interpreter::push_call`]).
pub type CallFn<S> =
    fn(&mut S, &mut <S as FlowProgram>::Private, LinkKind, Stack) -> Stack;

/// Accessor for an [`OutsetSlot`] stored somewhere reachable from the
/// records (typically a field of `S`, or behind a pointer in `S`).
pub type OutsetSlotFn<S> =
    for<'a> fn(&'a mut S, &'a mut <S as FlowProgram>::Private) -> &'a mut OutsetSlot;

/// Accessor for an [`IncounterSlot`].
pub type IncounterSlotFn<S> =
    for<'a> fn(&'a mut S, &'a mut <S as FlowProgram>::Private) -> &'a mut IncounterSlot;

/// One node of a program's control-flow graph.
pub enum BasicBlock<S: FlowProgram> {
    /// Run `code`, continue at `next`.
    UnconditionalJump { code: BlockFn<S>, next: BlockId },
    /// Run `code`, continue at `targets[code(..)]`.
    ConditionalJump { code: CondFn<S>, targets: Vec<BlockId> },
    /// Push a sync-linked callee; `next` runs after the callee pops.
    SpawnJoin { body: CallFn<S>, next: BlockId },
    /// Push an async-linked callee: a lazy fork point. `next` must be the
    /// `SpawnJoin` that runs the second branch.
    Spawn2Join { body: CallFn<S>, next: BlockId },
    /// Pop the current frame and push `body`'s callee in its place.
    Tail { body: CallFn<S>, next: BlockId },
    /// Start a future: clears the slot, pushes an async-linked callee. On
    /// promotion the slot receives the future's outset.
    SpawnPlus { getter: OutsetSlotFn<S>, body: CallFn<S>, next: BlockId },
    /// Start an async dependency whose consumer is this activation: clears
    /// the slot, pushes an async-linked callee. On promotion the slot
    /// receives this vertex's incounter.
    JoinPlus { getter: IncounterSlotFn<S>, body: CallFn<S>, next: BlockId },
    /// Producer half of an asymmetric edge: pushes an async-linked callee;
    /// on promotion the detached producer is wired to the incounter stored
    /// in the slot.
    SpawnMinus { getter: IncounterSlotFn<S>, body: CallFn<S>, next: BlockId },
    /// Consumer half: if the slot holds an outset, the activation suspends
    /// until that outset is drained.
    JoinMinus { getter: OutsetSlotFn<S>, next: BlockId },
    /// Joins and combines the children of an associative-combine loop; the
    /// activation re-enters this block until every child future has been
    /// merged, then publishes its own accumulator and continues at `next`.
    JoinChildren { loop_id: LoopId, next: BlockId },
}

// PARALLEL LOOPS
// ================================================================================================

/// Join policy of a parallel loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JoinKind {
    /// Iterations only need to finish; siblings share one join vertex.
    Trivial,
    /// Each split sibling is a future whose accumulator is merged into the
    /// parent through the loop's combine operator.
    AssociativeCombine,
}

/// Static description of one parallel loop of a CFG.
pub struct LoopDescriptor<S: FlowProgram> {
    pub join: JoinKind,
    /// Trampoline installed in a sibling that should (re)enter the loop.
    pub entry: Trampoline,
    /// Trampoline installed in the original activation once its remaining
    /// iterations have been handed off.
    pub exit: Trampoline,
    /// Enclosing loops, outermost first.
    pub parents: Vec<LoopId>,
    /// `combine(dst, src)` merges `src`'s accumulator into `dst`.
    /// Required for [`JoinKind::AssociativeCombine`] loops.
    pub combine: Option<fn(&mut S::Private, &mut S::Private)>,
}

/// Per-activation state of one parallel loop.
pub enum LoopRecord {
    For(ForRecord),
    Combine(CombineRecord),
}

/// Record of a trivial-join loop: an iteration range and the shared join.
#[derive(Default)]
pub struct ForRecord {
    pub lo: i64,
    pub hi: i64,
    pub(crate) join: Option<VertexRef>,
}

/// Record of an associative-combine loop.
#[derive(Default)]
pub struct CombineRecord {
    pub lo: i64,
    pub hi: i64,
    /// Outstanding child futures: (child outset, destination record the
    /// child publishes its accumulator into).
    pub(crate) children: Vec<(Arc<Outset>, NonNull<()>)>,
    /// Child currently being joined by the `JoinChildren` block.
    pub(crate) pending: Option<(Arc<Outset>, NonNull<()>)>,
    /// Where to publish this activation's own accumulator, if it is itself
    /// a split sibling.
    pub(crate) destination: Option<NonNull<()>>,
}

impl LoopRecord {
    pub fn parallel_for(lo: i64, hi: i64) -> Self {
        LoopRecord::For(ForRecord { lo, hi, join: None })
    }

    pub fn parallel_combine(lo: i64, hi: i64) -> Self {
        LoopRecord::Combine(CombineRecord { lo, hi, ..Default::default() })
    }

    pub fn range(&self) -> (i64, i64) {
        match self {
            LoopRecord::For(r) => (r.lo, r.hi),
            LoopRecord::Combine(r) => (r.lo, r.hi),
        }
    }

    pub fn set_range(&mut self, lo: i64, hi: i64) {
        match self {
            LoopRecord::For(r) => (r.lo, r.hi) = (lo, hi),
            LoopRecord::Combine(r) => (r.lo, r.hi) = (lo, hi),
        }
    }

    /// Consumes the next iteration index, if any.
    pub fn next_iteration(&mut self) -> Option<i64> {
        let (lo, hi) = self.range();
        if lo < hi {
            self.set_range(lo + 1, hi);
            Some(lo)
        } else {
            None
        }
    }

    pub fn nb_strands(&self) -> usize {
        let (lo, hi) = self.range();
        (hi - lo).max(0) as usize
    }

    /// True on a combine-loop sibling that owes its accumulator to a
    /// parent; loop-exit code uses this to skip parent-only continuations.
    pub fn has_destination(&self) -> bool {
        matches!(self, LoopRecord::Combine(r) if r.destination.is_some())
    }

    /// Moves the top `nb` iterations into `dest`.
    pub(crate) fn split(&mut self, dest: &mut LoopRecord, nb: usize) {
        let (lo, hi) = self.range();
        let orig = self.nb_strands();
        assert!(nb <= orig, "loop split: requested {nb} of {orig} iterations");
        let mid = hi - nb as i64;
        self.set_range(lo, mid);
        dest.set_range(mid, hi);
        debug_assert_eq!(dest.nb_strands(), nb);
        debug_assert_eq!(self.nb_strands() + nb, orig);
    }

    pub(crate) fn as_for_mut(&mut self) -> &mut ForRecord {
        match self {
            LoopRecord::For(r) => r,
            LoopRecord::Combine(_) => panic!("expected a trivial-join loop record"),
        }
    }

    pub(crate) fn as_combine_mut(&mut self) -> &mut CombineRecord {
        match self {
            LoopRecord::Combine(r) => r,
            LoopRecord::For(_) => panic!("expected a combine loop record"),
        }
    }
}

/// Cloning a loop record is what happens when an activation is copied into
/// a split sibling: the iteration range travels, but join wiring, children,
/// and destinations belong to the original and are reset.
impl Clone for LoopRecord {
    fn clone(&self) -> Self {
        match self {
            LoopRecord::For(r) => LoopRecord::For(ForRecord { lo: r.lo, hi: r.hi, join: None }),
            LoopRecord::Combine(r) => LoopRecord::Combine(CombineRecord {
                lo: r.lo,
                hi: r.hi,
                ..Default::default()
            }),
        }
    }
}

impl Default for LoopRecord {
    fn default() -> Self {
        LoopRecord::For(ForRecord::default())
    }
}

// PROGRAM TRAITS
// ================================================================================================

/// Private activation record: resumption state plus loop bookkeeping.
pub trait PrivateRecord: Clone + Default + 'static {
    fn trampoline(&self) -> Trampoline;
    fn set_trampoline(&mut self, t: Trampoline);

    /// Record of the given loop. Programs without parallel loops keep the
    /// default.
    fn loop_record(&mut self, id: LoopId) -> &mut LoopRecord {
        let _ = id;
        panic!("program has no parallel loops")
    }

    fn loop_record_ref(&self, id: LoopId) -> &LoopRecord {
        let _ = id;
        panic!("program has no parallel loops")
    }
}

/// Minimal private record for programs without parallel loops.
#[derive(Clone, Default)]
pub struct BasicPrivate {
    trampoline: Trampoline,
}

impl PrivateRecord for BasicPrivate {
    fn trampoline(&self) -> Trampoline {
        self.trampoline
    }

    fn set_trampoline(&mut self, t: Trampoline) {
        self.trampoline = t;
    }
}

/// A compiled program: shared activation record type plus its static CFG.
pub trait FlowProgram: Sized + 'static {
    type Private: PrivateRecord;

    fn cfg() -> &'static Cfg<Self>;
}

// CFG
// ================================================================================================

/// A program's control-flow graph plus parallel-loop metadata.
pub struct Cfg<S: FlowProgram> {
    pub blocks: Vec<BasicBlock<S>>,
    pub loops: Vec<LoopDescriptor<S>>,
    /// Innermost loop containing each block, if any.
    pub loop_of: Vec<Option<LoopId>>,
}

impl<S: FlowProgram> Cfg<S> {
    /// CFG without parallel loops.
    pub fn new(blocks: Vec<BasicBlock<S>>) -> Self {
        let n = blocks.len();
        Cfg { blocks, loops: Vec::new(), loop_of: vec![None; n] }
    }

    /// CFG with parallel loops; `loop_of` maps each block to its innermost
    /// enclosing loop.
    pub fn with_loops(
        blocks: Vec<BasicBlock<S>>,
        loops: Vec<LoopDescriptor<S>>,
        loop_of: Vec<Option<LoopId>>,
    ) -> Self {
        assert_eq!(blocks.len(), loop_of.len(), "loop_of must cover every block");
        Cfg { blocks, loops, loop_of }
    }

    pub fn nb_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn block(&self, id: BlockId) -> &BasicBlock<S> {
        &self.blocks[id.index()]
    }

    pub(crate) fn innermost_loop(&self, block: BlockId) -> Option<LoopId> {
        if block == BlockId::EXIT { None } else { self.loop_of[block.index()] }
    }
}
