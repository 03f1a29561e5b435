//! The CFG interpreter vertex.
//!
//! An [`Interpreter`] wraps a cactus stack of activation frames and steps
//! the newest frame's CFG one basic block per fuel unit. When the fuel
//! budget runs out — the heartbeat — it consults the stack's mark cursor
//! and either reschedules itself, promotes a lazy fork point into real
//! vertices, or splits a parallel loop. Suspension (`JoinMinus` /
//! `JoinChildren` on an unfinished dependency) parks the vertex on the
//! dependency's outset.
//!
//! # Frame layout and aliasing
//!
//! A frame's payload is `Frame<S>`: the shared activation record (owned
//! directly, or a pointer to the owner's copy for loop siblings) followed
//! by the private record. Basic-block code receives `&mut S` and
//! `&mut S::Private` re-materialized from raw pointers for the duration of
//! one block. Loop siblings of a split share one `S`; programs that split
//! loops must confine cross-sibling state in `S` to independently written
//! locations (arrays indexed by iteration, accumulators per private
//! record), which is the same contract the DSL imposes on any parallel
//! loop body.

use std::{marker::PhantomData, ptr, sync::Arc};

use crate::{
    cactus::{self, FrameRef, LinkKind, Mark, Stack},
    edsl::{BasicBlock, BlockId, FlowProgram, PrivateRecord, Trampoline},
    scheduler,
    vertex::{Fuel, RunOutcome, Vertex, VertexCore, VertexRef},
};

mod loops;
use crate::outset::Outset;

// FRAMES
// ================================================================================================

/// Shared-record storage of one frame.
pub(crate) enum SharedSlot<S> {
    /// The activation owns its shared record.
    Direct(S),
    /// The record lives in another frame (the loop split original); valid
    /// because the owner is the join and outlives every sibling.
    Indirect(*mut S),
}

impl<S> SharedSlot<S> {
    fn as_ptr(&mut self) -> *mut S {
        match self {
            SharedSlot::Direct(s) => s,
            SharedSlot::Indirect(p) => *p,
        }
    }
}

#[repr(C)]
pub(crate) struct Frame<S: FlowProgram> {
    shared: SharedSlot<S>,
    private: S::Private,
}

/// Re-materializes record references from a frame.
///
/// # Safety
/// `f` must be a live frame of program type `S`; the references must not
/// outlive the frame nor overlap a mutation of the same records.
unsafe fn frame_parts<'a, S: FlowProgram>(f: FrameRef) -> (&'a mut S, &'a mut S::Private) {
    let frame = f.payload() as *mut Frame<S>;
    // SAFETY: per the function contract.
    unsafe {
        let sar = (*frame).shared.as_ptr();
        (&mut *sar, &mut (*frame).private)
    }
}

/// Like [`frame_parts`], but touches only the private record; used when a
/// reference to the (possibly shared) activation record is already live.
///
/// # Safety
/// As for [`frame_parts`].
unsafe fn frame_private<'a, S: FlowProgram>(f: FrameRef) -> &'a mut S::Private {
    let frame = f.payload() as *mut Frame<S>;
    // SAFETY: per the function contract.
    unsafe { &mut (*frame).private }
}

// FRAME OPS
// ================================================================================================

enum Signal {
    None,
    Suspend,
}

/// Monomorphized dispatch table stored in each frame's header, so the
/// interpreter can drive frames of any program type found on a stack.
pub(crate) struct FrameOps {
    step: unsafe fn(Stack) -> (Stack, Signal),
    nb_strands: unsafe fn(FrameRef) -> usize,
    splittable: unsafe fn(FrameRef) -> bool,
    promote: unsafe fn(FrameRef, &mut Interpreter),
    dependency: unsafe fn(FrameRef) -> Arc<Outset>,
    split_loop: unsafe fn(FrameRef, &mut Interpreter, usize) -> (Option<VertexRef>, VertexRef),
    drop_frame: unsafe fn(*mut u8),
}

fn drop_frame_in_place<S: FlowProgram>(p: *mut u8) {
    // SAFETY: called on a frame payload of type `S` exactly once.
    unsafe { ptr::drop_in_place(p as *mut Frame<S>) }
}

fn frame_ops<S: FlowProgram>() -> &'static FrameOps {
    struct Ops<S>(PhantomData<S>);
    impl<S: FlowProgram> Ops<S> {
        const OPS: FrameOps = FrameOps {
            step: step::<S>,
            nb_strands: loops::frame_nb_strands::<S>,
            splittable: loops::frame_splittable::<S>,
            promote: promote_mark::<S>,
            dependency: dependency_of::<S>,
            split_loop: loops::split_interpreter::<S>,
            drop_frame: drop_frame_in_place::<S>,
        };
    }
    &Ops::<S>::OPS
}

#[inline]
fn ops_of(f: FrameRef) -> &'static FrameOps {
    // SAFETY: every frame is pushed with a `FrameOps` meta word.
    unsafe { &*(f.meta() as *const FrameOps) }
}

// STACK CONSTRUCTION
// ================================================================================================

/// Pushes a call frame for program `S` onto `stack`.
///
/// This is the function client `CallFn` bodies use to enter a callee.
pub fn push_call<S: FlowProgram>(stack: Stack, link: LinkKind, shared: S) -> Stack {
    push_frame(stack, link, SharedSlot::Direct(shared), S::Private::default())
}

pub(crate) fn push_frame<S: FlowProgram>(
    stack: Stack,
    link: LinkKind,
    slot: SharedSlot<S>,
    private: S::Private,
) -> Stack {
    const {
        assert!(align_of::<Frame<S>>() <= 16, "activation records limited to 16-byte alignment");
    }
    // SAFETY: the closure fully initializes the payload.
    unsafe {
        cactus::push(
            stack,
            link,
            size_of::<Frame<S>>(),
            frame_ops::<S>() as *const FrameOps as *const (),
            |p| (p as *mut Frame<S>).write(Frame { shared: slot, private }),
        )
    }
}

pub(crate) fn create_stack<S: FlowProgram>(slot: SharedSlot<S>, private: S::Private) -> Stack {
    push_frame(cactus::new_stack(), LinkKind::Sync, slot, private)
}

fn pop_call<S: FlowProgram>(stack: Stack) -> Stack {
    // SAFETY: the newest frame is a live `Frame<S>`.
    unsafe { cactus::pop(stack, |p| ptr::drop_in_place(p as *mut Frame<S>)) }
}

/// Recomputes the stack's mark cursor with each frame's own splittability.
pub(crate) fn refresh_marks(stack: Stack) -> Stack {
    // SAFETY: predicate only inspects frame records.
    unsafe { cactus::update_marks(stack, |f| (ops_of(f).splittable)(f)) }
}

// STEP
// ================================================================================================

/// Executes one basic block of the newest frame.
unsafe fn step<S: FlowProgram>(mut stack: Stack) -> (Stack, Signal) {
    let frame = stack.newest();
    // SAFETY: the newest frame was pushed with these ops, hence type `S`.
    let (sar, par) = unsafe { frame_parts::<S>(frame) };
    let pred = par.trampoline().succ;
    if pred == BlockId::EXIT {
        return (pop_call::<S>(stack), Signal::None);
    }
    let cfg = S::cfg();
    let mut signal = Signal::None;
    let succ;
    match cfg.block(pred) {
        BasicBlock::UnconditionalJump { code, next } => {
            code(sar, par);
            succ = *next;
        },
        BasicBlock::ConditionalJump { code, targets } => {
            succ = targets[code(sar, par)];
        },
        BasicBlock::SpawnJoin { body, next } => {
            stack = body(sar, par, LinkKind::Sync, stack);
            succ = *next;
        },
        BasicBlock::Spawn2Join { body, next } => {
            stack = body(sar, par, LinkKind::Async, stack);
            succ = *next;
        },
        BasicBlock::Tail { body, next: _ } => {
            // Replace this frame with the callee: move the records out,
            // pop the bytes without dropping, then push the callee (which
            // may reuse them).
            let raw = frame.payload() as *mut Frame<S>;
            // SAFETY: `raw` is fully initialized; the pop below forgets it.
            let mut moved = unsafe { ptr::read(raw) };
            stack = unsafe { cactus::pop(stack, |_| {}) };
            let msar = moved.shared.as_ptr();
            // SAFETY: `msar` points at the moved-out record (or the loop
            // owner's), valid for the call.
            stack = body(unsafe { &mut *msar }, &mut moved.private, LinkKind::Sync, stack);
            return (stack, Signal::None);
        },
        BasicBlock::SpawnPlus { getter, body, next } => {
            *getter(sar, par) = None;
            stack = body(sar, par, LinkKind::Async, stack);
            succ = *next;
        },
        BasicBlock::JoinPlus { getter, body, next } => {
            *getter(sar, par) = None;
            stack = body(sar, par, LinkKind::Async, stack);
            succ = *next;
        },
        BasicBlock::SpawnMinus { getter: _, body, next } => {
            stack = body(sar, par, LinkKind::Async, stack);
            succ = *next;
        },
        BasicBlock::JoinMinus { getter, next } => {
            if getter(sar, par).is_some() {
                signal = Signal::Suspend;
            }
            succ = *next;
        },
        BasicBlock::JoinChildren { loop_id, next } => {
            let combine =
                cfg.loops[loop_id.index()].combine.expect("combine loop without an operator");
            let pending = par.loop_record(*loop_id).as_combine_mut().pending.take();
            if let Some((_outset, dest)) = pending {
                // The joined child has published into `dest`; fold it in.
                // SAFETY: `dest` was allocated as a boxed `S::Private` when
                // the child split off, and the child is done with it.
                let mut child = unsafe { Box::from_raw(dest.as_ptr() as *mut S::Private) };
                combine(par, &mut child);
            }
            match par.loop_record(*loop_id).as_combine_mut().children.pop() {
                Some(child) => {
                    par.loop_record(*loop_id).as_combine_mut().pending = Some(child);
                    signal = Signal::Suspend;
                    // Re-enter this block once the child completes.
                    succ = pred;
                },
                None => {
                    let destination = par.loop_record(*loop_id).as_combine_mut().destination;
                    if let Some(dest) = destination {
                        // This activation is itself a split sibling:
                        // publish its accumulator for the parent.
                        // SAFETY: the parent keeps `dest` alive until it
                        // joins this activation's outset.
                        let dest = unsafe { &mut *(dest.as_ptr() as *mut S::Private) };
                        combine(dest, par);
                    }
                    succ = *next;
                },
            }
        },
    }
    par.set_trampoline(Trampoline { pred, succ });
    (stack, signal)
}

/// Dependency a suspended activation is waiting on.
unsafe fn dependency_of<S: FlowProgram>(f: FrameRef) -> Arc<Outset> {
    // SAFETY: caller passes the newest frame, of type `S`.
    let (sar, par) = unsafe { frame_parts::<S>(f) };
    let pred = par.trampoline().pred;
    match S::cfg().block(pred) {
        BasicBlock::JoinMinus { getter, .. } => {
            getter(sar, par).clone().expect("suspended join has no dependency")
        },
        BasicBlock::JoinChildren { loop_id, .. } => par
            .loop_record(*loop_id)
            .as_combine_mut()
            .pending
            .as_ref()
            .map(|(outset, _)| Arc::clone(outset))
            .expect("suspended join has no pending child"),
        _ => panic!("suspended on a non-joining block"),
    }
}

// PROMOTION
// ================================================================================================

/// Turns the oldest lazy fork point into real DAG vertices.
///
/// `pred` is the frame that pushed the async callee; the block it last
/// executed decides the promotion shape.
unsafe fn promote_mark<S: FlowProgram>(pred: FrameRef, interp: &mut Interpreter) {
    // SAFETY: `pred` is a live frame of type `S` in `interp`'s stack
    // prefix, which survives the slicing below.
    let (sar, par) = unsafe { frame_parts::<S>(pred) };
    let label = par.trampoline().pred;
    let cfg = S::cfg();
    match cfg.block(label) {
        BasicBlock::Spawn2Join { .. } => {
            // SAFETY: a fork mark has a predecessor.
            let (prefix, suffix) = unsafe { cactus::fork_mark(interp.stack) };
            interp.stack = refresh_marks(prefix);
            let branch1 = Interpreter::from_stack(suffix);
            // The second branch is the spawn_join block that follows.
            let spawn_label = par.trampoline().succ;
            let BasicBlock::SpawnJoin { body, next } = cfg.block(spawn_label) else {
                panic!("spawn2_join must be followed by its spawn_join")
            };
            par.set_trampoline(Trampoline { pred: spawn_label, succ: *next });
            let stack2 = body(sar, par, LinkKind::Sync, cactus::new_stack());
            let branch2 = Interpreter::from_stack(stack2);
            // This vertex becomes the join.
            let join = VertexRef::from_core(&interp.core);
            scheduler::new_edge(&branch2, &join);
            scheduler::new_edge(&branch1, &join);
            scheduler::release(branch2);
            scheduler::release(branch1);
            tracing::trace!(target: "pulse::interp", "promoted spawn2_join");
        },
        BasicBlock::SpawnMinus { getter, .. } => {
            let (prefix, suffix) = unsafe { cactus::fork_mark(interp.stack) };
            interp.stack = refresh_marks(prefix);
            let branch = Interpreter::from_stack(suffix);
            let incounter = getter(sar, par).expect("spawn_minus target not set");
            // SAFETY: the consumer vertex holding this incounter is parked
            // until the producer signals it.
            scheduler::new_edge(&branch, unsafe { incounter.as_ref() });
            scheduler::schedule(VertexRef::from_core(&interp.core));
            scheduler::release(branch);
            tracing::trace!(target: "pulse::interp", "promoted spawn_minus");
        },
        BasicBlock::SpawnPlus { getter, .. } => {
            let (prefix, suffix) = unsafe { cactus::fork_mark(interp.stack) };
            interp.stack = refresh_marks(prefix);
            let branch = Interpreter::from_stack(suffix);
            // SAFETY: fresh vertex, exclusively owned here.
            let branch_core = unsafe { branch.as_dyn_mut() }.core_mut();
            branch_core.enable_future();
            *getter(sar, par) = Some(Arc::clone(branch_core.outset()));
            scheduler::schedule(VertexRef::from_core(&interp.core));
            scheduler::release(branch);
            tracing::trace!(target: "pulse::interp", "promoted future");
        },
        BasicBlock::JoinPlus { getter, .. } => {
            let (prefix, suffix) = unsafe { cactus::fork_mark(interp.stack) };
            interp.stack = refresh_marks(prefix);
            let branch = Interpreter::from_stack(suffix);
            *getter(sar, par) = Some(interp.core.incounter().into());
            let join = VertexRef::from_core(&interp.core);
            scheduler::new_edge(&branch, &join);
            scheduler::release(branch);
            tracing::trace!(target: "pulse::interp", "promoted join_plus");
        },
        _ => panic!("async frame under a non-forking block"),
    }
}

// INTERPRETER VERTEX
// ================================================================================================

/// A vertex executing a cactus stack of CFG activations.
pub struct Interpreter {
    core: VertexCore,
    pub(crate) stack: Stack,
}

// SAFETY: the stack is owned by whichever worker owns the vertex.
unsafe impl Send for Interpreter {}

impl Interpreter {
    /// Creates a runnable vertex for a fresh activation of `S`.
    ///
    /// The vertex is not yet scheduled; pass it to
    /// [`crate::scheduler::launch_scheduler`] or [`crate::scheduler::release`].
    pub fn spawn<S: FlowProgram>(shared: S) -> VertexRef {
        Self::from_stack(create_stack(SharedSlot::Direct(shared), S::Private::default()))
    }

    pub(crate) fn from_stack(stack: Stack) -> VertexRef {
        let stack = refresh_marks(stack);
        VertexRef::new(Box::new(Interpreter { core: VertexCore::new(), stack }))
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Completed vertices arrive here with an empty stack; the loop only
        // matters on abnormal teardown.
        while !self.stack.is_empty() {
            let ops = ops_of(self.stack.newest());
            // SAFETY: dropping frames newest-first with their own ops.
            self.stack = unsafe { cactus::pop(self.stack, |p| (ops.drop_frame)(p)) };
        }
        // SAFETY: the stack is empty and never touched again.
        unsafe { cactus::delete_stack(self.stack) };
    }
}

impl Vertex for Interpreter {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.stack.is_empty() {
            0
        } else if let Some((mark, _)) = self.stack.peek_mark() {
            // SAFETY: the mark cursor is refreshed after every run.
            unsafe { (ops_of(mark).nb_strands)(mark) }.max(1)
        } else {
            1
        }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        let mut s = self.stack;
        let mut fuel = fuel;
        let mut suspended = false;
        while !s.is_empty() && fuel >= 1 {
            let ops = ops_of(s.newest());
            // SAFETY: the newest frame matches its own ops table.
            let (next, signal) = unsafe { (ops.step)(s) };
            s = next;
            fuel -= 1;
            if matches!(signal, Signal::Suspend) {
                suspended = true;
                break;
            }
        }
        self.stack = refresh_marks(s);

        if suspended {
            // Park on the dependency; any marks wait for the wake-up
            // heartbeat.
            self.core.is_suspended = true;
            let newest = self.stack.newest();
            // SAFETY: the suspend signal came from this frame.
            let dep = unsafe { (ops_of(newest).dependency)(newest) };
            self.core.is_suspended = false;
            let me = VertexRef::from_core(&self.core);
            scheduler::stats::on_suspension();
            scheduler::new_edge(&dep, &me);
            return RunOutcome::Released(0);
        }

        if self.nb_strands() == 0 {
            return RunOutcome::Completed(fuel);
        }
        debug_assert_eq!(fuel, 0, "live strands left with fuel to spare");

        if scheduler::never_promote() {
            scheduler::schedule(VertexRef::from_core(&self.core));
            return RunOutcome::Released(0);
        }

        let splittable = |f: FrameRef| {
            // SAFETY: predicate over live frames.
            unsafe { (ops_of(f).splittable)(f) }
        };
        match cactus::classify_mark(&self.stack, splittable) {
            None => {
                scheduler::schedule(VertexRef::from_core(&self.core));
            },
            Some(Mark::Fork(_, pred)) => {
                // SAFETY: `pred` is live in this stack.
                unsafe { (ops_of(pred).promote)(pred, self) };
                scheduler::stats::on_promotion();
            },
            Some(Mark::LoopSplit(_)) => {
                let half = self.nb_strands() / 2;
                let (replacement, sibling) = self.split(half);
                scheduler::schedule(sibling);
                match replacement {
                    Some(r) => scheduler::schedule(r),
                    None => scheduler::schedule(VertexRef::from_core(&self.core)),
                }
                scheduler::stats::on_promotion();
            },
        }
        RunOutcome::Released(0)
    }

    fn split(&mut self, nb: usize) -> (Option<VertexRef>, VertexRef) {
        let (mark, _) = self.stack.peek_mark().expect("split on a markless vertex");
        // SAFETY: the mark frame is live.
        unsafe { (ops_of(mark).split_loop)(mark, self, nb) }
    }
}

// Strand accounting is also useful to clients writing custom loop heads.
pub use loops::strands_of_private;

// TESTS
// ================================================================================================
