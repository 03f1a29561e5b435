//! Parallel-loop strand accounting and split policies.
//!
//! A frame is splittable when one of its parallel loops still holds at
//! least two iterations. Splitting hands the top half of the oldest such
//! loop's range to a sibling vertex; the join policy of the loop decides
//! how the siblings meet again (shared join vertex, or combine futures).

use std::{mem, ptr::NonNull, sync::Arc};

use crate::{
    cactus::{self, FrameRef},
    edsl::{FlowProgram, JoinKind, LoopId, PrivateRecord},
    interpreter::{
        Interpreter, SharedSlot, create_stack, frame_parts, frame_private, refresh_marks,
    },
    scheduler,
    vertex::VertexRef,
};

// STRAND ACCOUNTING
// ================================================================================================

/// Number of strands a private record currently represents.
///
/// One for plain sequential work; the iteration count of the oldest
/// enclosing loop that still has at least two iterations; zero once the
/// activation has returned.
pub fn strands_of_private<S: FlowProgram>(par: &S::Private) -> usize {
    let t = par.trampoline();
    if t.pred == crate::edsl::BlockId::EXIT {
        return 0;
    }
    let Some(current) = S::cfg().innermost_loop(t.pred) else {
        return 1;
    };
    match oldest_nonempty_loop::<S>(par, current) {
        Some(id) => par.loop_record_ref(id).nb_strands().max(1),
        None => 1,
    }
}

/// Outermost enclosing loop with at least two remaining iterations.
fn oldest_nonempty_loop<S: FlowProgram>(
    par: &S::Private,
    current: LoopId,
) -> Option<LoopId> {
    for &id in &S::cfg().loops[current.index()].parents {
        if par.loop_record_ref(id).nb_strands() >= 2 {
            return Some(id);
        }
    }
    if par.loop_record_ref(current).nb_strands() >= 2 { Some(current) } else { None }
}

pub(crate) unsafe fn frame_nb_strands<S: FlowProgram>(f: FrameRef) -> usize {
    // SAFETY: `f` is a live frame of type `S`.
    let par = unsafe { frame_private::<S>(f) };
    strands_of_private::<S>(par)
}

pub(crate) unsafe fn frame_splittable<S: FlowProgram>(f: FrameRef) -> bool {
    // SAFETY: as above.
    unsafe { frame_nb_strands::<S>(f) >= 2 }
}

// SPLITTING
// ================================================================================================

/// Entry point for `Vertex::split` on an interpreter whose mark is a
/// splittable loop frame.
pub(crate) unsafe fn split_interpreter<S: FlowProgram>(
    mark: FrameRef,
    interp: &mut Interpreter,
    nb: usize,
) -> (Option<VertexRef>, VertexRef) {
    // SAFETY: the mark frame is live and of type `S`.
    let (sar, par) = unsafe { frame_parts::<S>(mark) };
    let current = S::cfg()
        .innermost_loop(par.trampoline().pred)
        .expect("split requested outside a parallel loop");
    let id = oldest_nonempty_loop::<S>(par, current).expect("split with no divisible loop");
    match S::cfg().loops[id.index()].join {
        JoinKind::Trivial => unsafe { split_join_trivial::<S>(sar, par, id, interp, nb) },
        JoinKind::AssociativeCombine => unsafe {
            split_join_combine::<S>(sar, par, id, interp, nb)
        },
    }
}

/// Trivial-join split.
///
/// The first split of a loop turns the running vertex into the loop's join
/// and redistributes its state over three fresh vertices: one finishing
/// the in-flight iteration's callees, one resuming the in-flight iteration
/// afterwards, and one (the returned replacement) carrying the remaining
/// iterations. Later splits just carve a sibling range off the replacement.
unsafe fn split_join_trivial<S: FlowProgram>(
    sar: &mut S,
    par0: &mut S::Private,
    id: LoopId,
    interp: &mut Interpreter,
    nb: usize,
) -> (Option<VertexRef>, VertexRef) {
    let descr = &S::cfg().loops[id.index()];
    let sar_ptr = sar as *mut S;

    let existing_join = par0.loop_record(id).as_for_mut().join;
    let replacement: Option<VertexRef>;
    let join: VertexRef;
    let par1: &mut S::Private;
    match existing_join {
        Some(j) => {
            replacement = None;
            join = j;
            par1 = par0;
        },
        None => {
            let join_ref = VertexRef::from_core(&interp.core);

            // Carve off the frames of the in-flight iteration; they run as
            // their own vertex and unblock the iteration's continuation.
            // SAFETY: the loop frame is the mark.
            let (prefix, suffix) = unsafe { cactus::split_mark(interp.stack) };
            interp.stack = prefix;

            // interp01 resumes the in-flight iteration once those frames
            // are done; it inherits the mid-iteration trampoline.
            let stack01 = create_stack::<S>(SharedSlot::Indirect(sar_ptr), par0.clone());
            // SAFETY: single freshly pushed frame.
            let par01 = unsafe { frame_private::<S>(stack01.newest()) };
            let all = par0.loop_record(id).nb_strands();
            par0.loop_record(id).split(par01.loop_record(id), all);

            // The replacement vertex takes every iteration after the
            // in-flight one and enters the loop header fresh.
            let stack1 = create_stack::<S>(SharedSlot::Indirect(sar_ptr), par01.clone());
            let par1_new = unsafe { frame_private::<S>(stack1.newest()) };
            let n01 = par01.loop_record(id).nb_strands();
            par01.loop_record(id).split(par1_new.loop_record(id), n01 - 1);

            par0.set_trampoline(descr.exit);
            par1_new.set_trampoline(descr.entry);
            par0.loop_record(id).as_for_mut().join = None;
            par01.loop_record(id).as_for_mut().join = Some(join_ref);
            par1_new.loop_record(id).as_for_mut().join = Some(join_ref);

            let interp00 = Interpreter::from_stack(suffix);
            let interp01 = Interpreter::from_stack(stack01);
            let interp1 = Interpreter::from_stack(stack1);

            // A suspension in the in-flight iteration travels with it.
            // SAFETY: interp01 is exclusively owned here.
            mem::swap(
                &mut interp.core.is_suspended,
                &mut unsafe { interp01.as_dyn_mut() }.core_mut().is_suspended,
            );

            scheduler::new_edge(&interp01, &join_ref);
            scheduler::new_edge(&interp1, &join_ref);
            scheduler::new_edge(&interp00, &interp01);
            scheduler::release(interp01);
            scheduler::release(interp00);
            interp1.detach_release();

            interp.stack = refresh_marks(interp.stack);
            replacement = Some(interp1);
            join = join_ref;
            par1 = par1_new;
        },
    }

    // Carve the requested range off the runnable side.
    let stack2 = create_stack::<S>(SharedSlot::Indirect(sar_ptr), par1.clone());
    // SAFETY: single freshly pushed frame.
    let par2 = unsafe { frame_private::<S>(stack2.newest()) };
    par1.loop_record(id).split(par2.loop_record(id), nb);
    par2.loop_record(id).as_for_mut().join = Some(join);
    par2.set_trampoline(descr.entry);
    let interp2 = Interpreter::from_stack(stack2);

    if replacement.is_none() {
        // The runnable side is this vertex; its strand count changed.
        interp.stack = refresh_marks(interp.stack);
    }
    scheduler::new_edge(&interp2, &join);
    interp2.detach_release();
    tracing::trace!(target: "pulse::interp", moved = nb, "loop split (trivial join)");
    (replacement, interp2)
}

/// Associative-combine split: the sibling is a future whose accumulator the
/// parent folds in at its `JoinChildren` block.
unsafe fn split_join_combine<S: FlowProgram>(
    sar: &mut S,
    par1: &mut S::Private,
    id: LoopId,
    interp: &mut Interpreter,
    nb: usize,
) -> (Option<VertexRef>, VertexRef) {
    let descr = &S::cfg().loops[id.index()];
    let sar_ptr = sar as *mut S;

    let stack2 = create_stack::<S>(SharedSlot::Indirect(sar_ptr), par1.clone());
    // SAFETY: single freshly pushed frame.
    let par2 = unsafe { frame_private::<S>(stack2.newest()) };
    par1.loop_record(id).split(par2.loop_record(id), nb);
    par2.set_trampoline(descr.entry);

    // The sibling publishes its accumulator here; the parent frees it
    // after combining.
    let destination =
        NonNull::new(Box::into_raw(Box::new(S::Private::default())) as *mut ()).expect("boxed");
    par2.loop_record(id).as_combine_mut().destination = Some(destination);

    let interp2 = Interpreter::from_stack(stack2);
    // SAFETY: interp2 is exclusively owned here.
    let core2 = unsafe { interp2.as_dyn_mut() }.core_mut();
    core2.enable_future();
    par1.loop_record(id)
        .as_combine_mut()
        .children
        .push((Arc::clone(core2.outset()), destination));

    interp.stack = refresh_marks(interp.stack);
    interp2.detach_release();
    tracing::trace!(target: "pulse::interp", moved = nb, "loop split (combine join)");
    (None, interp2)
}
