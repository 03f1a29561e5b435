//! Statement combinators that linearize into a [`Cfg`].
//!
//! Hand-numbering basic blocks is fine for small programs and tests, but
//! real programs read better as a statement tree. [`Stmt`] covers the
//! sequential core — straight-line code, multiway branches, calls, forks,
//! futures — and [`Stmt::into_cfg`] flattens the tree into numbered blocks.
//! Parallel loops still need explicit descriptors and are built directly
//! against [`Cfg::with_loops`].

use super::{
    BasicBlock, BlockFn, BlockId, CallFn, Cfg, CondFn, ENTRY_BLOCK, FlowProgram, IncounterSlotFn,
    OutsetSlotFn,
};

/// One statement of a program; a tree of these flattens to a CFG.
pub enum Stmt<S: FlowProgram> {
    /// Straight-line code.
    Exec(BlockFn<S>),
    /// Statements in order.
    Seq(Vec<Stmt<S>>),
    /// Multiway branch: `code` picks which arm runs; all arms rejoin after
    /// the switch.
    Switch(CondFn<S>, Vec<Stmt<S>>),
    /// Plain call.
    Call(CallFn<S>),
    /// Fork-join pair: the first body is a lazy fork point, the second runs
    /// after (or concurrently with) it; execution continues when both are
    /// done.
    Fork2(CallFn<S>, CallFn<S>),
    /// Tail call: replaces the current activation.
    TailCall(CallFn<S>),
    /// Start a future into the slot.
    Future(OutsetSlotFn<S>, CallFn<S>),
    /// Block until the future in the slot is done.
    Await(OutsetSlotFn<S>),
    /// Fork a child joined through this activation's own incounter.
    ForkJoined(IncounterSlotFn<S>, CallFn<S>),
    /// Detach a producer targeting the incounter in the slot.
    Detach(IncounterSlotFn<S>, CallFn<S>),
}

impl<S: FlowProgram> Stmt<S> {
    /// Flattens the statement tree into a CFG whose entry is the first
    /// statement.
    pub fn into_cfg(self) -> Cfg<S> {
        let mut blocks: Vec<Option<BasicBlock<S>>> = Vec::new();
        let entry = emit(self, &mut blocks, BlockId::EXIT);
        let mut blocks: Vec<BasicBlock<S>> =
            blocks.into_iter().map(|b| b.expect("unfilled block")).collect();
        // The interpreter enters at block 0; rotate the entry there.
        if entry != ENTRY_BLOCK && entry != BlockId::EXIT {
            blocks.swap(0, entry.index());
            for block in &mut blocks {
                remap(block, ENTRY_BLOCK, entry);
            }
        }
        assert!(!blocks.is_empty(), "a program needs at least one statement");
        Cfg::new(blocks)
    }
}

fn reserve<S: FlowProgram>(blocks: &mut Vec<Option<BasicBlock<S>>>) -> BlockId {
    blocks.push(None);
    BlockId((blocks.len() - 1) as u32)
}

/// Emits `stmt` with continuation `next`; returns the statement's entry
/// label (or `next` itself for an empty sequence).
fn emit<S: FlowProgram>(
    stmt: Stmt<S>,
    blocks: &mut Vec<Option<BasicBlock<S>>>,
    next: BlockId,
) -> BlockId {
    match stmt {
        Stmt::Exec(code) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::UnconditionalJump { code, next });
            id
        },
        Stmt::Seq(list) => {
            let mut cont = next;
            for s in list.into_iter().rev() {
                cont = emit(s, blocks, cont);
            }
            cont
        },
        Stmt::Switch(code, arms) => {
            let id = reserve(blocks);
            let targets = arms.into_iter().map(|arm| emit(arm, blocks, next)).collect();
            blocks[id.index()] = Some(BasicBlock::ConditionalJump { code, targets });
            id
        },
        Stmt::Call(body) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::SpawnJoin { body, next });
            id
        },
        Stmt::Fork2(first, second) => {
            let fork = reserve(blocks);
            let join = reserve(blocks);
            blocks[fork.index()] = Some(BasicBlock::Spawn2Join { body: first, next: join });
            blocks[join.index()] = Some(BasicBlock::SpawnJoin { body: second, next });
            fork
        },
        Stmt::TailCall(body) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::Tail { body, next });
            id
        },
        Stmt::Future(getter, body) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::SpawnPlus { getter, body, next });
            id
        },
        Stmt::Await(getter) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::JoinMinus { getter, next });
            id
        },
        Stmt::ForkJoined(getter, body) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::JoinPlus { getter, body, next });
            id
        },
        Stmt::Detach(getter, body) => {
            let id = reserve(blocks);
            blocks[id.index()] = Some(BasicBlock::SpawnMinus { getter, body, next });
            id
        },
    }
}

/// Swaps every occurrence of the labels `a` and `b` in a block's targets.
fn remap<S: FlowProgram>(block: &mut BasicBlock<S>, a: BlockId, b: BlockId) {
    let fix = |id: &mut BlockId| {
        if *id == a {
            *id = b;
        } else if *id == b {
            *id = a;
        }
    };
    match block {
        BasicBlock::UnconditionalJump { next, .. }
        | BasicBlock::SpawnJoin { next, .. }
        | BasicBlock::Spawn2Join { next, .. }
        | BasicBlock::Tail { next, .. }
        | BasicBlock::SpawnPlus { next, .. }
        | BasicBlock::JoinPlus { next, .. }
        | BasicBlock::SpawnMinus { next, .. }
        | BasicBlock::JoinMinus { next, .. }
        | BasicBlock::JoinChildren { next, .. } => fix(next),
        BasicBlock::ConditionalJump { targets, .. } => targets.iter_mut().for_each(fix),
    }
}

// TESTS
// ================================================================================================
