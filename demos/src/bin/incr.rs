//! Parallel-for demo: increment every cell of an array.
//!
//! Usage: `incr n 10000000 proc 4`

use std::sync::LazyLock;

use pulse_demos::{arg_or, bootstrap};
use pulse_runtime::{
    Interpreter, launch_scheduler,
    edsl::{
        BasicBlock, BlockId, Cfg, FlowProgram, JoinKind, LoopDescriptor, LoopId, LoopRecord,
        PrivateRecord, Trampoline,
    },
};

const LOOP: LoopId = LoopId(0);

struct Incr {
    data: *mut u64,
    len: i64,
}

#[derive(Clone, Default)]
struct IncrPrivate {
    trampoline: Trampoline,
    records: [LoopRecord; 1],
}

impl PrivateRecord for IncrPrivate {
    fn trampoline(&self) -> Trampoline {
        self.trampoline
    }

    fn set_trampoline(&mut self, t: Trampoline) {
        self.trampoline = t;
    }

    fn loop_record(&mut self, id: LoopId) -> &mut LoopRecord {
        &mut self.records[id.index()]
    }

    fn loop_record_ref(&self, id: LoopId) -> &LoopRecord {
        &self.records[id.index()]
    }
}

static INCR_CFG: LazyLock<Cfg<Incr>> = LazyLock::new(|| {
    let blocks = vec![
        // 0: loop setup
        BasicBlock::UnconditionalJump {
            code: |s: &mut Incr, p: &mut IncrPrivate| {
                p.loop_record(LOOP).set_range(0, s.len);
            },
            next: BlockId(1),
        },
        // 1: loop head; one iteration per basic block
        BasicBlock::ConditionalJump {
            code: |s: &mut Incr, p: &mut IncrPrivate| match p.loop_record(LOOP).next_iteration() {
                Some(i) => {
                    // SAFETY: iterations are distributed disjointly over
                    // siblings, so cell `i` has exactly one writer.
                    unsafe { *s.data.offset(i as isize) += 1 };
                    1
                },
                None => 0,
            },
            targets: vec![BlockId::EXIT, BlockId(1)],
        },
    ];
    let loops = vec![LoopDescriptor {
        join: JoinKind::Trivial,
        entry: Trampoline { pred: BlockId(0), succ: BlockId(1) },
        exit: Trampoline { pred: BlockId(1), succ: BlockId::EXIT },
        parents: vec![],
        combine: None,
    }];
    // Block 0 counts as loop territory so a freshly split sibling (whose
    // trampoline points at the loop entry) reports its true strand count.
    let loop_of = vec![Some(LOOP), Some(LOOP)];
    Cfg::with_loops(blocks, loops, loop_of)
});

impl FlowProgram for Incr {
    type Private = IncrPrivate;

    fn cfg() -> &'static Cfg<Incr> {
        &INCR_CFG
    }
}

fn main() {
    let (options, args) = bootstrap();
    let n: i64 = arg_or(&args, "n", 10_000_000);

    let mut data = vec![0u64; n as usize];
    let root = Interpreter::spawn(Incr { data: data.as_mut_ptr(), len: n });
    let stats = launch_scheduler(options, root);

    assert!(data.iter().all(|&x| x == 1), "some cell was not incremented exactly once");
    println!("incremented {n} cells");
    println!("steals: {}, promotions: {}", stats.nb_steals, stats.nb_promotions);
}
