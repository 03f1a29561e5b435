//! Parallel reduction demo: sum of squares with an associative-combine
//! loop. Split siblings are futures; each publishes its partial sum for
//! the parent to fold in at the loop's join block.
//!
//! Usage: `reduce n 10000000 proc 4`

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

struct SumSquares {
    n: i64,
    out: *mut u64,
}

#[derive(Clone)]
struct SumPrivate {
    trampoline: Trampoline,
    acc: u64,
    records: [LoopRecord; 1],
}

impl Default for SumPrivate {
    fn default() -> Self {
        SumPrivate {
            trampoline: Trampoline::default(),
            acc: 0,
            records: [LoopRecord::parallel_combine(0, 0)],
        }
    }
}

impl PrivateRecord for SumPrivate {
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

static SUM_CFG: LazyLock<Cfg<SumSquares>> = LazyLock::new(|| {
    let blocks = vec![
        // 0: loop setup (root activation only)
        BasicBlock::UnconditionalJump {
            code: |s: &mut SumSquares, p: &mut SumPrivate| {
                p.loop_record(LOOP).set_range(0, s.n);
            },
            next: BlockId(1),
        },
        // 1: loop head, accumulating locally
        BasicBlock::ConditionalJump {
            code: |_: &mut SumSquares, p: &mut SumPrivate| {
                match p.loop_record(LOOP).next_iteration() {
                    Some(i) => {
                        p.acc += (i * i) as u64;
                        1
                    },
                    None => 0,
                }
            },
            targets: vec![BlockId(2), BlockId(1)],
        },
        // 2: fold in every split-off child future
        BasicBlock::JoinChildren { loop_id: LOOP, next: BlockId(3) },
        // 3: siblings stop here; only the root writes the final sum
        BasicBlock::ConditionalJump {
            code: |_: &mut SumSquares, p: &mut SumPrivate| {
                if p.loop_record(LOOP).has_destination() { 0 } else { 1 }
            },
            targets: vec![BlockId::EXIT, BlockId(4)],
        },
        // 4: publish the total
        BasicBlock::UnconditionalJump {
            code: |s: &mut SumSquares, p: &mut SumPrivate| {
                // SAFETY: `out` outlives the scheduler run.
                unsafe { *s.out = p.acc };
            },
            next: BlockId::EXIT,
        },
        // 5: sibling entry; accumulators start at the identity
        BasicBlock::UnconditionalJump {
            code: |_: &mut SumSquares, p: &mut SumPrivate| {
                p.acc = 0;
            },
            next: BlockId(1),
        },
    ];
    let loops = vec![LoopDescriptor {
        join: JoinKind::AssociativeCombine,
        entry: Trampoline { pred: BlockId(0), succ: BlockId(5) },
        exit: Trampoline { pred: BlockId(1), succ: BlockId(2) },
        parents: vec![],
        combine: Some(|dst: &mut SumPrivate, src: &mut SumPrivate| dst.acc += src.acc),
    }];
    // Blocks 0 and 5 count as loop territory so freshly split siblings
    // report their true strand counts before their first step.
    let loop_of = vec![Some(LOOP), Some(LOOP), None, None, None, Some(LOOP)];
    Cfg::with_loops(blocks, loops, loop_of)
});

impl FlowProgram for SumSquares {
    type Private = SumPrivate;

    fn cfg() -> &'static Cfg<SumSquares> {
        &SUM_CFG
    }
}

fn sum_squares(n: i64) -> u64 {
    (0..n).map(|i| (i * i) as u64).sum()
}

fn main() {
    let (options, args) = bootstrap();
    let n: i64 = arg_or(&args, "n", 10_000_000);

    let mut result = 0u64;
    let root = Interpreter::spawn(SumSquares { n, out: &mut result });
    let stats = launch_scheduler(options, root);

    assert_eq!(result, sum_squares(n), "reduction lost a contribution");
    println!("sum of squares below {n} = {result}");
    println!("steals: {}, promotions: {}", stats.nb_steals, stats.nb_promotions);
}
