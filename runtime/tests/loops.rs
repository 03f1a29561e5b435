//! Parallel loop tests: trivial-join splitting, combine-join reductions,
//! and the two-worker steal scenario.

use std::sync::LazyLock;

use pulse_runtime::{
    Interpreter, RuntimeOptions, launch_scheduler,
    edsl::{
        BasicBlock, BlockId, Cfg, FlowProgram, JoinKind, LoopDescriptor, LoopId, LoopRecord,
        PrivateRecord, Trampoline,
    },
};

const LOOP: LoopId = LoopId(0);

// PARALLEL FOR
// ================================================================================================

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
        BasicBlock::UnconditionalJump {
            code: |s: &mut Incr, p: &mut IncrPrivate| {
                p.loop_record(LOOP).set_range(0, s.len);
            },
            next: BlockId(1),
        },
        BasicBlock::ConditionalJump {
            code: |s: &mut Incr, p: &mut IncrPrivate| match p.loop_record(LOOP).next_iteration() {
                Some(i) => {
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
    Cfg::with_loops(blocks, loops, vec![Some(LOOP), Some(LOOP)])
});

impl FlowProgram for Incr {
    type Private = IncrPrivate;

    fn cfg() -> &'static Cfg<Incr> {
        &INCR_CFG
    }
}

fn run_incr(n: i64, options: RuntimeOptions) -> (Vec<u64>, pulse_runtime::Stats) {
    let mut data = vec![0u64; n as usize];
    let root = Interpreter::spawn(Incr { data: data.as_mut_ptr(), len: n });
    let stats = launch_scheduler(options, root);
    (data, stats)
}

#[test]
fn parallel_for_single_worker() {
    let (data, stats) = run_incr(10_000, RuntimeOptions::default());
    assert!(data.iter().all(|&x| x == 1));
    assert_eq!(stats.nb_steals, 0);
}

// 10000 independent strands on two workers: every cell is incremented
// exactly once and at least one steal happened.
#[test]
fn parallel_for_two_workers_steals() {
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(256);
    let (data, stats) = run_incr(100_000, options);
    assert!(data.iter().all(|&x| x == 1), "a cell was missed or doubled");
    assert!(stats.nb_steals >= 1, "two busy workers never exchanged work");
    assert!(stats.nb_promotions >= 1);
}

#[test]
fn parallel_for_empty_range() {
    let (data, _) = run_incr(0, RuntimeOptions::default());
    assert!(data.is_empty());
}

// PARALLEL REDUCE
// ================================================================================================

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
        BasicBlock::UnconditionalJump {
            code: |s: &mut SumSquares, p: &mut SumPrivate| {
                p.loop_record(LOOP).set_range(0, s.n);
            },
            next: BlockId(1),
        },
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
        BasicBlock::JoinChildren { loop_id: LOOP, next: BlockId(3) },
        BasicBlock::ConditionalJump {
            code: |_: &mut SumSquares, p: &mut SumPrivate| {
                if p.loop_record(LOOP).has_destination() { 0 } else { 1 }
            },
            targets: vec![BlockId::EXIT, BlockId(4)],
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut SumSquares, p: &mut SumPrivate| unsafe { *s.out = p.acc },
            next: BlockId::EXIT,
        },
        BasicBlock::UnconditionalJump {
            code: |_: &mut SumSquares, p: &mut SumPrivate| p.acc = 0,
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
    Cfg::with_loops(blocks, loops, vec![Some(LOOP), Some(LOOP), None, None, None, Some(LOOP)])
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

fn run_reduce(n: i64, options: RuntimeOptions) -> u64 {
    let mut result = 0u64;
    let root = Interpreter::spawn(SumSquares { n, out: &mut result });
    launch_scheduler(options, root);
    result
}

#[test]
fn reduce_single_worker() {
    assert_eq!(run_reduce(10_000, RuntimeOptions::default()), sum_squares(10_000));
}

#[test]
fn reduce_multi_worker_combines_every_child() {
    let options = RuntimeOptions::default().with_nb_workers(4).with_dag_freq(128);
    assert_eq!(run_reduce(200_000, options), sum_squares(200_000));
}

#[test]
fn reduce_with_aggressive_splitting() {
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(8).with_sharing_freq(4);
    assert_eq!(run_reduce(5_000, options), sum_squares(5_000));
}
