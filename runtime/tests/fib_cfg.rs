//! Fork-join Fibonacci through the CFG interpreter.

use std::sync::LazyLock;

use pulse_runtime::{
    Interpreter, RuntimeOptions, launch_scheduler, push_call,
    cactus::{LinkKind, Stack},
    edsl::{BasicBlock, BasicPrivate, BlockId, Cfg, FlowProgram},
};
use rstest::rstest;

const CUTOFF: u64 = 1;

fn fib_seq(n: u64) -> u64 {
    if n <= 1 { n } else { fib_seq(n - 1) + fib_seq(n - 2) }
}

struct Fib {
    n: u64,
    out: *mut u64,
    d1: u64,
    d2: u64,
}

impl Fib {
    fn call(n: u64, out: *mut u64) -> Self {
        Fib { n, out, d1: 0, d2: 0 }
    }
}

static FIB_CFG: LazyLock<Cfg<Fib>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::ConditionalJump {
            code: |s: &mut Fib, _: &mut BasicPrivate| {
                if s.n <= CUTOFF {
                    unsafe { *s.out = fib_seq(s.n) };
                    0
                } else {
                    1
                }
            },
            targets: vec![BlockId::EXIT, BlockId(1)],
        },
        BasicBlock::Spawn2Join {
            body: |s: &mut Fib, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Fib::call(s.n - 1, &mut s.d1))
            },
            next: BlockId(2),
        },
        BasicBlock::SpawnJoin {
            body: |s: &mut Fib, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Fib::call(s.n - 2, &mut s.d2))
            },
            next: BlockId(3),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Fib, _: &mut BasicPrivate| unsafe { *s.out = s.d1 + s.d2 },
            next: BlockId::EXIT,
        },
    ])
});

impl FlowProgram for Fib {
    type Private = BasicPrivate;

    fn cfg() -> &'static Cfg<Fib> {
        &FIB_CFG
    }
}

fn run_fib(n: u64, options: RuntimeOptions) -> u64 {
    let mut result = 0u64;
    let root = Interpreter::spawn(Fib::call(n, &mut result));
    launch_scheduler(options, root);
    result
}

#[test]
fn fib_5_single_worker() {
    assert_eq!(run_fib(5, RuntimeOptions::default()), 5);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
fn fib_18_any_worker_count(#[case] nb_workers: usize) {
    let options = RuntimeOptions::default().with_nb_workers(nb_workers).with_dag_freq(64);
    assert_eq!(run_fib(18, options), 2584);
}

// Promotions happen at every heartbeat with a one-block budget; the result
// must not change.
#[test]
fn fib_with_pathological_heartbeat() {
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(1).with_sharing_freq(1);
    assert_eq!(run_fib(12, options), 144);
}

// The debugging switch that disables promotion entirely degrades to plain
// sequential execution.
#[test]
fn fib_never_promote() {
    let options = RuntimeOptions::default().with_never_promote(true).with_dag_freq(16);
    assert_eq!(run_fib(12, options), 144);
}
