//! Naive Fibonacci with a lazy fork at every recursive case.
//!
//! Usage: `fib n 30 cutoff 12 proc 4 [dag_freq 2048] [sharing_freq 4096]`

use std::sync::LazyLock;

use pulse_demos::{arg_or, bootstrap};
use pulse_runtime::{
    Interpreter, launch_scheduler, push_call,
    cactus::{LinkKind, Stack},
    edsl::{BasicBlock, BasicPrivate, BlockId, Cfg, FlowProgram},
};

static CUTOFF: LazyLock<u64> = LazyLock::new(|| arg_from_env());

fn arg_from_env() -> u64 {
    // The cutoff is read once, before the CFG ever runs.
    let args: Vec<String> = std::env::args().skip(1).collect();
    arg_or(&args, "cutoff", 2)
}

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
    let blocks = vec![
        // 0: base case
        BasicBlock::ConditionalJump {
            code: |s: &mut Fib, _: &mut BasicPrivate| {
                if s.n <= *CUTOFF {
                    // SAFETY: `out` points into the caller's live frame.
                    unsafe { *s.out = fib_seq(s.n) };
                    0
                } else {
                    1
                }
            },
            targets: vec![BlockId::EXIT, BlockId(1)],
        },
        // 1: first branch, a lazy fork point
        BasicBlock::Spawn2Join {
            body: |s: &mut Fib, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Fib::call(s.n - 1, &mut s.d1))
            },
            next: BlockId(2),
        },
        // 2: second branch, runs after (or concurrently with) the first
        BasicBlock::SpawnJoin {
            body: |s: &mut Fib, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Fib::call(s.n - 2, &mut s.d2))
            },
            next: BlockId(3),
        },
        // 3: combine
        BasicBlock::UnconditionalJump {
            code: |s: &mut Fib, _: &mut BasicPrivate| {
                // SAFETY: as above.
                unsafe { *s.out = s.d1 + s.d2 };
            },
            next: BlockId::EXIT,
        },
    ];
    Cfg::new(blocks)
});

impl FlowProgram for Fib {
    type Private = BasicPrivate;

    fn cfg() -> &'static Cfg<Fib> {
        &FIB_CFG
    }
}

fn main() {
    let (options, args) = bootstrap();
    let n: u64 = arg_or(&args, "n", 30);

    let mut result = 0u64;
    let root = Interpreter::spawn(Fib::call(n, &mut result));
    let stats = launch_scheduler(options, root);

    println!("fib({n}) = {result}");
    println!(
        "steals: {}, promotions: {}, stacklets: {}/{}",
        stats.nb_steals,
        stats.nb_promotions,
        stats.nb_stacklets_allocated,
        stats.nb_stacklets_freed
    );
    assert_eq!(result, fib_seq(n));
}
