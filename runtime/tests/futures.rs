//! Futures and asymmetric producer/consumer edges: `SpawnPlus`/`JoinMinus`
//! pipelines, `JoinPlus` joins, and a `SpawnMinus` handshake.
//!
//! All of these degrade to plain sequential execution when no heartbeat
//! fires between the spawn and the join; the tests run both regimes.

use std::sync::{
    LazyLock,
    atomic::{AtomicBool, Ordering},
};

use pulse_runtime::{
    Interpreter, RuntimeOptions, launch_scheduler, push_call,
    cactus::{LinkKind, Stack},
    edsl::{
        BasicBlock, BasicPrivate, BlockId, Cfg, FlowProgram, IncounterSlot, OutsetSlot,
    },
};

// A task that burns `burn` blocks, then writes `value` through `out`.
struct Task {
    out: *mut u64,
    value: u64,
    burn: i64,
}

static TASK_CFG: LazyLock<Cfg<Task>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::ConditionalJump {
            code: |s: &mut Task, _: &mut BasicPrivate| {
                if s.burn > 0 {
                    s.burn -= 1;
                    0
                } else {
                    1
                }
            },
            targets: vec![BlockId(0), BlockId(1)],
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Task, _: &mut BasicPrivate| unsafe { *s.out = s.value },
            next: BlockId::EXIT,
        },
    ])
});

impl FlowProgram for Task {
    type Private = BasicPrivate;

    fn cfg() -> &'static Cfg<Task> {
        &TASK_CFG
    }
}

// SPAWN_PLUS / JOIN_MINUS
// ================================================================================================

// Start a future, do unrelated work, then block on the future's outset.
struct Pipeline {
    fut: OutsetSlot,
    val: u64,
    filler: i64,
    out: *mut u64,
}

static PIPELINE_CFG: LazyLock<Cfg<Pipeline>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::SpawnPlus {
            getter: |s: &mut Pipeline, _: &mut BasicPrivate| &mut s.fut,
            body: |s: &mut Pipeline, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Task { out: &mut s.val, value: 41, burn: 64 })
            },
            next: BlockId(1),
        },
        BasicBlock::ConditionalJump {
            code: |s: &mut Pipeline, _: &mut BasicPrivate| {
                if s.filler > 0 {
                    s.filler -= 1;
                    0
                } else {
                    1
                }
            },
            targets: vec![BlockId(1), BlockId(2)],
        },
        BasicBlock::JoinMinus {
            getter: |s: &mut Pipeline, _: &mut BasicPrivate| &mut s.fut,
            next: BlockId(3),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Pipeline, _: &mut BasicPrivate| unsafe { *s.out = s.val + 1 },
            next: BlockId::EXIT,
        },
    ])
});

impl FlowProgram for Pipeline {
    type Private = BasicPrivate;

    fn cfg() -> &'static Cfg<Pipeline> {
        &PIPELINE_CFG
    }
}

fn run_pipeline(options: RuntimeOptions) -> u64 {
    let mut result = 0u64;
    let root =
        Interpreter::spawn(Pipeline { fut: None, val: 0, filler: 32, out: &mut result });
    launch_scheduler(options, root);
    result
}

// No heartbeat fires: the future is elided and the callee runs inline.
#[test]
fn future_elided_sequentially() {
    assert_eq!(run_pipeline(RuntimeOptions::default()), 42);
}

// A one-block heartbeat promotes the future immediately; the consumer
// suspends on the outset and resumes after the future completes.
#[test]
fn future_promoted_and_joined() {
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(1).with_sharing_freq(1);
    assert_eq!(run_pipeline(options), 42);
}

#[test]
fn future_with_moderate_heartbeat() {
    let options = RuntimeOptions::default().with_dag_freq(16);
    assert_eq!(run_pipeline(options), 42);
}

// JOIN_PLUS
// ================================================================================================

// Fork a child and wait for it through this vertex's own incounter.
struct Joined {
    inc: IncounterSlot,
    val: u64,
    out: *mut u64,
}

static JOINED_CFG: LazyLock<Cfg<Joined>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::JoinPlus {
            getter: |s: &mut Joined, _: &mut BasicPrivate| &mut s.inc,
            body: |s: &mut Joined, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Task { out: &mut s.val, value: 41, burn: 64 })
            },
            next: BlockId(1),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Joined, _: &mut BasicPrivate| unsafe { *s.out = s.val * 2 },
            next: BlockId::EXIT,
        },
    ])
});

impl FlowProgram for Joined {
    type Private = BasicPrivate;

    fn cfg() -> &'static Cfg<Joined> {
        &JOINED_CFG
    }
}

fn run_joined(options: RuntimeOptions) -> u64 {
    let mut result = 0u64;
    let root = Interpreter::spawn(Joined { inc: None, val: 0, out: &mut result });
    launch_scheduler(options, root);
    result
}

#[test]
fn join_plus_sequential_and_promoted() {
    assert_eq!(run_joined(RuntimeOptions::default()), 82);
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(1).with_sharing_freq(1);
    assert_eq!(run_joined(options), 82);
}

// SPAWN_MINUS HANDSHAKE
// ================================================================================================
//
// A consumer forks a child through `JoinPlus`, which publishes the
// consumer's incounter into a shared cell. A producer, once the cell is
// announced, targets that incounter with `SpawnMinus`: its detached task
// becomes one more thing the consumer waits for. The child holds out until
// the producer's continuation signals it, which guarantees the producer's
// edge is in place before the consumer can wake.

struct Driver {
    cell: IncounterSlot,
    cell_ready: AtomicBool,
    flag: AtomicBool,
    b: u64,
    sum: u64,
    out: *mut u64,
}

struct Consumer {
    cell: *mut IncounterSlot,
    cell_ready: *const AtomicBool,
    flag: *const AtomicBool,
    b: *const u64,
    sum_out: *mut u64,
    val: u64,
}

struct SpinTask {
    cell_ready: *const AtomicBool,
    flag: *const AtomicBool,
    out: *mut u64,
}

struct Producer {
    cell: *mut IncounterSlot,
    cell_ready: *const AtomicBool,
    flag: *const AtomicBool,
    b: *mut u64,
}

struct WriteTask {
    out: *mut u64,
}

static DRIVER_CFG: LazyLock<Cfg<Driver>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::Spawn2Join {
            body: |s: &mut Driver, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Consumer {
                    cell: &mut s.cell,
                    cell_ready: &s.cell_ready,
                    flag: &s.flag,
                    b: &s.b,
                    sum_out: &mut s.sum,
                    val: 0,
                })
            },
            next: BlockId(1),
        },
        BasicBlock::SpawnJoin {
            body: |s: &mut Driver, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, Producer {
                    cell: &mut s.cell,
                    cell_ready: &s.cell_ready,
                    flag: &s.flag,
                    b: &mut s.b,
                })
            },
            next: BlockId(2),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Driver, _: &mut BasicPrivate| unsafe { *s.out = s.sum },
            next: BlockId::EXIT,
        },
    ])
});

static CONSUMER_CFG: LazyLock<Cfg<Consumer>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::JoinPlus {
            getter: |s: &mut Consumer, _: &mut BasicPrivate| unsafe { &mut *s.cell },
            body: |s: &mut Consumer, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, SpinTask {
                    cell_ready: s.cell_ready,
                    flag: s.flag,
                    out: &mut s.val,
                })
            },
            next: BlockId(1),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Consumer, _: &mut BasicPrivate| unsafe {
                *s.sum_out = s.val + *s.b;
            },
            next: BlockId::EXIT,
        },
    ])
});

static SPIN_TASK_CFG: LazyLock<Cfg<SpinTask>> = LazyLock::new(|| {
    Cfg::new(vec![
        // Announce that the consumer's incounter is published; this runs
        // strictly after the JoinPlus promotion that detached this task.
        BasicBlock::UnconditionalJump {
            code: |s: &mut SpinTask, _: &mut BasicPrivate| {
                unsafe { &*s.cell_ready }.store(true, Ordering::Release);
            },
            next: BlockId(1),
        },
        BasicBlock::ConditionalJump {
            code: |s: &mut SpinTask, _: &mut BasicPrivate| {
                if unsafe { &*s.flag }.load(Ordering::Acquire) { 1 } else { 0 }
            },
            targets: vec![BlockId(1), BlockId(2)],
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut SpinTask, _: &mut BasicPrivate| unsafe { *s.out = 41 },
            next: BlockId::EXIT,
        },
    ])
});

static PRODUCER_CFG: LazyLock<Cfg<Producer>> = LazyLock::new(|| {
    Cfg::new(vec![
        BasicBlock::ConditionalJump {
            code: |s: &mut Producer, _: &mut BasicPrivate| {
                if unsafe { &*s.cell_ready }.load(Ordering::Acquire) { 1 } else { 0 }
            },
            targets: vec![BlockId(0), BlockId(1)],
        },
        BasicBlock::SpawnMinus {
            getter: |s: &mut Producer, _: &mut BasicPrivate| unsafe { &mut *s.cell },
            body: |s: &mut Producer, _: &mut BasicPrivate, link: LinkKind, st: Stack| {
                push_call(st, link, WriteTask { out: s.b })
            },
            next: BlockId(2),
        },
        BasicBlock::UnconditionalJump {
            code: |s: &mut Producer, _: &mut BasicPrivate| {
                unsafe { &*s.flag }.store(true, Ordering::Release);
            },
            next: BlockId::EXIT,
        },
    ])
});

static WRITE_TASK_CFG: LazyLock<Cfg<WriteTask>> = LazyLock::new(|| {
    Cfg::new(vec![BasicBlock::UnconditionalJump {
        code: |s: &mut WriteTask, _: &mut BasicPrivate| unsafe { *s.out = 100 },
        next: BlockId::EXIT,
    }])
});

impl FlowProgram for Driver {
    type Private = BasicPrivate;
    fn cfg() -> &'static Cfg<Driver> {
        &DRIVER_CFG
    }
}

impl FlowProgram for Consumer {
    type Private = BasicPrivate;
    fn cfg() -> &'static Cfg<Consumer> {
        &CONSUMER_CFG
    }
}

impl FlowProgram for SpinTask {
    type Private = BasicPrivate;
    fn cfg() -> &'static Cfg<SpinTask> {
        &SPIN_TASK_CFG
    }
}

impl FlowProgram for Producer {
    type Private = BasicPrivate;
    fn cfg() -> &'static Cfg<Producer> {
        &PRODUCER_CFG
    }
}

impl FlowProgram for WriteTask {
    type Private = BasicPrivate;
    fn cfg() -> &'static Cfg<WriteTask> {
        &WRITE_TASK_CFG
    }
}

#[test]
fn spawn_minus_signals_a_foreign_incounter() {
    let mut result = 0u64;
    let root = Interpreter::spawn(Driver {
        cell: None,
        cell_ready: AtomicBool::new(false),
        flag: AtomicBool::new(false),
        b: 0,
        sum: 0,
        out: &mut result,
    });
    // The handshake needs real concurrency and a one-block heartbeat so
    // every fork point promotes.
    let options = RuntimeOptions::default().with_nb_workers(2).with_dag_freq(1).with_sharing_freq(1);
    launch_scheduler(options, root);
    assert_eq!(result, 141);
}
