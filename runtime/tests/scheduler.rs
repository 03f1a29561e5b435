//! Scheduler lifecycle tests with hand-written vertices.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use pulse_runtime::{
    Fuel, RunOutcome, RuntimeOptions, Vertex, VertexCore, VertexRef, launch, launch_scheduler,
    new_edge, release, suspend,
};

// A vertex that does one unit of work and finishes.
struct Once {
    core: VertexCore,
    runs: Arc<AtomicUsize>,
    done: bool,
}

impl Once {
    fn create(runs: &Arc<AtomicUsize>) -> VertexRef {
        VertexRef::new(Box::new(Once {
            core: VertexCore::new(),
            runs: Arc::clone(runs),
            done: false,
        }))
    }
}

impl Vertex for Once {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.done { 0 } else { 1 }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        self.done = true;
        self.runs.fetch_add(1, Ordering::Relaxed);
        RunOutcome::Completed(fuel.saturating_sub(1))
    }
}

// Terminates, deletes the vertex, and leaves no worker thread behind: the
// launch call only returns after joining every worker.
#[test]
fn single_worker_single_vertex() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stats = launch(1, Once::create(&runs));
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(stats.nb_steals, 0);
}

// A vertex with many in-edges is scheduled exactly once, after all of its
// predecessors completed; each edge is decremented exactly once.
struct FanIn {
    core: VertexCore,
    join_runs: Arc<AtomicUsize>,
    pred_runs: Arc<AtomicUsize>,
    built: bool,
}

impl Vertex for FanIn {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.built { 0 } else { 1 }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        self.built = true;
        let join = Once::create(&self.join_runs);
        for _ in 0..100 {
            let pred = Once::create(&self.pred_runs);
            new_edge(&pred, &join);
            release(pred);
        }
        release(join);
        RunOutcome::Completed(fuel.saturating_sub(1))
    }
}

#[test]
fn release_exactly_once_under_fan_in() {
    let join_runs = Arc::new(AtomicUsize::new(0));
    let pred_runs = Arc::new(AtomicUsize::new(0));
    let driver = VertexRef::new(Box::new(FanIn {
        core: VertexCore::new(),
        join_runs: Arc::clone(&join_runs),
        pred_runs: Arc::clone(&pred_runs),
        built: false,
    }));
    launch(2, driver);
    assert_eq!(pred_runs.load(Ordering::Relaxed), 100);
    assert_eq!(join_runs.load(Ordering::Relaxed), 1);
}

// Hand-rolled fork-join Fibonacci, the DAG way: every recursive case
// creates two children wired to the parent, which re-runs as the join.
enum FibState {
    Entry,
    Join,
    Exit,
}

struct FibManual {
    core: VertexCore,
    n: u64,
    out: *mut u64,
    d1: u64,
    d2: u64,
    state: FibState,
}

// SAFETY: the `out` pointer targets a field of the parent vertex, which is
// kept alive by the join edges until this vertex completed.
unsafe impl Send for FibManual {}

impl FibManual {
    fn create(n: u64, out: *mut u64) -> VertexRef {
        VertexRef::new(Box::new(FibManual {
            core: VertexCore::new(),
            n,
            out,
            d1: 0,
            d2: 0,
            state: FibState::Entry,
        }))
    }
}

impl Vertex for FibManual {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        match self.state {
            FibState::Exit => 0,
            _ => 1,
        }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        match self.state {
            FibState::Entry => {
                if self.n <= 1 {
                    unsafe { *self.out = self.n };
                    self.state = FibState::Exit;
                    return RunOutcome::Completed(fuel.saturating_sub(1));
                }
                let d1: *mut u64 = &mut self.d1;
                let d2: *mut u64 = &mut self.d2;
                let b1 = FibManual::create(self.n - 1, d1);
                let b2 = FibManual::create(self.n - 2, d2);
                self.state = FibState::Join;
                let me = self.core.vertex_ref();
                new_edge(&b2, &me);
                new_edge(&b1, &me);
                release(b2);
                release(b1);
                RunOutcome::Released(fuel.saturating_sub(1))
            },
            FibState::Join => {
                unsafe { *self.out = self.d1 + self.d2 };
                self.state = FibState::Exit;
                RunOutcome::Completed(fuel.saturating_sub(1))
            },
            FibState::Exit => unreachable!("ran a finished vertex"),
        }
    }
}

#[test]
fn manual_fork_join_fib() {
    let mut result = 0u64;
    launch(2, FibManual::create(15, &mut result));
    assert_eq!(result, 610);
}

// A vertex on the suspended list is revisited between heartbeats until its
// dependency is satisfied.
struct Waiter {
    core: VertexCore,
    flag: Arc<AtomicUsize>,
    revisits: Arc<AtomicUsize>,
    done: bool,
}

impl Vertex for Waiter {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.done { 0 } else { 1 }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        if self.flag.load(Ordering::Relaxed) == 0 {
            self.revisits.fetch_add(1, Ordering::Relaxed);
            suspend(self.core.vertex_ref());
            return RunOutcome::Released(fuel);
        }
        self.done = true;
        RunOutcome::Completed(fuel)
    }
}

struct WaiterSetup {
    core: VertexCore,
    flag: Arc<AtomicUsize>,
    revisits: Arc<AtomicUsize>,
    built: bool,
}

impl Vertex for WaiterSetup {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.built { 0 } else { 1 }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        self.built = true;
        // Release the setter first: the waiter then sits newest on the
        // LIFO frontier and runs ahead of it, forcing a suspension.
        let waiter = VertexRef::new(Box::new(Waiter {
            core: VertexCore::new(),
            flag: Arc::clone(&self.flag),
            revisits: Arc::clone(&self.revisits),
            done: false,
        }));
        let flag = Arc::clone(&self.flag);
        let setter = VertexRef::new(Box::new(Setter { core: VertexCore::new(), flag }));
        release(setter);
        release(waiter);
        RunOutcome::Completed(fuel.saturating_sub(1))
    }
}

struct Setter {
    core: VertexCore,
    flag: Arc<AtomicUsize>,
}

impl Vertex for Setter {
    fn core(&self) -> &VertexCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VertexCore {
        &mut self.core
    }

    fn nb_strands(&self) -> usize {
        if self.flag.load(Ordering::Relaxed) == 0 { 1 } else { 0 }
    }

    fn run(&mut self, fuel: Fuel) -> RunOutcome {
        self.flag.store(1, Ordering::Relaxed);
        RunOutcome::Completed(fuel.saturating_sub(1))
    }
}

#[test]
fn suspended_vertices_are_revisited() {
    let flag = Arc::new(AtomicUsize::new(0));
    let revisits = Arc::new(AtomicUsize::new(0));
    let driver = VertexRef::new(Box::new(WaiterSetup {
        core: VertexCore::new(),
        flag: Arc::clone(&flag),
        revisits: Arc::clone(&revisits),
        built: false,
    }));
    launch(1, driver);
    assert_eq!(flag.load(Ordering::Relaxed), 1);
    assert!(revisits.load(Ordering::Relaxed) >= 1, "the waiter never ran before the setter");
}

#[test]
fn options_reach_the_scheduler() {
    let runs = Arc::new(AtomicUsize::new(0));
    let options = RuntimeOptions::default().with_nb_workers(3).with_dag_freq(64);
    let stats = launch_scheduler(options, Once::create(&runs));
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    // Nothing to steal from a one-shot vertex.
    assert_eq!(stats.nb_grants, 0);
}
