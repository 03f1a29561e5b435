//! Worker threads: the main loop, the steal protocol, and termination.
//!
//! Each worker owns its frontier, suspended list, and RNG outright; the
//! only cross-worker traffic is the steal handshake. A thief CASes its id
//! into the victim's `request` mailbox and spins on its own `transfer`
//! mailbox — servicing incoming requests itself while it waits, so two
//! mutually stealing workers cannot deadlock. The victim answers with half
//! its frontier (split by strand weight) or a null rejection.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    ptr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
    },
    thread,
};

use pulse_utils_sync::CachePadded;
use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::{frontier::Frontier, run_vertex, stats::{Stats, WorkerStats}};
use crate::{
    options::RuntimeOptions,
    scheduler::{delete_vertex, release},
    vertex::{Fuel, VertexRef},
};

// SHARED STATE
// ================================================================================================

const NO_REQUEST: usize = usize::MAX;

/// `transfer` sentinel: the victim has not answered yet.
fn no_response() -> *mut Frontier {
    std::ptr::without_provenance_mut(1)
}

struct Mailbox {
    /// "I have more than one strand": thieves only target set workers.
    status: AtomicBool,
    /// Id of the thief currently asking, or `NO_REQUEST`. Written by
    /// thieves via CAS, cleared by the owner.
    request: AtomicUsize,
    /// One-shot reply slot for this worker's own outstanding steal.
    transfer: AtomicPtr<Frontier>,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            status: AtomicBool::new(false),
            request: AtomicUsize::new(NO_REQUEST),
            transfer: AtomicPtr::new(no_response()),
        }
    }
}

pub(crate) struct SchedulerState {
    options: RuntimeOptions,
    /// Number of workers currently holding work; zero means done.
    nb_active: AtomicUsize,
    mailboxes: Box<[CachePadded<Mailbox>]>,
    totals: Mutex<Stats>,
}

impl SchedulerState {
    fn new(options: RuntimeOptions, nb_workers: usize) -> Self {
        let mailboxes = (0..nb_workers).map(|_| CachePadded::new(Mailbox::new())).collect();
        SchedulerState {
            options,
            nb_active: AtomicUsize::new(0),
            mailboxes,
            totals: Mutex::new(Stats::default()),
        }
    }

    fn is_finished(&self) -> bool {
        self.nb_active.load(Ordering::SeqCst) == 0
    }

    fn nb_workers(&self) -> usize {
        self.mailboxes.len()
    }
}

// WORKER
// ================================================================================================

pub(crate) struct Worker {
    id: usize,
    shared: Arc<SchedulerState>,
    frontier: RefCell<Frontier>,
    suspended: RefCell<VecDeque<VertexRef>>,
    rng: RefCell<SmallRng>,
    /// Fuel consumed since this worker last granted a steal.
    work_since_grant: Cell<Fuel>,
    pub(crate) stats: WorkerStats,
}

thread_local! {
    static CURRENT: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Runs `f` against the calling thread's worker, if it is one.
pub(crate) fn with_current<R>(f: impl FnOnce(&Worker) -> R) -> Option<R> {
    CURRENT.with(|c| {
        let p = c.get();
        if p.is_null() {
            None
        } else {
            // SAFETY: the pointer is installed for the worker loop's whole
            // lifetime on this thread and cleared before the worker dies.
            Some(f(unsafe { &*p }))
        }
    })
}

thread_local! {
    // xorshift fallback for off-worker callers (setup code, unit tests).
    static FALLBACK_RNG: Cell<u64> = const { Cell::new(0x9E37_79B9_7F4A_7C15) };
}

pub(crate) fn with_id_and_rng<R>(
    f: impl FnOnce(usize, &mut dyn FnMut(usize) -> usize) -> R,
) -> R {
    let p = CURRENT.with(|c| c.get());
    if !p.is_null() {
        // SAFETY: see `with_current`.
        let w = unsafe { &*p };
        let mut rng = w.rng.borrow_mut();
        let mut random_int = |n: usize| rng.random_range(0..n);
        f(w.id, &mut random_int)
    } else {
        let mut random_int = |n: usize| {
            FALLBACK_RNG.with(|s| {
                let mut x = s.get();
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                s.set(x);
                (x as usize) % n.max(1)
            })
        };
        f(0, &mut random_int)
    }
}

impl Worker {
    fn new(id: usize, shared: Arc<SchedulerState>) -> Self {
        Worker {
            id,
            shared,
            frontier: RefCell::new(Frontier::new()),
            suspended: RefCell::new(VecDeque::new()),
            rng: RefCell::new(SmallRng::seed_from_u64(0xC0FFEE ^ (id as u64) << 17)),
            work_since_grant: Cell::new(0),
            stats: WorkerStats::default(),
        }
    }

    pub(crate) fn options(&self) -> &RuntimeOptions {
        &self.shared.options
    }

    pub(crate) fn push_local(&self, v: VertexRef) {
        self.frontier.borrow_mut().push(v);
    }

    pub(crate) fn park_suspended(&self, v: VertexRef) {
        self.suspended.borrow_mut().push_back(v);
    }

    fn mailbox(&self) -> &Mailbox {
        &self.shared.mailboxes[self.id]
    }

    fn update_status(&self) {
        let stealable = self.frontier.borrow().nb_strands() > 1;
        let mb = self.mailbox();
        if mb.status.load(Ordering::Relaxed) != stealable {
            mb.status.store(stealable, Ordering::SeqCst);
        }
    }
}

// WORKER LOOP
// ================================================================================================

fn worker_loop(worker: &Worker, initial: Option<VertexRef>) {
    CURRENT.with(|c| c.set(worker as *const Worker));
    match initial {
        Some(v) => release(v),
        None => {
            worker.shared.nb_active.fetch_add(1, Ordering::SeqCst);
        },
    }

    let d = worker.shared.options.dag_freq;
    let mut fuel = d;
    while !worker.shared.is_finished() {
        let has_ready = worker.frontier.borrow().nb_strands() >= 1;
        if has_ready {
            communicate(worker);
            let remaining = run_frontier(worker, fuel);
            worker.work_since_grant.set(worker.work_since_grant.get() + (fuel - remaining));
            if remaining == 0 {
                // Heartbeat: give one suspended vertex a chance, refill.
                promote_suspended(worker);
                fuel = d;
            } else {
                fuel = remaining;
            }
            worker.update_status();
        } else if !worker.suspended.borrow().is_empty() {
            communicate(worker);
            promote_suspended(worker);
        } else {
            acquire(worker);
        }
    }

    CURRENT.with(|c| c.set(ptr::null()));
    worker.stats.flush_into(&mut worker.shared.totals.lock().expect("stats mutex"));
}

/// Runs frontier vertices newest-first until the fuel budget is gone.
fn run_frontier(worker: &Worker, mut fuel: Fuel) -> Fuel {
    while fuel > 0 {
        let v = match worker.frontier.borrow_mut().pop_newest() {
            Some(v) => v,
            None => break,
        };
        fuel = run_vertex(v, fuel);
    }
    fuel
}

fn promote_suspended(worker: &Worker) {
    let v = match worker.suspended.borrow_mut().pop_front() {
        Some(v) => v,
        None => return,
    };
    // Zero fuel: the vertex only gets to re-examine its dependency.
    run_vertex(v, 0);
}

// STEAL PROTOCOL
// ================================================================================================

/// Answers a pending steal request, if any.
fn communicate(worker: &Worker) {
    let mb = worker.mailbox();
    let thief = mb.request.load(Ordering::Acquire);
    if thief != NO_REQUEST {
        let sz = worker.frontier.borrow().nb_strands();
        let k = worker.shared.options.sharing_freq;
        if sz > k || (worker.work_since_grant.get() > k && sz > 1) {
            worker.shared.nb_active.fetch_add(1, Ordering::SeqCst);
            worker.work_since_grant.set(0);
            let half = split_frontier(worker, sz / 2);
            tracing::debug!(target: "pulse::sched", victim = worker.id, thief, strands = half.nb_strands(), "steal granted");
            worker.stats.on_grant();
            worker.shared.mailboxes[thief]
                .transfer
                .store(Box::into_raw(Box::new(half)), Ordering::Release);
        } else {
            worker.shared.mailboxes[thief].transfer.store(ptr::null_mut(), Ordering::Release);
        }
    }
    mb.request.store(NO_REQUEST, Ordering::Release);
}

/// Moves `n` strands of the oldest work into a new frontier, splitting a
/// straddling vertex if needed.
fn split_frontier(worker: &Worker, n: usize) -> Frontier {
    let mut other = Frontier::new();
    let mut moved = 0;
    while moved < n {
        let (v, w) = worker
            .frontier
            .borrow_mut()
            .pop_oldest()
            .expect("frontier split asked for more strands than available");
        if moved + w <= n {
            other.push(v);
            moved += w;
        } else {
            let need = n - moved;
            // SAFETY: the popped vertex is owned here; split side effects
            // (releases) re-enter the frontier through short borrows.
            let (replacement, detached) = unsafe { v.as_dyn_mut() }.split(need);
            if detached.nb_strands() > 0 {
                other.push(detached);
            } else {
                delete_vertex(detached);
            }
            moved = n;
            let keep = replacement.unwrap_or(v);
            if keep.nb_strands() > 0 {
                worker.frontier.borrow_mut().push_oldest(keep);
            } else {
                delete_vertex(keep);
            }
        }
    }
    other
}

/// Out of work: try random victims until something arrives or the runtime
/// finishes.
fn acquire(worker: &Worker) {
    debug_assert!(worker.frontier.borrow().is_empty());
    debug_assert!(worker.suspended.borrow().is_empty());
    let shared = &worker.shared;
    shared.nb_active.fetch_sub(1, Ordering::SeqCst);
    let nb_workers = shared.nb_workers();
    while !shared.is_finished() {
        if nb_workers == 1 {
            continue;
        }
        worker.mailbox().transfer.store(no_response(), Ordering::Release);
        let victim = random_other_worker(worker, nb_workers);
        let vm = &shared.mailboxes[victim];
        if vm.status.load(Ordering::Acquire)
            && vm
                .request
                .compare_exchange(NO_REQUEST, worker.id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            loop {
                let reply = worker.mailbox().transfer.load(Ordering::Acquire);
                if reply != no_response() {
                    if !reply.is_null() {
                        // SAFETY: the victim published this box once, for us.
                        let stolen = unsafe { Box::from_raw(reply) };
                        worker.frontier.borrow_mut().absorb(*stolen);
                        reject_pending(worker);
                        worker.stats.on_steal();
                        tracing::debug!(target: "pulse::sched", thief = worker.id, victim, "steal succeeded");
                        return;
                    }
                    break; // rejected, try another victim
                }
                if shared.is_finished() {
                    return;
                }
                // Serve our own requesters while we wait; this is what
                // keeps mutual steals deadlock-free.
                communicate(worker);
            }
        }
        communicate(worker);
    }
}

/// Answers a requester with a rejection; used when the frontier changed
/// hands mid-handshake.
fn reject_pending(worker: &Worker) {
    let mb = worker.mailbox();
    let thief = mb.request.load(Ordering::Acquire);
    if thief != NO_REQUEST {
        worker.shared.mailboxes[thief].transfer.store(ptr::null_mut(), Ordering::Release);
    }
    mb.request.store(NO_REQUEST, Ordering::Release);
}

fn random_other_worker(worker: &Worker, nb_workers: usize) -> usize {
    debug_assert!(nb_workers >= 2);
    let mut i = worker.rng.borrow_mut().random_range(0..nb_workers - 1);
    if i >= worker.id {
        i += 1;
    }
    i
}

// LAUNCH
// ================================================================================================

/// Runs `initial` (and everything it spawns) to completion.
///
/// Spawns `options.nb_workers - 1` extra worker threads; the calling thread
/// becomes worker 0, releases `initial`, and participates until the
/// active-worker count hits zero. Every spawned thread is joined before
/// returning, so no runtime thread outlives this call.
#[tracing::instrument(skip_all, fields(nb_workers = options.nb_workers))]
pub fn launch_scheduler(options: RuntimeOptions, initial: VertexRef) -> Stats {
    // Worker ids index per-worker outset shortcut slots, which bounds the
    // useful worker count.
    let nb_workers = options.nb_workers.clamp(1, pulse_utils_sync::bag::MAX_WORKERS);
    let shared = Arc::new(SchedulerState::new(options, nb_workers));
    // The leader is born active; it goes inactive only once the whole DAG
    // has run out.
    shared.nb_active.store(1, Ordering::SeqCst);

    let handles: Vec<_> = (1..nb_workers)
        .map(|id| {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("pulse-worker-{id}"))
                .spawn(move || {
                    let worker = Worker::new(id, shared);
                    worker_loop(&worker, None);
                })
                .expect("failed to spawn worker thread")
        })
        .collect();

    let leader = Worker::new(0, Arc::clone(&shared));
    worker_loop(&leader, Some(initial));

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    let mut stats = shared.totals.lock().expect("stats mutex").clone();
    stats.record_stacklets();
    tracing::debug!(target: "pulse::sched", ?stats, "scheduler finished");
    stats
}
