//! Scheduler counters, aggregated across workers at shutdown.

use std::cell::Cell;

use super::worker::with_current;

/// Totals reported by [`super::launch_scheduler`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Successful steals (counted by the thief).
    pub nb_steals: u64,
    /// Steal requests this runtime granted (counted by victims).
    pub nb_grants: u64,
    /// Mark promotions: fork points and loop splits turned into vertices.
    pub nb_promotions: u64,
    /// Suspensions parked on a dependency outset.
    pub nb_suspensions: u64,
    /// Stacklets allocated / freed over the process lifetime.
    pub nb_stacklets_allocated: u64,
    pub nb_stacklets_freed: u64,
}

/// Worker-local counters; plain cells, flushed once at worker exit.
#[derive(Default)]
pub(crate) struct WorkerStats {
    steals: Cell<u64>,
    grants: Cell<u64>,
    promotions: Cell<u64>,
    suspensions: Cell<u64>,
}

impl WorkerStats {
    pub fn on_steal(&self) {
        self.steals.set(self.steals.get() + 1);
    }

    pub fn on_grant(&self) {
        self.grants.set(self.grants.get() + 1);
    }

    pub fn flush_into(&self, totals: &mut Stats) {
        totals.nb_steals += self.steals.get();
        totals.nb_grants += self.grants.get();
        totals.nb_promotions += self.promotions.get();
        totals.nb_suspensions += self.suspensions.get();
    }
}

impl Stats {
    /// Snapshots the process-wide stacklet counters; taken once, after all
    /// workers have joined.
    pub(crate) fn record_stacklets(&mut self) {
        let (allocated, freed) = crate::cactus::stacklet_counts();
        self.nb_stacklets_allocated = allocated as u64;
        self.nb_stacklets_freed = freed as u64;
    }
}

/// Records a promotion on the current worker, if any.
pub(crate) fn on_promotion() {
    let _ = with_current(|w| w.stats.promotions.set(w.stats.promotions.get() + 1));
}

/// Records a suspension on the current worker, if any.
pub(crate) fn on_suspension() {
    let _ = with_current(|w| w.stats.suspensions.set(w.stats.suspensions.get() + 1));
}
