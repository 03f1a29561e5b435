//! Per-worker frontier: a weighted LIFO deque of runnable vertices.

use std::collections::VecDeque;

use crate::vertex::VertexRef;

/// Runnable vertices of one worker, newest at the back, with the total
/// strand weight cached for O(1) status checks.
///
/// Each entry remembers the weight it was admitted with, so the cache
/// stays exact even for the few internal vertices (outset drains) that
/// shrink their own strand count after rescheduling themselves.
pub(crate) struct Frontier {
    vs: VecDeque<(VertexRef, usize)>,
    weight: usize,
}

impl Frontier {
    pub fn new() -> Self {
        Frontier { vs: VecDeque::new(), weight: 0 }
    }

    pub fn nb_strands(&self) -> usize {
        self.weight
    }

    pub fn is_empty(&self) -> bool {
        self.vs.is_empty()
    }

    pub fn push(&mut self, v: VertexRef) {
        let w = v.nb_strands();
        debug_assert!(w > 0, "frontier push of a finished vertex");
        self.weight += w;
        self.vs.push_back((v, w));
    }

    pub fn push_oldest(&mut self, v: VertexRef) {
        let w = v.nb_strands();
        debug_assert!(w > 0);
        self.weight += w;
        self.vs.push_front((v, w));
    }

    pub fn pop_newest(&mut self) -> Option<VertexRef> {
        let (v, w) = self.vs.pop_back()?;
        self.debit(w);
        Some(v)
    }

    /// Pops the oldest vertex along with its admitted weight.
    pub fn pop_oldest(&mut self) -> Option<(VertexRef, usize)> {
        let (v, w) = self.vs.pop_front()?;
        self.debit(w);
        Some((v, w))
    }

    fn debit(&mut self, w: usize) {
        debug_assert!(self.weight >= w, "frontier weight cache out of sync");
        self.weight -= w;
    }

    /// Replaces this (empty) frontier with a stolen one.
    pub fn absorb(&mut self, other: Frontier) {
        debug_assert!(self.is_empty(), "absorbing into a non-empty frontier");
        *self = other;
    }
}
