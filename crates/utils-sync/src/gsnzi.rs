//! Growable, scalable non-zero indicator (GSNZI).
//!
//! A [`Tree`] counts arrivals and departures and answers one question: is
//! the count non-zero? Increments are routed by a hashed key to one of the
//! leaves of a fixed-height binary tree, so heavy fan-in spreads over many
//! cache lines instead of hammering a single counter word. A node that is
//! already non-zero absorbs its increments locally and stops propagating
//! toward the root.
//!
//! Under light load the tree is never materialized: every operation lands
//! on the root node, and the leaf heap is allocated only once the root's
//! version counter shows sustained traffic (or eagerly, with the
//! `fixed-size-incounter` feature).
//!
//! The root carries an *annotation*: an opaque word (in the runtime, a
//! pointer to the vertex owning the incounter) handed back by the decrement
//! that takes the global count to zero.

use alloc::{boxed::Box, vec::Vec};
use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::pad::CachePadded;

// CONSTANTS
// ================================================================================================

/// Height of the routing tree. Leaves sit `TREE_HEIGHT` levels below the
/// root; the default is generous and mostly matters for very high fan-in.
pub const TREE_HEIGHT: usize = 9;

const NB_LEAVES: usize = 1 << TREE_HEIGHT;
const HEAP_SIZE: usize = 2 * NB_LEAVES;

/// Root version count past which the leaf heap is worth allocating.
const SATURATION_BOUND: u32 = 1 << (TREE_HEIGHT - 1);

/// Sentinel counter value for the transient "arrival in flight" state.
const ONE_HALF: i32 = -1;

/// Tag bit marking a parent word as the root annotation.
const ANNOTATION_TAG: usize = 1;

/// Tag marking the heap pointer while the winner of the allocation race is
/// still building the node array.
const LOADING_TAG: usize = 1;

// NODE
// ================================================================================================

/// Packed `(counter, version)` pair held in one atomic word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct State {
    c: i32,
    v: u32,
}

impl State {
    #[inline]
    fn pack(self) -> u64 {
        ((self.v as u64) << 32) | (self.c as u32 as u64)
    }

    #[inline]
    fn unpack(bits: u64) -> Self {
        State { c: bits as u32 as i32, v: (bits >> 32) as u32 }
    }
}

/// One counter node of the tree.
///
/// `parent` holds either a pointer to the parent node, or — on the root —
/// the annotation word with [`ANNOTATION_TAG`] set.
pub struct Node {
    state: CachePadded<AtomicU64>,
    parent: CachePadded<AtomicUsize>,
}

impl Node {
    fn detached() -> Self {
        Node {
            state: CachePadded::new(AtomicU64::new(State { c: 0, v: 0 }.pack())),
            parent: CachePadded::new(AtomicUsize::new(ANNOTATION_TAG)),
        }
    }

    fn set_parent(&self, parent: *const Node) {
        self.parent.store(parent as usize, Ordering::Release);
    }

    #[inline]
    fn load(&self) -> State {
        State::unpack(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn cas(&self, current: State, next: State) -> bool {
        self.state
            .compare_exchange(current.pack(), next.pack(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Parent node, or `None` if this node is the root.
    #[inline]
    fn parent_node(&self) -> Option<&Node> {
        let word = self.parent.load(Ordering::Acquire);
        if word & ANNOTATION_TAG == ANNOTATION_TAG {
            None
        } else {
            // SAFETY: non-annotation parent words are set once, before the
            // node becomes reachable, and point into the same allocation
            // (or at the tree root), which outlives every node.
            Some(unsafe { &*(word as *const Node) })
        }
    }

    pub fn is_nonzero(&self) -> bool {
        self.load().c > 0
    }

    fn is_saturated(&self) -> bool {
        self.load().v >= SATURATION_BOUND
    }

    /// SNZI arrive.
    ///
    /// The `0 -> ½ -> 1` two-phase transition publishes an increment to the
    /// parent before committing locally; a lost commit race leaves the
    /// parent with a surplus arrival which is compensated once the loop
    /// exits.
    pub fn increment(&self) {
        let mut surplus = 0usize;
        let mut done = false;
        while !done {
            let mut x = self.load();
            if x.c >= 1 {
                done = self.cas(x, State { c: x.c + 1, v: x.v + 1 });
            }
            if x.c == 0 {
                let next = State { c: ONE_HALF, v: x.v + 1 };
                if self.cas(x, next) {
                    done = true;
                    x = next;
                }
            }
            if x.c == ONE_HALF {
                if let Some(parent) = self.parent_node() {
                    parent.increment();
                }
                if !self.cas(x, State { c: 1, v: x.v }) {
                    surplus += 1;
                }
            }
        }
        if let Some(parent) = self.parent_node() {
            while surplus > 0 {
                let _reached_zero = parent.decrement();
                debug_assert!(!_reached_zero, "compensating decrement reached zero");
                surplus -= 1;
            }
        }
    }

    /// SNZI depart. Returns `true` when this departure took the root of the
    /// tree to zero.
    pub fn decrement(&self) -> bool {
        loop {
            let x = self.load();
            assert!(x.c >= 1, "snzi: decrement on a zero counter");
            if self.cas(x, State { c: x.c - 1, v: x.v }) {
                let emptied = x.c == 1;
                return match self.parent_node() {
                    None => emptied,
                    Some(parent) if emptied => parent.decrement(),
                    Some(_) => false,
                };
            }
        }
    }

    /// Climbs the parent chain and returns the root annotation.
    pub fn annotation(&self) -> usize {
        let mut node = self;
        loop {
            let word = node.parent.load(Ordering::Acquire);
            if word & ANNOTATION_TAG == ANNOTATION_TAG {
                return word & !ANNOTATION_TAG;
            }
            // SAFETY: see `parent_node`.
            node = unsafe { &*(word as *const Node) };
        }
    }
}

// TREE
// ================================================================================================

/// Handle to the node a particular increment landed on.
///
/// The matching decrement must be issued through the same handle; that is
/// what keeps per-node counters balanced.
pub type Handle = NonNull<Node>;

/// Fixed-height GSNZI tree with a lazily allocated leaf heap.
pub struct Tree {
    root: Box<Node>,
    /// Array-heap of `HEAP_SIZE` nodes (cells 0 and 1 unused), or null while
    /// the tree is operating in root-only mode. Tagged with [`LOADING_TAG`]
    /// while the winner of the allocation race is initializing it.
    heap: AtomicUsize,
}

// SAFETY: all mutable state is atomic; parent pointers are written before
// publication and target allocations owned by the tree itself.
unsafe impl Send for Tree {}
unsafe impl Sync for Tree {}

impl Tree {
    pub fn new() -> Self {
        let tree = Tree { root: Box::new(Node::detached()), heap: AtomicUsize::new(0) };
        if cfg!(feature = "fixed-size-incounter") {
            tree.heap.store(LOADING_TAG, Ordering::Relaxed);
            tree.create_heap();
        }
        tree
    }

    /// Stores the word returned to whoever drives the count to zero.
    ///
    /// The low bit of `x` must be clear (annotations are aligned pointers in
    /// practice).
    pub fn set_annotation(&self, x: usize) {
        debug_assert_eq!(x & ANNOTATION_TAG, 0);
        self.root.parent.store(x | ANNOTATION_TAG, Ordering::Release);
    }

    pub fn is_nonzero(&self) -> bool {
        self.root.is_nonzero()
    }

    /// Increments the node selected by `path` and returns its handle.
    pub fn increment(&self, path: u32) -> Handle {
        let node = self.target_of_path(path);
        node.increment();
        NonNull::from(node)
    }

    /// Decrements through `handle`.
    ///
    /// Returns the root annotation when this was the departure that took the
    /// global count to zero.
    ///
    /// # Safety
    /// `handle` must come from [`Tree::increment`] on a tree that is still
    /// alive, and each handle must be decremented exactly once.
    pub unsafe fn decrement(handle: Handle) -> Option<usize> {
        let node = unsafe { handle.as_ref() };
        if node.decrement() { Some(node.annotation()) } else { None }
    }

    fn target_of_path(&self, path: u32) -> &Node {
        let word = self.heap.load(Ordering::Acquire);
        if word != 0 && word & LOADING_TAG == 0 {
            let heap = word as *const Node;
            let index = NB_LEAVES + (path as usize & (NB_LEAVES - 1));
            debug_assert!(index >= 2 && index < HEAP_SIZE);
            // SAFETY: the heap array is fully initialized before its pointer
            // is published and lives until the tree is dropped.
            return unsafe { &*heap.add(index) };
        }
        if word == 0 && self.root.is_saturated() {
            if self
                .heap
                .compare_exchange(0, LOADING_TAG, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.create_heap();
            }
        }
        &self.root
    }

    /// Only called once, by the winner of the `heap` CAS.
    fn create_heap(&self) {
        debug_assert_eq!(self.heap.load(Ordering::Relaxed) & LOADING_TAG, LOADING_TAG);
        let mut nodes: Vec<Node> = Vec::with_capacity(HEAP_SIZE);
        for _ in 0..HEAP_SIZE {
            nodes.push(Node::detached());
        }
        let heap: &mut [Node] = Box::leak(nodes.into_boxed_slice());
        let root = &*self.root as *const Node;
        for i in 2..4 {
            heap[i].set_parent(root);
        }
        for i in 4..HEAP_SIZE {
            let parent = &heap[i / 2] as *const Node;
            heap[i].set_parent(parent);
        }
        self.heap.store(heap.as_mut_ptr() as usize, Ordering::Release);
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        let word = *self.heap.get_mut();
        assert_eq!(word & LOADING_TAG, 0, "gsnzi: tree dropped mid-allocation");
        if word != 0 {
            let slice = ptr::slice_from_raw_parts_mut(word as *mut Node, HEAP_SIZE);
            // SAFETY: the heap was leaked from a boxed slice of exactly
            // HEAP_SIZE nodes in `create_heap`.
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

// PATH HASHING
// ================================================================================================

/// Mixes a routing key (typically an address) into a leaf path.
pub fn hash_path(key: usize) -> u32 {
    let mut a = key as u32 ^ (key >> 32) as u32;
    a = a.wrapping_add(0x7ed5_5d16).wrapping_add(a << 12);
    a = (a ^ 0xc761_c23c) ^ (a >> 19);
    a = a.wrapping_add(0x1656_67b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2_646c) ^ (a << 9);
    a = a.wrapping_add(0xfd70_46c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a_4f09) ^ (a >> 16);
    a
}

// TESTS
// ================================================================================================
