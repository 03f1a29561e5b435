//! Growable, scalable concurrent bag.
//!
//! A [`Bag`] collects pointer-sized items (in the runtime: incounter
//! handles) until it is *sealed*, after which every insert fails and the
//! sealer drains the contents exactly once. The common case — a handful of
//! items — lives in a small inline block of CAS cells. Past that, inserts
//! go through a per-worker shortcut slot into a lazily grown 4-ary tree of
//! large append-only blocks, so concurrent producers do not share cache
//! lines.
//!
//! Draining is resumable: [`Bag::seal`] claims the inline items and the
//! tree root, and [`Drain`]/[`Bag::deallocate_nb`] walk the tree in
//! caller-bounded steps so a large drain can be split across scheduler
//! quanta (or across vertices).

use alloc::{boxed::Box, collections::VecDeque};
use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    backoff::spin_for,
    pad::CachePadded,
    tagged::{tag_of, untagged, with_tag},
};

// CONSTANTS
// ================================================================================================

/// Upper bound on worker ids using the shortcut slots.
pub const MAX_WORKERS: usize = 64;

/// Capacity of the inline block; one cache line pair of cells.
const SMALL_CAP: usize = 16;

/// Capacity of each tree block.
const BLOCK_CAP: usize = 4096;

/// Branching factor of the block tree.
const BRANCHING: usize = 4;

/// Tag marking a sealed pointer word.
const FINISHED: usize = 1;

/// Tag on the shortcuts word while the winning inserter builds the array.
const CREATING: usize = 3;

/// High bit of a block head: no further slots will be claimed.
const SEALED: usize = 1 << (usize::BITS - 1);

// BLOCK
// ================================================================================================

enum InsertStatus {
    Inserted,
    InsertedAndFilled,
    Sealed,
    Full,
}

/// Fixed-capacity append-only cell array.
///
/// `CONCURRENT` selects the cell protocol: the inline root block is fed by
/// many workers and resolves the claim/store race per cell; tree blocks are
/// fed by a single worker (through its shortcut slot) and only race with
/// the sealer, which the head CAS resolves.
struct Block<T, const CAP: usize, const CONCURRENT: bool> {
    head: AtomicUsize,
    cells: [AtomicPtr<T>; CAP],
}

impl<T, const CAP: usize, const CONCURRENT: bool> Block<T, CAP, CONCURRENT> {
    fn new() -> Self {
        Block {
            head: AtomicUsize::new(0),
            cells: [const { AtomicPtr::new(ptr::null_mut()) }; CAP],
        }
    }

    fn is_full(&self) -> bool {
        self.head.load(Ordering::Acquire) & !SEALED >= CAP
    }

    fn try_insert(&self, x: NonNull<T>) -> InsertStatus {
        loop {
            let h = self.head.load(Ordering::Acquire);
            if h & SEALED != 0 {
                return InsertStatus::Sealed;
            }
            if h >= CAP {
                return InsertStatus::Full;
            }
            if CONCURRENT {
                if self
                    .head
                    .compare_exchange(h, h + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if !Self::publish_cell(&self.cells[h], x) {
                        return InsertStatus::Sealed;
                    }
                    return if h + 1 == CAP {
                        InsertStatus::InsertedAndFilled
                    } else {
                        InsertStatus::Inserted
                    };
                }
            } else {
                self.cells[h].store(x.as_ptr(), Ordering::Release);
                if self
                    .head
                    .compare_exchange(h, h + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return if h + 1 == CAP {
                        InsertStatus::InsertedAndFilled
                    } else {
                        InsertStatus::Inserted
                    };
                }
            }
        }
    }

    /// Claim/store race resolution for concurrent cells: the inserter owns
    /// the slot index but the sealer may have visited the still-empty cell
    /// and marked it finished.
    fn publish_cell(cell: &AtomicPtr<T>, x: NonNull<T>) -> bool {
        loop {
            let y = cell.load(Ordering::Acquire);
            if tag_of(y) == FINISHED {
                return false;
            }
            debug_assert!(y.is_null());
            if cell
                .compare_exchange(y, x.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Stops slot claiming and returns the number of claimed cells.
    fn seal(&self) -> usize {
        loop {
            let h = self.head.load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(h, h | SEALED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let n = h & !SEALED;
                debug_assert!(n <= CAP);
                return n;
            }
        }
    }

    fn cell_range(&self, n: usize) -> (*const AtomicPtr<T>, *const AtomicPtr<T>) {
        let lo = self.cells.as_ptr();
        (lo, unsafe { lo.add(n) })
    }
}

/// Visits the items in `[lo, hi)`, resolving unpublished concurrent cells.
///
/// # Safety
/// The range must lie within a sealed block's claimed cells and be visited
/// at most once.
unsafe fn visit_cells<T, const CONCURRENT: bool>(
    lo: *const AtomicPtr<T>,
    hi: *const AtomicPtr<T>,
    visit: &mut dyn FnMut(NonNull<T>),
) {
    let mut it = lo;
    while it != hi {
        let cell = unsafe { &*it };
        if CONCURRENT {
            loop {
                let y = cell.load(Ordering::Acquire);
                debug_assert_ne!(tag_of(y), FINISHED);
                if let Some(x) = NonNull::new(y) {
                    visit(x);
                    break;
                }
                let done = ptr::null_mut::<T>();
                if cell
                    .compare_exchange(y, with_tag(done, FINISHED), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        } else {
            let y = cell.load(Ordering::Acquire);
            let x = NonNull::new(y).expect("bag: unpublished cell in sealed block");
            visit(x);
        }
        it = unsafe { it.add(1) };
    }
}

// BLOCK TREE
// ================================================================================================

/// Node of the grown portion of the bag: a large block plus child links.
pub struct TreeNode<T> {
    items: Block<T, BLOCK_CAP, false>,
    children: [CachePadded<AtomicPtr<TreeNode<T>>>; BRANCHING],
}

impl<T> TreeNode<T> {
    /// All-zero bytes are a valid `TreeNode` (null cells, zero head), so the
    /// 32 KiB node is allocated zeroed on the heap directly rather than
    /// being built on the stack and moved.
    fn new_boxed() -> Box<TreeNode<T>> {
        let layout = Layout::new::<TreeNode<T>>();
        // SAFETY: TreeNode is composed of atomics and padding for which the
        // zero bit-pattern is a valid value.
        unsafe {
            let raw = alloc::alloc::alloc_zeroed(layout) as *mut TreeNode<T>;
            if raw.is_null() {
                alloc::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(raw)
        }
    }
}

struct BlockTree<T> {
    root: AtomicPtr<TreeNode<T>>,
}

impl<T> BlockTree<T> {
    const fn new() -> Self {
        BlockTree { root: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Adds a fresh node at a random position, or returns `None` if the
    /// descent ran into a sealed link.
    fn try_insert(&self, random_int: &mut dyn FnMut(usize) -> usize) -> Option<NonNull<TreeNode<T>>> {
        let mut candidate: Option<Box<TreeNode<T>>> = None;
        let mut link = &self.root;
        loop {
            let mut target = link.load(Ordering::Acquire);
            if target.is_null() {
                let node = candidate.take().unwrap_or_else(TreeNode::new_boxed);
                let raw = Box::into_raw(node);
                match link.compare_exchange(
                    ptr::null_mut(),
                    raw,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(unsafe { NonNull::new_unchecked(raw) }),
                    Err(seen) => {
                        // SAFETY: the CAS failed, so `raw` was never published.
                        candidate = Some(unsafe { Box::from_raw(raw) });
                        target = seen;
                    },
                }
            }
            if tag_of(target) == FINISHED {
                return None;
            }
            let node = unsafe { &*untagged(target) };
            link = &node.children[random_int(BRANCHING)];
        }
    }
}

// BAG
// ================================================================================================

type Shortcut<T> = CachePadded<ShortcutSlot<T>>;

struct ShortcutSlot<T> {
    /// The tree block this worker currently appends to.
    block: AtomicPtr<Block<T, BLOCK_CAP, false>>,
    /// Set while the owning worker is inside the tree-insert path; the
    /// sealer waits for every slot to go inactive before the tree may be
    /// freed.
    active: AtomicBool,
}

impl<T> Default for ShortcutSlot<T> {
    fn default() -> Self {
        ShortcutSlot { block: AtomicPtr::new(ptr::null_mut()), active: AtomicBool::new(false) }
    }
}

struct Shortcuts<T> {
    slots: [Shortcut<T>; MAX_WORKERS],
}

impl<T> Shortcuts<T> {
    fn new_boxed() -> Box<Self> {
        let mut v = alloc::vec::Vec::with_capacity(MAX_WORKERS);
        for _ in 0..MAX_WORKERS {
            v.push(CachePadded::new(ShortcutSlot::default()));
        }
        let slots: Box<[Shortcut<T>; MAX_WORKERS]> =
            v.into_boxed_slice().try_into().map_err(|_| ()).expect("exact length");
        // Rebox as the wrapper struct; layout is identical.
        unsafe { Box::from_raw(Box::into_raw(slots) as *mut Shortcuts<T>) }
    }
}

/// Sealable concurrent bag of `NonNull<T>` items.
pub struct Bag<T> {
    items: Block<T, SMALL_CAP, true>,
    blocks: BlockTree<T>,
    shortcuts: AtomicPtr<Shortcuts<T>>,
}

// SAFETY: every shared field is atomic; items are raw pointers whose
// lifetime is managed by the caller's insert/drain contract.
unsafe impl<T> Send for Bag<T> {}
unsafe impl<T> Sync for Bag<T> {}

impl<T> Bag<T> {
    pub fn new() -> Self {
        Bag {
            items: Block::new(),
            blocks: BlockTree::new(),
            shortcuts: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Inserts `x` on behalf of worker `worker_id`.
    ///
    /// Returns `false` if the bag was already sealed; the caller then owns
    /// the consequences (for the runtime: compensating the incounter).
    pub fn insert(
        &self,
        x: NonNull<T>,
        worker_id: usize,
        random_int: &mut dyn FnMut(usize) -> usize,
    ) -> bool {
        assert!(worker_id < MAX_WORKERS, "bag: worker id {worker_id} out of range");
        if !self.items.is_full() {
            match self.items.try_insert(x) {
                InsertStatus::Sealed => return false,
                InsertStatus::Inserted => return true,
                InsertStatus::InsertedAndFilled => {
                    self.create_shortcuts();
                    return true;
                },
                InsertStatus::Full => {},
            }
        }
        loop {
            let s = self.shortcuts.load(Ordering::SeqCst);
            if tag_of(s) == FINISHED {
                return false;
            }
            if s.is_null() || tag_of(s) == CREATING {
                spin_for(128);
                continue;
            }
            let slot = &unsafe { &*s }.slots[worker_id];
            slot.active.store(true, Ordering::SeqCst);
            if tag_of(self.shortcuts.load(Ordering::SeqCst)) == FINISHED {
                slot.active.store(false, Ordering::Release);
                return false;
            }
            let inserted = self.insert_via_slot(slot, x, random_int);
            slot.active.store(false, Ordering::Release);
            return inserted;
        }
    }

    fn insert_via_slot(
        &self,
        slot: &ShortcutSlot<T>,
        x: NonNull<T>,
        random_int: &mut dyn FnMut(usize) -> usize,
    ) -> bool {
        loop {
            let mut block = slot.block.load(Ordering::Acquire);
            if block.is_null() {
                match self.blocks.try_insert(random_int) {
                    None => return false,
                    Some(node) => {
                        let items = &unsafe { node.as_ref() }.items;
                        block = items as *const _ as *mut _;
                        slot.block.store(block, Ordering::Release);
                    },
                }
            }
            match unsafe { &*block }.try_insert(x) {
                InsertStatus::Sealed => return false,
                InsertStatus::Inserted | InsertStatus::InsertedAndFilled => return true,
                InsertStatus::Full => match self.blocks.try_insert(random_int) {
                    None => return false,
                    Some(node) => {
                        let items = &unsafe { node.as_ref() }.items;
                        slot.block.store(items as *const _ as *mut _, Ordering::Release);
                    },
                },
            }
        }
    }

    /// Builds the shortcut array; called by the inserter that filled the
    /// inline block.
    fn create_shortcuts(&self) {
        loop {
            let s = self.shortcuts.load(Ordering::Acquire);
            if tag_of(s) == FINISHED {
                return;
            }
            if self
                .shortcuts
                .compare_exchange(s, with_tag(s, CREATING), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let array = Box::into_raw(Shortcuts::new_boxed());
        self.shortcuts.store(array, Ordering::Release);
    }

    /// Seals the bag, visits the inline items, and detaches the block tree.
    ///
    /// Exactly one seal per bag. After `seal` returns, no inserter holds a
    /// reference into the returned tree, so the caller may drain and free it
    /// at leisure via [`Drain`] and [`Bag::deallocate_nb`].
    pub fn seal(&self, mut visit: impl FnMut(NonNull<T>)) -> Option<NonNull<TreeNode<T>>> {
        loop {
            let s = self.shortcuts.load(Ordering::SeqCst);
            assert_ne!(tag_of(s), FINISHED, "bag: sealed twice");
            if tag_of(s) == CREATING {
                spin_for(128);
                continue;
            }
            if self
                .shortcuts
                .compare_exchange(s, with_tag(s, FINISHED), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        // Wait out inserters pinned before the seal landed.
        let s = untagged(self.shortcuts.load(Ordering::SeqCst));
        if !s.is_null() {
            for slot in unsafe { &*s }.slots.iter() {
                while slot.active.load(Ordering::SeqCst) {
                    spin_for(128);
                }
            }
        }
        let n = self.items.seal();
        let (lo, hi) = self.items.cell_range(n);
        // SAFETY: the inline block is sealed and this is its only visit.
        unsafe { visit_cells::<T, true>(lo, hi, &mut visit) };
        loop {
            let root = self.blocks.root.load(Ordering::Acquire);
            if self
                .blocks
                .root
                .compare_exchange(root, with_tag(root, FINISHED), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return NonNull::new(root);
            }
        }
    }

    /// Detaches the block tree (sealed or not), leaving the bag empty.
    ///
    /// The caller takes over deallocation; racing inserters are excluded by
    /// the exclusive borrow.
    pub fn take_tree(&mut self) -> Option<NonNull<TreeNode<T>>> {
        let root = core::mem::replace(self.blocks.root.get_mut(), ptr::null_mut());
        NonNull::new(untagged(root))
    }

    /// Frees up to `budget` tree nodes from `todo`, pushing children as it
    /// goes. Returns the number freed.
    pub fn deallocate_nb(budget: usize, todo: &mut VecDeque<NonNull<TreeNode<T>>>) -> usize {
        let mut freed = 0;
        while freed < budget {
            let Some(node) = todo.pop_back() else { break };
            let node = unsafe { Box::from_raw(untagged(node.as_ptr())) };
            for child in node.children.iter() {
                let c = untagged(child.load(Ordering::Acquire));
                if let Some(c) = NonNull::new(c) {
                    todo.push_back(c);
                }
            }
            freed += 1;
        }
        freed
    }
}

impl<T> Default for Bag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Bag<T> {
    fn drop(&mut self) {
        let s = untagged(*self.shortcuts.get_mut());
        if !s.is_null() {
            drop(unsafe { Box::from_raw(s) });
        }
        // The bag owns its block tree, sealed or not, unless the caller
        // already detached it with `take_tree`.
        let root = untagged(*self.blocks.root.get_mut());
        if let Some(root) = NonNull::new(root) {
            let mut todo = VecDeque::new();
            todo.push_back(root);
            while Self::deallocate_nb(usize::MAX, &mut todo) > 0 {}
        }
    }
}

// DRAIN
// ================================================================================================

/// Resumable cursor over a sealed bag's block tree.
pub struct Drain<T> {
    lo: *const AtomicPtr<T>,
    hi: *const AtomicPtr<T>,
    todo: VecDeque<NonNull<TreeNode<T>>>,
}

// SAFETY: the cursor owns exclusive drain rights over sealed blocks.
unsafe impl<T> Send for Drain<T> {}

impl<T> Drain<T> {
    /// Cursor rooted at the tree returned by [`Bag::seal`].
    pub fn new(root: NonNull<TreeNode<T>>) -> Self {
        let mut todo = VecDeque::new();
        todo.push_back(root);
        Drain { lo: ptr::null(), hi: ptr::null(), todo }
    }

    fn empty() -> Self {
        Drain { lo: ptr::null(), hi: ptr::null(), todo: VecDeque::new() }
    }

    pub fn is_done(&self) -> bool {
        self.todo.is_empty() && core::ptr::eq(self.lo, self.hi)
    }

    /// True while unexplored subtrees remain.
    pub fn has_subtrees(&self) -> bool {
        !self.todo.is_empty()
    }

    /// Remaining items in the current block's claimed range.
    fn range_len(&self) -> usize {
        if self.lo.is_null() { 0 } else { unsafe { self.hi.offset_from(self.lo) as usize } }
    }

    /// Parallelism estimate for the scheduler: the exact residue of the
    /// current range, or a token 2 while unexplored subtrees remain.
    pub fn nb_strands(&self) -> usize {
        if self.todo.is_empty() { self.range_len() } else { self.todo.len().min(2) }
    }

    /// Visits up to `budget` items, sealing blocks and child links as the
    /// walk reaches them.
    pub fn notify_nb(&mut self, budget: usize, mut visit: impl FnMut(NonNull<T>)) {
        let mut k = 0;
        while k < budget && !self.is_done() {
            let remaining = self.range_len();
            if remaining > 0 {
                let step = remaining.min(budget - k);
                let next = unsafe { self.lo.add(step) };
                // SAFETY: `[lo, lo+step)` lies in a sealed block and this
                // cursor is its only visitor.
                unsafe { visit_cells::<T, false>(self.lo, next, &mut visit) };
                self.lo = next;
                k += step;
            } else {
                let node = self.todo.pop_back().expect("cursor not done");
                let node = unsafe { node.as_ref() };
                for child in node.children.iter() {
                    loop {
                        let c = child.load(Ordering::Acquire);
                        debug_assert_eq!(tag_of(c), 0);
                        if child
                            .compare_exchange(
                                c,
                                with_tag(c, FINISHED),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            if let Some(c) = NonNull::new(c) {
                                self.todo.push_back(c);
                            }
                            break;
                        }
                    }
                }
                let n = node.items.seal();
                let (lo, hi) = node.items.cell_range(n);
                self.lo = lo;
                self.hi = hi;
            }
        }
    }

    /// Detaches `nb` items of the current range into a sibling cursor.
    pub fn split_range(&mut self, nb: usize) -> Drain<T> {
        debug_assert!(self.todo.is_empty());
        debug_assert!(nb <= self.range_len());
        let mid = unsafe { self.lo.add(nb) };
        let sibling = Drain { lo: self.lo, hi: mid, todo: VecDeque::new() };
        self.lo = mid;
        sibling
    }

    /// Detaches the oldest unexplored subtree into a sibling cursor.
    pub fn split_subtree(&mut self) -> Drain<T> {
        match self.todo.pop_front() {
            Some(node) => Drain::new(node),
            None => Drain::empty(),
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use std::{boxed::Box, vec::Vec};

    use super::*;

    fn leak_item(v: u64) -> NonNull<u64> {
        NonNull::from(Box::leak(Box::new(v)))
    }

    fn no_rng(_: usize) -> usize {
        0
    }

    #[test]
    fn insert_then_seal_visits_everything() {
        let bag: Bag<u64> = Bag::new();
        let items: Vec<_> = (0..10u64).map(leak_item).collect();
        for &x in &items {
            assert!(bag.insert(x, 0, &mut no_rng));
        }
        let mut seen = Vec::new();
        let root = bag.seal(|x| seen.push(unsafe { *x.as_ref() }));
        assert!(root.is_none());
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(!bag.insert(leak_item(99), 0, &mut no_rng));
    }

    #[test]
    fn overflow_grows_tree_and_drains_in_steps() {
        let mut bag: Bag<u64> = Bag::new();
        const N: u64 = 20_000;
        for v in 0..N {
            assert!(bag.insert(leak_item(v), (v % 4) as usize, &mut no_rng));
        }
        let mut seen = Vec::new();
        let root = bag.seal(|x| seen.push(unsafe { *x.as_ref() })).expect("tree grown");
        // Budgeted drain in deliberately awkward step sizes; repeating
        // notify_nb to exhaustion must equal one bulk drain.
        let mut drain = Drain::new(root);
        while !drain.is_done() {
            drain.notify_nb(777, |x| seen.push(unsafe { *x.as_ref() }));
        }
        seen.sort_unstable();
        assert_eq!(seen.len(), N as usize);
        assert_eq!(seen.last(), Some(&(N - 1)));

        // Piecewise deallocation of the detached tree.
        let root = bag.take_tree().expect("tree grown");
        let mut todo = VecDeque::new();
        todo.push_back(root);
        let mut freed = 0;
        loop {
            let step = Bag::<u64>::deallocate_nb(3, &mut todo);
            freed += step;
            if step == 0 {
                break;
            }
        }
        assert!(freed >= 1);
    }

    #[test]
    fn concurrent_insert_race_with_seal_never_loses_items() {
        use std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        };

        for _ in 0..50 {
            let bag: Arc<Bag<u64>> = Arc::new(Bag::new());
            let accepted = Arc::new(AtomicUsize::new(0));
            let workers: Vec<_> = (0..4)
                .map(|w| {
                    let bag = Arc::clone(&bag);
                    let accepted = Arc::clone(&accepted);
                    std::thread::spawn(move || {
                        let mut state = w as usize + 1;
                        let mut rng = move |n: usize| {
                            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                            (state >> 33) % n
                        };
                        for v in 0..500u64 {
                            if bag.insert(leak_item(v), w, &mut rng) {
                                accepted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                })
                .collect();

            let mut seen = 0usize;
            let root = bag.seal(|_| seen += 1);
            for t in workers {
                t.join().unwrap();
            }
            if let Some(root) = root {
                let mut drain = Drain::new(root);
                while !drain.is_done() {
                    drain.notify_nb(usize::MAX, |_| seen += 1);
                }
            }
            // Every accepted insert is visited by exactly one drain step.
            assert_eq!(seen, accepted.load(Ordering::Relaxed));
        }
    }

    #[test]
    fn subscribers_decrement_once_each() {
        use crate::gsnzi::{Handle, Tree};

        // Five incounters with two arrivals each subscribe one handle; a
        // full drain leaves each tree still non-zero with count one.
        let trees: Vec<Tree> = (0..5).map(|_| Tree::new()).collect();
        let bag: Bag<crate::gsnzi::Node> = Bag::new();
        let mut spares: Vec<Handle> = Vec::new();
        for (i, tree) in trees.iter().enumerate() {
            tree.set_annotation(0x100 + i * 2);
            spares.push(tree.increment(7));
            let h = tree.increment(13);
            assert!(bag.insert(h, i, &mut no_rng));
        }
        let root = bag.seal(|h| {
            let released = unsafe { Tree::decrement(h) };
            assert!(released.is_none());
        });
        assert!(root.is_none());
        for (tree, spare) in trees.iter().zip(spares) {
            assert!(tree.is_nonzero());
            assert!(unsafe { Tree::decrement(spare) }.is_some());
            assert!(!tree.is_nonzero());
        }
    }
}
