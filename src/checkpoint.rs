//! Checkpoint recorder (spec.md §4.G, §5): the per-thread, wait-free logging
//! path invoked from user code, potentially millions of times per second.
//!
//! The region-id interner is a [`dashmap::DashMap`] rather than a hand-rolled
//! lock-free map: reads dominate and inserts are rare, exactly the workload
//! `dashmap`'s sharded-lock design targets. The per-thread record log itself
//! is a single-writer, multi-reader append-only structure ([`RecordLog`]):
//! the owning thread appends new blocks and fills them without ever taking a
//! lock, and a reader (`snapshot_all`, called from the session/correlator
//! thread) only ever observes fully-written slots via a length counter
//! published with `Release`/`Acquire`. The small per-thread bookkeeping used
//! to pair `enter`/`exit` calls (`Bookkeeping`) never leaves its owning
//! thread, so it needs no synchronization at all. A clone of each thread's
//! `Arc<ThreadLog>` is registered globally (behind a `Mutex` taken only once
//! per thread, at first use) so the session can snapshot a *running* thread's
//! log, not only logs from threads that have already exited.

use dashmap::DashMap;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CheckpointKind {
    Enter,
    Exit,
    Mark,
}

impl CheckpointKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enter" => Some(CheckpointKind::Enter),
            "exit" => Some(CheckpointKind::Exit),
            "mark" => Some(CheckpointKind::Mark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckpointRecord {
    pub timestamp_ns: u64,
    pub thread_id: u64,
    pub region_id: u32,
    pub kind: CheckpointKind,
    pub invocation_index: u32,
    /// Set when an `exit` found no matching `enter` on this thread's stack.
    pub orphan: bool,
    /// For `mark` records: the region (and its invocation) enclosing this
    /// mark on the thread's stack at the moment it was recorded. `None` for
    /// `enter`/`exit` records, and for a `mark` emitted with an empty stack.
    pub enclosing_region_id: Option<u32>,
}

/// Interns region-name strings to small integer handles.
pub struct RegionInterner {
    forward: DashMap<String, u32>,
    reverse: DashMap<u32, String>,
    next: AtomicU32,
}

impl RegionInterner {
    pub fn new() -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next: AtomicU32::new(0),
        }
    }

    pub fn intern(&self, name: &str) -> u32 {
        if let Some(id) = self.forward.get(name) {
            return *id;
        }
        *self.forward.entry(name.to_owned()).or_insert_with(|| {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.reverse.insert(id, name.to_owned());
            id
        })
    }

    pub fn resolve(&self, id: u32) -> Option<String> {
        self.reverse.get(&id).map(|r| r.clone())
    }
}

impl Default for RegionInterner {
    fn default() -> Self {
        Self::new()
    }
}

static INTERNER: OnceLock<RegionInterner> = OnceLock::new();

pub fn interner() -> &'static RegionInterner {
    INTERNER.get_or_init(RegionInterner::new)
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

const BLOCK_CAPACITY: usize = 1024;

/// One fixed-capacity, append-only slab of records. A block is never moved or
/// mutated past its `len` once published, so a pointer to it stays valid for
/// the lifetime of the owning [`RecordLog`].
struct Block {
    slots: Box<[UnsafeCell<MaybeUninit<CheckpointRecord>>]>,
    /// Slots `0..len` are initialized. Stored with `Release` after the slot
    /// write completes; loaded with `Acquire` before a reader touches it.
    len: AtomicUsize,
    next: AtomicPtr<Block>,
}

// `Block` is only ever mutated through `&AtomicUsize`/`&AtomicPtr` handles or
// through the exclusive `UnsafeCell` write guarded by `RecordLog`'s
// single-writer invariant; concurrent readers only ever see slots already
// published via `len`.
unsafe impl Sync for Block {}

impl Block {
    fn new() -> *mut Block {
        let slots: Box<[UnsafeCell<MaybeUninit<CheckpointRecord>>]> =
            (0..BLOCK_CAPACITY).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
        Box::into_raw(Box::new(Block {
            slots,
            len: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Append-only log of one thread's checkpoint records. `push` is called only
/// by the thread that owns this log and never blocks on a lock; `snapshot`
/// may be called from any thread and only ever observes records whose slot
/// has already been published.
struct RecordLog {
    head: *mut Block,
    /// Writer-only cursor to the block currently being filled.
    tail: Cell<*mut Block>,
}

// Safety invariant upheld by every caller in this module: `push` (and the
// `tail` cursor it mutates) is only ever called from the thread that created
// this `RecordLog`. `snapshot` only performs Acquire-ordered reads of
// already-published state and is safe to call from any thread.
unsafe impl Send for RecordLog {}
unsafe impl Sync for RecordLog {}

impl RecordLog {
    fn new() -> Self {
        let head = Block::new();
        Self { head, tail: Cell::new(head) }
    }

    fn push(&self, record: CheckpointRecord) {
        loop {
            let tail = unsafe { &*self.tail.get() };
            let i = tail.len.load(Ordering::Relaxed);
            if i < BLOCK_CAPACITY {
                unsafe { (*tail.slots[i].get()).write(record) };
                tail.len.store(i + 1, Ordering::Release);
                return;
            }
            let next = Block::new();
            tail.next.store(next, Ordering::Release);
            self.tail.set(next);
        }
    }

    fn snapshot(&self) -> Vec<CheckpointRecord> {
        let mut out = Vec::new();
        let mut block = self.head as *const Block;
        while !block.is_null() {
            let b = unsafe { &*block };
            let len = b.len.load(Ordering::Acquire);
            for i in 0..len {
                out.push(unsafe { (*b.slots[i].get()).assume_init_ref().clone() });
            }
            block = b.next.load(Ordering::Acquire);
        }
        out
    }
}

impl Drop for RecordLog {
    fn drop(&mut self) {
        let mut block = self.head;
        while !block.is_null() {
            let mut boxed = unsafe { Box::from_raw(block) };
            let next = *boxed.next.get_mut();
            let len = *boxed.len.get_mut();
            for i in 0..len {
                unsafe { ptr::drop_in_place(boxed.slots[i].get_mut().as_mut_ptr()) };
            }
            block = next;
        }
    }
}

/// One thread's registered log, shared between the owning thread (via
/// `LOCAL_LOG`) and the session/correlator thread (via `REGISTRY`).
struct ThreadLog {
    thread_id: u64,
    log: RecordLog,
}

/// Pairing state for `enter`/`exit`/`mark` calls on one thread. Lives purely
/// in thread-local storage and is never shared, so it needs no atomics or
/// locking at all.
struct Bookkeeping {
    stack: Vec<(u32, u32)>,
    invocation_counters: HashMap<u32, u32>,
}

impl Bookkeeping {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            invocation_counters: HashMap::new(),
        }
    }

    fn next_record(&mut self, timestamp_ns: u64, thread_id: u64, region_id: u32, kind: CheckpointKind) -> CheckpointRecord {
        let mut enclosing_region_id = None;
        let (invocation_index, orphan) = match kind {
            CheckpointKind::Enter => {
                let counter = self.invocation_counters.entry(region_id).or_insert(0);
                let index = *counter;
                *counter += 1;
                self.stack.push((region_id, index));
                (index, false)
            }
            CheckpointKind::Exit => match self.stack.last() {
                Some(&(top_region, top_index)) if top_region == region_id => {
                    self.stack.pop();
                    (top_index, false)
                }
                _ => {
                    // Either the stack is empty or the top doesn't match this
                    // region: we cannot pair this exit, so it's tagged orphan
                    // without mutating the stack.
                    let index = self.invocation_counters.get(&region_id).copied().unwrap_or(0);
                    (index.saturating_sub(1), true)
                }
            },
            CheckpointKind::Mark => {
                // Attached to whichever region is enclosing on this thread's
                // stack right now (spec.md §4.H), reconstructed from the
                // live stack rather than from the mark's own region_id.
                enclosing_region_id = self.stack.last().map(|&(r, _)| r);
                (self.stack.last().map(|&(_, idx)| idx).unwrap_or(0), false)
            }
        };

        CheckpointRecord {
            timestamp_ns,
            thread_id,
            region_id,
            kind,
            invocation_index,
            orphan,
            enclosing_region_id,
        }
    }
}

/// A point-in-time copy of one thread's checkpoint log, suitable for handoff
/// to the correlator.
#[derive(Debug, Clone)]
pub struct ThreadLogSnapshot {
    pub thread_id: u64,
    pub records: Vec<CheckpointRecord>,
    /// Regions still open (unmatched `enter`) at the moment of the snapshot,
    /// reconstructed by replaying `records` (the bookkeeping stack that
    /// produced this order lives only on the owning thread).
    pub open_stack: Vec<(u32, u32)>,
}

fn reconstruct_open_stack(records: &[CheckpointRecord]) -> Vec<(u32, u32)> {
    let mut stack: Vec<(u32, u32)> = Vec::new();
    for record in records {
        match record.kind {
            CheckpointKind::Enter => stack.push((record.region_id, record.invocation_index)),
            CheckpointKind::Exit if !record.orphan => {
                if stack.last() == Some(&(record.region_id, record.invocation_index)) {
                    stack.pop();
                }
            }
            CheckpointKind::Exit | CheckpointKind::Mark => {}
        }
    }
    stack
}

static REGISTRY: OnceLock<Mutex<Vec<Arc<ThreadLog>>>> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<Arc<ThreadLog>>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

thread_local! {
    static LOCAL_LOG: Arc<ThreadLog> = {
        let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let log = Arc::new(ThreadLog { thread_id, log: RecordLog::new() });
        registry().lock().expect("checkpoint registry lock poisoned").push(log.clone());
        log
    };
    static LOCAL_STATE: RefCell<Bookkeeping> = RefCell::new(Bookkeeping::new());
}

/// Records one checkpoint on the calling thread. This is the hot path
/// invoked from `nemb_mark_checkpoint` (spec.md §4.G): no lock is ever taken
/// once the thread's log has been registered, and no syscalls are made.
pub fn record(timestamp_ns: u64, region_name: &str, kind: CheckpointKind) {
    let region_id = interner().intern(region_name);
    LOCAL_LOG.with(|log| {
        let record = LOCAL_STATE.with(|state| state.borrow_mut().next_record(timestamp_ns, log.thread_id, region_id, kind));
        log.log.push(record);
    });
}

/// Takes a consistent snapshot of every thread's log registered so far
/// (spec.md §4.I: "handed over to the session ... or at stop").
pub fn snapshot_all() -> Vec<ThreadLogSnapshot> {
    let registry = registry().lock().expect("checkpoint registry lock poisoned");
    registry
        .iter()
        .map(|log| {
            let records = log.log.snapshot();
            let open_stack = reconstruct_open_stack(&records);
            ThreadLogSnapshot {
                thread_id: log.thread_id,
                records,
                open_stack,
            }
        })
        .collect()
}

/// Clears all registered thread logs and resets the interner. Used between
/// sessions and by `nemb_shutdown`; never called on the hot path.
pub fn reset() {
    registry().lock().expect("checkpoint registry lock poisoned").clear();
    let interner = interner();
    interner.forward.clear();
    interner.reverse.clear();
    interner.next.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn interner_is_stable_across_calls() {
        reset();
        let a = interner().intern("hot_loop");
        let b = interner().intern("hot_loop");
        let c = interner().intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner().resolve(a).as_deref(), Some("hot_loop"));
    }

    #[test]
    #[serial]
    fn enter_exit_pairs_share_invocation_index() {
        reset();
        record(0, "f", CheckpointKind::Enter);
        record(10, "f", CheckpointKind::Exit);
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert_eq!(log.records[0].invocation_index, log.records[1].invocation_index);
        assert!(!log.records[1].orphan);
    }

    #[test]
    #[serial]
    fn recursive_enters_get_increasing_invocation_indices() {
        reset();
        record(10, "r", CheckpointKind::Enter);
        record(20, "r", CheckpointKind::Enter);
        record(30, "r", CheckpointKind::Exit);
        record(40, "r", CheckpointKind::Exit);
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert_eq!(log.records[0].invocation_index, 0);
        assert_eq!(log.records[1].invocation_index, 1);
        assert_eq!(log.records[2].invocation_index, 1); // LIFO: pairs with 2nd enter
        assert_eq!(log.records[3].invocation_index, 0);
        assert!(log.open_stack.is_empty());
    }

    #[test]
    #[serial]
    fn exit_with_empty_stack_is_orphan() {
        reset();
        record(0, "g", CheckpointKind::Exit);
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert!(log.records[0].orphan);
    }

    #[test]
    #[serial]
    fn unclosed_enter_leaves_an_open_stack_entry() {
        reset();
        record(100, "r", CheckpointKind::Enter);
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert_eq!(log.open_stack.len(), 1);
    }

    #[test]
    #[serial]
    fn mark_attaches_to_enclosing_region() {
        reset();
        let r_id = interner().intern("r");
        record(0, "r", CheckpointKind::Enter);
        record(5, "tag", CheckpointKind::Mark);
        record(10, "r", CheckpointKind::Exit);
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert_eq!(log.records[1].kind, CheckpointKind::Mark);
        assert_eq!(log.records[1].enclosing_region_id, Some(r_id));
    }

    #[test]
    #[serial]
    fn push_across_a_block_boundary_preserves_order() {
        reset();
        for i in 0..(BLOCK_CAPACITY + 5) {
            record(i as u64, "spin", CheckpointKind::Enter);
            record(i as u64 + 1, "spin", CheckpointKind::Exit);
        }
        let snaps = snapshot_all();
        let log = snaps.iter().find(|s| !s.records.is_empty()).unwrap();
        assert_eq!(log.records.len(), 2 * (BLOCK_CAPACITY + 5));
        for pair in log.records.chunks(2) {
            assert_eq!(pair[0].kind, CheckpointKind::Enter);
            assert_eq!(pair[1].kind, CheckpointKind::Exit);
            assert_eq!(pair[0].invocation_index, pair[1].invocation_index);
        }
    }
}
