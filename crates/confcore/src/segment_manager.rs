use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use confcache::ConfLoader;

use crate::conf_info::ConfInfo;
use crate::conf_object::ConfObject;
use crate::conf_segment::ConfSegment;
use crate::error::Result;

/// A single discovered on-disk change for a segmented prefs type (§3
/// "Segment record").
#[derive(Debug, Clone)]
pub enum SegmentChange {
    Added(u32, PathBuf),
    Modified(u32, PathBuf),
    Removed(u32),
}

/// Discovers which segments changed since the last run. A real deployment
/// walks the registered directory pattern; tests supply a canned list.
pub trait PrefSegments: Send + Sync {
    fn poll_changes(&self) -> Vec<SegmentChange>;
}

/// Placeholder installed at registration time before a real segment
/// discovery source is attached; always reports no changes.
pub struct NoSegments;

impl PrefSegments for NoSegments {
    fn poll_changes(&self) -> Vec<SegmentChange> {
        Vec::new()
    }
}

pub fn static_no_segments() -> Arc<dyn PrefSegments> {
    Arc::new(NoSegments)
}

/// A fixed, one-shot change list: the first `poll_changes` call returns it in
/// full, every later call reports nothing. Useful for tests and for seeding a
/// manager with a known initial directory listing before a real watcher
/// takes over.
pub struct CannedSegments {
    changes: Mutex<Vec<SegmentChange>>,
}

impl CannedSegments {
    pub fn new(changes: Vec<SegmentChange>) -> Arc<CannedSegments> {
        Arc::new(CannedSegments { changes: Mutex::new(changes) })
    }
}

impl PrefSegments for CannedSegments {
    fn poll_changes(&self) -> Vec<SegmentChange> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl CannedSegments {
    /// Appends a change for a later poll, simulating a live rescan
    /// discovering something new after the initial batch drained.
    pub fn push(&self, change: SegmentChange) {
        self.changes.lock().unwrap().push(change);
    }
}

/// The vtable a segmented prefs type supplies at registration (§4.7).
///
/// `me` is always the clone produced by this run's `clone_current` call;
/// implementations are expected to use interior mutability (a `Mutex` around
/// their slot vector) since several methods logically mutate "me" through a
/// shared reference — mirroring how the original mutates through a bare
/// pointer under the manager's own lock.
pub trait SegmentOps: Send + Sync {
    fn clone_current(&self, obase: Option<&Arc<dyn ConfObject>>) -> Arc<dyn ConfObject>;
    fn settimeatleast(&self, me: &dyn ConfObject, t: u32);
    /// `Ok(slot)` if `id` is present, `Err(insertion_index)` otherwise.
    fn id2slot(&self, me: &dyn ConfObject, id: u32) -> std::result::Result<usize, usize>;
    fn slot2segment(&self, me: &dyn ConfObject, slot: usize) -> Option<Arc<ConfSegment>>;
    fn remove_slot(&self, me: &dyn ConfObject, slot: usize) -> usize;
    fn newsegment(&self, id: u32, loader: &mut ConfLoader, info: &ConfInfo) -> Result<Arc<dyn ConfObject>>;
    /// Installs `new_seg` at `slot` (inserting if absent), returning the
    /// allocation delta attributed to this install.
    fn usesegment(&self, me: &dyn ConfObject, new_seg: Arc<dyn ConfObject>, slot: usize) -> usize;
    fn loaded(&self, me: &dyn ConfObject);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    New,
    Running,
    Requeued,
}

/// Per-prefs-type controller (§3 "Segment manager state", §4.7 algorithm).
pub struct SegmentManager {
    ops: Arc<dyn SegmentOps>,
    segments: Arc<dyn PrefSegments>,
    parallel: usize,
    state: Mutex<ManagerState>,
    current: Mutex<Option<Arc<dyn ConfObject>>>,
    /// Changes fetched from `segments` but not yet enqueued because the
    /// previous tick hit the `parallel` cap; drained before the next
    /// `poll_changes` call so a capped batch never silently loses entries.
    backlog: Mutex<std::collections::VecDeque<SegmentChange>>,
    pending: AtomicUsize,
    failed: AtomicUsize,
    done: AtomicUsize,
    updates: AtomicU32,
    alloc: AtomicUsize,
    start: Mutex<Option<Instant>>,
}

/// One run's outcome, reported back to the caller driving ticks in tests.
pub struct TickOutcome {
    pub state: ManagerState,
    pub enqueued: Vec<(u32, PathBuf)>,
    pub published: bool,
}

impl SegmentManager {
    pub fn new(ops: Arc<dyn SegmentOps>, segments: Arc<dyn PrefSegments>, parallel: usize) -> SegmentManager {
        SegmentManager {
            ops,
            segments,
            parallel: parallel.max(1),
            state: Mutex::new(ManagerState::New),
            current: Mutex::new(None),
            backlog: Mutex::new(std::collections::VecDeque::new()),
            pending: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            updates: AtomicU32::new(0),
            alloc: AtomicUsize::new(0),
            start: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap()
    }

    pub fn ops_handle(&self) -> Arc<dyn SegmentOps> {
        self.ops.clone()
    }

    pub fn parallel_cap(&self) -> usize {
        self.parallel
    }

    pub fn current(&self) -> Option<Arc<dyn ConfObject>> {
        self.current.lock().unwrap().clone()
    }

    /// Runs one tick of the `NEW -> RUNNING -> REQUEUED -> NEW` cycle
    /// (§4.7). Returns the sub-jobs that should be handed to the worker
    /// pool's todo queue this tick, and whether this tick finalized (and
    /// thus published) a run.
    pub fn tick(&self) -> TickOutcome {
        let mut state = self.state.lock().unwrap();
        match *state {
            ManagerState::New => {
                let obase = self.current.lock().unwrap().clone();
                let clone = self.ops.clone_current(obase.as_ref());
                *self.current.lock().unwrap() = Some(clone);
                self.pending.store(0, Ordering::SeqCst);
                self.failed.store(0, Ordering::SeqCst);
                self.done.store(0, Ordering::SeqCst);
                self.updates.store(0, Ordering::SeqCst);
                self.alloc.store(0, Ordering::SeqCst);
                self.backlog.lock().unwrap().clear();
                *self.start.lock().unwrap() = Some(Instant::now());
                *state = ManagerState::Running;
                self.run_batch(&mut state)
            }
            ManagerState::Requeued => self.run_batch(&mut state),
            ManagerState::Running => self.run_batch(&mut state),
        }
    }

    /// Pulls a fresh batch from `segments` only once the backlog from the
    /// previous tick is exhausted — a capped tick leaves its overflow in
    /// `backlog` rather than asking `poll_changes` again (which, for a real
    /// directory scan, would re-report the same still-unprocessed entries,
    /// but for a fixed/canned source would simply lose them).
    fn run_batch(&self, state: &mut ManagerState) -> TickOutcome {
        let me = self.current.lock().unwrap().clone().expect("segment manager run without a clone");
        let mut enqueued = Vec::new();
        let mut backlog = self.backlog.lock().unwrap();
        if backlog.is_empty() {
            backlog.extend(self.segments.poll_changes());
        }
        while self.pending.load(Ordering::SeqCst) < self.parallel {
            let Some(change) = backlog.pop_front() else { break };
            match change {
                SegmentChange::Removed(id) => {
                    if let Ok(slot) = self.ops.id2slot(me.as_ref(), id) {
                        let freed = self.ops.remove_slot(me.as_ref(), slot);
                        self.alloc.fetch_sub(freed.min(self.alloc.load(Ordering::SeqCst)), Ordering::SeqCst);
                        self.updates.fetch_add(1, Ordering::SeqCst);
                        self.done.fetch_add(1, Ordering::SeqCst);
                    }
                }
                SegmentChange::Added(id, path) | SegmentChange::Modified(id, path) => {
                    self.pending.fetch_add(1, Ordering::SeqCst);
                    enqueued.push((id, path));
                }
            }
        }
        drop(backlog);

        if self.pending.load(Ordering::SeqCst) > 0 {
            *state = ManagerState::Requeued;
            return TickOutcome { state: *state, enqueued, published: false };
        }

        if self.updates.load(Ordering::SeqCst) > 0 {
            self.ops.loaded(me.as_ref());
        }
        *state = ManagerState::New;
        TickOutcome { state: *state, enqueued, published: true }
    }

    /// Reports the completion of one sub-job spawned by `run_batch`, to be
    /// called from the worker's `reload_segment` path once the load and
    /// `usesegment` install complete.
    pub fn sub_job_done(&self, alloc_delta: usize, failed: bool) {
        self.alloc.fetch_add(alloc_delta, Ordering::SeqCst);
        if failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        self.done.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn alloc(&self) -> usize {
        self.alloc.load(Ordering::SeqCst)
    }
}
