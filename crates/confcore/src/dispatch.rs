use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::conf_info::ConfInfo;
use crate::ConfObject;

/// What a job means is discriminated by which fields are present, mirroring
/// the original's `(info, data)` union discriminant (§3 "Dispatch job").
pub enum JobKind {
    /// A whole-file load request for `info`.
    Load { info: Arc<ConfInfo> },
    /// A per-segment sub-job spawned by a `SegmentManager` run.
    SegmentSub { info: Arc<ConfInfo>, segment_id: u32 },
    /// An asynchronous free: drop `obj` off the enqueuing thread.
    Free { obj: Arc<dyn ConfObject> },
    /// Tells a worker to exit its loop.
    WorkerExit,
}

pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub wait_ms: u64,
    enqueued_at: Instant,
}

impl Job {
    fn new(id: u64, kind: JobKind) -> Job {
        Job { id, kind, wait_ms: 0, enqueued_at: Instant::now() }
    }
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<Job>>,
    cv: Condvar,
}

impl Queue {
    fn push(&self, job: Job) {
        self.items.lock().unwrap().push_back(job);
        self.cv.notify_all();
    }

    fn pop(&self) -> Option<Job> {
        self.items.lock().unwrap().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct WaitEntry {
    job: Job,
    ready_at: Instant,
}

/// Five FIFO queues coordinated by mutexes and condition variables (§4.5).
///
/// Lock ordering when more than one queue's internal lock is held at once:
/// `todo -> live -> done`, and separately `live -> dead`. `wait`'s lock is
/// never taken alongside any other queue's lock. This type enforces that
/// discipline by never acquiring two queues' locks in the same method body
/// except in the documented order.
pub struct Dispatch {
    dead: Queue,
    wait: Mutex<Vec<WaitEntry>>,
    todo: Queue,
    /// Count of jobs currently popped from `todo` and not yet on `done` or
    /// `dead`. Only the count matters here (to detect "no more work can
    /// ever arrive" in `getresult`); the job payload itself travels in the
    /// worker's local variables between `getwork` and `donework`.
    live: Mutex<usize>,
    done: Queue,
    next_id: AtomicU64,
}

impl Default for Dispatch {
    fn default() -> Self {
        Dispatch::new()
    }
}

impl Dispatch {
    pub fn new() -> Dispatch {
        Dispatch {
            dead: Queue::default(),
            wait: Mutex::new(Vec::new()),
            todo: Queue::default(),
            live: Mutex::new(0),
            done: Queue::default(),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueues a fresh load/free/exit job onto `todo`.
    pub fn put_todo(&self, kind: JobKind) -> u64 {
        let id = self.alloc_id();
        log::trace!("dispatch: enqueue job {}", id);
        self.todo.push(Job::new(id, kind));
        id
    }

    /// Worker-side pop. Blocks on the todo condvar when `block` is true and
    /// the queue is currently empty.
    pub fn getwork(&self, block: bool) -> Option<Job> {
        let mut guard = self.todo.items.lock().unwrap();
        loop {
            if let Some(job) = guard.pop_front() {
                *self.live.lock().unwrap() += 1;
                return Some(job);
            }
            if !block {
                return None;
            }
            guard = self.todo.cv.wait(guard).unwrap();
        }
    }

    /// Moves a job from `live` to `done`.
    pub fn donework(&self, job: Job) {
        *self.live.lock().unwrap() -= 1;
        self.done.push(job);
    }

    /// Moves a job from `live` back to `todo` with no delay (the
    /// SegmentManager's cooperative-yield "REQUEUED" mechanism, §9).
    pub fn requeue(&self, job: Job) {
        *self.live.lock().unwrap() -= 1;
        self.todo.push(job);
    }

    /// Discards a job onto `dead` (its id is forgotten; Rust's `Drop`
    /// reclaims the job's payload here rather than the dead queue acting as
    /// a real free-list, unlike the original's fixed-size job-struct pool).
    pub fn deadwork(&self, job: Job) {
        *self.live.lock().unwrap() -= 1;
        drop(job);
        self.dead.cv.notify_all();
    }

    /// Places a just-completed job on `wait`, recording its readiness time
    /// so `getwait` can later reclaim it for reload eligibility.
    pub fn put_wait(&self, kind: JobKind, delay: Duration) {
        let id = self.alloc_id();
        let mut job = Job::new(id, kind);
        job.wait_ms = delay.as_millis() as u64;
        self.wait.lock().unwrap().push(WaitEntry { ready_at: Instant::now() + delay, job });
    }

    /// Pops the oldest wait entry whose age (time since it became ready) is
    /// at least `min_ms`. If nothing qualifies, adjusts `*min_ms` down to
    /// the number of milliseconds until the next entry *would* qualify, so
    /// the caller can sleep that long and retry — matching the original's
    /// "enables a correct sleep" contract. Millisecond resolution is
    /// `Instant`-truncated, never rounded up, so the `age >= min_ms`
    /// comparison stays conservative (§9 Open Question 2).
    pub fn getwait(&self, min_ms: &mut u64) -> Option<Job> {
        let mut guard = self.wait.lock().unwrap();
        let now = Instant::now();
        let mut ready_idx = None;
        let mut soonest: Option<u64> = None;
        for (i, entry) in guard.iter().enumerate() {
            if entry.ready_at <= now {
                ready_idx = Some(i);
                break;
            }
            let remaining = (entry.ready_at - now).as_millis() as u64;
            soonest = Some(soonest.map_or(remaining, |s: u64| s.min(remaining)));
        }
        match ready_idx {
            Some(i) => Some(guard.remove(i).job),
            None => {
                if let Some(s) = soonest {
                    *min_ms = s;
                }
                None
            }
        }
    }

    /// Moves the oldest `wait` entries whose delay has elapsed onto `todo`.
    pub fn drain_wait_into_todo(&self) -> usize {
        let mut min_ms = 0;
        let mut n = 0;
        while let Some(job) = self.getwait(&mut min_ms) {
            self.todo.push(job);
            n += 1;
        }
        n
    }

    /// Blocks until `done` has an item, or both `todo` and `live` are empty
    /// (i.e. there is nothing left that could ever produce one). `gate`
    /// lets the caller unblock on shutdown even with no work pending.
    pub fn getresult<F: Fn() -> bool>(&self, gate: F) -> Option<Job> {
        loop {
            if let Some(job) = self.done.pop() {
                return Some(job);
            }
            if self.todo.is_empty() && *self.live.lock().unwrap() == 0 {
                return None;
            }
            if !gate() {
                return None;
            }
            let guard = self.done.items.lock().unwrap();
            let _ = self.done.cv.wait_timeout(guard, Duration::from_millis(20)).unwrap();
        }
    }

    pub fn todo_len(&self) -> usize {
        self.todo.len()
    }

    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    pub fn wait_len(&self) -> usize {
        self.wait.lock().unwrap().len()
    }

    /// Shutdown drain: empties `wait` and `todo` (and `dead`, trivially),
    /// freeing `Free` jobs inline and handing everything else to `cb`.
    pub fn purge<F: FnMut(Job)>(&self, mut cb: F) {
        let mut wait = self.wait.lock().unwrap();
        for entry in wait.drain(..) {
            dispatch_one(entry.job, &mut cb);
        }
        drop(wait);
        while let Some(job) = self.todo.pop() {
            dispatch_one(job, &mut cb);
        }
    }
}

fn dispatch_one<F: FnMut(Job)>(job: Job, cb: &mut F) {
    match job.kind {
        JobKind::Free { obj } => drop(obj),
        other => cb(Job { id: job.id, kind: other, wait_ms: job.wait_ms, enqueued_at: job.enqueued_at }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf_info::ConfInfo;

    fn info() -> Arc<ConfInfo> {
        Arc::new(ConfInfo::new("n", "p", "t", Arc::new(crate::conf_kind::NoopKind), true, 0, Vec::new()))
    }

    #[test]
    fn put_then_getwork_roundtrips() {
        let d = Dispatch::new();
        d.put_todo(JobKind::Load { info: info() });
        let job = d.getwork(false).unwrap();
        assert!(matches!(job.kind, JobKind::Load { .. }));
    }

    #[test]
    fn getwork_nonblocking_returns_none_on_empty() {
        let d = Dispatch::new();
        assert!(d.getwork(false).is_none());
    }

    #[test]
    fn wait_queue_empty_leaves_min_ms_unchanged() {
        let d = Dispatch::new();
        let mut min_ms = 42;
        assert!(d.getwait(&mut min_ms).is_none());
        assert_eq!(min_ms, 42);
    }

    #[test]
    fn wait_entry_not_ready_reports_remaining_time() {
        let d = Dispatch::new();
        d.put_wait(JobKind::Load { info: info() }, Duration::from_millis(500));
        let mut min_ms = 0;
        assert!(d.getwait(&mut min_ms).is_none());
        assert!(min_ms > 0 && min_ms <= 500);
    }

    #[test]
    fn getresult_returns_none_when_nothing_pending() {
        let d = Dispatch::new();
        assert!(d.getresult(|| true).is_none());
    }

    #[test]
    fn donework_moves_job_into_done_queue() {
        let d = Dispatch::new();
        d.put_todo(JobKind::Load { info: info() });
        let job = d.getwork(false).unwrap();
        d.donework(job);
        assert_eq!(d.done_len(), 1);
        let got = d.getresult(|| true).unwrap();
        assert!(matches!(got.kind, JobKind::Load { .. }));
    }

    #[test]
    fn purge_frees_free_jobs_inline_and_calls_back_for_others() {
        let d = Dispatch::new();
        d.put_todo(JobKind::Load { info: info() });
        let mut seen = 0;
        d.purge(|_job| seen += 1);
        assert_eq!(seen, 1);
        assert_eq!(d.todo_len(), 0);
    }
}
