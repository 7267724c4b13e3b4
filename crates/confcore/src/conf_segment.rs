use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Header embedded in every per-org object (§3 "Segment record"/"Segment
/// manager state").
#[derive(Debug)]
pub struct ConfSegment {
    pub id: u32,
    refcount: AtomicUsize,
    alloc: AtomicUsize,
    pub mtime: AtomicU32,
    pub ctime: AtomicU32,
    pub digest: [u8; 16],
    loaded: AtomicBool,
    failed_load: AtomicBool,
}

impl ConfSegment {
    pub fn new(id: u32, alloc: usize, mtime: u32, ctime: u32, digest: [u8; 16]) -> ConfSegment {
        ConfSegment {
            id,
            refcount: AtomicUsize::new(1),
            alloc: AtomicUsize::new(alloc),
            mtime: AtomicU32::new(mtime),
            ctime: AtomicU32::new(ctime),
            digest,
            loaded: AtomicBool::new(true),
            failed_load: AtomicBool::new(false),
        }
    }

    pub fn empty(id: u32) -> ConfSegment {
        ConfSegment::new(id, 0, 0, 0, [0; 16])
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn alloc(&self) -> usize {
        self.alloc.load(Ordering::SeqCst)
    }

    pub fn set_alloc(&self, n: usize) {
        self.alloc.store(n, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn set_loaded(&self, v: bool) {
        self.loaded.store(v, Ordering::SeqCst);
    }

    pub fn failed_load(&self) -> bool {
        self.failed_load.load(Ordering::SeqCst)
    }

    pub fn set_failed_load(&self, v: bool) {
        self.failed_load.store(v, Ordering::SeqCst);
    }

    /// Advances `mtime` to `max(mtime, t)` (`settimeatleast`, §4.7).
    pub fn settimeatleast(&self, t: u32) {
        self.mtime.fetch_max(t, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settimeatleast_never_decreases() {
        let seg = ConfSegment::new(1, 0, 100, 100, [0; 16]);
        seg.settimeatleast(50);
        assert_eq!(seg.mtime.load(Ordering::SeqCst), 100);
        seg.settimeatleast(150);
        assert_eq!(seg.mtime.load(Ordering::SeqCst), 150);
    }

    #[test]
    fn refcount_tracks_acquire_release() {
        let seg = ConfSegment::empty(3);
        seg.acquire();
        assert!(!seg.release());
        assert!(seg.release());
    }
}
