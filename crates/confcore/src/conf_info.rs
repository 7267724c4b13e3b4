use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use confcache::StatSnapshot;

use crate::conf_kind::ConfKind;

/// One per `(name, path, type)` registration (§3, §4.4).
///
/// Mutable fields that the worker updates after a load (`st`, `digest`,
/// `alloc`) live behind a `Mutex` rather than individual atomics: they are
/// always written together at the end of a load, so a single lock keeps that
/// update atomic from a reader's point of view without needing a full
/// compare-and-swap protocol.
pub struct ConfInfo {
    pub name: String,
    pub path: String,
    pub type_name: &'static str,
    pub loadflags: u32,
    pub userdata: Vec<u8>,
    pub kind: Arc<dyn ConfKind>,
    registered: AtomicU32,
    loadable: AtomicBool,
    refcount: AtomicUsize,
    failed_load: AtomicBool,
    updates: AtomicU32,
    load_state: Mutex<LoadState>,
}

#[derive(Debug, Clone, Default)]
struct LoadState {
    st: StatSnapshot,
    digest: [u8; 16],
    alloc: usize,
}

impl ConfInfo {
    pub fn new(
        name: &str,
        path: &str,
        type_name: &'static str,
        kind: Arc<dyn ConfKind>,
        loadable: bool,
        loadflags: u32,
        userdata: Vec<u8>,
    ) -> ConfInfo {
        ConfInfo {
            name: name.to_owned(),
            path: path.to_owned(),
            type_name,
            loadflags,
            userdata,
            kind,
            registered: AtomicU32::new(1),
            loadable: AtomicBool::new(loadable),
            refcount: AtomicUsize::new(1),
            failed_load: AtomicBool::new(false),
            updates: AtomicU32::new(0),
            load_state: Mutex::new(LoadState::default()),
        }
    }

    pub fn is_loadable(&self) -> bool {
        self.loadable.load(Ordering::SeqCst)
    }

    pub fn set_loadable(&self, v: bool) {
        self.loadable.store(v, Ordering::SeqCst);
    }

    pub fn registered_count(&self) -> u32 {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn bump_registered(&self) -> u32 {
        self.registered.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new count; the slot may be recycled once this and
    /// `refcount()` both reach zero (§3 ConfInfo invariant).
    pub fn drop_registered(&self) -> u32 {
        self.registered.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true if this was the last reference.
    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn failed_load(&self) -> bool {
        self.failed_load.load(Ordering::SeqCst)
    }

    pub fn set_failed_load(&self, v: bool) {
        self.failed_load.store(v, Ordering::SeqCst);
    }

    pub fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn bump_updates(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stat(&self) -> StatSnapshot {
        self.load_state.lock().unwrap().st
    }

    pub fn digest(&self) -> [u8; 16] {
        self.load_state.lock().unwrap().digest
    }

    pub fn alloc(&self) -> usize {
        self.load_state.lock().unwrap().alloc
    }

    pub fn record_load(&self, st: StatSnapshot, digest: [u8; 16], alloc: usize) {
        let mut state = self.load_state.lock().unwrap();
        state.st = st;
        state.digest = digest;
        state.alloc = alloc;
    }

    /// Clears both `st.dev` and `st.ino` so a same-size, same-mtime
    /// replacement file can never mask a previous failure on the next scan
    /// (§9 Open Question 1).
    pub fn clear_stat_identity(&self) {
        let mut state = self.load_state.lock().unwrap();
        state.st.dev = 0;
        state.st.ino = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_and_refcount_start_at_one() {
        let info = ConfInfo::new("n", "p", "t", Arc::new(crate::conf_kind::NoopKind), true, 0, Vec::new());
        assert_eq!(info.registered_count(), 1);
        assert_eq!(info.refcount(), 1);
    }

    #[test]
    fn failed_reload_clears_dev_and_ino() {
        let info = ConfInfo::new("n", "p", "t", Arc::new(crate::conf_kind::NoopKind), true, 0, Vec::new());
        info.record_load(StatSnapshot { dev: 7, ino: 9, size: 1, mtime: 1, ctime: 1 }, [0; 16], 1);
        info.clear_stat_identity();
        let st = info.stat();
        assert_eq!(st.dev, 0);
        assert_eq!(st.ino, 0);
        assert_eq!(st.size, 1);
    }

    #[test]
    fn release_reports_last_reference() {
        let info = ConfInfo::new("n", "p", "t", Arc::new(crate::conf_kind::NoopKind), true, 0, Vec::new());
        info.acquire();
        assert!(!info.release());
        assert!(info.release());
    }
}
