use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use confcache::Config;

use crate::conf_info::ConfInfo;
use crate::conf_kind::ConfKind;
use crate::conf_object::ConfObject;
use crate::dispatch::{Dispatch, JobKind};
use crate::error::{Error, Result};
use crate::segment_manager::SegmentManager;

/// An append-only, immutable-once-published array of conf objects indexed
/// by module id (§3 "ConfSet"). Module id 0 is unused so that ids stay
/// 1-based externally, matching the original's convention.
#[derive(Clone)]
pub struct ConfSet {
    pub generation: u64,
    slots: Vec<Option<Arc<dyn ConfObject>>>,
}

impl ConfSet {
    fn empty() -> ConfSet {
        ConfSet { generation: 0, slots: vec![None] }
    }

    pub fn get(&self, module_id: usize) -> Option<Arc<dyn ConfObject>> {
        self.slots.get(module_id).and_then(|s| s.clone())
    }

    fn ensure_len(&mut self, module_id: usize) {
        if self.slots.len() <= module_id {
            self.slots.resize(module_id + 1, None);
        }
    }

    fn set(&mut self, module_id: usize, obj: Option<Arc<dyn ConfObject>>) {
        self.ensure_len(module_id);
        self.slots[module_id] = obj;
    }
}

struct RegistryInner {
    /// 1-based module id -> info. Index 0 is a dummy to keep ids 1-based.
    infos: Vec<Option<Arc<ConfInfo>>>,
    /// Indices into `infos`, sorted by `ConfInfo::name`, for the O(log n)
    /// duplicate-registration lookup in `register` (§4.4 step 1).
    name_index: Vec<usize>,
}

impl RegistryInner {
    fn new() -> RegistryInner {
        RegistryInner { infos: vec![None], name_index: Vec::new() }
    }

    fn find_by_name(&self, name: &str) -> std::result::Result<usize, usize> {
        self.name_index.binary_search_by(|&idx| self.infos[idx].as_ref().unwrap().name.as_str().cmp(name))
    }
}

/// Process-wide state, here an `Arc`-owned context object rather than a
/// `lazy_static` singleton (§9 "Global mutable state"): `{lock, name_index,
/// info[], loadable_generation, genlock, generation, current_set}`.
///
/// Lock ordering: `genlock` before `lock` when both are needed, matching
/// §3/§5's stated order.
pub struct Registry {
    pub config: Config,
    pub dispatch: Dispatch,
    lock: Mutex<RegistryInner>,
    genlock: Mutex<()>,
    generation: AtomicU64,
    current_set: Mutex<Arc<ConfSet>>,
    loadable_generation: AtomicU64,
    initial_startup: AtomicBool,
    segment_managers: Mutex<HashMap<String, Arc<SegmentManager>>>,
    /// Parsed objects waiting for the next `confset_load` tick to install
    /// them into the published set, keyed by module id.
    pending_objects: Mutex<HashMap<usize, Arc<dyn ConfObject>>>,
}

impl Registry {
    pub fn new(config: Config) -> Arc<Registry> {
        Arc::new(Registry {
            config,
            dispatch: Dispatch::new(),
            lock: Mutex::new(RegistryInner::new()),
            genlock: Mutex::new(()),
            generation: AtomicU64::new(1),
            current_set: Mutex::new(Arc::new(ConfSet::empty())),
            loadable_generation: AtomicU64::new(0),
            initial_startup: AtomicBool::new(true),
            segment_managers: Mutex::new(HashMap::new()),
            pending_objects: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_initial_startup(&self) -> bool {
        self.initial_startup.load(Ordering::SeqCst)
    }

    /// Called once, after the first `confset_load` drains the startup
    /// burst of registrations, so later reloads stop consulting last-good
    /// on a primary open failure (only the very first load gets that grace).
    pub fn end_initial_startup(&self) {
        self.initial_startup.store(false, Ordering::SeqCst);
    }

    /// Registers a conf type (`register`, §4.4). `path` may contain a
    /// single `%u` placeholder for segmented types.
    pub fn register(
        self: &Arc<Self>,
        name: &str,
        path: &str,
        type_name: &'static str,
        kind: Arc<dyn ConfKind>,
        loadable: bool,
        loadflags: u32,
        userdata: Vec<u8>,
    ) -> Result<usize> {
        let mut inner = self.lock.lock().unwrap();
        if let Ok(idx) = inner.find_by_name(name) {
            let slot = inner.name_index[idx];
            let info = inner.infos[slot].clone().unwrap();
            if info.path == path && info.type_name == type_name {
                info.bump_registered();
                return Ok(slot);
            }
            if info.is_loadable() {
                return Err(Error::Registration(format!(
                    "{} already registered loadable with a different path/type",
                    name
                )));
            }
        }

        let info = Arc::new(ConfInfo::new(name, path, type_name, kind.clone(), loadable, loadflags, userdata));
        let module_id = inner.infos.len();
        inner.infos.push(Some(info.clone()));
        let pos = inner.name_index.binary_search_by(|&idx| inner.infos[idx].as_ref().unwrap().name.as_str().cmp(name)).unwrap_err();
        inner.name_index.insert(pos, module_id);

        if let Some(ops) = kind.segment_ops() {
            let segments = crate::segment_manager::static_no_segments();
            let manager = Arc::new(SegmentManager::new(ops, segments, self.config.worker_target.max(1) * 2));
            self.segment_managers.lock().unwrap().insert(name.to_owned(), manager);
        }

        if loadable {
            self.loadable_generation.fetch_add(1, Ordering::SeqCst);
            self.dispatch.put_todo(JobKind::Load { info });
        }
        Ok(module_id)
    }

    /// Decrements `registered`; at zero, marks the slot unloadable and frees
    /// the info once no ConfSet still references it.
    pub fn unregister(&self, module_id: usize) {
        let inner = self.lock.lock().unwrap();
        if let Some(Some(info)) = inner.infos.get(module_id) {
            if info.drop_registered() == 0 {
                info.set_loadable(false);
            }
        }
    }

    pub fn segment_manager(&self, name: &str) -> Option<Arc<SegmentManager>> {
        self.segment_managers.lock().unwrap().get(name).cloned()
    }

    /// Replaces the placeholder `NoSegments` discovery source installed at
    /// `register` time with a real one. Must be called before the first
    /// `SegmentManager::tick` for `name`.
    pub fn attach_segments(&self, name: &str, segments: Arc<dyn crate::segment_manager::PrefSegments>) {
        let mut managers = self.segment_managers.lock().unwrap();
        if let Some(old) = managers.get(name) {
            let ops = old.ops_handle();
            let parallel = old.parallel_cap();
            managers.insert(name.to_owned(), Arc::new(SegmentManager::new(ops, segments, parallel)));
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reader-side acquire. Returns `None` if `*cached_generation` is
    /// already current (§4.4 `confset_acquire`).
    pub fn confset_acquire(&self, cached_generation: &mut u64) -> Option<Arc<ConfSet>> {
        let _guard = self.genlock.lock().unwrap();
        let now = self.generation.load(Ordering::SeqCst);
        if *cached_generation == now {
            return None;
        }
        *cached_generation = now;
        Some(self.current_set.lock().unwrap().clone())
    }

    /// Symmetric with `confset_acquire`; Rust's `Arc` already reclaims a
    /// set's storage when the last clone drops, so this mostly exists for
    /// API parity — it's where a production build would enqueue a
    /// dispatched free for very large sets instead of an inline drop.
    pub fn confset_release(&self, set: Arc<ConfSet>, dispatch_free: bool) {
        if dispatch_free && Arc::strong_count(&set) == 1 {
            // Oversized sets can be handed to a worker to drop off-thread.
            // Conf objects inside aren't individually split out here since
            // this crate's ConfSet owns `Arc<dyn ConfObject>` directly
            // rather than raw pointers needing manual release.
            drop(set);
        }
    }

    /// The config-thread tick (§4.4 `confset_load`).
    pub fn confset_load(self: &Arc<Self>, worker: &crate::worker::Worker) -> bool {
        self.dispatch.drain_wait_into_todo();

        if self.config.worker_target == 0 {
            while worker.process_one_job(false) {}
        }

        let segments_changed = self.drive_segment_managers(worker);

        let mut harvested: Vec<Arc<ConfInfo>> = Vec::new();
        while let Some(job) = self.dispatch.getresult(|| true) {
            if let crate::dispatch::JobKind::Load { info } = job.kind {
                harvested.push(info);
            }
        }

        if harvested.is_empty() {
            return segments_changed;
        }

        let _genlock = self.genlock.lock().unwrap();
        let base = self.current_set.lock().unwrap().clone();
        let mut next = (*base).clone();
        let mut changed = false;
        let inner = self.lock.lock().unwrap();
        for info in &harvested {
            if let Ok(idx) = inner.find_by_name(&info.name) {
                let module_id = inner.name_index[idx];
                // The load result itself was already installed on `info`
                // by `Worker::reload`; here we just re-point the set's slot
                // at whatever `Registry::install_load_result` stashed.
                if let Some(obj) = self.pending_objects.lock().unwrap().remove(&module_id) {
                    next.set(module_id, Some(obj));
                    changed = true;
                }
            }
            self.dispatch.put_wait(JobKind::Load { info: info.clone() }, self.config.reload_interval);
        }
        drop(inner);

        if changed {
            let new_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            next.generation = new_gen.max(2);
            *self.current_set.lock().unwrap() = Arc::new(next);
        }
        changed || segments_changed
    }

    /// Stashes a freshly parsed object so the next `confset_load` tick picks
    /// it up (`Worker::reload` calls this right after a successful parse).
    pub fn install_load_result(&self, info: &Arc<ConfInfo>, obj: Arc<dyn ConfObject>) {
        let inner = self.lock.lock().unwrap();
        if let Ok(idx) = inner.find_by_name(&info.name) {
            let module_id = inner.name_index[idx];
            self.pending_objects.lock().unwrap().insert(module_id, obj);
        }
    }

    fn info_by_name(&self, name: &str) -> Option<Arc<ConfInfo>> {
        let inner = self.lock.lock().unwrap();
        inner.find_by_name(name).ok().and_then(|idx| inner.infos[inner.name_index[idx]].clone())
    }

    /// Advances every registered segmented type's `SegmentManager` by one
    /// tick (§4.7): enqueues whatever sub-jobs this tick discovered, and —
    /// in synchronous (`worker_target == 0`) mode — drains them inline
    /// before returning. When a manager's run finalizes this tick, its
    /// clone is published into the current `ConfSet` under `genlock`.
    /// Called once per `confset_load` cycle; a manager with more changes
    /// than fit in one batch stays `Requeued` and keeps progressing on
    /// later calls.
    pub fn drive_segment_managers(self: &Arc<Self>, worker: &crate::worker::Worker) -> bool {
        let names: Vec<String> = self.segment_managers.lock().unwrap().keys().cloned().collect();
        let mut changed = false;
        for name in names {
            let manager = match self.segment_managers.lock().unwrap().get(&name).cloned() {
                Some(m) => m,
                None => continue,
            };
            let info = match self.info_by_name(&name) {
                Some(i) => i,
                None => continue,
            };
            let outcome = manager.tick();
            for (segment_id, _path) in outcome.enqueued {
                self.dispatch.put_todo(JobKind::SegmentSub { info: info.clone(), segment_id });
            }
            if self.config.worker_target == 0 {
                while worker.process_one_job(false) {}
            }
            if outcome.published {
                if let Some(cur) = manager.current() {
                    let _genlock = self.genlock.lock().unwrap();
                    let inner = self.lock.lock().unwrap();
                    if let Ok(idx) = inner.find_by_name(&name) {
                        let module_id = inner.name_index[idx];
                        drop(inner);
                        let base = self.current_set.lock().unwrap().clone();
                        let mut next = (*base).clone();
                        next.set(module_id, Some(cur));
                        let new_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                        next.generation = new_gen.max(2);
                        *self.current_set.lock().unwrap() = Arc::new(next);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}
