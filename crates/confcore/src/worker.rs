use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use confcache::{CHOMP, SKIP_COMMENTS, SKIP_EMPTY};

use crate::conf_info::ConfInfo;
use crate::dispatch::{Job, JobKind};
use crate::report_sink::{NullReportSink, ReportSink};
use crate::Registry;

/// Load flags every whole-file reload uses for line framing; parsers read
/// records from the already-framed lines `reload` hands them.
pub const DEFAULT_LINE_FLAGS: u32 = CHOMP | SKIP_EMPTY | SKIP_COMMENTS;

/// Pool of loader threads running `getwork -> parse -> donework` (§4.6).
pub struct Worker {
    registry: Arc<Registry>,
    report: Arc<dyn ReportSink>,
    timetodie: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(registry: Arc<Registry>) -> Worker {
        Worker { registry, report: Arc::new(NullReportSink), timetodie: Arc::new(AtomicBool::new(false)), handles: Mutex::new(Vec::new()) }
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Worker {
        self.report = sink;
        self
    }

    /// Spawns `n` worker threads. `worker_target == 0` is the synchronous
    /// mode (§9): callers drive `process_one_job` from the config thread
    /// instead of calling `spawn`.
    pub fn spawn(&self, n: usize) {
        let mut handles = self.handles.lock().unwrap();
        for _ in 0..n {
            let registry = self.registry.clone();
            let report = self.report.clone();
            let timetodie = self.timetodie.clone();
            handles.push(std::thread::spawn(move || worker_loop(registry, report, timetodie)));
        }
    }

    /// Requests all current workers to exit and joins them (§5
    /// "Cancellation and timeouts").
    pub fn shutdown(&self) {
        self.timetodie.store(true, Ordering::SeqCst);
        let n = self.handles.lock().unwrap().len();
        for _ in 0..n {
            self.registry.dispatch.put_todo(JobKind::WorkerExit);
        }
        for h in self.handles.lock().unwrap().drain(..) {
            let _ = h.join();
        }
    }

    /// Drains and processes exactly one todo-queue job inline, for the
    /// `worker_target == 0` synchronous mode.
    pub fn process_one_job(&self, block: bool) -> bool {
        match self.registry.dispatch.getwork(block) {
            Some(job) => {
                handle_job(&self.registry, &self.report, job);
                true
            }
            None => false,
        }
    }
}

fn worker_loop(registry: Arc<Registry>, report: Arc<dyn ReportSink>, timetodie: Arc<AtomicBool>) {
    loop {
        let job = match registry.dispatch.getwork(true) {
            Some(j) => j,
            None => continue,
        };
        if matches!(job.kind, JobKind::WorkerExit) {
            registry.dispatch.deadwork(job);
            return;
        }
        if timetodie.load(Ordering::SeqCst) {
            // finish the job currently in hand, then exit on the next pop.
            handle_job(&registry, &report, job);
            continue;
        }
        handle_job(&registry, &report, job);
    }
}

fn handle_job(registry: &Arc<Registry>, report: &Arc<dyn ReportSink>, job: Job) {
    match job.kind {
        JobKind::WorkerExit => unreachable!("handled by caller"),
        JobKind::Free { obj } => {
            drop(obj);
            registry.dispatch.deadwork(Job { id: job.id, kind: JobKind::Free { obj: dummy_free() }, wait_ms: 0, enqueued_at: std::time::Instant::now() });
        }
        JobKind::Load { info } => {
            let outcome = reload(registry, &info, report);
            registry.dispatch.donework(Job { id: job.id, kind: JobKind::Load { info }, wait_ms: 0, enqueued_at: std::time::Instant::now() });
            let _ = outcome;
        }
        JobKind::SegmentSub { info, segment_id } => {
            reload_segment(registry, &info, segment_id);
            registry.dispatch.deadwork(Job { id: job.id, kind: JobKind::SegmentSub { info, segment_id }, wait_ms: 0, enqueued_at: std::time::Instant::now() });
        }
    }
}

/// A placeholder used only to reconstruct a `Free` job shell after its
/// payload has already been dropped (donework/deadwork need *a* job value
/// to carry, not the freed object itself).
fn dummy_free() -> Arc<dyn crate::ConfObject> {
    struct Gone;
    impl crate::ConfObject for Gone {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn type_name(&self) -> &'static str {
            "freed"
        }
    }
    Arc::new(Gone)
}

/// Whole-file reload (§4.6). Tries the primary path; on parse failure,
/// rejects the bad copy and — at initial startup only — retries from the
/// last-good backup.
pub fn reload(registry: &Arc<Registry>, info: &Arc<ConfInfo>, report: &Arc<dyn ReportSink>) -> bool {
    let config = &registry.config;
    let primary = config.resolve(&PathBuf::from(&info.path));
    let backup_dir = config.last_good_dir.clone();

    let loaded = try_load(registry, info, &primary, backup_dir.as_deref());
    if loaded {
        report.report(&info.name, 1, info.type_name);
        return true;
    }

    if registry.is_initial_startup() {
        if let Some(dir) = backup_dir {
            let mut last_good_name = std::ffi::OsString::from(primary.file_name().unwrap_or_default());
            last_good_name.push(config.backup_suffix.clone());
            let last_good_path = dir.join(last_good_name);
            if try_load(registry, info, &last_good_path, None) {
                log::warn!("{}: primary load failed, recovered from last-good", info.name);
                return true;
            }
        }
    }
    info.clear_stat_identity();
    info.set_failed_load(true);
    false
}

fn try_load(registry: &Arc<Registry>, info: &Arc<ConfInfo>, path: &std::path::Path, backup_dir: Option<&std::path::Path>) -> bool {
    let loader = match confcache::ConfLoader::open(path, backup_dir, None, DEFAULT_LINE_FLAGS) {
        Ok(Some(l)) => l,
        Ok(None) => return false,
        Err(e) => {
            log::warn!("{}: open {} failed: {}", info.name, path.display(), e);
            return false;
        }
    };
    let st = loader.stat();
    let mut loader = loader;
    match info.kind.parse(&mut loader) {
        Ok(obj) => {
            let alloc = std::mem::size_of_val(obj.as_ref());
            match loader.done(alloc) {
                Ok(load_info) => {
                    info.record_load(st, load_info.digest, load_info.alloc);
                    info.set_failed_load(false);
                    registry.install_load_result(info, obj);
                    true
                }
                Err(e) => {
                    log::warn!("{}: finalize failed: {}", info.name, e);
                    false
                }
            }
        }
        Err(e) => {
            log::warn!("{}: parse failed: {}", info.name, e);
            let reject_dir = registry.config.reject_dir.clone();
            if let Some(dir) = reject_dir {
                let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                let _ = loader.reject(&name, &dir);
            }
            false
        }
    }
}

/// Per-segment sub-job: open, parse, and install via `SegmentOps::usesegment`.
///
/// Mirrors `reload`'s reject-and-retry-from-last-good discipline (§4.7): a
/// parse failure rejects the bad copy and, at initial startup only, retries
/// from `<basename><backup_suffix>` under `last_good_dir`. If the segment
/// has previously loaded, a still-failing reload marks its stored header
/// `failed_load` rather than replacing it — the old data stays in the slot.
fn reload_segment(registry: &Arc<Registry>, info: &Arc<ConfInfo>, segment_id: u32) {
    let Some(manager) = registry.segment_manager(&info.name) else {
        log::warn!("{}: segment sub-job with no manager registered", info.name);
        return;
    };
    let ops = match info.kind.segment_ops() {
        Some(ops) => ops,
        None => {
            log::warn!("{}: segmented job for non-segmented type", info.name);
            return;
        }
    };
    let config = &registry.config;
    let pattern = info.path.replacen("%u", &segment_id.to_string(), 1);
    let primary = config.resolve(&PathBuf::from(pattern));
    let backup_dir = config.last_good_dir.clone();

    let me = manager.current().expect("sub-job running without a clone in progress");

    if try_load_segment(registry, info, ops.as_ref(), me.as_ref(), segment_id, &primary, backup_dir.as_deref(), &manager) {
        return;
    }

    if registry.is_initial_startup() {
        if let Some(dir) = &backup_dir {
            let mut last_good_name = std::ffi::OsString::from(primary.file_name().unwrap_or_default());
            last_good_name.push(config.backup_suffix.clone());
            let last_good_path = dir.join(last_good_name);
            if try_load_segment(registry, info, ops.as_ref(), me.as_ref(), segment_id, &last_good_path, None, &manager) {
                log::warn!("segment {} of {}: primary load failed, recovered from last-good", segment_id, info.name);
                return;
            }
        }
    }

    if let Ok(slot) = ops.id2slot(me.as_ref(), segment_id) {
        if let Some(seg) = ops.slot2segment(me.as_ref(), slot) {
            seg.set_failed_load(true);
        }
    }
    manager.sub_job_done(0, true);
}

/// Opens, parses, and installs one segment file from `path`. Returns
/// whether it succeeded; on a parse failure it rejects the bad copy under
/// `config.reject_dir`, mirroring `try_load`'s parse-failure branch, so the
/// caller can decide whether to retry from last-good.
fn try_load_segment(
    registry: &Arc<Registry>,
    info: &Arc<ConfInfo>,
    ops: &dyn crate::segment_manager::SegmentOps,
    me: &dyn crate::ConfObject,
    segment_id: u32,
    path: &std::path::Path,
    backup_dir: Option<&std::path::Path>,
    manager: &crate::segment_manager::SegmentManager,
) -> bool {
    let loaded = confcache::ConfLoader::open(path, backup_dir, None, DEFAULT_LINE_FLAGS);
    match loaded {
        Ok(Some(mut loader)) => match ops.newsegment(segment_id, &mut loader, info) {
            Ok(seg_obj) => {
                let slot = ops.id2slot(me, segment_id).unwrap_or_else(|ins| ins);
                let alloc = ops.usesegment(me, seg_obj, slot);
                let _ = loader.done(alloc);
                manager.sub_job_done(alloc, false);
                true
            }
            Err(e) => {
                log::warn!("segment {} of {}: parse failed: {}", segment_id, info.name, e);
                let reject_dir = registry.config.reject_dir.clone();
                if let Some(dir) = reject_dir {
                    let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
                    let _ = loader.reject(&name, &dir);
                }
                false
            }
        },
        Ok(None) => {
            log::warn!("segment {} of {}: file missing at {}", segment_id, info.name, path.display());
            false
        }
        Err(e) => {
            log::warn!("segment {} of {}: open {} failed: {}", segment_id, info.name, path.display(), e);
            false
        }
    }
}
