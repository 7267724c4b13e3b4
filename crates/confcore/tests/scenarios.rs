//! Crate-level behavioral scenarios, exercised through `Registry`/`Worker`
//! rather than any single module's unit tests.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use confcache::ConfigBuilder;
use confcore::{CannedSegments, CcbKind, CidrPrefsKind, Registry, SegmentChange, SegmentManager, SegmentOps, Worker};

fn tempdir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    dir.push(format!("confcore-scenario-{}-{}", tag, nanos));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(dir: &PathBuf, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::File::create(path).unwrap().write_all(contents.as_bytes()).unwrap();
}

/// Drives `confset_load` until it reports a change or the retry budget is
/// exhausted, to ride out the segment manager's multi-tick batching.
fn drive_until_changed(registry: &Arc<Registry>, worker: &Worker, max_cycles: usize) -> bool {
    for _ in 0..max_cycles {
        if registry.confset_load(worker) {
            return true;
        }
    }
    false
}

fn complete_ccb_body(ok_handling: &str) -> String {
    let bits: &[u32] = &[64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 85, 108, 110, 148, 151, 152];
    let mut body = String::from("ccb 2\n");
    body.push_str(&format!("count {}\n", bits.len()));
    for &bit in bits {
        body.push_str(&format!("kw{}:{}:{}:0\n", bit, bit, ok_handling));
    }
    body
}

/// Scenario A: a CCB file missing a required baseline bit is rejected, and
/// the registered module is never published.
#[test]
fn scenario_a_bad_baseline_never_publishes() {
    let dir = tempdir("ccb-bad");
    write(&dir, "ccb.conf", "ccb 2\ncount 1\nAlcohol:1:domaintagging:0\n");

    let config = ConfigBuilder::new().root_dir(&dir).worker_target(0).build().unwrap();
    let registry = Registry::new(config);
    let module_id = registry.register("ccb", "ccb.conf", "ccb", Arc::new(CcbKind), true, 0, Vec::new()).unwrap();
    let worker = Worker::new(registry.clone());

    drive_until_changed(&registry, &worker, 3);
    let mut gen = 0u64;
    let set = registry.confset_acquire(&mut gen).unwrap();
    assert!(set.get(module_id).is_none());
}

/// Scenario A (success path) and E (generation monotonicity): a complete
/// CCB file publishes once, bumping the generation by exactly one, and a
/// second immediate tick (before the reload interval elapses) is a no-op.
#[test]
fn scenario_a_and_e_complete_baseline_publishes_once() {
    let dir = tempdir("ccb-good");
    write(&dir, "ccb.conf", &complete_ccb_body("block"));

    let config = ConfigBuilder::new().root_dir(&dir).worker_target(0).build().unwrap();
    let registry = Registry::new(config);
    let module_id = registry.register("ccb", "ccb.conf", "ccb", Arc::new(CcbKind), true, 0, Vec::new()).unwrap();
    let worker = Worker::new(registry.clone());

    assert_eq!(registry.generation(), 1);
    assert!(registry.confset_load(&worker));
    assert_eq!(registry.generation(), 2);

    let mut gen = 0u64;
    let set = registry.confset_acquire(&mut gen).unwrap();
    assert!(set.get(module_id).is_some());

    // Reload interval hasn't elapsed, so the retry isn't due yet: no churn.
    assert!(!registry.confset_load(&worker));
    assert_eq!(registry.generation(), 2);
}

/// Scenario B: three org segments reload as a batch, and org 5 (which
/// defines no bundles of its own) inherits bundle 321 from its parent, org 3.
#[test]
fn scenario_b_segmented_reload_with_inheritance() {
    let dir = tempdir("cidrprefs-b");
    write(&dir, "cidrprefs/org-1.conf", "cidrprefs 2\norgid:1\nparentid:0\ncount 1\n100:listA\n");
    write(&dir, "cidrprefs/org-3.conf", "cidrprefs 2\norgid:3\nparentid:0\ncount 1\n321:listB,listC\n");
    write(&dir, "cidrprefs/org-5.conf", "cidrprefs 2\norgid:5\nparentid:3\ncount 0\n");

    let config = ConfigBuilder::new().root_dir(&dir).worker_target(0).build().unwrap();
    let registry = Registry::new(config);
    registry.register("cidrprefs", "cidrprefs/org-%u.conf", "cidrprefs", Arc::new(CidrPrefsKind), false, 0, Vec::new()).unwrap();
    registry.attach_segments(
        "cidrprefs",
        CannedSegments::new(vec![
            SegmentChange::Added(1, PathBuf::new()),
            SegmentChange::Added(3, PathBuf::new()),
            SegmentChange::Added(5, PathBuf::new()),
        ]),
    );
    let worker = Worker::new(registry.clone());

    assert!(drive_until_changed(&registry, &worker, 10));

    let manager = registry.segment_manager("cidrprefs").unwrap();
    let current = manager.current().unwrap();
    let conf = current.as_any().downcast_ref::<confcore::CidrPrefsConf>().unwrap();
    assert_eq!(conf.count(), 3);
    let bundle = conf.lookup_bundle(5, 321).expect("org 5 should inherit org 3's bundle 321");
    assert_eq!(bundle.dest_block, vec!["listB".to_owned(), "listC".to_owned()]);
}

/// Scenario C: once org 7 has a valid published segment, a later reload
/// attempt that fails to parse leaves the previous valid segment intact
/// (the segment manager's clone-forward-then-patch design is itself the
/// last-good fallback, with no separate recovery path required).
#[test]
fn scenario_c_failed_segment_reload_keeps_last_good() {
    let dir = tempdir("cidrprefs-c");
    write(&dir, "cidrprefs/org-7.conf", "cidrprefs 2\norgid:7\nparentid:0\ncount 1\n500:listX\n");

    let config = ConfigBuilder::new().root_dir(&dir).worker_target(0).build().unwrap();
    let registry = Registry::new(config);
    registry.register("cidrprefs", "cidrprefs/org-%u.conf", "cidrprefs", Arc::new(CidrPrefsKind), false, 0, Vec::new()).unwrap();
    let segments = CannedSegments::new(vec![SegmentChange::Added(7, PathBuf::new())]);
    registry.attach_segments("cidrprefs", segments.clone());
    let worker = Worker::new(registry.clone());

    assert!(drive_until_changed(&registry, &worker, 10));
    let manager = registry.segment_manager("cidrprefs").unwrap();
    let conf = manager.current().unwrap();
    let conf = conf.as_any().downcast_ref::<confcore::CidrPrefsConf>().unwrap();
    assert!(conf.lookup_bundle(7, 500).is_some());

    // Corrupt the file, then simulate a rescan discovering org 7 changed.
    write(&dir, "cidrprefs/org-7.conf", "not a cidrprefs file\n");
    segments.push(SegmentChange::Modified(7, PathBuf::new()));

    for _ in 0..10 {
        registry.confset_load(&worker);
        if manager.failed() > 0 {
            break;
        }
    }
    assert!(manager.failed() > 0, "the corrupt reload should have been counted as failed");

    let conf = manager.current().unwrap();
    let conf = conf.as_any().downcast_ref::<confcore::CidrPrefsConf>().unwrap();
    let bundle = conf.lookup_bundle(7, 500).expect("failed reload must not drop the last-good segment");
    assert_eq!(bundle.dest_block, vec!["listX".to_owned()]);
}

/// Scenario C (literal): a segment that has never loaded successfully, with
/// a corrupt primary file and a valid `.last-good` copy present, recovers
/// through the same initial-startup fallback `reload` uses for whole files.
#[test]
fn scenario_c_never_loaded_segment_recovers_from_last_good() {
    let dir = tempdir("cidrprefs-c2");
    let last_good_dir = dir.join("last-good");
    fs::create_dir_all(&last_good_dir).unwrap();
    write(&dir, "cidrprefs/org-9.conf", "not a cidrprefs file\n");
    write(&last_good_dir, "org-9.conf.last-good", "cidrprefs 2\norgid:9\nparentid:0\ncount 1\n700:listZ\n");

    let config = ConfigBuilder::new()
        .root_dir(&dir)
        .last_good_dir(Some(last_good_dir))
        .worker_target(0)
        .build()
        .unwrap();
    let registry = Registry::new(config);
    registry.register("cidrprefs", "cidrprefs/org-%u.conf", "cidrprefs", Arc::new(CidrPrefsKind), false, 0, Vec::new()).unwrap();
    registry.attach_segments("cidrprefs", CannedSegments::new(vec![SegmentChange::Added(9, PathBuf::new())]));
    let worker = Worker::new(registry.clone());

    assert!(drive_until_changed(&registry, &worker, 10));

    let manager = registry.segment_manager("cidrprefs").unwrap();
    assert_eq!(manager.failed(), 0, "the last-good copy should have recovered the load");
    let conf = manager.current().unwrap();
    let conf = conf.as_any().downcast_ref::<confcore::CidrPrefsConf>().unwrap();
    let bundle = conf.lookup_bundle(9, 700).expect("segment should have loaded via last-good fallback");
    assert_eq!(bundle.dest_block, vec!["listZ".to_owned()]);
}

/// Scenario D: two registrations whose parsed values hash to the same
/// fingerprint share one body through the object-hash cache.
#[test]
fn scenario_d_object_hash_dedups_identical_bodies() {
    let cache: confcache::ObjectHash<confcore::Uint32List> = confcache::ObjectHash::new(16, 4, 4);
    let fp = [7u8, 7, 7, 7];
    let a = confcore::uint32list::intern(&cache, &fp, vec![1, 2, 3]).unwrap();
    let b = confcore::uint32list::intern(&cache, &fp, vec![1, 2, 3]).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

/// Scenario F: 30 changed segments against a parallel cap of 10 converge in
/// capped batches with no segment lost, and the manager finalizes (and
/// publishes) exactly once.
#[test]
fn scenario_f_segment_manager_batches_under_parallel_cap() {
    let ops: Arc<dyn SegmentOps> = Arc::new(confcore::CidrPrefsOps);
    let changes: Vec<SegmentChange> = (1..=30u32).map(|id| SegmentChange::Added(id, PathBuf::new())).collect();
    let segments = CannedSegments::new(changes);
    let manager = SegmentManager::new(ops, segments, 10);

    let mut total_subjobs = 0usize;
    let mut published = false;
    let mut ticks = 0;
    while !published {
        ticks += 1;
        assert!(ticks <= 20, "should converge well within 20 ticks");
        let outcome = manager.tick();
        for _ in &outcome.enqueued {
            manager.sub_job_done(1, false);
        }
        total_subjobs += outcome.enqueued.len();
        published = outcome.published;
    }
    assert_eq!(total_subjobs, 30);
}
