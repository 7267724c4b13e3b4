//! The configuration substrate's engine: registration, dispatch, the worker
//! pool, the segment manager, and the concrete conf kinds built on top of
//! `confcache`'s primitives — the same layering the teacher uses for
//! `sled` on top of `pagecache`.

extern crate confcache;
#[macro_use]
extern crate log;

mod ccb;
mod cidrprefs;
mod conf_info;
mod conf_kind;
mod conf_object;
mod conf_segment;
mod conf_set;
mod dispatch;
mod domain_tagging;
mod error;
mod pref_builder;
mod report_sink;
mod segment_manager;
pub mod uint32list;
mod worker;

pub use ccb::{Ccb, CcbEntry, CcbKind, Handling};
pub use cidrprefs::{CidrBundle, CidrPrefsConf, CidrPrefsKind, CidrPrefsOps, CidrSegment};
pub use conf_info::ConfInfo;
pub use conf_kind::ConfKind;
pub use conf_object::ConfObject;
pub use conf_segment::ConfSegment;
pub use conf_set::{ConfSet, Registry};
pub use dispatch::{Dispatch, Job, JobKind};
pub use domain_tagging::{reverse_labels, DomainTagging, StoredCategories};
pub use error::{Error, Result};
pub use pref_builder::{
    Bundle, Cidr, ElementType, Identity, Org, PrefBlock, PrefBuilder, PrefList, SettingGroup, PREF_NOLIST,
};
pub use report_sink::{NullReportSink, ReportSink, UdpReportSink};
pub use segment_manager::{CannedSegments, ManagerState, PrefSegments, SegmentChange, SegmentManager, SegmentOps, TickOutcome};
pub use uint32list::Uint32List;
pub use worker::{Worker, DEFAULT_LINE_FLAGS};

#[cfg(test)]
mod tests {
    use super::*;
    use confcache::ConfigBuilder;
    use std::fs;
    use std::io::Write;
    use std::sync::Arc;

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        dir.push(format!("confcore-lib-test-{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Scenario A end to end: registering a CCB type with a baseline-missing
    /// file rejects the load and leaves the registered module unreadable
    /// rather than publishing a half-valid set.
    #[test]
    fn scenario_a_ccb_registration_rejects_bad_baseline() {
        let dir = tempdir();
        let path = dir.join("ccb.conf");
        fs::File::create(&path).unwrap().write_all(b"ccb 2\ncount 1\nAlcohol:1:domaintagging:0\n").unwrap();

        let config = ConfigBuilder::new().root_dir(&dir).worker_target(0).build().unwrap();
        let registry = Registry::new(config);
        let module_id = registry.register("ccb", "ccb.conf", "ccb", Arc::new(CcbKind), true, 0, Vec::new()).unwrap();
        let worker = Worker::new(registry.clone());

        registry.confset_load(&worker);
        let mut gen = 0u64;
        let set = registry.confset_acquire(&mut gen).unwrap();
        assert!(set.get(module_id).is_none(), "a baseline-missing CCB must never be published");
    }

    /// Scenario D: two registrations that parse to the same uint32list
    /// fingerprint share one body via the object-hash cache.
    #[test]
    fn scenario_d_object_hash_dedups_identical_lists() {
        let cache: confcache::ObjectHash<Uint32List> = confcache::ObjectHash::new(16, 4, 4);
        let fp = [1u8, 2, 3, 4];
        let a = uint32list::intern(&cache, &fp, vec![10, 20, 30]).unwrap();
        let b = uint32list::intern(&cache, &fp, vec![10, 20, 30]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
