use std::sync::{Arc, Mutex};

use confcache::ConfLoader;

use crate::conf_info::ConfInfo;
use crate::conf_kind::ConfKind;
use crate::conf_object::ConfObject;
use crate::conf_segment::ConfSegment;
use crate::error::{Error, Result};
use crate::segment_manager::SegmentOps;

/// One org's bundle: just enough of `cidrprefs.c`'s shape to exercise
/// inheritance (§4.7, Scenario B) — a bundle id plus the destination-block
/// list it carries. Real per-field bundle semantics live in
/// [`crate::pref_builder`]; this exemplar keeps its own minimal copy so it
/// stays a self-contained, readable segment-manager demonstration.
#[derive(Debug, Clone)]
pub struct CidrBundle {
    pub bundleid: u32,
    pub dest_block: Vec<String>,
}

#[derive(Debug)]
pub struct CidrSegment {
    /// `Arc`-shared so `slot2segment` can hand out the same header this
    /// segment carries, rather than a disconnected copy — a failed reload
    /// marks failure on the segment actually stored in the slot.
    pub header: Arc<ConfSegment>,
    pub orgid: u32,
    pub parentid: u32,
    pub bundles: Vec<CidrBundle>,
}

/// Wraps a freshly parsed segment so it can travel through the dispatch
/// system as `Arc<dyn ConfObject>` before `usesegment` installs it.
pub struct SegmentPayload(pub Arc<CidrSegment>);

impl ConfObject for SegmentPayload {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_name(&self) -> &'static str {
        "cidrprefs-segment"
    }
}

/// The per-type conf object: org segments sorted by `orgid` (§3 "ConfSet"
/// invariant applied at segment granularity).
pub struct CidrPrefsConf {
    slots: Mutex<Vec<Arc<CidrSegment>>>,
}

impl ConfObject for CidrPrefsConf {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_name(&self) -> &'static str {
        "cidrprefs"
    }
}

impl CidrPrefsConf {
    pub fn empty() -> Arc<CidrPrefsConf> {
        Arc::new(CidrPrefsConf { slots: Mutex::new(Vec::new()) })
    }

    pub fn count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn segment(&self, orgid: u32) -> Option<Arc<CidrSegment>> {
        let slots = self.slots.lock().unwrap();
        slots.binary_search_by_key(&orgid, |s| s.orgid).ok().map(|i| slots[i].clone())
    }

    /// Looks up `bundleid` under `orgid`, climbing the `parentid` chain
    /// when the org itself doesn't define that bundle (Scenario B: org 5's
    /// bundle 321 inherits from org 3's).
    pub fn lookup_bundle(&self, orgid: u32, bundleid: u32) -> Option<CidrBundle> {
        let mut current = orgid;
        let mut seen = std::collections::HashSet::new();
        loop {
            if !seen.insert(current) {
                return None; // cyclic parentid chain, refuse to loop forever
            }
            let seg = self.segment(current)?;
            if let Some(b) = seg.bundles.iter().find(|b| b.bundleid == bundleid) {
                return Some(b.clone());
            }
            if seg.parentid == 0 || seg.parentid == current {
                return None;
            }
            current = seg.parentid;
        }
    }
}

fn downcast_conf(obj: &dyn ConfObject) -> &CidrPrefsConf {
    obj.as_any().downcast_ref::<CidrPrefsConf>().expect("cidrprefs SegmentOps called with a foreign conf object")
}

pub struct CidrPrefsOps;

impl SegmentOps for CidrPrefsOps {
    fn clone_current(&self, obase: Option<&Arc<dyn ConfObject>>) -> Arc<dyn ConfObject> {
        match obase {
            Some(obj) => {
                let base = downcast_conf(obj);
                let cloned: Vec<Arc<CidrSegment>> = base.slots.lock().unwrap().iter().map(|s| {
                    s.header.acquire();
                    s.clone()
                }).collect();
                Arc::new(CidrPrefsConf { slots: Mutex::new(cloned) })
            }
            None => CidrPrefsConf::empty(),
        }
    }

    fn settimeatleast(&self, me: &dyn ConfObject, t: u32) {
        let conf = downcast_conf(me);
        for seg in conf.slots.lock().unwrap().iter() {
            seg.header.settimeatleast(t);
        }
    }

    fn id2slot(&self, me: &dyn ConfObject, id: u32) -> std::result::Result<usize, usize> {
        let conf = downcast_conf(me);
        conf.slots.lock().unwrap().binary_search_by_key(&id, |s| s.orgid)
    }

    fn slot2segment(&self, me: &dyn ConfObject, slot: usize) -> Option<Arc<ConfSegment>> {
        let conf = downcast_conf(me);
        let slots = conf.slots.lock().unwrap();
        slots.get(slot).map(|s| s.header.clone())
    }

    fn remove_slot(&self, me: &dyn ConfObject, slot: usize) -> usize {
        let conf = downcast_conf(me);
        let mut slots = conf.slots.lock().unwrap();
        if slot < slots.len() {
            let removed = slots.remove(slot);
            removed.header.alloc()
        } else {
            0
        }
    }

    fn newsegment(&self, id: u32, loader: &mut ConfLoader, _info: &ConfInfo) -> Result<Arc<dyn ConfObject>> {
        let seg = parse_cidr_segment(id, loader)?;
        Ok(Arc::new(SegmentPayload(Arc::new(seg))))
    }

    fn usesegment(&self, me: &dyn ConfObject, new_seg: Arc<dyn ConfObject>, slot: usize) -> usize {
        let conf = downcast_conf(me);
        let payload = new_seg
            .as_any()
            .downcast_ref::<SegmentPayload>()
            .expect("cidrprefs usesegment given a non-cidrprefs segment")
            .0
            .clone();
        let alloc = payload.header.alloc();
        let mut slots = conf.slots.lock().unwrap();
        match slots.iter().position(|s| s.orgid == payload.orgid) {
            Some(existing) => slots[existing] = payload,
            None => slots.insert(slot.min(slots.len()), payload),
        }
        slots.sort_by_key(|s| s.orgid);
        alloc
    }

    fn loaded(&self, me: &dyn ConfObject) {
        let conf = downcast_conf(me);
        log::debug!("cidrprefs: batch finished with {} segments live", conf.count());
    }
}

/// The registration kind for the `cidrprefs` type: purely segmented, so
/// `parse` (whole-file load) is never exercised in practice — registration
/// only needs `segment_ops` to get a `SegmentManager`.
pub struct CidrPrefsKind;

impl ConfKind for CidrPrefsKind {
    fn parse(&self, _loader: &mut ConfLoader) -> Result<Arc<dyn ConfObject>> {
        Ok(CidrPrefsConf::empty())
    }

    fn segment_ops(&self) -> Option<Arc<dyn SegmentOps>> {
        Some(Arc::new(CidrPrefsOps))
    }
}

fn corrupt(loader: &ConfLoader, msg: impl Into<String>) -> Error {
    Error::Cache(confcache::Error::Corruption { at: format!("{}:{}: {}", loader.path().display(), loader.line(), msg.into()) })
}

/// Parses one org's file:
/// ```text
/// cidrprefs 2
/// orgid:<id>
/// parentid:<id-or-0>
/// count N
/// <bundleid>:<comma-separated dest_block listids>
/// ```
fn parse_cidr_segment(id: u32, loader: &mut ConfLoader) -> Result<CidrSegment> {
    let header = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "empty segment file"))?;
    if header != "cidrprefs 2" {
        return Err(corrupt(loader, format!("bad header {:?}", header)));
    }
    let orgid_line = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "missing orgid line"))?;
    let orgid: u32 = orgid_line
        .strip_prefix("orgid:")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| corrupt(loader, format!("bad orgid line {:?}", orgid_line)))?;
    let parentid_line = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "missing parentid line"))?;
    let parentid: u32 = parentid_line
        .strip_prefix("parentid:")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| corrupt(loader, format!("bad parentid line {:?}", parentid_line)))?;

    if orgid != id {
        return Err(corrupt(loader, format!("file claims orgid {} but segment id is {}", orgid, id)));
    }

    let count_line = loader.readline(confcache::CHOMP)?.ok_or_else(|| corrupt(loader, "missing count line"))?;
    let count: usize = count_line
        .strip_prefix("count ")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| corrupt(loader, format!("bad count line {:?}", count_line)))?;

    let flags = confcache::CHOMP | confcache::SKIP_EMPTY | confcache::SKIP_COMMENTS;
    let mut bundles = Vec::with_capacity(count);
    while let Some(line) = loader.readline(flags)? {
        let (bundleid_str, rest) = line.split_once(':').ok_or_else(|| corrupt(loader, format!("bad bundle line {:?}", line)))?;
        let bundleid: u32 = bundleid_str.parse().map_err(|_| corrupt(loader, format!("bad bundleid {:?}", bundleid_str)))?;
        let dest_block = if rest.is_empty() { Vec::new() } else { rest.split(',').map(str::to_owned).collect() };
        bundles.push(CidrBundle { bundleid, dest_block });
    }

    if bundles.len() != count {
        return Err(corrupt(loader, format!("header declared count {} but found {} bundles", count, bundles.len())));
    }

    Ok(CidrSegment { header: Arc::new(ConfSegment::new(orgid, 1, 0, 0, [0; 16])), orgid, parentid, bundles })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        dir.push(format!("confcore-cidrprefs-test-{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn segment_for(orgid: u32, parentid: u32, bundles: &[(u32, &[&str])]) -> CidrSegment {
        let dir = tempdir();
        let path = dir.join(format!("seg-{}", orgid));
        let mut body = format!("cidrprefs 2\norgid:{}\nparentid:{}\ncount {}\n", orgid, parentid, bundles.len());
        for (bid, dests) in bundles {
            body.push_str(&format!("{}:{}\n", bid, dests.join(",")));
        }
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        let mut loader = ConfLoader::open(&path, None, None, 0).unwrap().unwrap();
        parse_cidr_segment(orgid, &mut loader).unwrap()
    }

    #[test]
    fn scenario_b_org_inherits_parents_bundle() {
        let conf = CidrPrefsConf::empty();
        {
            let mut slots = conf.slots.lock().unwrap();
            slots.push(Arc::new(segment_for(1, 0, &[(100, &["listA"])])));
            slots.push(Arc::new(segment_for(3, 0, &[(321, &["listB", "listC"])])));
            slots.push(Arc::new(segment_for(5, 3, &[])));
        }
        assert_eq!(conf.count(), 3);
        let bundle = conf.lookup_bundle(5, 321).expect("should inherit from org 3");
        assert_eq!(bundle.dest_block, vec!["listB".to_owned(), "listC".to_owned()]);
    }

    #[test]
    fn usesegment_keeps_slots_sorted_by_orgid() {
        let conf = CidrPrefsConf::empty();
        let ops = CidrPrefsOps;
        let obj: Arc<dyn ConfObject> = conf.clone();
        for orgid in [5u32, 1, 3] {
            let seg = segment_for(orgid, 0, &[]);
            ops.usesegment(obj.as_ref(), Arc::new(SegmentPayload(Arc::new(seg))), 0);
        }
        let slots = conf.slots.lock().unwrap();
        let ids: Vec<u32> = slots.iter().map(|s| s.orgid).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn bad_header_rejected() {
        let dir = tempdir();
        let path = dir.join("bad");
        fs::write(&path, "nope\n").unwrap();
        let mut loader = ConfLoader::open(&path, None, None, 0).unwrap().unwrap();
        assert!(parse_cidr_segment(1, &mut loader).is_err());
    }
}
