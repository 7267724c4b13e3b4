use std::net::IpAddr;

use confcache::CategoryBitset;

use crate::error::{Error, Result};

pub const PREF_NOLIST: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementType {
    Domain,
    Cidr,
    Url,
    Application,
}

impl ElementType {
    /// Alphabetical order, as §6 requires when multiple elementtypes share
    /// an `(ltype, listid)`.
    fn rank(self) -> u8 {
        match self {
            ElementType::Application => 0,
            ElementType::Cidr => 1,
            ElementType::Domain => 2,
            ElementType::Url => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrefList {
    pub ltype: u32,
    pub listid: u32,
    pub elementtype: ElementType,
    pub bit: u32,
    pub fingerprint: Vec<u8>,
    /// The refcounted body, e.g. the uint32list exemplar's object-hash
    /// result. Kept type-erased since list bodies vary by element type.
    pub body: std::sync::Arc<dyn std::any::Any + Send + Sync>,
}

fn list_key(ltype: u32, listid: u32, et: ElementType) -> (u32, u32, u8) {
    (ltype, listid, et.rank())
}

#[derive(Debug, Clone)]
pub struct SettingGroup {
    pub sg_id: u32,
    pub flags: u32,
}

/// A resolved reference to one or more lists sharing `(ltype, listid)`,
/// terminated conceptually by `PREF_NOLIST` in the original's flat array;
/// represented here as a plain (non-terminated) `Vec` of list indices.
pub type ListRef = Vec<usize>;

#[derive(Debug, Clone)]
pub struct Bundle {
    pub actype: u32,
    pub bundleid: u32,
    pub priority: u32,
    pub flags: u32,
    pub categories: CategoryBitset,
    pub sg_ids: Vec<u32>,
    pub dest_block: ListRef,
    pub exceptions: ListRef,
    pub dest_allow: ListRef,
    pub url_proxy_https: ListRef,
    pub dest_nodecrypt: ListRef,
    pub app_block: ListRef,
    pub app_allow: ListRef,
    pub app_nodecrypt: ListRef,
    pub dest_warn: ListRef,
    pub app_warn: ListRef,
}

#[derive(Debug, Clone)]
pub struct Org {
    pub orgid: u32,
    pub orgflags: u32,
    pub unmasked_categories: CategoryBitset,
    pub retention: u32,
    pub warnperiod: u32,
    pub originid: u32,
    pub parentid: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    /// v6 precedes v4 in identity ordering (§6).
    fn family_rank(self) -> u8 {
        match self.addr {
            IpAddr::V6(_) => 0,
            IpAddr::V4(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Identity {
    /// `1:assetid::cidr:originid:origintypeid:orgid:0:bundleid`
    Asset { assetid: u32, cidr: Cidr, originid: u32, origintypeid: u32, orgid: u32, bundleid: u32 },
    /// `2:orgid:assettype:cidr:originid:origintypeid:orgid:0:bundleid`
    Org { orgid: u32, assettype: u32, cidr: Cidr, originid: u32, origintypeid: u32, bundleid: u32 },
}

impl Identity {
    fn sort_key(&self) -> (u8, u32, u8, IpAddr, u8) {
        match self {
            Identity::Asset { cidr, .. } => (1, 0, cidr.family_rank(), cidr.addr, cidr.prefix_len),
            Identity::Org { orgid, cidr, .. } => (2, *orgid, cidr.family_rank(), cidr.addr, cidr.prefix_len),
        }
    }
}

/// The frozen output of [`PrefBuilder::consume`] (§3 "PrefBlock").
pub struct PrefBlock {
    pub lists: Vec<PrefList>,
    pub settinggroups: Vec<SettingGroup>,
    pub bundles: Vec<Bundle>,
    pub orgs: Vec<Org>,
    pub identities: Vec<Identity>,
    /// `(ltype, listid)` pairs that `attach` could not resolve within this
    /// block and that arrived with external references allowed.
    pub ext_refs: Vec<(u32, u32)>,
}

/// Incremental, sorted-array constructor (§4.8). Each `addX` inserts in
/// sorted position and rejects duplicates; `attach` resolves a bundle's
/// list references against the lists added so far or records an external
/// reference.
#[derive(Default)]
pub struct PrefBuilder {
    lists: Vec<PrefList>,
    settinggroups: Vec<SettingGroup>,
    bundles: Vec<Bundle>,
    orgs: Vec<Org>,
    identities: Vec<Identity>,
    ext_refs: Vec<(u32, u32)>,
    external_allowed: bool,
}

impl PrefBuilder {
    pub fn new(external_allowed: bool) -> PrefBuilder {
        PrefBuilder { external_allowed, ..Default::default() }
    }

    pub fn add_list(&mut self, list: PrefList) -> Result<()> {
        let key = list_key(list.ltype, list.listid, list.elementtype);
        let pos = self.lists.binary_search_by_key(&key, |l| list_key(l.ltype, l.listid, l.elementtype));
        match pos {
            Ok(_) => Err(Error::Cache(confcache::Error::Corruption {
                at: format!("duplicate list ltype={} listid={} elementtype={:?}", list.ltype, list.listid, list.elementtype),
            })),
            Err(idx) => {
                self.lists.insert(idx, list);
                Ok(())
            }
        }
    }

    pub fn add_settinggroup(&mut self, sg: SettingGroup) -> Result<()> {
        let pos = self.settinggroups.binary_search_by_key(&sg.sg_id, |s| s.sg_id);
        match pos {
            Ok(_) => Err(Error::Cache(confcache::Error::Corruption { at: format!("duplicate settinggroup {}", sg.sg_id) })),
            Err(idx) => {
                self.settinggroups.insert(idx, sg);
                Ok(())
            }
        }
    }

    pub fn add_bundle(&mut self, bundle: Bundle) -> Result<usize> {
        let pos = self.bundles.binary_search_by_key(&bundle.bundleid, |b| b.bundleid);
        match pos {
            Ok(_) => Err(Error::Cache(confcache::Error::Corruption { at: format!("duplicate bundle {}", bundle.bundleid) })),
            Err(idx) => {
                self.bundles.insert(idx, bundle);
                Ok(idx)
            }
        }
    }

    pub fn add_org(&mut self, org: Org) -> Result<()> {
        let pos = self.orgs.binary_search_by_key(&org.orgid, |o| o.orgid);
        match pos {
            Ok(_) => Err(Error::Cache(confcache::Error::Corruption { at: format!("duplicate org {}", org.orgid) })),
            Err(idx) => {
                self.orgs.insert(idx, org);
                Ok(())
            }
        }
    }

    pub fn add_identity(&mut self, identity: Identity) {
        let key = identity.sort_key();
        let pos = self.identities.partition_point(|i| i.sort_key() < key);
        self.identities.insert(pos, identity);
    }

    /// Resolves `(ltype, listid)` against `accepted_elementtypes`, appending
    /// matches into a single sublist in alphabetical elementtype order
    /// (§4.8). On miss: records an external reference if allowed, unless
    /// `except_slot` forbids it (an `EXCEPT` field may never point off-box).
    pub fn attach(&mut self, ltype: u32, listid: u32, accepted_elementtypes: &[ElementType], except_slot: bool) -> Result<ListRef> {
        let mut matches: Vec<(ElementType, usize)> = self
            .lists
            .iter()
            .enumerate()
            .filter(|(_, l)| l.ltype == ltype && l.listid == listid && accepted_elementtypes.contains(&l.elementtype))
            .map(|(idx, l)| (l.elementtype, idx))
            .collect();
        matches.sort_by_key(|(et, _)| et.rank());

        if !matches.is_empty() {
            return Ok(matches.into_iter().map(|(_, idx)| idx).collect());
        }

        if except_slot || !self.external_allowed {
            return Err(Error::Cache(confcache::Error::Corruption {
                at: format!("unresolved list reference ltype={} listid={}", ltype, listid),
            }));
        }
        self.ext_refs.push((ltype, listid));
        Ok(Vec::new())
    }

    pub fn ext_refs(&self) -> &[(u32, u32)] {
        &self.ext_refs
    }

    /// Extracts the finished block, leaving the builder empty and safe to
    /// drop.
    pub fn consume(self) -> PrefBlock {
        PrefBlock {
            lists: self.lists,
            settinggroups: self.settinggroups,
            bundles: self.bundles,
            orgs: self.orgs,
            identities: self.identities,
            ext_refs: self.ext_refs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn list(ltype: u32, listid: u32, et: ElementType) -> PrefList {
        PrefList { ltype, listid, elementtype: et, bit: 0, fingerprint: vec![0; 4], body: Arc::new(42u32) }
    }

    #[test]
    fn add_list_rejects_duplicates() {
        let mut b = PrefBuilder::new(true);
        b.add_list(list(1, 1, ElementType::Domain)).unwrap();
        assert!(b.add_list(list(1, 1, ElementType::Domain)).is_err());
    }

    #[test]
    fn attach_finds_internal_list_and_sorts_by_elementtype() {
        let mut b = PrefBuilder::new(true);
        b.add_list(list(1, 1, ElementType::Domain)).unwrap();
        b.add_list(list(1, 1, ElementType::Application)).unwrap();
        let refs = b.attach(1, 1, &[ElementType::Domain, ElementType::Application], false).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(b.lists[refs[0]].elementtype, ElementType::Application);
        assert_eq!(b.lists[refs[1]].elementtype, ElementType::Domain);
    }

    #[test]
    fn attach_records_external_ref_on_miss() {
        let mut b = PrefBuilder::new(true);
        let refs = b.attach(9, 9, &[ElementType::Domain], false).unwrap();
        assert!(refs.is_empty());
        assert_eq!(b.ext_refs(), &[(9, 9)]);
    }

    #[test]
    fn attach_in_except_slot_fails_on_miss() {
        let mut b = PrefBuilder::new(true);
        assert!(b.attach(9, 9, &[ElementType::Domain], true).is_err());
    }

    #[test]
    fn identities_sorted_by_type_then_orgid_then_cidr() {
        let mut b = PrefBuilder::new(true);
        let cidr_v4 = Cidr { addr: "10.0.0.0".parse().unwrap(), prefix_len: 8 };
        let cidr_v6 = Cidr { addr: "::".parse().unwrap(), prefix_len: 0 };
        b.add_identity(Identity::Org { orgid: 5, assettype: 0, cidr: cidr_v4, originid: 0, origintypeid: 0, bundleid: 1 });
        b.add_identity(Identity::Asset { assetid: 1, cidr: cidr_v6, originid: 0, origintypeid: 0, orgid: 1, bundleid: 1 });
        assert!(matches!(b.identities[0], Identity::Asset { .. }));
        assert!(matches!(b.identities[1], Identity::Org { .. }));
    }
}
