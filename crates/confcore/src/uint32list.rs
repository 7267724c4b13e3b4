use std::sync::Arc;

use confcache::ObjectHash;

use crate::conf_object::ConfObject;
use crate::error::{Error, Result};

/// Minimal, direct port of `uint32list.c`'s refcounted-list-body pattern
/// over [`ObjectHash`]: a sorted, deduplicated `Vec<u32>` shared by every
/// list that happens to parse to the same fingerprint (§4.2, Scenario D).
#[derive(Debug)]
pub struct Uint32List {
    pub values: Vec<u32>,
}

impl ConfObject for Uint32List {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_name(&self) -> &'static str {
        "uint32list"
    }
}

/// Parses `values` (already sorted-and-deduplicated by the caller — the
/// canonical form required for the fingerprint to be meaningful), probes
/// `cache` by `fingerprint`, and returns either the existing shared body or
/// a freshly inserted one (§4.2).
pub fn intern(cache: &ObjectHash<Uint32List>, fingerprint: &[u8], values: Vec<u32>) -> Result<Arc<Uint32List>> {
    if fingerprint.len() != cache.magic() {
        return Err(Error::Cache(confcache::Error::Corruption {
            at: format!("uint32list fingerprint length {} != cache magic {}", fingerprint.len(), cache.magic()),
        }));
    }
    if let Some(existing) = cache.action(fingerprint, cache.magic(), |_| true) {
        return Ok(existing);
    }
    let body = Arc::new(Uint32List { values });
    cache.add(body.clone(), fingerprint, cache.magic());
    Ok(body)
}

/// Releases one reference. Mirrors `free()`'s "attempt remove-if-refcount-
/// zero, lose the race gracefully" contract (§4.1); here `Arc`'s strong
/// count already does the refcounting, so this only needs to evict the
/// cache entry once nobody else holds a clone.
pub fn release(cache: &ObjectHash<Uint32List>, fingerprint: &[u8], body: Arc<Uint32List>) {
    drop(body);
    cache.action(fingerprint, cache.magic(), |slot| match slot {
        Some(arc) if Arc::strong_count(arc) == 1 => {
            *slot = None;
            true
        }
        _ => false,
    });
}
