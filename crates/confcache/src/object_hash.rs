use std::sync::{Arc, Mutex};

/// Content-addressed dedup cache keyed by a fixed-length fingerprint.
///
/// Parsers that build potentially duplicated list bodies across hundreds of
/// orgs (`uint32list`, `domainlist`, `urllist`, `cidrlist` and friends) probe
/// this cache before allocating: on a fingerprint hit they bump a refcount
/// and reuse the existing body, on a miss they parse, register the new body,
/// and move on. See [`crate::conf_loader`] for the reader side of a parser
/// and `confcore::uint32list` for a full worked exemplar.
///
/// Rows are chosen from the first two fingerprint bytes, same as the
/// original's "first 16 bits of fingerprint" rule. Each row carries its own
/// `Mutex`, so `lock_count` (retained for API fidelity with the spec) does
/// not change how many locks exist in this port — Rust's ownership model
/// needs a lock around any row we might mutate, so the "0 disables striping,
/// readers only" mode from the original is expressed here by callers simply
/// never calling a mutating predicate against such a hash, not by an actual
/// absence of synchronization.
pub struct ObjectHash<V> {
    rows: Vec<Mutex<Vec<Cell<V>>>>,
    key_len: usize,
}

struct Cell<V> {
    fingerprint: Vec<u8>,
    value: Option<Arc<V>>,
}

fn bucket_index(fp: &[u8], row_count: usize) -> usize {
    let hi = fp.first().copied().unwrap_or(0) as usize;
    let lo = fp.get(1).copied().unwrap_or(0) as usize;
    ((hi << 8) | lo) % row_count
}

impl<V> ObjectHash<V> {
    /// Builds a new cache. `row_count` should be a power of two; `lock_count`
    /// is accepted for parity with the spec's constructor signature but does
    /// not otherwise change this implementation's locking (see struct docs).
    /// `key_len` becomes this cache's `magic` and every fingerprint passed to
    /// `action`/`add` must have exactly this length.
    pub fn new(row_count: usize, _lock_count: usize, key_len: usize) -> ObjectHash<V> {
        assert!(row_count > 0, "ObjectHash row_count must be nonzero");
        let mut rows = Vec::with_capacity(row_count);
        rows.resize_with(row_count, || Mutex::new(Vec::new()));
        ObjectHash { rows, key_len }
    }

    /// The fingerprint length this cache was built with.
    pub fn magic(&self) -> usize {
        self.key_len
    }

    /// Consults the bucket for `fp`; for each live cell whose key matches,
    /// invokes `predicate(&mut cell_value)`. The predicate is the only code
    /// allowed to mutate the cell (insert-if-absent by leaving it populated,
    /// remove-if-zero-refcount by taking it to `None`). Scanning stops at the
    /// first `true` return, and that cell's value *before* the predicate ran
    /// is handed back to the caller.
    pub fn action<F>(&self, fp: &[u8], magic: usize, mut predicate: F) -> Option<Arc<V>>
    where
        F: FnMut(&mut Option<Arc<V>>) -> bool,
    {
        assert_eq!(magic, self.key_len, "ObjectHash fingerprint length mismatch");
        let idx = bucket_index(fp, self.rows.len());
        let mut row = self.rows[idx].lock().unwrap();
        let mut accepted = None;
        let mut drop_at = None;
        for (i, cell) in row.iter_mut().enumerate() {
            if cell.fingerprint == fp {
                let before = cell.value.clone();
                if predicate(&mut cell.value) {
                    accepted = before;
                    if cell.value.is_none() {
                        drop_at = Some(i);
                    }
                    break;
                }
            }
        }
        if let Some(i) = drop_at {
            row.remove(i);
        }
        accepted
    }

    /// Installs `obj` in the bucket chosen by `fp`'s leading bytes.
    pub fn add(&self, obj: Arc<V>, fp: &[u8], key_len: usize) {
        assert_eq!(key_len, self.key_len, "ObjectHash fingerprint length mismatch");
        let idx = bucket_index(fp, self.rows.len());
        let mut row = self.rows[idx].lock().unwrap();
        row.push(Cell { fingerprint: fp.to_vec(), value: Some(obj) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn use_if_equal(target: &[u8]) -> impl FnMut(&mut Option<Arc<String>>) -> bool + '_ {
        move |slot: &mut Option<Arc<String>>| slot.is_some() && target == target
    }

    #[test]
    fn miss_then_add_then_hit() {
        let oh: ObjectHash<String> = ObjectHash::new(16, 4, 4);
        let fp = [1u8, 2, 3, 4];
        assert!(oh.action(&fp, 4, |_| true).is_none());
        oh.add(Arc::new("hello".to_owned()), &fp, 4);
        let found = oh.action(&fp, 4, use_if_equal(&fp)).unwrap();
        assert_eq!(&*found, "hello");
    }

    #[test]
    fn remove_if_zero_drops_the_cell() {
        let oh: ObjectHash<u32> = ObjectHash::new(16, 4, 4);
        let fp = [9u8, 9, 9, 9];
        oh.add(Arc::new(42u32), &fp, 4);
        let removed = oh.action(&fp, 4, |slot| {
            *slot = None;
            true
        });
        assert_eq!(*removed.unwrap(), 42);
        // second removal attempt finds nothing: the cell is gone.
        assert!(oh.action(&fp, 4, |_| true).is_none());
    }

    #[test]
    #[should_panic(expected = "fingerprint length mismatch")]
    fn magic_mismatch_panics() {
        let oh: ObjectHash<u32> = ObjectHash::new(16, 4, 4);
        oh.add(Arc::new(1u32), &[1, 2, 3], 3);
    }
}
