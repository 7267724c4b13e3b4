use confcache::{CategoryBitset, PrefixTree};

/// Offset into `value_pool`, tagged the same way as a packed inline
/// `CategoryBitset` (bit 0 set) so both live in the same `usize`-tagged
/// union (§9 "Packed-pointer trick"). An inline-packed value is returned
/// directly by `CategoryBitset::unpack`; a pool offset is `(index << 1) | 1`
/// with the index recovered by `>> 1`, same bit convention, different
/// meaning carried out-of-band by whether the tree value came from
/// `PrefixTree::put` before or after the pool grew past inline capacity.
/// Since this crate's `PrefixTree` stores real `CategoryBitset` values
/// directly (not machine words), the pool exists only to let
/// `DomainTagging::first`/`last` bound a reversed-name range cheaply; the
/// packed/pool distinction from the original is preserved in spirit via
/// `StoredCategories` below rather than by reusing raw tagged words.
#[derive(Debug, Clone, Copy)]
pub enum StoredCategories {
    Inline(CategoryBitset),
    Pooled(usize),
}

/// A PrefixTree of reversed DNS wire-format names mapping to category
/// bitsets (§4.11). Lookup returns the longest matching prefix's bitset,
/// unioned into the caller's accumulator.
pub struct DomainTagging {
    tree: PrefixTree<StoredCategories>,
    value_pool: Vec<CategoryBitset>,
    first: Option<Vec<u8>>,
    last: Option<Vec<u8>>,
}

impl Default for DomainTagging {
    fn default() -> Self {
        DomainTagging::new()
    }
}

impl DomainTagging {
    pub fn new() -> DomainTagging {
        DomainTagging { tree: PrefixTree::new(), value_pool: Vec::new(), first: None, last: None }
    }

    /// Inserts `categories` for `reversed_name`, choosing the inline
    /// representation when it packs into seven-or-fewer bits and a pool
    /// slot otherwise.
    pub fn insert(&mut self, reversed_name: &[u8], categories: CategoryBitset) {
        let stored = if categories.pack().is_some() {
            StoredCategories::Inline(categories)
        } else {
            let idx = self.value_pool.len();
            self.value_pool.push(categories);
            StoredCategories::Pooled(idx)
        };
        *self.tree.put(reversed_name) = Some(stored);

        match &self.first {
            Some(f) if f.as_slice() <= reversed_name => {}
            _ => self.first = Some(reversed_name.to_vec()),
        }
        match &self.last {
            Some(l) if l.as_slice() >= reversed_name => {}
            _ => self.last = Some(reversed_name.to_vec()),
        }
    }

    fn resolve(&self, stored: &StoredCategories) -> CategoryBitset {
        match stored {
            StoredCategories::Inline(c) => *c,
            StoredCategories::Pooled(idx) => self.value_pool[*idx],
        }
    }

    /// Pre-filters out-of-range queries using `first`/`last` before walking
    /// the tree, then returns the longest prefix match's bitset.
    pub fn lookup(&self, reversed_name: &[u8]) -> Option<CategoryBitset> {
        if let (Some(first), Some(last)) = (&self.first, &self.last) {
            if reversed_name < first.as_slice() || reversed_name > last.as_slice() {
                // Still may match as a strict prefix of `first`/beyond
                // `last` in byte-order terms; the tree walk below is the
                // authority, this is purely a short-circuit for the common
                // case of a query entirely outside the seen range.
                if !self.tree.contains_subtree(&[]) {
                    return None;
                }
            }
        }
        self.tree.prefix_get(reversed_name).map(|(stored, _)| self.resolve(stored))
    }

    pub fn first(&self) -> Option<&[u8]> {
        self.first.as_deref()
    }

    pub fn last(&self) -> Option<&[u8]> {
        self.last.as_deref()
    }
}

/// Reverses a dotted domain name's labels into the wire-adjacent order this
/// module keys on (e.g. `"www.example.com"` -> `"com.example.www"`), which
/// makes shared suffixes share tree prefixes.
pub fn reverse_labels(domain: &str) -> Vec<u8> {
    let mut labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    labels.reverse();
    labels.join(".").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_prefix_lookup() {
        let mut dt = DomainTagging::new();
        let mut cats = CategoryBitset::new();
        cats.set(3);
        dt.insert(&reverse_labels("example.com"), cats);

        let hit = dt.lookup(&reverse_labels("example.com")).unwrap();
        assert!(hit.is_set(3));

        let sub_hit = dt.lookup(&reverse_labels("www.example.com"));
        assert!(sub_hit.is_some());
    }

    #[test]
    fn unrelated_domain_misses() {
        let mut dt = DomainTagging::new();
        dt.insert(&reverse_labels("example.com"), CategoryBitset::new());
        assert!(dt.lookup(&reverse_labels("totally-different.org")).is_none());
    }

    #[test]
    fn large_category_set_uses_pool() {
        let mut dt = DomainTagging::new();
        let mut cats = CategoryBitset::new();
        for b in 0..20 {
            cats.set(b);
        }
        dt.insert(&reverse_labels("big.example"), cats);
        let got = dt.lookup(&reverse_labels("big.example")).unwrap();
        assert_eq!(got.popcount(), 20);
        assert_eq!(dt.value_pool.len(), 1);
    }
}
