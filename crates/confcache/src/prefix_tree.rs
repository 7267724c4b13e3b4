/// Compressed byte-labeled trie shared by several preference kinds to index
/// reversed DNS names (see `confcore::domain_tagging`).
///
/// Unlike the original's dense 256-ary node (`children_len == 0` meaning
/// "256 children" as a storage optimization), nodes here keep a plain `Vec`
/// of children sorted by their edge's first byte. The externally observable
/// invariant — sibling labels strictly increasing by first byte — is
/// identical; only the internal encoding trick is dropped, which the spec's
/// Design Notes explicitly allow ("a reimplementation may prefer ... as long
/// as behavior is preserved").
pub struct PrefixTree<V> {
    root: Node<V>,
}

struct Node<V> {
    label: Vec<u8>,
    value: Option<V>,
    children: Vec<Node<V>>,
}

impl<V> Node<V> {
    fn leaf(label: Vec<u8>) -> Node<V> {
        Node { label, value: None, children: Vec::new() }
    }

    fn has_content(&self) -> bool {
        self.value.is_some() || !self.children.is_empty()
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl<V> Default for PrefixTree<V> {
    fn default() -> Self {
        PrefixTree::new()
    }
}

impl<V> PrefixTree<V> {
    /// An empty tree.
    pub fn new() -> PrefixTree<V> {
        PrefixTree { root: Node { label: Vec::new(), value: None, children: Vec::new() } }
    }

    /// Returns a mutable slot for `key`, splitting an existing edge along
    /// the longest common prefix as needed. The slot starts out `None` if
    /// this is a brand-new key.
    pub fn put(&mut self, key: &[u8]) -> &mut Option<V> {
        Self::put_into(&mut self.root, key)
    }

    fn put_into<'a>(node: &'a mut Node<V>, key: &[u8]) -> &'a mut Option<V> {
        if key.is_empty() {
            return &mut node.value;
        }
        match node.children.binary_search_by(|c| c.label[0].cmp(&key[0])) {
            Ok(idx) => {
                let common = common_prefix_len(&node.children[idx].label, key);
                let label_len = node.children[idx].label.len();
                if common == label_len {
                    return Self::put_into(&mut node.children[idx], &key[common..]);
                }
                // Split the edge at `common`: old child's label shrinks to
                // its suffix and moves one level down under a new node
                // carrying the shared prefix.
                let old = std::mem::replace(&mut node.children[idx], Node::leaf(Vec::new()));
                let (prefix, suffix) = old.label.split_at(common);
                let mut mid = Node::leaf(prefix.to_vec());
                let mut shrunk = old;
                shrunk.label = suffix.to_vec();
                mid.children.push(shrunk);
                node.children[idx] = mid;

                if common == key.len() {
                    return &mut node.children[idx].value;
                }
                let rest = &key[common..];
                let mid = &mut node.children[idx];
                let pos = mid.children.binary_search_by(|c| c.label[0].cmp(&rest[0])).unwrap_err();
                mid.children.insert(pos, Node::leaf(rest.to_vec()));
                &mut mid.children[pos].value
            }
            Err(idx) => {
                node.children.insert(idx, Node::leaf(key.to_vec()));
                &mut node.children[idx].value
            }
        }
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node = &self.root;
        let mut key = key;
        loop {
            if key.is_empty() {
                return node.value.as_ref();
            }
            let idx = node.children.binary_search_by(|c| c.label[0].cmp(&key[0])).ok()?;
            let child = &node.children[idx];
            if key.len() < child.label.len() || key[..child.label.len()] != child.label[..] {
                return None;
            }
            key = &key[child.label.len()..];
            node = child;
        }
    }

    /// Walks as far as `key` allows, returning the deepest node whose value
    /// passes `chooser` (or any non-null value if `chooser` is `None`),
    /// together with the matched prefix length.
    pub fn prefix_choose<F>(&self, key: &[u8], chooser: Option<F>) -> Option<(&V, usize)>
    where
        F: Fn(&V) -> bool,
    {
        let mut node = &self.root;
        let mut consumed = 0usize;
        let mut best: Option<(&V, usize)> = None;
        loop {
            if let Some(v) = node.value.as_ref() {
                if chooser.as_ref().map_or(true, |c| c(v)) {
                    best = Some((v, consumed));
                }
            }
            if consumed >= key.len() {
                break;
            }
            let rest = &key[consumed..];
            let idx = match node.children.binary_search_by(|c| c.label[0].cmp(&rest[0])) {
                Ok(i) => i,
                Err(_) => break,
            };
            let child = &node.children[idx];
            if rest.len() < child.label.len() || rest[..child.label.len()] != child.label[..] {
                break;
            }
            consumed += child.label.len();
            node = child;
        }
        best
    }

    /// `prefix_choose` with no chooser — the longest stored prefix of `key`.
    pub fn prefix_get(&self, key: &[u8]) -> Option<(&V, usize)> {
        self.prefix_choose::<fn(&V) -> bool>(key, None)
    }

    /// Pre-order traversal, reconstructing the full key for every value.
    pub fn walk<F: FnMut(&[u8], &V)>(&self, cb: &mut F) {
        let mut buf = Vec::new();
        Self::walk_node(&self.root, &mut buf, cb);
    }

    fn walk_node<F: FnMut(&[u8], &V)>(node: &Node<V>, buf: &mut Vec<u8>, cb: &mut F) {
        if let Some(v) = &node.value {
            cb(buf, v);
        }
        for child in &node.children {
            let mark = buf.len();
            buf.extend_from_slice(&child.label);
            Self::walk_node(child, buf, cb);
            buf.truncate(mark);
        }
    }

    /// True if any stored key starts with `key`.
    pub fn contains_subtree(&self, key: &[u8]) -> bool {
        if !self.root.has_content() {
            return false;
        }
        let mut node = &self.root;
        let mut key = key;
        loop {
            if key.is_empty() {
                return true;
            }
            let idx = match node.children.binary_search_by(|c| c.label[0].cmp(&key[0])) {
                Ok(i) => i,
                Err(_) => return false,
            };
            let child = &node.children[idx];
            let overlap = key.len().min(child.label.len());
            if key[..overlap] != child.label[..overlap] {
                return false;
            }
            if overlap == key.len() {
                return true;
            }
            key = &key[overlap..];
            node = child;
        }
    }

    /// Post-order disposal with an optional per-value callback, mirroring
    /// the original's explicit `delete(cb)`. In safe Rust, dropping the tree
    /// already frees the storage; this exists for parity and for callers
    /// that need side effects (releasing externally refcounted bodies) on
    /// each stored value.
    pub fn delete<F: FnMut(V)>(self, mut cb: Option<F>) {
        fn visit<V, F: FnMut(V)>(node: Node<V>, cb: &mut Option<F>) {
            for child in node.children {
                visit(child, cb);
            }
            if let (Some(v), Some(f)) = (node.value, cb.as_mut()) {
                f(v);
            }
        }
        visit(self.root, &mut cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let mut t = PrefixTree::new();
        *t.put(b"hello") = Some(1);
        *t.put(b"help") = Some(2);
        *t.put(b"hel") = Some(3);
        assert_eq!(t.get(b"hello"), Some(&1));
        assert_eq!(t.get(b"help"), Some(&2));
        assert_eq!(t.get(b"hel"), Some(&3));
        assert_eq!(t.get(b"he"), None);
    }

    #[test]
    fn siblings_sorted_by_first_byte() {
        let mut t = PrefixTree::new();
        *t.put(b"zebra") = Some(1);
        *t.put(b"apple") = Some(2);
        *t.put(b"mango") = Some(3);
        assert!(t.root.children.windows(2).all(|w| w[0].label[0] < w[1].label[0]));
    }

    #[test]
    fn prefix_get_finds_longest_match() {
        let mut t = PrefixTree::new();
        *t.put(b"a.example.com") = Some(10);
        *t.put(b"b.a.example.com") = Some(20);
        let (v, len) = t.prefix_get(b"b.a.example.com.extra").unwrap();
        assert_eq!(*v, 20);
        assert_eq!(len, b"b.a.example.com".len());
    }

    #[test]
    fn contains_subtree_detects_prefix() {
        let mut t = PrefixTree::new();
        *t.put(b"example.com") = Some(1);
        assert!(t.contains_subtree(b"exam"));
        assert!(t.contains_subtree(b""));
        assert!(!t.contains_subtree(b"zzz"));
        assert!(!PrefixTree::<i32>::new().contains_subtree(b""));
    }

    #[test]
    fn walk_visits_every_value() {
        let mut t = PrefixTree::new();
        *t.put(b"a") = Some(1);
        *t.put(b"ab") = Some(2);
        *t.put(b"ac") = Some(3);
        let mut seen = Vec::new();
        t.walk(&mut |k, v| seen.push((k.to_vec(), *v)));
        seen.sort();
        assert_eq!(seen, vec![(b"a".to_vec(), 1), (b"ab".to_vec(), 2), (b"ac".to_vec(), 3)]);
    }

    #[test]
    fn delete_invokes_callback_on_every_value() {
        let mut t = PrefixTree::new();
        *t.put(b"x") = Some(1);
        *t.put(b"xy") = Some(2);
        let mut total = 0;
        t.delete(Some(|v: i32| total += v));
        assert_eq!(total, 3);
    }
}
