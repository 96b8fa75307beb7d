use std::cmp::Ordering;

use rand::Rng;

pub const SKIP_MAXDEPTH: usize = 10;

const NIL: usize = usize::MAX;

/// A captured search stack: per-level predecessor indices (NIL for the
/// list head) and the exactly-matching node, if any. Valid until the
/// next mutation of the list.
#[derive(Debug, Clone, Copy)]
pub struct SkipSearch {
    pub stack: [usize; SKIP_MAXDEPTH],
    pub found: Option<usize>,
}

struct SkipNode<K, V> {
    key: K,
    value: V,
    depth: usize,
    next: Vec<usize>,
}

/// Arena-backed skip list. Nodes are never removed (deletions are
/// tombstones one layer up), so node indices stay valid for the life
/// of the list; that is what lets cursors hold positions across
/// concurrent inserts.
pub struct SkipList<K, V> {
    head: [usize; SKIP_MAXDEPTH],
    nodes: Vec<SkipNode<K, V>>,
}

impl<K, V> SkipList<K, V> {
    pub fn new() -> Self {
        Self {
            head: [NIL; SKIP_MAXDEPTH],
            nodes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn random_depth() -> usize {
        let mut rng = rand::thread_rng();
        let mut depth = 1;
        while depth < SKIP_MAXDEPTH && rng.gen_range(0, 4) == 0 {
            depth += 1;
        }
        depth
    }

    /// Search with an explicit comparator, capturing the splice stack.
    pub fn search_with<F>(&self, key: &K, cmp: F) -> SkipSearch
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let mut stack = [NIL; SKIP_MAXDEPTH];
        let mut found = None;
        let mut pred = NIL;
        for level in (0..SKIP_MAXDEPTH).rev() {
            loop {
                let next = if pred == NIL {
                    self.head[level]
                } else if level < self.nodes[pred].depth {
                    self.nodes[pred].next[level]
                } else {
                    NIL
                };
                if next == NIL {
                    break;
                }
                match cmp(&self.nodes[next].key, key) {
                    Ordering::Less => pred = next,
                    Ordering::Equal => {
                        found = Some(next);
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
            stack[level] = pred;
        }
        SkipSearch { stack, found }
    }

    /// Insert using a stack captured by `search_with` under the same
    /// exclusive latch. Returns the new node's index.
    pub fn insert(&mut self, search: &SkipSearch, key: K, value: V) -> usize {
        debug_assert!(search.found.is_none());
        let depth = Self::random_depth();
        let idx = self.nodes.len();
        let mut next = vec![NIL; depth];
        for (level, slot) in next.iter_mut().enumerate() {
            *slot = match search.stack[level] {
                NIL => self.head[level],
                pred => {
                    if level < self.nodes[pred].depth {
                        self.nodes[pred].next[level]
                    } else {
                        NIL
                    }
                }
            };
        }
        self.nodes.push(SkipNode {
            key,
            value,
            depth,
            next,
        });
        for level in 0..depth {
            match search.stack[level] {
                NIL => self.head[level] = idx,
                pred => self.nodes[pred].next[level] = idx,
            }
        }
        idx
    }

    pub fn key(&self, idx: usize) -> &K {
        &self.nodes[idx].key
    }

    pub fn value(&self, idx: usize) -> &V {
        &self.nodes[idx].value
    }

    pub fn value_mut(&mut self, idx: usize) -> &mut V {
        &mut self.nodes[idx].value
    }

    /// First node in key order.
    pub fn first(&self) -> Option<usize> {
        match self.head[0] {
            NIL => None,
            idx => Some(idx),
        }
    }

    /// Successor in key order.
    pub fn next(&self, idx: usize) -> Option<usize> {
        match self.nodes[idx].next[0] {
            NIL => None,
            next => Some(next),
        }
    }

    /// First node with key >= `key`.
    pub fn ceiling<F>(&self, key: &K, cmp: F) -> Option<usize>
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let search = self.search_with(key, cmp);
        search.found.or(match search.stack[0] {
            NIL => self.first(),
            pred => self.next(pred),
        })
    }

    /// Predecessor in key order; a level-0 walk, the lists are singly
    /// linked.
    pub fn prev_of<F>(&self, key: &K, cmp: F) -> Option<usize>
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let search = self.search_with(key, cmp);
        match search.stack[0] {
            NIL => None,
            idx => Some(idx),
        }
    }

    pub fn last(&self) -> Option<usize> {
        let mut pred = NIL;
        for level in (0..SKIP_MAXDEPTH).rev() {
            loop {
                let next = if pred == NIL {
                    self.head[level]
                } else if level < self.nodes[pred].depth {
                    self.nodes[pred].next[level]
                } else {
                    NIL
                };
                if next == NIL {
                    break;
                }
                pred = next;
            }
        }
        match pred {
            NIL => None,
            idx => Some(idx),
        }
    }

    pub fn iter(&self) -> SkipIter<'_, K, V> {
        SkipIter {
            list: self,
            idx: self.head[0],
        }
    }
}

impl<K: Clone, V: Clone> SkipList<K, V> {
    /// Tear off the tail: every entry from `from` (a node index on
    /// level 0) onward is removed and returned in key order. The list
    /// is rebuilt from the survivors, used by in-memory page splits.
    pub fn split_tail<F>(&mut self, split_key: &K, cmp: F) -> Vec<(K, V)>
    where
        F: Fn(&K, &K) -> Ordering,
    {
        let mut keep = Vec::new();
        let mut moved = Vec::new();
        for (key, value) in self.iter() {
            if cmp(key, split_key) == Ordering::Less {
                keep.push((key.clone(), value.clone()));
            } else {
                moved.push((key.clone(), value.clone()));
            }
        }

        let mut rebuilt = SkipList::new();
        for (key, value) in keep {
            let search = rebuilt.search_with(&key, &cmp);
            rebuilt.insert(&search, key, value);
        }
        *self = rebuilt;
        moved
    }
}

pub struct SkipIter<'a, K, V> {
    list: &'a SkipList<K, V>,
    idx: usize,
}

impl<'a, K, V> Iterator for SkipIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx == NIL {
            return None;
        }
        let node = &self.list.nodes[self.idx];
        self.idx = node.next[0];
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ucmp(a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_insert_ordered_iteration() {
        let mut list: SkipList<u64, u64> = SkipList::new();
        for key in [5u64, 1, 9, 3, 7, 2, 8].iter() {
            let search = list.search_with(key, ucmp);
            assert!(search.found.is_none());
            list.insert(&search, *key, key * 10);
        }

        let keys: Vec<u64> = list.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 7, 8, 9]);
        assert_eq!(list.last().map(|i| *list.key(i)), Some(9));
    }

    #[test]
    fn test_search_finds_exact_and_stack() {
        let mut list: SkipList<u64, ()> = SkipList::new();
        for key in [10u64, 20, 30].iter() {
            let search = list.search_with(key, ucmp);
            list.insert(&search, *key, ());
        }

        let search = list.search_with(&20, ucmp);
        assert_eq!(search.found.map(|i| *list.key(i)), Some(20));

        let search = list.search_with(&25, ucmp);
        assert!(search.found.is_none());
        // the level-0 predecessor is 20
        assert_eq!(*list.key(search.stack[0]), 20);
    }

    #[test]
    fn test_split_tail() {
        let mut list: SkipList<u64, u64> = SkipList::new();
        for key in 0..10u64 {
            let search = list.search_with(&key, ucmp);
            list.insert(&search, key, key);
        }

        let moved = list.split_tail(&6, ucmp);
        assert_eq!(moved.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![
            6, 7, 8, 9
        ]);
        assert_eq!(list.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![
            0, 1, 2, 3, 4, 5
        ]);
    }

    #[test]
    fn test_positions_survive_inserts() {
        let mut list: SkipList<u64, ()> = SkipList::new();
        let search = list.search_with(&50, ucmp);
        let idx = list.insert(&search, 50, ());

        for key in [10u64, 90, 40, 60].iter() {
            let search = list.search_with(key, ucmp);
            list.insert(&search, *key, ());
        }
        assert_eq!(*list.key(idx), 50);
        // and order links reflect the new neighbors
        assert_eq!(list.next(idx).map(|i| *list.key(i)), Some(60));
    }
}
