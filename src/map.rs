//! The shard's series lookup: a hash map from id to list node plus an
//! insertion-ordered doubly linked list over the same entries. Both are
//! guarded together by the shard lock; nothing here synchronizes on its own.
//!
//! Long scans never iterate the map. They walk the list in batches through a
//! cursor that holds a reference count on its position (see the shard's
//! batched iteration), which is why node ids must stay valid for as long as
//! any cursor holds a reference: a referenced entry is never purged, so its
//! node is never freed.

use crate::entry::Entry;
use crate::types::SeriesId;
use std::collections::HashMap;
use std::sync::Arc;

/// Minimum number of entries visited per batch while scanning the list.
pub(crate) const ITERATE_BATCH_MIN_SIZE: usize = 16;

/// Fraction of the list visited per batch, once above the minimum.
pub(crate) const ITERATE_BATCH_PERCENT: f64 = 0.01;

/// Batch size for a list of `len` entries: `max(16, ceil(0.01 * len))`.
pub(crate) fn iterate_batch_size(len: usize) -> usize {
    let t = (ITERATE_BATCH_PERCENT * len as f64).ceil() as usize;
    t.max(ITERATE_BATCH_MIN_SIZE)
}

/// Handle to a node in [`EntryList`]. Only meaningful for the list that
/// issued it, and only while that node is occupied.
pub(crate) type NodeId = usize;

#[derive(Debug)]
struct Node {
    entry: Arc<Entry>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug)]
enum Slot {
    Occupied(Node),
    /// Free slot, linking to the next free slot.
    Vacant(Option<NodeId>),
}

/// Insertion-ordered doubly linked list of entries, slab-allocated so node
/// handles are plain indices.
#[derive(Debug, Default)]
pub(crate) struct EntryList {
    slots: Vec<Slot>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    free: Option<NodeId>,
    len: usize,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<NodeId> {
        self.head
    }

    pub fn next(&self, node: NodeId) -> Option<NodeId> {
        match self.slots.get(node) {
            Some(Slot::Occupied(n)) => n.next,
            _ => None,
        }
    }

    pub fn entry(&self, node: NodeId) -> Option<&Arc<Entry>> {
        match self.slots.get(node) {
            Some(Slot::Occupied(n)) => Some(&n.entry),
            _ => None,
        }
    }

    pub fn push_back(&mut self, entry: Arc<Entry>) -> NodeId {
        let node = Node {
            entry,
            prev: self.tail,
            next: None,
        };
        let id = match self.free {
            Some(free_id) => {
                let next_free = match &self.slots[free_id] {
                    Slot::Vacant(next) => *next,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.free = next_free;
                self.slots[free_id] = Slot::Occupied(node);
                free_id
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail_id) => {
                if let Slot::Occupied(tail) = &mut self.slots[tail_id] {
                    tail.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        id
    }

    pub fn remove(&mut self, node: NodeId) -> Option<Arc<Entry>> {
        let (prev, next) = match self.slots.get(node) {
            Some(Slot::Occupied(n)) => (n.prev, n.next),
            _ => return None,
        };

        match prev {
            Some(prev_id) => {
                if let Slot::Occupied(p) = &mut self.slots[prev_id] {
                    p.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next_id) => {
                if let Slot::Occupied(n) = &mut self.slots[next_id] {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        let removed = std::mem::replace(&mut self.slots[node], Slot::Vacant(self.free));
        self.free = Some(node);
        self.len -= 1;
        match removed {
            Slot::Occupied(n) => Some(n.entry),
            Slot::Vacant(_) => None,
        }
    }
}

/// Hash lookup from series id to the entry's list node.
///
/// Keys are `Bytes` clones of the entry's own id, so inserting never copies
/// the underlying allocation and removing never frees it out from under the
/// series metadata.
#[derive(Debug, Default)]
pub(crate) struct EntryMap {
    lookup: HashMap<SeriesId, NodeId>,
}

impl EntryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &[u8]) -> Option<NodeId> {
        self.lookup.get(id).copied()
    }

    pub fn insert(&mut self, id: SeriesId, node: NodeId) {
        self.lookup.insert(id, node);
    }

    pub fn remove(&mut self, id: &[u8]) -> Option<NodeId> {
        self.lookup.remove(id)
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemSeries;
    use crate::types::SeriesMetadata;
    use bytes::Bytes;

    fn entry(id: &str, index: u64) -> Arc<Entry> {
        let metadata = SeriesMetadata::untagged(Bytes::copy_from_slice(id.as_bytes()));
        Arc::new(Entry::new(Arc::new(MemSeries::new(metadata)), index))
    }

    fn ids_in_order(list: &EntryList) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = list.front();
        while let Some(node) = cursor {
            let e = list.entry(node).unwrap();
            out.push(String::from_utf8(e.id().to_vec()).unwrap());
            cursor = list.next(node);
        }
        out
    }

    #[test]
    fn batch_size_floor_and_percent() {
        assert_eq!(iterate_batch_size(0), 16);
        assert_eq!(iterate_batch_size(10), 16);
        assert_eq!(iterate_batch_size(1600), 16);
        assert_eq!(iterate_batch_size(1601), 17);
        assert_eq!(iterate_batch_size(10_000), 100);
    }

    #[test]
    fn push_back_preserves_insertion_order() {
        let mut list = EntryList::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            list.push_back(entry(id, i as u64));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(ids_in_order(&list), vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_middle_relinks_neighbours() {
        let mut list = EntryList::new();
        let _a = list.push_back(entry("a", 1));
        let b = list.push_back(entry("b", 2));
        let _c = list.push_back(entry("c", 3));

        let removed = list.remove(b).unwrap();
        assert_eq!(removed.id().as_ref(), b"b");
        assert_eq!(list.len(), 2);
        assert_eq!(ids_in_order(&list), vec!["a", "c"]);

        // Removing twice is a no-op.
        assert!(list.remove(b).is_none());
    }

    #[test]
    fn remove_head_and_tail() {
        let mut list = EntryList::new();
        let a = list.push_back(entry("a", 1));
        let _b = list.push_back(entry("b", 2));
        let c = list.push_back(entry("c", 3));

        list.remove(a);
        assert_eq!(ids_in_order(&list), vec!["b", "c"]);
        list.remove(c);
        assert_eq!(ids_in_order(&list), vec!["b"]);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut list = EntryList::new();
        let a = list.push_back(entry("a", 1));
        list.push_back(entry("b", 2));
        list.remove(a);

        let c = list.push_back(entry("c", 3));
        // The freed slot is recycled; order reflects insertion, not slots.
        assert_eq!(c, a);
        assert_eq!(ids_in_order(&list), vec!["b", "c"]);
    }

    #[test]
    fn map_points_at_list_nodes() {
        let mut list = EntryList::new();
        let mut map = EntryMap::new();

        let e = entry("cpu", 1);
        let node = list.push_back(e.clone());
        map.insert(e.id().clone(), node);

        let found = map.get(b"cpu").unwrap();
        assert!(Arc::ptr_eq(list.entry(found).unwrap(), &e));
        assert_eq!(map.len(), 1);

        map.remove(b"cpu");
        assert!(map.get(b"cpu").is_none());
    }
}
