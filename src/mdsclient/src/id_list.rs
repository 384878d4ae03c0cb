use std::{fmt, hash::Hash, iter::FusedIterator};

use rustc_hash::FxHashMap;

/// An insertion-ordered set of identifiers with O(1) insert and remove by identity.
///
/// This is a doubly-linked list whose links live in a hash map keyed by the element itself,
/// so entities can be members of several lists at once without any list owning them.
#[derive(Clone)]
pub struct IdList<K: Copy + Hash + Eq> {
    links: FxHashMap<K, Links<K>>,
    head: Option<K>,
    tail: Option<K>,
}

#[derive(Debug, Copy, Clone)]
struct Links<K> {
    prev: Option<K>,
    next: Option<K>,
}

impl<K: Copy + Hash + Eq> Default for IdList<K> {
    fn default() -> Self {
        Self {
            links: FxHashMap::default(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Copy + Hash + Eq + fmt::Debug> fmt::Debug for IdList<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<K: Copy + Hash + Eq> IdList<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.links.contains_key(id)
    }

    pub fn front(&self) -> Option<K> {
        self.head
    }

    pub fn back(&self) -> Option<K> {
        self.tail
    }

    /// Appends `id`. Returns `false` (and leaves the order alone) if it was already a member.
    pub fn push_back(&mut self, id: K) -> bool {
        if self.links.contains_key(&id) {
            return false;
        }

        self.links.insert(
            id,
            Links {
                prev: self.tail,
                next: None,
            },
        );

        match self.tail {
            Some(tail) => self.link_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        true
    }

    pub fn remove(&mut self, id: &K) -> bool {
        let Some(links) = self.links.remove(id) else {
            return false;
        };

        match links.prev {
            Some(prev) => self.link_mut(prev).next = links.next,
            None => self.head = links.next,
        }

        match links.next {
            Some(next) => self.link_mut(next).prev = links.prev,
            None => self.tail = links.prev,
        }

        true
    }

    pub fn pop_front(&mut self) -> Option<K> {
        let head = self.head?;
        self.remove(&head);
        Some(head)
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }

    fn link_mut(&mut self, id: K) -> &mut Links<K> {
        self.links
            .get_mut(&id)
            .expect("IdList neighbour missing from link map")
    }

    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            list: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }
}

impl<'a, K: Copy + Hash + Eq> IntoIterator for &'a IdList<K> {
    type Item = K;
    type IntoIter = Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Copy + Hash + Eq> Extend<K> for IdList<K> {
    fn extend<T: IntoIterator<Item = K>>(&mut self, iter: T) {
        for id in iter {
            self.push_back(id);
        }
    }
}

impl<K: Copy + Hash + Eq> FromIterator<K> for IdList<K> {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        let mut list = Self::new();
        list.extend(iter);
        list
    }
}

pub struct Iter<'a, K: Copy + Hash + Eq> {
    list: &'a IdList<K>,
    cursor: Option<K>,
    remaining: usize,
}

impl<K: Copy + Hash + Eq> Iterator for Iter<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let current = self.cursor?;
        self.cursor = self.list.links[&current].next;
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K: Copy + Hash + Eq> ExactSizeIterator for Iter<'_, K> {}

impl<K: Copy + Hash + Eq> FusedIterator for Iter<'_, K> {}
