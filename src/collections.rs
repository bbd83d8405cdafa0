//! General purpose collection types mirroring the data structures used by
//! the W3C SCXML interpretation algorithm (`List`, `OrderedSet`, `Queue`).
//!
//! The W3C pseudo-code assumes a small, specific vocabulary of operations on
//! these types (`add`, `delete`, `union`, `isMember`, `toList`, ...). Rather
//! than bolt that vocabulary onto `Vec`/`HashSet` at every call site, we keep
//! thin wrappers that read the same way the algorithm reads.

use std::collections::VecDeque;
use std::slice::Iter;

/// Ordered, duplicate-permitting sequence.
#[derive(Clone, Debug)]
pub struct List<T> {
    data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        List { data: Vec::new() }
    }
}

impl<T: Clone + PartialEq> List<T> {
    pub fn new() -> List<T> {
        List::default()
    }

    pub fn from_vec(data: Vec<T>) -> List<T> {
        List { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, t: T) {
        self.data.push(t);
    }

    pub fn push_set(&mut self, l: &OrderedSet<T>) {
        for i in l.iter() {
            self.data.push(i.clone());
        }
    }

    pub fn append_set(&self, l: &OrderedSet<T>) -> List<T> {
        let mut t = self.clone();
        for i in l.iter() {
            t.data.push(i.clone());
        }
        t
    }

    pub fn filter_by(&self, f: impl Fn(&T) -> bool) -> List<T> {
        List::from_vec(self.data.iter().filter(|e| f(e)).cloned().collect())
    }

    pub fn some(&self, f: impl Fn(&T) -> bool) -> bool {
        self.data.iter().any(f)
    }

    pub fn every(&self, f: impl Fn(&T) -> bool) -> bool {
        self.data.iter().all(f)
    }

    pub fn to_set(&self) -> OrderedSet<T> {
        let mut s = OrderedSet::new();
        for e in &self.data {
            s.add(e.clone());
        }
        s
    }

    pub fn sort_by(&self, compare: impl Fn(&T, &T) -> std::cmp::Ordering) -> List<T> {
        let mut t = self.clone();
        t.data.sort_by(compare);
        t
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// Set with insertion-order iteration, as used throughout the algorithm for
/// "configuration", "enabledTransitions" and similar W3C-pseudocode sets.
#[derive(Clone, Debug)]
pub struct OrderedSet<T> {
    data: Vec<T>,
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet { data: Vec::new() }
    }
}

impl<T: Clone + PartialEq> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet::default()
    }

    pub fn from_vec(data: Vec<T>) -> OrderedSet<T> {
        let mut s = OrderedSet::new();
        for e in data {
            s.add(e);
        }
        s
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn add(&mut self, e: T) {
        if !self.data.contains(&e) {
            self.data.push(e);
        }
    }

    pub fn delete(&mut self, e: &T) {
        self.data.retain(|x| x != e);
    }

    pub fn union(&mut self, s: &OrderedSet<T>) {
        for si in s.iter() {
            self.add(si.clone());
        }
    }

    pub fn is_member(&self, e: &T) -> bool {
        self.data.contains(e)
    }

    pub fn has_intersection(&self, s: &OrderedSet<T>) -> bool {
        self.data.iter().any(|si| s.is_member(si))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn to_list(&self) -> List<T> {
        List::from_vec(self.data.clone())
    }

    pub fn sort_by(&self, compare: impl Fn(&T, &T) -> std::cmp::Ordering) -> List<T> {
        self.to_list().sort_by(compare)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// FIFO queue (internal event queue).
#[derive(Debug, Default)]
pub struct Queue<T> {
    data: VecDeque<T>,
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            data: VecDeque::new(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn enqueue(&mut self, e: T) {
        self.data.push_back(e);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.data.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}
