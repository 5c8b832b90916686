use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use rand::Rng;
use serde::Deserialize;

/// Tracks which cached key should be evicted next.
///
/// An eviction set only ever sees keys. The owner of the values is responsible for keeping the
/// set of keys in here equal to the set of keys it stores: every stored key is [`insert`]ed
/// exactly once, and every key removed through [`remove`] must be dropped by the owner as well.
///
/// [`insert`]: EvictionSet::insert
/// [`remove`]: EvictionSet::remove
pub trait EvictionSet<K>: Send {
    /// Registers a newly stored key.
    fn insert(&mut self, key: K);

    /// Records an access to a stored key.
    fn touch(&mut self, key: &K);

    /// Returns the key that would be evicted next, or `None` if the set is empty.
    ///
    /// Repeated calls without an intermediate mutation return the same key.
    fn peek(&mut self) -> Option<K>;

    /// Evicts the key that was most recently returned by [`peek`](EvictionSet::peek).
    fn remove(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The eviction policies that can be selected in the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the least recently used key.
    #[default]
    Lru,
    /// Evict the oldest key, regardless of how often it is used.
    Fifo,
    /// Evict a key at random.
    Random,
}

impl EvictionPolicy {
    pub fn create_set<K>(self) -> Box<dyn EvictionSet<K>>
    where
        K: Clone + Eq + Hash + Send + 'static,
    {
        match self {
            Self::Lru => Box::new(LruSet::new()),
            Self::Fifo => Box::new(FifoSet::new()),
            Self::Random => Box::new(RandomSet::new()),
        }
    }
}

#[derive(Debug)]
struct LruNode<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A least-recently-used eviction set.
///
/// Keys are kept in a doubly linked list ordered by recency, with the least recently used key at
/// the head. The list nodes live in a slab, and an index maps every key to its node, so that all
/// operations run in constant time.
#[derive(Debug)]
pub struct LruSet<K> {
    /// Slots of vacated nodes keep their stale key until they are reused.
    nodes: Vec<LruNode<K>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Clone + Eq + Hash> LruSet<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, idx: usize) -> &LruNode<K> {
        &self.nodes[idx]
    }

    fn node_mut(&mut self, idx: usize) -> &mut LruNode<K> {
        &mut self.nodes[idx]
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_back(&mut self, idx: usize) {
        let tail = self.tail;
        {
            let node = self.node_mut(idx);
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail) => self.node_mut(tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }
}

impl<K: Clone + Eq + Hash> Default for LruSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Send> EvictionSet<K> for LruSet<K> {
    fn insert(&mut self, key: K) {
        if self.index.contains_key(&key) {
            self.touch(&key);
            return;
        }
        let node = LruNode {
            key: key.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_back(idx);
    }

    fn touch(&mut self, key: &K) {
        if let Some(&idx) = self.index.get(key) {
            if self.tail != Some(idx) {
                self.unlink(idx);
                self.push_back(idx);
            }
        }
    }

    fn peek(&mut self) -> Option<K> {
        self.head.map(|idx| self.node(idx).key.clone())
    }

    fn remove(&mut self) {
        let Some(idx) = self.head else {
            return;
        };
        self.unlink(idx);
        self.index.remove(&self.nodes[idx].key);
        self.free.push(idx);
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// A first-in-first-out eviction set. Accesses do not influence the order.
#[derive(Debug)]
pub struct FifoSet<K> {
    queue: VecDeque<K>,
    members: HashSet<K>,
}

impl<K: Clone + Eq + Hash> FifoSet<K> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> Default for FifoSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Send> EvictionSet<K> for FifoSet<K> {
    fn insert(&mut self, key: K) {
        if self.members.insert(key.clone()) {
            self.queue.push_back(key);
        }
    }

    fn touch(&mut self, _key: &K) {}

    fn peek(&mut self) -> Option<K> {
        self.queue.front().cloned()
    }

    fn remove(&mut self) {
        if let Some(key) = self.queue.pop_front() {
            self.members.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// An eviction set that picks its victim uniformly at random.
#[derive(Debug)]
pub struct RandomSet<K> {
    keys: Vec<K>,
    index: HashMap<K, usize>,
    /// The position picked by the last `peek`, kept until the next `remove`.
    victim: Option<usize>,
}

impl<K: Clone + Eq + Hash> RandomSet<K> {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            index: HashMap::new(),
            victim: None,
        }
    }
}

impl<K: Clone + Eq + Hash> Default for RandomSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Send> EvictionSet<K> for RandomSet<K> {
    fn insert(&mut self, key: K) {
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key.clone(), self.keys.len());
        self.keys.push(key);
    }

    fn touch(&mut self, _key: &K) {}

    fn peek(&mut self) -> Option<K> {
        if self.keys.is_empty() {
            return None;
        }
        let len = self.keys.len();
        let victim = *self
            .victim
            .get_or_insert_with(|| rand::rng().random_range(0..len));
        Some(self.keys[victim].clone())
    }

    fn remove(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let victim = self
            .victim
            .take()
            .unwrap_or_else(|| rand::rng().random_range(0..self.keys.len()));
        let key = self.keys.swap_remove(victim);
        self.index.remove(&key);
        if let Some(moved) = self.keys.get(victim) {
            self.index.insert(moved.clone(), victim);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}
