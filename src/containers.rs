//! Lookup structures shared by the schema tables and the block reader.
//!
//! `HashTable` keeps its entries densely packed in insertion order (until a removal swaps the last
//! entry into the hole) and chains colliding entries through an index array instead of pointers.
//! Growable arrays are plain `Vec`s.

use std::cell::Cell;
use std::fmt;

/// Index returned by `HashTable::find` when a key is absent.
pub const NOT_FOUND: usize = usize::MAX;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Content hash of a string, stable across runs and platforms.
pub fn hash_str(s: &str) -> u64 {
    hash_bytes(s.as_bytes())
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

pub trait HashKey: PartialEq {
    fn hash(&self) -> u64;
}

/// A string key compared by content, the hash is computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrKey {
    hash: u64,
    text: String,
}

impl StrKey {
    pub fn new(text: &str) -> Self {
        StrKey {
            hash: hash_str(text),
            text: text.to_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl HashKey for StrKey {
    fn hash(&self) -> u64 {
        self.hash
    }
}

/// An integer key, typically an already computed content hash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IntKey(pub u64);

impl HashKey for IntKey {
    fn hash(&self) -> u64 {
        self.0
    }
}

/// A memory address key. Addresses are aligned so the low bits are mixed into the hash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressKey(pub u64);

impl HashKey for AddressKey {
    fn hash(&self) -> u64 {
        let a = self.0;
        (a >> 3) ^ (a >> 19) ^ (a << 7) ^ a.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

/// Open hash table with index chaining.
///
/// Duplicate keys are never stored: `insert` refuses a key that is already present.
/// `capacity` is always a power of two and `len() <= capacity()`.
pub struct HashTable<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    buckets: Vec<usize>,
    next: Vec<usize>,
    capacity: usize,
    // (hash, slot) of the last successful lookup
    last: Cell<(u64, usize)>,
}

impl<K: HashKey, V> Default for HashTable<K, V> {
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K: HashKey + fmt::Debug, V: fmt::Debug> fmt::Debug for HashTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.keys.iter().zip(self.values.iter())).finish()
    }
}

impl<K: HashKey, V> HashTable<K, V> {
    pub fn new() -> Self {
        HashTable {
            keys: Vec::new(),
            values: Vec::new(),
            buckets: Vec::new(),
            next: Vec::new(),
            capacity: 0,
            last: Cell::new((0, NOT_FOUND)),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = HashTable::new();
        table.reserve(capacity);
        table
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grows the table so that it can hold at least `capacity` entries without rehashing.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        let capacity = capacity.next_power_of_two().max(8);
        self.keys.reserve(capacity - self.keys.len());
        self.values.reserve(capacity - self.values.len());
        self.rehash(capacity);
    }

    fn rehash(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.buckets = vec![NOT_FOUND; capacity];
        self.next = vec![NOT_FOUND; self.keys.len()];
        let mask = capacity as u64 - 1;

        for (i, key) in self.keys.iter().enumerate() {
            let b = (key.hash() & mask) as usize;
            self.next[i] = self.buckets[b];
            self.buckets[b] = i;
        }
        self.last.set((0, NOT_FOUND));
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash & (self.capacity as u64 - 1)) as usize
    }

    /// Returns the slot holding `key` or `NOT_FOUND`.
    pub fn find(&self, key: &K) -> usize {
        if self.capacity == 0 {
            return NOT_FOUND;
        }

        let hash = key.hash();
        let (last_hash, last_slot) = self.last.get();
        if last_slot != NOT_FOUND && last_hash == hash && self.keys[last_slot] == *key {
            return last_slot;
        }

        let mut i = self.buckets[self.bucket_of(hash)];
        while i != NOT_FOUND {
            if self.keys[i] == *key {
                self.last.set((hash, i));
                return i;
            }
            i = self.next[i];
        }
        NOT_FOUND
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key) != NOT_FOUND
    }

    /// Inserts a new entry. Returns `false` without touching the table if `key` is present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.find(&key) != NOT_FOUND {
            return false;
        }
        if self.keys.len() == self.capacity {
            let grown = (self.capacity * 2).max(8);
            self.reserve(grown);
        }

        let i = self.keys.len();
        let b = self.bucket_of(key.hash());
        self.next.push(self.buckets[b]);
        self.buckets[b] = i;
        self.keys.push(key);
        self.values.push(value);
        true
    }

    /// Removes `key` by moving the last entry into its slot. Does nothing if `key` is absent.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let i = self.find(key);
        if i == NOT_FOUND {
            return None;
        }
        self.unlink(i);

        let last = self.keys.len() - 1;
        if i != last {
            // point whoever referenced `last` at its new slot `i`
            let b = self.bucket_of(self.keys[last].hash());
            if self.buckets[b] == last {
                self.buckets[b] = i;
            } else {
                let mut j = self.buckets[b];
                while self.next[j] != last {
                    j = self.next[j];
                }
                self.next[j] = i;
            }
            self.next[i] = self.next[last];
        }

        self.next.pop();
        self.keys.swap_remove(i);
        self.last.set((0, NOT_FOUND));
        Some(self.values.swap_remove(i))
    }

    fn unlink(&mut self, i: usize) {
        let b = self.bucket_of(self.keys[i].hash());
        if self.buckets[b] == i {
            self.buckets[b] = self.next[i];
        } else {
            let mut j = self.buckets[b];
            while self.next[j] != i {
                j = self.next[j];
            }
            self.next[j] = self.next[i];
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.find(key) {
            NOT_FOUND => None,
            i => Some(&self.values[i]),
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.find(key) {
            NOT_FOUND => None,
            i => Some(&mut self.values[i]),
        }
    }

    pub fn key_at(&self, slot: usize) -> &K {
        &self.keys[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.keys.iter().zip(self.values.iter())
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.next.clear();
        self.buckets.iter_mut().for_each(|b| *b = NOT_FOUND);
        self.last.set((0, NOT_FOUND));
    }
}

/// A string with a capacity fixed at construction. Pushing past the capacity fails.
/// The capacity is only a limit, memory grows with the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedString {
    text: String,
    capacity: usize,
}

impl FixedString {
    pub fn with_capacity(capacity: usize) -> Self {
        FixedString {
            text: String::new(),
            capacity,
        }
    }

    /// Appends `c`, returns `false` if it doesn't fit.
    pub fn push(&mut self, c: char) -> bool {
        if self.text.len() + c.len_utf8() > self.capacity {
            return false;
        }
        self.text.push(c);
        true
    }

    /// Appends all of `s` or nothing.
    pub fn push_str(&mut self, s: &str) -> bool {
        if self.text.len() + s.len() > self.capacity {
            return false;
        }
        self.text.push_str(s);
        true
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hash(&self) -> u64 {
        hash_str(&self.text)
    }
}

impl fmt::Display for FixedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
