// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Nonce-indexed ordered container shared between event producers and the
//! bridge worker. Every operation takes the internal lock once, so each call
//! is atomic with respect to the others.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Items stored in an [`ItemSortedMap`] carry their own ordering key.
pub trait Nonced {
    fn nonce(&self) -> u64;
}

#[derive(Debug)]
pub struct ItemSortedMap<T> {
    items: Mutex<BTreeMap<u64, T>>,
    // None means unbounded
    size_limit: Option<usize>,
}

impl<T: Nonced + Clone> Default for ItemSortedMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Nonced + Clone> ItemSortedMap<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            size_limit: None,
        }
    }

    /// A map that never holds more than `size_limit` items. Once full, the
    /// lowest nonces are retained.
    pub fn with_size_limit(size_limit: usize) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            size_limit: Some(size_limit),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or overwrites the item at its nonce. A new nonce on a full
    /// map evicts the stored maximum; returns false when the item was
    /// rejected because its nonce is not lower than every stored nonce.
    pub fn put(&self, item: T) -> bool {
        let mut items = self.lock();
        match self.size_limit {
            Some(limit) if !items.contains_key(&item.nonce()) => {
                insert_evicting_max(&mut items, item, |len| len >= limit)
            }
            _ => {
                items.insert(item.nonce(), item);
                true
            }
        }
    }

    /// Like [`put`](Self::put) on a map whose length already exceeds `limit`:
    /// an incoming nonce that is new and lower than the current maximum
    /// replaces the maximum, any other incoming item is dropped.
    pub fn put_with_limit(&self, item: T, limit: usize) -> bool {
        let mut items = self.lock();
        insert_evicting_max(&mut items, item, |len| len > limit)
    }

    pub fn get(&self, nonce: u64) -> Option<T> {
        self.lock().get(&nonce).cloned()
    }

    pub fn exist(&self, nonce: u64) -> bool {
        self.lock().contains_key(&nonce)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns up to `count` items with the smallest nonces,
    /// in ascending order.
    pub fn pop(&self, count: usize) -> Vec<T> {
        let mut items = self.lock();
        let mut popped = Vec::with_capacity(count.min(items.len()));
        while popped.len() < count {
            match items.pop_first() {
                Some((_, item)) => popped.push(item),
                None => break,
            }
        }
        popped
    }

    /// Drains the contiguous run of nonces that begins at the stored minimum,
    /// provided that minimum is not above `start`.
    pub fn ready(&self, start: u64) -> Vec<T> {
        let mut items = self.lock();
        let mut next = match items.keys().next() {
            Some(&min) if min <= start => min,
            _ => return vec![],
        };
        let mut ready = vec![];
        while let Some(item) = items.remove(&next) {
            ready.push(item);
            match next.checked_add(1) {
                Some(n) => next = n,
                None => break,
            }
        }
        ready
    }

    /// Removes every item with a nonce strictly lower than `threshold`.
    pub fn forward(&self, threshold: u64) -> Vec<T> {
        let mut items = self.lock();
        let kept = items.split_off(&threshold);
        let removed = std::mem::replace(&mut *items, kept);
        removed.into_values().collect()
    }

    pub fn remove(&self, nonce: u64) -> bool {
        self.lock().remove(&nonce).is_some()
    }

    /// Snapshot in ascending nonce order.
    pub fn flatten(&self) -> Vec<T> {
        self.lock().values().cloned().collect()
    }
}

fn insert_evicting_max<T: Nonced>(
    items: &mut BTreeMap<u64, T>,
    item: T,
    is_full: impl Fn(usize) -> bool,
) -> bool {
    let nonce = item.nonce();
    if is_full(items.len()) {
        if items.contains_key(&nonce) {
            return false;
        }
        match items.keys().next_back().copied() {
            Some(max) if nonce < max => {
                items.remove(&max);
            }
            _ => return false,
        }
    }
    items.insert(nonce, item);
    true
}
