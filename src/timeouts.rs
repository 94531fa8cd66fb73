use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::Token;

/// A record that can remember its position in the timeout heap.
///
/// The heap stores `(expiry, token)` pairs; the owning record stores the
/// slot index so removal and expiry updates are O(log n) without a search.
/// Every swap inside the heap writes both affected records' indices before
/// returning, keeping record indices and heap slots in lockstep.
pub trait TimeoutSlot {
    fn heap_index(&self) -> Option<usize>;
    fn set_heap_index(&mut self, slot: Option<usize>);
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    expires: Instant,
    token: Token,
}

#[derive(Debug, Default)]
pub struct TimeoutHeap {
    entries: Vec<Entry>,
}

impl TimeoutHeap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arm (or re-arm) the timeout for `token`. An already-armed token is
    /// updated in place rather than inserted twice.
    pub fn insert<S: TimeoutSlot>(
        &mut self,
        token: Token,
        expires: Instant,
        slots: &mut HashMap<Token, S>,
    ) {
        if let Some(slot) = slots.get(&token) {
            if slot.heap_index().is_some() {
                self.update(token, expires, slots);
                return;
            }
        }
        self.entries.push(Entry { expires, token });
        let index = self.entries.len() - 1;
        if let Some(slot) = slots.get_mut(&token) {
            slot.set_heap_index(Some(index));
        }
        self.sift_up(index, slots);
    }

    /// Move an armed token to a new expiry, sifting from its current slot.
    /// The slot index stays valid throughout; the entry is never removed
    /// and re-inserted.
    pub fn update<S: TimeoutSlot>(
        &mut self,
        token: Token,
        expires: Instant,
        slots: &mut HashMap<Token, S>,
    ) {
        let Some(index) = slots.get(&token).and_then(|s| s.heap_index()) else {
            self.insert(token, expires, slots);
            return;
        };
        let old = self.entries[index].expires;
        self.entries[index].expires = expires;
        if expires < old {
            self.sift_up(index, slots);
        } else {
            self.sift_down(index, slots);
        }
    }

    /// Disarm `token` if armed; a no-op otherwise.
    pub fn remove<S: TimeoutSlot>(&mut self, token: Token, slots: &mut HashMap<Token, S>) {
        let Some(index) = slots.get(&token).and_then(|s| s.heap_index()) else {
            return;
        };
        if let Some(slot) = slots.get_mut(&token) {
            slot.set_heap_index(None);
        }
        let last = self.entries.len() - 1;
        self.entries.swap_remove(index);
        if index < last {
            let moved = self.entries[index].token;
            if let Some(slot) = slots.get_mut(&moved) {
                slot.set_heap_index(Some(index));
            }
            self.sift_up(index, slots);
            self.sift_down(index, slots);
        }
    }

    /// Milliseconds until the earliest expiry, clamped to zero; `None` when
    /// the heap is empty.
    pub fn next_deadline_millis(&self, now: Instant) -> Option<u64> {
        self.entries
            .first()
            .map(|e| e.expires.saturating_duration_since(now).as_millis() as u64)
    }

    /// Pop every entry whose expiry is at or before `now`. The returned
    /// tokens have had their slot indices cleared already.
    pub fn pop_expired<S: TimeoutSlot>(
        &mut self,
        now: Instant,
        slots: &mut HashMap<Token, S>,
    ) -> Vec<Token> {
        let mut expired = Vec::new();
        while let Some(min) = self.entries.first() {
            if min.expires > now {
                break;
            }
            let token = min.token;
            if slots.get(&token).and_then(|s| s.heap_index()).is_some() {
                self.remove(token, slots);
                expired.push(token);
            } else {
                // Entry whose record is already gone; drop it directly so
                // the loop cannot spin on it.
                self.pop_root(slots);
            }
        }
        expired
    }

    fn pop_root<S: TimeoutSlot>(&mut self, slots: &mut HashMap<Token, S>) {
        let last = self.entries.len() - 1;
        self.entries.swap_remove(0);
        if last > 0 {
            let moved = self.entries[0].token;
            if let Some(slot) = slots.get_mut(&moved) {
                slot.set_heap_index(Some(0));
            }
            self.sift_down(0, slots);
        }
    }

    fn swap<S: TimeoutSlot>(&mut self, a: usize, b: usize, slots: &mut HashMap<Token, S>) {
        self.entries.swap(a, b);
        let token_a = self.entries[a].token;
        let token_b = self.entries[b].token;
        if let Some(slot) = slots.get_mut(&token_a) {
            slot.set_heap_index(Some(a));
        }
        if let Some(slot) = slots.get_mut(&token_b) {
            slot.set_heap_index(Some(b));
        }
    }

    fn sift_up<S: TimeoutSlot>(&mut self, mut index: usize, slots: &mut HashMap<Token, S>) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].expires >= self.entries[parent].expires {
                break;
            }
            self.swap(index, parent, slots);
            index = parent;
        }
    }

    fn sift_down<S: TimeoutSlot>(&mut self, mut index: usize, slots: &mut HashMap<Token, S>) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;
            if left < self.entries.len()
                && self.entries[left].expires < self.entries[smallest].expires
            {
                smallest = left;
            }
            if right < self.entries.len()
                && self.entries[right].expires < self.entries[smallest].expires
            {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest, slots);
            index = smallest;
        }
    }
}
