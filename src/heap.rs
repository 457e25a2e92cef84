use std::time::Instant;

/// Position marker for a target that is not currently scheduled.
pub const NOT_IN_HEAP: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Entry {
    due: Instant,
    id: usize,
}

/// Binary min-heap of probe targets keyed by due time.
///
/// Targets are addressed by their slot id, and the heap keeps an id -> index
/// map in sync on every sift so a target can be deleted from the middle in
/// O(log n) when it is disabled or removed.
#[derive(Debug, Default)]
pub struct TimerHeap {
    entries: Vec<Entry>,
    pos: Vec<usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pos: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.pos.get(id).is_some_and(|&p| p != NOT_IN_HEAP)
    }

    /// The earliest-due target, if any.
    pub fn peek(&self) -> Option<(usize, Instant)> {
        self.entries.first().map(|e| (e.id, e.due))
    }

    pub fn insert(&mut self, id: usize, due: Instant) {
        assert!(!self.contains(id), "target {} already scheduled", id);
        if self.pos.len() <= id {
            self.pos.resize(id + 1, NOT_IN_HEAP);
        }
        let idx = self.entries.len();
        self.entries.push(Entry { due, id });
        self.pos[id] = idx;
        self.sift_up(idx);
    }

    /// Deletes `id` wherever it sits, returning its due time.
    pub fn remove(&mut self, id: usize) -> Option<Instant> {
        let idx = *self.pos.get(id)?;
        if idx == NOT_IN_HEAP {
            return None;
        }
        self.pos[id] = NOT_IN_HEAP;
        let last = self.entries.len() - 1;
        if idx == last {
            return self.entries.pop().map(|e| e.due);
        }
        self.entries.swap(idx, last);
        self.pos[self.entries[idx].id] = idx;
        let removed = self.entries.pop().map(|e| e.due);
        self.sift_down(idx);
        self.sift_up(idx);
        removed
    }

    /// Removes and returns the earliest-due target.
    pub fn pop(&mut self) -> Option<(usize, Instant)> {
        let (id, due) = self.peek()?;
        self.remove(id);
        Some((id, due))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.pos[self.entries[a].id] = a;
        self.pos[self.entries[b].id] = b;
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[parent].due <= self.entries[idx].due {
                break;
            }
            self.swap(parent, idx);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;
            if left < self.entries.len() && self.entries[left].due < self.entries[best].due {
                best = left;
            }
            if right < self.entries.len() && self.entries[right].due < self.entries[best].due {
                best = right;
            }
            if best == idx {
                break;
            }
            self.swap(best, idx);
            idx = best;
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for (idx, e) in self.entries.iter().enumerate() {
            assert_eq!(self.pos[e.id], idx, "stale position for target {}", e.id);
            if idx > 0 {
                let parent = (idx - 1) / 2;
                assert!(
                    self.entries[parent].due <= e.due,
                    "heap order violated at index {}",
                    idx
                );
            }
        }
        let scheduled = self.pos.iter().filter(|&&p| p != NOT_IN_HEAP).count();
        assert_eq!(scheduled, self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::seq::SliceRandom;
    use rand::Rng;

    use super::*;

    fn due_in(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_pop_orders_by_due() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let mut offsets: Vec<u64> = (0..50).map(|i| i * 13 % 97).collect();
        offsets.shuffle(&mut rand::thread_rng());

        for (id, &off) in offsets.iter().enumerate() {
            heap.insert(id, due_in(base, off));
            heap.assert_invariants();
        }

        let mut popped = Vec::new();
        while let Some((_, due)) = heap.pop() {
            popped.push(due);
            heap.assert_invariants();
        }
        let mut sorted = popped.clone();
        sorted.sort();
        assert_eq!(popped, sorted);
    }

    #[test]
    fn test_remove_from_middle() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        for id in 0..10 {
            heap.insert(id, due_in(base, (id as u64) * 10));
        }

        assert!(heap.contains(4));
        assert!(heap.remove(4).is_some());
        assert!(!heap.contains(4));
        assert!(heap.remove(4).is_none());
        heap.assert_invariants();

        let ids: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|(id, _)| id)).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_random_interleaving_keeps_positions_exact() {
        let base = Instant::now();
        let mut rng = rand::thread_rng();
        let mut heap = TimerHeap::new();
        let mut scheduled = vec![false; 64];

        for _ in 0..2000 {
            let id = rng.gen_range(0..64);
            if scheduled[id] {
                assert!(heap.contains(id));
                heap.remove(id);
                scheduled[id] = false;
            } else {
                assert!(!heap.contains(id));
                heap.insert(id, due_in(base, rng.gen_range(0..10_000)));
                scheduled[id] = true;
            }
            heap.assert_invariants();
            assert_eq!(heap.len(), scheduled.iter().filter(|&&s| s).count());
        }
    }

    #[test]
    #[should_panic(expected = "already scheduled")]
    fn test_double_insert_panics() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.insert(3, base);
        heap.insert(3, base);
    }
}
