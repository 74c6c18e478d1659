use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};

struct Inner<T> {
    items: BTreeMap<(u32, u64), (String, T)>,
    keys: HashSet<String>,
    next_seq: u64,
}

/// Priority queue that refuses items whose key is already queued.
///
/// Lower priority values dequeue first; equal priorities dequeue in
/// insertion order. All methods take `&self` and are safe to call from
/// several threads.
pub struct UniquePriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    key_fn: Box<dyn Fn(&T) -> String + Send + Sync>,
}

impl<T> UniquePriorityQueue<T> {
    pub fn new(key_fn: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                keys: HashSet::new(),
                next_seq: 0,
            }),
            key_fn: Box::new(key_fn),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false, leaving the queue untouched, if an item with the same key is queued.
    pub fn try_add(&self, item: T, priority: u32) -> bool {
        let key = (self.key_fn)(&item);
        let mut inner = self.lock();
        if inner.keys.contains(&key) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.keys.insert(key.clone());
        inner.items.insert((priority, seq), (key, item));
        true
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.lock();
        let (_, (key, item)) = inner.items.pop_first()?;
        inner.keys.remove(&key);
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> UniquePriorityQueue<(String, u32)> {
        UniquePriorityQueue::new(|item: &(String, u32)| item.0.clone())
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let q = queue();
        assert!(q.try_add(("Indexing /a".to_string(), 1), 2));
        assert!(!q.try_add(("Indexing /a".to_string(), 2), 0));
        assert_eq!(q.len(), 1);

        // The original item keeps its place and payload
        assert_eq!(q.try_dequeue(), Some(("Indexing /a".to_string(), 1)));
        assert!(q.is_empty());

        // Once dequeued the key may be added again
        assert!(q.try_add(("Indexing /a".to_string(), 3), 2));
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let q = queue();
        for (key, priority) in [("a", 3), ("b", 1), ("c", 2), ("d", 1), ("e", 3)] {
            assert!(q.try_add((key.to_string(), priority), priority));
        }

        let order: Vec<String> = std::iter::from_fn(|| q.try_dequeue())
            .map(|item| item.0)
            .collect();
        assert_eq!(order, vec!["b", "d", "c", "a", "e"]);
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn test_concurrent_producers() {
        let q = Arc::new(queue());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        // Threads overlap on half of the keys
                        q.try_add((format!("job {}", (t % 2) * 100 + i), i), i % 5);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(q.len(), 200);
    }
}
