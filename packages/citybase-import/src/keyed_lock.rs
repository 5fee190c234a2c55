//! Keyed mutual exclusion: one blocking lock per string key.
//!
//! Serializes only the operations that contend for the same logical
//! resource (the same external key or digest); unrelated keys stay fully
//! concurrent. Slots are reference-counted and removed once the last
//! holder or waiter leaves, so the registry never grows with the number
//! of keys ever seen, only with the keys currently in use.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

#[derive(Default)]
struct SlotState {
    held: bool,
    waiters: usize,
}

pub struct KeyedLockRegistry {
    slots: Mutex<HashMap<String, SlotState>>,
    released: Condvar,
}

impl KeyedLockRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until the per-key lock is free, then hold it until the
    /// returned guard drops. Guards release on every exit path.
    pub fn acquire(&self, key: &str) -> KeyedLockGuard<'_> {
        let mut slots = self.slots.lock();
        loop {
            let acquired = match slots.get_mut(key) {
                None => {
                    slots.insert(
                        key.to_string(),
                        SlotState {
                            held: true,
                            waiters: 0,
                        },
                    );
                    true
                }
                Some(slot) if !slot.held => {
                    slot.held = true;
                    true
                }
                Some(slot) => {
                    slot.waiters += 1;
                    false
                }
            };
            if acquired {
                break;
            }
            self.released.wait(&mut slots);
            if let Some(slot) = slots.get_mut(key) {
                slot.waiters -= 1;
            }
        }
        KeyedLockGuard {
            registry: self,
            key: key.to_string(),
        }
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.held = false;
            if slot.waiters == 0 {
                slots.remove(key);
            } else {
                self.released.notify_all();
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for KeyedLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedLockGuard<'a> {
    registry: &'a KeyedLockRegistry,
    key: String,
}

impl KeyedLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_exclusive() {
        let registry = Arc::new(KeyedLockRegistry::new());
        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            let entries = Arc::clone(&entries);
            handles.push(thread::spawn(move || {
                let _guard = registry.acquire("bldg-1");
                assert!(!in_section.swap(true, Ordering::SeqCst));
                entries.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                in_section.store(false, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_different_keys_run_concurrently() {
        let registry = Arc::new(KeyedLockRegistry::new());
        // Both threads hold their lock while waiting on the barrier; this
        // would deadlock if the two keys shared a lock.
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for key in ["bldg-1", "bldg-2"] {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let _guard = registry.acquire(key);
                barrier.wait();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_slots_are_reclaimed() {
        let registry = KeyedLockRegistry::new();
        {
            let _a = registry.acquire("a");
            let _b = registry.acquire("b");
            assert_eq!(registry.slot_count(), 2);
        }
        assert_eq!(registry.slot_count(), 0);
    }

    #[test]
    fn test_slots_reclaimed_after_contention() {
        let registry = Arc::new(KeyedLockRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let _guard = registry.acquire("contended");
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.slot_count(), 0);
    }

    #[test]
    fn test_reacquire_after_release() {
        let registry = KeyedLockRegistry::new();
        drop(registry.acquire("k"));
        drop(registry.acquire("k"));
        assert_eq!(registry.slot_count(), 0);
    }
}
