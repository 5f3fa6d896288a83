use std::collections::HashMap;
use std::sync::Mutex;

/// per-id mount reference counter
///
/// `get` mounts on the 0 to 1 transition; `put` unmounts on the 1 to 0
/// transition. the counter only tracks mounts performed through the
/// driver.
#[derive(Default)]
pub struct RefCounter {
    counts: Mutex<HashMap<String, usize>>,
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// bump the count for an id, returning the new value
    pub fn increment(&self, id: &str) -> usize {
        let mut counts = self.counts.lock().expect("ref counter poisoned");
        let count = counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// drop the count for an id, returning the new value
    pub fn decrement(&self, id: &str) -> usize {
        let mut counts = self.counts.lock().expect("ref counter poisoned");
        match counts.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(id);
                0
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_decrement() {
        let ctr = RefCounter::new();
        assert_eq!(ctr.increment("a"), 1);
        assert_eq!(ctr.increment("a"), 2);
        assert_eq!(ctr.increment("b"), 1);
        assert_eq!(ctr.decrement("a"), 1);
        assert_eq!(ctr.decrement("a"), 0);
        assert_eq!(ctr.decrement("a"), 0);
    }

    #[test]
    fn test_balanced_get_put_reaches_zero() {
        let ctr = RefCounter::new();
        for _ in 0..5 {
            ctr.increment("id");
        }
        for i in (0..5).rev() {
            assert_eq!(ctr.decrement("id"), i);
        }
    }
}
