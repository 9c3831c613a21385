use std::hash::{DefaultHasher, Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};

pub(crate) const LOCK_STRIPES: usize = 16;

/// Fixed set of mutexes addressed by key hash.
///
/// Unrelated keys only contend when they share a stripe. A thread holds at
/// most one stripe, except through [`LockStripes::lock_all`], which takes
/// them in index order.
pub(crate) struct LockStripes {
    stripes: [Mutex<()>; LOCK_STRIPES],
}

impl LockStripes {
    pub(crate) fn new() -> Self {
        Self {
            stripes: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    pub(crate) fn stripe_of<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (LOCK_STRIPES - 1)
    }

    pub(crate) fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock()
    }

    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(Mutex::lock).collect()
    }
}

impl Default for LockStripes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_maps_to_same_stripe() {
        let stripes = LockStripes::new();
        assert_eq!(stripes.stripe_of(&"svc/n"), stripes.stripe_of(&"svc/n"));
        assert!(stripes.stripe_of(&"svc/m") < LOCK_STRIPES);
    }
}
