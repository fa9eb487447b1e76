//! Two-slot values for the MCMC store/restore protocol.
//!
//! A [`Versioned`] keeps two copies of a value and two slot indices,
//! `current` and `stored`. Storing and restoring only move indices, so a
//! rejected proposal is undone without copying any data. The first write
//! after a [`store`](Versioned::store) moves `current` to the free slot,
//! which leaves the stored slot untouched until the next store or accept.

/// A value with a current and a stored version.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    slots: [T; 2],
    current: usize,
    stored: usize,
}

impl<T> Versioned<T> {
    /// Build from two pre-allocated slots. `initial` becomes current.
    ///
    /// Useful for large buffers where the spare slot should be allocated
    /// once up front instead of cloned on first write.
    pub fn with_spare(initial: T, spare: T) -> Self {
        Self {
            slots: [initial, spare],
            current: 0,
            stored: 0,
        }
    }

    /// The current value.
    #[inline]
    pub fn get(&self) -> &T {
        &self.slots[self.current]
    }

    /// The value captured by the last store (equal to current if nothing
    /// has been written since).
    #[inline]
    pub fn stored(&self) -> &T {
        &self.slots[self.stored]
    }

    /// True if a write happened since the last store/accept/restore.
    #[inline]
    pub fn is_modified(&self) -> bool {
        self.current != self.stored
    }

    /// Mutable access for a full rewrite.
    ///
    /// If the current slot is the stored one, `current` moves to the spare
    /// slot first. The returned slot may hold stale data and the caller
    /// must overwrite every element it later reads.
    #[inline]
    pub fn overwrite(&mut self) -> &mut T {
        if self.current == self.stored {
            self.current = 1 - self.current;
        }
        &mut self.slots[self.current]
    }

    /// Replace the current value.
    pub fn set(&mut self, value: T) {
        *self.overwrite() = value;
    }

    /// Snapshot the current value (O(1)).
    #[inline]
    pub fn store(&mut self) {
        self.stored = self.current;
    }

    /// Return to the stored value (O(1)).
    #[inline]
    pub fn restore(&mut self) {
        self.current = self.stored;
    }

    /// Keep the current value; the old snapshot becomes the spare slot.
    #[inline]
    pub fn accept(&mut self) {
        self.stored = self.current;
    }
}

impl<T: Clone> Versioned<T> {
    /// Wrap `value`; the spare slot starts as a clone.
    pub fn new(value: T) -> Self {
        Self::with_spare(value.clone(), value)
    }

    /// Edit the current value in place.
    ///
    /// The first edit after a store copies the stored value into the spare
    /// slot and edits the copy.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        if self.current == self.stored {
            let next = 1 - self.current;
            self.slots[next] = self.slots[self.current].clone();
            self.current = next;
        }
        f(&mut self.slots[self.current])
    }
}

impl<T: Clone + Default> Default for Versioned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_reverts_set() {
        let mut h = Versioned::new(2.0);
        h.store();
        h.set(5.0);
        assert_eq!(*h.get(), 5.0);
        assert_eq!(*h.stored(), 2.0);
        h.restore();
        assert_eq!(*h.get(), 2.0);
    }

    #[test]
    fn accept_keeps_new_value() {
        let mut h = Versioned::new(2.0);
        h.store();
        h.set(5.0);
        h.accept();
        assert!(!h.is_modified());
        h.restore();
        assert_eq!(*h.get(), 5.0);
    }

    #[test]
    fn repeated_writes_after_store_never_touch_snapshot() {
        let mut v = Versioned::new(vec![1, 2, 3]);
        v.store();
        v.modify(|x| x.push(4));
        v.modify(|x| x[0] = 10);
        v.set(vec![0]);
        assert_eq!(v.stored(), &vec![1, 2, 3]);
        v.restore();
        assert_eq!(v.get(), &vec![1, 2, 3]);
    }

    #[test]
    fn modify_starts_from_current_value() {
        let mut v = Versioned::new(vec![1, 2]);
        v.store();
        v.modify(|x| x.push(3));
        assert_eq!(v.get(), &vec![1, 2, 3]);
    }

    #[test]
    fn overwrite_uses_spare_slot() {
        let mut v = Versioned::with_spare(vec![1.0; 3], vec![0.0; 3]);
        v.store();
        let slot = v.overwrite();
        slot.copy_from_slice(&[7.0, 8.0, 9.0]);
        assert_eq!(v.get(), &vec![7.0, 8.0, 9.0]);
        v.restore();
        assert_eq!(v.get(), &vec![1.0; 3]);
    }

    #[test]
    fn writes_without_store_stay_in_one_slot() {
        let mut v = Versioned::new(1);
        v.set(2);
        v.store();
        v.set(3);
        v.set(4);
        v.restore();
        assert_eq!(*v.get(), 2);
    }
}
