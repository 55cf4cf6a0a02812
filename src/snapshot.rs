use std::sync::{Arc, PoisonError, RwLock};

/// A value that is replaced as a whole by a single writer and read by any number of readers.
///  Readers get an `Arc` to the version that was current when they asked, so they never hold
///  the lock beyond cloning that `Arc`, and the writer never waits for a reader to finish
///  looking at the data.
pub struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> SnapshotCell<T> {
        SnapshotCell {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.current.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, value: T) {
        let value = Arc::new(value);
        let previous = {
            let mut current = self.current.write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, value)
        };
        // the previous version is dropped outside the lock
        drop(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish() {
        let cell = SnapshotCell::<Vec<u32>>::default();
        assert!(cell.get().is_empty());

        cell.publish(vec![1, 2]);
        assert_eq!(*cell.get(), vec![1, 2]);
    }

    #[test]
    fn test_readers_keep_their_version() {
        let cell = SnapshotCell::new(vec![1]);
        let old = cell.get();
        cell.publish(vec![2]);
        assert_eq!(*old, vec![1]);
        assert_eq!(*cell.get(), vec![2]);
    }

    #[test]
    fn test_concurrent_readers() {
        let cell = Arc::new(SnapshotCell::new(0u64));
        let readers = (0..4)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..1000 {
                        let current = *cell.get();
                        assert!(current >= last);
                        last = current;
                    }
                })
            })
            .collect::<Vec<_>>();

        for i in 1..=1000 {
            cell.publish(i);
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(*cell.get(), 1000);
    }
}
