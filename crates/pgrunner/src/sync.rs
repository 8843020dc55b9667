//! One-shot completion cell

use tokio::sync::watch;

/// A write-once result cell with any number of readers.
///
/// The first [`resolve`](Deferred::resolve) wins; later calls are ignored.
/// [`wait`](Deferred::wait) can be called from any number of tasks, before
/// or after resolution.
pub(crate) struct Deferred<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Deferred<T> {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the cell. Returns false if it was already resolved.
    pub(crate) fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// Wait for the resolved value.
    pub(crate) async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as self, so changed() cannot fail
            // while we are borrowed from it.
            let _ = rx.changed().await;
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let cell: Deferred<u32> = Deferred::new();
        assert!(!cell.is_resolved());
        assert!(cell.resolve(1));
        assert!(!cell.resolve(2));
        assert!(cell.is_resolved());
        assert_eq!(cell.wait().await, 1);
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let cell: std::sync::Arc<Deferred<&'static str>> = std::sync::Arc::new(Deferred::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        cell.resolve("done");

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), "done");
        }
    }

    #[tokio::test]
    async fn test_wait_after_resolution() {
        let cell: Deferred<u32> = Deferred::new();
        cell.resolve(7);
        assert_eq!(cell.wait().await, 7);
    }
}
