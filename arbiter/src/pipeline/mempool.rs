//! Bounded, MPMC object pools (§5 "shared-resource policy"). Workers borrow
//! `Bin`s and `AdmittedTraffic` records from a pool sized up front and
//! return them after use; exhaustion is a recoverable, logged condition
//! (§4.3.7), never an allocation failure, since Rust's allocator would
//! happily keep handing out heap memory — the pool exists to bound the
//! pipeline's working set, not to avoid `malloc`.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

pub struct Mempool<T> {
    free_rx: Receiver<T>,
    free_tx: Sender<T>,
}

impl<T> Mempool<T> {
    pub fn new(capacity: usize, make: impl Fn() -> T) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            // capacity is also the bound, so this never blocks.
            let _ = free_tx.try_send(make());
        }
        Mempool { free_rx, free_tx }
    }

    /// Takes one object from the pool, or `None` if exhausted. Per §4.3.7,
    /// the caller's response to `None` is to retry the whole batch from the
    /// top after logging, never to silently drop demand.
    pub fn get(&self) -> Option<T> {
        match self.free_rx.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                unreachable!("mempool sender half dropped while pool is in use")
            }
        }
    }

    /// Returns `v` to the pool. The pool is sized to exactly cover every
    /// object ever handed out, so this cannot fail.
    pub fn put(&self, v: T) {
        let _ = self.free_tx.try_send(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_refills_on_put() {
        let pool: Mempool<u32> = Mempool::new(1, || 7);
        let v = pool.get().unwrap();
        assert_eq!(v, 7);
        assert!(pool.get().is_none());
        pool.put(v);
        assert!(pool.get().is_some());
    }
}
