//! Fixed-size pool of (source, target) connection pairs.
//!
//! Workers check out a whole pair and get it back as one guard; the pair is
//! returned to the free list when the guard drops. A semaphore bounds
//! checkouts to the number of pairs so the free list is never empty when
//! locked.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use deadpool_postgres::{Object, Pool};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{MigrateError, Result};

/// One source connection and one target connection.
#[derive(Debug)]
pub struct ConnectionPair<S, T> {
    pub source: S,
    pub target: T,
}

/// Pair pool over two connection types.
pub struct PairPool<S, T> {
    free: Mutex<Vec<ConnectionPair<S, T>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl<S, T> PairPool<S, T> {
    /// Build a pool owning `pairs`.
    pub fn new(pairs: Vec<ConnectionPair<S, T>>) -> Arc<Self> {
        let size = pairs.len();
        Arc::new(Self {
            free: Mutex::new(pairs),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Pairs currently checked in.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for a free pair.
    pub async fn checkout(self: &Arc<Self>) -> Result<PairGuard<S, T>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::pool(e, "waiting for a connection pair"))?;

        let pair = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .ok_or_else(|| MigrateError::pool("free list empty", "checking out a connection pair"))?;

        Ok(PairGuard {
            pair: Some(pair),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn checkin(&self, pair: ConnectionPair<S, T>) {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).push(pair);
    }
}

impl PairPool<Object, Object> {
    /// Take `size` connections from each database pool and pair them up.
    pub async fn from_pools(source: &Pool, target: &Pool, size: usize) -> Result<Arc<Self>> {
        let mut pairs = Vec::with_capacity(size);
        for i in 0..size {
            let s = source
                .get()
                .await
                .map_err(|e| MigrateError::pool(e, format!("source connection for pair {}", i)))?;
            let t = target
                .get()
                .await
                .map_err(|e| MigrateError::pool(e, format!("target connection for pair {}", i)))?;
            pairs.push(ConnectionPair { source: s, target: t });
        }
        debug!("Opened {} source/target connection pairs", size);
        Ok(Self::new(pairs))
    }
}

/// A checked-out pair. Returned to the pool on drop.
pub struct PairGuard<S, T> {
    pair: Option<ConnectionPair<S, T>>,
    pool: Arc<PairPool<S, T>>,
    // Released after the pair is back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl<S, T> Deref for PairGuard<S, T> {
    type Target = ConnectionPair<S, T>;

    fn deref(&self) -> &Self::Target {
        // Only None inside drop.
        self.pair.as_ref().unwrap_or_else(|| unreachable!("pair taken before drop"))
    }
}

impl<S, T> DerefMut for PairGuard<S, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.pair.as_mut().unwrap_or_else(|| unreachable!("pair taken before drop"))
    }
}

impl<S, T> Drop for PairGuard<S, T> {
    fn drop(&mut self) {
        if let Some(pair) = self.pair.take() {
            self.pool.checkin(pair);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(n: usize) -> Arc<PairPool<usize, String>> {
        PairPool::new(
            (0..n)
                .map(|i| ConnectionPair {
                    source: i,
                    target: format!("t{}", i),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_checkout_returns_whole_pair() {
        let p = pool(2);
        let guard = p.checkout().await.unwrap();
        assert_eq!(guard.target, format!("t{}", guard.source));
        assert_eq!(p.available(), 1);
        drop(guard);
        assert_eq!(p.available(), 2);
    }

    #[tokio::test]
    async fn test_checkout_waits_when_exhausted() {
        let p = pool(1);
        let first = p.checkout().await.unwrap();

        let p2 = Arc::clone(&p);
        let waiter = tokio::spawn(async move {
            let g = p2.checkout().await.unwrap();
            g.source
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 0);
        assert_eq!(p.available(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_share_pairs() {
        let p = pool(3);
        let in_use = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let p = Arc::clone(&p);
            let in_use = Arc::clone(&in_use);
            handles.push(tokio::spawn(async move {
                let g = p.checkout().await.unwrap();
                assert!(in_use.lock().unwrap().insert(g.source));
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_use.lock().unwrap().remove(&g.source);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(p.available(), 3);
        assert_eq!(p.size(), 3);
    }
}
