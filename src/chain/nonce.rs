//! Shared nonce allocation for the aggregator's signing account
//!
//! Every transaction from the account goes through one allocator. The lock
//! is held across the send so nonces reach the node in strictly increasing
//! order. A failed or cancelled send drops the cached value; the next
//! transaction is rebuilt on top of a freshly read pending nonce.
//!
//! Payouts reserve their nonce up front instead, so the caller can persist
//! it before anything is broadcast.

use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ChainError;

#[derive(Debug, Default)]
pub struct NonceAllocator {
    next: Mutex<Option<u64>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and send one transaction with the next nonce.
    ///
    /// `fetch_pending` is only called when no nonce is cached.
    pub async fn submit<T, Fetch, FetchFut, Transmit, TransmitFut>(
        &self,
        fetch_pending: Fetch,
        send: Transmit,
    ) -> Result<T, ChainError>
    where
        Fetch: FnOnce() -> FetchFut,
        FetchFut: Future<Output = Result<u64, ChainError>>,
        Transmit: FnOnce(u64) -> TransmitFut,
        TransmitFut: Future<Output = Result<T, ChainError>>,
    {
        let mut next = self.next.lock().await;

        // Taken, not copied: a send dropped mid-flight leaves the cache empty
        let nonce = match next.take() {
            Some(nonce) => nonce,
            None => {
                let fetched = fetch_pending().await?;
                debug!(nonce = fetched, "Loaded pending nonce from chain");
                fetched
            }
        };

        match send(nonce).await {
            Ok(value) => {
                *next = Some(nonce + 1);
                Ok(value)
            }
            Err(e) => {
                warn!(nonce, error = %e, "Transaction send failed, resetting nonce cache");
                Err(e)
            }
        }
    }

    /// Hand out the next nonce without sending anything.
    ///
    /// The caller owns the nonce from here on and must either broadcast a
    /// transaction with it or call [`reset`](Self::reset) once it is known
    /// to be unused.
    pub async fn reserve<Fetch, FetchFut>(&self, fetch_pending: Fetch) -> Result<u64, ChainError>
    where
        Fetch: FnOnce() -> FetchFut,
        FetchFut: Future<Output = Result<u64, ChainError>>,
    {
        let mut next = self.next.lock().await;

        let nonce = match *next {
            Some(nonce) => nonce,
            None => fetch_pending().await?,
        };
        *next = Some(nonce + 1);
        debug!(nonce, "Reserved nonce");
        Ok(nonce)
    }

    /// Forget the cached nonce; the next transaction re-reads the pending count
    pub async fn reset(&self) {
        *self.next.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_nonces_increase_from_pending() {
        let allocator = NonceAllocator::new();
        let fetches = AtomicU64::new(0);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let nonce = allocator
                .submit(
                    || async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        Ok(10)
                    },
                    |nonce| async move { Ok(nonce) },
                )
                .await
                .unwrap();
            seen.push(nonce);
        }

        assert_eq!(seen, vec![10, 11, 12]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_send_refetches() {
        let allocator = NonceAllocator::new();

        let failed: Result<u64, ChainError> = allocator
            .submit(
                || async { Ok(3) },
                |_| async { Err(ChainError::Rpc("boom".to_string())) },
            )
            .await;
        assert!(failed.is_err());

        let nonce = allocator
            .submit(|| async { Ok(4) }, |nonce| async move { Ok(nonce) })
            .await
            .unwrap();
        assert_eq!(nonce, 4);
    }

    #[tokio::test]
    async fn test_reserved_nonce_is_skipped_by_later_sends() {
        let allocator = NonceAllocator::new();

        let reserved = allocator.reserve(|| async { Ok(7) }).await.unwrap();
        let sent = allocator
            .submit(|| async { Ok(0) }, |nonce| async move { Ok(nonce) })
            .await
            .unwrap();
        assert_eq!((reserved, sent), (7, 8));

        allocator.reset().await;
        let refetched = allocator.reserve(|| async { Ok(7) }).await.unwrap();
        assert_eq!(refetched, 7);
    }

    #[tokio::test]
    async fn test_cancelled_send_clears_cache() {
        let allocator = NonceAllocator::new();
        allocator
            .submit(|| async { Ok(1) }, |nonce| async move { Ok(nonce) })
            .await
            .unwrap();

        // Dropped while the send is in flight
        let stalled = allocator.submit(
            || async { Ok(0) },
            |_| std::future::pending::<Result<u64, ChainError>>(),
        );
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(10), stalled)
                .await
                .is_err()
        );

        let nonce = allocator
            .submit(|| async { Ok(5) }, |nonce| async move { Ok(nonce) })
            .await
            .unwrap();
        assert_eq!(nonce, 5);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_unique() {
        let allocator = Arc::new(NonceAllocator::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .submit(|| async { Ok(0) }, |nonce| async move { Ok(nonce) })
                    .await
                    .unwrap()
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort();
        assert_eq!(nonces, (0..8).collect::<Vec<u64>>());
    }
}
