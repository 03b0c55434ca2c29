// Single-flight refresh coordination
//
// The first request to see a 401 leads the refresh; every request that sees
// a 401 while it runs is parked on a oneshot and released, in arrival order,
// with the leader's outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use super::refresh::TokenRefresher;
use crate::error::{ClientError, Result};

const REFRESH_ABANDONED: &str = "Token refresh was abandoned before it completed";

type Waiter = oneshot::Sender<Result<String>>;

/// In-progress flag and the requests parked behind it
///
/// `queue` is non-empty only while `in_progress` is set.
#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    queue: VecDeque<Waiter>,
}

enum Role {
    Leader,
    Follower(oneshot::Receiver<Result<String>>),
}

/// Owns the refresh state for one client session
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    refresher: TokenRefresher,
}

impl RefreshCoordinator {
    pub fn new(refresher: TokenRefresher) -> Self {
        Self {
            state: Mutex::new(RefreshState::default()),
            refresher,
        }
    }

    /// Whether a refresh call is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.state().in_progress
    }

    /// Number of requests waiting on the in-flight refresh
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Obtain a fresh access token, joining an in-flight refresh if any
    pub async fn refresh(&self) -> Result<String> {
        self.single_flight(|| self.refresher.refresh()).await
    }

    /// Run `refresh` unless another caller already is, in which case wait
    /// for that caller's result instead
    pub async fn single_flight<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let role = {
            let mut state = self.state();
            if state.in_progress {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                Role::Follower(rx)
            } else {
                state.in_progress = true;
                Role::Leader
            }
        };

        match role {
            Role::Follower(rx) => {
                tracing::debug!("Refresh already in progress, queueing request");
                rx.await
                    .unwrap_or_else(|_| Err(ClientError::Internal(REFRESH_ABANDONED.to_string())))
            }
            Role::Leader => {
                let guard = SettleGuard {
                    coordinator: self,
                    settled: false,
                };
                let result = refresh().await;
                guard.settle(&result);
                result
            }
        }
    }

    /// Clear the flag and release every parked request with `result`
    fn settle(&self, result: &Result<String>) {
        let waiters = {
            let mut state = self.state();
            state.in_progress = false;
            std::mem::take(&mut state.queue)
        };

        tracing::debug!(
            queued = waiters.len(),
            success = result.is_ok(),
            "Releasing requests queued behind refresh"
        );
        for waiter in waiters {
            // A waiter whose request was dropped no longer cares
            let _ = waiter.send(result.clone());
        }
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the queue even if the leading future is dropped mid-refresh
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(mut self, result: &Result<String>) {
        self.settled = true;
        self.coordinator.settle(result);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Refresh dropped before completion, rejecting queued requests");
            self.coordinator
                .settle(&Err(ClientError::Internal(REFRESH_ABANDONED.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;
    use crate::events::EventSink;
    use reqwest::{Client, Url};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn coordinator() -> Arc<RefreshCoordinator> {
        let refresher = TokenRefresher::new(
            Client::new(),
            &Url::parse("http://127.0.0.1:9/").unwrap(),
            Arc::new(MemoryTokenStore::new()),
            EventSink::new(),
        )
        .unwrap();
        Arc::new(RefreshCoordinator::new(refresher))
    }

    async fn wait_for_queue(coordinator: &RefreshCoordinator, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.queued() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests never queued");
    }

    /// Spawn `n` callers that all run the same gated refresh
    fn spawn_callers(
        coordinator: &Arc<RefreshCoordinator>,
        n: usize,
        calls: &Arc<AtomicUsize>,
        gate: &Arc<Notify>,
        outcome: Result<String>,
    ) -> Vec<tokio::task::JoinHandle<Result<String>>> {
        (0..n)
            .map(|_| {
                let coordinator = coordinator.clone();
                let calls = calls.clone();
                let gate = gate.clone();
                let outcome = outcome.clone();
                tokio::spawn(async move {
                    coordinator
                        .single_flight(|| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            outcome
                        })
                        .await
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let handles = spawn_callers(&coordinator, 5, &calls, &gate, Ok("A2".to_string()));
        wait_for_queue(&coordinator, 4).await;
        assert!(coordinator.is_refreshing());

        gate.notify_one();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "A2");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiters_are_released_in_arrival_order() {
        let coordinator = coordinator();
        let gate = Arc::new(Notify::new());
        let woke = Arc::new(std::sync::Mutex::new(Vec::new()));

        let leader = {
            let coordinator = coordinator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                coordinator
                    .single_flight(|| async move {
                        gate.notified().await;
                        Ok("A2".to_string())
                    })
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.is_refreshing() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Queue followers one at a time so arrival order is fixed
        let mut followers = Vec::new();
        for index in 0..4 {
            let follower_coordinator = coordinator.clone();
            let woke = woke.clone();
            followers.push(tokio::spawn(async move {
                let token = follower_coordinator
                    .single_flight(|| async { Ok("unused".to_string()) })
                    .await;
                woke.lock().unwrap().push(index);
                token
            }));
            wait_for_queue(&coordinator, index + 1).await;
        }

        gate.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), "A2");
        for follower in followers {
            assert_eq!(follower.await.unwrap().unwrap(), "A2");
        }
        assert_eq!(*woke.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failure_rejects_every_waiter_with_same_error() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let failure = Err(ClientError::SessionExpired("Token is invalid or expired".into()));

        let handles = spawn_callers(&coordinator, 3, &calls, &gate, failure);
        wait_for_queue(&coordinator, 2).await;

        gate.notify_one();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "Token is invalid or expired");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_next_refresh_after_settle_runs_again() {
        let coordinator = coordinator();
        let first = coordinator
            .single_flight(|| async { Ok("A2".to_string()) })
            .await
            .unwrap();
        let second = coordinator
            .single_flight(|| async { Ok("A3".to_string()) })
            .await
            .unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("A2", "A3"));
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_queue() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let handles = spawn_callers(&coordinator, 2, &calls, &gate, Ok("never".into()));
        wait_for_queue(&coordinator, 1).await;

        // The leader is parked on the gate and never settles on its own
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued(), 0);
    }

    #[tokio::test]
    async fn test_follower_sees_abandoned_refresh() {
        let coordinator = coordinator();
        let gate = Arc::new(Notify::new());

        let leader = {
            let coordinator = coordinator.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                coordinator
                    .single_flight(|| async move {
                        gate.notified().await;
                        Ok("never".to_string())
                    })
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.is_refreshing() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let follower = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .single_flight(|| async { Ok("unused".to_string()) })
                    .await
            })
        };
        wait_for_queue(&coordinator, 1).await;

        leader.abort();
        let err = follower.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Internal(_)));
        assert!(!coordinator.is_refreshing());
    }
}
