//! Cache Invalidation Listener, §4.7: a single persistent subscription to
//! configuration-database change notifications, debounced per derived key
//! and delivered to a callback exactly once per quiescent key.
//!
//! The grounding codebase's connection-retry loops (e.g.
//! `node_executor::Executor::invoke_analyze`) shape this module's reconnect
//! loop: fail, back off, retry, indefinitely, logging every failure rather
//! than giving up. Here the retry driver is the `backoff` crate directly
//! rather than the grounding codebase's own `common::backoff::Backoff`
//! wrapper, since that wrapper lives in a crate this workspace does not
//! carry over.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One row-change notification from the configuration database, §4.7.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct InvalidationPayload {
    pub table: String,
    pub function_id: Option<String>,
    pub project_id: Option<String>,
}

impl InvalidationPayload {
    /// The derived debounce key for this notification's table, §4.7.
    fn debounce_key(&self) -> Option<String> {
        match self.table.as_str() {
            "function_environment_variables" => {
                Some(format!("fenv:{}", self.function_id.as_deref().unwrap_or_default()))
            },
            "project_network_policies" => {
                Some(format!("pproj:{}", self.project_id.as_deref().unwrap_or_default()))
            },
            "global_network_policies" => Some("global".to_string()),
            _ => None,
        }
    }
}

/// Abstraction over "a subscription to configuration-change notifications",
/// so the listener is testable without a real Postgres `LISTEN/NOTIFY`
/// channel. A production implementation backs this with a dedicated
/// `tokio-postgres` connection subscribed to one channel.
#[async_trait::async_trait]
pub trait NotificationSource: Send + Sync {
    /// Opens (or reopens) the subscription and returns a channel of
    /// payloads. Returns an error if the connection could not be
    /// established; the listener retries with backoff.
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<InvalidationPayload>>;
}

#[async_trait::async_trait]
impl NotificationSource for Box<dyn NotificationSource> {
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<InvalidationPayload>> {
        (**self).subscribe().await
    }
}

type Callback = Arc<dyn Fn(InvalidationPayload) + Send + Sync>;

struct DebounceTimers {
    handles: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// Drives one `NotificationSource` subscription for the lifetime of the
/// engine, debouncing notifications per derived key and invoking `callback`
/// once per quiescent key.
pub struct CacheInvalidationListener {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    driver: tokio::task::JoinHandle<()>,
    timers: Arc<Mutex<DebounceTimers>>,
}

impl CacheInvalidationListener {
    /// Spawns the background driver task. `debounce` is the quiet period
    /// before a coalesced notification fires (~100ms per §4.7).
    pub fn spawn<S>(source: S, debounce: Duration, callback: impl Fn(InvalidationPayload) + Send + Sync + 'static) -> Self
    where
        S: NotificationSource + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let timers = Arc::new(Mutex::new(DebounceTimers { handles: HashMap::new() }));
        let callback: Callback = Arc::new(callback);
        let driver = tokio::spawn(Self::run(Arc::new(source), debounce, callback, timers.clone(), stop_rx));
        Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            driver,
            timers,
        }
    }

    async fn run<S>(
        source: Arc<S>,
        debounce: Duration,
        callback: Callback,
        timers: Arc<Mutex<DebounceTimers>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) where
        S: NotificationSource + 'static,
    {
        let mut retry = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let mut rx = loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    subscribed = source.subscribe() => match subscribed {
                        Ok(rx) => {
                            retry.reset();
                            break rx;
                        },
                        Err(error) => {
                            let wait = retry.next_backoff().unwrap_or(Duration::from_secs(30));
                            warn!(%error, ?wait, "invalidation listener failed to subscribe, retrying");
                            tokio::select! {
                                _ = &mut stop_rx => return,
                                _ = tokio::time::sleep(wait) => {},
                            }
                        },
                    },
                }
            };

            info!("invalidation listener connected");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    next = rx.recv() => match next {
                        Some(payload) => Self::arm(&timers, debounce, callback.clone(), payload),
                        None => {
                            warn!("invalidation listener connection dropped, reconnecting");
                            break;
                        },
                    },
                }
            }
        }
    }

    fn arm(timers: &Arc<Mutex<DebounceTimers>>, debounce: Duration, callback: Callback, payload: InvalidationPayload) {
        let Some(key) = payload.debounce_key() else {
            return;
        };
        let mut guard = timers.lock();
        if let Some(existing) = guard.handles.remove(&key) {
            existing.abort();
        }
        let key_for_task = key.clone();
        let timers_for_task = timers.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            timers_for_task.lock().handles.remove(&key_for_task);
            debug!(key = %key_for_task, table = %payload.table, "debounce timer fired");
            callback(payload);
        });
        guard.handles.insert(key, handle);
    }

    /// Cancels pending timers and stops the driver, idempotently.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let mut guard = self.timers.lock();
        for (_, handle) in guard.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for CacheInvalidationListener {
    fn drop(&mut self) {
        self.stop();
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    struct FixedSource {
        rx: AsyncMutex<Option<mpsc::UnboundedReceiver<InvalidationPayload>>>,
    }

    #[async_trait::async_trait]
    impl NotificationSource for FixedSource {
        async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<InvalidationPayload>> {
            self.rx
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow::anyhow!("already subscribed"))
        }
    }

    #[tokio::test]
    async fn debounces_repeated_notifications_for_same_key() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = FixedSource { rx: AsyncMutex::new(Some(rx)) };
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let listener = CacheInvalidationListener::spawn(source, Duration::from_millis(20), move |_payload| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let payload = InvalidationPayload {
            table: "function_environment_variables".to_string(),
            function_id: Some("fn1".to_string()),
            project_id: None,
        };
        for _ in 0..5 {
            tx.send(payload.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        listener.stop();
    }

    #[tokio::test]
    async fn distinct_keys_fire_independently() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = FixedSource { rx: AsyncMutex::new(Some(rx)) };
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let listener = CacheInvalidationListener::spawn(source, Duration::from_millis(10), move |_payload| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(InvalidationPayload {
            table: "function_environment_variables".to_string(),
            function_id: Some("fn1".to_string()),
            project_id: None,
        })
        .unwrap();
        tx.send(InvalidationPayload {
            table: "function_environment_variables".to_string(),
            function_id: Some("fn2".to_string()),
            project_id: None,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        listener.stop();
    }

    #[tokio::test]
    async fn unrecognized_table_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = FixedSource { rx: AsyncMutex::new(Some(rx)) };
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let listener = CacheInvalidationListener::spawn(source, Duration::from_millis(10), move |_payload| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(InvalidationPayload {
            table: "unrelated_table".to_string(),
            function_id: None,
            project_id: None,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        listener.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_tx, rx) = mpsc::unbounded_channel::<InvalidationPayload>();
        let source = FixedSource { rx: AsyncMutex::new(Some(rx)) };
        let listener = CacheInvalidationListener::spawn(source, Duration::from_millis(10), |_| {});
        listener.stop();
        listener.stop();
    }
}
