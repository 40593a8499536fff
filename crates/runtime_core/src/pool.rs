//! Acquire/release lifecycle for the isolate pool, §4.1.
//!
//! Isolates are warmed up eagerly to `base_size`, grown on demand up to
//! `max_isolates`, and handed out FIFO-fair under saturation. A corrupted
//! isolate is discarded immediately on release; a background task tops the
//! pool back up without making the caller that discovered the corruption
//! wait for it. Idle isolates beyond `base_size` are reaped after sitting
//! unused for `idle_timeout`.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rt_errors::RuntimeError;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{config::EngineConfig, isolate::Isolate};

pub type IsolateId = u64;

/// Snapshot of pool occupancy, §3.1 expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub total: u64,
    pub available: u64,
    pub active: u64,
    pub corrupted: u64,
    pub created: u64,
    pub destroyed: u64,
}

struct IdleEntry {
    id: IsolateId,
    isolate: Box<Isolate>,
    since: Instant,
}

type WaiterSlot = Option<(IsolateId, Box<Isolate>)>;

struct State {
    idle: VecDeque<IdleEntry>,
    waiters: VecDeque<oneshot::Sender<WaiterSlot>>,
    total: u64,
    active: u64,
    corrupted: u64,
    created: u64,
    destroyed: u64,
    shutting_down: bool,
}

pub struct IsolatePool {
    state: Mutex<State>,
    next_id: AtomicU64,
    base_size: usize,
    max_isolates: usize,
    memory_limit_per_isolate: usize,
    idle_timeout: Duration,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IsolatePool {
    /// Creates `config.base_size` isolates in parallel and starts the
    /// background idle reaper. Acquire does not block on warm-up past the
    /// first ready isolate: a warm-up failure is logged and retried lazily
    /// on the next `acquire` rather than failing construction.
    pub async fn new(config: &EngineConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            state: Mutex::new(State {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
                active: 0,
                corrupted: 0,
                created: 0,
                destroyed: 0,
                shutting_down: false,
            }),
            next_id: AtomicU64::new(1),
            base_size: config.base_size,
            max_isolates: config.max_isolates,
            memory_limit_per_isolate: config.memory_limit_per_isolate,
            idle_timeout: config.idle_timeout,
            reaper: Mutex::new(None),
        });

        let mut joins = Vec::with_capacity(pool.base_size);
        for _ in 0..pool.base_size {
            let memory_limit = pool.memory_limit_per_isolate;
            joins.push(tokio::task::spawn_blocking(move || Isolate::new(memory_limit)));
        }
        for join in joins {
            match join.await {
                Ok(Ok(isolate)) => {
                    let id = pool.next_id.fetch_add(1, Ordering::Relaxed);
                    let mut state = pool.state.lock();
                    state.total += 1;
                    state.created += 1;
                    state.idle.push_back(IdleEntry {
                        id,
                        isolate: Box::new(isolate),
                        since: Instant::now(),
                    });
                },
                Ok(Err(error)) => warn!(%error, "isolate warm-up failed, will retry on first acquire"),
                Err(error) => warn!(%error, "isolate warm-up task panicked"),
            }
        }

        pool.spawn_reaper();
        pool
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let tick_period = (self.idle_timeout / 4).max(Duration::from_millis(50));
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_period);
            loop {
                tick.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                let mut reaped = Vec::new();
                {
                    let mut state = pool.state.lock();
                    if state.shutting_down {
                        break;
                    }
                    let now = Instant::now();
                    while state.total as usize > pool.base_size {
                        let Some(front) = state.idle.front() else { break };
                        if now.duration_since(front.since) < pool.idle_timeout {
                            break;
                        }
                        let entry = state.idle.pop_front().expect("checked by front() above");
                        state.total -= 1;
                        state.destroyed += 1;
                        reaped.push(entry.isolate);
                    }
                }
                drop(reaped);
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// `acquire(deadline)` from §4.1: an idle isolate if one exists, else
    /// grow synchronously under `max_isolates`, else join the FIFO wait
    /// queue until a release or `deadline_at` elapses. Takes an absolute
    /// deadline so callers can share one budget across acquire and the call
    /// that follows it (§8 Property 9, wall-clock bound).
    pub async fn acquire(self: &Arc<Self>, deadline_at: Instant) -> Result<LeasedIsolate, RuntimeError> {
        loop {
            enum Step {
                Got(IsolateId, Box<Isolate>),
                Grow,
                Wait(oneshot::Receiver<WaiterSlot>),
                Refused,
            }

            let step = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    Step::Refused
                } else if let Some(entry) = state.idle.pop_front() {
                    state.active += 1;
                    Step::Got(entry.id, entry.isolate)
                } else if (state.total as usize) < self.max_isolates {
                    state.total += 1;
                    state.active += 1;
                    Step::Grow
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Step::Wait(rx)
                }
            };

            match step {
                Step::Refused => return Err(RuntimeError::internal("pool is shutting down")),
                Step::Got(id, isolate) => return Ok(LeasedIsolate::new(self.clone(), id, isolate)),
                Step::Grow => {
                    let memory_limit = self.memory_limit_per_isolate;
                    let created = tokio::task::spawn_blocking(move || Isolate::new(memory_limit)).await;
                    match created {
                        Ok(Ok(isolate)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            self.state.lock().created += 1;
                            return Ok(LeasedIsolate::new(self.clone(), id, Box::new(isolate)));
                        },
                        Ok(Err(error)) => {
                            let mut state = self.state.lock();
                            state.total -= 1;
                            state.active -= 1;
                            warn!(%error, "isolate construction failed on acquire");
                            return Err(RuntimeError::ResourceExhausted);
                        },
                        Err(error) => {
                            let mut state = self.state.lock();
                            state.total -= 1;
                            state.active -= 1;
                            warn!(%error, "isolate construction task panicked on acquire");
                            return Err(RuntimeError::ResourceExhausted);
                        },
                    }
                },
                Step::Wait(rx) => {
                    let remaining = deadline_at.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, rx).await {
                        Ok(Ok(Some((id, isolate)))) => return Ok(LeasedIsolate::new(self.clone(), id, isolate)),
                        Ok(Ok(None)) => return Err(RuntimeError::internal("pool shut down while waiting")),
                        // Sender was dropped without a handoff (shouldn't
                        // happen outside shutdown); retry from the top.
                        Ok(Err(_)) => continue,
                        Err(_) => return Err(RuntimeError::ResourceExhausted),
                    }
                },
            }
        }
    }

    /// Implements `release(isolate, status)`. Exposed through
    /// [`LeasedIsolate::release`] rather than directly, so every call site
    /// threads the isolate id through the same path whether released
    /// explicitly or reclaimed on drop.
    fn finish(self: &Arc<Self>, id: IsolateId, isolate: Box<Isolate>, corrupted: bool) {
        let mut state = self.state.lock();
        state.active -= 1;
        if corrupted {
            state.total -= 1;
            state.destroyed += 1;
            state.corrupted += 1;
            drop(state);
            self.spawn_topup();
            return;
        }

        let mut slot: WaiterSlot = Some((id, isolate));
        while let Some(tx) = state.waiters.pop_front() {
            match tx.send(slot.take().expect("loop only re-enters with Some")) {
                Ok(()) => {
                    // Handed directly to a new active lease; no idle state
                    // to touch, but the handoff keeps one caller active.
                    state.active += 1;
                    return;
                },
                Err(returned) => {
                    slot = returned;
                    continue;
                },
            }
        }
        if let Some((id, isolate)) = slot {
            state.idle.push_back(IdleEntry {
                id,
                isolate,
                since: Instant::now(),
            });
        }
    }

    fn spawn_topup(self: &Arc<Self>) {
        if self.state.lock().shutting_down {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let memory_limit = pool.memory_limit_per_isolate;
            match tokio::task::spawn_blocking(move || Isolate::new(memory_limit)).await {
                Ok(Ok(isolate)) => {
                    let id = pool.next_id.fetch_add(1, Ordering::Relaxed);
                    let mut state = pool.state.lock();
                    if state.shutting_down {
                        return;
                    }
                    state.total += 1;
                    state.created += 1;
                    state.idle.push_back(IdleEntry {
                        id,
                        isolate: Box::new(isolate),
                        since: Instant::now(),
                    });
                },
                Ok(Err(error)) => warn!(%error, "background isolate top-up failed, will retry on next acquire"),
                Err(error) => warn!(%error, "top-up task panicked"),
            }
        });
    }

    /// Refuses new acquires, waits up to `grace` for in-flight leases to be
    /// released, then disposes whatever is left idle.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            for tx in state.waiters.drain(..) {
                let _ = tx.send(None);
            }
        }
        let deadline = Instant::now() + grace;
        loop {
            if self.state.lock().active == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        let disposed = state.idle.len() as u64;
        state.idle.clear();
        state.destroyed += disposed;
        state.total = state.total.saturating_sub(disposed);
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            total: state.total,
            available: state.idle.len() as u64,
            active: state.active,
            corrupted: state.corrupted,
            created: state.created,
            destroyed: state.destroyed,
        }
    }
}

/// An isolate currently leased out of the pool. `release` must be called
/// exactly once with the correct health status; dropping without releasing
/// is treated as `corrupted`, since an isolate whose fate is unknown cannot
/// be safely reused.
pub struct LeasedIsolate {
    pool: Arc<IsolatePool>,
    id: IsolateId,
    isolate: Option<Box<Isolate>>,
}

impl LeasedIsolate {
    fn new(pool: Arc<IsolatePool>, id: IsolateId, isolate: Box<Isolate>) -> Self {
        Self {
            pool,
            id,
            isolate: Some(isolate),
        }
    }

    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn isolate_mut(&mut self) -> &mut Isolate {
        self.isolate.as_mut().expect("isolate taken before release")
    }

    /// `release(isolate, status)` from §4.1. `corrupted` should be `true`
    /// whenever the call hit `Timeout`, `MemoryLimit`, or a native bridge
    /// panic (§7 "Propagation policy").
    pub fn release(mut self, corrupted: bool) {
        if let Some(isolate) = self.isolate.take() {
            self.pool.finish(self.id, isolate, corrupted);
        }
    }
}

impl Drop for LeasedIsolate {
    fn drop(&mut self) {
        if let Some(isolate) = self.isolate.take() {
            self.pool.finish(self.id, isolate, true);
        }
    }
}
