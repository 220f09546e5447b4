//! Serializes processing runs over the delta buffer.
//!
//! At most one run is in flight. A trigger that arrives during a run arms a
//! single delayed re-check instead of starting a second run; further
//! triggers while the re-check is armed are absorbed.
//!
//! ```text
//!              trigger, buffer non-empty
//!   ┌──────┐ ───────────────────────────► ┌──────────────────┐
//!   │ Idle │                              │ Running (unarmed)│
//!   └──────┘ ◄─────────────────────────── └──────────────────┘
//!      ▲          run finishes                  │ trigger
//!      │                                        ▼
//!      │  timer fires,       ┌───────────┐   ┌──────────────────┐
//!      └──────────────────── │ Recheck   │ ◄─│ Running (armed)  │
//!         buffer empty       │ pending   │   └──────────────────┘
//!                            └───────────┘  run finishes
//! ```
//!
//! When the armed timer fires it disarms and triggers again, so anything
//! that arrived during a run is drained by a later run.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::delta::DeltaBuffer;
use crate::models::Changeset;

/// Consumer of drained batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, changesets: Vec<Changeset>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { recheck_armed: bool },
    /// No run in flight, but the re-check armed during the last one has
    /// not fired yet.
    RecheckPending,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running {
                recheck_armed: false,
            } => write!(f, "running"),
            RunState::Running {
                recheck_armed: true,
            } => write!(f, "running (re-check armed)"),
            RunState::RecheckPending => write!(f, "re-check pending"),
        }
    }
}

/// Counters exposed for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub runs_started: u64,
    pub runs_finished: u64,
    pub rechecks_armed: u64,
}

pub struct RunCoordinator {
    buffer: Arc<DeltaBuffer>,
    handler: Arc<dyn BatchHandler>,
    recheck_delay: Duration,
    state: Mutex<RunState>,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    rechecks_armed: AtomicU64,
}

/// Returns the coordinator to a resting state when a run ends, even if the
/// handler panicked.
struct RunGuard(Arc<RunCoordinator>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.finish_run();
    }
}

impl RunCoordinator {
    pub fn new(
        buffer: Arc<DeltaBuffer>,
        handler: Arc<dyn BatchHandler>,
        recheck_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            handler,
            recheck_delay,
            state: Mutex::new(RunState::Idle),
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            rechecks_armed: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        *self.lock()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            runs_started: self.runs_started.load(Ordering::SeqCst),
            runs_finished: self.runs_finished.load(Ordering::SeqCst),
            rechecks_armed: self.rechecks_armed.load(Ordering::SeqCst),
        }
    }

    /// Start a run or arm a re-check. Never waits for processing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger(self: &Arc<Self>) {
        let mut state = self.lock();
        if self.buffer.is_empty() {
            debug!(state = %*state, "trigger with empty buffer ignored");
            return;
        }

        match *state {
            RunState::Idle | RunState::RecheckPending => {
                let recheck_armed = *state == RunState::RecheckPending;
                *state = RunState::Running { recheck_armed };
                let batch = self.buffer.drain();
                drop(state);
                self.spawn_run(batch);
            }
            RunState::Running {
                recheck_armed: false,
            } => {
                *state = RunState::Running {
                    recheck_armed: true,
                };
                drop(state);
                info!(
                    delay_ms = self.recheck_delay.as_millis() as u64,
                    "run in progress; re-check armed"
                );
                self.spawn_recheck();
            }
            RunState::Running {
                recheck_armed: true,
            } => {
                debug!("run in progress and re-check already armed");
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, batch: Vec<Changeset>) {
        self.runs_started.fetch_add(1, Ordering::SeqCst);
        let guard = RunGuard(Arc::clone(self));
        tokio::spawn(async move {
            let handler = Arc::clone(&guard.0.handler);
            info!(changesets = batch.len(), "processing run started");
            if let Err(e) = handler.handle(batch).await {
                error!(error = %format!("{:#}", e), "processing run failed");
            }
            drop(guard);
        });
    }

    fn spawn_recheck(self: &Arc<Self>) {
        self.rechecks_armed.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.recheck_delay).await;
            this.disarm();
            this.trigger();
        });
    }

    fn disarm(&self) {
        let mut state = self.lock();
        *state = match *state {
            RunState::Running { .. } => RunState::Running {
                recheck_armed: false,
            },
            RunState::RecheckPending | RunState::Idle => RunState::Idle,
        };
    }

    fn finish_run(&self) {
        let mut state = self.lock();
        *state = match *state {
            RunState::Running {
                recheck_armed: true,
            } => RunState::RecheckPending,
            _ => RunState::Idle,
        };
        self.runs_finished.fetch_add(1, Ordering::SeqCst);
        info!(next = %*state, "processing run finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeltaTerm, Triple, DOSSIER_STUK, RDF_TYPE};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn changeset(piece: &str) -> Changeset {
        let term = |v: &str| DeltaTerm {
            kind: "uri".into(),
            value: v.into(),
        };
        Changeset {
            inserts: vec![Triple {
                subject: term(piece),
                predicate: term(RDF_TYPE),
                object: term(DOSSIER_STUK),
                graph: None,
            }],
            deletes: vec![],
        }
    }

    /// Takes `work` per batch and records concurrency.
    #[derive(Default)]
    struct SlowHandler {
        work: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        batches: Mutex<Vec<usize>>,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl BatchHandler for SlowHandler {
        async fn handle(&self, changesets: Vec<Changeset>) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(self.work).await;
            self.batches.lock().unwrap().push(changesets.len());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic {
                panic!("handler blew up");
            }
            if self.fail {
                anyhow::bail!("handler failed");
            }
            Ok(())
        }
    }

    fn setup(handler: Arc<SlowHandler>) -> (Arc<DeltaBuffer>, Arc<RunCoordinator>) {
        let buffer = Arc::new(DeltaBuffer::new());
        let coordinator =
            RunCoordinator::new(Arc::clone(&buffer), handler, Duration::from_millis(1000));
        (buffer, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_buffer_does_not_start_a_run() {
        let handler = Arc::new(SlowHandler::default());
        let (_buffer, coordinator) = setup(handler.clone());

        coordinator.trigger();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(coordinator.state(), RunState::Idle);
        assert_eq!(coordinator.stats(), CoordinatorStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_during_a_run_arm_one_recheck() {
        let handler = Arc::new(SlowHandler {
            work: Duration::from_millis(300),
            ..Default::default()
        });
        let (buffer, coordinator) = setup(handler.clone());

        buffer.push(vec![changeset("http://x/piece/1")]);
        coordinator.trigger();
        assert_eq!(
            coordinator.state(),
            RunState::Running {
                recheck_armed: false
            }
        );

        for n in 2..10 {
            buffer.push(vec![changeset(&format!("http://x/piece/{}", n))]);
            coordinator.trigger();
        }
        assert_eq!(coordinator.stats().rechecks_armed, 1);

        // Run ends before the re-check fires.
        sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.state(), RunState::RecheckPending);

        // Re-check fires and drains the rest in a second run.
        sleep(Duration::from_millis(1000)).await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.state(), RunState::Idle);
        assert!(buffer.is_empty());
        assert_eq!(*handler.batches.lock().unwrap(), vec![1, 8]);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_runs_keep_rechecking_without_overlap() {
        let handler = Arc::new(SlowHandler {
            work: Duration::from_millis(3500),
            ..Default::default()
        });
        let (buffer, coordinator) = setup(handler.clone());

        buffer.push(vec![changeset("http://x/piece/1")]);
        coordinator.trigger();
        buffer.push(vec![changeset("http://x/piece/2")]);
        coordinator.trigger();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(coordinator.state(), RunState::Idle);
        assert_eq!(*handler.batches.lock().unwrap(), vec![1, 1]);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.runs_started, 2);
        assert_eq!(stats.runs_finished, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_returns_to_idle() {
        let handler = Arc::new(SlowHandler {
            work: Duration::from_millis(10),
            fail: true,
            ..Default::default()
        });
        let (buffer, coordinator) = setup(handler.clone());

        buffer.push(vec![changeset("http://x/piece/1")]);
        coordinator.trigger();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.state(), RunState::Idle);

        buffer.push(vec![changeset("http://x/piece/2")]);
        coordinator.trigger();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.stats().runs_finished, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_returns_to_idle() {
        let handler = Arc::new(SlowHandler {
            work: Duration::from_millis(10),
            panic: true,
            ..Default::default()
        });
        let (buffer, coordinator) = setup(handler.clone());

        buffer.push(vec![changeset("http://x/piece/1")]);
        coordinator.trigger();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.state(), RunState::Idle);
        assert_eq!(coordinator.stats().runs_finished, 1);
    }
}
