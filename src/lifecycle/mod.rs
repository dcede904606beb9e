//! Lifecycle controller for mappings and advanced mappings.
//!
//! ```text
//! stopped --start--> starting --ack--> running
//! running --stop--> stopping --ack--> stopped
//! starting|running|stopping --failure--> error
//! error --start--> starting
//! error --stop--> stopping --> stopped
//! ```
//!
//! Simple mappings have no transient states: they go straight from
//! `stopped` or `error` to `running` or `error`, and always end a stop in
//! `stopped`.
//!
//! At most one engine request is in flight per mapping. Engine calls run
//! in detached tasks so a caller that gives up waiting does not abort them.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::db::{
    AdvancedMapping, AuditRecord, EntityKind, Mapping, MappingState, RunState, StateSwap, Store, TestResult,
};
use crate::engine::{Engine, TunnelSpec, TunnelState};
use crate::error::{ConsistencyWarning, Error, Result};

const MODULE: &str = "lifecycle";

/// Bounds on engine round trips.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub test_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Start,
    Stop,
    Test,
}

#[derive(Debug, Clone, Default)]
struct Outcome {
    timed_out: bool,
    test: Option<TestResult>,
}

type Done = watch::Receiver<Option<Outcome>>;

/// Mapping and advanced mapping ids overlap, so slots are keyed by kind too.
type Key = (EntityKind, i64);

struct InFlight {
    op: Operation,
    done: Done,
}

type InFlightTable = Arc<Mutex<HashMap<Key, InFlight>>>;

/// Removes the in-flight entry even if the engine task panics.
struct Release {
    table: InFlightTable,
    key: Key,
}

impl Drop for Release {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.key);
    }
}

/// A reserved in-flight entry. Dropping it unlaunched frees the entry and
/// wakes anyone waiting on it.
struct Slot {
    // Dropped first so waiters woken by `tx` find the entry gone
    release: Release,
    tx: watch::Sender<Option<Outcome>>,
    done: Done,
}

enum Claim {
    Busy(Operation, Done),
    Free(Slot),
}

fn lock(table: &InFlightTable) -> MutexGuard<'_, HashMap<Key, InFlight>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait(mut done: Done) -> Outcome {
    loop {
        if let Some(outcome) = done.borrow_and_update().clone() {
            return outcome;
        }
        if done.changed().await.is_err() {
            return done.borrow().clone().unwrap_or_default();
        }
    }
}

#[derive(Clone)]
pub struct Controller {
    store: Arc<Store>,
    engine: Arc<dyn Engine>,
    config: LifecycleConfig,
    in_flight: InFlightTable,
}

impl Controller {
    pub fn new(store: Arc<Store>, engine: Arc<dyn Engine>, config: LifecycleConfig) -> Self {
        Self {
            store,
            engine,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reset mappings a previous process left mid-transition.
    pub fn recover(&self) -> Result<()> {
        for id in self.store.reset_interrupted()? {
            tracing::warn!("Lifecycle: advanced mapping {} was mid-transition at startup, marked error", id);
        }
        Ok(())
    }

    // --- Advanced mappings ---

    /// Start a stopped or failed mapping and wait for the engine's answer.
    ///
    /// While a start is already in flight the current (`starting`) record is
    /// returned without a second engine request. Engine failures surface as
    /// `runState = error`, not as an `Err`.
    pub async fn start(&self, id: i64, actor: &str) -> Result<AdvancedMapping> {
        loop {
            let slot = match self.claim((EntityKind::AdvancedMapping, id), Operation::Start) {
                Claim::Busy(Operation::Start, _) => {
                    tracing::debug!("Lifecycle: start of advanced mapping {} already in flight", id);
                    return Ok(self.store.get_advanced(id)?);
                }
                Claim::Busy(_, done) => {
                    wait(done).await;
                    continue;
                }
                Claim::Free(slot) => slot,
            };

            let swap = self
                .store
                .swap_run_state(id, &[RunState::Stopped, RunState::Error], RunState::Starting)?;
            if let StateSwap::Unchanged { current } = swap {
                return Err(Error::Precondition(format!("advanced mapping {} is already {}", id, current)));
            }

            let mapping = self.load_claimed(id, RunState::Error)?;
            let this = self.clone();
            let actor = actor.to_string();
            wait(self.launch(slot, async move { this.run_start(mapping, actor).await })).await;
            return Ok(self.store.get_advanced(id)?);
        }
    }

    /// Stop a mapping. Always ends in `stopped`: if the engine fails or does
    /// not answer within the stop bound the mapping is stopped locally and a
    /// consistency warning is logged.
    pub async fn stop(&self, id: i64, actor: &str) -> Result<AdvancedMapping> {
        loop {
            let slot = match self.claim((EntityKind::AdvancedMapping, id), Operation::Stop) {
                Claim::Busy(_, done) => {
                    wait(done).await;
                    continue;
                }
                Claim::Free(slot) => slot,
            };

            let swap = self.store.swap_run_state(
                id,
                &[RunState::Starting, RunState::Running, RunState::Stopping, RunState::Error],
                RunState::Stopping,
            )?;
            if let StateSwap::Unchanged { .. } = swap {
                return Ok(self.store.get_advanced(id)?);
            }

            let mapping = self.load_claimed(id, RunState::Stopped)?;
            let this = self.clone();
            let actor = actor.to_string();
            wait(self.launch(slot, async move { this.run_stop(mapping, actor).await })).await;
            return Ok(self.store.get_advanced(id)?);
        }
    }

    /// Probe the hop chain without touching the run state.
    ///
    /// A failed probe is a normal result. Only a missing answer within the
    /// test bound is an error, and the failed result is recorded first.
    pub async fn test(&self, id: i64, actor: &str) -> Result<TestResult> {
        loop {
            let slot = match self.claim((EntityKind::AdvancedMapping, id), Operation::Test) {
                Claim::Busy(_, done) => {
                    wait(done).await;
                    continue;
                }
                Claim::Free(slot) => slot,
            };

            let mapping = self.store.get_advanced(id)?;
            let this = self.clone();
            let actor = actor.to_string();
            let outcome = wait(self.launch(slot, async move { this.run_test(mapping, actor).await })).await;
            if outcome.timed_out {
                return Err(Error::Timeout(self.config.test_timeout));
            }
            return outcome
                .test
                .ok_or_else(|| Error::Internal(format!("test of advanced mapping {} was interrupted", id)));
        }
    }

    /// Apply a tunnel state change pushed by the engine.
    pub fn on_tunnel_state(&self, id: i64, state: TunnelState, error: Option<&str>) -> Result<()> {
        let (from, reason): (&[RunState], String) = match state {
            TunnelState::Failed => (
                &[RunState::Starting, RunState::Running, RunState::Stopping][..],
                error.unwrap_or("engine reported a tunnel failure").to_string(),
            ),
            TunnelState::Down => (
                &[RunState::Running][..],
                error.unwrap_or("tunnel went down unexpectedly").to_string(),
            ),
            TunnelState::Up => {
                tracing::debug!("Lifecycle: engine reports advanced mapping {} up", id);
                return Ok(());
            }
        };

        let record = AuditRecord::warning(
            MODULE,
            "engine",
            "failure",
            format!("advanced mapping {} failed: {}", id, reason),
        );
        if let StateSwap::Applied { previous } = self.store.swap_run_state_audited(id, from, RunState::Error, &record)? {
            tracing::warn!("Lifecycle: advanced mapping {} {} -> error: {}", id, previous, reason);
        }
        Ok(())
    }

    // --- Simple mappings ---

    /// Start a stopped or failed mapping and wait for the engine's answer.
    /// Engine failures surface as `runState = error`.
    pub async fn start_mapping(&self, id: i64, actor: &str) -> Result<Mapping> {
        loop {
            let slot = match self.claim((EntityKind::Mapping, id), Operation::Start) {
                Claim::Busy(Operation::Start, done) => {
                    tracing::debug!("Lifecycle: start of mapping {} already in flight", id);
                    wait(done).await;
                    return Ok(self.store.get_mapping(id)?);
                }
                Claim::Busy(_, done) => {
                    wait(done).await;
                    continue;
                }
                Claim::Free(slot) => slot,
            };

            let mapping = self.store.get_mapping(id)?;
            if mapping.run_state == MappingState::Running {
                return Err(Error::Precondition(format!("mapping {} is already running", id)));
            }

            let this = self.clone();
            let actor = actor.to_string();
            wait(self.launch(slot, async move { this.run_start_mapping(mapping, actor).await })).await;
            return Ok(self.store.get_mapping(id)?);
        }
    }

    /// Stop a mapping. Like advanced mappings it always ends in `stopped`.
    pub async fn stop_mapping(&self, id: i64, actor: &str) -> Result<Mapping> {
        loop {
            let slot = match self.claim((EntityKind::Mapping, id), Operation::Stop) {
                Claim::Busy(_, done) => {
                    wait(done).await;
                    continue;
                }
                Claim::Free(slot) => slot,
            };

            let mapping = self.store.get_mapping(id)?;
            if mapping.run_state == MappingState::Stopped {
                return Ok(mapping);
            }

            let this = self.clone();
            let actor = actor.to_string();
            wait(self.launch(slot, async move { this.run_stop_mapping(mapping, actor).await })).await;
            return Ok(self.store.get_mapping(id)?);
        }
    }

    // --- Internals ---

    /// Reserve the in-flight entry for `key`. The lock is held only for the
    /// table lookup; callers do their store work after claiming.
    fn claim(&self, key: Key, op: Operation) -> Claim {
        let mut table = lock(&self.in_flight);
        if let Some(pending) = table.get(&key) {
            return Claim::Busy(pending.op, pending.done.clone());
        }

        let (tx, done) = watch::channel(None);
        table.insert(key, InFlight { op, done: done.clone() });
        Claim::Free(Slot {
            release: Release {
                table: self.in_flight.clone(),
                key,
            },
            tx,
            done,
        })
    }

    /// Fetch the record after a successful claim. If it vanished, put the
    /// state back so the mapping is not stuck.
    fn load_claimed(&self, id: i64, fallback: RunState) -> Result<AdvancedMapping> {
        match self.store.get_advanced(id) {
            Ok(mapping) => Ok(mapping),
            Err(e) => {
                let _ = self
                    .store
                    .swap_run_state(id, &[RunState::Starting, RunState::Stopping], fallback);
                Err(e.into())
            }
        }
    }

    fn launch<F>(&self, slot: Slot, work: F) -> Done
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let Slot { release, tx, done } = slot;
        tokio::spawn(async move {
            let outcome = work.await;
            drop(release);
            let _ = tx.send(Some(outcome));
        });
        done
    }

    /// Ask the engine to build a tunnel. Returns whether the deadline passed
    /// and the failure reason, if any.
    async fn engine_start(&self, spec: &TunnelSpec) -> (bool, Option<String>) {
        match tokio::time::timeout(self.config.start_timeout, self.engine.start_tunnel(spec)).await {
            Ok(Ok(())) => (false, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (true, Some(Error::Timeout(self.config.start_timeout).to_string())),
        }
    }

    /// Ask the engine to tear a tunnel down. Any failure becomes a
    /// consistency warning since the caller stops locally regardless.
    async fn engine_stop(&self, spec: &TunnelSpec, subject: String) -> (bool, Option<ConsistencyWarning>) {
        match tokio::time::timeout(self.config.stop_timeout, self.engine.stop_tunnel(spec)).await {
            Ok(Ok(())) => (false, None),
            Ok(Err(e)) => (
                false,
                Some(ConsistencyWarning {
                    subject,
                    detail: format!("engine did not confirm stop ({}); marked stopped locally", e),
                }),
            ),
            Err(_) => (
                true,
                Some(ConsistencyWarning {
                    subject,
                    detail: format!(
                        "engine did not answer within {:?}; marked stopped locally",
                        self.config.stop_timeout
                    ),
                }),
            ),
        }
    }

    async fn run_start(&self, mapping: AdvancedMapping, actor: String) -> Outcome {
        let spec = TunnelSpec::from(&mapping);
        let started = Instant::now();
        tracing::info!("Lifecycle: starting advanced mapping {} over {} hop(s)", mapping.id, spec.hops.len());

        let (timed_out, failure) = self.engine_start(&spec).await;
        match failure {
            None => {
                tracing::info!(
                    "Lifecycle: advanced mapping {} running after {:?}",
                    mapping.id,
                    started.elapsed()
                );
                self.transition(
                    mapping.id,
                    RunState::Starting,
                    RunState::Running,
                    AuditRecord::info(MODULE, &actor, "start", format!("started advanced mapping {} '{}'", mapping.id, mapping.name)),
                );
            }
            Some(reason) => {
                tracing::warn!("Lifecycle: advanced mapping {} failed to start: {}", mapping.id, reason);
                self.transition(
                    mapping.id,
                    RunState::Starting,
                    RunState::Error,
                    AuditRecord::warning(
                        MODULE,
                        &actor,
                        "start",
                        format!("advanced mapping {} '{}' failed to start: {}", mapping.id, mapping.name, reason),
                    ),
                );
            }
        }

        Outcome { timed_out, test: None }
    }

    async fn run_stop(&self, mapping: AdvancedMapping, actor: String) -> Outcome {
        let spec = TunnelSpec::from(&mapping);
        let (timed_out, warning) = self.engine_stop(&spec, format!("advanced mapping {}", mapping.id)).await;

        let record = match &warning {
            None => {
                tracing::info!("Lifecycle: advanced mapping {} stopped", mapping.id);
                AuditRecord::info(MODULE, &actor, "stop", format!("stopped advanced mapping {} '{}'", mapping.id, mapping.name))
            }
            Some(warning) => {
                tracing::warn!("Lifecycle: {}", warning);
                AuditRecord::warning(MODULE, &actor, "stop", warning.to_string())
            }
        };
        self.transition(mapping.id, RunState::Stopping, RunState::Stopped, record);

        Outcome { timed_out, test: None }
    }

    async fn run_start_mapping(&self, mapping: Mapping, actor: String) -> Outcome {
        let spec = TunnelSpec::from(&mapping);
        tracing::info!("Lifecycle: starting mapping {} on node {}", mapping.id, mapping.node);

        let (timed_out, failure) = self.engine_start(&spec).await;
        let (state, record) = match failure {
            None => {
                tracing::info!("Lifecycle: mapping {} running", mapping.id);
                (
                    MappingState::Running,
                    AuditRecord::info(MODULE, &actor, "start", format!("started mapping {}", mapping.id)),
                )
            }
            Some(reason) => {
                tracing::warn!("Lifecycle: mapping {} failed to start: {}", mapping.id, reason);
                (
                    MappingState::Error,
                    AuditRecord::warning(
                        MODULE,
                        &actor,
                        "start",
                        format!("mapping {} failed to start: {}", mapping.id, reason),
                    ),
                )
            }
        };
        self.record_mapping(mapping.id, state, &record);

        Outcome { timed_out, test: None }
    }

    async fn run_stop_mapping(&self, mapping: Mapping, actor: String) -> Outcome {
        let spec = TunnelSpec::from(&mapping);
        let (timed_out, warning) = self.engine_stop(&spec, format!("mapping {}", mapping.id)).await;

        let record = match &warning {
            None => {
                tracing::info!("Lifecycle: mapping {} stopped", mapping.id);
                AuditRecord::info(MODULE, &actor, "stop", format!("stopped mapping {}", mapping.id))
            }
            Some(warning) => {
                tracing::warn!("Lifecycle: {}", warning);
                AuditRecord::warning(MODULE, &actor, "stop", warning.to_string())
            }
        };
        self.record_mapping(mapping.id, MappingState::Stopped, &record);

        Outcome { timed_out, test: None }
    }

    async fn run_test(&self, mapping: AdvancedMapping, actor: String) -> Outcome {
        let spec = TunnelSpec::from(&mapping);
        let probe = tokio::time::timeout(self.config.test_timeout, self.engine.probe(&spec)).await;

        let (result, timed_out) = match probe {
            Ok(Ok(latency_ms)) => (
                TestResult {
                    success: true,
                    tested_at: Utc::now(),
                    latency_ms: Some(latency_ms),
                    error: None,
                },
                false,
            ),
            Ok(Err(e)) => (
                TestResult {
                    success: false,
                    tested_at: Utc::now(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
                false,
            ),
            Err(_) => (
                TestResult {
                    success: false,
                    tested_at: Utc::now(),
                    latency_ms: None,
                    error: Some(Error::Timeout(self.config.test_timeout).to_string()),
                },
                true,
            ),
        };

        if let Err(e) = self.store.record_test_result(mapping.id, &result) {
            tracing::error!("Lifecycle: failed to record test of advanced mapping {}: {}", mapping.id, e);
        }

        let record = if result.success {
            AuditRecord::info(
                MODULE,
                &actor,
                "test",
                format!("advanced mapping {} answered in {} ms", mapping.id, result.latency_ms.unwrap_or(0)),
            )
        } else {
            AuditRecord::warning(
                MODULE,
                &actor,
                "test",
                format!(
                    "advanced mapping {} test failed: {}",
                    mapping.id,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            )
        };
        if let Err(e) = self.store.append_audit(&record) {
            tracing::error!("Lifecycle: failed to audit test of advanced mapping {}: {}", mapping.id, e);
        }

        Outcome {
            timed_out,
            test: Some(result),
        }
    }

    /// Compare-and-set from a background task. Errors can only be logged here.
    fn transition(&self, id: i64, from: RunState, to: RunState, record: AuditRecord) {
        match self.store.swap_run_state_audited(id, &[from], to, &record) {
            Ok(StateSwap::Applied { .. }) => {}
            Ok(StateSwap::Unchanged { current }) => {
                tracing::debug!(
                    "Lifecycle: advanced mapping {} is {} (expected {}), not moving to {}",
                    id,
                    current,
                    from,
                    to
                );
            }
            Err(e) => {
                tracing::error!("Lifecycle: failed to move advanced mapping {} to {}: {}", id, to, e);
            }
        }
    }

    fn record_mapping(&self, id: i64, state: MappingState, record: &AuditRecord) {
        match self.store.record_mapping_state(id, state, record) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Lifecycle: mapping {} vanished before it could become {}", id, state),
            Err(e) => tracing::error!("Lifecycle: failed to move mapping {} to {}: {}", id, state, e),
        }
    }
}
