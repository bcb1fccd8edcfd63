//! Fault Tolerance Manager
//!
//! Consumes failure signals and drives every node through
//! `healthy → failing → {retrying | quarantined} → healthy`.
//!
//! ## Concurrency
//! - Signals arrive through [`FaultToleranceManager::report_failure`], which never blocks: each
//!   node has its own unbounded lane drained by a dedicated worker, so signals for one node
//!   are handled in arrival order while different nodes proceed concurrently.
//! - Failure handling, retries and quarantine release for a node all take that node's async
//!   mutex. DashMap guards are only held for short synchronous updates, never across an
//!   `.await`.
//! - At most one timer (retry or quarantine release) is pending per node. Scheduling a new
//!   one aborts the previous.

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::pattern::FailurePattern;
use super::replication::{ReplicationGroup, ReplicationManager};
use super::types::*;
use crate::clock::now_ms;
use crate::config::FaultConfig;
use crate::error::GridError;
use crate::events::bus::EventBus;
use crate::events::types::GridEvent;
use crate::probe::{Probe, probe_with_timeout};
use crate::registry::service::NodeRegistry;
use crate::registry::types::{NodeId, NodeStatus};
use crate::tasks::service::TaskService;
use crate::tasks::types::{NewTask, TaskFilter, TaskRecord, TaskStatus};

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    Retry,
    ReleaseQuarantine { until: u64 },
}

pub struct FaultToleranceManager {
    registry: Arc<NodeRegistry>,
    tasks: Arc<dyn TaskService>,
    probe: Arc<dyn Probe>,
    events: Arc<EventBus>,
    config: FaultConfig,

    states: DashMap<NodeId, NodeHealthState>,
    patterns: DashMap<NodeId, FailurePattern>,
    checkpoints: CheckpointStore,
    replication: ReplicationManager,

    node_locks: DashMap<NodeId, Arc<Mutex<()>>>,
    lanes: DashMap<NodeId, mpsc::UnboundedSender<FailureSignal>>,
    pending_timers: DashMap<NodeId, (u64, JoinHandle<()>)>,
    timer_generation: AtomicU64,

    counters: FaultCounters,
    self_ref: Weak<Self>,
}

impl FaultToleranceManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        tasks: Arc<dyn TaskService>,
        probe: Arc<dyn Probe>,
        events: Arc<EventBus>,
        config: FaultConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry,
            tasks,
            probe,
            events,
            checkpoints: CheckpointStore::new(config.checkpoint_capacity),
            replication: ReplicationManager::new(config.replication_factor),
            config,
            states: DashMap::new(),
            patterns: DashMap::new(),
            node_locks: DashMap::new(),
            lanes: DashMap::new(),
            pending_timers: DashMap::new(),
            timer_generation: AtomicU64::new(0),
            counters: FaultCounters::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Spawns the checkpoint sweep and the recovery safety-net scan.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let checkpoint_handle = {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.checkpoint_loop().await;
            })
        };

        let scan_handle = {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.recovery_scan_loop().await;
            })
        };

        tracing::info!(
            "Fault tolerance manager started (checkpoints every {} ms, recovery scan every {} ms)",
            self.config.checkpoint_interval_ms,
            self.config.recovery_scan_interval_ms
        );

        vec![checkpoint_handle, scan_handle]
    }

    /// Drops every failure lane and aborts pending timers.
    pub fn shutdown(&self) {
        self.lanes.clear();
        let pending: Vec<NodeId> = self.pending_timers.iter().map(|e| e.key().clone()).collect();
        for node_id in pending {
            self.cancel_pending_timer(&node_id);
        }
        tracing::info!("Fault tolerance manager stopped");
    }

    async fn checkpoint_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.checkpoint_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.create_checkpoints_at(now_ms()).await;
        }
    }

    async fn recovery_scan_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.recovery_scan_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.run_recovery_scan_at(now_ms()).await;
        }
    }

    // ------------------------------------------------------------
    // Node tracking
    // ------------------------------------------------------------

    pub fn track_node(&self, node_id: &NodeId, now: u64) {
        self.states
            .entry(node_id.clone())
            .or_insert_with(|| NodeHealthState::new(node_id.clone(), now));
    }

    /// Starts a (re-)registered node from a clean health state: counters, quarantine,
    /// exhaustion, failure pattern and any pending timer are dropped. No event is published.
    pub async fn reset_node_state(&self, node_id: &NodeId, now: u64) {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;

        self.cancel_pending_timer(node_id);
        self.patterns.remove(node_id);
        let previous = self
            .states
            .insert(node_id.clone(), NodeHealthState::new(node_id.clone(), now));

        if let Some(previous) = previous
            && (previous.is_failing() || previous.is_quarantined || previous.recovery_exhausted)
        {
            tracing::info!(
                "Node {} re-registered, cleared {} failure(s) and {} recovery attempt(s)",
                node_id,
                previous.failure_count,
                previous.recovery_attempts
            );
        }
    }

    pub fn record_heartbeat(&self, node_id: &NodeId, utilization: f64, now: u64) {
        let mut state = self
            .states
            .entry(node_id.clone())
            .or_insert_with(|| NodeHealthState::new(node_id.clone(), now));
        state.last_heartbeat = now;
        state.utilization = utilization;
    }

    /// Removes all per-node state. Used when the registry deactivates a node.
    pub fn forget(&self, node_id: &NodeId) {
        self.cancel_pending_timer(node_id);
        self.lanes.remove(node_id);
        self.states.remove(node_id);
        self.patterns.remove(node_id);
        self.node_locks.remove(node_id);

        if self.config.enable_replication
            && let Some(manager) = self.self_ref.upgrade()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let node_id = node_id.clone();
            runtime.spawn(async move {
                manager.remove_node_from_groups(&node_id).await;
            });
        }

        tracing::debug!("Forgot fault state of node {}", node_id);
    }

    fn node_lock(&self, node_id: &NodeId) -> Arc<Mutex<()>> {
        self.node_locks.entry(node_id.clone()).or_default().clone()
    }

    // ------------------------------------------------------------
    // Failure intake
    // ------------------------------------------------------------

    /// Queues a failure signal onto the node's lane.
    pub fn enqueue_failure(&self, signal: FailureSignal) {
        let node_id = signal.node_id.clone();

        let Some(sender) = self.lane_sender(&node_id) else {
            tracing::warn!("No runtime to handle failure of node {}, signal dropped", node_id);
            return;
        };

        if let Err(mpsc::error::SendError(signal)) = sender.send(signal) {
            // Lane worker exited; start a fresh one.
            self.lanes.remove(&node_id);
            if let Some(sender) = self.lane_sender(&node_id)
                && sender.send(signal).is_err()
            {
                tracing::warn!("Failure lane of node {} closed, signal dropped", node_id);
            }
        }
    }

    fn lane_sender(&self, node_id: &NodeId) -> Option<mpsc::UnboundedSender<FailureSignal>> {
        if let Some(sender) = self.lanes.get(node_id) {
            return Some(sender.clone());
        }

        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let sender = self
            .lanes
            .entry(node_id.clone())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<FailureSignal>();
                let manager = self.self_ref.clone();
                runtime.spawn(async move {
                    while let Some(signal) = rx.recv().await {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager
                            .handle_node_failure_at(
                                &signal.node_id,
                                signal.failure_type,
                                signal.error,
                                signal.timestamp,
                            )
                            .await;
                    }
                });
                tx
            })
            .clone();
        Some(sender)
    }

    pub async fn handle_node_failure(
        &self,
        node_id: &NodeId,
        failure_type: FailureType,
        error: Option<String>,
    ) -> RecoveryStrategy {
        self.handle_node_failure_at(node_id, failure_type, error, now_ms())
            .await
    }

    /// Records the failure, takes the node offline, recovers its running tasks, repairs its
    /// replication groups and starts the recovery strategy. Returns the chosen strategy.
    pub async fn handle_node_failure_at(
        &self,
        node_id: &NodeId,
        failure_type: FailureType,
        error: Option<String>,
        now: u64,
    ) -> RecoveryStrategy {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;

        let failure_count = {
            let mut state = self
                .states
                .entry(node_id.clone())
                .or_insert_with(|| NodeHealthState::new(node_id.clone(), now));
            state.failure_count += 1;
            state.consecutive_failures += 1;
            state.last_failure = Some(FailureRecord {
                failure_type,
                timestamp: now,
                error: error.clone(),
            });
            state.failure_count
        };

        let (is_repeating, dominant) = {
            let mut pattern = self.patterns.entry(node_id.clone()).or_default();
            pattern.record(failure_type, now);
            (pattern.is_repeating_failure, pattern.dominant_failure_type)
        };

        FaultCounters::incr(&self.counters.node_failures);
        tracing::warn!(
            "Node {} failed ({}, failure #{}){}",
            node_id,
            failure_type,
            failure_count,
            error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
        );

        if let Err(e) = self
            .registry
            .update_node_status_at(node_id, NodeStatus::Offline, now)
        {
            tracing::debug!("Could not mark {} offline: {}", node_id, e);
        }

        self.events.publish(GridEvent::NodeFailure {
            node_id: node_id.clone(),
            failure_type,
            error,
            failure_count,
            timestamp: now,
        });

        self.recover_node_tasks(node_id, now).await;

        let strategy = choose_strategy(is_repeating, failure_count, self.config.max_failure_count);

        if self.config.enable_replication {
            self.remove_node_from_groups(node_id).await;
        }

        self.execute_strategy(node_id, strategy, dominant, now).await;
        strategy
    }

    async fn execute_strategy(
        &self,
        node_id: &NodeId,
        strategy: RecoveryStrategy,
        dominant: Option<FailureType>,
        now: u64,
    ) {
        let (quarantined, exhausted, attempts) = match self.states.get(node_id) {
            Some(state) => (
                state.is_quarantine_active(now),
                state.recovery_exhausted,
                state.recovery_attempts,
            ),
            None => return,
        };

        if exhausted {
            tracing::debug!("Node {} exhausted its recovery attempts, no strategy run", node_id);
            return;
        }
        if quarantined && strategy != RecoveryStrategy::Quarantine {
            tracing::debug!("Recovery of {} suppressed while quarantined", node_id);
            return;
        }

        tracing::info!("Recovery strategy for {}: {:?}", node_id, strategy);

        match strategy {
            RecoveryStrategy::Immediate => {
                if self.probe_node(node_id).await {
                    self.mark_recovered_locked(node_id, now_ms()).await;
                } else {
                    self.schedule_timer(
                        node_id,
                        self.config.immediate_retry_delay_ms,
                        TimerAction::Retry,
                    );
                }
            }
            RecoveryStrategy::Delayed => {
                let delay = self.backoff_delay(attempts);
                self.schedule_timer(node_id, delay, TimerAction::Retry);
            }
            RecoveryStrategy::Quarantine => {
                self.quarantine_locked(node_id, dominant, now);
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> u64 {
        backoff_delay_ms(
            attempt,
            self.config.base_retry_delay_ms,
            self.config.recovery_timeout_ms,
        )
    }

    fn quarantine_locked(&self, node_id: &NodeId, dominant: Option<FailureType>, now: u64) {
        let until = now.saturating_add(self.config.quarantine_duration_ms);
        {
            let Some(mut state) = self.states.get_mut(node_id) else {
                return;
            };
            state.is_quarantined = true;
            state.quarantine_until = Some(until);
        }

        FaultCounters::incr(&self.counters.quarantines);
        tracing::warn!(
            "Node {} quarantined until {} (dominant failure: {:?})",
            node_id,
            until,
            dominant
        );

        self.events.publish(GridEvent::NodeQuarantined {
            node_id: node_id.clone(),
            quarantine_until: until,
            dominant_failure_type: dominant,
            timestamp: now,
        });

        self.schedule_timer(
            node_id,
            self.config.quarantine_duration_ms,
            TimerAction::ReleaseQuarantine { until },
        );
    }

    // ------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------

    fn schedule_timer(&self, node_id: &NodeId, delay_ms: u64, action: TimerAction) {
        if matches!(action, TimerAction::Retry)
            && self
                .states
                .get(node_id)
                .is_some_and(|state| state.is_quarantine_active(now_ms()))
        {
            tracing::debug!("Not scheduling a retry for quarantined node {}", node_id);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to schedule recovery of node {}", node_id);
            return;
        };

        let generation = self.timer_generation.fetch_add(1, Ordering::Relaxed);
        let manager = self.self_ref.clone();
        let id = node_id.clone();

        let handle = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager
                .pending_timers
                .remove_if(&id, |_, (entry_generation, _)| *entry_generation == generation);

            match action {
                TimerAction::Retry => {
                    manager.retry_node_recovery(&id).await;
                }
                TimerAction::ReleaseQuarantine { until } => {
                    manager.release_quarantine_at(&id, now_ms().max(until)).await;
                }
            }
        });

        if let Some((_, previous)) = self
            .pending_timers
            .insert(node_id.clone(), (generation, handle))
        {
            previous.abort();
        }

        tracing::debug!("Scheduled {:?} for {} in {} ms", action, node_id, delay_ms);
    }

    fn cancel_pending_timer(&self, node_id: &NodeId) {
        if let Some((_, (_, handle))) = self.pending_timers.remove(node_id) {
            handle.abort();
        }
    }

    pub fn has_pending_timer(&self, node_id: &NodeId) -> bool {
        self.pending_timers
            .get(node_id)
            .is_some_and(|entry| !entry.value().1.is_finished())
    }

    pub fn pending_timer_count(&self) -> usize {
        self.pending_timers.len()
    }

    // ------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------

    /// Probes the node; a healthy answer resets its consecutive failure streak.
    async fn probe_node(&self, node_id: &NodeId) -> bool {
        let Some(node) = self.registry.get_node(node_id) else {
            tracing::debug!("Cannot probe {}: not in registry", node_id);
            return false;
        };

        let outcome = probe_with_timeout(self.probe.as_ref(), &node, self.config.probe_timeout()).await;

        if let Some(mut state) = self.states.get_mut(node_id) {
            if outcome.healthy {
                state.consecutive_failures = 0;
                state.record_response_time(outcome.latency_ms);
            } else {
                state.consecutive_failures += 1;
            }
        }

        outcome.healthy
    }

    pub async fn retry_node_recovery(&self, node_id: &NodeId) -> RecoveryOutcome {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        self.retry_locked(node_id, now_ms()).await
    }

    /// One recovery attempt. Quarantined, healthy and exhausted nodes are left alone, so a
    /// late or duplicate timer is harmless.
    async fn retry_locked(&self, node_id: &NodeId, now: u64) -> RecoveryOutcome {
        let attempt = {
            let Some(mut state) = self.states.get_mut(node_id) else {
                return RecoveryOutcome::Skipped;
            };
            if state.is_quarantine_active(now) {
                tracing::debug!("Retry of {} skipped: still quarantined", node_id);
                return RecoveryOutcome::Skipped;
            }
            if state.is_quarantined {
                state.is_quarantined = false;
                state.quarantine_until = None;
            }
            if !state.is_failing() {
                tracing::debug!("Retry of {} skipped: node already healthy", node_id);
                return RecoveryOutcome::Skipped;
            }
            if state.recovery_exhausted {
                return RecoveryOutcome::Skipped;
            }
            state.recovery_attempts += 1;
            state.recovery_attempts
        };

        FaultCounters::incr(&self.counters.recovery_attempts);
        tracing::info!("Recovery attempt {} for node {}", attempt, node_id);

        if self.probe_node(node_id).await {
            self.mark_recovered_locked(node_id, now_ms()).await;
            return RecoveryOutcome::Recovered;
        }

        if attempt >= self.config.max_recovery_attempts {
            if let Some(mut state) = self.states.get_mut(node_id) {
                state.recovery_exhausted = true;
            }
            FaultCounters::incr(&self.counters.exhausted_recoveries);
            tracing::error!(
                "Node {} failed {} recovery attempts, manual intervention required",
                node_id,
                attempt
            );
            self.events.publish(GridEvent::NodeRecoveryFailed {
                node_id: node_id.clone(),
                recovery_attempts: attempt,
                timestamp: now,
            });
            return RecoveryOutcome::Exhausted;
        }

        let delay = self.backoff_delay(attempt);
        self.schedule_timer(node_id, delay, TimerAction::Retry);
        RecoveryOutcome::Rescheduled
    }

    pub async fn mark_node_recovered(&self, node_id: &NodeId) {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        self.mark_recovered_locked(node_id, now_ms()).await;
    }

    async fn mark_recovered_locked(&self, node_id: &NodeId, now: u64) {
        let attempts = {
            let Some(mut state) = self.states.get_mut(node_id) else {
                return;
            };
            let attempts = state.recovery_attempts;
            state.reset_failures();
            attempts
        };

        self.cancel_pending_timer(node_id);

        if let Err(e) = self
            .registry
            .update_node_status_at(node_id, NodeStatus::Online, now)
        {
            tracing::debug!("Could not mark {} online: {}", node_id, e);
        }

        FaultCounters::incr(&self.counters.successful_recoveries);
        tracing::info!("Node {} recovered after {} attempt(s)", node_id, attempts);

        self.events.publish(GridEvent::NodeRecovered {
            node_id: node_id.clone(),
            recovery_attempts: attempts,
            timestamp: now,
        });

        if self.config.enable_replication {
            self.replication.readd_node(node_id, now).await;
        }
    }

    pub async fn release_quarantine(&self, node_id: &NodeId) -> RecoveryOutcome {
        self.release_quarantine_at(node_id, now_ms()).await
    }

    /// Lifts an expired quarantine and immediately retries recovery.
    pub async fn release_quarantine_at(&self, node_id: &NodeId, now: u64) -> RecoveryOutcome {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;

        {
            let Some(mut state) = self.states.get_mut(node_id) else {
                return RecoveryOutcome::Skipped;
            };
            if state.is_quarantine_active(now) {
                tracing::debug!("Quarantine of {} has not expired yet", node_id);
                return RecoveryOutcome::Skipped;
            }
            if state.is_quarantined {
                state.is_quarantined = false;
                state.quarantine_until = None;
                tracing::info!("Released node {} from quarantine", node_id);
            }
        }

        self.retry_locked(node_id, now).await
    }

    /// Clears every quarantine that has run out. Returns the released nodes.
    pub fn release_expired_quarantines_at(&self, now: u64) -> Vec<NodeId> {
        let mut released = Vec::new();
        for mut entry in self.states.iter_mut() {
            let state = entry.value_mut();
            if state.is_quarantined && !state.is_quarantine_active(now) {
                state.is_quarantined = false;
                state.quarantine_until = None;
                released.push(state.node_id.clone());
            }
        }

        if !released.is_empty() {
            tracing::info!("Released {} expired quarantine(s)", released.len());
        }
        released
    }

    /// Operator reset of a node, including one whose automatic recovery was exhausted.
    pub async fn reset_node(&self, node_id: &NodeId) -> Result<(), GridError> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        let now = now_ms();

        let attempts = {
            let mut state = self
                .states
                .get_mut(node_id)
                .ok_or_else(|| GridError::NodeNotFound(node_id.clone()))?;
            let attempts = state.recovery_attempts;
            state.reset_failures();
            attempts
        };

        self.patterns.remove(node_id);
        self.cancel_pending_timer(node_id);
        self.registry
            .update_node_status_at(node_id, NodeStatus::Online, now)?;

        tracing::info!("Node {} reset by operator", node_id);
        self.events.publish(GridEvent::NodeRecovered {
            node_id: node_id.clone(),
            recovery_attempts: attempts,
            timestamp: now,
        });

        if self.config.enable_replication {
            self.replication.readd_node(node_id, now).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------
    // Task recovery
    // ------------------------------------------------------------

    async fn recover_node_tasks(&self, node_id: &NodeId, now: u64) {
        let running = match self.tasks.get_tasks(TaskFilter::running_on(node_id)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Could not list tasks of failed node {}: {}", node_id, e);
                return;
            }
        };

        if running.is_empty() {
            return;
        }

        tracing::info!("Recovering {} task(s) from node {}", running.len(), node_id);
        for task in &running {
            self.recover_task_with(task, now, true).await;
        }
    }

    /// Replaces a task that can no longer finish where it was: from its checkpoint when
    /// one exists, otherwise by restarting it.
    pub async fn recover_task(&self, task: &TaskRecord) -> Option<TaskRecord> {
        self.recover_task_with(task, now_ms(), true).await
    }

    async fn recover_task_with(
        &self,
        task: &TaskRecord,
        now: u64,
        report_abandoned: bool,
    ) -> Option<TaskRecord> {
        // A failed cancel never blocks recovery.
        if matches!(task.status, TaskStatus::Running | TaskStatus::Pending)
            && let Err(e) = self.tasks.cancel_task(&task.id).await
        {
            tracing::warn!(
                "Could not cancel task {} before recovering it, recreating anyway: {}",
                task.id,
                e
            );
        }

        if task.retry_count >= self.config.max_task_retries {
            FaultCounters::incr(&self.counters.tasks_abandoned);
            self.checkpoints.remove(&task.id);
            tracing::warn!(
                "Task {} reached {} retries, not recovering it",
                task.id,
                task.retry_count
            );
            if report_abandoned {
                self.events.publish(GridEvent::TaskFailure {
                    task_id: task.id.clone(),
                    node_id: task.assigned_node.clone(),
                    error: format!("retry limit of {} reached", self.config.max_task_retries),
                    retry_count: task.retry_count,
                    timestamp: now,
                });
            }
            return None;
        }

        match self.checkpoints.remove(&task.id) {
            Some(checkpoint) => self.restore_task_from_checkpoint(task, &checkpoint).await,
            None => {
                tracing::info!("No checkpoint for task {}, restarting it", task.id);
                self.restart_task(task).await
            }
        }
    }

    /// Creates a replacement task carrying the checkpoint under `payload.checkpoint`.
    pub async fn restore_task_from_checkpoint(
        &self,
        task: &TaskRecord,
        checkpoint: &Checkpoint,
    ) -> Option<TaskRecord> {
        let checkpoint_value = serde_json::to_value(checkpoint).unwrap_or(Value::Null);

        let mut new_task = NewTask::derived_from(task)
            .with_priority_bump(1)
            .with_metadata("restored_from_checkpoint", true)
            .with_metadata("checkpoint_timestamp", checkpoint.timestamp);

        match new_task.payload.as_object_mut() {
            Some(payload) => {
                payload.insert("checkpoint".into(), checkpoint_value);
            }
            None => {
                new_task.payload = serde_json::json!({
                    "data": new_task.payload,
                    "checkpoint": checkpoint_value,
                });
            }
        }

        match self.tasks.create_task(new_task).await {
            Ok(record) => {
                FaultCounters::incr(&self.counters.tasks_restored_from_checkpoint);
                FaultCounters::incr(&self.counters.tasks_recovered);
                tracing::info!(
                    "Restored task {} from checkpoint ({:.0}% done) as {}",
                    task.id,
                    checkpoint.progress * 100.0,
                    record.id
                );
                Some(record)
            }
            Err(e) => {
                tracing::warn!("Failed to restore task {} from checkpoint: {}", task.id, e);
                None
            }
        }
    }

    /// Creates a replacement task with `retry_count + 1` and a priority boost of 2.
    pub async fn restart_task(&self, task: &TaskRecord) -> Option<TaskRecord> {
        let mut new_task = NewTask::derived_from(task).with_priority_bump(2);
        new_task.retry_count = task.retry_count + 1;
        if let Some(node_id) = &task.assigned_node {
            new_task = new_task.with_metadata("restarted_from_node", node_id.0.clone());
        }

        match self.tasks.create_task(new_task).await {
            Ok(record) => {
                FaultCounters::incr(&self.counters.tasks_recovered);
                tracing::info!(
                    "Restarted task {} as {} (retry {})",
                    task.id,
                    record.id,
                    record.retry_count
                );
                Some(record)
            }
            Err(e) => {
                tracing::warn!("Failed to restart task {}: {}", task.id, e);
                None
            }
        }
    }

    /// A task failed while its node stayed up. Publishes `TaskFailure` and recovers it
    /// unless its retry budget is spent.
    pub async fn handle_task_failure(&self, task: &TaskRecord, error: &str) -> Option<TaskRecord> {
        let now = now_ms();
        FaultCounters::incr(&self.counters.task_failures);

        if let Some(node_id) = &task.assigned_node
            && let Some(mut state) = self.states.get_mut(node_id)
        {
            state.record_task_result(false);
        }

        tracing::warn!("Task {} failed: {}", task.id, error);
        self.events.publish(GridEvent::TaskFailure {
            task_id: task.id.clone(),
            node_id: task.assigned_node.clone(),
            error: error.to_string(),
            retry_count: task.retry_count,
            timestamp: now,
        });

        self.recover_task_with(task, now, false).await
    }

    pub fn record_task_success(&self, node_id: &NodeId, response_time_ms: u64) {
        if let Some(mut state) = self.states.get_mut(node_id) {
            state.record_task_result(true);
            state.record_response_time(response_time_ms);
        }
    }

    // ------------------------------------------------------------
    // Periodic sweeps
    // ------------------------------------------------------------

    /// Checkpoints every task that has been running for longer than the minimum age.
    pub async fn create_checkpoints_at(&self, now: u64) -> usize {
        let running = match self.tasks.get_tasks(TaskFilter::running()).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Checkpoint sweep could not list running tasks: {}", e);
                return 0;
            }
        };

        let mut created = 0;
        for task in running
            .iter()
            .filter(|t| now.saturating_sub(t.running_since()) > self.config.checkpoint_min_task_age_ms)
        {
            self.checkpoints.save(Checkpoint::capture(task, now));
            created += 1;
        }

        if created > 0 {
            FaultCounters::add(&self.counters.checkpoints_created, created as u64);
            tracing::debug!(
                "Checkpointed {} task(s), {} stored",
                created,
                self.checkpoints.len()
            );
        }
        created
    }

    /// Safety net for lost timers: retries failing nodes whose last failure is old enough
    /// and that have no timer pending. Expired quarantines are released first.
    pub async fn run_recovery_scan_at(&self, now: u64) -> Vec<NodeId> {
        self.release_expired_quarantines_at(now);

        let min_age = self.config.recovery_scan_min_age_ms;
        let max_attempts = self.config.max_recovery_attempts;

        let mut due: Vec<NodeId> = self
            .states
            .iter()
            .filter(|entry| {
                let state = entry.value();
                state.is_failing()
                    && !state.is_quarantine_active(now)
                    && !state.recovery_exhausted
                    && state.recovery_attempts < max_attempts
                    && state
                        .last_failure
                        .as_ref()
                        .is_some_and(|f| now.saturating_sub(f.timestamp) > min_age)
            })
            .map(|entry| entry.key().clone())
            .collect();
        due.retain(|node_id| !self.has_pending_timer(node_id));
        due.sort();

        for node_id in &due {
            tracing::debug!("Recovery scan retrying node {}", node_id);
            self.retry_node_recovery(node_id).await;
        }
        due
    }

    // ------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------

    pub async fn create_replication_group(&self, group_id: &str, nodes: Vec<NodeId>) -> ReplicationGroup {
        self.replication.create_group(group_id, nodes, now_ms()).await
    }

    pub async fn add_node_to_group(&self, group_id: &str, node_id: &NodeId) -> bool {
        self.replication.add_node(group_id, node_id).await
    }

    /// Removes the node from its groups and immediately repairs the ones left short.
    pub async fn remove_node_from_groups(&self, node_id: &NodeId) -> Vec<String> {
        let affected = self.replication.remove_node_from_groups(node_id).await;
        for group_id in &affected {
            self.repair_group(group_id).await;
        }
        affected
    }

    /// Tops up a group from online, non-quarantined nodes. Returns the number added.
    pub async fn repair_group(&self, group_id: &str) -> usize {
        let now = now_ms();
        let mut candidates: Vec<NodeId> = self
            .registry
            .get_active_nodes()
            .into_iter()
            .map(|node| node.id)
            .filter(|id| {
                !self
                    .states
                    .get(id)
                    .is_some_and(|state| state.is_quarantine_active(now) || state.recovery_exhausted)
            })
            .collect();
        candidates.sort();

        let added = self.replication.repair_group(group_id, &candidates, now).await;
        if added > 0 {
            FaultCounters::incr(&self.counters.replication_repairs);
        }
        added
    }

    pub async fn get_replication_groups(&self) -> Vec<ReplicationGroup> {
        self.replication.snapshot().await
    }

    pub async fn get_replication_group(&self, group_id: &str) -> Option<ReplicationGroup> {
        self.replication.get_group(group_id).await
    }

    // ------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------

    pub fn is_quarantined(&self, node_id: &NodeId) -> bool {
        let now = now_ms();
        self.states
            .get(node_id)
            .is_some_and(|state| state.is_quarantine_active(now))
    }

    pub fn get_system_health(&self) -> SystemHealth {
        self.get_system_health_at(now_ms())
    }

    /// Healthy nodes are online, not quarantined and have no outstanding failures.
    pub fn get_system_health_at(&self, now: u64) -> SystemHealth {
        let nodes = self.registry.get_all_nodes();
        let total_nodes = nodes.len();

        let mut healthy_nodes = 0;
        let mut quarantined_nodes = 0;
        for node in &nodes {
            let (quarantined, failing) = self
                .states
                .get(&node.id)
                .map(|state| (state.is_quarantine_active(now), state.is_failing()))
                .unwrap_or((false, false));

            if quarantined {
                quarantined_nodes += 1;
            }
            if !node.is_offline() && !quarantined && !failing {
                healthy_nodes += 1;
            }
        }

        let health_percentage = if total_nodes == 0 {
            0.0
        } else {
            healthy_nodes as f64 / total_nodes as f64 * 100.0
        };

        SystemHealth {
            total_nodes,
            healthy_nodes,
            quarantined_nodes,
            health_percentage,
            system_status: SystemStatus::from_counts(healthy_nodes, total_nodes),
        }
    }

    pub fn get_failure_patterns(&self) -> BTreeMap<NodeId, FailurePattern> {
        self.get_failure_patterns_at(now_ms())
    }

    /// Patterns re-evaluated against `now`, so failures older than the window drop out.
    pub fn get_failure_patterns_at(&self, now: u64) -> BTreeMap<NodeId, FailurePattern> {
        self.patterns
            .iter()
            .map(|entry| {
                let mut pattern = entry.value().clone();
                pattern.prune(now);
                (entry.key().clone(), pattern)
            })
            .collect()
    }

    pub fn get_failure_pattern(&self, node_id: &NodeId) -> Option<FailurePattern> {
        self.patterns.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn get_node_state(&self, node_id: &NodeId) -> Option<NodeHealthState> {
        self.states.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn get_node_states(&self) -> Vec<NodeHealthState> {
        let mut states: Vec<NodeHealthState> =
            self.states.iter().map(|entry| entry.value().clone()).collect();
        states.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        states
    }

    pub async fn get_fault_tolerance_stats(&self) -> FaultToleranceStats {
        let now = now_ms();
        let c = &self.counters;

        let (failing_nodes, quarantined_nodes) =
            self.states.iter().fold((0, 0), |(failing, quarantined), entry| {
                (
                    failing + entry.is_failing() as usize,
                    quarantined + entry.is_quarantine_active(now) as usize,
                )
            });

        FaultToleranceStats {
            node_failures: FaultCounters::get(&c.node_failures),
            task_failures: FaultCounters::get(&c.task_failures),
            tasks_recovered: FaultCounters::get(&c.tasks_recovered),
            tasks_restored_from_checkpoint: FaultCounters::get(&c.tasks_restored_from_checkpoint),
            tasks_abandoned: FaultCounters::get(&c.tasks_abandoned),
            recovery_attempts: FaultCounters::get(&c.recovery_attempts),
            successful_recoveries: FaultCounters::get(&c.successful_recoveries),
            exhausted_recoveries: FaultCounters::get(&c.exhausted_recoveries),
            quarantines: FaultCounters::get(&c.quarantines),
            checkpoints_created: FaultCounters::get(&c.checkpoints_created),
            checkpoints_stored: self.checkpoints.len(),
            replication_repairs: FaultCounters::get(&c.replication_repairs),
            replication_groups: self.replication.group_count().await,
            under_replicated_groups: self.replication.under_replicated_groups().await.len(),
            tracked_nodes: self.states.len(),
            failing_nodes,
            quarantined_nodes,
        }
    }
}

impl FailureReporter for FaultToleranceManager {
    fn report_failure(&self, signal: FailureSignal) {
        self.enqueue_failure(signal);
    }

    fn forget_node(&self, node_id: &NodeId) {
        self.forget(node_id);
    }
}
