//! Fault Tolerance Module Tests
//!
//! ## Test Scopes
//! - **Pure logic**: failure patterns, strategy choice, backoff schedule, health status.
//! - **Checkpoints**: capacity bound and per-task replacement.
//! - **Replication**: repair with and without eligible candidates.
//! - **State machine**: immediate recovery, retry timers, quarantine, exhaustion and reset.
//! - **Task recovery**: checkpoint restore versus restart, retry limits.

#[cfg(test)]
mod tests {
    use crate::clock::now_ms;
    use crate::config::{FaultConfig, RegistryConfig};
    use crate::events::bus::EventBus;
    use crate::events::types::{EventKind, GridEvent};
    use crate::fault::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
    use crate::fault::pattern::FailurePattern;
    use crate::fault::service::FaultToleranceManager;
    use crate::fault::types::*;
    use crate::probe::testing::ScriptedProbe;
    use crate::registry::service::NodeRegistry;
    use crate::registry::types::{NodeCapabilities, NodeDescriptor, NodeId, NodeStatus};
    use crate::tasks::service::TaskService;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::tasks::types::{NewTask, TaskFilter, TaskId, TaskStatus};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const MINUTE: u64 = 60_000;

    struct Harness {
        registry: Arc<NodeRegistry>,
        store: Arc<InMemoryTaskStore>,
        probe: Arc<ScriptedProbe>,
        events: Arc<EventBus>,
        manager: Arc<FaultToleranceManager>,
        seen: Arc<Mutex<Vec<GridEvent>>>,
    }

    impl Harness {
        fn new(nodes: &[&str]) -> Self {
            Self::with_config(nodes, FaultConfig::default())
        }

        fn with_config(nodes: &[&str], config: FaultConfig) -> Self {
            let registry = NodeRegistry::new(RegistryConfig::default());
            let store = InMemoryTaskStore::new();
            let probe = ScriptedProbe::new();
            let events = EventBus::new();
            let manager = FaultToleranceManager::new(
                registry.clone(),
                store.clone(),
                probe.clone(),
                events.clone(),
                config,
            );

            let seen = Arc::new(Mutex::new(Vec::new()));
            for kind in EventKind::ALL {
                let seen = seen.clone();
                events.subscribe(kind, move |event| seen.lock().unwrap().push(event.clone()));
            }

            for id in nodes {
                let node = registry
                    .register_node(NodeDescriptor {
                        id: Some(NodeId::from(*id)),
                        capabilities: NodeCapabilities {
                            max_vram_gb: 16.0,
                            cpu_cores: 8,
                            ..Default::default()
                        },
                        ..Default::default()
                    })
                    .unwrap();
                manager.track_node(&node.id, now_ms());
            }

            Self {
                registry,
                store,
                probe,
                events,
                manager,
                seen,
            }
        }

        fn count(&self, kind: EventKind) -> usize {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind() == kind)
                .count()
        }

        fn state(&self, id: &str) -> NodeHealthState {
            self.manager.get_node_state(&NodeId::from(id)).unwrap()
        }

        fn status(&self, id: &str) -> NodeStatus {
            self.registry.get_node(&NodeId::from(id)).unwrap().status
        }

        fn set_healthy(&self, id: &str, healthy: bool) {
            self.probe.set_healthy(&NodeId::from(id), healthy);
        }

        async fn running_task(&self, node: &str, priority: u8, retry_count: u32) -> TaskId {
            let mut new_task = NewTask::new(priority, serde_json::json!({"job": "render"}));
            new_task.retry_count = retry_count;
            let record = self.store.create_task(new_task).await.unwrap();
            self.store.start_task(&record.id, &NodeId::from(node)).unwrap();
            record.id
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    // ============================================================
    // FAILURE PATTERN TESTS
    // ============================================================

    #[test]
    fn test_three_close_failures_are_repeating() {
        // ARRANGE
        let mut pattern = FailurePattern::new();
        let t0 = 10 * MINUTE;

        // ACT: failures at t=0, t=120s, t=240s
        pattern.record(FailureType::Timeout, t0);
        pattern.record(FailureType::Timeout, t0 + 2 * MINUTE);
        assert!(!pattern.is_repeating_failure);
        pattern.record(FailureType::Disconnect, t0 + 4 * MINUTE);

        // ASSERT
        assert!(pattern.is_repeating_failure);
        assert_eq!(pattern.dominant_failure_type, Some(FailureType::Timeout));
        assert_eq!(pattern.failures_in_window(), 3);
    }

    #[test]
    fn test_pattern_reevaluates_after_pruning() {
        // ARRANGE
        let mut pattern = FailurePattern::new();
        let t0 = 10 * MINUTE;
        pattern.record(FailureType::Timeout, t0);
        pattern.record(FailureType::Timeout, t0 + 2 * MINUTE);
        pattern.record(FailureType::Timeout, t0 + 4 * MINUTE);
        assert!(pattern.is_repeating_failure);

        // ACT: a 4th failure at t=1h+1s prunes the t=0 entry
        pattern.record(FailureType::Timeout, t0 + 60 * MINUTE + 1_000);

        // ASSERT: 3 in window, but the newest gap is far above 5 minutes
        assert_eq!(pattern.failures_in_window(), 3);
        assert_eq!(pattern.failure_timestamps[0], t0 + 2 * MINUTE);
        assert!(!pattern.is_repeating_failure);
        assert_eq!(pattern.total_failures, 4);
    }

    #[test]
    fn test_spaced_failures_are_not_repeating() {
        let mut pattern = FailurePattern::new();

        pattern.record(FailureType::HeartbeatTimeout, 0);
        pattern.record(FailureType::HeartbeatTimeout, 6 * MINUTE);
        pattern.record(FailureType::HeartbeatTimeout, 12 * MINUTE);

        assert!(!pattern.is_repeating_failure);
        assert_eq!(pattern.failures_in_window(), 3);
    }

    #[test]
    fn test_pattern_prune_drops_everything_after_an_hour() {
        let mut pattern = FailurePattern::new();
        pattern.record(FailureType::ProbeError, 0);
        pattern.record(FailureType::ProbeError, MINUTE);
        pattern.record(FailureType::ProbeError, 2 * MINUTE);

        pattern.prune(3 * 60 * MINUTE);

        assert_eq!(pattern.failures_in_window(), 0);
        assert!(!pattern.is_repeating_failure);
        assert_eq!(pattern.dominant_failure_type, Some(FailureType::ProbeError));
    }

    // ============================================================
    // STRATEGY & BACKOFF TESTS
    // ============================================================

    #[test]
    fn test_choose_strategy() {
        assert_eq!(choose_strategy(true, 1, 3), RecoveryStrategy::Quarantine);
        assert_eq!(choose_strategy(true, 5, 3), RecoveryStrategy::Quarantine);
        assert_eq!(choose_strategy(false, 3, 3), RecoveryStrategy::Delayed);
        assert_eq!(choose_strategy(false, 2, 3), RecoveryStrategy::Immediate);
    }

    #[test]
    fn test_backoff_schedule() {
        let delays: Vec<u64> = (0..5).map(|k| backoff_delay_ms(k, 60_000, 300_000)).collect();

        assert_eq!(delays, vec![60_000, 120_000, 240_000, 300_000, 300_000]);
        assert_eq!(backoff_delay_ms(90, 60_000, 300_000), 300_000);
    }

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(SystemStatus::from_counts(0, 0), SystemStatus::Critical);
        assert_eq!(SystemStatus::from_counts(3, 3), SystemStatus::Healthy);
        assert_eq!(SystemStatus::from_counts(2, 3), SystemStatus::Degraded);
        assert_eq!(SystemStatus::from_counts(1, 2), SystemStatus::Critical);
        assert_eq!(SystemStatus::from_counts(1, 3), SystemStatus::Critical);
    }

    #[test]
    fn test_response_history_is_bounded() {
        let mut state = NodeHealthState::new(NodeId::from("a"), 0);
        for ms in 0..30 {
            state.record_response_time(ms);
        }

        assert_eq!(state.response_time_history.len(), RESPONSE_HISTORY_LEN);
        assert_eq!(state.response_time_history.front(), Some(&10));
    }

    // ============================================================
    // CHECKPOINT STORE TESTS
    // ============================================================

    fn checkpoint(task: &str, timestamp: u64) -> Checkpoint {
        Checkpoint {
            task_id: TaskId::from(task),
            timestamp,
            progress: 0.5,
            state: serde_json::json!({}),
            metadata: CheckpointMetadata { node_id: None },
        }
    }

    #[test]
    fn test_checkpoint_store_keeps_newest_hundred() {
        // ARRANGE
        let store = CheckpointStore::new(100);

        // ACT: insert 150 in shuffled timestamp order
        for i in (0..150u64).rev() {
            store.save(checkpoint(&format!("task-{}", i), 1_000 + i));
        }

        // ASSERT
        assert_eq!(store.len(), 100);
        let stamps: Vec<u64> = store.snapshot().iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps.first(), Some(&1_050));
        assert_eq!(stamps.last(), Some(&1_149));
        assert!(store.get(&TaskId::from("task-49")).is_none());
    }

    #[test]
    fn test_checkpoint_for_same_task_is_replaced() {
        let store = CheckpointStore::new(10);

        store.save(checkpoint("t", 1));
        store.save(checkpoint("t", 2));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&TaskId::from("t")).unwrap().timestamp, 2);
    }

    // ============================================================
    // REPLICATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_replication_repair_with_candidate() {
        // ARRANGE: 2-of-2 group, one spare node
        let h = Harness::new(&["a", "b", "c"]);
        h.manager
            .create_replication_group("g1", vec![NodeId::from("a"), NodeId::from("b")])
            .await;
        h.registry
            .update_node_status(&NodeId::from("a"), NodeStatus::Offline)
            .unwrap();

        // ACT
        let affected = h.manager.remove_node_from_groups(&NodeId::from("a")).await;

        // ASSERT
        assert_eq!(affected, vec!["g1".to_string()]);
        let group = h.manager.get_replication_group("g1").await.unwrap();
        assert_eq!(group.nodes.len(), 2);
        assert!(group.nodes.contains(&NodeId::from("c")));
        assert!(group.last_repaired.is_some());
    }

    #[tokio::test]
    async fn test_replication_repair_without_candidates_is_not_fatal() {
        let h = Harness::new(&["a", "b"]);
        h.manager
            .create_replication_group("g1", vec![NodeId::from("a"), NodeId::from("b")])
            .await;
        h.registry
            .update_node_status(&NodeId::from("a"), NodeStatus::Offline)
            .unwrap();

        h.manager.remove_node_from_groups(&NodeId::from("a")).await;

        let group = h.manager.get_replication_group("g1").await.unwrap();
        assert_eq!(group.nodes.len(), 1);
        let stats = h.manager.get_fault_tolerance_stats().await;
        assert_eq!(stats.under_replicated_groups, 1);
        assert_eq!(stats.replication_repairs, 0);
    }

    #[tokio::test]
    async fn test_node_failure_repairs_its_groups() {
        // ARRANGE
        let h = Harness::new(&["a", "b", "c"]);
        h.manager
            .create_replication_group("g1", vec![NodeId::from("a"), NodeId::from("b")])
            .await;
        h.set_healthy("a", false);

        // ACT
        h.manager
            .handle_node_failure(&NodeId::from("a"), FailureType::Disconnect, None)
            .await;

        // ASSERT
        let group = h.manager.get_replication_group("g1").await.unwrap();
        let members: Vec<&str> = group.nodes.iter().map(|n| n.0.as_str()).collect();
        assert_eq!(members, vec!["b", "c"]);
    }

    // ============================================================
    // RECOVERY STATE MACHINE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_immediate_recovery_when_probe_succeeds() {
        // ARRANGE
        let h = Harness::new(&["a"]);

        // ACT
        let strategy = h
            .manager
            .handle_node_failure(&NodeId::from("a"), FailureType::Timeout, Some("blip".into()))
            .await;

        // ASSERT
        assert_eq!(strategy, RecoveryStrategy::Immediate);
        assert_eq!(h.status("a"), NodeStatus::Online);
        assert_eq!(h.state("a").failure_count, 0);
        assert_eq!(h.count(EventKind::NodeFailure), 1);
        assert_eq!(h.count(EventKind::NodeRecovered), 1);
        assert!(!h.manager.has_pending_timer(&NodeId::from("a")));
    }

    #[tokio::test]
    async fn test_failed_immediate_probe_schedules_retry() {
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);

        h.manager
            .handle_node_failure(&NodeId::from("a"), FailureType::Timeout, None)
            .await;

        assert_eq!(h.status("a"), NodeStatus::Offline);
        let state = h.state("a");
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.last_failure.unwrap().failure_type, FailureType::Timeout);
        assert!(h.manager.has_pending_timer(&NodeId::from("a")));
        assert_eq!(h.count(EventKind::NodeRecovered), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_retry_recovers_node() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        h.manager
            .handle_node_failure(&NodeId::from("a"), FailureType::Timeout, None)
            .await;

        // ACT: node comes back before the 30s retry fires
        h.set_healthy("a", true);
        tokio::time::sleep(Duration::from_secs(31)).await;

        // ASSERT
        assert_eq!(h.status("a"), NodeStatus::Online);
        assert_eq!(h.state("a").failure_count, 0);
        assert_eq!(h.count(EventKind::NodeRecovered), 1);
        assert_eq!(h.manager.pending_timer_count(), 0);
    }

    #[tokio::test]
    async fn test_delayed_strategy_after_max_failures() {
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let t0 = now_ms();

        let first = h.manager.handle_node_failure_at(&id, FailureType::Timeout, None, t0).await;
        let second = h
            .manager
            .handle_node_failure_at(&id, FailureType::Timeout, None, t0 + 10 * MINUTE)
            .await;
        let third = h
            .manager
            .handle_node_failure_at(&id, FailureType::Timeout, None, t0 + 20 * MINUTE)
            .await;

        assert_eq!(first, RecoveryStrategy::Immediate);
        assert_eq!(second, RecoveryStrategy::Immediate);
        assert_eq!(third, RecoveryStrategy::Delayed);
        assert_eq!(h.manager.pending_timer_count(), 1);
    }

    #[tokio::test]
    async fn test_repeating_failures_quarantine_node() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let t0 = now_ms() - 4 * MINUTE;

        // ACT: three failures two minutes apart
        for i in 0..3 {
            h.manager
                .handle_node_failure_at(&id, FailureType::Timeout, None, t0 + i * 2 * MINUTE)
                .await;
        }

        // ASSERT
        let state = h.state("a");
        assert!(state.is_quarantined);
        assert_eq!(state.quarantine_until, Some(t0 + 4 * MINUTE + 600_000));
        assert!(h.manager.is_quarantined(&id));
        assert_eq!(h.count(EventKind::NodeQuarantined), 1);

        // Recovery attempts are suppressed while quarantined
        assert_eq!(h.manager.retry_node_recovery(&id).await, RecoveryOutcome::Skipped);
        assert_eq!(h.state("a").recovery_attempts, 0);

        // Release before expiry is refused
        let until = state.quarantine_until.unwrap();
        assert_eq!(
            h.manager.release_quarantine_at(&id, until - 1).await,
            RecoveryOutcome::Skipped
        );

        // ACT: release at expiry retries right away
        h.set_healthy("a", true);
        let outcome = h.manager.release_quarantine_at(&id, until).await;

        // ASSERT
        assert_eq!(outcome, RecoveryOutcome::Recovered);
        assert!(!h.state("a").is_quarantined);
        assert_eq!(h.status("a"), NodeStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_expires_on_its_own() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let t0 = now_ms();
        for i in 0..3 {
            h.manager
                .handle_node_failure_at(&id, FailureType::Timeout, None, t0 + i * 1_000)
                .await;
        }
        assert!(h.manager.is_quarantined(&id));
        assert!(h.manager.has_pending_timer(&id));

        // ACT: the node is back, and the ten minute quarantine runs out
        h.set_healthy("a", true);
        tokio::time::sleep(Duration::from_secs(601)).await;
        wait_for(|| h.count(EventKind::NodeRecovered) == 1).await;

        // ASSERT
        let state = h.state("a");
        assert!(!state.is_quarantined);
        assert_eq!(state.quarantine_until, None);
        assert_eq!(state.failure_count, 0);
        assert_eq!(h.status("a"), NodeStatus::Online);
        assert_eq!(h.count(EventKind::NodeRecovered), 1);
        assert_eq!(h.manager.pending_timer_count(), 0);
    }

    #[tokio::test]
    async fn test_quarantined_node_is_not_a_repair_candidate() {
        let h = Harness::new(&["a", "b", "c"]);
        h.set_healthy("c", false);
        let c = NodeId::from("c");
        let t0 = now_ms() - 4 * MINUTE;
        for i in 0..3 {
            h.manager
                .handle_node_failure_at(&c, FailureType::Timeout, None, t0 + i * 2 * MINUTE)
                .await;
        }
        // The registry still reports c as reachable
        h.registry.update_node_status(&c, NodeStatus::Online).unwrap();
        h.manager
            .create_replication_group("g1", vec![NodeId::from("a"), NodeId::from("b")])
            .await;
        h.registry
            .update_node_status(&NodeId::from("a"), NodeStatus::Offline)
            .unwrap();

        h.manager.remove_node_from_groups(&NodeId::from("a")).await;

        let group = h.manager.get_replication_group("g1").await.unwrap();
        assert_eq!(group.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_exhausts_after_five_attempts_and_reset_restores() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        h.manager
            .handle_node_failure(&id, FailureType::Disconnect, None)
            .await;

        // ACT
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(h.manager.retry_node_recovery(&id).await);
        }

        // ASSERT
        assert_eq!(
            outcomes,
            vec![
                RecoveryOutcome::Rescheduled,
                RecoveryOutcome::Rescheduled,
                RecoveryOutcome::Rescheduled,
                RecoveryOutcome::Rescheduled,
                RecoveryOutcome::Exhausted,
                RecoveryOutcome::Skipped,
            ]
        );
        let state = h.state("a");
        assert!(state.recovery_exhausted);
        assert_eq!(state.recovery_attempts, 5);
        assert_eq!(h.count(EventKind::NodeRecoveryFailed), 1);
        assert_eq!(h.status("a"), NodeStatus::Offline);

        // ACT: operator intervention
        h.manager.reset_node(&id).await.unwrap();

        // ASSERT
        let state = h.state("a");
        assert!(!state.recovery_exhausted);
        assert_eq!(state.failure_count, 0);
        assert_eq!(h.status("a"), NodeStatus::Online);
        assert!(h.manager.get_failure_pattern(&id).is_none());
    }

    #[tokio::test]
    async fn test_reset_unknown_node_is_an_error() {
        let h = Harness::new(&[]);

        assert!(h.manager.reset_node(&NodeId::from("ghost")).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_on_healthy_node_is_a_no_op() {
        let h = Harness::new(&["a"]);

        let outcome = h.manager.retry_node_recovery(&NodeId::from("a")).await;

        assert_eq!(outcome, RecoveryOutcome::Skipped);
        assert_eq!(h.state("a").recovery_attempts, 0);
        assert_eq!(h.probe.call_count(), 0);
    }

    #[tokio::test]
    async fn test_recovery_scan_retries_nodes_with_lost_timers() {
        // ARRANGE: an old failure whose retry timer has been lost
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let now = now_ms();
        h.manager
            .handle_node_failure_at(&id, FailureType::Timeout, None, now - 3 * MINUTE)
            .await;
        h.manager.shutdown();
        h.set_healthy("a", true);

        // ACT
        let retried = h.manager.run_recovery_scan_at(now).await;

        // ASSERT
        assert_eq!(retried, vec![id]);
        assert_eq!(h.state("a").failure_count, 0);
        assert_eq!(h.status("a"), NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_recovery_scan_ignores_recent_failures() {
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let now = now_ms();
        h.manager
            .handle_node_failure_at(&id, FailureType::Timeout, None, now - MINUTE)
            .await;
        h.manager.shutdown();

        let retried = h.manager.run_recovery_scan_at(now).await;

        assert!(retried.is_empty());
    }

    #[tokio::test]
    async fn test_reported_failures_are_handled_in_order() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        let t0 = now_ms();

        // ACT: fire-and-forget signals through the reporter interface
        let reporter: Arc<dyn FailureReporter> = h.manager.clone();
        for i in 0..3 {
            reporter.report_failure(FailureSignal {
                node_id: id.clone(),
                failure_type: FailureType::HeartbeatTimeout,
                error: None,
                timestamp: t0 + i * 1_000,
            });
        }

        // ASSERT
        let manager = h.manager.clone();
        wait_for(|| {
            manager
                .get_node_state(&NodeId::from("a"))
                .is_some_and(|s| s.is_quarantined)
        })
        .await;
        let state = h.state("a");
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.last_failure.unwrap().timestamp, t0 + 2_000);
        assert_eq!(h.count(EventKind::NodeFailure), 3);
    }

    #[tokio::test]
    async fn test_forget_node_drops_state() {
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let id = NodeId::from("a");
        h.manager.handle_node_failure(&id, FailureType::Timeout, None).await;

        h.manager.forget(&id);

        assert!(h.manager.get_node_state(&id).is_none());
        assert!(h.manager.get_failure_pattern(&id).is_none());
        assert_eq!(h.manager.pending_timer_count(), 0);
    }

    // ============================================================
    // TASK RECOVERY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_checkpointed_task_is_restored_and_other_restarted() {
        // ARRANGE: two running tasks, only one old enough to be checkpointed
        let h = Harness::new(&["a"]);
        h.set_healthy("a", false);
        let checkpointed = h.running_task("a", 5, 0).await;
        let created = h.manager.create_checkpoints_at(now_ms() + 2 * MINUTE).await;
        assert_eq!(created, 1);
        let plain = h.running_task("a", 9, 1).await;

        // ACT
        h.manager
            .handle_node_failure(&NodeId::from("a"), FailureType::Disconnect, None)
            .await;

        // ASSERT: originals cancelled, replacements pending
        assert_eq!(h.store.get(&checkpointed).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(h.store.get(&plain).unwrap().status, TaskStatus::Cancelled);

        let pending = h
            .store
            .get_tasks(TaskFilter {
                status: Some(TaskStatus::Pending),
                node_id: None,
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let restored = pending
            .iter()
            .find(|t| t.metadata["original_task_id"] == checkpointed.0.as_str())
            .unwrap();
        assert_eq!(restored.priority, 6);
        assert_eq!(restored.retry_count, 0);
        assert_eq!(restored.metadata["restored_from_checkpoint"], true);
        assert_eq!(restored.payload["checkpoint"]["task_id"], checkpointed.0.as_str());
        assert_eq!(restored.payload["job"], "render");

        let restarted = pending
            .iter()
            .find(|t| t.metadata["original_task_id"] == plain.0.as_str())
            .unwrap();
        assert_eq!(restarted.priority, 10);
        assert_eq!(restarted.retry_count, 2);
        assert!(restarted.payload.get("checkpoint").is_none());

        let stats = h.manager.get_fault_tolerance_stats().await;
        assert_eq!(stats.tasks_recovered, 2);
        assert_eq!(stats.tasks_restored_from_checkpoint, 1);
        assert_eq!(stats.checkpoints_stored, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_sweep_skips_young_tasks() {
        let h = Harness::new(&["a"]);
        h.running_task("a", 5, 0).await;

        let created = h.manager.create_checkpoints_at(now_ms()).await;

        assert_eq!(created, 0);
        assert!(h.manager.checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_task_over_retry_limit_is_abandoned() {
        // ARRANGE
        let h = Harness::new(&["a"]);
        let id = h.running_task("a", 5, 3).await;
        let task = h.store.get(&id).unwrap();

        // ACT
        let replacement = h.manager.handle_task_failure(&task, "out of memory").await;

        // ASSERT
        assert!(replacement.is_none());
        assert_eq!(h.count(EventKind::TaskFailure), 1);
        assert_eq!(h.store.len(), 1);
        let stats = h.manager.get_fault_tolerance_stats().await;
        assert_eq!(stats.task_failures, 1);
        assert_eq!(stats.tasks_abandoned, 1);
    }

    #[tokio::test]
    async fn test_task_failure_restarts_task() {
        let h = Harness::new(&["a"]);
        let id = h.running_task("a", 3, 0).await;
        let task = h.store.get(&id).unwrap();

        let replacement = h.manager.handle_task_failure(&task, "segfault").await.unwrap();

        assert_eq!(replacement.retry_count, 1);
        assert_eq!(replacement.priority, 5);
        assert_eq!(h.count(EventKind::TaskFailure), 1);
        assert!(h.state("a").task_success_rate < 1.0);
    }

    #[tokio::test]
    async fn test_task_missing_from_store_is_still_recreated() {
        // ARRANGE: the running record is not known to the task service
        let h = Harness::new(&["a"]);
        let mut new_task = NewTask::new(4, serde_json::json!({"job": "encode"}));
        new_task.assigned_node = Some(NodeId::from("a"));
        let mut task = new_task.into_record();
        task.status = TaskStatus::Running;

        // ACT
        let replacement = h.manager.recover_task(&task).await.unwrap();

        // ASSERT
        assert_ne!(replacement.id, task.id);
        assert_eq!(replacement.retry_count, 1);
        assert_eq!(replacement.status, TaskStatus::Pending);
        assert_eq!(h.store.len(), 1);
    }

    // ============================================================
    // SYSTEM HEALTH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_system_health_reflects_failures() {
        // ARRANGE
        let h = Harness::new(&["a", "b", "c"]);
        assert_eq!(h.manager.get_system_health().system_status, SystemStatus::Healthy);

        // ACT
        h.set_healthy("c", false);
        h.manager
            .handle_node_failure(&NodeId::from("c"), FailureType::Timeout, None)
            .await;

        // ASSERT
        let health = h.manager.get_system_health();
        assert_eq!(health.total_nodes, 3);
        assert_eq!(health.healthy_nodes, 2);
        assert_eq!(health.system_status, SystemStatus::Degraded);
        assert!((health.health_percentage - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_empty_grid_is_critical() {
        let h = Harness::new(&[]);

        let health = h.manager.get_system_health();

        assert_eq!(health.total_nodes, 0);
        assert_eq!(health.health_percentage, 0.0);
        assert_eq!(health.system_status, SystemStatus::Critical);
        assert_eq!(h.events.published_count(EventKind::NodeFailure), 0);
    }
}
