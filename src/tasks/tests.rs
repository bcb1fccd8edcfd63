//! Task Module Tests
//!
//! ## Test Scopes
//! - **Priority handling**: bumps saturate at the maximum priority.
//! - **Filters**: status / node filters select the right records.
//! - **InMemoryTaskStore**: lifecycle transitions and the `TaskService` contract.

#[cfg(test)]
mod tests {
    use crate::registry::types::NodeId;
    use crate::tasks::service::TaskService;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::tasks::types::*;

    // ============================================================
    // PRIORITY TESTS
    // ============================================================

    #[test]
    fn test_priority_bump_is_capped() {
        assert_eq!(bump_priority(3, 1), 4);
        assert_eq!(bump_priority(9, 2), MAX_PRIORITY);
        assert_eq!(bump_priority(10, 1), MAX_PRIORITY);
        assert_eq!(bump_priority(u8::MAX, 1), MAX_PRIORITY);
    }

    #[test]
    fn test_derived_task_keeps_scheduling_data() {
        let mut original = NewTask::new(5, serde_json::json!({"model": "llama"})).into_record();
        original.retry_count = 2;
        original.requirements.workload_type = Some("text-generation".into());

        let derived = NewTask::derived_from(&original).with_priority_bump(2);

        assert_eq!(derived.priority, 7);
        assert_eq!(derived.retry_count, 2);
        assert_eq!(derived.payload, original.payload);
        assert_eq!(derived.requirements, original.requirements);
        assert_eq!(
            derived.metadata.get("original_task_id"),
            Some(&serde_json::Value::String(original.id.0.clone()))
        );
        assert!(derived.assigned_node.is_none());
    }

    // ============================================================
    // FILTER TESTS
    // ============================================================

    #[test]
    fn test_filter_matches_status_and_node() {
        let node = NodeId::from("node-a");
        let mut task = NewTask::new(1, serde_json::json!({})).into_record();
        task.status = TaskStatus::Running;
        task.assigned_node = Some(node.clone());

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::running().matches(&task));
        assert!(TaskFilter::running_on(&node).matches(&task));
        assert!(!TaskFilter::running_on(&NodeId::from("node-b")).matches(&task));

        task.status = TaskStatus::Completed;
        assert!(!TaskFilter::running_on(&node).matches(&task));
    }

    // ============================================================
    // IN-MEMORY STORE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_store_lifecycle() {
        // ARRANGE
        let store = InMemoryTaskStore::new();
        let node = NodeId::from("worker-1");
        let created = store
            .create_task(NewTask::new(4, serde_json::json!({"prompt": "hello"})))
            .await
            .unwrap();

        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(store.len(), 1);

        // ACT: start and complete
        store.start_task(&created.id, &node).unwrap();
        let running = store.get_tasks(TaskFilter::running_on(&node)).await.unwrap();

        // ASSERT
        assert_eq!(running.len(), 1);
        assert!(running[0].started_at.is_some());

        store.complete_task(&created.id, Ok(())).unwrap();
        assert_eq!(store.get(&created.id).unwrap().status, TaskStatus::Completed);
        assert!(store.get_tasks(TaskFilter::running()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_start_requires_pending() {
        let store = InMemoryTaskStore::new();
        let node = NodeId::from("worker-1");
        let created = store
            .create_task(NewTask::new(1, serde_json::json!({})))
            .await
            .unwrap();

        store.start_task(&created.id, &node).unwrap();
        let second = store.start_task(&created.id, &node);

        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_store_cancel() {
        let store = InMemoryTaskStore::new();
        let created = store
            .create_task(NewTask::new(1, serde_json::json!({})))
            .await
            .unwrap();

        store.cancel_task(&created.id).await.unwrap();
        assert_eq!(store.get(&created.id).unwrap().status, TaskStatus::Cancelled);

        // Cancelling twice or cancelling an unknown task is an error
        assert!(store.cancel_task(&created.id).await.is_err());
        assert!(store.cancel_task(&TaskId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_store_failure_records_error() {
        let store = InMemoryTaskStore::new();
        let created = store
            .create_task(NewTask::new(1, serde_json::json!({})))
            .await
            .unwrap();

        store
            .complete_task(&created.id, Err(anyhow::anyhow!("CUDA out of memory")))
            .unwrap();

        let task = store.get(&created.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.metadata.get("error").and_then(|v| v.as_str()),
            Some("CUDA out of memory")
        );
        assert_eq!(store.count_by_status(TaskStatus::Failed), 1);
    }
}
