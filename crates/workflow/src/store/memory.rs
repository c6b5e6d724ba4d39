use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{StateKey, StoreError, WorkflowStore};
use crate::types::{StepRecord, StepResultRecord, WorkflowRecord, WorkflowStatus};

/// Key/value store holding JSON documents under `workflows/...` keys.
/// Used by tests and the ephemeral deployment.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    entries: DashMap<String, Value>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn read<T: DeserializeOwned>(&self, key: StateKey<'_>) -> Result<Option<T>, StoreError> {
        let key = key.to_string();
        // Clone out so no shard guard outlives this call
        let value = match self.entries.get(&key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key,
                reason: err.to_string(),
            })
    }

    fn write<T: Serialize>(&self, key: StateKey<'_>, record: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Every workflow document, skipping step and result keys.
    fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let values: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with("workflows/") && !entry.key().contains(':'))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        values
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value::<WorkflowRecord>(value).map_err(|err| StoreError::Corrupt {
                    key,
                    reason: err.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        first_step: Option<&StepRecord>,
    ) -> Result<(), StoreError> {
        // Serialize everything up front so nothing can fail after the first insert
        let workflow_value = serde_json::to_value(workflow)?;
        let step_value = first_step.map(serde_json::to_value).transpose()?;

        match self.entries.entry(StateKey::Workflow(&workflow.id).to_string()) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate(workflow.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(workflow_value);
            }
        }

        if let (Some(step), Some(value)) = (first_step, step_value) {
            self.entries
                .insert(StateKey::Step(&step.workflow_id, step.index).to_string(), value);
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        self.read(StateKey::Workflow(id))
    }

    async fn update_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let key = StateKey::Workflow(&workflow.id).to_string();
        if !self.entries.contains_key(&key) {
            return Err(StoreError::Missing(key));
        }
        self.write(StateKey::Workflow(&workflow.id), workflow)
    }

    async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut workflows = self.workflows()?;
        workflows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        workflows.truncate(limit);
        Ok(workflows)
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut workflows = self.workflows()?;
        workflows.retain(|w| w.status == status);
        workflows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(workflows)
    }

    async fn put_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let mut step = step.clone();
        if let Some(existing) = self.read::<StepRecord>(StateKey::Step(&step.workflow_id, step.index))? {
            step.started_at = existing.started_at;
        }
        self.write(StateKey::Step(&step.workflow_id, step.index), &step)
    }

    async fn get_step(&self, id: &str, index: usize) -> Result<Option<StepRecord>, StoreError> {
        self.read(StateKey::Step(id, index))
    }

    async fn put_result(&self, result: &StepResultRecord) -> Result<(), StoreError> {
        let step_key = StateKey::Step(&result.workflow_id, result.index).to_string();
        if !self.entries.contains_key(&step_key) {
            return Err(StoreError::NotDispatched {
                workflow_id: result.workflow_id.clone(),
                index: result.index,
            });
        }

        let mut result = result.clone();
        if let Some(existing) =
            self.read::<StepResultRecord>(StateKey::Result(&result.workflow_id, result.index))?
        {
            result.completed_at = existing.completed_at;
        }
        self.write(StateKey::Result(&result.workflow_id, result.index), &result)
    }

    async fn get_result(
        &self,
        id: &str,
        index: usize,
    ) -> Result<Option<StepResultRecord>, StoreError> {
        self.read(StateKey::Result(id, index))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;
    use crate::test_support::{sample_record, sample_step};

    #[tokio::test]
    async fn create_writes_workflow_and_first_step_under_layout_keys() {
        let store = MemoryWorkflowStore::new();
        let record = sample_record("wf-1", 2);
        let step = sample_step(&record, 0);

        store.create_workflow(&record, Some(&step)).await.unwrap();

        assert!(store.entries.contains_key("workflows/wf-1"));
        assert!(store.entries.contains_key("workflows/wf-1:step:0"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get_workflow("wf-1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn duplicate_workflow_is_rejected_without_touching_steps() {
        let store = MemoryWorkflowStore::new();
        let record = sample_record("wf-1", 1);
        store.create_workflow(&record, None).await.unwrap();

        let step = sample_step(&record, 0);
        let err = store.create_workflow(&record, Some(&step)).await.unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(id) if id == "wf-1"));
        assert!(store.get_step("wf-1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redispatch_keeps_first_start_time() {
        let store = MemoryWorkflowStore::new();
        let record = sample_record("wf-1", 1);
        let step = sample_step(&record, 0);
        store.create_workflow(&record, Some(&step)).await.unwrap();

        let mut retry = step.clone();
        retry.attempt = 2;
        retry.started_at = step.started_at + Duration::seconds(10);
        store.put_step(&retry).await.unwrap();

        let stored = store.get_step("wf-1", 0).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.started_at, step.started_at);
    }

    #[tokio::test]
    async fn result_requires_dispatch_and_keeps_first_completion() {
        let store = MemoryWorkflowStore::new();
        let record = sample_record("wf-1", 2);
        store.create_workflow(&record, Some(&sample_step(&record, 0))).await.unwrap();

        let early = StepResultRecord {
            workflow_id: "wf-1".into(),
            index: 1,
            result: json!({"response": "too soon"}),
            completed_at: Utc::now(),
        };
        assert!(matches!(
            store.put_result(&early).await,
            Err(StoreError::NotDispatched { index: 1, .. })
        ));

        let first = StepResultRecord { index: 0, ..early.clone() };
        store.put_result(&first).await.unwrap();
        let again = StepResultRecord {
            completed_at: first.completed_at + Duration::seconds(3),
            ..first.clone()
        };
        store.put_result(&again).await.unwrap();

        let stored = store.get_result("wf-1", 0).await.unwrap().unwrap();
        assert_eq!(stored.completed_at, first.completed_at);
    }

    #[tokio::test]
    async fn list_skips_step_and_result_keys() {
        let store = MemoryWorkflowStore::new();
        let now = Utc::now();
        for (id, age) in [("wf-a", 30), ("wf-b", 0), ("wf-c", 15)] {
            let mut record = sample_record(id, 1);
            record.started_at = now - Duration::seconds(age);
            store
                .create_workflow(&record, Some(&sample_step(&record, 0)))
                .await
                .unwrap();
        }

        let listed = store.list_workflows(10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-b", "wf-c", "wf-a"]);
        assert_eq!(store.list_workflows(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_by_status_keeps_only_matching_workflows() {
        let store = MemoryWorkflowStore::new();
        let now = Utc::now();
        for (id, age, status) in [
            ("wf-new", 0, WorkflowStatus::Processing),
            ("wf-done", 20, WorkflowStatus::Completed),
            ("wf-old", 40, WorkflowStatus::Processing),
        ] {
            let mut record = sample_record(id, 1);
            record.started_at = now - Duration::seconds(age);
            record.status = status;
            store.create_workflow(&record, None).await.unwrap();
        }

        let running = store.list_by_status(WorkflowStatus::Processing).await.unwrap();
        let ids: Vec<_> = running.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-old", "wf-new"]);
    }

    #[tokio::test]
    async fn update_of_unknown_workflow_is_missing() {
        let store = MemoryWorkflowStore::new();
        let err = store
            .update_workflow(&sample_record("ghost", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(key) if key == "workflows/ghost"));
    }
}
