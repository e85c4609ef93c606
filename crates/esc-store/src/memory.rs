use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use esc_domain::{ConversionRecord, ConversionRecordDelta, JobId, StepName};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::hash::delta_present_fields;
use crate::store::StateStore;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, ConversionRecord>,
    field_hashes: HashMap<JobId, HashMap<String, String>>,
}

/// In-memory [`StateStore`] implementation (teacher: `nclav-store::memory::
/// InMemoryStore`). All data is lost on process exit; used by tests, dry
/// runs, and `FakeComputeClient`-backed scenarios.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, job_id: &JobId) -> Result<Option<ConversionRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.records.get(job_id).cloned())
    }

    async fn create(&self, job_id: &JobId, tool_version: &str) -> Result<ConversionRecord, StoreError> {
        let mut guard = self.inner.write().await;
        let record = ConversionRecord::new(job_id.clone(), tool_version);
        guard.records.insert(job_id.clone(), record.clone());
        Ok(record)
    }

    async fn commit_step(
        &self,
        job_id: &JobId,
        step: StepName,
        message: String,
        cmdline_args: serde_json::Value,
        delta: ConversionRecordDelta,
        force: bool,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;

        let present = delta_present_fields(&delta);
        let hashes = guard.field_hashes.entry(job_id.clone()).or_default();
        for (field, _value, hash) in &present {
            if force || hashes.get(field) != Some(hash) {
                hashes.insert(field.clone(), hash.clone());
            }
        }

        let record = guard
            .records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::Internal(format!("job {job_id} not found")))?;
        record.apply_delta(delta);
        record.conversion_step = Some(step);
        record.conversion_step_reasons.insert(step, message);
        record.conversion_step_cmdline_args.insert(step, cmdline_args);
        Ok(())
    }

    async fn rewind_to(&self, job_id: &JobId, step: Option<StepName>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::Internal(format!("job {job_id} not found")))?;
        record.conversion_step = step;
        Ok(())
    }

    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.records.remove(job_id);
        guard.field_hashes.remove(job_id);
        Ok(())
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esc_domain::StepName;

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-123");
        store.create(&job_id, "0.1.0").await.unwrap();

        let got = store.read(&job_id).await.unwrap().unwrap();
        assert_eq!(got.job_id, job_id);
        assert!(got.conversion_step.is_none());
    }

    #[tokio::test]
    async fn commit_step_advances_step_and_applies_delta() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-123");
        store.create(&job_id, "0.1.0").await.unwrap();

        let delta = ConversionRecordDelta {
            image_id: Some("ami-1".to_string()),
            ..Default::default()
        };
        store
            .commit_step(
                &job_id,
                StepName::CreateAmi,
                "created".to_string(),
                serde_json::json!({}),
                delta,
                false,
            )
            .await
            .unwrap();

        let record = store.read(&job_id).await.unwrap().unwrap();
        assert_eq!(record.conversion_step, Some(StepName::CreateAmi));
        assert_eq!(record.image_id.as_deref(), Some("ami-1"));
        assert_eq!(
            record.conversion_step_reasons.get(&StepName::CreateAmi).unwrap(),
            "created"
        );
    }

    #[tokio::test]
    async fn rewind_moves_step_backward() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-123");
        store.create(&job_id, "0.1.0").await.unwrap();
        store
            .commit_step(
                &job_id,
                StepName::CreateAmi,
                "created".into(),
                serde_json::json!({}),
                ConversionRecordDelta::default(),
                false,
            )
            .await
            .unwrap();

        store
            .rewind_to(&job_id, Some(StepName::PrepareNetworkInterfaces))
            .await
            .unwrap();

        let record = store.read(&job_id).await.unwrap().unwrap();
        assert_eq!(record.conversion_step, Some(StepName::PrepareNetworkInterfaces));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-123");
        store.create(&job_id, "0.1.0").await.unwrap();
        store.delete(&job_id).await.unwrap();
        assert!(store.read(&job_id).await.unwrap().is_none());
    }
}
