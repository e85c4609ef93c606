use async_trait::async_trait;
use esc_domain::{ConversionRecord, ConversionRecordDelta, JobId, StepName};

use crate::error::StoreError;

/// The durable per-job key/value store (spec §4.2). Implementations own both
/// the write-through idempotence check ("writing an artifact value equal to
/// its existing value is a no-op") and the strong-consistency read.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Strong-consistency read. `None` means no record exists for this job.
    async fn read(&self, job_id: &JobId) -> Result<Option<ConversionRecord>, StoreError>;

    /// Create a fresh record holding only `JobId` (spec §4.3 step 1: "If
    /// missing, create with only `JobId`").
    async fn create(&self, job_id: &JobId, tool_version: &str) -> Result<ConversionRecord, StoreError>;

    /// Merge `delta`'s artifacts into the record, then advance `ConversionStep`
    /// to `step` and append its success `message`/`cmdline_args` snapshot
    /// (spec §4.3 step 2e). Each artifact write is idempotent: if the encoded
    /// value already stored for a field equals the proposed value, the
    /// round-trip for that field is skipped unless `force` is set.
    async fn commit_step(
        &self,
        job_id: &JobId,
        step: StepName,
        message: String,
        cmdline_args: serde_json::Value,
        delta: ConversionRecordDelta,
        force: bool,
    ) -> Result<(), StoreError>;

    /// Operator rewind (spec §4.3 "Operator controls" and the wait-ami-failed
    /// / wait-new-instance-terminated handler rewinds). `None` means "not yet
    /// started" (used by `reset-step=1` once the record itself isn't
    /// deleted, and by handler-driven rewinds to before the first step).
    async fn rewind_to(&self, job_id: &JobId, step: Option<StepName>) -> Result<(), StoreError>;

    /// Tombstone the record (spec §3: "Resetting the Job deletes the record
    /// atomically").
    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// One-time provisioning of the backing table (spec §4.2): partition key
    /// `JobId`, GSI on `State`, pay-per-request.
    async fn create_table(&self) -> Result<(), StoreError>;
}
