use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use esc_domain::{ConversionRecord, JobId, StepGate, StepName, STEP_ORDER};
use esc_store::StateStore;

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handlers;

/// Drives a job's record through [`STEP_ORDER`] (spec §4.3). One `Engine`
/// per invocation; all mutable state lives in the record, not here.
pub struct Engine {
    ctx: EngineContext,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run the job to completion, or stop at the first step whose handler
    /// reports `ok=false`. Returns the record as it stood when the run
    /// stopped, whether that's full completion or a resumable failure.
    pub async fn run(&self, job_id: &JobId) -> Result<ConversionRecord, EngineError> {
        let mut record = match self.ctx.store.read(job_id).await? {
            Some(record) => record,
            None => self.ctx.store.create(job_id, &self.ctx.tool_version).await?,
        };

        let effective_config = config_snapshot(&self.ctx.config);
        let mut last_non_skipped_config: Option<Value> = last_config_snapshot(&record);

        for step in STEP_ORDER {
            if gate_closed(step, &self.ctx.config) {
                debug!(step = %step, "SKIPPED (gate)");
                continue;
            }

            if let Some(current) = record.conversion_step {
                if step.index() <= current.index() {
                    let message = record
                        .conversion_step_reasons
                        .get(&step)
                        .cloned()
                        .unwrap_or_default();
                    info!(step = %step, message = %message, "RECOVERED STATE. SKIPPED");
                    last_non_skipped_config = record.conversion_step_cmdline_args.get(&step).cloned();
                    continue;
                }
            }

            if let Some(prior) = &last_non_skipped_config {
                warn_on_drift(step, prior, &effective_config);
            }

            info!(step = %step, "running step");
            let outcome = handlers::dispatch(step, &self.ctx, &record).await?;

            if !outcome.ok {
                if let Some(rewind_to) = outcome.rewind_to {
                    warn!(step = %step, rewind_to = %rewind_to, message = %outcome.message, "step failed, rewinding");
                    self.ctx.store.rewind_to(job_id, Some(rewind_to)).await?;
                } else {
                    warn!(step = %step, message = %outcome.message, "step failed");
                }
                return Err(EngineError::HandlerFailed { step: step.to_string(), message: outcome.message });
            }

            self.ctx
                .store
                .commit_step(job_id, step, outcome.message.clone(), effective_config.clone(), outcome.delta, true)
                .await?;

            record = self
                .ctx
                .store
                .read(job_id)
                .await?
                .ok_or_else(|| EngineError::Internal("record vanished after commit_step".into()))?;
            last_non_skipped_config = Some(effective_config.clone());
        }

        info!(
            new_instance_id = ?record.new_instance_id.as_ref().map(|i| i.as_str()),
            "conversion complete"
        );
        Ok(record)
    }
}

fn gate_closed(step: StepName, config: &esc_config::Config) -> bool {
    match step.gate() {
        StepGate::Always => false,
        StepGate::IfPresent(key) => !config_key_present(key, config),
        StepGate::IfAbsent(key) => config_key_present(key, config),
    }
}

fn config_key_present(key: esc_domain::ConfigKey, config: &esc_config::Config) -> bool {
    match key {
        esc_domain::ConfigKey::CheckTargetGroups => config.check_targetgroups.is_some(),
        esc_domain::ConfigKey::UpdateCwAlarms => config.update_cw_alarms.is_some(),
        esc_domain::ConfigKey::DeleteAmi => config.delete_ami,
    }
}

fn config_snapshot(config: &esc_config::Config) -> Value {
    serde_json::to_value(config).unwrap_or(Value::Null)
}

fn last_config_snapshot(record: &ConversionRecord) -> Option<Value> {
    let current = record.conversion_step?;
    record.conversion_step_cmdline_args.get(&current).cloned()
}

/// Compare the effective configuration against the snapshot taken the last
/// time a step actually ran (spec §4.3 step 2c). A differing recognized key
/// is a warning, never an abort.
fn warn_on_drift(step: StepName, prior: &Value, current: &Value) {
    let (Value::Object(prior), Value::Object(current)) = (prior, current) else {
        return;
    };
    let mut changed: HashMap<&str, (&Value, &Value)> = HashMap::new();
    for (key, prior_value) in prior {
        if let Some(current_value) = current.get(key) {
            if current_value != prior_value {
                changed.insert(key, (prior_value, current_value));
            }
        }
    }
    if !changed.is_empty() {
        let keys: Vec<&str> = changed.keys().copied().collect();
        warn!(step = %step, changed = ?keys, "configuration changed since the last step ran");
        for (key, (old, new)) in &changed {
            debug!(step = %step, key, ?old, ?new, "configuration drift");
        }
    }
}

/// `reset-step` operator control (spec §4.3). `step == 1` deletes the
/// record outright; `step > 1` rewinds `ConversionStep` to the name of the
/// (step - 1)th entry in [`STEP_ORDER`] so the given step runs next.
pub async fn reset_step(store: &dyn StateStore, job_id: &JobId, step: u32) -> Result<(), EngineError> {
    if step == 0 || step as usize > STEP_ORDER.len() {
        return Err(EngineError::InvalidResetStep(format!(
            "reset-step must be between 1 and {}, got {step}",
            STEP_ORDER.len()
        )));
    }
    if step == 1 {
        store.delete(job_id).await?;
        warn!(job_id = %job_id, "reset-step=1: record deleted");
        return Ok(());
    }
    let predecessor = STEP_ORDER[(step - 2) as usize];
    warn!(job_id = %job_id, step, rewind_to = %predecessor, "reset-step: operator rewind");
    store.rewind_to(job_id, Some(predecessor)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use esc_store::InMemoryStateStore;
    use serde_json::json;

    #[test]
    fn drift_warning_ignores_unrecognized_keys() {
        let prior = json!({"a": 1, "b": 2});
        let current = json!({"a": 1, "b": 2, "c": 3});
        warn_on_drift(StepName::StopInstance, &prior, &current);
    }

    #[tokio::test]
    async fn reset_step_one_deletes_the_record() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-1");
        store.create(&job_id, "0.1.0").await.unwrap();
        reset_step(&store, &job_id, 1).await.unwrap();
        assert!(store.read(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_step_n_rewinds_to_predecessor() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-1");
        store.create(&job_id, "0.1.0").await.unwrap();
        store
            .commit_step(&job_id, StepName::StopInstance, "stopped".into(), json!({}), Default::default(), true)
            .await
            .unwrap();

        reset_step(&store, &job_id, 7).await.unwrap();

        let record = store.read(&job_id).await.unwrap().unwrap();
        assert_eq!(record.conversion_step, Some(STEP_ORDER[5]));
    }

    #[tokio::test]
    async fn reset_step_rejects_out_of_range_values() {
        let store = InMemoryStateStore::new();
        let job_id = JobId::new("i-1");
        store.create(&job_id, "0.1.0").await.unwrap();
        assert!(reset_step(&store, &job_id, 0).await.is_err());
        assert!(reset_step(&store, &job_id, 27).await.is_err());
    }
}
