use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::steps::StepName;
use crate::types::{
    AmiBlockDevice, CpuOptionsArg, ElasticGpu, ElbTarget, InstanceDescriptor, InstanceId,
    JobId, LaunchSpecification, SpotRequestDescriptor, VolumeDescriptor,
};

/// The durable per-job record (spec §3). Every field past `tool_version`
/// is an artifact produced by some step; `ConversionStep`, once set to step
/// `S`, implies every artifact of `S` and its predecessors is present
/// (invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub job_id: JobId,
    pub tool_version: String,
    pub conversion_step: Option<StepName>,
    #[serde(default)]
    pub conversion_step_reasons: HashMap<StepName, String>,
    #[serde(default)]
    pub conversion_step_cmdline_args: HashMap<StepName, serde_json::Value>,

    pub initial_instance_state: Option<InstanceDescriptor>,
    pub spot_request: Option<SpotRequestDescriptor>,
    pub cpu_options: Option<CpuOptionsArg>,
    pub volume_details: Option<Vec<VolumeDescriptor>>,
    pub elb_targets: Option<Vec<ElbTarget>>,
    pub conversion_start_instance_state: Option<InstanceDescriptor>,
    pub eni_ids: Option<Vec<String>>,
    pub detached_volumes: Option<Vec<String>>,
    pub without_extra_volumes_instance_state: Option<InstanceDescriptor>,
    pub volumes_in_ami: Option<Vec<AmiBlockDevice>>,
    pub image_id: Option<String>,
    pub instance_state_checkpoint: Option<InstanceDescriptor>,
    pub elastic_gpus: Option<Vec<ElasticGpu>>,
    pub new_instance_launch_specification: Option<LaunchSpecification>,
    pub new_instance_id: Option<InstanceId>,
    pub new_instance_details: Option<InstanceDescriptor>,
    pub reattached_volumes_instance_state: Option<InstanceDescriptor>,
    pub final_instance_state: Option<InstanceDescriptor>,
    pub start_time: Option<i64>,
    pub start_date: Option<String>,
    pub end_time: Option<i64>,
    pub failed_stop: Option<bool>,
    pub rebooted: Option<bool>,
}

impl ConversionRecord {
    pub fn new(job_id: JobId, tool_version: impl Into<String>) -> Self {
        Self {
            job_id,
            tool_version: tool_version.into(),
            conversion_step: None,
            conversion_step_reasons: HashMap::new(),
            conversion_step_cmdline_args: HashMap::new(),
            initial_instance_state: None,
            spot_request: None,
            cpu_options: None,
            volume_details: None,
            elb_targets: None,
            conversion_start_instance_state: None,
            eni_ids: None,
            detached_volumes: None,
            without_extra_volumes_instance_state: None,
            volumes_in_ami: None,
            image_id: None,
            instance_state_checkpoint: None,
            elastic_gpus: None,
            new_instance_launch_specification: None,
            new_instance_id: None,
            new_instance_details: None,
            reattached_volumes_instance_state: None,
            final_instance_state: None,
            start_time: None,
            start_date: None,
            end_time: None,
            failed_stop: None,
            rebooted: None,
        }
    }

    /// Merge a handler's delta into the record (spec §4.3 step 2e: "persist
    /// every key of delta except JobId"). Merging the same value twice is a
    /// no-op at the record level; idempotent persistence lives in the State
    /// Store (spec §4.2).
    pub fn apply_delta(&mut self, delta: ConversionRecordDelta) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if delta.$field.is_some() { self.$field = delta.$field; })*
            };
        }
        take!(
            initial_instance_state,
            spot_request,
            cpu_options,
            volume_details,
            elb_targets,
            conversion_start_instance_state,
            eni_ids,
            detached_volumes,
            without_extra_volumes_instance_state,
            volumes_in_ami,
            image_id,
            instance_state_checkpoint,
            elastic_gpus,
            new_instance_launch_specification,
            new_instance_id,
            new_instance_details,
            reattached_volumes_instance_state,
            final_instance_state,
            start_time,
            start_date,
            end_time,
            failed_stop,
            rebooted,
        );
    }
}

/// The additive delta a step handler hands back to the Engine (spec §4.1:
/// handler contract `{ok, message, delta}`). Every field mirrors one
/// artifact on [`ConversionRecord`]; a handler only sets the fields it
/// actually produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionRecordDelta {
    pub initial_instance_state: Option<InstanceDescriptor>,
    pub spot_request: Option<SpotRequestDescriptor>,
    pub cpu_options: Option<CpuOptionsArg>,
    pub volume_details: Option<Vec<VolumeDescriptor>>,
    pub elb_targets: Option<Vec<ElbTarget>>,
    pub conversion_start_instance_state: Option<InstanceDescriptor>,
    pub eni_ids: Option<Vec<String>>,
    pub detached_volumes: Option<Vec<String>>,
    pub without_extra_volumes_instance_state: Option<InstanceDescriptor>,
    pub volumes_in_ami: Option<Vec<AmiBlockDevice>>,
    pub image_id: Option<String>,
    pub instance_state_checkpoint: Option<InstanceDescriptor>,
    pub elastic_gpus: Option<Vec<ElasticGpu>>,
    pub new_instance_launch_specification: Option<LaunchSpecification>,
    pub new_instance_id: Option<InstanceId>,
    pub new_instance_details: Option<InstanceDescriptor>,
    pub reattached_volumes_instance_state: Option<InstanceDescriptor>,
    pub final_instance_state: Option<InstanceDescriptor>,
    pub start_time: Option<i64>,
    pub start_date: Option<String>,
    pub end_time: Option<i64>,
    pub failed_stop: Option<bool>,
    pub rebooted: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_delta_only_overwrites_present_fields() {
        let mut record = ConversionRecord::new(JobId::new("i-1"), "0.1.0");
        record.image_id = Some("ami-1".to_string());

        let delta = ConversionRecordDelta {
            end_time: Some(42),
            ..Default::default()
        };
        record.apply_delta(delta);

        assert_eq!(record.image_id.as_deref(), Some("ami-1"));
        assert_eq!(record.end_time, Some(42));
    }
}
