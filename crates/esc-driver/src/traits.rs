use async_trait::async_trait;
use serde_json::Value;

use esc_domain::{
    ElasticInferenceAccelerator, ElbTarget, InstanceDescriptor, InstanceId, LaunchSpecification,
    MetricAlarm, SpotRequestDescriptor, Tag, TargetHealthState, VolumeDescriptor,
};

use crate::error::DriverError;

/// EC2 operations (spec §5/§6). Implemented by `AwsComputeClient` (real
/// Query/XML calls over SigV4-signed `reqwest` POSTs) and `FakeComputeClient`
/// (in-memory, for tests).
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<InstanceDescriptor>, DriverError>;
    async fn describe_instance_attribute(&self, instance_id: &InstanceId, attribute: &str) -> Result<Value, DriverError>;
    async fn stop_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError>;
    async fn terminate_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError>;
    async fn reboot_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError>;
    async fn run_instances(&self, spec: &LaunchSpecification) -> Result<InstanceId, DriverError>;
    async fn create_image(&self, instance_id: &InstanceId, name: &str, block_devices: &Value) -> Result<String, DriverError>;
    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<Value>, DriverError>;
    async fn deregister_image(&self, image_id: &str) -> Result<(), DriverError>;
    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError>;
    async fn delete_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError>;
    async fn create_snapshot(&self, volume_id: &str) -> Result<String, DriverError>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), DriverError>;
    async fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>, DriverError>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &InstanceId) -> Result<(), DriverError>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &InstanceId, device: &str) -> Result<(), DriverError>;
    async fn delete_volume(&self, volume_id: &str) -> Result<(), DriverError>;
    async fn describe_network_interfaces(&self, eni_ids: &[String]) -> Result<Vec<Value>, DriverError>;
    async fn modify_network_interface_attribute(&self, eni_id: &str, attachment_id: &str, delete_on_termination: bool) -> Result<(), DriverError>;
    async fn describe_addresses(&self, public_ips: &[String]) -> Result<Vec<Value>, DriverError>;
    async fn associate_address(&self, instance_id: &InstanceId, allocation_id: &str) -> Result<(), DriverError>;
    async fn describe_elastic_gpus(&self, instance_id: &InstanceId) -> Result<Vec<Value>, DriverError>;
    async fn describe_spot_instance_requests(&self, request_ids: &[String]) -> Result<Vec<SpotRequestDescriptor>, DriverError>;
    async fn cancel_spot_instance_requests(&self, request_ids: &[String]) -> Result<(), DriverError>;
}

/// Elastic Inference accelerator lookups (spec §4.4 create-new-instance).
#[async_trait]
pub trait AcceleratorClient: Send + Sync {
    async fn describe_accelerators(&self, instance_id: &InstanceId) -> Result<Vec<ElasticInferenceAccelerator>, DriverError>;
}

/// KMS key validation, used only to check `--volume-kms-key-id` up front.
#[async_trait]
pub trait KeyManagementClient: Send + Sync {
    async fn describe_key(&self, key_id: &str) -> Result<Value, DriverError>;
}

/// ELBv2 target-group membership (spec §4.4 detach/attach-from-elb).
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn describe_target_groups(&self, target_group_arns: &[String]) -> Result<Vec<String>, DriverError>;
    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<(ElbTarget, TargetHealthState)>, DriverError>;
    async fn register_targets(&self, target_group_arn: &str, instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError>;
    async fn deregister_targets(&self, target_group_arn: &str, instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError>;
}

/// CloudWatch alarm re-pointing (spec §4.4 update-cloudwatch-alarms).
#[async_trait]
pub trait MetricAlarmClient: Send + Sync {
    async fn describe_alarms(&self, alarm_names: &[String]) -> Result<Vec<MetricAlarm>, DriverError>;
    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<(), DriverError>;
}

/// Side-by-side diff presentation for `--review-conversion-result` (spec §6).
/// Out of scope to implement a real diff UI; the default shells out to
/// `diff`/`vimdiff` when present, matching the original tool's vim-diff
/// behavior, and otherwise no-ops with a warning.
#[async_trait]
pub trait DiffViewer: Send + Sync {
    async fn show(&self, old: &Value, new: &Value) -> Result<(), DriverError>;
}
