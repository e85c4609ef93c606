use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use esc_domain::{
    ElasticInferenceAccelerator, ElbTarget, InstanceDescriptor, InstanceId, LaunchSpecification,
    MetricAlarm, SpotRequestDescriptor, Tag, TargetHealthState, VolumeDescriptor,
};

use crate::error::DriverError;
use crate::traits::{AcceleratorClient, ComputeClient, KeyManagementClient, LoadBalancerClient, MetricAlarmClient};

/// In-memory `ComputeClient`: no real I/O, seeded with instances/volumes
/// and mutated the way a real EC2 API call would mutate live state.
/// Grounded in `nclav-driver::local::LocalDriver`'s "synthesize a plausible
/// response" approach.
#[derive(Default)]
pub struct FakeComputeClient {
    instances: Mutex<HashMap<String, InstanceDescriptor>>,
    volumes: Mutex<HashMap<String, VolumeDescriptor>>,
    spot_requests: Mutex<HashMap<String, SpotRequestDescriptor>>,
    images: Mutex<HashMap<String, Value>>,
    next_id: Mutex<u64>,
    fail_next_image: Mutex<bool>,
}

impl FakeComputeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_instance(&self, instance: InstanceDescriptor) {
        self.instances.lock().unwrap().insert(instance.instance_id.as_str().to_string(), instance);
    }

    pub fn seed_volume(&self, volume: VolumeDescriptor) {
        self.volumes.lock().unwrap().insert(volume.volume_id.clone(), volume);
    }

    pub fn seed_spot_request(&self, req: SpotRequestDescriptor) {
        self.spot_requests.lock().unwrap().insert(req.spot_instance_request_id.clone(), req);
    }

    /// Makes the next `create_image` call land in `failed` state instead of
    /// `available`, for exercising `wait-ami`'s rewind path.
    pub fn fail_next_image(&self) {
        *self.fail_next_image.lock().unwrap() = true;
    }

    fn next_synthetic_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        format!("{prefix}-fake{:08x}", *n)
    }
}

#[async_trait]
impl ComputeClient for FakeComputeClient {
    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<InstanceDescriptor>, DriverError> {
        let instances = self.instances.lock().unwrap();
        Ok(instance_ids
            .iter()
            .filter_map(|id| instances.get(id.as_str()).cloned())
            .collect())
    }

    async fn describe_instance_attribute(&self, instance_id: &InstanceId, attribute: &str) -> Result<Value, DriverError> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(instance_id.as_str())
            .ok_or_else(|| DriverError::Api(format!("unknown instance {instance_id}")))?;
        Ok(match attribute {
            "userData" => json!({ "value": instance.user_data }),
            "disableApiTermination" => json!({ "value": instance.api_termination_protection.unwrap_or(false) }),
            _ => Value::Null,
        })
    }

    async fn stop_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        let mut instances = self.instances.lock().unwrap();
        for id in instance_ids {
            if let Some(instance) = instances.get_mut(id.as_str()) {
                instance.state = esc_domain::InstanceState("stopped".to_string());
            }
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        let mut instances = self.instances.lock().unwrap();
        for id in instance_ids {
            if let Some(instance) = instances.get_mut(id.as_str()) {
                instance.state = esc_domain::InstanceState("terminated".to_string());
            }
        }
        Ok(())
    }

    async fn reboot_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        debug!(?instance_ids, "fake reboot_instances");
        Ok(())
    }

    async fn run_instances(&self, spec: &LaunchSpecification) -> Result<InstanceId, DriverError> {
        let id = InstanceId::new(self.next_synthetic_id("i"));
        // Boots immediately in this fake, the same way `create_image` below
        // skips a transient "pending" state: there is no background actor
        // to advance it later.
        let descriptor = InstanceDescriptor {
            instance_id: id.clone(),
            instance_type: spec.instance_type.clone(),
            architecture: "x86_64".to_string(),
            state: esc_domain::InstanceState("running".to_string()),
            image_id: spec.image_id.clone(),
            key_name: spec.key_name.clone(),
            ebs_optimized: spec.ebs_optimized,
            monitoring_enabled: spec.monitoring_enabled,
            placement: spec.placement.clone(),
            spot_instance_request_id: None,
            cpu_options: spec.cpu_options.clone(),
            credit_specification: spec.credit_specification.clone(),
            capacity_reservation_specification: spec.capacity_reservation_specification.clone(),
            hibernation_options: spec.hibernation_configured.map(|configured| esc_domain::HibernationOptions { configured }),
            metadata_options: spec.metadata_options.clone(),
            enclave_options: spec.enclave_options.clone(),
            instance_initiated_shutdown_behavior: spec.instance_initiated_shutdown_behavior.clone(),
            licenses: spec.licenses.clone(),
            iam_instance_profile_arn: spec.iam_instance_profile_arn.clone(),
            user_data: spec.user_data.clone(),
            block_device_mappings: Vec::new(),
            network_interfaces: Vec::new(),
            elastic_gpu_associations: Vec::new(),
            elastic_inference_accelerator_arns: Vec::new(),
            tags: spec.tags.clone(),
            api_termination_protection: None,
            disable_api_stop_protection: None,
        };
        self.instances.lock().unwrap().insert(id.as_str().to_string(), descriptor);
        Ok(id)
    }

    async fn create_image(&self, instance_id: &InstanceId, name: &str, block_devices: &Value) -> Result<String, DriverError> {
        let image_id = self.next_synthetic_id("ami");
        let snapshot_ids: Vec<String> = block_devices
            .as_array()
            .map(|devices| (0..devices.len()).map(|i| format!("{image_id}-snap-{i}")).collect())
            .unwrap_or_default();
        let state = if std::mem::take(&mut *self.fail_next_image.lock().unwrap()) { "failed" } else { "available" };
        self.images.lock().unwrap().insert(
            image_id.clone(),
            json!({
                "name": name, "state": state, "source_instance": instance_id.as_str(),
                "block_devices": block_devices, "snapshot_ids": snapshot_ids,
            }),
        );
        Ok(image_id)
    }

    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<Value>, DriverError> {
        let images = self.images.lock().unwrap();
        Ok(image_ids.iter().filter_map(|id| images.get(id).cloned()).collect())
    }

    async fn deregister_image(&self, image_id: &str) -> Result<(), DriverError> {
        self.images.lock().unwrap().remove(image_id);
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError> {
        let mut instances = self.instances.lock().unwrap();
        for resource_id in resource_ids {
            if let Some(instance) = instances.get_mut(resource_id.as_str()) {
                for tag in tags {
                    instance.tags.retain(|t| t.key != tag.key);
                    instance.tags.push(tag.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError> {
        let mut instances = self.instances.lock().unwrap();
        for resource_id in resource_ids {
            if let Some(instance) = instances.get_mut(resource_id.as_str()) {
                instance.tags.retain(|t| !tags.iter().any(|tag| tag.key == t.key));
            }
        }
        Ok(())
    }

    async fn create_snapshot(&self, _volume_id: &str) -> Result<String, DriverError> {
        Ok(self.next_synthetic_id("snap"))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>, DriverError> {
        let volumes = self.volumes.lock().unwrap();
        Ok(volume_ids.iter().filter_map(|id| volumes.get(id).cloned()).collect())
    }

    async fn detach_volume(&self, volume_id: &str, _instance_id: &InstanceId) -> Result<(), DriverError> {
        let mut volumes = self.volumes.lock().unwrap();
        if let Some(volume) = volumes.get_mut(volume_id) {
            volume.attachments.clear();
        }
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &InstanceId, device: &str) -> Result<(), DriverError> {
        let mut volumes = self.volumes.lock().unwrap();
        if let Some(volume) = volumes.get_mut(volume_id) {
            volume.attachments.push(esc_domain::VolumeAttachment {
                instance_id: instance_id.as_str().to_string(),
                device: device.to_string(),
                state: "attached".to_string(),
            });
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), DriverError> {
        self.volumes.lock().unwrap().remove(volume_id);
        Ok(())
    }

    async fn describe_network_interfaces(&self, eni_ids: &[String]) -> Result<Vec<Value>, DriverError> {
        Ok(eni_ids
            .iter()
            .map(|id| json!({ "network_interface_id": id, "status": "available", "attachment": { "instanceId": Value::Null } }))
            .collect())
    }

    async fn modify_network_interface_attribute(&self, _eni_id: &str, _attachment_id: &str, _delete_on_termination: bool) -> Result<(), DriverError> {
        Ok(())
    }

    async fn describe_addresses(&self, public_ips: &[String]) -> Result<Vec<Value>, DriverError> {
        Ok(public_ips.iter().map(|ip| json!({ "public_ip": ip, "allocation_id": format!("eipalloc-{ip}") })).collect())
    }

    async fn associate_address(&self, _instance_id: &InstanceId, _allocation_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn describe_elastic_gpus(&self, _instance_id: &InstanceId) -> Result<Vec<Value>, DriverError> {
        Ok(Vec::new())
    }

    async fn describe_spot_instance_requests(&self, request_ids: &[String]) -> Result<Vec<SpotRequestDescriptor>, DriverError> {
        let reqs = self.spot_requests.lock().unwrap();
        Ok(request_ids.iter().filter_map(|id| reqs.get(id).cloned()).collect())
    }

    async fn cancel_spot_instance_requests(&self, request_ids: &[String]) -> Result<(), DriverError> {
        let mut reqs = self.spot_requests.lock().unwrap();
        for id in request_ids {
            if let Some(req) = reqs.get_mut(id) {
                req.state = "cancelled".to_string();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAcceleratorClient {
    accelerators: Mutex<HashMap<String, Vec<ElasticInferenceAccelerator>>>,
}

impl FakeAcceleratorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, instance_id: &InstanceId, accelerators: Vec<ElasticInferenceAccelerator>) {
        self.accelerators.lock().unwrap().insert(instance_id.as_str().to_string(), accelerators);
    }
}

#[async_trait]
impl AcceleratorClient for FakeAcceleratorClient {
    async fn describe_accelerators(&self, instance_id: &InstanceId) -> Result<Vec<ElasticInferenceAccelerator>, DriverError> {
        Ok(self.accelerators.lock().unwrap().get(instance_id.as_str()).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeKeyManagementClient {
    keys: Mutex<HashMap<String, Value>>,
}

impl FakeKeyManagementClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, key_id: &str) {
        self.keys.lock().unwrap().insert(key_id.to_string(), json!({ "KeyMetadata": { "KeyId": key_id, "Enabled": true } }));
    }
}

#[async_trait]
impl KeyManagementClient for FakeKeyManagementClient {
    async fn describe_key(&self, key_id: &str) -> Result<Value, DriverError> {
        self.keys
            .lock()
            .unwrap()
            .get(key_id)
            .cloned()
            .ok_or_else(|| DriverError::Api(format!("unknown key {key_id}")))
    }
}

#[derive(Default)]
pub struct FakeLoadBalancerClient {
    target_groups: Mutex<Vec<String>>,
    health: Mutex<HashMap<String, Vec<(ElbTarget, TargetHealthState)>>>,
}

impl FakeLoadBalancerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_target_group(&self, arn: &str) {
        self.target_groups.lock().unwrap().push(arn.to_string());
    }

    pub fn seed_health(&self, target_group_arn: &str, targets: Vec<(ElbTarget, TargetHealthState)>) {
        self.health.lock().unwrap().insert(target_group_arn.to_string(), targets);
    }
}

#[async_trait]
impl LoadBalancerClient for FakeLoadBalancerClient {
    async fn describe_target_groups(&self, target_group_arns: &[String]) -> Result<Vec<String>, DriverError> {
        let known = self.target_groups.lock().unwrap();
        Ok(target_group_arns.iter().filter(|arn| known.contains(arn)).cloned().collect())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<(ElbTarget, TargetHealthState)>, DriverError> {
        Ok(self.health.lock().unwrap().get(target_group_arn).cloned().unwrap_or_default())
    }

    async fn register_targets(&self, target_group_arn: &str, _instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError> {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(target_group_arn.to_string()).or_default();
        for target in targets {
            entry.push((target.clone(), TargetHealthState::Initial));
        }
        Ok(())
    }

    async fn deregister_targets(&self, target_group_arn: &str, _instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError> {
        let mut health = self.health.lock().unwrap();
        if let Some(entry) = health.get_mut(target_group_arn) {
            entry.retain(|(t, _)| !targets.iter().any(|x| x.port == t.port));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetricAlarmClient {
    alarms: Mutex<HashMap<String, MetricAlarm>>,
}

impl FakeMetricAlarmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, alarm: MetricAlarm) {
        self.alarms.lock().unwrap().insert(alarm.alarm_name.clone(), alarm);
    }
}

#[async_trait]
impl MetricAlarmClient for FakeMetricAlarmClient {
    async fn describe_alarms(&self, alarm_names: &[String]) -> Result<Vec<MetricAlarm>, DriverError> {
        let alarms = self.alarms.lock().unwrap();
        if alarm_names.is_empty() {
            return Ok(alarms.values().cloned().collect());
        }
        Ok(alarm_names.iter().filter_map(|name| alarms.get(name).cloned()).collect())
    }

    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<(), DriverError> {
        self.alarms.lock().unwrap().insert(alarm.alarm_name.clone(), alarm.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esc_domain::{InstanceState, Placement};

    fn test_instance(id: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: InstanceId::new(id),
            instance_type: "m5.large".to_string(),
            architecture: "x86_64".to_string(),
            state: InstanceState("running".to_string()),
            image_id: "ami-1".to_string(),
            key_name: None,
            ebs_optimized: false,
            monitoring_enabled: false,
            placement: Placement { availability_zone: "us-east-1a".to_string(), tenancy: "default".to_string() },
            spot_instance_request_id: None,
            cpu_options: None,
            credit_specification: None,
            capacity_reservation_specification: None,
            hibernation_options: None,
            metadata_options: None,
            enclave_options: None,
            instance_initiated_shutdown_behavior: None,
            licenses: Vec::new(),
            iam_instance_profile_arn: None,
            user_data: None,
            block_device_mappings: Vec::new(),
            network_interfaces: Vec::new(),
            elastic_gpu_associations: Vec::new(),
            elastic_inference_accelerator_arns: Vec::new(),
            tags: Vec::new(),
            api_termination_protection: None,
            disable_api_stop_protection: None,
        }
    }

    #[tokio::test]
    async fn stop_instances_updates_state() {
        let client = FakeComputeClient::new();
        client.seed_instance(test_instance("i-1"));
        client.stop_instances(&[InstanceId::new("i-1")]).await.unwrap();
        let instances = client.describe_instances(&[InstanceId::new("i-1")]).await.unwrap();
        assert!(instances[0].state.is_stopped());
    }

    #[tokio::test]
    async fn run_instances_creates_a_fresh_instance() {
        let client = FakeComputeClient::new();
        let spec = LaunchSpecification {
            block_device_mappings: Vec::new(),
            ebs_optimized: false,
            image_id: "ami-1".to_string(),
            instance_type: "m5.large".to_string(),
            key_name: None,
            monitoring_enabled: false,
            capacity_reservation_specification: None,
            hibernation_configured: None,
            network_interfaces: Vec::new(),
            placement: Placement { availability_zone: "us-east-1a".to_string(), tenancy: "default".to_string() },
            instance_initiated_shutdown_behavior: None,
            elastic_gpu_specification: Vec::new(),
            elastic_inference_accelerators: None,
            iam_instance_profile_arn: None,
            user_data: None,
            cpu_options: None,
            credit_specification: None,
            tags: Vec::new(),
            instance_market_options: None,
            metadata_options: None,
            enclave_options: None,
            licenses: Vec::new(),
        };
        let id = client.run_instances(&spec).await.unwrap();
        let instances = client.describe_instances(&[id]).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_type, "m5.large");
    }

    #[tokio::test]
    async fn create_tags_overwrites_existing_key() {
        let client = FakeComputeClient::new();
        let mut instance = test_instance("i-1");
        instance.tags.push(Tag { key: "Name".to_string(), value: "old".to_string() });
        client.seed_instance(instance);

        client
            .create_tags(&["i-1".to_string()], &[Tag { key: "Name".to_string(), value: "new".to_string() }])
            .await
            .unwrap();

        let instances = client.describe_instances(&[InstanceId::new("i-1")]).await.unwrap();
        assert_eq!(instances[0].tag("Name"), Some("new"));
    }
}
