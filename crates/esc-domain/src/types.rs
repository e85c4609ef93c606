use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Identifiers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(s: impl Into<String>) -> Self {
        InstanceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The Job identifier. Equal to the source instance id (used as the State
/// Store's primary key — see spec §3).
pub type JobId = InstanceId;

// ── Billing model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingModel {
    Spot,
    OnDemand,
}

impl std::fmt::Display for BillingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingModel::Spot => write!(f, "spot"),
            BillingModel::OnDemand => write!(f, "on-demand"),
        }
    }
}

// ── CPU options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOptions {
    #[serde(rename = "CoreCount")]
    pub core_count: u32,
    #[serde(rename = "ThreadsPerCore")]
    pub threads_per_core: u32,
}

/// `--cpu-options` accepts either a JSON override or the literal `ignore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuOptionsArg {
    Override(CpuOptions),
    Ignore,
}

// ── Tags ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Job-id tagging convention (spec §6): `ec2-spot-converter:job-id`.
pub const JOB_TAG_KEY: &str = "ec2-spot-converter:job-id";

/// AMI naming convention (spec §6): `ec2-spot-converter-<JobId>`.
pub fn ami_name(job_id: &JobId) -> String {
    format!("ec2-spot-converter-{}", job_id)
}

/// Reserved tag-key prefix that `run-instances` forbids on user tags. Any
/// original tag with this prefix is renamed by prepending `_` (spec §4.4
/// create-new-instance, §8 invariant 8).
pub const RESERVED_TAG_PREFIX: &str = "aws:";

pub fn rename_reserved_tags(tags: &[Tag]) -> Vec<Tag> {
    tags.iter()
        .map(|t| {
            if t.key.starts_with(RESERVED_TAG_PREFIX) {
                Tag { key: format!("_{}", t.key), value: t.value.clone() }
            } else {
                t.clone()
            }
        })
        .collect()
}

// ── Instance state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState(pub String);

impl InstanceState {
    pub fn is_stopped(&self) -> bool {
        self.0 == "stopped"
    }
    pub fn is_terminated(&self) -> bool {
        self.0 == "terminated"
    }
    pub fn is_running(&self) -> bool {
        self.0 == "running"
    }
    pub fn is_pending_or_running(&self) -> bool {
        self.0 == "pending" || self.0 == "running"
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Placement / hibernation ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub availability_zone: String,
    pub tenancy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HibernationOptions {
    pub configured: bool,
}

// ── Block devices ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBlockDevice {
    pub device_name: String,
    pub volume_id: String,
    pub delete_on_termination: bool,
}

/// Non-gp2/st1/sc1/standard volume types carry Iops/Throughput (spec §4.4
/// create-ami, create-new-instance).
pub fn volume_type_carries_performance_params(volume_type: &str) -> bool {
    !matches!(volume_type, "gp2" | "st1" | "sc1" | "standard")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub volume_id: String,
    pub size_gib: i64,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub throughput: Option<i64>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub state: String,
    pub multi_attach_enabled: bool,
    pub attachments: Vec<VolumeAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: String,
}

/// The block-device-mapping entry carried into `create-image` for a volume
/// whose `DeleteOnTermination=true` (spec §4.4 create-ami: VolumesInAMI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmiBlockDevice {
    pub device_name: String,
    pub delete_on_termination: bool,
    pub volume_size: i64,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub throughput: Option<i64>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
}

// ── Network interfaces / elastic IP ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpAssociation {
    pub public_ip: String,
    pub allocation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetworkInterface {
    pub network_interface_id: String,
    pub attachment_id: String,
    pub device_index: u32,
    pub delete_on_termination: bool,
    pub public_ip_association: Option<PublicIpAssociation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticIpAllocation {
    pub allocation_id: String,
    pub public_ip: String,
}

// ── Spot request ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequestDescriptor {
    pub spot_instance_request_id: String,
    pub state: String,
    pub request_type: String,
    pub max_price: Option<String>,
}

impl SpotRequestDescriptor {
    pub fn is_persistent(&self) -> bool {
        self.request_type == "persistent"
    }
}

// ── Elastic GPU / inference ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticGpu {
    pub elastic_gpu_id: String,
    pub elastic_gpu_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticInferenceAccelerator {
    pub accelerator_arn: String,
    pub accelerator_type: String,
}

// ── Instance descriptor ──────────────────────────────────────────────────────

/// Full descriptor of an EC2 instance, as captured at various conversion
/// checkpoints (`InitialInstanceState`, `ConversionStartInstanceState`, …
/// spec §3). Fields the tool only ever carries through unexamined are kept
/// as opaque JSON (`capacity_reservation_specification`, `metadata_options`,
/// `enclave_options`, `credit_specification`) the way driver handles are
/// opaque JSON in the teacher's cloud clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: InstanceId,
    pub instance_type: String,
    pub architecture: String,
    pub state: InstanceState,
    pub image_id: String,
    pub key_name: Option<String>,
    pub ebs_optimized: bool,
    pub monitoring_enabled: bool,
    pub placement: Placement,
    pub spot_instance_request_id: Option<String>,
    pub cpu_options: Option<CpuOptions>,
    pub credit_specification: Option<Value>,
    pub capacity_reservation_specification: Option<Value>,
    pub hibernation_options: Option<HibernationOptions>,
    pub metadata_options: Option<Value>,
    pub enclave_options: Option<Value>,
    pub instance_initiated_shutdown_behavior: Option<String>,
    pub licenses: Vec<String>,
    pub iam_instance_profile_arn: Option<String>,
    pub user_data: Option<String>,
    pub block_device_mappings: Vec<InstanceBlockDevice>,
    pub network_interfaces: Vec<InstanceNetworkInterface>,
    pub elastic_gpu_associations: Vec<String>,
    pub elastic_inference_accelerator_arns: Vec<String>,
    pub tags: Vec<Tag>,
    pub api_termination_protection: Option<bool>,
    pub disable_api_stop_protection: Option<bool>,
}

impl InstanceDescriptor {
    pub fn instance_family(&self) -> &str {
        self.instance_type.split('.').next().unwrap_or(&self.instance_type)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }
}

// ── Load balancer targets ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElbTarget {
    pub target_group_arn: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealthState {
    Initial,
    Healthy,
    Unhealthy,
    Unused,
    Draining,
    Unavailable,
}

impl std::fmt::Display for TargetHealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetHealthState::Initial => "initial",
            TargetHealthState::Healthy => "healthy",
            TargetHealthState::Unhealthy => "unhealthy",
            TargetHealthState::Unused => "unused",
            TargetHealthState::Draining => "draining",
            TargetHealthState::Unavailable => "unavailable",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TargetHealthState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "initial" => TargetHealthState::Initial,
            "healthy" => TargetHealthState::Healthy,
            "unhealthy" => TargetHealthState::Unhealthy,
            "unused" => TargetHealthState::Unused,
            "draining" => TargetHealthState::Draining,
            "unavailable" => TargetHealthState::Unavailable,
            _ => return Err(()),
        })
    }
}

// ── Metric alarms ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricAlarm {
    pub alarm_name: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<(String, String)>,
    /// Opaque bag of the remaining supported alarm properties, carried
    /// through unexamined on re-put (spec §4.4 update-cloudwatch-alarms).
    pub raw: Value,
}

impl MetricAlarm {
    pub fn instance_id_dimension(&self) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(k, _)| k == "InstanceId")
            .map(|(_, v)| v.as_str())
    }
}

// ── Launch specification ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchEbsBlockDevice {
    pub delete_on_termination: bool,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub throughput: Option<i64>,
    pub encrypted: Option<bool>,
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchBlockDevice {
    pub device_name: String,
    pub ebs: Option<LaunchEbsBlockDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchNetworkInterface {
    pub device_index: u32,
    pub network_interface_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticGpuSpecification {
    pub gpu_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticInferenceSpecification {
    pub accelerator_type: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotMarketOptions {
    pub interruption_behavior: String,
    pub max_price: Option<String>,
}

/// Assembled by `create-new-instance` (spec §4.4); a builder over the
/// checkpointed descriptor plus configuration overrides (Design Notes §9:
/// "naturally a builder").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpecification {
    pub block_device_mappings: Vec<LaunchBlockDevice>,
    pub ebs_optimized: bool,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub monitoring_enabled: bool,
    pub capacity_reservation_specification: Option<Value>,
    pub hibernation_configured: Option<bool>,
    pub network_interfaces: Vec<LaunchNetworkInterface>,
    pub placement: Placement,
    pub instance_initiated_shutdown_behavior: Option<String>,
    pub elastic_gpu_specification: Vec<ElasticGpuSpecification>,
    pub elastic_inference_accelerators: Option<ElasticInferenceSpecification>,
    pub iam_instance_profile_arn: Option<String>,
    pub user_data: Option<String>,
    pub cpu_options: Option<CpuOptions>,
    pub credit_specification: Option<Value>,
    pub tags: Vec<Tag>,
    pub instance_market_options: Option<SpotMarketOptions>,
    pub metadata_options: Option<Value>,
    pub enclave_options: Option<Value>,
    pub licenses: Vec<String>,
}
