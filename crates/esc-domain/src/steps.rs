use serde::{Deserialize, Serialize};

/// Every recognized configuration key that can gate a step (spec §4.1,
/// Design Notes §9: "small tagged variant" rather than string-keyed
/// introspection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    CheckTargetGroups,
    UpdateCwAlarms,
    DeleteAmi,
}

/// A step's gating predicate over configuration (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepGate {
    Always,
    IfPresent(ConfigKey),
    IfAbsent(ConfigKey),
}

/// The 26 steps of the canonical conversion sequence (spec §4.1). Order is
/// significant and constitutes the conversion contract — see [`STEP_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    ReadStateTable,
    DiscoverInstanceState,
    DeregisterFromTargetGroups,
    DrainElbTargetGroups,
    StopInstance,
    WaitStopInstance,
    TagAllResources,
    DetachVolumes,
    WaitVolumeDetach,
    CreateAmi,
    PrepareNetworkInterfaces,
    WaitAmi,
    InstanceStateCheckpoint,
    TerminateInstance,
    WaitResourceRelease,
    CreateNewInstance,
    WaitNewInstance,
    ReattachVolumes,
    ConfigureNetworkInterfaces,
    ManageElasticIp,
    RegisterToElbTargetGroups,
    RebootIfNeeded,
    UpdateCloudwatchAlarms,
    UntagResources,
    WaitTargetGroups,
    DeregisterImage,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::ReadStateTable => "read-state-table",
            StepName::DiscoverInstanceState => "discover-instance-state",
            StepName::DeregisterFromTargetGroups => "deregister-from-target-groups",
            StepName::DrainElbTargetGroups => "drain-elb-target-groups",
            StepName::StopInstance => "stop-instance",
            StepName::WaitStopInstance => "wait-stop-instance",
            StepName::TagAllResources => "tag-all-resources",
            StepName::DetachVolumes => "detach-volumes",
            StepName::WaitVolumeDetach => "wait-volume-detach",
            StepName::CreateAmi => "create-ami",
            StepName::PrepareNetworkInterfaces => "prepare-network-interfaces",
            StepName::WaitAmi => "wait-ami",
            StepName::InstanceStateCheckpoint => "instance-state-checkpoint",
            StepName::TerminateInstance => "terminate-instance",
            StepName::WaitResourceRelease => "wait-resource-release",
            StepName::CreateNewInstance => "create-new-instance",
            StepName::WaitNewInstance => "wait-new-instance",
            StepName::ReattachVolumes => "reattach-volumes",
            StepName::ConfigureNetworkInterfaces => "configure-network-interfaces",
            StepName::ManageElasticIp => "manage-elastic-ip",
            StepName::RegisterToElbTargetGroups => "register-to-elb-target-groups",
            StepName::RebootIfNeeded => "reboot-if-needed",
            StepName::UpdateCloudwatchAlarms => "update-cloudwatch-alarms",
            StepName::UntagResources => "untag-resources",
            StepName::WaitTargetGroups => "wait-target-groups",
            StepName::DeregisterImage => "deregister-image",
        }
    }

    pub fn pretty_name(&self) -> &'static str {
        match self {
            StepName::ReadStateTable => "ReadStateTable",
            StepName::DiscoverInstanceState => "DiscoverInstanceState",
            StepName::DeregisterFromTargetGroups => "DeregisterFromTargetGroups",
            StepName::DrainElbTargetGroups => "DrainElbTargetGroups",
            StepName::StopInstance => "StopInstance",
            StepName::WaitStopInstance => "WaitStopInstance",
            StepName::TagAllResources => "TagAllResources",
            StepName::DetachVolumes => "DetachVolumes",
            StepName::WaitVolumeDetach => "WaitVolumeDetach",
            StepName::CreateAmi => "CreateAmi",
            StepName::PrepareNetworkInterfaces => "PrepareNetworkInterfaces",
            StepName::WaitAmi => "WaitAmi",
            StepName::InstanceStateCheckpoint => "InstanceStateCheckpoint",
            StepName::TerminateInstance => "TerminateInstance",
            StepName::WaitResourceRelease => "WaitResourceRelease",
            StepName::CreateNewInstance => "CreateNewInstance",
            StepName::WaitNewInstance => "WaitNewInstance",
            StepName::ReattachVolumes => "ReattachVolumes",
            StepName::ConfigureNetworkInterfaces => "ConfigureNetworkInterfaces",
            StepName::ManageElasticIp => "ManageElasticIp",
            StepName::RegisterToElbTargetGroups => "RegisterToElbTargetGroups",
            StepName::RebootIfNeeded => "RebootIfNeeded",
            StepName::UpdateCloudwatchAlarms => "UpdateCloudwatchAlarms",
            StepName::UntagResources => "UntagResources",
            StepName::WaitTargetGroups => "WaitTargetGroups",
            StepName::DeregisterImage => "DeregisterImage",
        }
    }

    /// The step's gate (spec §4.1: "gated" annotations).
    pub fn gate(&self) -> StepGate {
        use ConfigKey::*;
        use StepGate::*;
        match self {
            StepName::DeregisterFromTargetGroups
            | StepName::DrainElbTargetGroups
            | StepName::RegisterToElbTargetGroups
            | StepName::WaitTargetGroups => IfPresent(CheckTargetGroups),
            StepName::UpdateCloudwatchAlarms => IfPresent(UpdateCwAlarms),
            StepName::DeregisterImage => IfPresent(DeleteAmi),
            _ => Always,
        }
    }

    /// Index within [`STEP_ORDER`], used by the Engine for "did we already
    /// pass this step" comparisons (spec §4.3).
    pub fn index(&self) -> usize {
        STEP_ORDER.iter().position(|s| s == self).expect("every StepName is in STEP_ORDER")
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The canonical conversion sequence (spec §4.1). Order is the conversion
/// contract; never reorder without updating the spec.
pub const STEP_ORDER: [StepName; 26] = [
    StepName::ReadStateTable,
    StepName::DiscoverInstanceState,
    StepName::DeregisterFromTargetGroups,
    StepName::DrainElbTargetGroups,
    StepName::StopInstance,
    StepName::WaitStopInstance,
    StepName::TagAllResources,
    StepName::DetachVolumes,
    StepName::WaitVolumeDetach,
    StepName::CreateAmi,
    StepName::PrepareNetworkInterfaces,
    StepName::WaitAmi,
    StepName::InstanceStateCheckpoint,
    StepName::TerminateInstance,
    StepName::WaitResourceRelease,
    StepName::CreateNewInstance,
    StepName::WaitNewInstance,
    StepName::ReattachVolumes,
    StepName::ConfigureNetworkInterfaces,
    StepName::ManageElasticIp,
    StepName::RegisterToElbTargetGroups,
    StepName::RebootIfNeeded,
    StepName::UpdateCloudwatchAlarms,
    StepName::UntagResources,
    StepName::WaitTargetGroups,
    StepName::DeregisterImage,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_step_has_a_stable_index() {
        for (i, s) in STEP_ORDER.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }

    #[test]
    fn step_names_round_trip_through_serde() {
        for s in STEP_ORDER {
            let json = serde_json::to_string(&s).unwrap();
            let back: StepName = serde_json::from_str(&json).unwrap();
            assert_eq!(s, back);
        }
    }
}
