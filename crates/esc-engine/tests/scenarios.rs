use std::sync::Arc;

use esc_config::Config;
use proptest::prelude::*;
use esc_domain::{
    BillingModel, InstanceId, InstanceState, Placement, SpotRequestDescriptor, StepName,
    VolumeAttachment, VolumeDescriptor,
};
use esc_driver::{
    ComputeClient, DiffViewer, FakeAcceleratorClient, FakeComputeClient, FakeKeyManagementClient,
    FakeLoadBalancerClient, FakeMetricAlarmClient, NullDiffViewer,
};
use esc_engine::{Engine, EngineContext};
use esc_store::{InMemoryStateStore, StateStore};

fn test_instance(id: &str, instance_type: &str, spot_request_id: Option<&str>) -> esc_domain::InstanceDescriptor {
    esc_domain::InstanceDescriptor {
        instance_id: InstanceId::new(id),
        instance_type: instance_type.to_string(),
        architecture: "x86_64".to_string(),
        state: InstanceState("running".to_string()),
        image_id: "ami-source".to_string(),
        key_name: None,
        ebs_optimized: false,
        monitoring_enabled: false,
        placement: Placement { availability_zone: "us-east-1a".to_string(), tenancy: "default".to_string() },
        spot_instance_request_id: spot_request_id.map(str::to_string),
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
        block_device_mappings: vec![
            esc_domain::InstanceBlockDevice {
                device_name: "/dev/sda1".to_string(),
                volume_id: "vol-root".to_string(),
                delete_on_termination: true,
            },
            esc_domain::InstanceBlockDevice {
                device_name: "/dev/sdf".to_string(),
                volume_id: "vol-data".to_string(),
                delete_on_termination: false,
            },
        ],
        network_interfaces: Vec::new(),
        elastic_gpu_associations: Vec::new(),
        elastic_inference_accelerator_arns: Vec::new(),
        tags: Vec::new(),
        api_termination_protection: None,
        disable_api_stop_protection: None,
    }
}

fn test_volume(id: &str, instance_id: &str, device: &str) -> VolumeDescriptor {
    VolumeDescriptor {
        volume_id: id.to_string(),
        size_gib: 20,
        volume_type: "gp3".to_string(),
        iops: None,
        throughput: None,
        encrypted: false,
        kms_key_id: None,
        state: "in-use".to_string(),
        multi_attach_enabled: false,
        attachments: vec![VolumeAttachment { instance_id: instance_id.to_string(), device: device.to_string(), state: "attached".to_string() }],
    }
}

fn base_config(instance_id: &str, target: BillingModel) -> Config {
    Config {
        instance_id: InstanceId::new(instance_id),
        target_billing_model: target,
        target_instance_type: None,
        ignore_userdata: false,
        ignore_hibernation_options: false,
        cpu_options: None,
        max_spot_price: None,
        volume_kms_key_id: None,
        stop_instance: false,
        reboot_if_needed: false,
        update_cw_alarms: None,
        delete_ami: false,
        check_targetgroups: None,
        wait_for_tg_states: Vec::new(),
        do_not_require_stopped_instance: false,
        dynamodb_tablename: "ec2-spot-converter-state".to_string(),
        force: false,
        do_not_pause_on_major_warnings: true,
        review_conversion_result: false,
        region: None,
    }
}

struct Harness {
    compute: Arc<FakeComputeClient>,
    store: Arc<InMemoryStateStore>,
}

fn build_engine(config: Config, harness: &Harness) -> Engine {
    let diff_viewer: Arc<dyn DiffViewer> = Arc::new(NullDiffViewer);
    let ctx = EngineContext {
        config,
        store: harness.store.clone(),
        compute: harness.compute.clone(),
        accelerator: Arc::new(FakeAcceleratorClient::new()),
        kms: Arc::new(FakeKeyManagementClient::new()),
        load_balancer: Arc::new(FakeLoadBalancerClient::new()),
        alarms: Arc::new(FakeMetricAlarmClient::new()),
        diff_viewer,
        tool_version: "0.1.0-test".to_string(),
    };
    Engine::new(ctx)
}

fn seeded_spot_to_on_demand_harness() -> Harness {
    let compute = Arc::new(FakeComputeClient::new());
    compute.seed_instance(test_instance("i-original", "m5.large", Some("sir-1")));
    compute.seed_volume(test_volume("vol-root", "i-original", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-original", "/dev/sdf"));
    compute.seed_spot_request(SpotRequestDescriptor {
        spot_instance_request_id: "sir-1".to_string(),
        state: "active".to_string(),
        request_type: "persistent".to_string(),
        max_price: Some("0.05".to_string()),
    });
    Harness { compute, store: Arc::new(InMemoryStateStore::new()) }
}

/// S1: spot -> on-demand, one root + one persistent data volume. Exercises
/// the full non-gated step sequence end to end.
#[tokio::test]
async fn s1_spot_to_on_demand_with_root_and_data_volume() {
    let harness = seeded_spot_to_on_demand_harness();
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-original")).await.expect("conversion should succeed");

    assert!(record.new_instance_id.is_some(), "a new instance should have been launched");
    let new_instance_id = record.new_instance_id.clone().unwrap();
    assert_ne!(new_instance_id.as_str(), "i-original");

    // The original root volume (DeleteOnTermination=true) is represented in
    // the AMI, not reattached.
    let volumes_in_ami = record.volumes_in_ami.expect("AMI volumes recorded");
    assert_eq!(volumes_in_ami.len(), 1);
    assert_eq!(volumes_in_ami[0].device_name, "/dev/sda1");

    // The persistent data volume was detached from the old instance and
    // reattached to the new one at its original device.
    assert_eq!(record.detached_volumes.as_deref(), Some(&["vol-data".to_string()][..]));
    let data_volume = harness.compute.describe_volumes(&["vol-data".to_string()]).await.unwrap();
    assert_eq!(data_volume[0].attachments[0].instance_id, new_instance_id.as_str());
    assert_eq!(data_volume[0].attachments[0].device, "/dev/sdf");

    // The spot request was cancelled and the new instance has no market
    // options (on-demand target).
    let spot = harness.compute.describe_spot_instance_requests(&["sir-1".to_string()]).await.unwrap();
    assert_eq!(spot[0].state, "cancelled");
    let launch_spec = record.new_instance_launch_specification.expect("launch spec recorded");
    assert!(launch_spec.instance_market_options.is_none());

    // Gated steps never ran and never appear in the reasons map (invariant 3).
    for gated in [
        StepName::DeregisterFromTargetGroups,
        StepName::DrainElbTargetGroups,
        StepName::RegisterToElbTargetGroups,
        StepName::WaitTargetGroups,
        StepName::UpdateCloudwatchAlarms,
        StepName::DeregisterImage,
    ] {
        assert!(!record.conversion_step_reasons.contains_key(&gated), "{gated} should have been gate-skipped");
    }
    assert_eq!(record.conversion_step, Some(StepName::UntagResources));
}

/// Invariant 1: re-running a completed conversion with the same inputs is a
/// pure no-op — every step is RECOVERED, nothing new is mutated.
#[tokio::test]
async fn resuming_a_completed_conversion_is_idempotent() {
    let harness = seeded_spot_to_on_demand_harness();
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let first = engine.run(&InstanceId::new("i-original")).await.unwrap();
    let instance_count_after_first = harness.compute.describe_instances(&[InstanceId::new("i-original")]).await.unwrap().len();

    let config_again = base_config("i-original", BillingModel::OnDemand);
    let engine_again = build_engine(config_again, &harness);
    let second = engine_again.run(&InstanceId::new("i-original")).await.unwrap();

    assert_eq!(first.new_instance_id, second.new_instance_id, "no second instance should be launched");
    assert_eq!(first.conversion_step, second.conversion_step);
    assert_eq!(instance_count_after_first, harness.compute.describe_instances(&[InstanceId::new("i-original")]).await.unwrap().len());
}

/// S5: `wait-ami` observing a failed AMI rewinds `ConversionStep` to the
/// predecessor of `create-ami` and deregisters the failed image; a re-run
/// creates a fresh one.
#[tokio::test]
async fn s5_failed_ami_rewinds_and_is_retried() {
    let harness = seeded_spot_to_on_demand_harness();
    harness.compute.fail_next_image();
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let err = engine.run(&InstanceId::new("i-original")).await.expect_err("the first AMI should fail to build");
    match err {
        esc_engine::EngineError::HandlerFailed { step, .. } => assert_eq!(step, StepName::WaitAmi.to_string()),
        other => panic!("expected HandlerFailed, got {other:?}"),
    }

    let record = harness.store.read(&InstanceId::new("i-original")).await.unwrap().expect("record persists across the failure");
    let predecessor_of_create_ami = esc_domain::STEP_ORDER[StepName::CreateAmi.index() - 1];
    assert_eq!(record.conversion_step, Some(predecessor_of_create_ami));

    let first_image_id = record.image_id.clone().expect("the failed AMI id was still recorded before the rewind");
    assert!(harness.compute.describe_images(&[first_image_id]).await.unwrap().is_empty(), "failed AMI should be deregistered");

    // Re-run: create-ami executes again and this time succeeds.
    let config2 = base_config("i-original", BillingModel::OnDemand);
    let engine2 = build_engine(config2, &harness);
    let record2 = engine2.run(&InstanceId::new("i-original")).await.expect("the retry should succeed");
    assert!(record2.new_instance_id.is_some());
    assert_ne!(record2.image_id, record.image_id, "a fresh AMI should have been created");
}

/// S6: `reset-step=1` deletes the record outright; a subsequent run starts
/// completely fresh.
#[tokio::test]
async fn s6_reset_step_one_then_fresh_run() {
    let harness = seeded_spot_to_on_demand_harness();
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);
    engine.run(&InstanceId::new("i-original")).await.unwrap();

    esc_engine::reset_step(harness.store.as_ref(), &InstanceId::new("i-original"), 1).await.unwrap();
    assert!(harness.store.read(&InstanceId::new("i-original")).await.unwrap().is_none());
}

/// Without `--stop-instance`, converting a running on-demand instance is
/// refused outright rather than silently stopping it.
#[tokio::test]
async fn stop_instance_is_refused_without_explicit_permission() {
    let compute = Arc::new(FakeComputeClient::new());
    compute.seed_instance(test_instance("i-running", "m5.large", None));
    compute.seed_volume(test_volume("vol-root", "i-running", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-running", "/dev/sdf"));
    let harness = Harness { compute, store: Arc::new(InMemoryStateStore::new()) };

    let config = base_config("i-running", BillingModel::Spot);
    let engine = build_engine(config, &harness);

    let err = engine.run(&InstanceId::new("i-running")).await.expect_err("a running instance needs --stop-instance");
    match err {
        esc_engine::EngineError::HandlerFailed { step, .. } => assert_eq!(step, StepName::StopInstance.to_string()),
        other => panic!("expected HandlerFailed, got {other:?}"),
    }
}

/// S2: on-demand -> spot, running VM, `--stop-instance`: the VM stops, an
/// AMI is built from it, and the new instance carries persistent-spot
/// market options with `InstanceInterruptionBehavior=stop` and no
/// `MaxPrice` (the source instance had none to inherit).
#[tokio::test]
async fn s2_on_demand_to_spot_with_explicit_stop() {
    let compute = Arc::new(FakeComputeClient::new());
    compute.seed_instance(test_instance("i-running", "m5.large", None));
    compute.seed_volume(test_volume("vol-root", "i-running", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-running", "/dev/sdf"));
    let harness = Harness { compute, store: Arc::new(InMemoryStateStore::new()) };

    let mut config = base_config("i-running", BillingModel::Spot);
    config.stop_instance = true;
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-running")).await.expect("conversion should succeed");

    assert_ne!(record.failed_stop, Some(true), "the stop should have actually happened, not been skipped");
    let new_instance_id = record.new_instance_id.clone().expect("a new instance should have been launched");
    assert_ne!(new_instance_id.as_str(), "i-running");

    let launch_spec = record.new_instance_launch_specification.expect("launch spec recorded");
    let market_options = launch_spec.instance_market_options.expect("spot target must carry market options");
    assert_eq!(market_options.interruption_behavior, "stop");
    assert_eq!(market_options.max_price, None);
}

/// S3: spot -> spot, already spot but moving to a new `--target-instance-type`
/// with `--cpu-options ignore`. The already-spot pre-check is bypassed
/// because the instance type differs; CPU options are dropped rather than
/// inherited.
#[tokio::test]
async fn s3_spot_to_spot_retype_with_ignored_cpu_options() {
    let mut instance = test_instance("i-original", "m5.large", Some("sir-1"));
    instance.cpu_options = Some(esc_domain::CpuOptions { core_count: 2, threads_per_core: 2 });
    let compute = Arc::new(FakeComputeClient::new());
    compute.seed_instance(instance);
    compute.seed_volume(test_volume("vol-root", "i-original", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-original", "/dev/sdf"));
    compute.seed_spot_request(SpotRequestDescriptor {
        spot_instance_request_id: "sir-1".to_string(),
        state: "active".to_string(),
        request_type: "persistent".to_string(),
        max_price: Some("0.05".to_string()),
    });
    let harness = Harness { compute, store: Arc::new(InMemoryStateStore::new()) };

    let mut config = base_config("i-original", BillingModel::Spot);
    config.target_instance_type = Some("m5.xlarge".to_string());
    config.cpu_options = Some(esc_domain::CpuOptionsArg::Ignore);
    config.force = true;
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-original")).await.expect("conversion should succeed");

    let launch_spec = record.new_instance_launch_specification.expect("launch spec recorded");
    assert_eq!(launch_spec.instance_type, "m5.xlarge");
    assert!(launch_spec.cpu_options.is_none(), "cpu options should have been dropped, not inherited");
    let market_options = launch_spec.instance_market_options.expect("spot target must carry market options");
    assert_eq!(market_options.interruption_behavior, "stop");
}

/// S4: interrupted after `create-ami` commits, resumed fresh. Seeds a record
/// directly through `StateStore` (rather than interrupting a live `Engine::run`,
/// which has no partial-execution hook) so that resumption starts exactly at
/// `prepare-network-interfaces` and runs the rest of the sequence for real.
#[tokio::test]
async fn s4_resume_after_create_ami_commit() {
    let compute = Arc::new(FakeComputeClient::new());
    let mut stopped = test_instance("i-original", "m5.large", None);
    stopped.state = InstanceState("stopped".to_string());
    compute.seed_instance(stopped.clone());
    compute.seed_volume(test_volume("vol-root", "i-original", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-original", "/dev/sdf"));

    // Mirror what `detach-volumes` would already have done to the non-root volume.
    compute.detach_volume("vol-data", &InstanceId::new("i-original")).await.unwrap();

    let root_volume = compute.describe_volumes(&["vol-root".to_string()]).await.unwrap().remove(0);
    let volumes_in_ami = vec![esc_domain::AmiBlockDevice {
        device_name: "/dev/sda1".to_string(),
        delete_on_termination: true,
        volume_size: root_volume.size_gib,
        volume_type: root_volume.volume_type.clone(),
        iops: None,
        throughput: None,
        encrypted: false,
        kms_key_id: None,
    }];
    let block_devices_json = serde_json::to_value(&volumes_in_ami).unwrap();
    let image_id = compute.create_image(&InstanceId::new("i-original"), "ami-seeded", &block_devices_json).await.unwrap();

    let store = Arc::new(InMemoryStateStore::new());
    let job_id = InstanceId::new("i-original");
    store.create(&job_id, "0.1.0-test").await.unwrap();
    let seed_delta = esc_domain::ConversionRecordDelta {
        initial_instance_state: Some(test_instance("i-original", "m5.large", None)),
        conversion_start_instance_state: Some(stopped),
        detached_volumes: Some(vec!["vol-data".to_string()]),
        volumes_in_ami: Some(volumes_in_ami),
        eni_ids: Some(Vec::new()),
        image_id: Some(image_id.clone()),
        ..Default::default()
    };
    store
        .commit_step(&job_id, StepName::CreateAmi, "seeded for resumption test".to_string(), serde_json::Value::Null, seed_delta, false)
        .await
        .unwrap();

    let harness = Harness { compute, store };
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-original")).await.expect("resumed conversion should complete");

    assert_eq!(record.image_id.as_deref(), Some(image_id.as_str()), "the pre-seeded AMI should have been reused, not rebuilt");
    let new_instance_id = record.new_instance_id.clone().expect("a new instance should have been launched");

    // The already-detached data volume ends up reattached to the new instance.
    let data_volume = harness.compute.describe_volumes(&["vol-data".to_string()]).await.unwrap();
    assert_eq!(data_volume[0].attachments[0].instance_id, new_instance_id.as_str());

    // Steps up through create-ami were recovered, not re-dispatched: only our
    // manually seeded reason is present for create-ami, nothing for its
    // predecessors.
    for recovered in [
        StepName::ReadStateTable,
        StepName::DiscoverInstanceState,
        StepName::StopInstance,
        StepName::WaitStopInstance,
        StepName::TagAllResources,
        StepName::DetachVolumes,
        StepName::WaitVolumeDetach,
    ] {
        assert!(!record.conversion_step_reasons.contains_key(&recovered), "{recovered} should have been recovered, not re-run");
    }
    assert_eq!(record.conversion_step_reasons.get(&StepName::CreateAmi), Some(&"seeded for resumption test".to_string()));
    assert_eq!(record.conversion_step, Some(StepName::UntagResources));
}

/// Invariant 5: after a successful conversion, no resource carries the
/// `ec2-spot-converter:job-id` tag — `untag-resources` removes it from the
/// new instance as the final step.
#[tokio::test]
async fn invariant5_job_tag_is_removed_after_a_successful_conversion() {
    let harness = seeded_spot_to_on_demand_harness();
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-original")).await.unwrap();
    let new_instance_id = record.new_instance_id.clone().unwrap();

    let new_instance = harness.compute.describe_instances(&[new_instance_id]).await.unwrap().remove(0);
    assert!(
        !new_instance.tags.iter().any(|t| t.key == esc_domain::JOB_TAG_KEY),
        "the job-id tag should have been removed from the new instance"
    );
}

/// Invariant 8: a reserved `aws:`-prefixed tag on the original VM is carried
/// to the new VM with a `_` prefix rather than dropped or passed through
/// verbatim (`run-instances` rejects `aws:`-prefixed tags outright).
#[tokio::test]
async fn invariant8_aws_prefixed_tags_are_renamed_on_the_new_instance() {
    let mut instance = test_instance("i-original", "m5.large", Some("sir-1"));
    instance.tags.push(esc_domain::Tag { key: "aws:autoscaling:groupName".to_string(), value: "asg-1".to_string() });
    let compute = Arc::new(FakeComputeClient::new());
    compute.seed_instance(instance);
    compute.seed_volume(test_volume("vol-root", "i-original", "/dev/sda1"));
    compute.seed_volume(test_volume("vol-data", "i-original", "/dev/sdf"));
    compute.seed_spot_request(SpotRequestDescriptor {
        spot_instance_request_id: "sir-1".to_string(),
        state: "active".to_string(),
        request_type: "persistent".to_string(),
        max_price: Some("0.05".to_string()),
    });
    let harness = Harness { compute, store: Arc::new(InMemoryStateStore::new()) };
    let config = base_config("i-original", BillingModel::OnDemand);
    let engine = build_engine(config, &harness);

    let record = engine.run(&InstanceId::new("i-original")).await.unwrap();

    let launch_spec = record.new_instance_launch_specification.expect("launch spec recorded");
    assert!(!launch_spec.tags.iter().any(|t| t.key == "aws:autoscaling:groupName"), "the raw aws: key must not pass through");
    assert!(
        launch_spec.tags.iter().any(|t| t.key == "_aws:autoscaling:groupName" && t.value == "asg-1"),
        "the aws: tag should be carried over renamed with a leading underscore"
    );
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

    /// Invariant 1: re-running a completed conversion is idempotent regardless
    /// of instance type or whether a persistent data volume was present.
    #[test]
    fn invariant1_idempotent_resume_across_instance_shapes(
        instance_type in prop::sample::select(vec!["m5.large", "m5.xlarge", "c5.large"]),
        has_data_volume in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (first_new_id, second_new_id, first_image, second_image, instance_count) = rt.block_on(async {
            let compute = Arc::new(FakeComputeClient::new());
            let mut instance = test_instance("i-prop", instance_type, Some("sir-prop"));
            if !has_data_volume {
                instance.block_device_mappings.retain(|b| b.delete_on_termination);
            }
            compute.seed_instance(instance);
            compute.seed_volume(test_volume("vol-root", "i-prop", "/dev/sda1"));
            if has_data_volume {
                compute.seed_volume(test_volume("vol-data", "i-prop", "/dev/sdf"));
            }
            compute.seed_spot_request(SpotRequestDescriptor {
                spot_instance_request_id: "sir-prop".to_string(),
                state: "active".to_string(),
                request_type: "persistent".to_string(),
                max_price: Some("0.05".to_string()),
            });
            let harness = Harness { compute, store: Arc::new(InMemoryStateStore::new()) };

            let config = base_config("i-prop", BillingModel::OnDemand);
            let engine = build_engine(config, &harness);
            let first = engine.run(&InstanceId::new("i-prop")).await.unwrap();

            let config_again = base_config("i-prop", BillingModel::OnDemand);
            let engine_again = build_engine(config_again, &harness);
            let second = engine_again.run(&InstanceId::new("i-prop")).await.unwrap();

            let instance_count = harness.compute.describe_instances(&[InstanceId::new("i-prop")]).await.unwrap().len();
            (first.new_instance_id, second.new_instance_id, first.image_id, second.image_id, instance_count)
        });

        prop_assert_eq!(first_new_id, second_new_id, "a second run must not launch another instance");
        prop_assert_eq!(first_image, second_image, "a second run must not build another AMI");
        prop_assert_eq!(instance_count, 1, "no extra instance should exist after a no-op resume");
    }
}
