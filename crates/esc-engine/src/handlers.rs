use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use esc_domain::{
    ami_name, rename_reserved_tags, volume_type_carries_performance_params, AmiBlockDevice,
    BillingModel, ConversionRecord, ConversionRecordDelta, CpuOptionsArg,
    ElasticGpu, ElasticGpuSpecification, ElasticInferenceSpecification, InstanceDescriptor,
    InstanceId, LaunchBlockDevice, LaunchEbsBlockDevice, LaunchNetworkInterface,
    LaunchSpecification, SpotMarketOptions, StepName, Tag, JOB_TAG_KEY,
};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::poll::poll_until;

/// What a handler hands back to the Engine (spec §4.1: `{ok, message, delta}`).
/// `rewind_to`, when set on an `ok=false` outcome, carries the "handler
/// rewrites `ConversionStep` backward" contract of the Rewindable error kind
/// (spec §7) — the Engine applies it before surfacing the failure.
pub struct HandlerOutcome {
    pub ok: bool,
    pub message: String,
    pub delta: ConversionRecordDelta,
    pub rewind_to: Option<StepName>,
}

impl HandlerOutcome {
    fn ok(message: impl Into<String>, delta: ConversionRecordDelta) -> Self {
        Self { ok: true, message: message.into(), delta, rewind_to: None }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into(), delta: ConversionRecordDelta::default(), rewind_to: None }
    }

    fn rewind(message: impl Into<String>, to: StepName) -> Self {
        Self { ok: false, message: message.into(), delta: ConversionRecordDelta::default(), rewind_to: Some(to) }
    }
}

fn predecessor(step: StepName) -> StepName {
    let idx = step.index();
    esc_domain::STEP_ORDER[idx.saturating_sub(1)]
}

/// Dispatch a step to its handler.
pub async fn dispatch(
    step: StepName,
    ctx: &EngineContext,
    record: &ConversionRecord,
) -> Result<HandlerOutcome, EngineError> {
    match step {
        StepName::ReadStateTable => Ok(HandlerOutcome::ok("state table read", Default::default())),
        StepName::DiscoverInstanceState => discover_instance_state(ctx, record).await,
        StepName::DeregisterFromTargetGroups => deregister_from_target_groups(ctx, record).await,
        StepName::DrainElbTargetGroups => drain_elb_target_groups(ctx, record).await,
        StepName::StopInstance => stop_instance(ctx, record).await,
        StepName::WaitStopInstance => wait_stop_instance(ctx, record).await,
        StepName::TagAllResources => tag_all_resources(ctx, record).await,
        StepName::DetachVolumes => detach_volumes(ctx, record).await,
        StepName::WaitVolumeDetach => wait_volume_detach(ctx, record).await,
        StepName::CreateAmi => create_ami(ctx, record).await,
        StepName::PrepareNetworkInterfaces => prepare_network_interfaces(ctx, record).await,
        StepName::WaitAmi => wait_ami(ctx, record).await,
        StepName::InstanceStateCheckpoint => instance_state_checkpoint(ctx, record).await,
        StepName::TerminateInstance => terminate_instance(ctx, record).await,
        StepName::WaitResourceRelease => wait_resource_release(ctx, record).await,
        StepName::CreateNewInstance => create_new_instance(ctx, record).await,
        StepName::WaitNewInstance => wait_new_instance(ctx, record).await,
        StepName::ReattachVolumes => reattach_volumes(ctx, record).await,
        StepName::ConfigureNetworkInterfaces => configure_network_interfaces(ctx, record).await,
        StepName::ManageElasticIp => manage_elastic_ip(ctx, record).await,
        StepName::RegisterToElbTargetGroups => register_to_elb_target_groups(ctx, record).await,
        StepName::RebootIfNeeded => reboot_if_needed(ctx, record).await,
        StepName::UpdateCloudwatchAlarms => update_cloudwatch_alarms(ctx, record).await,
        StepName::UntagResources => untag_resources(ctx, record).await,
        StepName::WaitTargetGroups => wait_target_groups(ctx, record).await,
        StepName::DeregisterImage => deregister_image(ctx, record).await,
    }
}

fn require<'a, T>(opt: &'a Option<T>, what: &str) -> Result<&'a T, EngineError> {
    opt.as_ref().ok_or_else(|| EngineError::Internal(format!("missing required artifact: {what}")))
}

/// Convention-over-field reading of the "root device": the teacher's cloud
/// clients return block device mappings in the order the API does, which
/// lists the root device first. Picking it off the front avoids plumbing an
/// extra root-device-name field through every instance descriptor.
fn root_device(instance: &InstanceDescriptor) -> Option<&esc_domain::InstanceBlockDevice> {
    instance.block_device_mappings.first()
}

// ── discover-instance-state ──────────────────────────────────────────────────

async fn discover_instance_state(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance_id = &ctx.config.instance_id;
    let mut instances = ctx.compute.describe_instances(&[instance_id.clone()]).await?;
    let Some(mut instance) = instances.pop() else {
        return Ok(HandlerOutcome::fail(format!("instance {instance_id} not found")));
    };

    if let Ok(tag) = std::fs::read_to_string("/sys/devices/virtual/dmi/id/board_asset_tag") {
        if tag.trim() == instance_id.as_str() {
            return Ok(HandlerOutcome::fail("refusing to convert the instance the tool is running on"));
        }
    }

    // `DescribeInstances` carries neither of these; they're per-instance
    // attributes only `DescribeInstanceAttribute` exposes.
    let termination_protection = ctx
        .compute
        .describe_instance_attribute(instance_id, "disableApiTermination")
        .await?;
    instance.api_termination_protection = termination_protection.get("value").and_then(Value::as_bool);

    if !ctx.config.ignore_userdata {
        let user_data = ctx.compute.describe_instance_attribute(instance_id, "userData").await?;
        instance.user_data = user_data.get("value").and_then(Value::as_str).map(str::to_string);
    }

    if instance.api_termination_protection == Some(true) {
        return Ok(HandlerOutcome::fail("instance has API-termination protection enabled"));
    }

    let cpu_options = match &ctx.config.cpu_options {
        Some(CpuOptionsArg::Ignore) => None,
        Some(CpuOptionsArg::Override(o)) => Some(CpuOptionsArg::Override(o.clone())),
        None => instance.cpu_options.clone().map(CpuOptionsArg::Override),
    };

    let mut spot_request = None;
    if let Some(req_id) = &instance.spot_instance_request_id {
        let found = ctx.compute.describe_spot_instance_requests(&[req_id.clone()]).await?;
        match found.into_iter().next() {
            Some(req) => {
                if req.state == "cancelled" {
                    warn!(instance = %instance_id, "major warning: spot request is cancelled");
                    if !ctx.config.do_not_pause_on_major_warnings {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                }
                if !req.is_persistent() && !ctx.config.force {
                    return Ok(HandlerOutcome::fail("instance's spot request is not persistent"));
                }
                spot_request = Some(req);
            }
            None => {
                warn!(instance = %instance_id, "major warning: spot request is missing");
                if !ctx.config.do_not_pause_on_major_warnings {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    if !ctx.config.force {
        match ctx.config.target_billing_model {
            BillingModel::Spot => {
                if instance.spot_instance_request_id.is_some()
                    && ctx.config.target_instance_type.as_deref().map_or(true, |t| t == instance.instance_type)
                    && cpu_options == instance.cpu_options.clone().map(CpuOptionsArg::Override)
                {
                    return Ok(HandlerOutcome::fail("instance is already spot with matching type and CPU options"));
                }
            }
            BillingModel::OnDemand => {
                if instance.spot_instance_request_id.is_none() {
                    return Ok(HandlerOutcome::fail("instance is already on-demand"));
                }
            }
        }
    }

    let volume_ids: Vec<String> = instance.block_device_mappings.iter().map(|b| b.volume_id.clone()).collect();
    let volume_details = ctx.compute.describe_volumes(&volume_ids).await?;

    // Target-group membership has no reverse-lookup API on the injected
    // client surface; only an explicit ARN list can be resolved, so a
    // `--check-targetgroups *` run discovers nothing here.
    let mut elb_targets = Vec::new();
    if let Some(filter) = &ctx.config.check_targetgroups {
        if let esc_config::ResourceFilter::Some(arns) = filter {
            for arn in arns {
                if let Ok(health) = ctx.load_balancer.describe_target_health(arn).await {
                    for (target, _) in health {
                        elb_targets.push(target);
                    }
                }
            }
        }
    }

    let delta = ConversionRecordDelta {
        initial_instance_state: Some(instance.clone()),
        spot_request,
        cpu_options,
        volume_details: Some(volume_details),
        elb_targets: Some(elb_targets),
        conversion_start_instance_state: Some(instance.clone()),
        eni_ids: Some(instance.network_interfaces.iter().map(|n| n.network_interface_id.clone()).collect()),
        start_time: Some(chrono::Utc::now().timestamp()),
        start_date: Some(chrono::Utc::now().to_rfc3339()),
        ..Default::default()
    };
    Ok(HandlerOutcome::ok(format!("discovered instance {instance_id}"), delta))
}

// ── target-group handling ────────────────────────────────────────────────────

async fn deregister_from_target_groups(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let targets = require(&record.elb_targets, "ELBTargets")?;
    let instance_id = initial_id(record)?;
    for target in targets {
        ctx.load_balancer.deregister_targets(&target.target_group_arn, instance_id, std::slice::from_ref(target)).await?;
    }
    Ok(HandlerOutcome::ok("deregistered from all target groups", Default::default()))
}

async fn drain_elb_target_groups(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let targets = require(&record.elb_targets, "ELBTargets")?.clone();
    for target in &targets {
        let arn = target.target_group_arn.clone();
        let port = target.port;
        poll_until("target drain", 100, Duration::from_secs(10), || {
            let arn = arn.clone();
            async {
                let health = ctx.load_balancer.describe_target_health(&arn).await?;
                let state = health.iter().find(|(t, _)| t.port == port).map(|(_, s)| *s);
                Ok(state.filter(|s| matches!(s, esc_domain::TargetHealthState::Unused)))
            }
        })
        .await?;
    }
    Ok(HandlerOutcome::ok("all target groups drained", Default::default()))
}

async fn register_to_elb_target_groups(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let targets = require(&record.elb_targets, "ELBTargets")?;
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    for target in targets {
        ctx.load_balancer.register_targets(&target.target_group_arn, new_instance_id, std::slice::from_ref(target)).await?;
    }
    Ok(HandlerOutcome::ok("registered to all target groups", Default::default()))
}

async fn wait_target_groups(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let targets = require(&record.elb_targets, "ELBTargets")?.clone();
    let acceptable = ctx.config.wait_for_tg_states.clone();
    for target in &targets {
        let arn = target.target_group_arn.clone();
        let port = target.port;
        let acceptable = acceptable.clone();
        poll_until("target group end-state", 100, Duration::from_secs(10), || {
            let arn = arn.clone();
            let acceptable = acceptable.clone();
            async move {
                let health = ctx.load_balancer.describe_target_health(&arn).await?;
                let state = health.iter().find(|(t, _)| t.port == port).map(|(_, s)| *s);
                Ok(state.filter(|s| acceptable.contains(s)))
            }
        })
        .await?;
    }
    Ok(HandlerOutcome::ok("all target groups reached an acceptable state", Default::default()))
}

// ── stop / wait-stop ─────────────────────────────────────────────────────────

async fn stop_instance(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    if instance.state.is_stopped() {
        return Ok(HandlerOutcome::ok("instance is already stopped", Default::default()));
    }
    if !ctx.config.stop_instance && !ctx.config.do_not_require_stopped_instance {
        return Ok(HandlerOutcome::fail(format!(
            "instance '{}' must be in 'stopped' state (current={}); use --stop-instance if you want to stop it",
            initial_id(record)?,
            instance.state,
        )));
    }
    if ctx.config.do_not_require_stopped_instance {
        let delta = ConversionRecordDelta { failed_stop: Some(true), ..Default::default() };
        return Ok(HandlerOutcome::ok("stopping disallowed by configuration; proceeding without it", delta));
    }
    ctx.compute.stop_instances(std::slice::from_ref(initial_id(record)?)).await?;
    Ok(HandlerOutcome::ok("stop requested", Default::default()))
}

async fn wait_stop_instance(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    if record.failed_stop == Some(true) {
        return Ok(HandlerOutcome::ok("stop was skipped by configuration", Default::default()));
    }
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    if instance.state.is_stopped() {
        return Ok(HandlerOutcome::ok("instance is already stopped", Default::default()));
    }
    let id = initial_id(record)?.clone();
    poll_until("instance stop", 100, Duration::from_secs(15), || {
        let id = id.clone();
        async move {
            let mut found = ctx.compute.describe_instances(&[id.clone()]).await?;
            let Some(instance) = found.pop() else {
                return Err(EngineError::Unrecoverable(format!("instance {id} disappeared while waiting to stop")));
            };
            if instance.state.is_terminated() {
                return Err(EngineError::Unrecoverable(format!("instance {id} was terminated externally while waiting to stop")));
            }
            Ok(instance.state.is_stopped().then_some(()))
        }
    })
    .await?;
    Ok(HandlerOutcome::ok("instance is stopped", Default::default()))
}

// ── tag / detach / wait-detach ───────────────────────────────────────────────

async fn tag_all_resources(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    let mut ids = vec![instance.instance_id.as_str().to_string()];
    ids.extend(instance.network_interfaces.iter().map(|n| n.network_interface_id.clone()));
    ids.extend(instance.block_device_mappings.iter().map(|b| b.volume_id.clone()));
    let job_tag = vec![Tag { key: JOB_TAG_KEY.to_string(), value: record.job_id.as_str().to_string() }];
    ctx.compute.create_tags(&ids, &job_tag).await?;
    Ok(HandlerOutcome::ok(format!("tagged {} resources", ids.len()), Default::default()))
}

async fn detach_volumes(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    let volumes = require(&record.volume_details, "VolumeDetails")?;
    let mut detached = Vec::new();
    for bdm in &instance.block_device_mappings {
        if bdm.delete_on_termination {
            continue;
        }
        let Some(vol) = volumes.iter().find(|v| v.volume_id == bdm.volume_id) else { continue };
        if vol.state != "in-use" {
            continue;
        }
        let still_attached = vol.attachments.iter().any(|a| a.instance_id == instance.instance_id.as_str());
        if !still_attached {
            continue;
        }
        ctx.compute.detach_volume(&vol.volume_id, &instance.instance_id).await?;
        detached.push(vol.volume_id.clone());
    }
    let delta = ConversionRecordDelta { detached_volumes: Some(detached), ..Default::default() };
    Ok(HandlerOutcome::ok("detach requested for all eligible volumes", delta))
}

async fn wait_volume_detach(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let detached = record.detached_volumes.clone().unwrap_or_default();
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    let instance_id = instance.instance_id.clone();
    for volume_id in &detached {
        let volume_id = volume_id.clone();
        let instance_id = instance_id.clone();
        poll_until("volume detach", 60, Duration::from_secs(5), || {
            let volume_id = volume_id.clone();
            let instance_id = instance_id.clone();
            async move {
                let mut found = ctx.compute.describe_volumes(&[volume_id.clone()]).await?;
                let Some(vol) = found.pop() else { return Ok(Some(())) };
                let released = vol.state == "available"
                    || !vol.attachments.iter().any(|a| a.instance_id == instance_id.as_str());
                Ok(released.then_some(()))
            }
        })
        .await?;
    }
    Ok(HandlerOutcome::ok("all detached volumes released", Default::default()))
}

// ── create-ami / prepare-enis / wait-ami ─────────────────────────────────────

fn ami_block_devices(instance: &InstanceDescriptor, volumes: &[esc_domain::VolumeDescriptor]) -> Vec<AmiBlockDevice> {
    instance
        .block_device_mappings
        .iter()
        .filter(|b| b.delete_on_termination)
        .filter_map(|b| {
            let vol = volumes.iter().find(|v| v.volume_id == b.volume_id)?;
            Some(AmiBlockDevice {
                device_name: b.device_name.clone(),
                delete_on_termination: true,
                volume_size: vol.size_gib,
                volume_type: vol.volume_type.clone(),
                iops: volume_type_carries_performance_params(&vol.volume_type).then_some(vol.iops).flatten(),
                throughput: volume_type_carries_performance_params(&vol.volume_type).then_some(vol.throughput).flatten(),
                encrypted: vol.encrypted,
                kms_key_id: vol.kms_key_id.clone(),
            })
        })
        .collect()
}

async fn create_ami(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    let volumes = require(&record.volume_details, "VolumeDetails")?;
    let devices = ami_block_devices(instance, volumes);
    let block_devices_json = serde_json::to_value(&devices).map_err(|e| EngineError::Internal(e.to_string()))?;
    let name = ami_name(&record.job_id);

    let image_id = match ctx.compute.create_image(&instance.instance_id, &name, &block_devices_json).await {
        Ok(id) => id,
        Err(esc_driver::DriverError::Api(msg)) if msg.contains("Duplicate") => {
            return Ok(HandlerOutcome::fail(format!(
                "an AMI named {name} already exists from a previous attempt; \
                 the tool cannot recover its id through the injected client surface, rerun with reset-step"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let id_for_poll = image_id.clone();
    poll_until("AMI discoverable by name", 10, Duration::from_secs(5), || {
        let id_for_poll = id_for_poll.clone();
        async move {
            let images = ctx.compute.describe_images(&[id_for_poll]).await?;
            Ok((!images.is_empty()).then_some(()))
        }
    })
    .await?;

    let delta = ConversionRecordDelta {
        volumes_in_ami: Some(devices),
        image_id: Some(image_id),
        ..Default::default()
    };
    Ok(HandlerOutcome::ok("AMI creation requested and discoverable", delta))
}

async fn prepare_network_interfaces(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    for eni in &instance.network_interfaces {
        ctx.compute.modify_network_interface_attribute(&eni.network_interface_id, &eni.attachment_id, false).await?;
    }
    Ok(HandlerOutcome::ok("all ENIs set to survive instance termination", Default::default()))
}

async fn wait_ami(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let image_id = require(&record.image_id, "ImageId")?.clone();
    let poll_result = poll_until("AMI availability", 720, Duration::from_secs(20), || {
        let image_id = image_id.clone();
        async move {
            let images = ctx.compute.describe_images(&[image_id]).await?;
            let Some(image) = images.into_iter().next() else { return Ok(None) };
            let state = image.get("state").and_then(Value::as_str).unwrap_or("pending").to_string();
            if state == "failed" {
                return Err(EngineError::HandlerFailed { step: "wait-ami".into(), message: "AMI creation failed".into() });
            }
            Ok((state == "available").then_some(()))
        }
    })
    .await;

    if let Err(e) = poll_result {
        ctx.compute.deregister_image(&image_id).await?;
        return Ok(HandlerOutcome::rewind(
            format!("AMI {image_id} failed to build ({e}); image deregistered"),
            predecessor(StepName::CreateAmi),
        ));
    }
    Ok(HandlerOutcome::ok("AMI is available", Default::default()))
}

// ── checkpoint / terminate / wait-release ────────────────────────────────────

async fn instance_state_checkpoint(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let id = initial_id(record)?.clone();
    let mut found = ctx.compute.describe_instances(&[id.clone()]).await?;
    let Some(instance) = found.pop() else {
        return Ok(HandlerOutcome::fail(format!("instance {id} not found at checkpoint time")));
    };

    let mut elastic_gpus = Vec::new();
    if !instance.elastic_gpu_associations.is_empty() {
        for raw in ctx.compute.describe_elastic_gpus(&id).await? {
            if let (Some(gpu_id), Some(gpu_type)) = (
                raw.get("elasticGpuId").and_then(Value::as_str),
                raw.get("elasticGpuType").and_then(Value::as_str),
            ) {
                elastic_gpus.push(ElasticGpu { elastic_gpu_id: gpu_id.to_string(), elastic_gpu_type: gpu_type.to_string() });
            }
        }
    }

    let delta = ConversionRecordDelta {
        instance_state_checkpoint: Some(instance),
        elastic_gpus: Some(elastic_gpus),
        ..Default::default()
    };
    Ok(HandlerOutcome::ok("instance state checkpointed", delta))
}

async fn terminate_instance(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    if let Some(spot) = &record.spot_request {
        let request_id = spot.spot_instance_request_id.clone();
        poll_until("spot request cancellable state", 30, Duration::from_secs(10), || {
            let request_id = request_id.clone();
            async move {
                let mut found = ctx.compute.describe_spot_instance_requests(&[request_id]).await?;
                let Some(req) = found.pop() else { return Ok(Some(())) };
                Ok(matches!(req.state.as_str(), "open" | "disabled" | "active").then_some(()))
            }
        })
        .await?;
        ctx.compute.cancel_spot_instance_requests(&[spot.spot_instance_request_id.clone()]).await?;
    }
    ctx.compute.terminate_instances(std::slice::from_ref(&checkpoint.instance_id)).await?;
    Ok(HandlerOutcome::ok("instance terminated", Default::default()))
}

async fn wait_resource_release(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    let eni_ids = record.eni_ids.clone().unwrap_or_default();
    for eni_id in &eni_ids {
        let eni_id = eni_id.clone();
        poll_until("ENI release", 60, Duration::from_secs(5), || {
            let eni_id = eni_id.clone();
            async move {
                let found = ctx.compute.describe_network_interfaces(&[eni_id]).await?;
                let Some(eni) = found.into_iter().next() else { return Ok(Some(())) };
                let status = eni.get("status").and_then(Value::as_str).unwrap_or("in-use");
                Ok((status == "available").then_some(()))
            }
        })
        .await?;
    }

    let instance_id = checkpoint.instance_id.clone();
    poll_until("instance termination", 60, Duration::from_secs(5), || {
        let instance_id = instance_id.clone();
        async move {
            let mut found = ctx.compute.describe_instances(&[instance_id]).await?;
            let Some(instance) = found.pop() else { return Ok(Some(())) };
            Ok(instance.state.is_terminated().then_some(()))
        }
    })
    .await?;

    if let Some(root) = root_device(checkpoint) {
        if !root.delete_on_termination {
            let volume_id = root.volume_id.clone();
            poll_until("root volume release", 60, Duration::from_secs(5), || {
                let volume_id = volume_id.clone();
                async move {
                    let mut found = ctx.compute.describe_volumes(&[volume_id]).await?;
                    let Some(vol) = found.pop() else { return Ok(Some(())) };
                    Ok((vol.state == "available").then_some(()))
                }
            })
            .await?;
            ctx.compute.delete_volume(&root.volume_id).await?;
        }
    }

    Ok(HandlerOutcome::ok("ENIs, instance, and any leaked root volume all released", Default::default()))
}

// ── create-new-instance / wait-new-instance ──────────────────────────────────

fn preserves_cpu_options(checkpoint: &InstanceDescriptor, target_type: &str) -> bool {
    let family = target_type.split('.').next().unwrap_or(target_type);
    target_type == checkpoint.instance_type
        && checkpoint.architecture == "x86_64"
        && !matches!(family, "t2" | "m1" | "m2" | "m3")
}

async fn build_launch_specification(ctx: &EngineContext, record: &ConversionRecord) -> Result<LaunchSpecification, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    let devices = record.volumes_in_ami.clone().unwrap_or_default();
    let target_type = ctx.config.target_instance_type.clone().unwrap_or_else(|| checkpoint.instance_type.clone());

    let block_device_mappings = devices
        .into_iter()
        .map(|d| {
            let already_encrypted = d.encrypted;
            let (encrypted, kms_key_id) = match (&ctx.config.volume_kms_key_id, already_encrypted) {
                (Some(key), false) => (Some(true), Some(key.clone())),
                _ => (Some(d.encrypted), d.kms_key_id),
            };
            LaunchBlockDevice {
                device_name: d.device_name,
                ebs: Some(LaunchEbsBlockDevice {
                    delete_on_termination: d.delete_on_termination,
                    volume_type: d.volume_type,
                    iops: d.iops,
                    throughput: d.throughput,
                    encrypted,
                    kms_key_id,
                }),
            }
        })
        .collect();

    let network_interfaces = checkpoint
        .network_interfaces
        .iter()
        .map(|n| LaunchNetworkInterface { device_index: n.device_index, network_interface_id: n.network_interface_id.clone() })
        .collect();

    let cpu_options = match &ctx.config.cpu_options {
        Some(CpuOptionsArg::Ignore) => None,
        Some(CpuOptionsArg::Override(o)) => Some(o.clone()),
        None => {
            if preserves_cpu_options(checkpoint, &target_type) {
                checkpoint.cpu_options.clone()
            } else {
                None
            }
        }
    };

    let elastic_gpu_specification: Vec<ElasticGpuSpecification> = record
        .elastic_gpus
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|g| ElasticGpuSpecification { gpu_type: g.elastic_gpu_type })
        .collect();

    let accelerators = ctx.accelerator.describe_accelerators(&checkpoint.instance_id).await?;
    let elastic_inference_accelerators = accelerators.first().map(|a| ElasticInferenceSpecification {
        accelerator_type: a.accelerator_type.clone(),
        count: accelerators.len() as u32,
    });

    let instance_market_options = if ctx.config.target_billing_model == BillingModel::Spot {
        let max_price = ctx
            .config
            .max_spot_price
            .map(|p| p.to_string())
            .or_else(|| {
                if target_type == checkpoint.instance_type {
                    record.spot_request.as_ref().and_then(|s| s.max_price.clone())
                } else {
                    None
                }
            });
        Some(SpotMarketOptions { interruption_behavior: "stop".to_string(), max_price })
    } else {
        None
    };

    Ok(LaunchSpecification {
        block_device_mappings,
        ebs_optimized: checkpoint.ebs_optimized,
        image_id: require(&record.image_id, "ImageId")?.clone(),
        instance_type: target_type,
        key_name: checkpoint.key_name.clone(),
        monitoring_enabled: checkpoint.monitoring_enabled,
        capacity_reservation_specification: checkpoint.capacity_reservation_specification.clone(),
        hibernation_configured: if ctx.config.ignore_hibernation_options {
            None
        } else {
            checkpoint.hibernation_options.map(|h| h.configured)
        },
        network_interfaces,
        placement: checkpoint.placement.clone(),
        instance_initiated_shutdown_behavior: checkpoint.instance_initiated_shutdown_behavior.clone(),
        elastic_gpu_specification,
        elastic_inference_accelerators,
        iam_instance_profile_arn: checkpoint.iam_instance_profile_arn.clone(),
        user_data: if ctx.config.ignore_userdata { None } else { checkpoint.user_data.clone() },
        cpu_options,
        credit_specification: checkpoint.credit_specification.clone(),
        tags: rename_reserved_tags(&checkpoint.tags),
        instance_market_options,
        metadata_options: checkpoint.metadata_options.clone(),
        enclave_options: checkpoint.enclave_options.clone(),
        licenses: checkpoint.licenses.clone(),
    })
}

async fn create_new_instance(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let eni_ids = record.eni_ids.clone().unwrap_or_default();
    if !eni_ids.is_empty() {
        let mut owners: HashSet<String> = HashSet::new();
        let mut all_attached = true;
        for eni_id in &eni_ids {
            let found = ctx.compute.describe_network_interfaces(&[eni_id.clone()]).await?;
            match found.into_iter().next().and_then(|v| v.get("attachment").and_then(|a| a.get("instanceId")).and_then(Value::as_str).map(str::to_string)) {
                Some(owner) => {
                    owners.insert(owner);
                }
                None => all_attached = false,
            }
        }
        if all_attached && owners.len() == 1 {
            let adopted = InstanceId::new(owners.into_iter().next().unwrap());
            let delta = ConversionRecordDelta { new_instance_id: Some(adopted.clone()), ..Default::default() };
            return Ok(HandlerOutcome::ok(format!("adopted pre-existing new instance {adopted}"), delta));
        }
        if !owners.is_empty() && (owners.len() > 1 || !all_attached) {
            return Ok(HandlerOutcome::fail("original ENIs are attached in an inconsistent set of instances"));
        }
    }

    let spec = build_launch_specification(ctx, record).await?;
    let new_instance_id = ctx.compute.run_instances(&spec).await?;
    let delta = ConversionRecordDelta {
        new_instance_launch_specification: Some(spec),
        new_instance_id: Some(new_instance_id.clone()),
        ..Default::default()
    };
    Ok(HandlerOutcome::ok(format!("launched new instance {new_instance_id}"), delta))
}

async fn wait_new_instance(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?.clone();
    let poll_result = poll_until("new instance running", 600, Duration::from_millis(500), || {
        let new_instance_id = new_instance_id.clone();
        async move {
            let mut found = ctx.compute.describe_instances(&[new_instance_id.clone()]).await?;
            let Some(instance) = found.pop() else { return Ok(None) };
            if instance.state.is_terminated() {
                return Err(EngineError::HandlerFailed { step: "wait-new-instance".into(), message: "new instance terminated".into() });
            }
            Ok(instance.state.is_running().then_some(()))
        }
    })
    .await;

    if let Err(e) = poll_result {
        return Ok(HandlerOutcome::rewind(format!("new instance failed to come up ({e})"), predecessor(StepName::CreateNewInstance)));
    }
    let mut found = ctx.compute.describe_instances(&[new_instance_id]).await?;
    let delta = ConversionRecordDelta { new_instance_details: found.pop(), ..Default::default() };
    Ok(HandlerOutcome::ok("new instance is running", delta))
}

// ── reattach / reconfigure / elastic ip ──────────────────────────────────────

async fn reattach_volumes(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    let detached = record.detached_volumes.clone().unwrap_or_default();

    let new_instance_devices = ctx.compute.describe_instances(std::slice::from_ref(new_instance_id)).await?;
    let new_devices = new_instance_devices.first().map(|i| i.block_device_mappings.clone()).unwrap_or_default();
    let mut post_boot_attachment = false;

    for volume_id in &detached {
        if new_devices.iter().any(|d| &d.volume_id == volume_id) {
            continue;
        }
        let Some(original_bdm) = checkpoint.block_device_mappings.iter().find(|b| &b.volume_id == volume_id) else { continue };
        ctx.compute.attach_volume(volume_id, new_instance_id, &original_bdm.device_name).await?;
        post_boot_attachment = true;
    }

    if post_boot_attachment && !ctx.config.reboot_if_needed {
        warn!(instance = %new_instance_id, "volume attached after boot and --reboot-if-needed is not set");
    }

    let delta = ConversionRecordDelta { reattached_volumes_instance_state: new_instance_devices.into_iter().next(), ..Default::default() };
    Ok(HandlerOutcome::ok("volumes reattached", delta))
}

async fn configure_network_interfaces(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    let new_found = ctx.compute.describe_instances(std::slice::from_ref(new_instance_id)).await?;
    let Some(new_instance) = new_found.into_iter().next() else {
        return Ok(HandlerOutcome::fail(format!("new instance {new_instance_id} not found")));
    };
    for original_eni in &checkpoint.network_interfaces {
        if let Some(new_eni) = new_instance.network_interfaces.iter().find(|e| e.network_interface_id == original_eni.network_interface_id) {
            ctx.compute
                .modify_network_interface_attribute(&new_eni.network_interface_id, &new_eni.attachment_id, original_eni.delete_on_termination)
                .await?;
        }
    }
    Ok(HandlerOutcome::ok("ENI DeleteOnTermination flags restored", Default::default()))
}

async fn manage_elastic_ip(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let checkpoint = require(&record.instance_state_checkpoint, "InstanceStateCheckpoint")?;
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    let mut reassociated = 0;
    for eni in &checkpoint.network_interfaces {
        let Some(assoc) = &eni.public_ip_association else { continue };
        let addresses = ctx.compute.describe_addresses(&[assoc.public_ip.clone()]).await?;
        let Some(address) = addresses.first() else { continue };
        let Some(allocation_id) = address.get("allocation_id").and_then(Value::as_str) else { continue };
        ctx.compute.associate_address(new_instance_id, allocation_id).await?;
        reassociated += 1;
    }
    Ok(HandlerOutcome::ok(format!("reassociated {reassociated} elastic IPs"), Default::default()))
}

async fn reboot_if_needed(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    let detached = record.detached_volumes.clone().unwrap_or_default();
    let needed = !detached.is_empty() && ctx.config.reboot_if_needed;
    if !needed {
        return Ok(HandlerOutcome::ok("no reboot needed", Default::default()));
    }
    ctx.compute.reboot_instances(std::slice::from_ref(new_instance_id)).await?;
    let delta = ConversionRecordDelta { rebooted: Some(true), ..Default::default() };
    Ok(HandlerOutcome::ok("instance rebooted", delta))
}

// ── alarms / untag / deregister-image ────────────────────────────────────────

async fn update_cloudwatch_alarms(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let old_id = initial_id(record)?.clone();
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?.clone();

    let names: Vec<String> = match &ctx.config.update_cw_alarms {
        Some(esc_config::ResourceFilter::Some(prefixes)) => {
            let all = ctx.alarms.describe_alarms(&[]).await?;
            all.into_iter()
                .filter(|a| prefixes.iter().any(|p| a.alarm_name.starts_with(p.as_str())))
                .filter(|a| a.instance_id_dimension() == Some(old_id.as_str()))
                .map(|a| a.alarm_name)
                .collect()
        }
        _ => {
            ctx.alarms
                .describe_alarms(&[])
                .await?
                .into_iter()
                .filter(|a| a.instance_id_dimension() == Some(old_id.as_str()))
                .map(|a| a.alarm_name)
                .collect()
        }
    };

    let mut updated = 0;
    for name in names {
        let alarms = ctx.alarms.describe_alarms(&[name]).await?;
        for mut alarm in alarms {
            for dim in alarm.dimensions.iter_mut() {
                if dim.0 == "InstanceId" {
                    dim.1 = new_instance_id.as_str().to_string();
                }
            }
            ctx.alarms.put_metric_alarm(&alarm).await?;
            updated += 1;
        }
    }
    Ok(HandlerOutcome::ok(format!("remapped {updated} alarms to the new instance"), Default::default()))
}

async fn untag_resources(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let instance = require(&record.conversion_start_instance_state, "ConversionStartInstanceState")?;
    let new_instance_id = require(&record.new_instance_id, "NewInstanceId")?;
    let mut ids = vec![new_instance_id.as_str().to_string()];
    ids.extend(instance.network_interfaces.iter().map(|n| n.network_interface_id.clone()));
    ids.extend(record.detached_volumes.clone().unwrap_or_default());
    let job_tag = vec![Tag { key: JOB_TAG_KEY.to_string(), value: record.job_id.as_str().to_string() }];
    ctx.compute.delete_tags(&ids, &job_tag).await?;

    let mut found = ctx.compute.describe_instances(std::slice::from_ref(new_instance_id)).await?;
    let delta = ConversionRecordDelta {
        final_instance_state: found.pop(),
        end_time: Some(chrono::Utc::now().timestamp()),
        ..Default::default()
    };
    Ok(HandlerOutcome::ok("job-id tag removed from all resources", delta))
}

async fn deregister_image(ctx: &EngineContext, record: &ConversionRecord) -> Result<HandlerOutcome, EngineError> {
    let image_id = require(&record.image_id, "ImageId")?;
    let devices = record.volumes_in_ami.clone().unwrap_or_default();
    let images = ctx.compute.describe_images(std::slice::from_ref(image_id)).await?;
    let snapshot_ids: Vec<String> = images
        .first()
        .and_then(|i| i.get("snapshot_ids"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    ctx.compute.deregister_image(image_id).await?;
    for snapshot_id in &snapshot_ids {
        ctx.compute.delete_snapshot(snapshot_id).await?;
    }
    let _ = devices;
    Ok(HandlerOutcome::ok(format!("deregistered AMI and deleted {} snapshots", snapshot_ids.len()), Default::default()))
}

fn initial_id(record: &ConversionRecord) -> Result<&InstanceId, EngineError> {
    Ok(&require(&record.initial_instance_state, "InitialInstanceState")?.instance_id)
}
