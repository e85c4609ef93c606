use async_trait::async_trait;
use serde_json::Value;

use esc_domain::{
    HibernationOptions, InstanceBlockDevice, InstanceDescriptor, InstanceId, InstanceNetworkInterface,
    InstanceState, LaunchSpecification, Placement, PublicIpAssociation, SpotRequestDescriptor, Tag,
    VolumeAttachment, VolumeDescriptor,
};

use crate::credentials::{default_provider_chain, CredentialsProvider};
use crate::error::DriverError;
use crate::traits::ComputeClient;
use crate::transport::Transport;
use crate::xml::{xml_all_texts, xml_items, xml_text};

const SERVICE: &str = "ec2";

fn indexed(prefix: &str, values: &[impl AsRef<str>]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{prefix}.{}", i + 1), v.as_ref().to_string()))
        .collect()
}

/// `ComputeClient` backed by the real EC2 Query API (SigV4-signed POST,
/// XML responses). Grounded in `nclav-driver::aws`'s `query_api` callers.
pub struct AwsComputeClient {
    transport: Transport,
    endpoint: String,
}

impl AwsComputeClient {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://ec2.{region}.amazonaws.com"),
            transport: Transport::new(default_provider_chain(), region),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(endpoint: String, creds: impl CredentialsProvider + 'static) -> Self {
        Self { endpoint, transport: Transport::new(Box::new(creds), "us-east-1") }
    }

    async fn call(&self, action: &str, mut params: Vec<(String, String)>) -> Result<String, DriverError> {
        params.push(("Action".to_string(), action.to_string()));
        params.push(("Version".to_string(), "2016-11-15".to_string()));
        self.transport.query_api(&self.endpoint, SERVICE, &params).await
    }

    fn instance_from_xml(item: &str) -> InstanceDescriptor {
        let tags = xml_items(item, "item")
            .iter()
            .filter_map(|kv| {
                let k = xml_text(kv, "key")?;
                let v = xml_text(kv, "value").unwrap_or_default();
                Some(Tag { key: k, value: v })
            })
            .collect::<Vec<_>>();

        let block_device_mappings = xml_items(item, "item")
            .iter()
            .filter(|kv| xml_text(kv, "volumeId").is_some())
            .map(|kv| InstanceBlockDevice {
                device_name: xml_text(kv, "deviceName").unwrap_or_default(),
                volume_id: xml_text(kv, "volumeId").unwrap_or_default(),
                delete_on_termination: xml_text(kv, "deleteOnTermination").as_deref() == Some("true"),
            })
            .collect::<Vec<_>>();

        let network_interfaces = xml_items(item, "item")
            .iter()
            .filter(|kv| xml_text(kv, "networkInterfaceId").is_some())
            .map(|kv| Self::network_interface_from_xml(kv))
            .collect::<Vec<_>>();

        InstanceDescriptor {
            instance_id: InstanceId::new(xml_text(item, "instanceId").unwrap_or_default()),
            instance_type: xml_text(item, "instanceType").unwrap_or_default(),
            architecture: xml_text(item, "architecture").unwrap_or_else(|| "x86_64".to_string()),
            state: InstanceState(xml_text(item, "name").unwrap_or_else(|| "unknown".to_string())),
            image_id: xml_text(item, "imageId").unwrap_or_default(),
            key_name: xml_text(item, "keyName"),
            ebs_optimized: xml_text(item, "ebsOptimized").as_deref() == Some("true"),
            monitoring_enabled: xml_text(item, "state").as_deref() == Some("enabled"),
            placement: Placement {
                availability_zone: xml_text(item, "availabilityZone").unwrap_or_default(),
                tenancy: xml_text(item, "tenancy").unwrap_or_else(|| "default".to_string()),
            },
            spot_instance_request_id: xml_text(item, "spotInstanceRequestId"),
            cpu_options: None,
            credit_specification: None,
            capacity_reservation_specification: None,
            hibernation_options: xml_text(item, "configured")
                .map(|v| HibernationOptions { configured: v == "true" }),
            metadata_options: None,
            enclave_options: None,
            instance_initiated_shutdown_behavior: xml_text(item, "instanceInitiatedShutdownBehavior"),
            licenses: xml_all_texts(item, "licenseConfigurationArn"),
            iam_instance_profile_arn: xml_text(item, "arn"),
            user_data: None,
            block_device_mappings,
            network_interfaces,
            elastic_gpu_associations: xml_all_texts(item, "elasticGpuId"),
            elastic_inference_accelerator_arns: xml_all_texts(item, "elasticInferenceAcceleratorArn"),
            tags,
            api_termination_protection: None,
            disable_api_stop_protection: None,
        }
    }

    fn network_interface_from_xml(item: &str) -> InstanceNetworkInterface {
        let public_ip_association = xml_text(item, "publicIp")
            .map(|public_ip| PublicIpAssociation { public_ip, allocation_id: xml_text(item, "allocationId") });
        InstanceNetworkInterface {
            network_interface_id: xml_text(item, "networkInterfaceId").unwrap_or_default(),
            attachment_id: xml_text(item, "attachmentId").unwrap_or_default(),
            device_index: xml_text(item, "deviceIndex").and_then(|s| s.parse().ok()).unwrap_or(0),
            delete_on_termination: xml_text(item, "deleteOnTermination").as_deref() == Some("true"),
            public_ip_association,
        }
    }

    fn volume_from_xml(item: &str) -> VolumeDescriptor {
        let attachments = xml_items(item, "item")
            .iter()
            .filter(|kv| xml_text(kv, "instanceId").is_some())
            .map(|kv| VolumeAttachment {
                instance_id: xml_text(kv, "instanceId").unwrap_or_default(),
                device: xml_text(kv, "device").unwrap_or_default(),
                state: xml_text(kv, "status").unwrap_or_default(),
            })
            .collect();

        VolumeDescriptor {
            volume_id: xml_text(item, "volumeId").unwrap_or_default(),
            size_gib: xml_text(item, "size").and_then(|s| s.parse().ok()).unwrap_or(0),
            volume_type: xml_text(item, "volumeType").unwrap_or_default(),
            iops: xml_text(item, "iops").and_then(|s| s.parse().ok()),
            throughput: xml_text(item, "throughput").and_then(|s| s.parse().ok()),
            encrypted: xml_text(item, "encrypted").as_deref() == Some("true"),
            kms_key_id: xml_text(item, "kmsKeyId"),
            state: xml_text(item, "status").unwrap_or_default(),
            multi_attach_enabled: xml_text(item, "multiAttachEnabled").as_deref() == Some("true"),
            attachments,
        }
    }
}

#[async_trait]
impl ComputeClient for AwsComputeClient {
    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<InstanceDescriptor>, DriverError> {
        let ids = instance_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        let xml = self.call("DescribeInstances", indexed("InstanceId", &ids)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "instanceId").is_some())
            .map(|i| Self::instance_from_xml(i))
            .collect())
    }

    async fn describe_instance_attribute(&self, instance_id: &InstanceId, attribute: &str) -> Result<Value, DriverError> {
        let xml = self
            .call(
                "DescribeInstanceAttribute",
                vec![
                    ("InstanceId".to_string(), instance_id.as_str().to_string()),
                    ("Attribute".to_string(), attribute.to_string()),
                ],
            )
            .await?;
        let value = xml_text(&xml, "value");
        Ok(match attribute {
            "disableApiTermination" => serde_json::json!({ "value": value.as_deref() == Some("true") }),
            _ => serde_json::json!({ "value": value }),
        })
    }

    async fn stop_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        let ids = instance_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        self.call("StopInstances", indexed("InstanceId", &ids)).await?;
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        let ids = instance_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        self.call("TerminateInstances", indexed("InstanceId", &ids)).await?;
        Ok(())
    }

    async fn reboot_instances(&self, instance_ids: &[InstanceId]) -> Result<(), DriverError> {
        let ids = instance_ids.iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        self.call("RebootInstances", indexed("InstanceId", &ids)).await?;
        Ok(())
    }

    async fn run_instances(&self, spec: &LaunchSpecification) -> Result<InstanceId, DriverError> {
        let mut params = vec![
            ("ImageId".to_string(), spec.image_id.clone()),
            ("InstanceType".to_string(), spec.instance_type.clone()),
            ("MinCount".to_string(), "1".to_string()),
            ("MaxCount".to_string(), "1".to_string()),
            ("EbsOptimized".to_string(), spec.ebs_optimized.to_string()),
            ("Monitoring.Enabled".to_string(), spec.monitoring_enabled.to_string()),
            ("Placement.AvailabilityZone".to_string(), spec.placement.availability_zone.clone()),
            ("Placement.Tenancy".to_string(), spec.placement.tenancy.clone()),
        ];

        if let Some(key_name) = &spec.key_name {
            params.push(("KeyName".to_string(), key_name.clone()));
        }
        if let Some(arn) = &spec.iam_instance_profile_arn {
            params.push(("IamInstanceProfile.Arn".to_string(), arn.clone()));
        }
        if let Some(user_data) = &spec.user_data {
            // AWS hands back `DescribeInstanceAttribute(userData)` already
            // base64-encoded; the value is carried through unchanged from
            // discovery to launch, so no re-encoding happens here.
            params.push(("UserData".to_string(), user_data.clone()));
        }
        if let Some(behavior) = &spec.instance_initiated_shutdown_behavior {
            params.push(("InstanceInitiatedShutdownBehavior".to_string(), behavior.clone()));
        }
        if let Some(configured) = spec.hibernation_configured {
            params.push(("HibernationOptions.Configured".to_string(), configured.to_string()));
        }
        if let Some(cpu_options) = &spec.cpu_options {
            params.push(("CpuOptions.CoreCount".to_string(), cpu_options.core_count.to_string()));
            params.push(("CpuOptions.ThreadsPerCore".to_string(), cpu_options.threads_per_core.to_string()));
        }
        if let Some(market) = &spec.instance_market_options {
            params.push(("InstanceMarketOptions.MarketType".to_string(), "spot".to_string()));
            params.push((
                "InstanceMarketOptions.SpotOptions.InstanceInterruptionBehavior".to_string(),
                market.interruption_behavior.clone(),
            ));
            if let Some(max_price) = &market.max_price {
                params.push(("InstanceMarketOptions.SpotOptions.MaxPrice".to_string(), max_price.clone()));
            }
        }

        for (i, bdm) in spec.block_device_mappings.iter().enumerate() {
            let n = i + 1;
            params.push((format!("BlockDeviceMapping.{n}.DeviceName"), bdm.device_name.clone()));
            if let Some(ebs) = &bdm.ebs {
                params.push((
                    format!("BlockDeviceMapping.{n}.Ebs.DeleteOnTermination"),
                    ebs.delete_on_termination.to_string(),
                ));
                params.push((format!("BlockDeviceMapping.{n}.Ebs.VolumeType"), ebs.volume_type.clone()));
                if let Some(iops) = ebs.iops {
                    params.push((format!("BlockDeviceMapping.{n}.Ebs.Iops"), iops.to_string()));
                }
                if let Some(throughput) = ebs.throughput {
                    params.push((format!("BlockDeviceMapping.{n}.Ebs.Throughput"), throughput.to_string()));
                }
                if let Some(encrypted) = ebs.encrypted {
                    params.push((format!("BlockDeviceMapping.{n}.Ebs.Encrypted"), encrypted.to_string()));
                }
                if let Some(kms_key_id) = &ebs.kms_key_id {
                    params.push((format!("BlockDeviceMapping.{n}.Ebs.KmsKeyId"), kms_key_id.clone()));
                }
            }
        }

        for (i, eni) in spec.network_interfaces.iter().enumerate() {
            let n = i + 1;
            params.push((format!("NetworkInterface.{n}.DeviceIndex"), eni.device_index.to_string()));
            params.push((format!("NetworkInterface.{n}.NetworkInterfaceId"), eni.network_interface_id.clone()));
        }

        for (i, gpu) in spec.elastic_gpu_specification.iter().enumerate() {
            params.push((format!("ElasticGpuSpecification.{}.Type", i + 1), gpu.gpu_type.clone()));
        }

        if let Some(accelerator) = &spec.elastic_inference_accelerators {
            params.push(("ElasticInferenceAccelerator.1.Type".to_string(), accelerator.accelerator_type.clone()));
            params.push(("ElasticInferenceAccelerator.1.Count".to_string(), accelerator.count.to_string()));
        }

        if !spec.tags.is_empty() {
            params.push(("TagSpecification.1.ResourceType".to_string(), "instance".to_string()));
            for (i, tag) in spec.tags.iter().enumerate() {
                let n = i + 1;
                params.push((format!("TagSpecification.1.Tag.{n}.Key"), tag.key.clone()));
                params.push((format!("TagSpecification.1.Tag.{n}.Value"), tag.value.clone()));
            }
        }

        // `capacity_reservation_specification`, `credit_specification`,
        // `metadata_options` and `enclave_options` are carried as opaque
        // JSON (see `InstanceDescriptor`'s doc comment) but discovery never
        // actually populates them for the real client, so there is nothing
        // to translate into query params here.
        if !spec.licenses.is_empty() {
            for (i, arn) in spec.licenses.iter().enumerate() {
                params.push((format!("LicenseSpecification.{}.LicenseConfigurationArn", i + 1), arn.clone()));
            }
        }

        let xml = self.call("RunInstances", params).await?;
        xml_text(&xml, "instanceId")
            .map(InstanceId::new)
            .ok_or_else(|| DriverError::Api("RunInstances: no instanceId in response".into()))
    }

    async fn create_image(&self, instance_id: &InstanceId, name: &str, _block_devices: &Value) -> Result<String, DriverError> {
        let xml = self
            .call(
                "CreateImage",
                vec![
                    ("InstanceId".to_string(), instance_id.as_str().to_string()),
                    ("Name".to_string(), name.to_string()),
                ],
            )
            .await?;
        xml_text(&xml, "imageId").ok_or_else(|| DriverError::Api("CreateImage: no imageId in response".into()))
    }

    async fn describe_images(&self, image_ids: &[String]) -> Result<Vec<Value>, DriverError> {
        let xml = self.call("DescribeImages", indexed("ImageId", image_ids)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "imageId").is_some())
            .map(|i| {
                let snapshot_ids: Vec<String> = xml_items(i, "item")
                    .iter()
                    .filter_map(|bdm| xml_text(bdm, "snapshotId"))
                    .collect();
                serde_json::json!({
                    "image_id": xml_text(i, "imageId"),
                    "state": xml_text(i, "imageState"),
                    "snapshot_ids": snapshot_ids,
                })
            })
            .collect())
    }

    async fn deregister_image(&self, image_id: &str) -> Result<(), DriverError> {
        self.call("DeregisterImage", vec![("ImageId".to_string(), image_id.to_string())]).await?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError> {
        let mut params = indexed("ResourceId", resource_ids);
        for (i, tag) in tags.iter().enumerate() {
            params.push((format!("Tag.{}.Key", i + 1), tag.key.clone()));
            params.push((format!("Tag.{}.Value", i + 1), tag.value.clone()));
        }
        self.call("CreateTags", params).await?;
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), DriverError> {
        let mut params = indexed("ResourceId", resource_ids);
        for (i, tag) in tags.iter().enumerate() {
            params.push((format!("Tag.{}.Key", i + 1), tag.key.clone()));
        }
        self.call("DeleteTags", params).await?;
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str) -> Result<String, DriverError> {
        let xml = self.call("CreateSnapshot", vec![("VolumeId".to_string(), volume_id.to_string())]).await?;
        xml_text(&xml, "snapshotId").ok_or_else(|| DriverError::Api("CreateSnapshot: no snapshotId in response".into()))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), DriverError> {
        self.call("DeleteSnapshot", vec![("SnapshotId".to_string(), snapshot_id.to_string())]).await?;
        Ok(())
    }

    async fn describe_volumes(&self, volume_ids: &[String]) -> Result<Vec<VolumeDescriptor>, DriverError> {
        let xml = self.call("DescribeVolumes", indexed("VolumeId", volume_ids)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "volumeId").is_some())
            .map(|i| Self::volume_from_xml(i))
            .collect())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &InstanceId) -> Result<(), DriverError> {
        self.call(
            "DetachVolume",
            vec![
                ("VolumeId".to_string(), volume_id.to_string()),
                ("InstanceId".to_string(), instance_id.as_str().to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &InstanceId, device: &str) -> Result<(), DriverError> {
        self.call(
            "AttachVolume",
            vec![
                ("VolumeId".to_string(), volume_id.to_string()),
                ("InstanceId".to_string(), instance_id.as_str().to_string()),
                ("Device".to_string(), device.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), DriverError> {
        self.call("DeleteVolume", vec![("VolumeId".to_string(), volume_id.to_string())]).await?;
        Ok(())
    }

    async fn describe_network_interfaces(&self, eni_ids: &[String]) -> Result<Vec<Value>, DriverError> {
        let xml = self.call("DescribeNetworkInterfaces", indexed("NetworkInterfaceId", eni_ids)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "networkInterfaceId").is_some())
            .map(|i| {
                serde_json::json!({
                    "network_interface_id": xml_text(i, "networkInterfaceId"),
                    "status": xml_text(i, "status"),
                    "attachment": { "instanceId": xml_text(i, "instanceId") },
                })
            })
            .collect())
    }

    async fn modify_network_interface_attribute(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), DriverError> {
        self.call(
            "ModifyNetworkInterfaceAttribute",
            vec![
                ("NetworkInterfaceId".to_string(), eni_id.to_string()),
                ("Attachment.AttachmentId".to_string(), attachment_id.to_string()),
                ("Attachment.DeleteOnTermination".to_string(), delete_on_termination.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn describe_addresses(&self, public_ips: &[String]) -> Result<Vec<Value>, DriverError> {
        let xml = self.call("DescribeAddresses", indexed("PublicIp", public_ips)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .map(|i| serde_json::json!({
                "public_ip": xml_text(i, "publicIp"),
                "allocation_id": xml_text(i, "allocationId"),
            }))
            .collect())
    }

    async fn associate_address(&self, instance_id: &InstanceId, allocation_id: &str) -> Result<(), DriverError> {
        self.call(
            "AssociateAddress",
            vec![
                ("InstanceId".to_string(), instance_id.as_str().to_string()),
                ("AllocationId".to_string(), allocation_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn describe_elastic_gpus(&self, instance_id: &InstanceId) -> Result<Vec<Value>, DriverError> {
        let xml = self
            .call(
                "DescribeElasticGpus",
                vec![
                    ("Filter.1.Name".to_string(), "instance-id".to_string()),
                    ("Filter.1.Value.1".to_string(), instance_id.as_str().to_string()),
                ],
            )
            .await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "elasticGpuId").is_some())
            .map(|i| serde_json::json!({
                "elastic_gpu_id": xml_text(i, "elasticGpuId"),
                "elastic_gpu_type": xml_text(i, "elasticGpuType"),
            }))
            .collect())
    }

    async fn describe_spot_instance_requests(&self, request_ids: &[String]) -> Result<Vec<SpotRequestDescriptor>, DriverError> {
        let xml = self.call("DescribeSpotInstanceRequests", indexed("SpotInstanceRequestId", request_ids)).await?;
        Ok(xml_items(&xml, "item")
            .iter()
            .filter(|i| xml_text(i, "spotInstanceRequestId").is_some())
            .map(|i| SpotRequestDescriptor {
                spot_instance_request_id: xml_text(i, "spotInstanceRequestId").unwrap_or_default(),
                state: xml_text(i, "state").unwrap_or_default(),
                request_type: xml_text(i, "type").unwrap_or_else(|| "one-time".to_string()),
                max_price: xml_text(i, "spotPrice"),
            })
            .collect())
    }

    async fn cancel_spot_instance_requests(&self, request_ids: &[String]) -> Result<(), DriverError> {
        self.call("CancelSpotInstanceRequests", indexed("SpotInstanceRequestId", request_ids)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialsProvider;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_creds() -> StaticCredentialsProvider {
        StaticCredentialsProvider {
            access_key_id: "AKIDTEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    #[tokio::test]
    async fn describe_instances_parses_multiple_records() {
        let server = MockServer::start().await;
        let body = r#"<DescribeInstancesResponse>
            <reservationSet>
              <item><instancesSet>
                <item><instanceId>i-1</instanceId><instanceType>m5.large</instanceType>
                  <instanceState><name>running</name></instanceState>
                  <placement><availabilityZone>us-east-1a</availabilityZone><tenancy>default</tenancy></placement>
                </item>
              </instancesSet></item>
            </reservationSet>
        </DescribeInstancesResponse>"#;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = AwsComputeClient::with_test_config(server.uri(), test_creds());
        let instances = client.describe_instances(&[InstanceId::new("i-1")]).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id.as_str(), "i-1");
        assert_eq!(instances[0].instance_type, "m5.large");
    }

    #[tokio::test]
    async fn surfaces_error_responses() {
        let server = MockServer::start().await;
        let body = r#"<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code><Message>not found</Message></Error></Errors></Response>"#;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(400).set_body_string(body))
            .mount(&server)
            .await;

        let client = AwsComputeClient::with_test_config(server.uri(), test_creds());
        let err = client.stop_instances(&[InstanceId::new("i-1")]).await.unwrap_err();
        assert!(matches!(err, DriverError::Api(_)));
    }
}
