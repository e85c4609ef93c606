use async_trait::async_trait;
use serde_json::json;

use esc_domain::{ElasticInferenceAccelerator, InstanceId};

use crate::credentials::{default_provider_chain, CredentialsProvider};
use crate::error::DriverError;
use crate::traits::AcceleratorClient;
use crate::transport::Transport;

const SERVICE: &str = "elastic-inference";

/// `AcceleratorClient` backed by the Elastic Inference JSON API, used by
/// `create-new-instance` to carry accelerator attachments across the
/// conversion (spec §4.4).
pub struct AwsAcceleratorClient {
    transport: Transport,
    endpoint: String,
}

impl AwsAcceleratorClient {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://api.elastic-inference.{region}.amazonaws.com"),
            transport: Transport::new(default_provider_chain(), region),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(endpoint: String, creds: impl CredentialsProvider + 'static) -> Self {
        Self { endpoint, transport: Transport::new(Box::new(creds), "us-east-1") }
    }
}

#[async_trait]
impl AcceleratorClient for AwsAcceleratorClient {
    async fn describe_accelerators(&self, instance_id: &InstanceId) -> Result<Vec<ElasticInferenceAccelerator>, DriverError> {
        let resp = self
            .transport
            .json_api(
                &self.endpoint,
                SERVICE,
                "DescribeAcceleratorsRequest",
                &json!({
                    "filters": [{ "name": "instance-id", "values": [instance_id.as_str()] }],
                }),
            )
            .await?;

        Ok(resp["acceleratorSet"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| {
                Some(ElasticInferenceAccelerator {
                    accelerator_arn: a["acceleratorArn"].as_str()?.to_string(),
                    accelerator_type: a["acceleratorType"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }
}
