use async_trait::async_trait;
use serde_json::{json, Value};

use crate::credentials::{default_provider_chain, CredentialsProvider};
use crate::error::DriverError;
use crate::traits::KeyManagementClient;
use crate::transport::Transport;

const SERVICE: &str = "kms";

/// `KeyManagementClient` backed by KMS's JSON protocol. Used only to
/// validate `--volume-kms-key-id` before it is used in `create-ami`/
/// `create-new-instance` (spec §6).
pub struct AwsKeyManagementClient {
    transport: Transport,
    endpoint: String,
}

impl AwsKeyManagementClient {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://kms.{region}.amazonaws.com"),
            transport: Transport::new(default_provider_chain(), region),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(endpoint: String, creds: impl CredentialsProvider + 'static) -> Self {
        Self { endpoint, transport: Transport::new(Box::new(creds), "us-east-1") }
    }
}

#[async_trait]
impl KeyManagementClient for AwsKeyManagementClient {
    async fn describe_key(&self, key_id: &str) -> Result<Value, DriverError> {
        self.transport
            .json_api(
                &self.endpoint,
                SERVICE,
                "TrentService.DescribeKey",
                &json!({ "KeyId": key_id }),
            )
            .await
    }
}
