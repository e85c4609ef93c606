use std::process::Command as StdCommand;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DriverError;

#[derive(Clone, Debug)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Credentials provider chain (spec §6 / SPEC_FULL §5): static env vars →
/// ECS task metadata → EC2 IMDSv2 → `aws` CLI `sts get-session-token`
/// fallback. Grounded in `nclav-driver::aws`'s `CredentialsProvider` chain.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError>;
}

pub struct StaticCredentialsProvider {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        Ok(AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}

pub struct ImdsCredentialsProvider {
    client: reqwest::Client,
    ecs_uri: Option<String>,
    cache: tokio::sync::Mutex<Option<(AwsCredentials, Instant)>>,
}

impl ImdsCredentialsProvider {
    pub fn new(ecs_uri: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            ecs_uri,
            cache: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialsProvider for ImdsCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        {
            let guard = self.cache.lock().await;
            if let Some((creds, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(creds.clone());
                }
            }
        }

        let creds = if let Some(ref uri) = self.ecs_uri {
            let url = format!("http://169.254.170.2{uri}");
            let resp: Value = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("ECS IMDS request: {e}")))?
                .json()
                .await
                .map_err(|e| DriverError::Internal(format!("ECS IMDS decode: {e}")))?;

            AwsCredentials {
                access_key_id: resp["AccessKeyId"].as_str().unwrap_or("").to_string(),
                secret_access_key: resp["SecretAccessKey"].as_str().unwrap_or("").to_string(),
                session_token: resp["Token"].as_str().map(str::to_string),
            }
        } else {
            let token_resp = self
                .client
                .put("http://169.254.169.254/latest/api/token")
                .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDSv2 token request: {e}")))?;
            let imds_token = token_resp
                .text()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDSv2 token decode: {e}")))?;

            let roles_resp = self
                .client
                .get("http://169.254.169.254/latest/meta-data/iam/security-credentials/")
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS roles request: {e}")))?;
            let roles_text = roles_resp.text().await.unwrap_or_default();
            let role_name = roles_text.lines().next().unwrap_or("").to_string();
            if role_name.is_empty() {
                return Err(DriverError::Internal("IMDS: no IAM role found".into()));
            }

            let creds_url = format!(
                "http://169.254.169.254/latest/meta-data/iam/security-credentials/{role_name}"
            );
            let resp: Value = self
                .client
                .get(&creds_url)
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS creds request: {e}")))?
                .json()
                .await
                .map_err(|e| DriverError::Internal(format!("IMDS creds decode: {e}")))?;

            AwsCredentials {
                access_key_id: resp["AccessKeyId"].as_str().unwrap_or("").to_string(),
                secret_access_key: resp["SecretAccessKey"].as_str().unwrap_or("").to_string(),
                session_token: resp["Token"].as_str().map(str::to_string),
            }
        };

        let expiry = Instant::now() + Duration::from_secs(600);
        *self.cache.lock().await = Some((creds.clone(), expiry));
        Ok(creds)
    }
}

pub struct AwsCliCredentialsProvider;

#[async_trait]
impl CredentialsProvider for AwsCliCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, DriverError> {
        let output = StdCommand::new("aws")
            .args(["sts", "get-session-token", "--duration-seconds", "3600", "--output", "json"])
            .output()
            .map_err(|e| {
                DriverError::Internal(format!(
                    "aws CLI not found: {e}. Install AWS CLI or configure credentials via env vars."
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::Internal(format!(
                "aws sts get-session-token failed: {}. Run 'aws configure' first.",
                stderr.trim()
            )));
        }

        let resp: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| DriverError::Internal(format!("aws CLI output parse: {e}")))?;

        let creds = &resp["Credentials"];
        Ok(AwsCredentials {
            access_key_id: creds["AccessKeyId"].as_str().unwrap_or("").to_string(),
            secret_access_key: creds["SecretAccessKey"].as_str().unwrap_or("").to_string(),
            session_token: creds["SessionToken"].as_str().map(str::to_string),
        })
    }
}

/// Select a provider the way `AwsDriver::new` does: static env vars first,
/// then the ECS/IMDSv2 metadata endpoints, falling back to the `aws` CLI.
pub fn default_provider_chain() -> Box<dyn CredentialsProvider> {
    if let (Ok(key), Ok(secret)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        return Box::new(StaticCredentialsProvider {
            access_key_id: key,
            secret_access_key: secret,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        });
    }
    if std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI").is_ok()
        || std::path::Path::new("/sys/hypervisor/uuid").exists()
    {
        let ecs_uri = std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI").ok();
        return Box::new(ImdsCredentialsProvider::new(ecs_uri));
    }
    Box::new(AwsCliCredentialsProvider)
}
