use async_trait::async_trait;

use esc_domain::{ElbTarget, InstanceId, TargetHealthState};

use crate::credentials::{default_provider_chain, CredentialsProvider};
use crate::error::DriverError;
use crate::traits::LoadBalancerClient;
use crate::transport::Transport;
use crate::xml::xml_text;

const SERVICE: &str = "elasticloadbalancing";

fn indexed(prefix: &str, values: &[impl AsRef<str>]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{prefix}.member.{}", i + 1), v.as_ref().to_string()))
        .collect()
}

/// `LoadBalancerClient` backed by ELBv2's Query API. Paging (`Marker`) is
/// followed until the response carries none (spec §4.4 detach/attach-from-elb).
pub struct AwsLoadBalancerClient {
    transport: Transport,
    endpoint: String,
}

impl AwsLoadBalancerClient {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://elasticloadbalancing.{region}.amazonaws.com"),
            transport: Transport::new(default_provider_chain(), region),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(endpoint: String, creds: impl CredentialsProvider + 'static) -> Self {
        Self { endpoint, transport: Transport::new(Box::new(creds), "us-east-1") }
    }

    async fn call(&self, action: &str, mut params: Vec<(String, String)>) -> Result<String, DriverError> {
        params.push(("Action".to_string(), action.to_string()));
        params.push(("Version".to_string(), "2015-12-01".to_string()));
        self.transport.query_api(&self.endpoint, SERVICE, &params).await
    }
}

#[async_trait]
impl LoadBalancerClient for AwsLoadBalancerClient {
    async fn describe_target_groups(&self, target_group_arns: &[String]) -> Result<Vec<String>, DriverError> {
        let mut arns = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut params = indexed("TargetGroupArns", target_group_arns);
            if let Some(ref m) = marker {
                params.push(("Marker".to_string(), m.clone()));
            }
            let xml = self.call("DescribeTargetGroups", params).await?;
            for item in crate::xml::xml_items(&xml, "member") {
                if let Some(arn) = xml_text(&item, "TargetGroupArn") {
                    arns.push(arn);
                }
            }
            marker = xml_text(&xml, "Marker");
            if marker.is_none() {
                break;
            }
        }
        Ok(arns)
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<(ElbTarget, TargetHealthState)>, DriverError> {
        let xml = self
            .call("DescribeTargetHealth", vec![("TargetGroupArn".to_string(), target_group_arn.to_string())])
            .await?;
        Ok(crate::xml::xml_items(&xml, "member")
            .iter()
            .filter_map(|item| {
                let port: u16 = xml_text(item, "Port")?.parse().ok()?;
                let state: TargetHealthState = xml_text(item, "State")?.parse().ok()?;
                Some((ElbTarget { target_group_arn: target_group_arn.to_string(), port }, state))
            })
            .collect())
    }

    async fn register_targets(&self, target_group_arn: &str, instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError> {
        let mut params = vec![("TargetGroupArn".to_string(), target_group_arn.to_string())];
        for (i, t) in targets.iter().enumerate() {
            params.push((format!("Targets.member.{}.Id", i + 1), instance_id.as_str().to_string()));
            params.push((format!("Targets.member.{}.Port", i + 1), t.port.to_string()));
        }
        self.call("RegisterTargets", params).await?;
        Ok(())
    }

    async fn deregister_targets(&self, target_group_arn: &str, instance_id: &InstanceId, targets: &[ElbTarget]) -> Result<(), DriverError> {
        let mut params = vec![("TargetGroupArn".to_string(), target_group_arn.to_string())];
        for (i, t) in targets.iter().enumerate() {
            params.push((format!("Targets.member.{}.Id", i + 1), instance_id.as_str().to_string()));
            params.push((format!("Targets.member.{}.Port", i + 1), t.port.to_string()));
        }
        self.call("DeregisterTargets", params).await?;
        Ok(())
    }
}
