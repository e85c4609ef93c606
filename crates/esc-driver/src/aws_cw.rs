use async_trait::async_trait;
use serde_json::json;

use esc_domain::MetricAlarm;

use crate::credentials::{default_provider_chain, CredentialsProvider};
use crate::error::DriverError;
use crate::traits::MetricAlarmClient;
use crate::transport::Transport;
use crate::xml::{xml_items, xml_text};

const SERVICE: &str = "monitoring";

/// `MetricAlarmClient` backed by CloudWatch's Query API (spec §4.4
/// update-cloudwatch-alarms: re-point `InstanceId` dimensions at the new
/// instance, carrying every other alarm property through unexamined).
pub struct AwsMetricAlarmClient {
    transport: Transport,
    endpoint: String,
}

impl AwsMetricAlarmClient {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://monitoring.{region}.amazonaws.com"),
            transport: Transport::new(default_provider_chain(), region),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(endpoint: String, creds: impl CredentialsProvider + 'static) -> Self {
        Self { endpoint, transport: Transport::new(Box::new(creds), "us-east-1") }
    }

    async fn call(&self, action: &str, mut params: Vec<(String, String)>) -> Result<String, DriverError> {
        params.push(("Action".to_string(), action.to_string()));
        params.push(("Version".to_string(), "2010-08-01".to_string()));
        self.transport.query_api(&self.endpoint, SERVICE, &params).await
    }

    fn alarm_from_xml(item: &str) -> MetricAlarm {
        let dimensions = xml_items(item, "member")
            .iter()
            .filter_map(|d| {
                let name = xml_text(d, "Name")?;
                let value = xml_text(d, "Value")?;
                Some((name, value))
            })
            .collect::<Vec<_>>();

        MetricAlarm {
            alarm_name: xml_text(item, "AlarmName").unwrap_or_default(),
            namespace: xml_text(item, "Namespace").unwrap_or_default(),
            metric_name: xml_text(item, "MetricName").unwrap_or_default(),
            dimensions,
            raw: json!({}),
        }
    }
}

#[async_trait]
impl MetricAlarmClient for AwsMetricAlarmClient {
    async fn describe_alarms(&self, alarm_names: &[String]) -> Result<Vec<MetricAlarm>, DriverError> {
        let mut alarms = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params = alarm_names
                .iter()
                .enumerate()
                .map(|(i, n)| (format!("AlarmNames.member.{}", i + 1), n.clone()))
                .collect::<Vec<_>>();
            if let Some(ref t) = token {
                params.push(("NextToken".to_string(), t.clone()));
            }
            let xml = self.call("DescribeAlarms", params).await?;
            for item in xml_items(&xml, "member") {
                if xml_text(&item, "AlarmName").is_some() {
                    alarms.push(Self::alarm_from_xml(&item));
                }
            }
            token = xml_text(&xml, "NextToken");
            if token.is_none() {
                break;
            }
        }
        Ok(alarms)
    }

    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<(), DriverError> {
        let mut params = vec![
            ("AlarmName".to_string(), alarm.alarm_name.clone()),
            ("Namespace".to_string(), alarm.namespace.clone()),
            ("MetricName".to_string(), alarm.metric_name.clone()),
        ];
        for (i, (name, value)) in alarm.dimensions.iter().enumerate() {
            params.push((format!("Dimensions.member.{}.Name", i + 1), name.clone()));
            params.push((format!("Dimensions.member.{}.Value", i + 1), value.clone()));
        }
        self.call("PutMetricAlarm", params).await?;
        Ok(())
    }
}
