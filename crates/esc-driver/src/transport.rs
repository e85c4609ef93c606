use serde_json::Value;

use crate::credentials::{AwsCredentials, CredentialsProvider};
use crate::error::DriverError;
use crate::sigv4::{sigv4_headers, url_host};
use crate::xml::{xml_error_code, xml_error_message};

/// Shared POST transport for AWS Query (EC2/ELBv2/CloudWatch, XML response)
/// and JSON (KMS) protocol calls. Grounded in
/// `nclav-driver::aws::{query_api, json_api}`; retries follow spec §6/§7's
/// "5 attempts, standard backoff" policy.
pub struct Transport {
    pub client: reqwest::Client,
    pub creds: Box<dyn CredentialsProvider>,
    pub region: String,
}

const MAX_ATTEMPTS: u32 = 5;

impl Transport {
    pub fn new(creds: Box<dyn CredentialsProvider>, region: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), creds, region: region.into() }
    }

    async fn backoff(attempt: u32) {
        let millis = 200u64 * 2u64.pow(attempt);
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
    }

    /// POST a form-encoded Query-protocol request, returning the raw XML body.
    pub async fn query_api(
        &self,
        base_url: &str,
        service: &str,
        params: &[(String, String)],
    ) -> Result<String, DriverError> {
        let creds: AwsCredentials = self.creds.credentials().await?;
        let host = url_host(base_url).to_string();
        let url = format!("{}/", base_url.trim_end_matches('/'));

        let body_str = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let body_bytes = body_str.as_bytes();
        let ct = "application/x-www-form-urlencoded; charset=utf-8";

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            let sig_headers =
                sigv4_headers("POST", "/", "", ct, body_bytes, &creds, &self.region, service, &host);

            let mut req = self.client.post(&url).header("Content-Type", ct).body(body_bytes.to_vec());
            for (k, v) in &sig_headers {
                req = req.header(k, v);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    if status >= 500 {
                        last_err = Some(DriverError::Api(format!("{base_url}: HTTP {status}")));
                        Self::backoff(attempt).await;
                        continue;
                    }
                    if status >= 400 {
                        let code = xml_error_code(&text);
                        let msg = xml_error_message(&text);
                        return Err(DriverError::Api(format!("{base_url}: {code} — {msg}")));
                    }
                    return Ok(text);
                }
                Err(e) => {
                    last_err = Some(DriverError::Api(format!("POST {url} failed: {e}")));
                    Self::backoff(attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Api(format!("POST {url} exhausted retries"))))
    }

    /// POST an AWS JSON-protocol (`X-Amz-Target`) request, returning parsed JSON.
    pub async fn json_api(
        &self,
        base_url: &str,
        service: &str,
        target: &str,
        body: &Value,
    ) -> Result<Value, DriverError> {
        let creds: AwsCredentials = self.creds.credentials().await?;
        let host = url_host(base_url).to_string();
        let url = format!("{}/", base_url.trim_end_matches('/'));
        let body_str = serde_json::to_string(body).unwrap_or_default();
        let body_bytes = body_str.as_bytes();
        let ct = "application/x-amz-json-1.1";

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            let mut sig_headers =
                sigv4_headers("POST", "/", "", ct, body_bytes, &creds, &self.region, service, &host);
            sig_headers.insert("X-Amz-Target".into(), target.into());

            let mut req = self
                .client
                .post(&url)
                .header("Content-Type", ct)
                .header("X-Amz-Target", target)
                .body(body_bytes.to_vec());
            for (k, v) in &sig_headers {
                req = req.header(k, v);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let resp_body: Value = resp.json().await.unwrap_or(Value::Null);
                    if status >= 500 {
                        last_err = Some(DriverError::Api(format!("{base_url} [{target}]: HTTP {status}")));
                        Self::backoff(attempt).await;
                        continue;
                    }
                    if status >= 400 {
                        let error_type = resp_body["__type"].as_str().unwrap_or("Unknown");
                        let msg = resp_body["message"]
                            .as_str()
                            .or_else(|| resp_body["Message"].as_str())
                            .unwrap_or("unknown error");
                        return Err(DriverError::Api(format!(
                            "{base_url} [{target}]: {error_type} — {msg}"
                        )));
                    }
                    return Ok(resp_body);
                }
                Err(e) => {
                    last_err = Some(DriverError::Api(format!("POST {url} failed: {e}")));
                    Self::backoff(attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Api(format!("POST {url} exhausted retries"))))
    }
}
