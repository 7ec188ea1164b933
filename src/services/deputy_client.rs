use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ErrorBody, ProcmanError, Result};
use crate::models::{Ack, Command, StatusReport};

/// Sheriff side of the Sheriff ⇄ Deputy channel.
///
/// Everything the coordinator sends to or reads from a Deputy goes through
/// this trait, so the wire (or a trust layer in front of it) can be swapped
/// without touching reconciliation.
#[async_trait]
pub trait DeputyClient: Send + Sync {
    async fn send_command(&self, address: &str, command: &Command) -> Result<Ack>;

    async fn fetch_status(&self, address: &str) -> Result<StatusReport>;
}

/// `host:port` → `http://host:port`; full URLs pass through
pub fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// JSON over HTTP, matching the Deputy's actix-web endpoints
pub struct HttpDeputyClient {
    http: reqwest::Client,
}

impl HttpDeputyClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProcmanError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DeputyClient for HttpDeputyClient {
    async fn send_command(&self, address: &str, command: &Command) -> Result<Ack> {
        let url = format!("{}/api/command", base_url(address));
        let response = self
            .http
            .post(&url)
            .json(command)
            .send()
            .await
            .map_err(|e| ProcmanError::unreachable(address, e.to_string()))?;

        if response.status().is_success() {
            return response
                .json::<Ack>()
                .await
                .map_err(|e| ProcmanError::Internal(format!("malformed ack from {}: {}", address, e)));
        }

        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(ProcmanError::from_body(body, address)),
            Err(_) => Err(ProcmanError::Internal(format!(
                "deputy {} answered {} to {}",
                address, status, command
            ))),
        }
    }

    async fn fetch_status(&self, address: &str) -> Result<StatusReport> {
        let url = format!("{}/api/status", base_url(address));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ProcmanError::unreachable(address, e.to_string()))?;

        response
            .json::<StatusReport>()
            .await
            .map_err(|e| ProcmanError::unreachable(address, format!("malformed report: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("localhost:8000"), "http://localhost:8000");
        assert_eq!(base_url("http://10.0.0.5:8000/"), "http://10.0.0.5:8000");
        assert_eq!(base_url("https://deputy.example"), "https://deputy.example");
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let client = HttpDeputyClient::new(Duration::from_millis(500)).unwrap();
        let err = client
            .send_command("127.0.0.1:1", &Command::Start { name: "echoloop".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcmanError::DeputyUnreachable { .. }));

        let err = client.fetch_status("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, ProcmanError::DeputyUnreachable { .. }));
    }
}
