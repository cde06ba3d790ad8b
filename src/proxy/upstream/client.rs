// Raw provider transport. Retry/failover policy lives with the handlers;
// this layer owns connection setup, headers and timeouts.

use reqwest::{header, Client, Response};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

const CODEWHISPERER_TARGET: &str =
    "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const CODEWHISPERER_USER_AGENT: &str = "aws-sdk-rust/1.3.9 ua/2.1 api/codewhispererstreaming/0.1.11582 os/macos lang/rust/1.87.0 md/appVersion-1.19.3 app/AmazonQ-For-CLI";
const CODEWHISPERER_AMZ_USER_AGENT: &str = "aws-sdk-rust/1.3.9 ua/2.1 api/codewhispererstreaming/0.1.11582 os/macos lang/rust/1.87.0 m/F app/AmazonQ-For-CLI";
const GEMINI_USER_AGENT: &str = "antigravity/1.11.3 darwin/arm64";

pub struct UpstreamClient {
    /// Streaming client: bounded connect, unbounded read so long
    /// generations are never cut off.
    streaming: Client,
    /// Control-plane client (quota snapshots, project discovery).
    control: Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let streaming = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let control = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { streaming, control }
    }

    /// Open the CodeWhisperer streaming POST. The response body is the AWS
    /// binary event stream regardless of status; callers inspect status.
    pub async fn send_codewhisperer(
        &self,
        endpoint: &str,
        access_token: &str,
        body: &Value,
    ) -> GatewayResult<Response> {
        let response = self
            .streaming
            .post(endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/x-amz-json-1.0")
            .header("X-Amz-Target", CODEWHISPERER_TARGET)
            .header(header::USER_AGENT, CODEWHISPERER_USER_AGENT)
            .header("X-Amz-User-Agent", CODEWHISPERER_AMZ_USER_AGENT)
            .header("X-Amzn-Codewhisperer-Optout", "true")
            .header("Amz-Sdk-Request", "attempt=1; max=3")
            .header("Amz-Sdk-Invocation-Id", Uuid::new_v4().to_string())
            .header(header::ACCEPT, "*/*")
            .json(body)
            .send()
            .await
            .map_err(GatewayError::Network)?;

        Ok(response)
    }

    /// Open a Gemini v1internal generate call, streaming or unary.
    pub async fn send_gemini(
        &self,
        api_endpoint: &str,
        access_token: &str,
        body: &Value,
        stream: bool,
    ) -> GatewayResult<Response> {
        let url = if stream {
            format!("{}/v1internal:streamGenerateContent?alt=sse", api_endpoint)
        } else {
            format!("{}/v1internal:generateContent", api_endpoint)
        };

        let response = self
            .streaming
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, GEMINI_USER_AGENT)
            .header(header::ACCEPT_ENCODING, "gzip")
            .json(body)
            .send()
            .await
            .map_err(GatewayError::Network)?;

        Ok(response)
    }

    pub fn control_client(&self) -> &Client {
        &self.control
    }
}
