use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::prompt::CONSULTATION_SYSTEM_PROMPT;
use super::types::InferenceBackend;
use super::{map_transport_error, StructuringError};
use crate::config::LocalBackendConfig;
use crate::pipeline::schema::MachineSchema;

/// HTTP client for the self-hosted inference sidecar.
pub struct LocalSidecarClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl LocalSidecarClient {
    pub fn new(config: &LocalBackendConfig) -> Result<Self, StructuringError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StructuringError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Request body for /process-generic
#[derive(Serialize)]
struct ProcessGenericRequest<'a> {
    text: &'a str,
    schema: &'a MachineSchema,
    system_prompt: &'a str,
}

/// Response body from /process-generic
#[derive(Deserialize)]
struct ProcessGenericResponse {
    #[serde(default)]
    data: Value,
}

fn extract_data(response: ProcessGenericResponse) -> Result<Value, StructuringError> {
    if response.data.is_object() {
        Ok(response.data)
    } else {
        Err(StructuringError::MalformedResponse(
            "Sidecar response has no data object".into(),
        ))
    }
}

impl InferenceBackend for LocalSidecarClient {
    fn name(&self) -> &str {
        "local"
    }

    fn structure(&self, text: &str, schema: &MachineSchema) -> Result<Value, StructuringError> {
        let url = format!("{}/process-generic", self.base_url);
        let body = ProcessGenericRequest {
            text,
            schema,
            system_prompt: CONSULTATION_SYSTEM_PROMPT,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| map_transport_error(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StructuringError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ProcessGenericResponse = response
            .json()
            .map_err(|e| StructuringError::MalformedResponse(e.to_string()))?;
        extract_data(parsed)
    }
}
