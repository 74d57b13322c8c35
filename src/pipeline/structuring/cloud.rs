use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parser::parse_json_object;
use super::prompt::{build_consultation_prompt, CONSULTATION_SYSTEM_PROMPT};
use super::types::InferenceBackend;
use super::{map_transport_error, StructuringError};
use crate::config::CloudBackendConfig;
use crate::pipeline::schema::MachineSchema;

/// Sampling temperature for structuring: low, near-deterministic.
const TEMPERATURE: f32 = 0.3;

/// Key fragments that mark a key copied from documentation or a template.
const PLACEHOLDER_KEY_MARKERS: &[&str] = &[
    "dummy",
    "sk-your-key",
    "sk-votre-cle",
    "gsk-your",
    "placeholder",
    "example.com",
    "changeme",
];

/// Whether `key` looks like a real credential.
pub fn is_usable_api_key(key: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return false;
    }
    let lowered = key.to_ascii_lowercase();
    !PLACEHOLDER_KEY_MARKERS.iter().any(|m| lowered.contains(m))
}

/// OpenAI-compatible chat-completion client (Groq, OpenAI).
pub struct CloudChatClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl CloudChatClient {
    /// Fails with `NotConfigured` when no usable API key is present.
    pub fn new(config: &CloudBackendConfig) -> Result<Self, StructuringError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| is_usable_api_key(k))
            .ok_or_else(|| StructuringError::NotConfigured("Cloud".into()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StructuringError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            client,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Request body for /chat/completions
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Response body from /chat/completions
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Pull the assistant message out of a chat-completion response.
fn reply_content(response: ChatResponse) -> Result<String, StructuringError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| StructuringError::MalformedResponse("No message content in reply".into()))
}

impl InferenceBackend for CloudChatClient {
    fn name(&self) -> &str {
        "cloud"
    }

    fn structure(&self, text: &str, schema: &MachineSchema) -> Result<Value, StructuringError> {
        let url = format!("{}/chat/completions", self.base_url);
        let prompt = build_consultation_prompt(text, schema);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: CONSULTATION_SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| StructuringError::MalformedResponse(e.to_string()))?;
        parse_json_object(&reply_content(parsed)?)
    }
}
