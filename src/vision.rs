// Outbound client for the AI vision service (Anthropic messages wire shape)
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::VisionConfig;

/// Prompt sent alongside every label photo. The reply is either a JSON block
/// with the fields below or the literal `NOT_COFFEE` sentinel.
pub const ANALYZE_PROMPT: &str = r#"Analyze this coffee bag and extract the following information as JSON:
{
  "name": "coffee name or farm name",
  "origin": "country and region",
  "process": "processing method (washed, natural, honey, etc)",
  "cultivar": "variety/cultivar",
  "altitude": "altitude in masl",
  "roaster": "roaster name",
  "tastingNotes": "tasting notes"
}

Only return valid JSON, no other text. If the image does not show a coffee bag or coffee label, reply with exactly NOT_COFFEE instead."#;

/// Literal reply the prompt requests for images that are not coffee labels.
pub const NOT_COFFEE: &str = "NOT_COFFEE";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("vision service rejected the request: {0}")]
    Upstream(String),

    #[error("vision response carried no text content")]
    MalformedResponse,

    #[error("vision service is not configured (missing API key)")]
    Unconfigured,
}

/// Thin HTTP client around the vision API. Holds a shared connection pool;
/// cheap to clone.
#[derive(Clone)]
pub struct VisionClient {
    client: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    model: String,
    max_tokens: u32,
}

impl VisionClient {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Sends one base64 image plus the analysis prompt and returns the raw
    /// reply text. Callers interpret the text (JSON block or sentinel).
    pub async fn describe_image(
        &self,
        image_data: &str,
        media_type: &str,
    ) -> Result<String, VisionError> {
        let api_key = self.api_key.as_deref().ok_or(VisionError::Unconfigured)?;

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": image_data
                        }
                    },
                    {
                        "type": "text",
                        "text": ANALYZE_PROMPT
                    }
                ]
            }]
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: Value = response.json().await?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("API error")
                .to_string();
            return Err(VisionError::Upstream(message));
        }

        payload
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(VisionError::MalformedResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_fails_without_a_request() {
        let client = VisionClient::new(&VisionConfig {
            api_key: None,
            api_url: "http://127.0.0.1:9/unreachable".to_string(),
            model: "test-model".to_string(),
            max_tokens: 16,
        });

        let err = client.describe_image("aGVsbG8=", "image/jpeg").await.unwrap_err();
        assert!(matches!(err, VisionError::Unconfigured));
    }

    #[test]
    fn prompt_names_the_sentinel() {
        assert!(ANALYZE_PROMPT.contains(NOT_COFFEE));
    }
}
