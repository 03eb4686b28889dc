//! Document classifier port and its OpenAI vision backend.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::image::ImageKind;

/// What a classifier saw in an identity image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReading {
    pub is_document: bool,
    pub extracted_digits: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier backend is rate limited")]
    RateLimited,
    #[error("classifier call timed out after {0:?}")]
    Timeout(Duration),
    #[error("classifier backend unavailable: {0}")]
    Unavailable(String),
    #[error("classifier returned an unusable response: {0}")]
    Malformed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<DocumentReading, ClassifierError>;
}

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = r#"You inspect photos taken by students before an online exam.
Decide whether the photo shows an identity document (ID card, passport, student card).
If it does, read the document number and return only its digits.
Respond with a JSON object: {"is_document": bool, "extracted_digits": "string"}.
If no document is visible, return {"is_document": false, "extracted_digits": ""}."#;

#[derive(Clone)]
pub struct OpenAiDocumentClassifier {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiDocumentClassifier {
    pub fn new(client: Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }

    async fn chat_openai(&self, payload: JsonValue) -> Result<JsonValue, ClassifierError> {
        let res = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(Duration::ZERO)
                } else {
                    ClassifierError::Unavailable(e.to_string())
                }
            })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClassifierError::RateLimited);
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ClassifierError::Unavailable(format!(
                "OpenAI API Error {}: {}",
                status, text
            )));
        }

        let body: JsonValue = res
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .ok_or_else(|| ClassifierError::Malformed("Invalid OpenAI response format".to_string()))
    }
}

#[async_trait]
impl DocumentClassifier for OpenAiDocumentClassifier {
    async fn classify(&self, image: &[u8]) -> Result<DocumentReading, ClassifierError> {
        let mime = ImageKind::sniff(image)
            .map(|k| k.mime())
            .unwrap_or("image/jpeg");

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": [
                    {"type": "text", "text": "Classify this photo."},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:{};base64,{}", mime, BASE64.encode(image)),
                        "detail": "high"
                    }}
                ]}
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0
        });

        let response = self.chat_openai(payload).await?;
        parse_reading(&response)
    }
}

/// Accepts both snake_case and camelCase keys; digits are normalized.
pub fn parse_reading(value: &JsonValue) -> Result<DocumentReading, ClassifierError> {
    let is_document = value
        .get("is_document")
        .or_else(|| value.get("isDocument"))
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ClassifierError::Malformed("missing is_document".to_string()))?;

    let extracted_digits = match value
        .get("extracted_digits")
        .or_else(|| value.get("extractedDigits"))
    {
        Some(JsonValue::String(s)) => s.chars().filter(|c| c.is_ascii_digit()).collect(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    Ok(DocumentReading {
        is_document,
        extracted_digits,
    })
}

/// Ordered list of backends; the first one that answers wins.
#[derive(Clone)]
pub struct ClassifierChain {
    backends: Vec<(String, Arc<dyn DocumentClassifier>)>,
    call_timeout: Duration,
}

impl ClassifierChain {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            backends: Vec::new(),
            call_timeout,
        }
    }

    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn DocumentClassifier>) -> Self {
        self.backends.push((name.into(), backend));
        self
    }

    pub fn from_config(client: Client, api_key: &str, models: &[String], call_timeout: Duration) -> Self {
        models.iter().fold(Self::new(call_timeout), |chain, model| {
            let backend = OpenAiDocumentClassifier::new(client.clone(), api_key.to_string(), model.clone());
            chain.with_backend(model.clone(), Arc::new(backend))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Tries each backend under its own timeout. When all fail, reports
    /// `RateLimited` if any backend was rate limited.
    pub async fn classify(&self, image: &[u8]) -> Result<DocumentReading, ClassifierError> {
        let mut rate_limited = false;
        let mut last_error = ClassifierError::Unavailable("no classifier backend configured".to_string());

        for (name, backend) in &self.backends {
            let outcome = match tokio::time::timeout(self.call_timeout, backend.classify(image)).await {
                Ok(result) => result,
                Err(_) => Err(ClassifierError::Timeout(self.call_timeout)),
            };

            match outcome {
                Ok(reading) => {
                    tracing::debug!(backend = %name, is_document = reading.is_document, "classifier answered");
                    return Ok(reading);
                }
                Err(err) => {
                    tracing::warn!(backend = %name, error = %err, "classifier backend failed");
                    if matches!(err, ClassifierError::RateLimited) {
                        rate_limited = true;
                    }
                    last_error = err;
                }
            }
        }

        if rate_limited {
            Err(ClassifierError::RateLimited)
        } else {
            Err(last_error)
        }
    }
}
