use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use super::ports::{
    AiProvider, ChatOutcome, ChatRequest, ProviderError, TokenUsage, TranscriptionOutcome,
    TranscriptionRequest, VisionOutcome, VisionRequest,
};

/// Thin OpenAI-compatible client behind the `AiProvider` seam.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    chat_model: String,
    transcription_model: String,
    /// Ordered fallback list for vision calls.
    vision_models: Vec<String>,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        base_url: String,
        chat_model: String,
        transcription_model: String,
        vision_models: Vec<String>,
    ) -> Self {
        Self {
            api_key,
            base_url,
            chat_model,
            transcription_model,
            vision_models,
            http_client: reqwest::Client::new(),
        }
    }

    fn require_key(&self) -> Result<(), ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Misconfigured(
                "upstream API key is not set".to_string(),
            ));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn completion(
        &self,
        model: &str,
        messages: Vec<serde_json::Value>,
        tools: Option<&serde_json::Value>,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(tools) = tools {
            body["tools"] = tools.clone();
        }

        let url = self.url("chat/completions");
        tracing::debug!(model, url = %url, "Sending completion request");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            // Drop the upstream body; status plus model is enough to
            // diagnose and it keeps upstream detail out of our errors.
            return Err(ProviderError::Upstream {
                status: Some(status.as_u16()),
                message: format!("completion request for {} failed", model),
            });
        }

        response
            .json::<CompletionResponse>()
            .await
            .map_err(|e| ProviderError::Upstream {
                status: Some(status.as_u16()),
                message: format!("malformed completion response: {}", e),
            })
    }

    fn extract_outcome(response: CompletionResponse) -> Result<ChatOutcome, ProviderError> {
        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            ProviderError::Upstream {
                status: None,
                message: "completion response had no choices".to_string(),
            }
        })?;

        Ok(ChatOutcome {
            content: choice.message.content.unwrap_or_default(),
            stop_reason: choice.finish_reason,
            model: response.model,
            usage,
        })
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        self.require_key()?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role, "content": message.content}));
        }

        let response = self
            .completion(&self.chat_model, messages, request.tools.as_ref())
            .await?;
        Self::extract_outcome(response)
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionOutcome, ProviderError> {
        self.require_key()?;

        let file_part = reqwest::multipart::Part::bytes(request.audio.to_vec())
            .file_name(request.filename.clone());
        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.transcription_model.clone());
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }

        let url = self.url("audio/transcriptions");
        tracing::debug!(model = %self.transcription_model, url = %url, "Sending transcription request");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Upstream {
                status: Some(status.as_u16()),
                message: "transcription request failed".to_string(),
            });
        }

        let payload =
            response
                .json::<TranscriptionResponse>()
                .await
                .map_err(|e| ProviderError::Upstream {
                    status: Some(status.as_u16()),
                    message: format!("malformed transcription response: {}", e),
                })?;

        Ok(TranscriptionOutcome {
            text: payload.text,
            model: self.transcription_model.clone(),
        })
    }

    async fn analyze_image(
        &self,
        request: &VisionRequest,
    ) -> Result<VisionOutcome, ProviderError> {
        self.require_key()?;

        let prompt = request
            .custom_prompt
            .as_deref()
            .unwrap_or_else(|| request.template.prompt());
        let data_url = format!(
            "data:{};base64,{}",
            request.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&request.image)
        );
        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": data_url}},
            ],
        })];

        // Try each configured model in order; a transient failure on the
        // primary falls through to the next.
        for model in &self.vision_models {
            match self.completion(model, messages.clone(), None).await {
                Ok(response) => {
                    let outcome = Self::extract_outcome(response)?;
                    return Ok(VisionOutcome {
                        content: outcome.content,
                        model: outcome.model,
                        usage: outcome.usage,
                    });
                }
                Err(e) => {
                    tracing::warn!(model = %model, "Vision model attempt failed: {}", e);
                }
            }
        }

        Err(ProviderError::ExhaustedFallbacks {
            attempts: self.vision_models.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ports::{ChatMessage, VisionTemplate};
    use bytes::Bytes;

    fn provider(api_key: &str) -> OpenAiProvider {
        OpenAiProvider::new(
            api_key.to_string(),
            "https://api.openai.com/v1".to_string(),
            "gpt-4o-mini".to_string(),
            "whisper-1".to_string(),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
        )
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let err = provider("")
            .chat(&ChatRequest {
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
                system_prompt: None,
                tools: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn empty_fallback_list_exhausts_immediately() {
        let provider = OpenAiProvider::new(
            "key".to_string(),
            "https://api.openai.com/v1".to_string(),
            "gpt-4o-mini".to_string(),
            "whisper-1".to_string(),
            vec![],
        );
        let err = provider
            .analyze_image(&VisionRequest {
                image: Bytes::from_static(b"img"),
                mime_type: "image/png".to_string(),
                template: VisionTemplate::Note,
                custom_prompt: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ExhaustedFallbacks { attempts: 0 }));
    }

    #[test]
    fn completion_response_without_usage_decodes() {
        let response: CompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}],"model":"gpt-4o-mini"}"#,
        )
        .unwrap();
        let outcome = OpenAiProvider::extract_outcome(response).unwrap();
        assert_eq!(outcome.content, "hi");
        assert_eq!(outcome.usage.total(), 0);
    }

    #[test]
    fn trailing_slash_on_base_url_is_tolerated() {
        let mut p = provider("key");
        p.base_url = "https://api.openai.com/v1/".to_string();
        assert_eq!(
            p.url("chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
