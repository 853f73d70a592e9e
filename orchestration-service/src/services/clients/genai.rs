//! Gemini text generation client.

use super::{
    ensure_success, http_client, require_key, ClientError, GenerationParams, GenerationResponse,
    GenerativeAiClient,
};
use crate::config::GenAiSettings;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    safety_threshold: String,
}

impl GeminiClient {
    pub fn new(settings: &GenAiSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            base_url: settings.service.base_url.trim_end_matches('/').to_string(),
            api_key: require_key(&settings.service, "generative AI")?,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            safety_threshold: settings.safety_threshold.clone(),
        })
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: params.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part { text: text.clone() }],
            }),
            generation_config: GenerationConfig {
                temperature: params.temperature.unwrap_or(self.temperature),
                max_output_tokens: params.max_tokens.unwrap_or(self.max_tokens),
            },
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: category.to_string(),
                    threshold: self.safety_threshold.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl GenerativeAiClient for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationResponse, ClientError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = self.build_request(prompt, params);

        tracing::debug!(
            model = %self.model,
            prompt_len = prompt.len(),
            "Sending request to Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let body: GenerateContentResponse = ensure_success(response).await?.json().await?;
        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::InvalidResponse("no candidates returned".to_string()))?;

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ClientError::InvalidResponse(
                "response blocked by safety filter".to_string(),
            ));
        }

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = body.usage_metadata.unwrap_or_default();

        Ok(GenerationResponse {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            model: self.model.clone(),
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        let url = format!("{}/models/{}", self.base_url, self.model);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: String,
    threshold: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
