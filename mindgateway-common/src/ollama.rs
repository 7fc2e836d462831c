//! Ollama dialect: wire types, an HTTP client, and conversions to the
//! OpenAI-compatible types used on the gateway surface.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionRequest,
    CompletionResponse, EmbeddingRequest as OpenAiEmbeddingRequest,
    EmbeddingResponse as OpenAiEmbeddingResponse, TextInput, Usage,
};

#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Ollama error: HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unsupported request: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub context: Option<Vec<i64>>,
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub message: Message,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// Sampling options shared by chat and generate requests.
fn sampling_options(
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    stop: Option<&Vec<String>>,
) -> Option<HashMap<String, serde_json::Value>> {
    let mut options = HashMap::new();
    if let Some(t) = temperature {
        options.insert("temperature".to_string(), serde_json::json!(t));
    }
    if let Some(p) = top_p {
        options.insert("top_p".to_string(), serde_json::json!(p));
    }
    if let Some(n) = max_tokens {
        options.insert("num_predict".to_string(), serde_json::json!(n));
    }
    if let Some(stop) = stop {
        options.insert("stop".to_string(), serde_json::json!(stop));
    }
    if options.is_empty() {
        None
    } else {
        Some(options)
    }
}

fn finish_reason(done: bool) -> Option<String> {
    done.then(|| "stop".to_string())
}

impl From<&ChatCompletionRequest> for ChatRequest {
    fn from(request: &ChatCompletionRequest) -> Self {
        Self {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| Message {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
            options: sampling_options(
                request.temperature,
                request.top_p,
                request.max_tokens,
                request.stop.as_ref(),
            ),
        }
    }
}

impl TryFrom<&CompletionRequest> for GenerateRequest {
    type Error = OllamaError;

    /// Ollama's generate endpoint takes a single prompt.
    fn try_from(request: &CompletionRequest) -> Result<Self, Self::Error> {
        let prompt = match &request.prompt {
            TextInput::Single(p) => p.clone(),
            TextInput::Batch(items) if items.len() == 1 => items[0].clone(),
            TextInput::Batch(items) => {
                return Err(OllamaError::Unsupported(format!(
                    "generate accepts one prompt, got {}",
                    items.len()
                )))
            }
        };
        Ok(Self {
            model: request.model.clone(),
            prompt,
            system: None,
            template: None,
            context: None,
            options: sampling_options(
                request.temperature,
                request.top_p,
                request.max_tokens,
                request.stop.as_ref(),
            ),
            format: None,
            stream: false,
            raw: false,
        })
    }
}

impl ChatResponse {
    pub fn into_openai(self) -> ChatCompletionResponse {
        let message = ChatMessage::new(self.message.role, self.message.content);
        let mut response = ChatCompletionResponse::new(self.model, message, finish_reason(self.done));
        if let (Some(prompt), Some(completion)) = (self.prompt_eval_count, self.eval_count) {
            response = response.with_usage(prompt, completion);
        }
        response
    }
}

impl GenerateResponse {
    pub fn into_openai(self) -> CompletionResponse {
        let mut response = CompletionResponse::new(self.model, self.response, finish_reason(self.done));
        if let (Some(prompt), Some(completion)) = (self.prompt_eval_count, self.eval_count) {
            response.usage = Some(Usage::new(prompt, completion));
        }
        response
    }
}

/// Client for communicating with an Ollama server.
#[derive(Clone)]
pub struct OllamaClient {
    http_client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OllamaError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OllamaError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, OllamaError> {
        self.post_json("/api/generate", request).await
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, OllamaError> {
        self.post_json("/api/chat", request).await
    }

    pub async fn embeddings(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, OllamaError> {
        self.post_json("/api/embeddings", request).await
    }

    pub async fn list_models(&self) -> Result<ListModelsResponse, OllamaError> {
        let url = format!("{}/api/tags", self.base_url);
        tracing::debug!("Listing Ollama models: {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| OllamaError::RequestFailed(e.to_string()))?;
        Self::decode(response).await
    }

    /// Send an OpenAI chat request and translate the response back.
    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, OllamaError> {
        let response = self.chat(&ChatRequest::from(request)).await?;
        Ok(response.into_openai())
    }

    pub async fn completion(&self, request: &CompletionRequest) -> Result<CompletionResponse, OllamaError> {
        let response = self.generate(&GenerateRequest::try_from(request)?).await?;
        Ok(response.into_openai())
    }

    /// Ollama embeds one prompt per call, so batches fan out sequentially.
    pub async fn embedding(
        &self,
        request: &OpenAiEmbeddingRequest,
    ) -> Result<OpenAiEmbeddingResponse, OllamaError> {
        let mut vectors = Vec::with_capacity(request.input.len());
        for prompt in request.input.iter() {
            let response = self
                .embeddings(&EmbeddingRequest {
                    model: request.model.clone(),
                    prompt: prompt.to_string(),
                })
                .await?;
            vectors.push(response.embedding);
        }
        Ok(OpenAiEmbeddingResponse::new(request.model.clone(), vectors))
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, OllamaError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("Sending request to Ollama: {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OllamaError::RequestFailed(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp, OllamaError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OllamaError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))
    }
}
