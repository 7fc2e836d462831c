//! Inference payloads carried through the queue, and the results workers return.

use serde::Serialize;

use mindgateway_common::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, Usage,
};

use crate::error::GatewayError;

/// The kind of inference call, used for worker paths and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceKind {
    Chat,
    Completion,
    Embedding,
}

impl InferenceKind {
    /// Path of the OpenAI-compatible endpoint, on the gateway and on workers.
    pub fn path(&self) -> &'static str {
        match self {
            InferenceKind::Chat => "/v1/chat/completions",
            InferenceKind::Completion => "/v1/completions",
            InferenceKind::Embedding => "/v1/embeddings",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InferencePayload {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Embedding(EmbeddingRequest),
}

fn check_range(name: &str, value: Option<f32>, min: f32, max: f32) -> Result<(), GatewayError> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(GatewayError::InvalidInput(format!(
            "{} must be between {} and {}",
            name, min, max
        ))),
        _ => Ok(()),
    }
}

fn check_sampling(
    stream: Option<bool>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
) -> Result<(), GatewayError> {
    if stream == Some(true) {
        return Err(GatewayError::InvalidInput("streaming responses are not supported".to_string()));
    }
    check_range("temperature", temperature, 0.0, 2.0)?;
    check_range("top_p", top_p, 0.0, 1.0)?;
    if max_tokens == Some(0) {
        return Err(GatewayError::InvalidInput("max_tokens must be positive".to_string()));
    }
    Ok(())
}

impl InferencePayload {
    pub fn kind(&self) -> InferenceKind {
        match self {
            InferencePayload::Chat(_) => InferenceKind::Chat,
            InferencePayload::Completion(_) => InferenceKind::Completion,
            InferencePayload::Embedding(_) => InferenceKind::Embedding,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            InferencePayload::Chat(r) => &r.model,
            InferencePayload::Completion(r) => &r.model,
            InferencePayload::Embedding(r) => &r.model,
        }
    }

    /// Reject payloads no worker could serve.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model().trim().is_empty() {
            return Err(GatewayError::InvalidInput("model is required".to_string()));
        }

        match self {
            InferencePayload::Chat(r) => {
                if r.messages.is_empty() {
                    return Err(GatewayError::InvalidInput("messages must not be empty".to_string()));
                }
                if r.messages.iter().any(|m| m.role.trim().is_empty()) {
                    return Err(GatewayError::InvalidInput("every message needs a role".to_string()));
                }
                check_sampling(r.stream, r.temperature, r.top_p, r.max_tokens)
            }
            InferencePayload::Completion(r) => {
                if r.prompt.is_blank() {
                    return Err(GatewayError::InvalidInput("prompt must not be empty".to_string()));
                }
                check_sampling(r.stream, r.temperature, r.top_p, r.max_tokens)
            }
            InferencePayload::Embedding(r) => {
                if r.input.is_blank() {
                    return Err(GatewayError::InvalidInput("input must not be empty".to_string()));
                }
                Ok(())
            }
        }
    }
}

/// A worker's typed response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InferenceOutput {
    Chat(ChatCompletionResponse),
    Completion(CompletionResponse),
    Embedding(EmbeddingResponse),
}

impl InferenceOutput {
    pub fn usage(&self) -> Option<Usage> {
        match self {
            InferenceOutput::Chat(r) => r.usage,
            InferenceOutput::Completion(r) => r.usage,
            InferenceOutput::Embedding(r) => r.usage,
        }
    }
}

/// Successful result of a dispatched request.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub output: InferenceOutput,
    pub worker_id: String,
    /// Routing and worker-call attempts consumed, including the successful one.
    pub attempts: u32,
}
