//! OpenAI-compatible chat, completion and embedding types.

use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Missing models deserialize as empty so admission can reject them with a 400.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Whether to stream the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// Token accounting reported by workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl ChatCompletionResponse {
    pub fn new(model: String, message: ChatMessage, finish_reason: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: now,
            model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        self
    }
}

/// A prompt or embedding input: either one string or a batch of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    Single(String),
    Batch(Vec<String>),
}

impl TextInput {
    /// True when there is no non-empty text to process.
    pub fn is_blank(&self) -> bool {
        match self {
            TextInput::Single(s) => s.trim().is_empty(),
            TextInput::Batch(items) => items.iter().all(|s| s.trim().is_empty()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TextInput::Single(_) => 1,
            TextInput::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the individual inputs.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: Vec<&str> = match self {
            TextInput::Single(s) => vec![s.as_str()],
            TextInput::Batch(items) => items.iter().map(String::as_str).collect(),
        };
        items.into_iter()
    }
}

impl Default for TextInput {
    fn default() -> Self {
        TextInput::Batch(Vec::new())
    }
}

/// OpenAI-compatible (legacy) text completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: TextInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn new(model: String, text: String, finish_reason: Option<String>) -> Self {
        Self {
            id: format!("cmpl-{}", uuid::Uuid::new_v4()),
            object: "text_completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![CompletionChoice {
                text,
                index: 0,
                finish_reason,
            }],
            usage: None,
        }
    }
}

/// OpenAI-compatible embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: TextInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: u32,
}

impl EmbeddingResponse {
    pub fn new(model: String, vectors: Vec<Vec<f32>>) -> Self {
        Self {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(i, embedding)| Embedding {
                    object: "embedding".to_string(),
                    embedding,
                    index: i as u32,
                })
                .collect(),
            model,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let json = r#"{"model": "llama2", "messages": [{"role": "user", "content": "Hello"}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "llama2");
        assert_eq!(req.messages.len(), 1);
        assert!(req.temperature.is_none());
        assert!(req.stream.is_none());
    }

    #[test]
    fn test_chat_request_missing_model_is_empty() {
        let json = r#"{"messages": []}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert!(req.model.is_empty());
        assert!(req.messages.is_empty());
    }

    #[test]
    fn test_chat_request_skips_unset_options() {
        let req = ChatCompletionRequest {
            model: "llama2".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            temperature: Some(0.2),
            top_p: None,
            n: None,
            stream: None,
            stop: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""temperature":0.2"#));
        assert!(!json.contains("top_p"));
        assert!(!json.contains("stream"));
    }

    #[test]
    fn test_chat_response_with_usage() {
        let response = ChatCompletionResponse::new(
            "test-model".to_string(),
            ChatMessage::new("assistant", "Hello!"),
            Some("stop".to_string()),
        )
        .with_usage(10, 5);

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_text_input_accepts_string_or_array() {
        let single: CompletionRequest =
            serde_json::from_str(r#"{"model": "m", "prompt": "Once upon"}"#).unwrap();
        assert_eq!(single.prompt, TextInput::Single("Once upon".to_string()));

        let batch: EmbeddingRequest =
            serde_json::from_str(r#"{"model": "m", "input": ["a", "b"]}"#).unwrap();
        assert_eq!(batch.input.len(), 2);
        assert_eq!(batch.input.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_text_input_blank() {
        assert!(TextInput::Single("   ".to_string()).is_blank());
        assert!(TextInput::Batch(vec![]).is_blank());
        assert!(TextInput::Batch(vec!["".to_string(), " ".to_string()]).is_blank());
        assert!(!TextInput::Batch(vec!["".to_string(), "x".to_string()]).is_blank());
    }

    #[test]
    fn test_embedding_response_indexes_vectors() {
        let response = EmbeddingResponse::new("embed".to_string(), vec![vec![0.1], vec![0.2, 0.3]]);
        assert_eq!(response.object, "list");
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[1].index, 1);
        assert_eq!(response.data[1].object, "embedding");
    }

    #[test]
    fn test_usage_missing_completion_tokens() {
        let usage: Usage = serde_json::from_str(r#"{"prompt_tokens": 7, "total_tokens": 7}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 0);
    }
}
