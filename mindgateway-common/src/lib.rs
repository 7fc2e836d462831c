//! MindGateway Common Types
//!
//! Wire types shared by the gateway and the worker processes behind it.

pub mod ollama;
pub mod openai;
pub mod registry;

pub use openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, CompletionChoice,
    CompletionRequest, CompletionResponse, Embedding, EmbeddingRequest, EmbeddingResponse,
    TextInput, Usage,
};
pub use registry::{Heartbeat, RegistrationAck, WorkerRegistration, WorkerStatus, WorkerStatusView};
