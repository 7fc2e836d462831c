//! In-process doubles for workers, health probes and the Auth Service.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mindgateway_common::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionResponse,
    EmbeddingResponse, WorkerRegistration,
};

use crate::auth::{AuthError, AuthService, AuthUser, Verdict};
use crate::gateway::{HealthProbe, InferenceOutput, InferencePayload, Worker, WorkerCallError, WorkerClient};

pub fn registration(id: &str, models: &[&str], load: f64) -> WorkerRegistration {
    WorkerRegistration {
        id: id.to_string(),
        name: String::new(),
        endpoint: format!("http://{}.internal:8000", id),
        models: models.iter().map(|m| m.to_string()).collect(),
        load,
    }
}

pub fn chat_payload(model: &str) -> InferencePayload {
    InferencePayload::Chat(ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::new("user", "Hello")],
        temperature: None,
        top_p: None,
        n: None,
        stream: None,
        stop: None,
        max_tokens: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
    })
}

/// A canned successful answer for any payload kind.
pub fn canned_output(payload: &InferencePayload, worker_id: &str) -> InferenceOutput {
    let model = payload.model().to_string();
    match payload {
        InferencePayload::Chat(_) => InferenceOutput::Chat(
            ChatCompletionResponse::new(
                model,
                ChatMessage::new("assistant", format!("Hello from {}", worker_id)),
                Some("stop".to_string()),
            )
            .with_usage(3, 4),
        ),
        InferencePayload::Completion(_) => InferenceOutput::Completion(CompletionResponse::new(
            model,
            format!("Hello from {}", worker_id),
            Some("stop".to_string()),
        )),
        InferencePayload::Embedding(r) => {
            let vectors = r.input.iter().map(|_| vec![0.1, 0.2, 0.3]).collect();
            InferenceOutput::Embedding(EmbeddingResponse::new(model, vectors))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WorkerBehavior {
    Succeed,
    /// Fail with a connect error this many times, then succeed.
    FailTimes(u32),
    /// Answer with this HTTP status.
    Reject(u16),
    /// Never answer.
    Hang,
}

/// Worker client that records which workers it was asked to call.
pub struct MockWorkerClient {
    behavior: WorkerBehavior,
    failures: AtomicU32,
    calls: Mutex<Vec<String>>,
}

impl MockWorkerClient {
    pub fn new(behavior: WorkerBehavior) -> Self {
        Self {
            behavior,
            failures: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn call(&self, worker: &Worker, payload: &InferencePayload) -> Result<InferenceOutput, WorkerCallError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(worker.id.clone());
        }

        match self.behavior {
            WorkerBehavior::Succeed => Ok(canned_output(payload, &worker.id)),
            WorkerBehavior::FailTimes(n) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < n {
                    Err(WorkerCallError::Connect("connection refused".to_string()))
                } else {
                    Ok(canned_output(payload, &worker.id))
                }
            }
            WorkerBehavior::Reject(status) => Err(WorkerCallError::Status {
                status,
                body: "rejected".to_string(),
            }),
            WorkerBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Health probe that fails a fixed set of worker ids.
pub struct StaticProbe {
    failing: HashSet<String>,
}

impl StaticProbe {
    pub fn new(failing: &[&str]) -> Self {
        Self {
            failing: failing.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, worker: &Worker) -> bool {
        !self.failing.contains(&worker.id)
    }
}

/// Auth Service double keyed by raw token.
#[derive(Default)]
pub struct MockAuthService {
    users: HashMap<String, (AuthUser, Vec<String>)>,
    revoked: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    validate_calls: AtomicU32,
}

impl MockAuthService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: &str, user_id: &str, roles: &[&str]) -> Self {
        let user = AuthUser {
            user_id: user_id.to_string(),
            email: Some(format!("{}@example.com", user_id)),
        };
        let roles = roles.iter().map(|r| r.to_string()).collect();
        self.users.insert(token.to_string(), (user, roles));
        self
    }

    /// Make a previously valid token validate as `Invalid`.
    pub fn revoke(&self, token: &str) {
        self.revoked.lock().unwrap().insert(token.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn validate_calls(&self) -> u32 {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), AuthError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AuthError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuthService for MockAuthService {
    async fn validate_token(&self, token: &str) -> Result<Verdict, AuthError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.revoked.lock().unwrap().contains(token) {
            return Ok(Verdict::Invalid("token revoked".to_string()));
        }
        Ok(match self.users.get(token) {
            Some((user, _)) => Verdict::Valid(user.clone()),
            None => Verdict::Invalid("unknown token".to_string()),
        })
    }

    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, AuthError> {
        self.check_available()?;
        Ok(self
            .users
            .values()
            .find(|(user, _)| user.user_id == user_id)
            .map(|(_, roles)| roles.clone())
            .unwrap_or_default())
    }
}
