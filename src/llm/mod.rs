//! The LLM seam: a black-box `analyze(prompt) -> text` capability.
//!
//! Vendor clients live outside this crate; the orchestrator only sees
//! [`LlmClient`]. The bundled implementations cover testing and offline
//! replay: [`FnClient`] wraps a closure, [`ScriptedClient`] pops queued
//! responses in call order.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// Errors crossing the LLM seam.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// Provider-side failure (network, rate limit after client backoff,
    /// refusal).
    #[error("provider error: {message}")]
    #[diagnostic(code(sqlbeam::llm::provider))]
    Provider { message: String },

    /// The response was empty or unusable before parsing even started.
    #[error("empty response from model")]
    #[diagnostic(code(sqlbeam::llm::empty_response))]
    EmptyResponse,
}

/// Black-box model invocation. Implementations must be thread-safe; the
/// worker pool calls `analyze` concurrently. Rate-limit backoff is the
/// client's own concern.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Closure-backed client; the workhorse for tests and custom routing.
pub struct FnClient<F>
where
    F: Fn(&str) -> Result<String, LlmError> + Send + Sync,
{
    f: F,
}

impl<F> FnClient<F>
where
    F: Fn(&str) -> Result<String, LlmError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> LlmClient for FnClient<F>
where
    F: Fn(&str) -> Result<String, LlmError> + Send + Sync,
{
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError> {
        (self.f)(prompt)
    }
}

/// Replays canned responses in call order; used to re-drive sessions from
/// archived transcripts without spending tokens.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedClient {
    pub fn new(responses: impl IntoIterator<Item = String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn analyze(&self, _prompt: &str) -> Result<String, LlmError> {
        let popped = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        popped.ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_pops_in_order() {
        let client = ScriptedClient::new(["one".to_string(), "two".to_string()]);
        assert_eq!(client.analyze("x").await.unwrap(), "one");
        assert_eq!(client.analyze("y").await.unwrap(), "two");
        assert!(matches!(
            client.analyze("z").await,
            Err(LlmError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn fn_client_sees_the_prompt() {
        let client = FnClient::new(|prompt: &str| Ok(format!("echo: {prompt}")));
        assert_eq!(client.analyze("hi").await.unwrap(), "echo: hi");
    }
}
