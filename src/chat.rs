// ai-writer-service/src/chat.rs

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Token accounting reported by the chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One raw model completion plus its metered usage.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Transport boundary to the LLM chat endpoint.
///
/// Implementations make exactly one attempt per call and never retry;
/// retry policy belongs to the pipeline so every attempt is re-charged
/// against the budget.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<RawCompletion, ChatError>;
}

// ============================================================
// Wire format
// ============================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

fn decode_completion(body: &str) -> Result<RawCompletion, ChatError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ChatError::Malformed(format!("undecodable body: {e}")))?;

    let usage = response
        .usage
        .ok_or_else(|| ChatError::Malformed("response missing usage".to_string()))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| ChatError::Malformed("response has no choices".to_string()))?;

    if content.trim().is_empty() {
        return Err(ChatError::Malformed("message content is empty".to_string()));
    }

    Ok(RawCompletion { content, usage })
}

// ============================================================
// HTTP client
// ============================================================

pub struct HttpChatClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpChatClient {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<RawCompletion, ChatError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout
                } else {
                    ChatError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 401 || status == 403 {
            return Err(ChatError::Unauthorized);
        }

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ChatError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ChatError::Timeout
            } else {
                ChatError::Network(e.to_string())
            }
        })?;

        if status >= 400 {
            return Err(ChatError::ServerError {
                status,
                message: body,
            });
        }

        decode_completion(&body)
    }
}

// ============================================================
// Fake client
// ============================================================

enum ScriptedReply {
    Completion(String, u64),
    Error(fn() -> ChatError),
}

/// Scripted chat client for tests: replies are consumed in order, so a
/// failure followed by a success exercises the retry path. Call counts
/// are observable.
#[derive(Default)]
pub struct FakeChatClient {
    script: std::sync::Mutex<std::collections::VecDeque<ScriptedReply>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl FakeChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completion with the given reported total token usage.
    pub fn push_completion(&self, content: &str, total_tokens: u64) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedReply::Completion(content.to_string(), total_tokens));
    }

    /// Queue a typed failure, built lazily since `ChatError` is not `Clone`.
    pub fn push_error(&self, make: fn() -> ChatError) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedReply::Error(make));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<RawCompletion, ChatError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(ScriptedReply::Completion(content, total_tokens)) => Ok(RawCompletion {
                content,
                usage: TokenUsage {
                    prompt_tokens: 0,
                    completion_tokens: total_tokens,
                    total_tokens,
                },
            }),
            Some(ScriptedReply::Error(make)) => Err(make()),
            None => Err(ChatError::Network(
                "FakeChatClient: script exhausted".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_well_formed_completion() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 80, "total_tokens": 200}
        }"#;
        let completion = decode_completion(body).unwrap();
        assert_eq!(completion.content, r#"{"ok":true}"#);
        assert_eq!(completion.usage.total_tokens, 200);
    }

    #[test]
    fn test_decode_no_choices_is_malformed() {
        let body = r#"{"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 0, "total_tokens": 1}}"#;
        assert!(matches!(
            decode_completion(body),
            Err(ChatError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_usage_is_malformed() {
        let body = r#"{"choices": [{"message": {"content": "hi"}}]}"#;
        assert!(matches!(
            decode_completion(body),
            Err(ChatError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_empty_content_is_malformed() {
        let body = r#"{
            "choices": [{"message": {"content": "   "}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 0, "total_tokens": 1}
        }"#;
        assert!(matches!(
            decode_completion(body),
            Err(ChatError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_fake_client_replays_script_in_order() {
        let fake = FakeChatClient::new();
        fake.push_error(|| ChatError::Timeout);
        fake.push_completion("{}", 42);

        let first = fake.complete("s", "u", 100, 0.7).await;
        assert!(matches!(first, Err(ChatError::Timeout)));

        let second = fake.complete("s", "u", 100, 0.7).await.unwrap();
        assert_eq!(second.usage.total_tokens, 42);
        assert_eq!(fake.calls(), 2);
    }
}
