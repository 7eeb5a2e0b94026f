use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::functions::FunctionDefinition;
use crate::state::ChatMessage;

pub const DEFAULT_ENDPOINT: &str = "https://api.x.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "grok-beta";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Grok, a chatbot inspired by the Hitchhikers Guide to the Galaxy. You can execute JavaScript code when needed.";

/// Sampling temperature sent with every request.
pub const TEMPERATURE: f32 = 0.0;

/// Body of a streaming chat completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub functions: Vec<FunctionDefinition>,
}

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send the request and return the response body as a byte stream.
    pub async fn stream(&self, api_key: &str, request: &ChatRequest) -> Result<ByteStream, ClientError> {
        debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            messages = request.messages.len(),
            "sending chat request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat request rejected");
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ClientError::from))
            .boxed())
    }
}
