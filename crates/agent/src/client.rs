use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;

use crate::chat::ChatMessage;
use crate::collab::ensure_success;
use crate::error::{AgentResult, BuildHttpClientSnafu, ReadChunkSnafu, SendRequestSnafu};
use crate::settings::Settings;

pub const CHAT_STREAM_PATH: &str = "/api/chat/stream";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Raw response body, chunked as it arrives.
pub type ByteStream = Pin<Box<dyn Stream<Item = AgentResult<Bytes>> + Send>>;

/// Body of one streaming chat request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Serialized as `null` when absent.
    pub context: Option<Value>,
}

/// Opens the response stream for a chat request.
///
/// `Ok(None)` means the backend accepted the request but sent no body.
pub trait ChatTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        request: ChatRequest,
    ) -> BoxFuture<'a, AgentResult<Option<ByteStream>>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    stream_url: String,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> AgentResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = settings.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context(BuildHttpClientSnafu {
            stage: "build-chat-client",
        })?;

        Ok(Self {
            client,
            stream_url: settings.endpoint(CHAT_STREAM_PATH),
        })
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    async fn post_stream(&self, request: ChatRequest) -> AgentResult<Option<ByteStream>> {
        tracing::debug!(
            url = %self.stream_url,
            message_count = request.messages.len(),
            has_context = request.context.is_some(),
            "opening chat stream"
        );

        let response = self
            .client
            .post(&self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .json(&request)
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "send-chat-request",
                url: self.stream_url.clone(),
            })?;
        let response = ensure_success(response, &self.stream_url, "chat-response-status").await?;

        if response.status() == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Ok(None);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.context(ReadChunkSnafu { stage: "read-chat-chunk" }));
        Ok(Some(Box::pin(body)))
    }
}

impl ChatTransport for HttpTransport {
    fn open_stream<'a>(
        &'a self,
        request: ChatRequest,
    ) -> BoxFuture<'a, AgentResult<Option<ByteStream>>> {
        Box::pin(self.post_stream(request))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_serializes_null_context() {
        let request = ChatRequest {
            messages: vec![ChatMessage::user("show stations")],
            context: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "messages": [{"role": "user", "content": "show stations"}],
                "context": null
            })
        );
    }

    #[test]
    fn stream_url_joins_api_base() {
        let settings = Settings {
            api_base: "http://10.1.1.1:8000/".to_string(),
            ..Settings::default()
        }
        .normalized();
        let transport = HttpTransport::new(&settings).unwrap();
        assert_eq!(
            transport.stream_url(),
            "http://10.1.1.1:8000/api/chat/stream"
        );
    }
}
