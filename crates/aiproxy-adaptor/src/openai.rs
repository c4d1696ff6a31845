//! The default, OpenAI-compatible adaptor. Every other adaptor in this
//! crate composes over this one, overriding only what differs.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder};

use aiproxy_core::model::{RequestMeta, Usage};
use aiproxy_core::ProxyError;

use crate::streaming::{ApproxTokenizer, StreamProcessor, Tokenizer};
use crate::types::{ChatCompletionRequest, OpenAiUsage};
use crate::{Adaptor, ClientWriter};

pub struct OpenAiAdaptor {
    base_url: String,
    tokenizer: Box<dyn Tokenizer>,
}

impl OpenAiAdaptor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tokenizer: Box::new(ApproxTokenizer),
        }
    }

    pub fn with_tokenizer(base_url: impl Into<String>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            base_url: base_url.into(),
            tokenizer,
        }
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_url(&self, meta: &RequestMeta) -> String {
        format!("{}{}", self.base_url, meta.endpoint)
    }

    fn setup_headers(&self, meta: &RequestMeta, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", meta.kv.get("credential").cloned().unwrap_or_default()))
            .header("Content-Type", "application/json")
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        inbound: &serde_json::Value,
    ) -> Result<(Method, Bytes), ProxyError> {
        let mut request: ChatCompletionRequest = serde_json::from_value(inbound.clone())
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;
        request.model = meta.actual_model.clone();
        let body = serde_json::to_vec(&request)
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;
        Ok((Method::POST, Bytes::from(body)))
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        writer: &mut dyn ClientWriter,
        response: reqwest::Response,
    ) -> Result<Usage, ProxyError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), body));
        }

        let is_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            self.stream_response(meta, writer, response).await
        } else {
            self.buffered_response(meta, writer, response).await
        }
    }

    fn channel_name(&self) -> &'static str {
        "openai"
    }

    async fn model_list(&self, _channel_id: i64) -> Result<Vec<String>, ProxyError> {
        Ok(vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()])
    }
}

impl OpenAiAdaptor {
    async fn stream_response(
        &self,
        meta: &RequestMeta,
        writer: &mut dyn ClientWriter,
        mut response: reqwest::Response,
    ) -> Result<Usage, ProxyError> {
        let mut processor =
            StreamProcessor::new(meta.origin_model.clone(), meta.input_tokens, self.tokenizer.as_ref());
        loop {
            let next = response
                .chunk()
                .await
                .map_err(|err| ProxyError::UpstreamRetryable(err.to_string()))?;
            match next {
                Some(bytes) => processor.feed(&bytes, writer)?,
                None => break,
            }
        }
        Ok(processor.finish())
    }

    async fn buffered_response(
        &self,
        meta: &RequestMeta,
        writer: &mut dyn ClientWriter,
        response: reqwest::Response,
    ) -> Result<Usage, ProxyError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::UpstreamRetryable(err.to_string()))?;
        let mut value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;

        if let Some(model_field) = value.get_mut("model") {
            *model_field = serde_json::Value::String(meta.origin_model.clone());
        }

        let usage = value
            .get("usage")
            .cloned()
            .and_then(|v| serde_json::from_value::<OpenAiUsage>(v).ok())
            .map(aiproxy_core::model::Usage::from)
            .unwrap_or_default()
            .reconcile(meta.input_tokens);

        let usage = if usage.is_empty() {
            let text = value
                .get("choices")
                .and_then(|c| c.as_array())
                .map(|choices| {
                    choices
                        .iter()
                        .filter_map(|c| c.pointer("/message/content").and_then(|v| v.as_str()))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let completion_tokens = self.tokenizer.count_tokens(&meta.actual_model, &text);
            Usage {
                prompt_tokens: meta.input_tokens,
                completion_tokens,
                total_tokens: meta.input_tokens + completion_tokens,
                cached_tokens: 0,
                cache_creation_tokens: 0,
            }
        } else {
            usage
        };

        let rewritten = serde_json::to_vec(&value)
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;
        writer.write(Bytes::from(rewritten))?;
        Ok(usage)
    }
}

/// Maps an upstream HTTP status to the relay controller's classification
/// buckets.
pub fn classify_http_error(status: u16, body: String) -> ProxyError {
    match status {
        402 => ProxyError::UpstreamQuota,
        429 | 500..=599 => ProxyError::UpstreamRetryable(body),
        _ => ProxyError::UpstreamFatal { status, message: body },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_5xx_as_retryable() {
        assert_eq!(
            classify_http_error(503, "down".into()).classify(),
            aiproxy_core::error::Classification::UpstreamRetryable
        );
    }

    #[test]
    fn classifies_402_as_quota() {
        assert_eq!(
            classify_http_error(402, "no credit".into()).classify(),
            aiproxy_core::error::Classification::UpstreamQuota
        );
    }

    #[test]
    fn classifies_4xx_non_quota_as_fatal() {
        assert_eq!(
            classify_http_error(400, "bad request".into()).classify(),
            aiproxy_core::error::Classification::UpstreamFatal
        );
    }
}
